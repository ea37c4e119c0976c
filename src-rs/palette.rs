use crate::geometry::DetectionBox;
use image::Rgba;
use std::collections::BTreeMap;

/// Color used for any class label not in the table.
pub const FALLBACK_COLOR: Rgba<u8> = Rgba([239, 68, 68, 255]);

const CLASS_COLORS: &[(&str, [u8; 4])] = &[
    ("Brown_Spot", [245, 158, 11, 255]),
    ("Bacterial_Blight", [34, 197, 94, 255]),
    ("Leaf_Blight", [59, 130, 246, 255]),
    ("Sheath_Blight", [234, 179, 8, 255]),
    ("Tungro", [168, 85, 247, 255]),
];

/// Fixed class→color lookup with optional per-label overrides.
#[derive(Debug, Clone)]
pub struct Palette {
    colors: BTreeMap<String, Rgba<u8>>,
    fallback: Rgba<u8>,
}

impl Default for Palette {
    fn default() -> Self {
        let colors = CLASS_COLORS
            .iter()
            .map(|(label, rgba)| ((*label).to_string(), Rgba(*rgba)))
            .collect();
        Self {
            colors,
            fallback: FALLBACK_COLOR,
        }
    }
}

impl Palette {
    /// Default table plus overrides given as `label -> "#RRGGBB"` strings.
    /// Unparseable colors are skipped with a warning.
    pub fn with_overrides<'a, I>(overrides: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut palette = Self::default();
        for (label, raw) in overrides {
            match parse_color(raw) {
                Some(color) => {
                    palette.colors.insert(label.clone(), color);
                }
                None => log::warn!("ignoring palette override for {label}: bad color {raw:?}"),
            }
        }
        palette
    }

    pub fn color_for(&self, class_label: &str) -> Rgba<u8> {
        self.colors.get(class_label).copied().unwrap_or(self.fallback)
    }

    pub fn is_known(&self, class_label: &str) -> bool {
        self.colors.contains_key(class_label)
    }
}

/// `"Brown_Spot (87%)"`
pub fn label_text(det: &DetectionBox) -> String {
    let pct = (det.confidence.clamp(0.0, 1.0) * 100.0).round() as u32;
    format!("{} ({pct}%)", det.class_label)
}

/// Parse `#RRGGBB`, `#RRGGBBAA` or `rgba(r, g, b, a)`.
pub fn parse_color(raw: &str) -> Option<Rgba<u8>> {
    let s = raw.trim();
    if let Some(hex) = s.strip_prefix('#') {
        let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
        return match hex.len() {
            6 => Some(Rgba([channel(0)?, channel(2)?, channel(4)?, 255])),
            8 => Some(Rgba([channel(0)?, channel(2)?, channel(4)?, channel(6)?])),
            _ => None,
        };
    }

    let lower = s.to_ascii_lowercase();
    let body = lower.strip_prefix("rgba(")?.strip_suffix(')')?;
    let parts: Vec<&str> = body.split(',').map(str::trim).collect();
    if parts.len() != 4 {
        return None;
    }
    let byte = |v: &str| -> Option<u8> { Some(v.parse::<f64>().ok()?.round().clamp(0.0, 255.0) as u8) };
    let alpha_value = parts[3].parse::<f64>().ok()?;
    let a = if alpha_value <= 1.0 {
        (alpha_value * 255.0).round().clamp(0.0, 255.0) as u8
    } else {
        alpha_value.round().clamp(0.0, 255.0) as u8
    };
    Some(Rgba([byte(parts[0])?, byte(parts[1])?, byte(parts[2])?, a]))
}

pub fn color_luma(color: Rgba<u8>) -> f64 {
    let [r, g, b, _] = color.0;
    (0.2126 * f64::from(r) + 0.7152 * f64::from(g) + 0.0722 * f64::from(b)) / 255.0
}

/// Dark outline for light colors and vice versa.
pub fn contrast_color(color: Rgba<u8>) -> Rgba<u8> {
    if color_luma(color) > 0.6 {
        Rgba([0, 0, 0, 220])
    } else {
        Rgba([255, 255, 255, 220])
    }
}
