//! Natural-to-rendered coordinate mapping for detection boxes.
//!
//! Detections arrive in the pixel space of the decoded source image. The
//! image is usually displayed at some other size, so every box is scaled per
//! axis before it is drawn. A [`ScaleFactor`] can only be built from a
//! measurable [`ImageGeometry`], so no mapping ever divides by zero.

use crate::error::GeometryError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One detection in natural-image pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireDetection")]
pub struct DetectionBox {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub class_label: String,
    pub confidence: f64,
}

impl DetectionBox {
    pub fn new(
        left: f64,
        top: f64,
        right: f64,
        bottom: f64,
        class_label: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
            class_label: class_label.into(),
            confidence,
        }
    }

    /// True when the box has inverted coordinates on either axis.
    pub fn is_malformed(&self) -> bool {
        self.right < self.left || self.bottom < self.top
    }
}

/// Accepts both the detection backend's `box` array form and the flat field
/// form this crate serializes.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireDetection {
    Backend {
        #[serde(rename = "box")]
        bbox: [f64; 4],
        class_name: String,
        #[serde(default)]
        confidence: f64,
    },
    Flat {
        left: f64,
        top: f64,
        right: f64,
        bottom: f64,
        #[serde(alias = "class_name")]
        class_label: String,
        #[serde(default)]
        confidence: f64,
    },
}

impl From<WireDetection> for DetectionBox {
    fn from(wire: WireDetection) -> Self {
        match wire {
            WireDetection::Backend {
                bbox,
                class_name,
                confidence,
            } => DetectionBox::new(bbox[0], bbox[1], bbox[2], bbox[3], class_name, confidence),
            WireDetection::Flat {
                left,
                top,
                right,
                bottom,
                class_label,
                confidence,
            } => DetectionBox::new(left, top, right, bottom, class_label, confidence),
        }
    }
}

/// Parse detections from either a bare JSON array or the backend's
/// `{"yolo_detections": [...]}` response envelope.
pub fn parse_detections(raw: &str) -> Result<Vec<DetectionBox>, serde_json::Error> {
    let value: Value = serde_json::from_str(raw)?;
    let list = match value {
        Value::Object(mut obj) => obj
            .remove("yolo_detections")
            .or_else(|| obj.remove("detections"))
            .unwrap_or_else(|| Value::Array(Vec::new())),
        other => other,
    };
    serde_json::from_value(list)
}

/// Natural and rendered dimensions of one displayed image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageGeometry {
    pub rendered_width: f64,
    pub rendered_height: f64,
    pub natural_width: f64,
    pub natural_height: f64,
}

impl ImageGeometry {
    pub fn new(natural_width: f64, natural_height: f64, rendered_width: f64, rendered_height: f64) -> Self {
        Self {
            rendered_width,
            rendered_height,
            natural_width,
            natural_height,
        }
    }

    /// Whether a scale factor can be derived from these dimensions.
    pub fn is_measurable(&self) -> bool {
        let dims = [
            self.natural_width,
            self.natural_height,
            self.rendered_width,
            self.rendered_height,
        ];
        dims.iter().all(|v| v.is_finite() && *v >= 0.0)
            && self.natural_width > 0.0
            && self.natural_height > 0.0
    }

    pub fn scale(&self) -> Result<ScaleFactor, GeometryError> {
        ScaleFactor::from_geometry(self)
    }
}

/// Per-axis rendered/natural ratio. Both axes are non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScaleFactor {
    pub x: f64,
    pub y: f64,
}

impl ScaleFactor {
    pub fn from_geometry(geometry: &ImageGeometry) -> Result<Self, GeometryError> {
        if !geometry.is_measurable() {
            return Err(GeometryError::Unavailable {
                natural_width: geometry.natural_width,
                natural_height: geometry.natural_height,
            });
        }
        Ok(Self {
            x: geometry.rendered_width / geometry.natural_width,
            y: geometry.rendered_height / geometry.natural_height,
        })
    }

    /// Map a natural-space box into rendered space. Inverted boxes collapse
    /// to zero width/height at their `left`/`top` corner.
    pub fn map(&self, det: &DetectionBox) -> RenderedBox {
        RenderedBox {
            left: det.left * self.x,
            top: det.top * self.y,
            width: (det.right - det.left).max(0.0) * self.x,
            height: (det.bottom - det.top).max(0.0) * self.y,
        }
    }
}

/// A box in rendered-pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RenderedBox {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl RenderedBox {
    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

pub fn map_box(det: &DetectionBox, geometry: &ImageGeometry) -> Result<RenderedBox, GeometryError> {
    Ok(ScaleFactor::from_geometry(geometry)?.map(det))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_box_into_half_size_render() {
        let det = DetectionBox::new(10.0, 20.0, 110.0, 220.0, "Brown_Spot", 0.9);
        let geometry = ImageGeometry::new(400.0, 800.0, 200.0, 400.0);
        let rendered = map_box(&det, &geometry).unwrap();
        assert_eq!(
            rendered,
            RenderedBox {
                left: 5.0,
                top: 10.0,
                width: 50.0,
                height: 100.0
            }
        );
    }

    #[test]
    fn axes_scale_independently() {
        let cases = [
            (640.0, 480.0, 320.0, 480.0),
            (100.0, 100.0, 250.0, 40.0),
            (3.0, 7.0, 1.0, 1.0),
            (1920.0, 1080.0, 0.0, 0.0),
        ];
        let det = DetectionBox::new(12.0, 34.0, 56.0, 78.0, "Tungro", 0.5);
        for (nw, nh, rw, rh) in cases {
            let rendered = map_box(&det, &ImageGeometry::new(nw, nh, rw, rh)).unwrap();
            assert_eq!(rendered.left, det.left * (rw / nw));
            assert_eq!(rendered.top, det.top * (rh / nh));
            assert_eq!(rendered.width, (det.right - det.left) * (rw / nw));
            assert_eq!(rendered.height, (det.bottom - det.top) * (rh / nh));
        }
    }

    #[test]
    fn inverted_box_clamps_to_zero_area() {
        let det = DetectionBox::new(50.0, 60.0, 10.0, 20.0, "Leaf_Blight", 0.3);
        assert!(det.is_malformed());
        let rendered = map_box(&det, &ImageGeometry::new(100.0, 100.0, 300.0, 200.0)).unwrap();
        assert_eq!(rendered.width, 0.0);
        assert_eq!(rendered.height, 0.0);
        assert!(rendered.right() >= rendered.left);
        assert!(rendered.bottom() >= rendered.top);
        assert!(rendered.is_empty());
    }

    #[test]
    fn degenerate_geometry_is_rejected() {
        let det = DetectionBox::new(0.0, 0.0, 1.0, 1.0, "x", 1.0);
        for geometry in [
            ImageGeometry::default(),
            ImageGeometry::new(0.0, 10.0, 10.0, 10.0),
            ImageGeometry::new(10.0, 0.0, 10.0, 10.0),
            ImageGeometry::new(10.0, 10.0, -1.0, 10.0),
            ImageGeometry::new(f64::NAN, 10.0, 10.0, 10.0),
        ] {
            assert!(matches!(
                map_box(&det, &geometry),
                Err(GeometryError::Unavailable { .. })
            ));
        }
    }

    #[test]
    fn parses_backend_envelope_and_flat_records() {
        let raw = r#"{"yolo_detections": [
            {"box": [1, 2, 30, 40], "class_name": "Brown_Spot", "confidence": 0.87}
        ]}"#;
        let dets = parse_detections(raw).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].right, 30.0);
        assert_eq!(dets[0].class_label, "Brown_Spot");

        let flat = r#"[{"left": 1, "top": 2, "right": 3, "bottom": 4, "class_label": "Tungro", "confidence": 0.1}]"#;
        let dets = parse_detections(flat).unwrap();
        assert_eq!(dets[0].bottom, 4.0);

        assert!(parse_detections(r#"{"other": 1}"#).unwrap().is_empty());
    }
}
