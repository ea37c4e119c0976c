use crate::overlay::{AnnotatedBox, BlendMode, OverlayContent, OverlayScene};
use crate::palette::contrast_color;
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};

pub const PLACEHOLDER_TEXT: &str = "No disease areas detected";

const BOX_STROKE: i32 = 2;
const LABEL_PAD: i32 = 2;
const GLYPH: i32 = 8;

/// Draw `scene` over `base`, resized to the scene's rendered size.
pub fn compose(base: &DynamicImage, heatmap: Option<&DynamicImage>, scene: &OverlayScene) -> RgbaImage {
    let (w, h) = target_size(base, scene);
    let mut canvas = if (w, h) == (base.width(), base.height()) {
        base.to_rgba8()
    } else {
        base.resize_exact(w, h, FilterType::Triangle).to_rgba8()
    };

    match (scene.heatmap, heatmap) {
        (Some(BlendMode::Multiply), Some(heat)) => {
            let heat = if (heat.width(), heat.height()) == (w, h) {
                heat.to_rgba8()
            } else {
                heat.resize_exact(w, h, FilterType::Triangle).to_rgba8()
            };
            multiply_layer(&mut canvas, &heat);
        }
        (Some(_), None) => log::warn!("scene expects a heatmap layer but none was supplied"),
        _ => {}
    }

    match &scene.content {
        OverlayContent::Pending => {}
        OverlayContent::NoDetections => draw_placeholder(&mut canvas),
        OverlayContent::Boxes(boxes) => {
            for annotated in boxes {
                draw_annotated_box(&mut canvas, annotated);
            }
        }
    }
    canvas
}

fn target_size(base: &DynamicImage, scene: &OverlayScene) -> (u32, u32) {
    let rw = scene.geometry.rendered_width;
    let rh = scene.geometry.rendered_height;
    if rw.is_finite() && rh.is_finite() && rw >= 1.0 && rh >= 1.0 {
        (rw.round() as u32, rh.round() as u32)
    } else {
        (base.width(), base.height())
    }
}

/// Multiply `heat` into `canvas`, weighted by the heat pixel's alpha.
/// Base alpha is kept.
pub fn multiply_layer(canvas: &mut RgbaImage, heat: &RgbaImage) {
    let w = canvas.width().min(heat.width());
    let h = canvas.height().min(heat.height());
    for y in 0..h {
        for x in 0..w {
            let base = canvas.get_pixel(x, y).0;
            let src = heat.get_pixel(x, y).0;
            let a = f64::from(src[3]) / 255.0;
            if a <= 0.0 {
                continue;
            }
            let mut out = base;
            for c in 0..3 {
                let b = f64::from(base[c]);
                let product = b * f64::from(src[c]) / 255.0;
                out[c] = (b * (1.0 - a) + product * a).round().clamp(0.0, 255.0) as u8;
            }
            canvas.put_pixel(x, y, Rgba(out));
        }
    }
}

fn draw_annotated_box(img: &mut RgbaImage, annotated: &AnnotatedBox) {
    let rect = annotated.rect;
    let x0 = to_px(rect.left, img.width());
    let y0 = to_px(rect.top, img.height());
    let x1 = to_px(rect.right(), img.width()) - 1;
    let y1 = to_px(rect.bottom(), img.height()) - 1;

    if !rect.is_empty() && x1 >= x0 && y1 >= y0 {
        stroke_rect(img, x0, y0, x1, y1, contrast_color(annotated.color), BOX_STROKE + 2);
        stroke_rect(img, x0, y0, x1, y1, annotated.color, BOX_STROKE);
    }

    let (_, _, text_w, text_h) = text_bbox(0, 0, &annotated.label, 1);
    let chip_h = text_h + LABEL_PAD * 2;
    let chip_w = text_w + LABEL_PAD * 2;
    // Above the box when there is room, otherwise tucked inside its top edge.
    let above = y0.saturating_sub(chip_h);
    let chip_y = if above >= 0 { above } else { y0 };
    fill_rect_alpha(
        img,
        x0,
        chip_y,
        x0.saturating_add(chip_w - 1),
        chip_y.saturating_add(chip_h - 1),
        annotated.color,
    );
    let text_color = if crate::palette::color_luma(annotated.color) > 0.6 {
        Rgba([0, 0, 0, 255])
    } else {
        Rgba([255, 255, 255, 255])
    };
    draw_bitmap_text(img, x0 + LABEL_PAD, chip_y + LABEL_PAD, &annotated.label, text_color, 1);
}

fn draw_placeholder(img: &mut RgbaImage) {
    let (w, h) = (img.width() as i32, img.height() as i32);
    if w == 0 || h == 0 {
        return;
    }
    fill_rect_alpha(img, 0, 0, w - 1, h - 1, Rgba([0, 0, 0, 51]));

    let scale = if w >= 480 { 2 } else { 1 };
    let (_, _, text_w, text_h) = text_bbox(0, 0, PLACEHOLDER_TEXT, scale);
    let pad = 8 * scale as i32;
    let x = (w - text_w) / 2;
    let y = (h - text_h) / 2;
    fill_rect_alpha(
        img,
        x - pad,
        y - pad,
        x + text_w + pad - 1,
        y + text_h + pad - 1,
        Rgba([255, 255, 255, 255]),
    );
    draw_bitmap_text(img, x, y, PLACEHOLDER_TEXT, Rgba([17, 24, 39, 255]), scale);
}

/// Rendered coordinate to pixel, pinned a little outside the canvas so that
/// strokes and chips stay bounded for boxes far off screen.
fn to_px(v: f64, span: u32) -> i32 {
    let margin = f64::from(span) + 1024.0;
    v.round().clamp(-margin, margin) as i32
}

fn clamp_i32(value: i32, min_value: i32, max_value: i32) -> i32 {
    value.max(min_value).min(max_value)
}

/// Source-over blend of `src` onto `dst`.
pub fn blend_pixel(dst: Rgba<u8>, src: Rgba<u8>) -> Rgba<u8> {
    let a = f64::from(src[3]) / 255.0;
    if a <= 0.0 {
        return dst;
    }
    let inv = 1.0 - a;
    let mix = |d: u8, s: u8| (f64::from(d) * inv + f64::from(s) * a).round().clamp(0.0, 255.0) as u8;
    let out_a = (f64::from(dst[3]) + f64::from(src[3]) * inv)
        .round()
        .clamp(0.0, 255.0) as u8;
    Rgba([mix(dst[0], src[0]), mix(dst[1], src[1]), mix(dst[2], src[2]), out_a])
}

fn put_blended(img: &mut RgbaImage, x: i32, y: i32, color: Rgba<u8>) {
    if x >= 0 && y >= 0 && x < img.width() as i32 && y < img.height() as i32 {
        let dst = *img.get_pixel(x as u32, y as u32);
        img.put_pixel(x as u32, y as u32, blend_pixel(dst, color));
    }
}

/// Rectangle outline growing outward from the inclusive corners by
/// `thickness` pixels. Clipped to the canvas.
pub fn stroke_rect(img: &mut RgbaImage, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgba<u8>, thickness: i32) {
    let thickness = thickness.max(1);
    let max_x = i32::try_from(img.width()).unwrap_or(i32::MAX).saturating_add(thickness);
    let max_y = i32::try_from(img.height()).unwrap_or(i32::MAX).saturating_add(thickness);
    let (x0, x1) = (x0.clamp(-thickness, max_x), x1.clamp(-thickness, max_x));
    let (y0, y1) = (y0.clamp(-thickness, max_y), y1.clamp(-thickness, max_y));
    for t in 0..thickness {
        let (tx0, ty0) = (x0.saturating_sub(t), y0.saturating_sub(t));
        let (tx1, ty1) = (x1.saturating_add(t), y1.saturating_add(t));
        for xx in tx0..=tx1 {
            put_pixel_clipped(img, xx, ty0, color);
            put_pixel_clipped(img, xx, ty1, color);
        }
        for yy in ty0..=ty1 {
            put_pixel_clipped(img, tx0, yy, color);
            put_pixel_clipped(img, tx1, yy, color);
        }
    }
}

fn put_pixel_clipped(img: &mut RgbaImage, x: i32, y: i32, color: Rgba<u8>) {
    if x >= 0 && y >= 0 && x < img.width() as i32 && y < img.height() as i32 {
        img.put_pixel(x as u32, y as u32, color);
    }
}

pub fn fill_rect_alpha(img: &mut RgbaImage, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgba<u8>) {
    if img.width() == 0 || img.height() == 0 {
        return;
    }
    let max_w = img.width() as i32 - 1;
    let max_h = img.height() as i32 - 1;
    if x0.max(x1) < 0 || y0.max(y1) < 0 || x0.min(x1) > max_w || y0.min(y1) > max_h {
        return;
    }
    let min_x = clamp_i32(x0.min(x1), 0, max_w);
    let max_x = clamp_i32(x0.max(x1), 0, max_w);
    let min_y = clamp_i32(y0.min(y1), 0, max_h);
    let max_y = clamp_i32(y0.max(y1), 0, max_h);
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            put_blended(img, x, y, color);
        }
    }
}

pub fn draw_bitmap_text(img: &mut RgbaImage, x: i32, y: i32, text: &str, color: Rgba<u8>, scale: u32) {
    let scale_i = scale.clamp(1, 64) as i32;
    let cell = GLYPH * scale_i;
    let (w, h) = (img.width() as i32, img.height() as i32);
    let mut cursor_x = x;
    let mut cursor_y = y;
    for ch in text.chars() {
        if ch == '\n' {
            cursor_x = x;
            cursor_y = cursor_y.saturating_add(cell);
            continue;
        }
        let visible = cursor_x < w
            && cursor_y < h
            && cursor_x.saturating_add(cell) > 0
            && cursor_y.saturating_add(cell) > 0;
        if visible {
            if let Some(glyph) = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?')) {
                for (row_idx, row) in glyph.iter().enumerate() {
                    for col_idx in 0..GLYPH {
                        if (*row >> col_idx) & 1 == 0 {
                            continue;
                        }
                        let px = cursor_x + col_idx * scale_i;
                        let py = cursor_y + row_idx as i32 * scale_i;
                        for sy in 0..scale_i {
                            for sx in 0..scale_i {
                                put_blended(img, px + sx, py + sy, color);
                            }
                        }
                    }
                }
            }
        }
        cursor_x = cursor_x.saturating_add(cell);
    }
}

/// `(x, y, width, height)` of `text` in 8x8 glyph cells.
pub fn text_bbox(x: i32, y: i32, text: &str, scale: u32) -> (i32, i32, i32, i32) {
    let scale_i = scale.max(1) as i32;
    let lines: Vec<&str> = text.split('\n').collect();
    let width_chars = lines
        .iter()
        .map(|line| line.chars().count() as i32)
        .max()
        .unwrap_or(0);
    let line_count = lines.len().max(1) as i32;
    (x, y, width_chars * GLYPH * scale_i, line_count * GLYPH * scale_i)
}
