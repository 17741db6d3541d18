//! Result-frame annotation: zone outlines and labels, track boxes and an
//! optional heat tint.

use ab_glyph::{FontRef, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::sync::OnceLock;

use crate::detect::Track;
use crate::geometry::Zone;
use crate::heatmap::Heatmap;

const TRACK_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const HEAT_ALPHA: f32 = 0.6;
/// Cells below this share of the peak are left untinted.
const HEAT_FLOOR: f32 = 0.02;
const LABEL_SCALE: f32 = 14.0;
const LABEL_INSET: i32 = 4;

const FONT_DATA: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");

fn label_font() -> Option<&'static FontRef<'static>> {
    static FONT: OnceLock<Option<FontRef<'static>>> = OnceLock::new();
    FONT.get_or_init(|| match FontRef::try_from_slice(FONT_DATA) {
        Ok(font) => Some(font),
        Err(err) => {
            log::warn!("zone label font unusable, labels disabled: {}", err);
            None
        }
    })
    .as_ref()
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RenderOptions {
    pub zones: bool,
    /// Zone names drawn inside each zone's top-left corner.
    pub labels: bool,
    pub tracks: bool,
    pub heatmap: bool,
}

impl RenderOptions {
    pub fn standard() -> Self {
        Self {
            zones: true,
            labels: true,
            tracks: true,
            heatmap: false,
        }
    }
}

pub fn annotate(
    image: &mut RgbImage,
    zones: &[Zone],
    tracks: &[Track],
    heatmap: Option<&Heatmap>,
    options: RenderOptions,
) {
    if options.heatmap {
        if let Some(heat) = heatmap {
            tint_heat(image, heat);
        }
    }
    if options.zones {
        for zone in zones {
            draw_zone(image, zone);
        }
    }
    if options.labels {
        if let Some(font) = label_font() {
            for zone in zones {
                draw_label(image, zone, font);
            }
        }
    }
    if options.tracks {
        for track in tracks {
            draw_track(image, track);
        }
    }
}

fn draw_zone(image: &mut RgbImage, zone: &Zone) {
    let color = Rgb(zone.color);
    let n = zone.vertices.len();
    for i in 0..n {
        let a = zone.vertices[i];
        let b = zone.vertices[(i + 1) % n];
        draw_line_segment_mut(
            image,
            (a.x as f32, a.y as f32),
            (b.x as f32, b.y as f32),
            color,
        );
    }
}

fn draw_label(image: &mut RgbImage, zone: &Zone, font: &FontRef<'static>) {
    let x = zone.vertices.iter().map(|v| v.x).fold(f64::INFINITY, f64::min);
    let y = zone.vertices.iter().map(|v| v.y).fold(f64::INFINITY, f64::min);
    if !x.is_finite() || !y.is_finite() {
        return;
    }
    draw_text_mut(
        image,
        Rgb(zone.color),
        x.round() as i32 + LABEL_INSET,
        y.round() as i32 + LABEL_INSET,
        PxScale::from(LABEL_SCALE),
        font,
        &zone.name,
    );
}

fn draw_track(image: &mut RgbImage, track: &Track) {
    let b = track.bbox;
    let w = b.width().round().max(1.0) as u32;
    let h = b.height().round().max(1.0) as u32;
    let rect = Rect::at(b.x1.round() as i32, b.y1.round() as i32).of_size(w, h);
    draw_hollow_rect_mut(image, rect, TRACK_COLOR);
    let c = track.center;
    draw_line_segment_mut(
        image,
        (c.x as f32 - 3.0, c.y as f32),
        (c.x as f32 + 3.0, c.y as f32),
        TRACK_COLOR,
    );
}

/// Blend a blue→red ramp over the frame, weighted by normalized heat.
fn tint_heat(image: &mut RgbImage, heat: &Heatmap) {
    if heat.width() != image.width() || heat.height() != image.height() {
        return;
    }
    let peak = heat.max();
    if peak <= 0.0 {
        return;
    }
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let Some(v) = heat.get(x, y) else { continue };
        let level = v / peak;
        if level < HEAT_FLOOR {
            continue;
        }
        let ramp = [255.0 * level, 64.0 * (1.0 - level), 255.0 * (1.0 - level)];
        let a = HEAT_ALPHA * level;
        for (channel, target) in pixel.0.iter_mut().zip(ramp) {
            *channel = (f32::from(*channel) * (1.0 - a) + target * a).round() as u8;
        }
    }
}
