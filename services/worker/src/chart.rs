//! Cumulative-distribution chart of object diameters.
//!
//! Drawn directly onto an RGB canvas: axes, the empirical CDF as a step line,
//! one vertical marker per summary statistic with a legend, and a title that
//! states whether the measurement is calibrated.

use crate::stats::SummaryStats;
use image::{Rgb, RgbImage};

pub const CHART_WIDTH: u32 = 640;
pub const CHART_HEIGHT: u32 = 400;

const MARGIN_LEFT: i64 = 50;
const MARGIN_RIGHT: i64 = 20;
const MARGIN_TOP: i64 = 40;
const MARGIN_BOTTOM: i64 = 50;
const TEXT_SCALE: i64 = 2;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const AXIS: Rgb<u8> = Rgb([40, 40, 40]);
pub const CURVE: Rgb<u8> = Rgb([31, 119, 180]);

/// Marker label and colour for each statistic, in legend order
pub const MARKERS: [(&str, Rgb<u8>); 6] = [
    ("P10", Rgb([255, 127, 14])),
    ("P50", Rgb([44, 160, 44])),
    ("P90", Rgb([214, 39, 40])),
    ("MIN", Rgb([148, 103, 189])),
    ("MAX", Rgb([140, 86, 75])),
    ("MEAN", Rgb([227, 119, 194])),
];

/// 5x7 bitmap rows, most significant of the low five bits on the left
fn glyph(c: char) -> [u8; 7] {
    match c {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '(' => [0x02, 0x04, 0x08, 0x08, 0x08, 0x04, 0x02],
        ')' => [0x08, 0x04, 0x02, 0x02, 0x02, 0x04, 0x08],
        '/' => [0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x00],
        _ => [0; 7],
    }
}

struct Canvas {
    image: RgbImage,
}

impl Canvas {
    fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbImage::from_pixel(width, height, BACKGROUND),
        }
    }

    fn plot(&mut self, x: i64, y: i64, color: Rgb<u8>) {
        if x >= 0 && y >= 0 && x < self.image.width() as i64 && y < self.image.height() as i64 {
            self.image.put_pixel(x as u32, y as u32, color);
        }
    }

    /// Bresenham line, endpoints included
    fn line(&mut self, (x0, y0): (i64, i64), (x1, y1): (i64, i64), color: Rgb<u8>) {
        let (dx, dy) = ((x1 - x0).abs(), -(y1 - y0).abs());
        let (sx, sy) = (if x0 < x1 { 1 } else { -1 }, if y0 < y1 { 1 } else { -1 });
        let (mut x, mut y, mut err) = (x0, y0, dx + dy);
        loop {
            self.plot(x, y, color);
            if x == x1 && y == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    /// Dashed vertical line
    fn dashed_vline(&mut self, x: i64, top: i64, bottom: i64, color: Rgb<u8>) {
        for y in top..=bottom {
            if (y - top) % 8 < 5 {
                self.plot(x, y, color);
                self.plot(x + 1, y, color);
            }
        }
    }

    fn text(&mut self, x: i64, y: i64, text: &str, color: Rgb<u8>) {
        for (i, c) in text.chars().enumerate() {
            let origin = x + i as i64 * 6 * TEXT_SCALE;
            for (row, bits) in glyph(c.to_ascii_uppercase()).iter().enumerate() {
                for col in 0..5 {
                    if bits & (0x10 >> col) == 0 {
                        continue;
                    }
                    for dy in 0..TEXT_SCALE {
                        for dx in 0..TEXT_SCALE {
                            self.plot(
                                origin + col * TEXT_SCALE + dx,
                                y + row as i64 * TEXT_SCALE + dy,
                                color,
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Title line naming the calibration state
pub fn chart_title(is_calibrated: bool, unit: &str) -> String {
    if is_calibrated {
        format!("Diameter CDF - calibrated ({unit})")
    } else {
        format!("Diameter CDF - uncalibrated ({unit})")
    }
}

/// Render the CDF of ascending `diameters` with markers for `stats`
pub fn render_cdf_chart(
    diameters: &[f64],
    stats: &SummaryStats,
    is_calibrated: bool,
    unit: &str,
) -> RgbImage {
    let (w, h) = (CHART_WIDTH as i64, CHART_HEIGHT as i64);
    let mut canvas = Canvas::new(CHART_WIDTH, CHART_HEIGHT);

    let left = MARGIN_LEFT;
    let right = w - MARGIN_RIGHT;
    let top = MARGIN_TOP;
    let bottom = h - MARGIN_BOTTOM;

    let x_min = stats.min.min(0.0);
    let mut x_max = stats.max * 1.05;
    if x_max <= x_min {
        x_max = x_min + 1.0;
    }
    let to_x = |v: f64| left + ((v - x_min) / (x_max - x_min) * (right - left) as f64).round() as i64;
    let to_y = |p: f64| bottom - (p * (bottom - top) as f64).round() as i64;

    canvas.line((left, top), (left, bottom), AXIS);
    canvas.line((left, bottom), (right, bottom), AXIS);
    canvas.text(left - 16, to_y(1.0) - 7, "1", AXIS);
    canvas.text(left - 16, bottom - 7, "0", AXIS);
    canvas.text(left, bottom + 8, &format!("{x_min:.1}"), AXIS);
    let max_label = format!("{x_max:.1}");
    canvas.text(right - max_label.len() as i64 * 12, bottom + 8, &max_label, AXIS);
    canvas.text(left + 150, bottom + 28, &format!("Diameter ({unit})"), AXIS);
    canvas.text(left, 12, &chart_title(is_calibrated, unit), AXIS);

    let values = [stats.p10, stats.p50, stats.p90, stats.min, stats.max, stats.mean];
    for (&(_, color), &value) in MARKERS.iter().zip(&values) {
        canvas.dashed_vline(to_x(value), top, bottom, color);
    }

    let n = diameters.len();
    let mut prev = (to_x(x_min), to_y(0.0));
    for (i, &d) in diameters.iter().enumerate() {
        let x = to_x(d);
        let y = to_y((i + 1) as f64 / n as f64);
        canvas.line(prev, (x, prev.1), CURVE);
        canvas.line((x, prev.1), (x, y), CURVE);
        prev = (x, y);
    }
    canvas.line(prev, (right, prev.1), CURVE);

    for (row, (&(label, color), value)) in MARKERS.iter().zip(values).enumerate() {
        let y = top + 8 + row as i64 * 18;
        canvas.text(left + 10, y, &format!("{label}: {value:.2}"), color);
    }

    canvas.image
}
