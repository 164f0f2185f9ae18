//! The per-book confidence graph: average word confidence plotted against
//! page number.
//!
//! Rendered as a raster chart straight onto an RGB image buffer. Reference
//! lines mark the 70/65/60 quality cutoffs and the 10th/90th percentiles of
//! the book's confidences; pages below the good cutoff are annotated with
//! their page number so a reviewer can jump straight to them.

use std::collections::HashMap;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut, draw_text_mut};

use crate::prelude::*;

/// The average word confidence of one binarized variant of one page.
#[derive(Clone, Debug, PartialEq)]
pub struct PageConf {
    /// Local path of the hOCR file the confidence came from.
    pub path: String,
    /// The variant code, e.g. `_bin0.2.hocr`.
    pub code: String,
    /// Average word confidence in [0,100].
    pub conf: f64,
}

const WIDTH: u32 = 1920;
const HEIGHT: u32 = 1080;
const MARGIN_LEFT: f32 = 90.0;
const MARGIN_RIGHT: f32 = 40.0;
const MARGIN_TOP: f32 = 60.0;
const MARGIN_BOTTOM: f32 = 90.0;

const MAX_TICKS: usize = 20;
const GOOD_CUTOFF: f64 = 70.0;
const MEDIUM_CUTOFF: f64 = 65.0;
const BAD_CUTOFF: f64 = 60.0;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const AXIS: Rgb<u8> = Rgb([0, 0, 0]);
const SERIES: Rgb<u8> = Rgb([0, 116, 217]);
const GOOD: Rgb<u8> = Rgb([46, 160, 67]);
const MEDIUM: Rgb<u8> = Rgb([255, 133, 27]);
const BAD: Rgb<u8> = Rgb([215, 58, 73]);
const PERCENTILE: Rgb<u8> = Rgb([160, 160, 160]);

/// One plottable point: page number and confidence.
#[derive(Clone, Copy, Debug)]
struct GraphPoint {
    pgnum: f64,
    conf: f64,
}

/// Render the confidence graph for `confs` (a best-variant-per-page map) to
/// `out` as a PNG. Fails with "Not enough valid confidences" if fewer than
/// ten filenames have a leading page number; percentile lines need that
/// much data to mean anything.
pub fn render(confs: &HashMap<String, PageConf>, title: &str, out: &Path) -> Result<()> {
    let mut points: Vec<GraphPoint> = confs
        .values()
        .filter_map(|conf| {
            let name = Path::new(&conf.path)
                .file_name()?
                .to_string_lossy()
                .into_owned();
            let pgnum = parse_page_number(&name)?;
            Some(GraphPoint {
                pgnum,
                conf: conf.conf,
            })
        })
        .collect();
    if points.len() < 10 {
        return Err(anyhow!("Not enough valid confidences"));
    }
    points.sort_by(|a, b| a.pgnum.total_cmp(&b.pgnum));

    let font = load_font();
    if font.is_none() {
        warn!("No usable system font found; rendering graph without labels");
    }

    let mut img = RgbImage::from_pixel(WIDTH, HEIGHT, BACKGROUND);
    let plot = PlotArea::for_points(&points);

    // Percentile markers: the value at n/10 from each end of the
    // confidences sorted ascending.
    let mut by_conf: Vec<f64> = points.iter().map(|p| p.conf).collect();
    by_conf.sort_by(f64::total_cmp);
    let low_conf = by_conf[by_conf.len() / 10];
    let high_conf = by_conf[(by_conf.len() / 10) * 9];

    for (value, color) in [
        (GOOD_CUTOFF, GOOD),
        (MEDIUM_CUTOFF, MEDIUM),
        (BAD_CUTOFF, BAD),
        (low_conf, PERCENTILE),
        (high_conf, PERCENTILE),
    ] {
        let y = plot.y_to_px(value);
        draw_dashed_hline(&mut img, plot.x_min_px(), plot.x_max_px(), y, color);
    }

    // The main series: line segments between consecutive pages, with a dot
    // per page.
    for pair in points.windows(2) {
        draw_line_segment_mut(
            &mut img,
            (plot.x_to_px(pair[0].pgnum), plot.y_to_px(pair[0].conf)),
            (plot.x_to_px(pair[1].pgnum), plot.y_to_px(pair[1].conf)),
            SERIES,
        );
    }
    for point in &points {
        draw_filled_circle_mut(
            &mut img,
            (
                plot.x_to_px(point.pgnum) as i32,
                plot.y_to_px(point.conf) as i32,
            ),
            3,
            SERIES,
        );
    }

    // Axes.
    draw_line_segment_mut(
        &mut img,
        (plot.x_min_px(), plot.y_max_px()),
        (plot.x_min_px(), plot.y_min_px()),
        AXIS,
    );
    draw_line_segment_mut(
        &mut img,
        (plot.x_min_px(), plot.y_min_px()),
        (plot.x_max_px(), plot.y_min_px()),
        AXIS,
    );

    if let Some(font) = &font {
        let label = PxScale::from(22.0);
        let title_scale = PxScale::from(30.0);
        draw_text_mut(
            &mut img,
            AXIS,
            (WIDTH / 2) as i32 - (title.len() as i32 * 8),
            16,
            title_scale,
            font,
            title,
        );
        draw_text_mut(
            &mut img,
            AXIS,
            (WIDTH / 2) as i32 - 50,
            (HEIGHT - 34) as i32,
            label,
            font,
            "Page number",
        );
        draw_text_mut(&mut img, AXIS, 8, 20, label, font, "Confidence");

        // Y ticks every 10 units.
        for tick in (0..=100).step_by(10) {
            let y = plot.y_to_px(tick as f64);
            draw_line_segment_mut(
                &mut img,
                (plot.x_min_px() - 6.0, y),
                (plot.x_min_px(), y),
                AXIS,
            );
            draw_text_mut(
                &mut img,
                AXIS,
                (plot.x_min_px() - 44.0) as i32,
                y as i32 - 10,
                label,
                font,
                &tick.to_string(),
            );
        }

        // X ticks, down-sampled to at most MAX_TICKS across the book.
        let tick_every = (points.len() / MAX_TICKS).max(1);
        for point in points.iter().step_by(tick_every) {
            let x = plot.x_to_px(point.pgnum);
            draw_line_segment_mut(
                &mut img,
                (x, plot.y_min_px()),
                (x, plot.y_min_px() + 6.0),
                AXIS,
            );
            draw_text_mut(
                &mut img,
                AXIS,
                x as i32 - 10,
                (plot.y_min_px() + 12.0) as i32,
                label,
                font,
                &format!("{:.0}", point.pgnum),
            );
        }

        // Annotate every point below the good cutoff with its page number.
        for point in &points {
            if point.conf < GOOD_CUTOFF {
                draw_text_mut(
                    &mut img,
                    BAD,
                    plot.x_to_px(point.pgnum) as i32 + 6,
                    plot.y_to_px(point.conf) as i32 - 24,
                    label,
                    font,
                    &format!("{:.0}", point.pgnum),
                );
            }
        }
    }

    img.save(out)
        .with_context(|| format!("failed to save graph to {}", out.display()))?;
    Ok(())
}

/// Mapping from data space (page number, confidence) to pixel space.
struct PlotArea {
    x_min: f64,
    x_max: f64,
}

impl PlotArea {
    fn for_points(points: &[GraphPoint]) -> Self {
        // X starts at zero like the original charts; Y is fixed [0,100].
        let x_max = points
            .iter()
            .map(|p| p.pgnum)
            .fold(f64::NEG_INFINITY, f64::max)
            .max(1.0);
        Self {
            x_min: 0.0,
            x_max,
        }
    }

    fn x_min_px(&self) -> f32 {
        MARGIN_LEFT
    }

    fn x_max_px(&self) -> f32 {
        WIDTH as f32 - MARGIN_RIGHT
    }

    fn y_min_px(&self) -> f32 {
        // Pixel y grows downward; the plot's y minimum is the bottom edge.
        HEIGHT as f32 - MARGIN_BOTTOM
    }

    fn y_max_px(&self) -> f32 {
        MARGIN_TOP
    }

    fn x_to_px(&self, x: f64) -> f32 {
        let frac = ((x - self.x_min) / (self.x_max - self.x_min)) as f32;
        self.x_min_px() + frac * (self.x_max_px() - self.x_min_px())
    }

    fn y_to_px(&self, y: f64) -> f32 {
        let frac = (y / 100.0) as f32;
        self.y_min_px() + frac * (self.y_max_px() - self.y_min_px())
    }
}

/// Draw a dashed horizontal line at pixel row `y`.
fn draw_dashed_hline(img: &mut RgbImage, x0: f32, x1: f32, y: f32, color: Rgb<u8>) {
    const DASH: f32 = 10.0;
    const GAP: f32 = 5.0;
    let mut x = x0;
    while x < x1 {
        let end = (x + DASH).min(x1);
        draw_line_segment_mut(img, (x, y), (end, y), color);
        x = end + GAP;
    }
}

/// Parse the leading page number from a filename: the digits before the
/// first `_` or `.`. Returns `None` for files that don't follow the
/// convention; those pages are left off the graph.
fn parse_page_number(name: &str) -> Option<f64> {
    let end = name.find(['_', '.'])?;
    name[..end].parse().ok()
}

/// Try to load a text font from well-known system locations.
fn load_font() -> Option<FontVec> {
    const CANDIDATES: &[&str] = &[
        "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
        "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf",
        "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
        "/usr/share/fonts/TTF/DejaVuSans.ttf",
        "/usr/share/fonts/noto/NotoSans-Regular.ttf",
        "/System/Library/Fonts/Helvetica.ttc",
    ];
    for path in CANDIDATES {
        if let Ok(bytes) = std::fs::read(path)
            && let Ok(font) = FontVec::try_from_vec(bytes)
        {
            return Some(font);
        }
    }
    None
}
