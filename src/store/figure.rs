use std::io::Cursor;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const AXIS: Rgb<u8> = Rgb([64, 64, 64]);
const SERIES: Rgb<u8> = Rgb([31, 119, 180]);
const MARGIN: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartKind {
    Bar,
    Line,
}

/// A chart produced by a script. Rasterized to JPEG only when read.
#[derive(Debug, Clone, PartialEq)]
pub struct Figure {
    pub kind: ChartKind,
    pub title: String,
    pub labels: Vec<String>,
    pub values: Vec<f64>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum FigureError {
    #[error("figure has no data points")]
    Empty,

    #[error("labels ({labels}) and values ({values}) differ in length")]
    Mismatch { labels: usize, values: usize },

    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

impl Figure {
    pub fn new(kind: ChartKind, title: impl Into<String>, labels: Vec<String>, values: Vec<f64>) -> Self {
        Self {
            kind,
            title: title.into(),
            labels,
            values,
            width: 640,
            height: 400,
        }
    }

    pub fn validate(&self) -> Result<(), FigureError> {
        if self.values.is_empty() {
            return Err(FigureError::Empty);
        }
        if !self.labels.is_empty() && self.labels.len() != self.values.len() {
            return Err(FigureError::Mismatch {
                labels: self.labels.len(),
                values: self.values.len(),
            });
        }
        Ok(())
    }

    pub fn rasterize(&self) -> Result<RgbImage, FigureError> {
        self.validate()?;
        let (w, h) = (self.width.max(2 * MARGIN + 8), self.height.max(2 * MARGIN + 8));
        let mut img = RgbImage::from_pixel(w, h, BACKGROUND);

        let finite = self.values.iter().copied().filter(|v| v.is_finite());
        let max = finite.clone().fold(0.0_f64, f64::max);
        let min = finite.fold(0.0_f64, f64::min);
        let span = if max - min > 0.0 { max - min } else { 1.0 };

        let plot_w = w - 2 * MARGIN;
        let plot_h = h - 2 * MARGIN;
        let to_y = |v: f64| -> u32 {
            let v = if v.is_finite() { v } else { 0.0 };
            let frac = (v - min) / span;
            MARGIN + plot_h - (frac * plot_h as f64).round() as u32
        };
        let baseline = to_y(0.0);

        fill_rect(&mut img, MARGIN, MARGIN, 1, plot_h, AXIS);
        fill_rect(&mut img, MARGIN, baseline, plot_w, 1, AXIS);

        let n = self.values.len() as u32;
        let slot = (plot_w / n).max(1);
        match self.kind {
            ChartKind::Bar => {
                let bar = (slot * 7 / 10).max(1);
                for (i, v) in self.values.iter().enumerate() {
                    let x = MARGIN + i as u32 * slot + (slot - bar) / 2;
                    let y = to_y(*v);
                    let (top, height) = if y <= baseline { (y, baseline - y) } else { (baseline, y - baseline) };
                    fill_rect(&mut img, x, top, bar, height.max(1), SERIES);
                }
            }
            ChartKind::Line => {
                let points: Vec<(u32, u32)> = self
                    .values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (MARGIN + i as u32 * slot + slot / 2, to_y(*v)))
                    .collect();
                for pair in points.windows(2) {
                    draw_line(&mut img, pair[0], pair[1], SERIES);
                }
                for &(x, y) in &points {
                    fill_rect(&mut img, x.saturating_sub(2), y.saturating_sub(2), 5, 5, SERIES);
                }
            }
        }
        Ok(img)
    }

    pub fn to_jpeg(&self) -> Result<Vec<u8>, FigureError> {
        let img = DynamicImage::ImageRgb8(self.rasterize()?);
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, ImageFormat::Jpeg)?;
        Ok(cursor.into_inner())
    }

    pub fn to_jpeg_base64(&self) -> Result<String, FigureError> {
        Ok(STANDARD.encode(self.to_jpeg()?))
    }
}

fn fill_rect(img: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>) {
    let (iw, ih) = img.dimensions();
    for py in y..(y + h).min(ih) {
        for px in x..(x + w).min(iw) {
            img.put_pixel(px, py, color);
        }
    }
}

fn draw_line(img: &mut RgbImage, from: (u32, u32), to: (u32, u32), color: Rgb<u8>) {
    let (x0, y0) = (from.0 as i64, from.1 as i64);
    let (x1, y1) = (to.0 as i64, to.1 as i64);
    let steps = (x1 - x0).abs().max((y1 - y0).abs()).max(1);
    let (iw, ih) = img.dimensions();
    for s in 0..=steps {
        let x = x0 + (x1 - x0) * s / steps;
        let y = y0 + (y1 - y0) * s / steps;
        if x >= 0 && y >= 0 && (x as u32) < iw && (y as u32) < ih {
            img.put_pixel(x as u32, y as u32, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_chart_encodes_as_jpeg() {
        let fig = Figure::new(
            ChartKind::Bar,
            "Sales",
            vec!["a".into(), "b".into()],
            vec![3.0, 5.0],
        );
        let bytes = fig.to_jpeg().unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let encoded = fig.to_jpeg_base64().unwrap();
        assert!(encoded.starts_with("/9j/"));
    }

    #[test]
    fn line_chart_handles_negative_values() {
        let fig = Figure::new(ChartKind::Line, "Delta", vec![], vec![-2.0, 4.0, f64::NAN]);
        let img = fig.rasterize().unwrap();
        assert_eq!(img.dimensions(), (640, 400));
    }

    #[test]
    fn empty_figure_is_rejected() {
        let fig = Figure::new(ChartKind::Bar, "Empty", vec![], vec![]);
        assert!(matches!(fig.rasterize(), Err(FigureError::Empty)));
    }

    #[test]
    fn mismatched_labels_are_rejected() {
        let fig = Figure::new(ChartKind::Bar, "Bad", vec!["x".into()], vec![1.0, 2.0]);
        assert_eq!(
            fig.validate().unwrap_err().to_string(),
            "labels (1) and values (2) differ in length"
        );
    }
}
