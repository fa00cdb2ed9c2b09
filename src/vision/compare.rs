//! Image comparison: structural similarity, mean squared error and
//! normalized cross-correlation template matching.
//!
//! Everything here is a pure function of its inputs.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, GrayImage};
use imageproc::template_matching::{find_extremes, match_template, MatchTemplateMethod};

use crate::error::{FleetError, Result};

/// Both images are resized to this before comparison
pub const CANONICAL_SIZE: (u32, u32) = (300, 300);

/// Side of the square SSIM window
const SSIM_WINDOW: u32 = 7;
const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;
const DATA_RANGE: f64 = 255.0;

/// Result of [`compare`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    /// Mean structural similarity clamped to [0, 1], 1.0 for identical images
    pub ssim: f64,
    /// Mean squared error of the 8-bit intensities, 0.0 for identical images
    pub mse: f64,
}

/// Best template position found by [`template_match`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplateMatch {
    /// Normalized cross-correlation in [0, 1]
    pub score: f32,
    /// Top-left corner of the best window, in screen pixels
    pub top_left: (u32, u32),
    /// Template size in screen pixels
    pub size: (u32, u32),
}

impl TemplateMatch {
    /// Center of the matched window, which is what callers tap
    pub fn center(&self) -> (u32, u32) {
        (
            self.top_left.0 + self.size.0 / 2,
            self.top_left.1 + self.size.1 / 2,
        )
    }
}

/// Compare two images independent of their resolution
pub fn compare(a: &DynamicImage, b: &DynamicImage) -> Similarity {
    let a = canonical_gray(a);
    let b = canonical_gray(b);
    Similarity {
        ssim: ssim(&a, &b).clamp(0.0, 1.0),
        mse: mse(&a, &b),
    }
}

/// Resize to [`CANONICAL_SIZE`] and convert to single-channel intensity
pub fn canonical_gray(img: &DynamicImage) -> GrayImage {
    let (w, h) = CANONICAL_SIZE;
    let gray = img.to_luma8();
    if gray.dimensions() == (w, h) {
        return gray;
    }
    imageops::resize(&gray, w, h, FilterType::Triangle)
}

/// Mean squared error of two equally sized gray images
pub fn mse(a: &GrayImage, b: &GrayImage) -> f64 {
    debug_assert_eq!(a.dimensions(), b.dimensions());
    let n = (a.width() as u64) * (a.height() as u64);
    if n == 0 {
        return 0.0;
    }
    let sum: u64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw().iter())
        .map(|(&x, &y)| {
            let d = x as i64 - y as i64;
            (d * d) as u64
        })
        .sum();
    sum as f64 / n as f64
}

/// Mean SSIM over all 7x7 windows fully inside the image, using sample
/// covariance. Images smaller than the window fall back to a single window
/// covering the whole image.
pub fn ssim(a: &GrayImage, b: &GrayImage) -> f64 {
    debug_assert_eq!(a.dimensions(), b.dimensions());
    let (w, h) = a.dimensions();
    if w == 0 || h == 0 {
        return 1.0;
    }
    let win = SSIM_WINDOW.min(w).min(h);

    let sums = WindowSums::new(a, b);
    let c1 = (SSIM_K1 * DATA_RANGE).powi(2);
    let c2 = (SSIM_K2 * DATA_RANGE).powi(2);
    let n = (win * win) as f64;
    let cov_norm = if n > 1.0 { n / (n - 1.0) } else { 1.0 };

    let mut total = 0.0;
    let mut count = 0u64;
    for y in 0..=(h - win) {
        for x in 0..=(w - win) {
            let s = sums.window(x, y, win);
            let ux = s.x / n;
            let uy = s.y / n;
            let vx = cov_norm * (s.xx / n - ux * ux);
            let vy = cov_norm * (s.yy / n - uy * uy);
            let vxy = cov_norm * (s.xy / n - ux * uy);

            let num = (2.0 * ux * uy + c1) * (2.0 * vxy + c2);
            let den = (ux * ux + uy * uy + c1) * (vx + vy + c2);
            total += num / den;
            count += 1;
        }
    }
    total / count as f64
}

#[derive(Default, Clone, Copy)]
struct Sums {
    x: f64,
    y: f64,
    xx: f64,
    yy: f64,
    xy: f64,
}

/// Summed-area tables for x, y, x², y² and xy
struct WindowSums {
    stride: usize,
    x: Vec<u64>,
    y: Vec<u64>,
    xx: Vec<u64>,
    yy: Vec<u64>,
    xy: Vec<u64>,
}

impl WindowSums {
    fn new(a: &GrayImage, b: &GrayImage) -> Self {
        let (w, h) = a.dimensions();
        let stride = w as usize + 1;
        let len = stride * (h as usize + 1);
        let mut t = Self {
            stride,
            x: vec![0; len],
            y: vec![0; len],
            xx: vec![0; len],
            yy: vec![0; len],
            xy: vec![0; len],
        };

        for row in 0..h {
            let (mut rx, mut ry, mut rxx, mut ryy, mut rxy) = (0u64, 0u64, 0u64, 0u64, 0u64);
            for col in 0..w {
                let pa = a.get_pixel(col, row).0[0] as u64;
                let pb = b.get_pixel(col, row).0[0] as u64;
                rx += pa;
                ry += pb;
                rxx += pa * pa;
                ryy += pb * pb;
                rxy += pa * pb;

                let i = (row as usize + 1) * stride + col as usize + 1;
                let above = i - stride;
                t.x[i] = t.x[above] + rx;
                t.y[i] = t.y[above] + ry;
                t.xx[i] = t.xx[above] + rxx;
                t.yy[i] = t.yy[above] + ryy;
                t.xy[i] = t.xy[above] + rxy;
            }
        }
        t
    }

    fn window(&self, x: u32, y: u32, size: u32) -> Sums {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + size as usize, y0 + size as usize);
        let s = self.stride;
        let rect = |t: &[u64]| -> f64 {
            (t[y1 * s + x1] + t[y0 * s + x0] - t[y0 * s + x1] - t[y1 * s + x0]) as f64
        };
        Sums {
            x: rect(&self.x),
            y: rect(&self.y),
            xx: rect(&self.xx),
            yy: rect(&self.yy),
            xy: rect(&self.xy),
        }
    }
}

/// Find `template` inside `screen` by normalized cross-correlation
pub fn template_match(screen: &DynamicImage, template: &DynamicImage) -> Result<TemplateMatch> {
    let (sw, sh) = screen.dimensions();
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 {
        return Err(FleetError::InvalidTemplate("template is empty".into()));
    }
    if tw > sw || th > sh {
        return Err(FleetError::InvalidTemplate(format!(
            "template {tw}x{th} larger than screen {sw}x{sh}"
        )));
    }

    let scores = match_template(
        &screen.to_luma8(),
        &template.to_luma8(),
        MatchTemplateMethod::CrossCorrelationNormalized,
    );
    let extremes = find_extremes(&scores);
    Ok(TemplateMatch {
        score: extremes.max_value,
        top_left: extremes.max_value_location,
        size: (tw, th),
    })
}

/// [`template_match`] on copies of both images downscaled by `scale`, with the
/// result mapped back to full-resolution screen coordinates
pub fn template_match_scaled(
    screen: &DynamicImage,
    template: &DynamicImage,
    scale: f32,
) -> Result<TemplateMatch> {
    if !(scale > 0.0 && scale < 1.0) {
        return template_match(screen, template);
    }
    // Rounding can make an oversized template fit once both are shrunk
    let (sw, sh) = screen.dimensions();
    let (tw, th) = template.dimensions();
    if tw > sw || th > sh {
        return Err(FleetError::InvalidTemplate(format!(
            "template {tw}x{th} is larger than screen {sw}x{sh}"
        )));
    }
    let shrink = |img: &DynamicImage| {
        let (w, h) = img.dimensions();
        let w = ((w as f32 * scale).round() as u32).max(1);
        let h = ((h as f32 * scale).round() as u32).max(1);
        img.resize_exact(w, h, FilterType::Triangle)
    };

    let found = template_match(&shrink(screen), &shrink(template))?;
    let x = ((found.top_left.0 as f32 / scale).round() as u32).min(sw - tw);
    let y = ((found.top_left.1 as f32 / scale).round() as u32).min(sh - th);
    Ok(TemplateMatch {
        score: found.score,
        top_left: (x, y),
        size: (tw, th),
    })
}
