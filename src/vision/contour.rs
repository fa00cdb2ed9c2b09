//! Contour-based detection of wide, flat controls such as search bars

use image::{DynamicImage, GenericImageView, GrayImage, Luma};
use imageproc::contours::{find_contours, Contour};
use imageproc::contrast::otsu_level;
use serde::{Deserialize, Serialize};

use crate::driver::Rect;

/// Shape a candidate's bounding box must satisfy, relative to the full screen
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShapeConstraints {
    /// Minimum width as a fraction of screen width
    pub min_width_frac: f32,
    /// Height range as fractions of screen height
    pub min_height_frac: f32,
    pub max_height_frac: f32,
    /// Minimum width / height
    pub min_aspect: f32,
}

impl Default for ShapeConstraints {
    fn default() -> Self {
        Self {
            min_width_frac: 0.5,
            min_height_frac: 0.015,
            max_height_frac: 0.1,
            min_aspect: 3.0,
        }
    }
}

impl ShapeConstraints {
    pub fn accepts(&self, rect: &Rect, screen: (u32, u32)) -> bool {
        let (sw, sh) = (screen.0 as f32, screen.1 as f32);
        let (w, h) = (rect.width() as f32, rect.height() as f32);
        if h <= 0.0 || sw <= 0.0 || sh <= 0.0 {
            return false;
        }
        w >= self.min_width_frac * sw
            && h >= self.min_height_frac * sh
            && h <= self.max_height_frac * sh
            && w / h >= self.min_aspect
    }
}

/// Vertical band of the screen to search, as fractions of screen height
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub top: f32,
    pub bottom: f32,
}

impl Default for Band {
    /// Top 20% of the screen, where header controls live
    fn default() -> Self {
        Self {
            top: 0.0,
            bottom: 0.2,
        }
    }
}

/// Find bars inside `band` that satisfy `constraints`.
///
/// The band is binarized at its Otsu level and both outer and hole borders
/// are considered, so light-on-dark and dark-on-light bars are found alike.
/// Results are in full-screen coordinates, widest first.
pub fn find_bars(frame: &DynamicImage, band: Band, constraints: &ShapeConstraints) -> Vec<Rect> {
    let (w, h) = frame.dimensions();
    if w == 0 || h == 0 {
        return Vec::new();
    }
    let top = ((band.top.clamp(0.0, 1.0) * h as f32) as u32).min(h - 1);
    let bottom = ((band.bottom.clamp(0.0, 1.0) * h as f32).ceil() as u32).clamp(top + 1, h);

    let region = frame.crop_imm(0, top, w, bottom - top).to_luma8();
    let binary = binarize(&region);

    let mut bars: Vec<Rect> = find_contours::<i32>(&binary)
        .iter()
        .filter_map(bounding_rect)
        .map(|r| Rect::new(r.left, r.top + top as i32, r.right, r.bottom + top as i32))
        .filter(|r| constraints.accepts(r, (w, h)))
        .collect();

    bars.sort_by(|a, b| b.width().cmp(&a.width()).then(a.top.cmp(&b.top)));
    bars.dedup();
    bars
}

fn binarize(gray: &GrayImage) -> GrayImage {
    let level = otsu_level(gray);
    let mut out = gray.clone();
    for p in out.pixels_mut() {
        *p = Luma([if p.0[0] > level { 255 } else { 0 }]);
    }
    out
}

fn bounding_rect(contour: &Contour<i32>) -> Option<Rect> {
    let first = contour.points.first()?;
    let (mut l, mut t, mut r, mut b) = (first.x, first.y, first.x, first.y);
    for p in &contour.points {
        l = l.min(p.x);
        t = t.min(p.y);
        r = r.max(p.x);
        b = b.max(p.y);
    }
    Some(Rect::new(l, t, r + 1, b + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn screen_with_bar(fill: [u8; 3], bar: [u8; 3], rect: Rect) -> DynamicImage {
        let img = RgbImage::from_fn(540, 1200, |x, y| {
            if rect.contains(x, y) {
                Rgb(bar)
            } else {
                Rgb(fill)
            }
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_finds_gray_bar_on_white() {
        let bar = Rect::new(40, 60, 500, 120);
        let frame = screen_with_bar([255, 255, 255], [200, 200, 200], bar);
        let found = find_bars(&frame, Band::default(), &ShapeConstraints::default());
        assert!(!found.is_empty());
        let (cx, cy) = found[0].center();
        assert!(cx.abs_diff(270) <= 2, "cx was {cx}");
        assert!(cy.abs_diff(90) <= 2, "cy was {cy}");
    }

    #[test]
    fn test_finds_light_bar_on_dark() {
        let bar = Rect::new(30, 100, 510, 170);
        let frame = screen_with_bar([20, 120, 60], [250, 250, 250], bar);
        let found = find_bars(&frame, Band::default(), &ShapeConstraints::default());
        assert!(!found.is_empty());
        assert!(found[0].center().1.abs_diff(135) <= 2);
    }

    #[test]
    fn test_rejects_square_and_out_of_band() {
        // A square button fails the aspect ratio
        let square = screen_with_bar([255, 255, 255], [0, 0, 0], Rect::new(200, 50, 300, 150));
        assert!(find_bars(&square, Band::default(), &ShapeConstraints::default()).is_empty());

        // A bar below the band is never seen
        let low = screen_with_bar([255, 255, 255], [180, 180, 180], Rect::new(40, 900, 500, 960));
        assert!(find_bars(&low, Band::default(), &ShapeConstraints::default()).is_empty());
    }

    #[test]
    fn test_constraints() {
        let c = ShapeConstraints::default();
        assert!(c.accepts(&Rect::new(0, 0, 800, 100), (1080, 2400)));
        assert!(!c.accepts(&Rect::new(0, 0, 400, 100), (1080, 2400)));
        assert!(!c.accepts(&Rect::new(0, 0, 800, 300), (1080, 2400)));
        assert!(!c.accepts(&Rect::new(0, 0, 800, 10), (1080, 2400)));
    }
}
