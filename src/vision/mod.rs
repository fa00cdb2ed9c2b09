//! Vision primitives for locating targets on captured frames
//!
//! This module provides image analysis used when the UI tree cannot be
//! trusted, which is the normal case inside the mini-program's custom
//! renderer:
//!
//! - [`compare`] - SSIM / MSE scoring and template matching
//! - [`contour`] - binarize + contour search for wide, flat controls
//! - [`capture`] - per-device, per-day diagnostic screenshot storage

pub mod capture;
pub mod compare;
pub mod contour;

pub use capture::{ScreenshotRecord, ScreenshotStore};
pub use compare::{compare, template_match, template_match_scaled, Similarity, TemplateMatch};
pub use contour::{find_bars, Band, ShapeConstraints};
