//! Screen locator
//!
//! Resolves a named on-screen target to a tap coordinate. The mini-program
//! renderer hides most UI-tree attributes, so a request carries several
//! strategies that run in order until one hits:
//!
//! 1. attribute match on the UI tree
//! 2. relative position inside a known container
//! 3. grid probing with a screen-change check
//! 4. contour detection of wide, flat controls
//! 5. template matching against a reference image
//!
//! Every strategy that ran is recorded in the [`LocateResult`].

pub mod cascade;
pub mod request;

pub use cascade::{fraction_to_point, ScreenLocator};
pub use request::{
    Attempt, AttemptOutcome, GridSearch, HitCheck, LocateRequest, LocateResult, Strategy,
    StrategyKind, DEFAULT_TEMPLATE_THRESHOLD,
};
