//! Locate requests, strategies and results

use std::sync::Arc;

use image::DynamicImage;

use crate::vision::{Band, ShapeConstraints};

/// Default minimum normalized cross-correlation for a template hit
pub const DEFAULT_TEMPLATE_THRESHOLD: f32 = 0.8;

/// Which kind of strategy produced an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    Attribute,
    Relative,
    Grid,
    Contour,
    Template,
    Fixed,
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::Attribute => "attribute",
            StrategyKind::Relative => "relative",
            StrategyKind::Grid => "grid",
            StrategyKind::Contour => "contour",
            StrategyKind::Template => "template",
            StrategyKind::Fixed => "fixed",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How the grid strategy decides a tap opened something
#[derive(Debug, Clone, PartialEq)]
pub enum HitCheck {
    /// Hit when the foreground activity no longer ends with any of these.
    /// A miss is undone with a back press.
    LeavesActivity(Vec<String>),
    /// Hit when the frame's structural similarity to the pre-tap frame drops
    /// below this value
    FrameChanges { max_ssim: f64 },
}

/// Grid probing parameters
#[derive(Debug, Clone, PartialEq)]
pub struct GridSearch {
    /// Fractions of (width, height), most likely first
    pub positions: Vec<(f32, f32)>,
    /// Leading positions retried after one scroll
    pub post_scroll: usize,
    /// Scroll gesture in screen fractions
    pub scroll: ((f32, f32), (f32, f32)),
    pub hit: HitCheck,
}

impl GridSearch {
    pub fn new(positions: Vec<(f32, f32)>, hit: HitCheck) -> Self {
        Self {
            positions,
            post_scroll: 3,
            scroll: ((0.5, 0.8), (0.5, 0.3)),
            hit,
        }
    }

    pub fn with_post_scroll(mut self, n: usize) -> Self {
        self.post_scroll = n;
        self
    }
}

/// One way of finding a target
#[derive(Debug, Clone)]
pub enum Strategy {
    /// UI-tree lookup: exact text, then description, then each resource id
    Attribute {
        text: Option<String>,
        description: Option<String>,
        resource_ids: Vec<String>,
        /// Restricts the text lookup to this class
        class_name: Option<String>,
    },
    /// The `index`-th `child_class` element inside the first `container_class`
    Relative {
        container_class: String,
        child_class: String,
        index: usize,
    },
    /// Tap fractional positions until one opens something. This strategy taps
    /// by itself.
    Grid(GridSearch),
    /// Wide flat control inside a horizontal band
    Contour {
        band: Band,
        constraints: ShapeConstraints,
    },
    /// Reference image matched against the frame
    Template {
        image: Arc<DynamicImage>,
        threshold: f32,
        /// Downscale factor applied before matching, 1.0 for full resolution
        scale: f32,
    },
    /// Fixed fractional coordinate, always found
    Fixed { x: f32, y: f32 },
}

impl Strategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Attribute { .. } => StrategyKind::Attribute,
            Strategy::Relative { .. } => StrategyKind::Relative,
            Strategy::Grid(_) => StrategyKind::Grid,
            Strategy::Contour { .. } => StrategyKind::Contour,
            Strategy::Template { .. } => StrategyKind::Template,
            Strategy::Fixed { .. } => StrategyKind::Fixed,
        }
    }

    /// Attribute lookup by exact text only
    pub fn text(text: impl Into<String>) -> Self {
        Strategy::Attribute {
            text: Some(text.into()),
            description: None,
            resource_ids: Vec::new(),
            class_name: None,
        }
    }

    pub fn template(image: Arc<DynamicImage>) -> Self {
        Strategy::Template {
            image,
            threshold: DEFAULT_TEMPLATE_THRESHOLD,
            scale: 1.0,
        }
    }
}

/// A named target and the strategies to try, in order
#[derive(Debug, Clone)]
pub struct LocateRequest {
    pub target: String,
    pub strategies: Vec<Strategy>,
}

impl LocateRequest {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            strategies: Vec::new(),
        }
    }

    pub fn then(mut self, strategy: Strategy) -> Self {
        self.strategies.push(strategy);
        self
    }
}

/// What happened when one strategy ran
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Hit,
    Miss(String),
    /// A non-fatal error, e.g. a template larger than the screen
    Error(String),
}

/// Diagnostic record of one strategy run
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub strategy: StrategyKind,
    pub outcome: AttemptOutcome,
}

/// Result of a cascade
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LocateResult {
    pub found: bool,
    pub coordinates: Option<(u32, u32)>,
    pub strategy: Option<StrategyKind>,
    pub confidence: Option<f32>,
    /// The winning strategy already tapped the coordinate
    pub tapped: bool,
    pub attempts: Vec<Attempt>,
}

impl LocateResult {
    /// Strategies that ran, in order
    pub fn tried(&self) -> Vec<StrategyKind> {
        self.attempts.iter().map(|a| a.strategy).collect()
    }

    /// One-line summary for logs
    pub fn describe(&self) -> String {
        self.attempts
            .iter()
            .map(|a| match &a.outcome {
                AttemptOutcome::Hit => format!("{}: hit", a.strategy),
                AttemptOutcome::Miss(why) => format!("{}: {}", a.strategy, why),
                AttemptOutcome::Error(e) => format!("{}: error {}", a.strategy, e),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}
