//! The strategy cascade

use image::DynamicImage;

use super::request::{
    Attempt, AttemptOutcome, GridSearch, HitCheck, LocateRequest, LocateResult, Strategy,
};
use crate::config::Timeouts;
use crate::driver::{DeviceDriver, Key, Selector};
use crate::error::{FleetError, Result};
use crate::navigation::{pause, CancelToken};
use crate::vision::{compare, find_bars, template_match_scaled};

/// Map a fractional position to pixels on a screen of `size`
pub fn fraction_to_point(size: (u32, u32), frac: (f32, f32)) -> (u32, u32) {
    let x = (size.0 as f32 * frac.0.clamp(0.0, 1.0)).round() as u32;
    let y = (size.1 as f32 * frac.1.clamp(0.0, 1.0)).round() as u32;
    (x.min(size.0.saturating_sub(1)), y.min(size.1.saturating_sub(1)))
}

struct Hit {
    point: (u32, u32),
    confidence: Option<f32>,
    tapped: bool,
}

impl Hit {
    fn at(point: (u32, u32)) -> Self {
        Self {
            point,
            confidence: None,
            tapped: false,
        }
    }
}

type Probe = std::result::Result<Hit, String>;

/// Runs [`LocateRequest`]s against one device.
///
/// Strategies run in request order and the first hit ends the cascade.
/// Driver errors and cancellation abort it; any other strategy error is
/// recorded and the next strategy runs.
pub struct ScreenLocator<'a> {
    log_target: &'a str,
    timeouts: &'a Timeouts,
    cancel: &'a CancelToken,
}

impl<'a> ScreenLocator<'a> {
    pub fn new(log_target: &'a str, timeouts: &'a Timeouts, cancel: &'a CancelToken) -> Self {
        Self {
            log_target,
            timeouts,
            cancel,
        }
    }

    pub fn locate(&self, driver: &mut dyn DeviceDriver, request: &LocateRequest) -> Result<LocateResult> {
        let mut result = LocateResult::default();
        let mut size = None;

        for strategy in &request.strategies {
            self.cancel.check()?;
            let kind = strategy.kind();
            let outcome = match self.run(driver, strategy, &mut size) {
                Ok(probe) => probe,
                Err(e @ (FleetError::Driver(_) | FleetError::Cancelled)) => return Err(e),
                Err(e) => {
                    log::warn!(target: self.log_target, "{} strategy for '{}' failed: {}", kind, request.target, e);
                    result.attempts.push(Attempt {
                        strategy: kind,
                        outcome: AttemptOutcome::Error(e.to_string()),
                    });
                    continue;
                }
            };

            match outcome {
                Ok(hit) => {
                    log::info!(
                        target: self.log_target,
                        "Located '{}' by {} at ({}, {})",
                        request.target,
                        kind,
                        hit.point.0,
                        hit.point.1
                    );
                    result.attempts.push(Attempt {
                        strategy: kind,
                        outcome: AttemptOutcome::Hit,
                    });
                    result.found = true;
                    result.coordinates = Some(hit.point);
                    result.strategy = Some(kind);
                    result.confidence = hit.confidence;
                    result.tapped = hit.tapped;
                    return Ok(result);
                }
                Err(why) => {
                    log::debug!(target: self.log_target, "{} missed '{}': {}", kind, request.target, why);
                    result.attempts.push(Attempt {
                        strategy: kind,
                        outcome: AttemptOutcome::Miss(why),
                    });
                }
            }
        }

        log::warn!(
            target: self.log_target,
            "Could not locate '{}' ({})",
            request.target,
            result.describe()
        );
        Ok(result)
    }

    fn run(
        &self,
        driver: &mut dyn DeviceDriver,
        strategy: &Strategy,
        size: &mut Option<(u32, u32)>,
    ) -> Result<Probe> {
        match strategy {
            Strategy::Attribute {
                text,
                description,
                resource_ids,
                class_name,
            } => {
                let mut selectors = Vec::new();
                if let Some(text) = text {
                    let sel = Selector::text(text);
                    selectors.push(match class_name {
                        Some(class) => sel.and_class(class),
                        None => sel,
                    });
                }
                if let Some(desc) = description {
                    selectors.push(Selector::description(desc));
                }
                selectors.extend(resource_ids.iter().map(Selector::resource_id));

                let tree = driver.dump_ui_tree()?;
                Ok(selectors
                    .iter()
                    .filter_map(|sel| tree.find_all(sel).into_iter().find(|n| !n.bounds.is_empty()))
                    .map(|node| Hit::at(node.bounds.center()))
                    .next()
                    .ok_or_else(|| "no element matched".to_string()))
            }

            Strategy::Relative {
                container_class,
                child_class,
                index,
            } => {
                let tree = driver.dump_ui_tree()?;
                let Some(container) = tree.find(&Selector::class_name(container_class)) else {
                    return Ok(Err(format!("no {container_class}")));
                };
                let children = container.descendants_matching(&Selector::class_name(child_class));
                Ok(children
                    .get(*index)
                    .filter(|n| !n.bounds.is_empty())
                    .map(|n| Hit::at(n.bounds.center()))
                    .ok_or_else(|| format!("{} children, wanted index {}", children.len(), index)))
            }

            Strategy::Grid(grid) => {
                let size = screen_size(driver, size)?;
                self.grid(driver, grid, size)
            }

            Strategy::Contour { band, constraints } => {
                let frame = driver.capture()?;
                let bars = find_bars(&frame, *band, constraints);
                Ok(bars
                    .first()
                    .map(|r| Hit::at(r.center()))
                    .ok_or_else(|| "no bar matched the shape constraints".to_string()))
            }

            Strategy::Template {
                image,
                threshold,
                scale,
            } => {
                let frame = driver.capture()?;
                let found = template_match_scaled(&frame, image, *scale)?;
                if found.score >= *threshold {
                    Ok(Ok(Hit {
                        point: found.center(),
                        confidence: Some(found.score),
                        tapped: false,
                    }))
                } else {
                    Ok(Err(format!("best score {:.3} below {:.3}", found.score, threshold)))
                }
            }

            Strategy::Fixed { x, y } => {
                let size = screen_size(driver, size)?;
                Ok(Ok(Hit::at(fraction_to_point(size, (*x, *y)))))
            }
        }
    }

    fn grid(&self, driver: &mut dyn DeviceDriver, grid: &GridSearch, size: (u32, u32)) -> Result<Probe> {
        for (i, &pos) in grid.positions.iter().enumerate() {
            let point = fraction_to_point(size, pos);
            log::info!(target: self.log_target, "Trying grid position {}: ({}, {})", i + 1, point.0, point.1);
            if self.tap_and_check(driver, point, &grid.hit)? {
                return Ok(Ok(Hit {
                    point,
                    confidence: None,
                    tapped: true,
                }));
            }
        }

        if grid.post_scroll == 0 {
            return Ok(Err(format!("{} positions missed", grid.positions.len())));
        }

        log::info!(target: self.log_target, "No grid hit, scrolling and retrying");
        let (from, to) = grid.scroll;
        driver.swipe(fraction_to_point(size, from), fraction_to_point(size, to))?;
        pause(self.timeouts.back(), self.cancel)?;

        for (i, &pos) in grid.positions.iter().take(grid.post_scroll).enumerate() {
            let point = fraction_to_point(size, pos);
            log::info!(
                target: self.log_target,
                "Trying grid position {} after scroll: ({}, {})",
                i + 1,
                point.0,
                point.1
            );
            if self.tap_and_check(driver, point, &grid.hit)? {
                return Ok(Ok(Hit {
                    point,
                    confidence: None,
                    tapped: true,
                }));
            }
        }

        let tried = grid.positions.len() + grid.post_scroll.min(grid.positions.len());
        Ok(Err(format!("{tried} positions missed")))
    }

    fn tap_and_check(&self, driver: &mut dyn DeviceDriver, point: (u32, u32), hit: &HitCheck) -> Result<bool> {
        self.cancel.check()?;
        let before: Option<DynamicImage> = match hit {
            HitCheck::FrameChanges { .. } => Some(driver.capture()?),
            HitCheck::LeavesActivity(_) => None,
        };

        driver.tap(point.0, point.1)?;
        pause(self.timeouts.settle(), self.cancel)?;

        match (hit, before) {
            (HitCheck::LeavesActivity(suffixes), _) => {
                let fg = driver.foreground_app()?;
                if !fg.activity_matches(suffixes) {
                    log::info!(target: self.log_target, "Activity changed to {}", fg.activity);
                    return Ok(true);
                }
                driver.press_key(Key::Back)?;
                pause(self.timeouts.back(), self.cancel)?;
                Ok(false)
            }
            (HitCheck::FrameChanges { max_ssim }, Some(before)) => {
                let after = driver.capture()?;
                Ok(compare(&before, &after).ssim < *max_ssim)
            }
            (HitCheck::FrameChanges { .. }, None) => Ok(false),
        }
    }
}

fn screen_size(driver: &mut dyn DeviceDriver, cache: &mut Option<(u32, u32)>) -> Result<(u32, u32)> {
    if let Some(size) = *cache {
        return Ok(size);
    }
    let size = driver.screen_size()?;
    *cache = Some(size);
    Ok(size)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::driver::{DriverCall, MockDriver, MockScreen, Rect, UiNode};
    use crate::locator::request::{StrategyKind, DEFAULT_TEMPLATE_THRESHOLD};
    use crate::vision::compare::tests::noise;
    use crate::vision::{Band, ShapeConstraints};

    const GRID_ACTIVITY: &str = ".plugin.appbrand.ui.AppBrandPluginUI";

    fn locate(driver: &mut MockDriver, request: &LocateRequest) -> Result<LocateResult> {
        let timeouts = Timeouts::instant();
        let cancel = CancelToken::new();
        ScreenLocator::new("test", &timeouts, &cancel).locate(driver, request)
    }

    fn discover_screen() -> MockScreen {
        MockScreen::new("com.tencent.mm", ".ui.LauncherUI").with_tree(
            UiNode::new("android.widget.FrameLayout")
                .with_bounds(Rect::new(0, 0, 1080, 2400))
                .with_child(
                    UiNode::new("android.widget.TabWidget")
                        .with_bounds(Rect::new(0, 2200, 1080, 2400))
                        .with_child(UiNode::new("android.widget.TextView").with_bounds(Rect::new(0, 2200, 270, 2400)))
                        .with_child(UiNode::new("android.widget.TextView").with_bounds(Rect::new(270, 2200, 540, 2400)))
                        .with_child(
                            UiNode::new("android.widget.TextView")
                                .with_resource_id("com.tencent.mm:id/tab_3")
                                .with_bounds(Rect::new(540, 2200, 810, 2400)),
                        )
                        .with_child(UiNode::new("android.widget.TextView").with_bounds(Rect::new(810, 2200, 1080, 2400))),
                ),
        )
    }

    fn grid_strategy() -> Strategy {
        Strategy::Grid(GridSearch::new(
            vec![(0.25, 0.4), (0.5, 0.4), (0.25, 0.25), (0.5, 0.25)],
            HitCheck::LeavesActivity(vec![GRID_ACTIVITY.to_string()]),
        ))
    }

    fn full_cascade(text: &str) -> LocateRequest {
        LocateRequest::new("discover")
            .then(Strategy::text(text))
            .then(Strategy::Relative {
                container_class: "android.widget.TabWidget".into(),
                child_class: "android.widget.TextView".into(),
                index: 2,
            })
            .then(grid_strategy())
            .then(Strategy::Contour {
                band: Band::default(),
                constraints: ShapeConstraints::default(),
            })
            .then(Strategy::template(Arc::new(DynamicImage::ImageLuma8(noise(20, 20, 1)))))
    }

    #[test]
    fn test_attribute_hit_short_circuits() {
        let screen = MockScreen::new("com.tencent.mm", ".ui.LauncherUI").with_tree(
            UiNode::new("android.widget.FrameLayout").with_child(
                UiNode::new("android.widget.TextView")
                    .with_text("发现")
                    .with_bounds(Rect::new(540, 2200, 810, 2400)),
            ),
        );
        let mut driver = MockDriver::new(1080, 2400).screen("main", screen).start_at("main");
        let handle = driver.handle();

        let result = locate(&mut driver, &full_cascade("发现")).unwrap();
        assert!(result.found);
        assert_eq!(result.strategy, Some(StrategyKind::Attribute));
        assert_eq!(result.coordinates, Some((675, 2300)));
        assert_eq!(result.tried(), vec![StrategyKind::Attribute]);
        assert_eq!(handle.calls(), vec![DriverCall::DumpUiTree]);
    }

    #[test]
    fn test_falls_through_to_relative() {
        let mut driver = MockDriver::new(1080, 2400).screen("main", discover_screen()).start_at("main");
        let handle = driver.handle();

        let result = locate(&mut driver, &full_cascade("发现")).unwrap();
        assert_eq!(result.strategy, Some(StrategyKind::Relative));
        assert_eq!(result.coordinates, Some((675, 2300)));
        assert_eq!(result.tried(), vec![StrategyKind::Attribute, StrategyKind::Relative]);
        assert!(handle.taps().is_empty());
    }

    #[test]
    fn test_resource_id_candidates() {
        let mut driver = MockDriver::new(1080, 2400).screen("main", discover_screen()).start_at("main");
        let request = LocateRequest::new("discover").then(Strategy::Attribute {
            text: Some("发现".into()),
            description: Some("发现".into()),
            resource_ids: vec!["com.tencent.mm:id/discover_tab".into(), "com.tencent.mm:id/tab_3".into()],
            class_name: None,
        });
        let result = locate(&mut driver, &request).unwrap();
        assert_eq!(result.coordinates, Some((675, 2300)));
    }

    #[test]
    fn test_grid_backs_out_of_misses() {
        let mut driver = MockDriver::new(1080, 2400)
            .screen("grid", MockScreen::new("com.tencent.mm", GRID_ACTIVITY))
            .screen("app", MockScreen::new("com.tencent.mm", ".plugin.appbrand.ui.AppBrandUI01"))
            .start_at("grid")
            .on_tap("grid", Rect::new(500, 900, 580, 1020), "app");
        let handle = driver.handle();

        let result = locate(&mut driver, &LocateRequest::new("applet").then(grid_strategy())).unwrap();
        assert!(result.found && result.tapped);
        assert_eq!(result.coordinates, Some((540, 960)));
        assert_eq!(handle.taps(), vec![(270, 960), (540, 960)]);
        assert_eq!(handle.count(|c| *c == DriverCall::PressKey(Key::Back)), 1);
        assert_eq!(handle.current_screen(), "app");
    }

    #[test]
    fn test_grid_retries_after_scroll() {
        let mut driver = MockDriver::new(1080, 2400)
            .screen("grid", MockScreen::new("com.tencent.mm", GRID_ACTIVITY))
            .screen("scrolled", MockScreen::new("com.tencent.mm", GRID_ACTIVITY))
            .screen("app", MockScreen::new("com.tencent.mm", ".plugin.appbrand.ui.AppBrandUI"))
            .start_at("grid")
            .on_swipe("grid", "scrolled")
            .on_tap("scrolled", Rect::new(200, 500, 340, 700), "app");
        let handle = driver.handle();

        let result = locate(&mut driver, &LocateRequest::new("applet").then(grid_strategy())).unwrap();
        assert!(result.found);
        assert_eq!(result.coordinates, Some((270, 600)));
        // Four positions, one scroll, then the first three again until the third hits
        assert_eq!(handle.taps().len(), 7);
        assert_eq!(handle.count(|c| matches!(c, DriverCall::Swipe(..))), 1);
    }

    #[test]
    fn test_grid_exhausted() {
        let mut driver = MockDriver::new(1080, 2400)
            .screen("grid", MockScreen::new("com.tencent.mm", GRID_ACTIVITY))
            .start_at("grid");
        let handle = driver.handle();

        let result = locate(&mut driver, &LocateRequest::new("applet").then(grid_strategy())).unwrap();
        assert!(!result.found);
        assert_eq!(handle.taps().len(), 4 + 3);
        assert!(matches!(result.attempts[0].outcome, AttemptOutcome::Miss(_)));
    }

    #[test]
    fn test_grid_frame_change_check() {
        let changed = DynamicImage::ImageLuma8(noise(540, 1200, 9));
        let mut driver = MockDriver::new(540, 1200)
            .screen("grid", MockScreen::new("com.tencent.mm", GRID_ACTIVITY))
            .screen("app", MockScreen::new("com.tencent.mm", GRID_ACTIVITY).with_frame(changed))
            .start_at("grid")
            .on_tap("grid", Rect::new(100, 400, 170, 560), "app");

        let grid = GridSearch::new(vec![(0.25, 0.4)], HitCheck::FrameChanges { max_ssim: 0.9 });
        let result = locate(&mut driver, &LocateRequest::new("applet").then(Strategy::Grid(grid))).unwrap();
        assert!(result.found);
    }

    #[test]
    fn test_contour_finds_search_bar() {
        let frame = image::RgbImage::from_fn(540, 1200, |x, y| {
            if (40..500).contains(&x) && (60..120).contains(&y) {
                image::Rgb([210, 210, 210])
            } else {
                image::Rgb([255, 255, 255])
            }
        });
        let screen = MockScreen::new("com.tencent.mm", ".plugin.appbrand.ui.AppBrandUI")
            .with_frame(DynamicImage::ImageRgb8(frame));
        let mut driver = MockDriver::new(540, 1200).screen("home", screen).start_at("home");

        let request = LocateRequest::new("search bar").then(Strategy::Contour {
            band: Band::default(),
            constraints: ShapeConstraints::default(),
        });
        let result = locate(&mut driver, &request).unwrap();
        let (x, y) = result.coordinates.unwrap();
        assert!(x.abs_diff(270) <= 2 && y.abs_diff(90) <= 2, "({x}, {y})");
    }

    #[test]
    fn test_template_hit_reports_confidence() {
        let frame = DynamicImage::ImageLuma8(noise(200, 160, 4));
        let icon = Arc::new(frame.crop_imm(60, 40, 40, 30));
        let mut driver = MockDriver::new(200, 160)
            .screen("grid", MockScreen::new("com.tencent.mm", GRID_ACTIVITY).with_frame(frame))
            .start_at("grid");

        let result = locate(&mut driver, &LocateRequest::new("icon").then(Strategy::template(icon))).unwrap();
        assert_eq!(result.strategy, Some(StrategyKind::Template));
        assert_eq!(result.coordinates, Some((80, 55)));
        assert!(result.confidence.unwrap() >= DEFAULT_TEMPLATE_THRESHOLD);
    }

    #[test]
    fn test_template_miss_and_error_fall_through() {
        let mut driver = MockDriver::new(100, 100)
            .screen("x", MockScreen::new("p", ".A").with_frame(DynamicImage::ImageLuma8(noise(100, 100, 1))))
            .start_at("x");
        let unrelated = Arc::new(DynamicImage::ImageLuma8(noise(30, 30, 77)));
        let oversized = Arc::new(DynamicImage::ImageLuma8(noise(300, 30, 2)));

        let request = LocateRequest::new("search")
            .then(Strategy::Template {
                image: unrelated,
                threshold: 0.99,
                scale: 1.0,
            })
            .then(Strategy::template(oversized))
            .then(Strategy::Fixed { x: 0.5, y: 0.08 });
        let result = locate(&mut driver, &request).unwrap();
        assert_eq!(result.strategy, Some(StrategyKind::Fixed));
        assert_eq!(result.coordinates, Some((50, 8)));
        assert!(matches!(result.attempts[0].outcome, AttemptOutcome::Miss(_)));
        assert!(matches!(result.attempts[1].outcome, AttemptOutcome::Error(_)));
    }

    #[test]
    fn test_driver_error_aborts() {
        let mut driver = MockDriver::new(1080, 2400).disconnect_after(0);
        let err = locate(&mut driver, &full_cascade("发现")).unwrap_err();
        assert!(err.is_driver_fatal());
    }

    #[test]
    fn test_cancelled_before_first_strategy() {
        let mut driver = MockDriver::new(1080, 2400);
        let handle = driver.handle();
        let timeouts = Timeouts::instant();
        let cancel = CancelToken::new();
        cancel.cancel();
        let res = ScreenLocator::new("test", &timeouts, &cancel).locate(&mut driver, &full_cascade("x"));
        assert!(matches!(res, Err(FleetError::Cancelled)));
        assert!(handle.calls().is_empty());
    }

    #[test]
    fn test_fraction_to_point_clamps() {
        assert_eq!(fraction_to_point((1080, 2400), (0.25, 0.4)), (270, 960));
        assert_eq!(fraction_to_point((1080, 2400), (1.0, 1.0)), (1079, 2399));
    }
}
