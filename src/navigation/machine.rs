//! Navigation state machine
//!
//! Walks one device from whatever it shows to the mini-program's home or
//! search page. Each transition locates its target, acts, waits for the UI
//! to settle and then verifies. `HostHome` and `HostMenu` must verify; later
//! screens are tolerant and defer to the [`VerificationPolicy`].

use std::sync::Arc;

use image::DynamicImage;

use super::screen::{LogicalScreen, Verification, VerificationPolicy};
use super::wait::{pause, poll_until, CancelToken};
use crate::config::{Heuristics, MiniprogramConfig, Timeouts};
use crate::driver::{DeviceDriver, Key, Selector};
use crate::error::{FleetError, Result};
use crate::locator::{
    fraction_to_point, GridSearch, HitCheck, LocateRequest, ScreenLocator, Strategy,
};
use crate::vision::ScreenshotStore;

/// Back presses that guarantee the host's main interface
const BASELINE_BACK_PRESSES: usize = 3;

/// Swipe used to reveal menu entries below the fold
const MENU_SCROLL: ((f32, f32), (f32, f32)) = ((0.5, 0.8), (0.5, 0.2));

/// Log target for everything done on behalf of `device`
pub fn device_log_target(device: &str) -> String {
    format!("miniprogram_fleet::device::{device}")
}

/// Per-device navigation state
pub struct Navigator {
    log_target: String,
    miniprogram: MiniprogramConfig,
    heuristics: Heuristics,
    timeouts: Timeouts,
    policy: VerificationPolicy,
    cancel: CancelToken,
    template: Option<Arc<DynamicImage>>,
    current: LogicalScreen,
}

impl Navigator {
    pub fn new(
        device: &str,
        miniprogram: MiniprogramConfig,
        heuristics: Heuristics,
        timeouts: Timeouts,
        policy: VerificationPolicy,
    ) -> Self {
        Self {
            log_target: device_log_target(device),
            miniprogram,
            heuristics,
            timeouts,
            policy,
            cancel: CancelToken::new(),
            template: None,
            current: LogicalScreen::Unknown,
        }
    }

    /// Reference image of the mini-program's grid icon
    pub fn with_template(mut self, template: Option<Arc<DynamicImage>>) -> Self {
        self.template = template;
        self
    }

    /// Last verified or accepted screen
    pub fn current(&self) -> LogicalScreen {
        self.current
    }

    pub fn miniprogram(&self) -> &MiniprogramConfig {
        &self.miniprogram
    }

    pub fn policy(&self) -> VerificationPolicy {
        self.policy
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn set_cancel_token(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    pub fn log_target(&self) -> &str {
        &self.log_target
    }

    fn locator(&self) -> ScreenLocator<'_> {
        ScreenLocator::new(&self.log_target, &self.timeouts, &self.cancel)
    }

    /// Run every transition from `HostHome` up to `target`.
    ///
    /// The host app is always re-baselined first, so this works from any
    /// starting screen. On error the navigator falls back to `Unknown`.
    pub fn navigate_to(
        &mut self,
        driver: &mut dyn DeviceDriver,
        store: &ScreenshotStore,
        target: LogicalScreen,
    ) -> Result<()> {
        let Some(depth) = target.depth() else {
            return Ok(());
        };
        for &screen in &LogicalScreen::PATH[..=depth] {
            if let Err(e) = self.advance(driver, store, screen) {
                self.current = LogicalScreen::Unknown;
                log::error!(target: self.log_target(), "Navigation to {} failed: {}", screen, e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Perform one transition and accept or reject it
    pub fn advance(
        &mut self,
        driver: &mut dyn DeviceDriver,
        store: &ScreenshotStore,
        screen: LogicalScreen,
    ) -> Result<()> {
        self.cancel.check()?;
        log::info!(target: self.log_target(), "Transition {} -> {}", self.current, screen);

        let verification = match screen {
            LogicalScreen::HostHome => self.enter_host_home(driver)?,
            LogicalScreen::HostMenu => self.open_host_menu(driver, store)?,
            LogicalScreen::MiniprogramGrid => self.open_grid(driver, store)?,
            LogicalScreen::MiniprogramHome => self.open_miniprogram(driver, store)?,
            LogicalScreen::SearchPage => self.open_search(driver, store)?,
            LogicalScreen::Unknown => return Ok(()),
        };

        let confirmed = verification.accept(screen, self.policy)?;
        if confirmed {
            log::info!(target: self.log_target(), "Reached {} ({})", screen, verification.detail());
        } else {
            log::warn!(
                target: self.log_target(),
                "Assuming {} without confirmation: {}",
                screen,
                verification.detail()
            );
        }
        self.current = screen;
        Ok(())
    }

    /// Type `keyword` into the search page and submit it.
    ///
    /// Navigates to the search page first unless already there.
    pub fn search(
        &mut self,
        driver: &mut dyn DeviceDriver,
        store: &ScreenshotStore,
        keyword: &str,
    ) -> Result<()> {
        if self.current != LogicalScreen::SearchPage {
            self.navigate_to(driver, store, LogicalScreen::SearchPage)?;
        }
        self.cancel.check()?;
        log::info!(target: self.log_target(), "Searching for '{}'", keyword);

        driver.clear_text()?;
        driver.send_keys(keyword)?;
        pause(self.timeouts.back(), &self.cancel)?;
        // Hosts disagree on which key submits, so send both
        driver.press_key(Key::Enter)?;
        pause(self.timeouts.back(), &self.cancel)?;
        driver.press_key(Key::Search)?;
        pause(
            std::time::Duration::from_secs(self.miniprogram.search_timeout_secs),
            &self.cancel,
        )?;
        Ok(())
    }

    fn enter_host_home(&self, driver: &mut dyn DeviceDriver) -> Result<Verification> {
        let package = self.miniprogram.package.clone();

        let fg = driver.foreground_app()?;
        if fg.package != package {
            log::info!(target: self.log_target(), "Starting {} (foreground was {})", package, fg.package);
            driver.app_start(&package)?;
            pause(self.timeouts.launch(), &self.cancel)?;
        }

        log::info!(target: self.log_target(), "Returning to the host main interface");
        driver.press_key(Key::Home)?;
        pause(self.timeouts.settle(), &self.cancel)?;
        driver.app_start(&package)?;
        pause(self.timeouts.launch(), &self.cancel)?;

        let found = poll_until(self.timeouts.page_load(), &self.timeouts.backoff(), &self.cancel, || {
            let fg = driver.foreground_app()?;
            Ok((fg.package == package).then_some(fg))
        })?;
        Ok(match found {
            Some(fg) => Verification::Confirmed(format!("{} in foreground ({})", fg.package, fg.activity)),
            None => Verification::Failed(format!("{package} did not come to the foreground")),
        })
    }

    fn open_host_menu(&self, driver: &mut dyn DeviceDriver, store: &ScreenshotStore) -> Result<Verification> {
        for _ in 0..BASELINE_BACK_PRESSES {
            driver.press_key(Key::Back)?;
            pause(self.timeouts.back(), &self.cancel)?;
        }

        let mut tabs = self.check_tabs(driver)?;
        if !tabs.is_confirmed() {
            let h = &self.heuristics;
            let tree = driver.dump_ui_tree()?;
            let selector = Selector::text(&h.home_tab_label).and_class(&h.tab_class);
            if let Some(tab) = tree.find(&selector).filter(|n| !n.bounds.is_empty()) {
                let (x, y) = tab.bounds.center();
                log::info!(target: self.log_target(), "Main interface not recognized, tapping '{}'", h.home_tab_label);
                driver.tap(x, y)?;
                pause(self.timeouts.settle(), &self.cancel)?;
                tabs = self.check_tabs(driver)?;
            }
        }
        if !tabs.is_confirmed() {
            self.diagnose(driver, store, "host_main_interface");
            return Ok(tabs);
        }

        let d = &self.heuristics.discover;
        let request = LocateRequest::new("discover tab")
            .then(Strategy::Attribute {
                text: Some(d.text.clone()),
                description: Some(d.description.clone()),
                resource_ids: d.resource_ids.clone(),
                class_name: None,
            })
            .then(Strategy::Relative {
                container_class: d.container_class.clone(),
                child_class: d.child_class.clone(),
                index: d.index,
            });
        let result = self.locator().locate(driver, &request)?;
        let Some((x, y)) = result.coordinates else {
            self.diagnose(driver, store, "discover_tab");
            return Err(FleetError::hard(LogicalScreen::HostMenu, "discover tab not found"));
        };
        driver.tap(x, y)?;
        pause(self.timeouts.settle(), &self.cancel)?;
        Ok(tabs)
    }

    fn check_tabs(&self, driver: &mut dyn DeviceDriver) -> Result<Verification> {
        let tabs = &self.heuristics.host_tabs;
        let mut missing: Vec<String> = Vec::new();
        let found = poll_until(self.timeouts.page_load(), &self.timeouts.backoff(), &self.cancel, || {
            let tree = driver.dump_ui_tree()?;
            missing = tabs
                .iter()
                .filter(|t| !tree.exists(&Selector::text(t.as_str())))
                .cloned()
                .collect();
            Ok(missing.is_empty().then_some(()))
        })?;
        Ok(match found {
            Some(()) => Verification::Confirmed(format!("all {} tabs visible", tabs.len())),
            None => Verification::Inconclusive(format!("missing tabs: {}", missing.join(", "))),
        })
    }

    fn open_grid(&self, driver: &mut dyn DeviceDriver, store: &ScreenshotStore) -> Result<Verification> {
        let h = &self.heuristics;
        let request = LocateRequest::new("mini-program entry").then(Strategy::text(&h.miniprogram_entry_text));
        let locator = self.locator();
        let size = driver.screen_size()?;

        let mut entry = None;
        for attempt in 0..=h.entry_scroll_attempts {
            if attempt > 0 {
                log::info!(
                    target: self.log_target(),
                    "'{}' not visible, scrolling ({}/{})",
                    h.miniprogram_entry_text,
                    attempt,
                    h.entry_scroll_attempts
                );
                let (from, to) = MENU_SCROLL;
                driver.swipe(fraction_to_point(size, from), fraction_to_point(size, to))?;
                pause(self.timeouts.back(), &self.cancel)?;
            }
            if let Some(point) = locator.locate(driver, &request)?.coordinates {
                entry = Some(point);
                break;
            }
        }

        let Some((x, y)) = entry else {
            self.diagnose(driver, store, "miniprogram_entry");
            return Err(FleetError::hard(
                LogicalScreen::MiniprogramGrid,
                format!(
                    "'{}' not found after {} scrolls",
                    h.miniprogram_entry_text, h.entry_scroll_attempts
                ),
            ));
        };

        driver.tap(x, y)?;
        log::info!(target: self.log_target(), "Waiting for the mini-program grid to load");
        let signal = poll_until(self.timeouts.grid_load(), &self.timeouts.backoff(), &self.cancel, || {
            self.grid_signal(driver)
        })?;
        pause(self.timeouts.settle(), &self.cancel)?;
        Ok(match signal {
            Some(s) => Verification::Confirmed(s),
            None => Verification::Inconclusive("mini-program grid not recognized".into()),
        })
    }

    fn grid_signal(&self, driver: &mut dyn DeviceDriver) -> Result<Option<String>> {
        let h = &self.heuristics;
        let fg = driver.foreground_app()?;
        if fg.activity_matches(&h.grid_activity_suffixes) {
            return Ok(Some(format!("activity {}", fg.activity)));
        }
        let tree = driver.dump_ui_tree()?;
        Ok(h.grid_texts
            .iter()
            .find(|t| tree.exists(&Selector::text(t.as_str())))
            .map(|t| format!("text '{t}'")))
    }

    fn open_miniprogram(&self, driver: &mut dyn DeviceDriver, store: &ScreenshotStore) -> Result<Verification> {
        let h = &self.heuristics;
        let mp = &self.miniprogram;

        let mut request = LocateRequest::new(mp.name.clone()).then(Strategy::text(&mp.name));
        let fg = driver.foreground_app()?;
        if fg.activity_matches(&h.grid_activity_suffixes) {
            request = request.then(Strategy::Grid(
                GridSearch::new(
                    h.grid_positions.clone(),
                    HitCheck::LeavesActivity(h.grid_activity_suffixes.clone()),
                )
                .with_post_scroll(h.post_scroll_positions),
            ));
        } else {
            log::info!(
                target: self.log_target(),
                "Not on the grid activity ({}), skipping grid probing",
                fg.activity
            );
        }
        if let Some(template) = &self.template {
            request = request.then(Strategy::Template {
                image: template.clone(),
                threshold: mp.template_threshold,
                scale: mp.template_scale,
            });
        }

        let result = self.locator().locate(driver, &request)?;
        let Some((x, y)) = result.coordinates else {
            self.diagnose(driver, store, "miniprogram_grid");
            return Ok(Verification::Failed(format!("no strategy opened '{}'", mp.name)));
        };
        if !result.tapped {
            driver.tap(x, y)?;
        }
        pause(self.timeouts.settle(), &self.cancel)?;

        let signal = poll_until(self.timeouts.page_load(), &self.timeouts.backoff(), &self.cancel, || {
            self.home_signal(driver)
        })?;
        Ok(match signal {
            Some(s) => Verification::Confirmed(s),
            None => Verification::Inconclusive("no activity, anchor or text signal".into()),
        })
    }

    /// Activity suffix, then text anchors, then any visible text
    fn home_signal(&self, driver: &mut dyn DeviceDriver) -> Result<Option<String>> {
        let h = &self.heuristics;
        let mp = &self.miniprogram;

        let fg = driver.foreground_app()?;
        if fg.activity_matches(&h.home_activity_suffixes) {
            return Ok(Some(format!("activity {}", fg.activity)));
        }
        if fg.activity_matches(&h.grid_activity_suffixes) || fg.package != mp.package {
            return Ok(None);
        }

        let tree = driver.dump_ui_tree()?;
        let anchor = std::iter::once(&mp.name)
            .chain(mp.anchors.iter())
            .find(|a| tree.exists(&Selector::text(a.as_str())));
        if let Some(a) = anchor {
            return Ok(Some(format!("anchor '{a}'")));
        }
        let texts = tree.texts();
        Ok((!texts.is_empty()).then(|| format!("{} visible texts", texts.len())))
    }

    fn open_search(&self, driver: &mut dyn DeviceDriver, store: &ScreenshotStore) -> Result<Verification> {
        let h = &self.heuristics;
        let request = LocateRequest::new("search bar")
            .then(Strategy::Contour {
                band: h.search_bar.band,
                constraints: h.search_bar.constraints,
            })
            .then(Strategy::Fixed {
                x: h.search_affordance.0,
                y: h.search_affordance.1,
            });
        let result = self.locator().locate(driver, &request)?;
        let Some((x, y)) = result.coordinates else {
            return Ok(Verification::Failed("search affordance not located".into()));
        };
        driver.tap(x, y)?;
        pause(self.timeouts.settle(), &self.cancel)?;

        let signal = poll_until(self.timeouts.page_load(), &self.timeouts.backoff(), &self.cancel, || {
            let tree = driver.dump_ui_tree()?;
            if let Some(t) = h.cancel_texts.iter().find(|t| tree.exists(&Selector::text(t.as_str()))) {
                return Ok(Some(format!("cancel control '{t}'")));
            }
            Ok(h.input_classes
                .iter()
                .find(|c| tree.exists(&Selector::class_name(c.as_str())))
                .map(|c| format!("input {c}")))
        })?;

        Ok(match signal {
            Some(s) => Verification::Confirmed(s),
            None => {
                self.save_frame(driver, store, "search_unverified");
                Verification::Inconclusive("no cancel control or text input".into())
            }
        })
    }

    /// Save a frame and log a summary of the UI tree
    fn diagnose(&self, driver: &mut dyn DeviceDriver, store: &ScreenshotStore, label: &str) {
        self.save_frame(driver, store, label);
        match driver.dump_ui_tree() {
            Ok(tree) => log::info!(target: self.log_target(), "UI tree at {}: {}", label, tree.summary(5)),
            Err(e) => log::warn!(target: self.log_target(), "Could not dump UI tree at {}: {}", label, e),
        }
    }

    fn save_frame(&self, driver: &mut dyn DeviceDriver, store: &ScreenshotStore, label: &str) {
        let saved = driver
            .capture()
            .map_err(FleetError::from)
            .and_then(|frame| store.save(&frame, label, self.current));
        match saved {
            Ok(Some(path)) => log::info!(target: self.log_target(), "Diagnostic screenshot {}", path.display()),
            Ok(None) => {}
            Err(e) => log::warn!(target: self.log_target(), "Diagnostic screenshot failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::ANY_SCREEN;
    use crate::driver::{DriverCall, MockDriver, MockScreen, Rect, UiNode};

    const PKG: &str = "com.tencent.mm";

    fn navigator(policy: VerificationPolicy) -> Navigator {
        let mp = MiniprogramConfig {
            search_timeout_secs: 0,
            ..Default::default()
        };
        Navigator::new("test", mp, Heuristics::default(), Timeouts::instant(), policy)
    }

    fn tab_bar() -> UiNode {
        let labels = ["微信", "通讯录", "发现", "我"];
        let mut bar = UiNode::new("android.widget.TabWidget").with_bounds(Rect::new(0, 2200, 1080, 2400));
        for (i, label) in labels.iter().enumerate() {
            let left = i as i32 * 270;
            bar = bar.with_child(
                UiNode::new("android.widget.TextView")
                    .with_text(*label)
                    .with_bounds(Rect::new(left, 2200, left + 270, 2400)),
            );
        }
        bar
    }

    /// Host app whose launch lands on `entry`
    fn host(driver: MockDriver, entry: &str) -> MockDriver {
        driver
            .screen(
                "home",
                MockScreen::new(PKG, ".ui.LauncherUI").with_tree(UiNode::new("android.widget.FrameLayout").with_child(tab_bar())),
            )
            .on_key(ANY_SCREEN, Key::Home, "launcher")
            .on_app_start(ANY_SCREEN, PKG, entry)
    }

    #[test]
    fn test_host_home_fails_when_app_never_starts() {
        let mut driver = MockDriver::new(1080, 2400);
        let store = ScreenshotStore::disabled("test");
        let mut nav = navigator(VerificationPolicy::Lenient);

        let err = nav.navigate_to(&mut driver, &store, LogicalScreen::HostHome).unwrap_err();
        assert!(matches!(err, FleetError::NavigationHard { screen: LogicalScreen::HostHome, .. }));
        assert_eq!(nav.current(), LogicalScreen::Unknown);
    }

    #[test]
    fn test_host_home_launches_and_verifies() {
        let mut driver = host(MockDriver::new(1080, 2400), "home");
        let handle = driver.handle();
        let store = ScreenshotStore::disabled("test");
        let mut nav = navigator(VerificationPolicy::Lenient);

        nav.navigate_to(&mut driver, &store, LogicalScreen::HostHome).unwrap();
        assert_eq!(nav.current(), LogicalScreen::HostHome);
        // Launched because the launcher was showing, then home + relaunch
        assert_eq!(handle.count(|c| matches!(c, DriverCall::AppStart(_))), 2);
        assert_eq!(handle.count(|c| *c == DriverCall::PressKey(Key::Home)), 1);
    }

    #[test]
    fn test_host_menu_corrective_tap() {
        // A chat screen hides the tab bar until the 微信 label is tapped
        let chat = MockScreen::new(PKG, ".ui.LauncherUI").with_tree(
            UiNode::new("android.widget.FrameLayout").with_child(
                UiNode::new("android.widget.TextView")
                    .with_text("微信")
                    .with_bounds(Rect::new(0, 0, 200, 100)),
            ),
        );
        let mut driver = host(MockDriver::new(1080, 2400), "chat")
            .screen("chat", chat)
            .on_tap("chat", Rect::new(0, 0, 200, 100), "home")
            .on_tap("home", Rect::new(540, 2200, 810, 2400), "discover")
            .screen("discover", MockScreen::new(PKG, ".ui.LauncherUI"));
        let handle = driver.handle();
        let store = ScreenshotStore::disabled("test");
        let mut nav = navigator(VerificationPolicy::Lenient);

        nav.navigate_to(&mut driver, &store, LogicalScreen::HostMenu).unwrap();
        assert_eq!(nav.current(), LogicalScreen::HostMenu);
        assert_eq!(handle.current_screen(), "discover");
        assert_eq!(handle.count(|c| *c == DriverCall::PressKey(Key::Back)), BASELINE_BACK_PRESSES);
    }

    #[test]
    fn test_host_menu_without_tabs_is_hard_failure() {
        let mut driver = MockDriver::new(1080, 2400)
            .screen("blank", MockScreen::new(PKG, ".ui.LauncherUI"))
            .on_app_start(ANY_SCREEN, PKG, "blank");
        let store = ScreenshotStore::disabled("test");
        let mut nav = navigator(VerificationPolicy::Lenient);

        let err = nav.navigate_to(&mut driver, &store, LogicalScreen::HostMenu).unwrap_err();
        assert!(matches!(err, FleetError::NavigationHard { screen: LogicalScreen::HostMenu, .. }));
        assert_eq!(nav.current(), LogicalScreen::Unknown);
    }

    #[test]
    fn test_entry_not_found_after_scrolls_is_hard() {
        let mut driver = host(MockDriver::new(1080, 2400), "home")
            .on_tap("home", Rect::new(540, 2200, 810, 2400), "discover")
            .screen("discover", MockScreen::new(PKG, ".ui.LauncherUI"));
        let handle = driver.handle();
        let store = ScreenshotStore::disabled("test");
        let mut nav = navigator(VerificationPolicy::Lenient);

        let err = nav.navigate_to(&mut driver, &store, LogicalScreen::MiniprogramGrid).unwrap_err();
        assert!(matches!(
            err,
            FleetError::NavigationHard { screen: LogicalScreen::MiniprogramGrid, .. }
        ));
        assert_eq!(handle.count(|c| matches!(c, DriverCall::Swipe(..))), 3);
    }

    #[test]
    fn test_unconfirmed_miniprogram_follows_policy() {
        // Grid where no position opens anything
        let build = || {
            let menu = MockScreen::new(PKG, ".ui.LauncherUI").with_tree(
                UiNode::new("android.widget.FrameLayout").with_child(
                    UiNode::new("android.widget.TextView")
                        .with_text("小程序")
                        .with_bounds(Rect::new(0, 1000, 1080, 1100)),
                ),
            );
            host(MockDriver::new(1080, 2400), "home")
                .on_tap("home", Rect::new(540, 2200, 810, 2400), "discover")
                .screen("discover", menu)
                .on_tap("discover", Rect::new(0, 1000, 1080, 1100), "grid")
                .screen("grid", MockScreen::new(PKG, ".plugin.appbrand.ui.AppBrandPluginUI"))
        };
        let store = ScreenshotStore::disabled("test");

        let mut lenient = navigator(VerificationPolicy::Lenient);
        let mut driver = build();
        lenient.navigate_to(&mut driver, &store, LogicalScreen::MiniprogramHome).unwrap();
        assert_eq!(lenient.current(), LogicalScreen::MiniprogramHome);

        let mut strict = navigator(VerificationPolicy::Strict);
        let mut driver = build();
        let err = strict.navigate_to(&mut driver, &store, LogicalScreen::MiniprogramHome).unwrap_err();
        assert!(matches!(
            err,
            FleetError::NavigationSoft { screen: LogicalScreen::MiniprogramHome, .. }
        ));
        assert_eq!(strict.current(), LogicalScreen::Unknown);
    }

    #[test]
    fn test_driver_error_is_never_tolerated() {
        let mut driver = host(MockDriver::new(1080, 2400), "home").disconnect_after(4);
        let store = ScreenshotStore::disabled("test");
        let mut nav = navigator(VerificationPolicy::Lenient);
        let err = nav.navigate_to(&mut driver, &store, LogicalScreen::SearchPage).unwrap_err();
        assert!(err.is_driver_fatal());
    }

    #[test]
    fn test_cancelled_navigator_does_nothing() {
        let mut driver = host(MockDriver::new(1080, 2400), "home");
        let handle = driver.handle();
        let store = ScreenshotStore::disabled("test");
        let mut nav = navigator(VerificationPolicy::Lenient);
        nav.cancel_token().cancel();

        assert!(matches!(
            nav.navigate_to(&mut driver, &store, LogicalScreen::SearchPage),
            Err(FleetError::Cancelled)
        ));
        assert!(handle.calls().is_empty());
    }

    #[test]
    fn test_log_target() {
        assert_eq!(device_log_target("mumu_1"), "miniprogram_fleet::device::mumu_1");
    }
}
