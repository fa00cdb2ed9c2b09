//! Shared fixtures: a scripted host app and fleet builders

#![allow(dead_code)]

use std::sync::Arc;

use image::{DynamicImage, Rgb, RgbImage};
use miniprogram_fleet::config::Timeouts;
use miniprogram_fleet::driver::mock::ANY_SCREEN;
use miniprogram_fleet::driver::{Key, MockDriver, MockScreen, MockTransport, Rect, UiNode};
use miniprogram_fleet::{FleetConfig, FleetOrchestrator};

pub const PKG: &str = "com.tencent.mm";
pub const WIDTH: u32 = 1080;
pub const HEIGHT: u32 = 2400;

/// Header search bar of the mini-program home page
pub const SEARCH_BAR: Rect = Rect {
    left: 80,
    top: 150,
    right: 1000,
    bottom: 260,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn text(label: &str, bounds: Rect) -> UiNode {
    UiNode::new("android.widget.TextView")
        .with_text(label)
        .with_bounds(bounds)
}

fn home_screen() -> MockScreen {
    let mut bar = UiNode::new("android.widget.TabWidget").with_bounds(Rect::new(0, 2200, 1080, 2400));
    for (i, label) in ["微信", "通讯录", "发现", "我"].iter().enumerate() {
        let left = i as i32 * 270;
        bar = bar.with_child(text(label, Rect::new(left, 2200, left + 270, 2400)));
    }
    MockScreen::new(PKG, ".ui.LauncherUI").with_tree(UiNode::new("android.widget.FrameLayout").with_child(bar))
}

fn discover_screen() -> MockScreen {
    MockScreen::new(PKG, ".ui.LauncherUI").with_tree(
        UiNode::new("android.widget.FrameLayout")
            .with_child(text("朋友圈", Rect::new(0, 300, 1080, 400)))
            .with_child(text("小程序", Rect::new(0, 1000, 1080, 1100))),
    )
}

fn applet_frame() -> DynamicImage {
    let img = RgbImage::from_fn(WIDTH, HEIGHT, |x, y| {
        if SEARCH_BAR.contains(x, y) {
            Rgb([200, 200, 200])
        } else {
            Rgb([255, 255, 255])
        }
    });
    DynamicImage::ImageRgb8(img)
}

fn search_screen() -> MockScreen {
    MockScreen::new(PKG, ".plugin.appbrand.ui.AppBrandUI01").with_tree(
        UiNode::new("android.widget.FrameLayout")
            .with_child(UiNode::new("android.widget.EditText").with_bounds(Rect::new(80, 150, 900, 260)))
            .with_child(text("取消", Rect::new(900, 150, 1080, 260))),
    )
}

/// A phone with the host app installed, showing the launcher.
///
/// Launching the host lands on the chat list; the discover tab leads to the
/// mini-program grid, whose second probe position opens the mini-program.
pub fn host_device() -> MockDriver {
    host_device_with_grid(true)
}

/// [`host_device`] whose grid opens nothing unless `opens` is set
pub fn host_device_with_grid(opens: bool) -> MockDriver {
    let driver = MockDriver::new(WIDTH, HEIGHT)
        .screen("home", home_screen())
        .screen("discover", discover_screen())
        .screen("grid", MockScreen::new(PKG, ".plugin.appbrand.ui.AppBrandPluginUI"))
        .screen(
            "applet",
            MockScreen::new(PKG, ".plugin.appbrand.ui.AppBrandUI01").with_frame(applet_frame()),
        )
        .screen("search", search_screen())
        .on_key(ANY_SCREEN, Key::Home, "launcher")
        .on_app_start(ANY_SCREEN, PKG, "home")
        .on_tap("home", Rect::new(540, 2200, 810, 2400), "discover")
        .on_tap("discover", Rect::new(0, 1000, 1080, 1100), "grid")
        .on_tap("applet", SEARCH_BAR, "search");
    if opens {
        driver.on_tap("grid", Rect::new(480, 900, 600, 1020), "applet")
    } else {
        driver
    }
}

/// Config with zero waits and no screenshots
pub fn config(auto_discovery: bool) -> FleetConfig {
    let mut config = FleetConfig::default();
    config.options.auto_discovery = auto_discovery;
    config.options.save_screenshots = false;
    config.options.device_timeout_secs = 10;
    config.timeouts = Timeouts::instant();
    config.default_miniprogram.search_timeout_secs = 0;
    config
}

pub fn fleet(config: FleetConfig, transport: MockTransport) -> FleetOrchestrator {
    FleetOrchestrator::new(config, Arc::new(transport)).expect("valid config")
}

/// Transport listing `count` scripted host devices
pub fn host_fleet_transport(count: usize) -> MockTransport {
    (0..count).fold(MockTransport::new(), |t, i| {
        t.with_driver(&format!("emulator-{}", 5554 + 2 * i), host_device)
    })
}
