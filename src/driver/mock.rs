//! Scriptable test doubles for the driver traits
//!
//! A [`MockDriver`] is a tiny screen graph: named screens, each with a UI tree,
//! a foreground app and an optional frame, plus transitions fired by taps,
//! key presses, swipes and app launches. Every call is appended to a shared
//! log so tests can inspect what the navigator did after the driver has been
//! moved into a session.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, Rgba, RgbaImage};
use parking_lot::Mutex;

use super::traits::{
    DeviceDriver, DeviceIdentity, DeviceListing, DeviceTransport, DriverResult, ForegroundApp, Key,
};
use super::uitree::{Rect, UiNode, UiTree};
use crate::error::DriverError;

/// Wildcard source screen for transitions
pub const ANY_SCREEN: &str = "*";

/// A recorded driver call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Capture,
    DumpUiTree,
    Tap(u32, u32),
    Swipe((u32, u32), (u32, u32)),
    SendKeys(String),
    ClearText,
    PressKey(Key),
    ForegroundApp,
    ScreenSize,
    AppStart(String),
    StopAutomationService,
}

/// What fires a mock transition
#[derive(Debug, Clone)]
pub enum MockTrigger {
    Tap(Rect),
    Key(Key),
    Swipe,
    AppStart(String),
}

impl MockTrigger {
    fn fires_on(&self, call: &DriverCall) -> bool {
        match (self, call) {
            (MockTrigger::Tap(rect), DriverCall::Tap(x, y)) => rect.contains(*x, *y),
            (MockTrigger::Key(k), DriverCall::PressKey(pressed)) => k == pressed,
            (MockTrigger::Swipe, DriverCall::Swipe(..)) => true,
            (MockTrigger::AppStart(p), DriverCall::AppStart(started)) => p == started,
            _ => false,
        }
    }
}

/// One screen of the mock device
#[derive(Debug, Clone)]
pub struct MockScreen {
    pub foreground: ForegroundApp,
    pub tree: UiTree,
    pub frame: Option<DynamicImage>,
}

impl MockScreen {
    pub fn new(package: impl Into<String>, activity: impl Into<String>) -> Self {
        Self {
            foreground: ForegroundApp::new(package, activity),
            tree: UiTree::new(UiNode::new("android.widget.FrameLayout")),
            frame: None,
        }
    }

    pub fn with_tree(mut self, root: UiNode) -> Self {
        self.tree = UiTree::new(root);
        self
    }

    pub fn with_frame(mut self, frame: DynamicImage) -> Self {
        self.frame = Some(frame);
        self
    }
}

#[derive(Debug)]
struct MockState {
    current: String,
    calls: Vec<DriverCall>,
}

/// Shared view into a mock driver that outlives the boxed driver
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Name of the screen the mock is currently showing
    pub fn current_screen(&self) -> String {
        self.state.lock().current.clone()
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&DriverCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn taps(&self) -> Vec<(u32, u32)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                DriverCall::Tap(x, y) => Some((*x, *y)),
                _ => None,
            })
            .collect()
    }
}

/// Mock device driver
pub struct MockDriver {
    size: (u32, u32),
    screens: HashMap<String, MockScreen>,
    transitions: Vec<(String, MockTrigger, String)>,
    state: Arc<Mutex<MockState>>,
    disconnect_after: Option<usize>,
    failing_teardown: bool,
    call_delay: Option<Duration>,
}

impl MockDriver {
    /// Create a mock with the given screen size, showing the launcher
    pub fn new(width: u32, height: u32) -> Self {
        let mut screens = HashMap::new();
        screens.insert(
            "launcher".to_string(),
            MockScreen::new("com.android.launcher3", ".Launcher"),
        );
        Self {
            size: (width, height),
            screens,
            transitions: Vec::new(),
            state: Arc::new(Mutex::new(MockState {
                current: "launcher".to_string(),
                calls: Vec::new(),
            })),
            disconnect_after: None,
            failing_teardown: false,
            call_delay: None,
        }
    }

    pub fn screen(mut self, name: impl Into<String>, screen: MockScreen) -> Self {
        self.screens.insert(name.into(), screen);
        self
    }

    pub fn start_at(self, name: impl Into<String>) -> Self {
        self.state.lock().current = name.into();
        self
    }

    pub fn on_tap(mut self, from: &str, rect: Rect, to: &str) -> Self {
        self.transitions
            .push((from.to_string(), MockTrigger::Tap(rect), to.to_string()));
        self
    }

    pub fn on_key(mut self, from: &str, key: Key, to: &str) -> Self {
        self.transitions
            .push((from.to_string(), MockTrigger::Key(key), to.to_string()));
        self
    }

    pub fn on_swipe(mut self, from: &str, to: &str) -> Self {
        self.transitions
            .push((from.to_string(), MockTrigger::Swipe, to.to_string()));
        self
    }

    pub fn on_app_start(mut self, from: &str, package: &str, to: &str) -> Self {
        self.transitions.push((
            from.to_string(),
            MockTrigger::AppStart(package.to_string()),
            to.to_string(),
        ));
        self
    }

    /// Every call after the first `n` fails with `Disconnected`
    pub fn disconnect_after(mut self, n: usize) -> Self {
        self.disconnect_after = Some(n);
        self
    }

    /// `stop_automation_service` fails
    pub fn failing_teardown(mut self) -> Self {
        self.failing_teardown = true;
        self
    }

    /// Sleep on every call, for timeout tests
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = Some(delay);
        self
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: self.state.clone(),
        }
    }

    fn record(&mut self, call: DriverCall) -> DriverResult<()> {
        if let Some(delay) = self.call_delay {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock();
        if let Some(limit) = self.disconnect_after {
            if state.calls.len() >= limit {
                return Err(DriverError::Disconnected("mock device unplugged".into()));
            }
        }

        let current = state.current.clone();
        let next = self
            .transitions
            .iter()
            .find(|(from, trigger, _)| {
                (from == ANY_SCREEN || *from == current) && trigger.fires_on(&call)
            })
            .map(|(_, _, to)| to.clone());
        if let Some(next) = next {
            state.current = next;
        }
        state.calls.push(call);
        Ok(())
    }

    fn current(&self) -> MockScreen {
        let name = self.state.lock().current.clone();
        self.screens
            .get(&name)
            .cloned()
            .unwrap_or_else(|| MockScreen::new("com.android.launcher3", ".Launcher"))
    }
}

impl DeviceDriver for MockDriver {
    fn capture(&mut self) -> DriverResult<DynamicImage> {
        self.record(DriverCall::Capture)?;
        let (w, h) = self.size;
        Ok(self.current().frame.unwrap_or_else(|| {
            DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([255, 255, 255, 255])))
        }))
    }

    fn dump_ui_tree(&mut self) -> DriverResult<UiTree> {
        self.record(DriverCall::DumpUiTree)?;
        Ok(self.current().tree)
    }

    fn tap(&mut self, x: u32, y: u32) -> DriverResult<()> {
        self.record(DriverCall::Tap(x, y))
    }

    fn swipe(&mut self, from: (u32, u32), to: (u32, u32)) -> DriverResult<()> {
        self.record(DriverCall::Swipe(from, to))
    }

    fn send_keys(&mut self, text: &str) -> DriverResult<()> {
        self.record(DriverCall::SendKeys(text.to_string()))
    }

    fn clear_text(&mut self) -> DriverResult<()> {
        self.record(DriverCall::ClearText)
    }

    fn press_key(&mut self, key: Key) -> DriverResult<()> {
        self.record(DriverCall::PressKey(key))
    }

    fn foreground_app(&mut self) -> DriverResult<ForegroundApp> {
        self.record(DriverCall::ForegroundApp)?;
        Ok(self.current().foreground)
    }

    fn screen_size(&mut self) -> DriverResult<(u32, u32)> {
        self.record(DriverCall::ScreenSize)?;
        Ok(self.size)
    }

    fn app_start(&mut self, package: &str) -> DriverResult<()> {
        self.record(DriverCall::AppStart(package.to_string()))
    }

    fn stop_automation_service(&mut self) -> DriverResult<()> {
        self.record(DriverCall::StopAutomationService)?;
        if self.failing_teardown {
            return Err(DriverError::Io("automation service did not stop".into()));
        }
        Ok(())
    }
}

type DriverFactory = Box<dyn Fn() -> MockDriver + Send + Sync>;

/// Mock transport with a fixed device list
#[derive(Default)]
pub struct MockTransport {
    listings: Vec<DeviceListing>,
    factories: HashMap<String, DriverFactory>,
    unreachable: HashSet<String>,
    list_error: Option<DriverError>,
    attempts: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A ready device backed by a default 1080x2400 mock driver
    pub fn with_device(self, serial: &str) -> Self {
        self.with_driver(serial, || MockDriver::new(1080, 2400))
    }

    /// A ready device whose driver is produced by `factory` on each connect
    pub fn with_driver<F>(mut self, serial: &str, factory: F) -> Self
    where
        F: Fn() -> MockDriver + Send + Sync + 'static,
    {
        self.listings.push(DeviceListing::new(serial, "device"));
        self.factories.insert(serial.to_string(), Box::new(factory));
        self
    }

    /// A device listed in a non-ready state, e.g. `offline`
    pub fn with_listing(mut self, serial: &str, state: &str) -> Self {
        self.listings.push(DeviceListing::new(serial, state));
        self
    }

    /// A ready device whose connect handshake fails
    pub fn with_unreachable(mut self, serial: &str) -> Self {
        self.listings.push(DeviceListing::new(serial, "device"));
        self.unreachable.insert(serial.to_string());
        self
    }

    /// Connect info that fails without being listed (static configs)
    pub fn refuse(mut self, connect_info: &str) -> Self {
        self.unreachable.insert(connect_info.to_string());
        self
    }

    /// Fail `list_devices`
    pub fn with_list_error(mut self, err: DriverError) -> Self {
        self.list_error = Some(err);
        self
    }

    /// Connect infos attempted so far, in order
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }
}

impl DeviceTransport for MockTransport {
    fn list_devices(&self) -> DriverResult<Vec<DeviceListing>> {
        match &self.list_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.listings.clone()),
        }
    }

    fn connect(&self, identity: &DeviceIdentity) -> DriverResult<Box<dyn DeviceDriver>> {
        self.attempts.lock().push(identity.connect_info.clone());
        if self.unreachable.contains(&identity.connect_info) {
            return Err(DriverError::Disconnected(format!(
                "{} refused the handshake",
                identity.connect_info
            )));
        }
        let driver = match self.factories.get(&identity.connect_info) {
            Some(factory) => factory(),
            None => MockDriver::new(1080, 2400),
        };
        Ok(Box::new(driver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_follow_triggers() {
        let mut driver = MockDriver::new(1080, 2400)
            .screen("a", MockScreen::new("pkg", ".A"))
            .screen("b", MockScreen::new("pkg", ".B"))
            .start_at("a")
            .on_tap("a", Rect::new(0, 0, 100, 100), "b")
            .on_key(ANY_SCREEN, Key::Back, "a");
        let handle = driver.handle();

        driver.tap(500, 500).unwrap();
        assert_eq!(handle.current_screen(), "a");
        driver.tap(50, 50).unwrap();
        assert_eq!(handle.current_screen(), "b");
        assert_eq!(driver.foreground_app().unwrap().activity, ".B");
        driver.press_key(Key::Back).unwrap();
        assert_eq!(handle.current_screen(), "a");
        assert_eq!(handle.taps(), vec![(500, 500), (50, 50)]);
    }

    #[test]
    fn test_disconnect_after() {
        let mut driver = MockDriver::new(10, 10).disconnect_after(1);
        assert!(driver.screen_size().is_ok());
        let err = driver.capture().unwrap_err();
        assert!(matches!(err, DriverError::Disconnected(_)));
    }

    #[test]
    fn test_transport_connect() {
        let transport = MockTransport::new()
            .with_device("emulator-5554")
            .with_unreachable("emulator-5556")
            .with_listing("emulator-5558", "offline");
        assert_eq!(transport.list_devices().unwrap().len(), 3);
        assert!(transport
            .connect(&DeviceIdentity::new("d1", "emulator-5554"))
            .is_ok());
        assert!(transport
            .connect(&DeviceIdentity::new("d2", "emulator-5556"))
            .is_err());
        assert_eq!(transport.attempts(), vec!["emulator-5554", "emulator-5556"]);
    }
}
