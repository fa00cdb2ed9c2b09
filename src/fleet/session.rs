//! One device, its driver handle and its navigator

use std::path::PathBuf;

use image::DynamicImage;

use crate::driver::{DeviceDriver, DeviceIdentity};
use crate::error::{FleetError, Result};
use crate::navigation::{CancelToken, LogicalScreen, Navigator};
use crate::vision::ScreenshotStore;

/// A connected device.
///
/// Owns its driver handle outright; the orchestrator moves the whole session
/// into a worker thread for concurrent dispatch, so a handle is never used
/// from two threads at once.
pub struct DeviceSession {
    identity: DeviceIdentity,
    /// Position in dispatch order
    ordinal: usize,
    driver: Box<dyn DeviceDriver>,
    navigator: Navigator,
    store: ScreenshotStore,
    last_capture: Option<DynamicImage>,
}

impl DeviceSession {
    pub fn new(
        identity: DeviceIdentity,
        ordinal: usize,
        driver: Box<dyn DeviceDriver>,
        navigator: Navigator,
        store: ScreenshotStore,
    ) -> Self {
        Self {
            identity,
            ordinal,
            driver,
            navigator,
            store,
            last_capture: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Screen reached by the last verified or accepted transition
    pub fn current_screen(&self) -> LogicalScreen {
        self.navigator.current()
    }

    pub fn last_capture(&self) -> Option<&DynamicImage> {
        self.last_capture.as_ref()
    }

    pub fn navigator(&self) -> &Navigator {
        &self.navigator
    }

    pub fn screenshots(&self) -> &ScreenshotStore {
        &self.store
    }

    /// Raw driver access for custom actions
    pub fn driver(&mut self) -> &mut dyn DeviceDriver {
        self.driver.as_mut()
    }

    pub(crate) fn set_cancel_token(&mut self, cancel: CancelToken) {
        self.navigator.set_cancel_token(cancel);
    }

    /// Capture the screen and keep it as the last capture
    pub fn capture(&mut self) -> Result<&DynamicImage> {
        let frame = self.driver.capture()?;
        Ok(&*self.last_capture.insert(frame))
    }

    /// Capture and store a labelled diagnostic screenshot
    pub fn screenshot(&mut self, label: &str) -> Result<Option<PathBuf>> {
        let frame = self.driver.capture()?;
        let path = self.store.save(&frame, label, self.navigator.current())?;
        self.last_capture = Some(frame);
        Ok(path)
    }

    pub fn navigate_to(&mut self, screen: LogicalScreen) -> Result<()> {
        self.navigator
            .navigate_to(self.driver.as_mut(), &self.store, screen)
    }

    /// Open the configured mini-program
    pub fn launch_miniprogram(&mut self) -> Result<bool> {
        log::info!(
            target: self.navigator.log_target(),
            "Launching mini-program '{}'",
            self.navigator.miniprogram().name
        );
        self.navigate_to(LogicalScreen::MiniprogramHome)?;
        Ok(true)
    }

    /// Search for `keyword` inside the mini-program and keep a screenshot of
    /// the result
    pub fn search(&mut self, keyword: &str) -> Result<bool> {
        self.navigator
            .search(self.driver.as_mut(), &self.store, keyword)?;
        self.screenshot(&format!("search_{keyword}"))?;
        Ok(true)
    }

    /// [`Self::search`] with the configured keyword
    pub fn search_configured(&mut self) -> Result<bool> {
        let keyword = self
            .navigator
            .miniprogram()
            .search_keyword
            .clone()
            .ok_or_else(|| FleetError::Config(format!("{}: no search_keyword configured", self.name())))?;
        self.search(&keyword)
    }

    /// Stop the automation service on the device
    pub fn teardown(&mut self) -> Result<()> {
        self.driver.stop_automation_service()?;
        Ok(())
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("identity", &self.identity)
            .field("ordinal", &self.ordinal)
            .field("current", &self.navigator.current())
            .finish()
    }
}
