//! Fleet orchestrator
//!
//! Discovers devices, owns one [`DeviceSession`] per device and dispatches
//! actions to them serially or with one worker thread per device.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{FleetConfig, Heuristics};
use crate::driver::{AdbTransport, DeviceIdentity, DeviceTransport};
use crate::error::{FleetError, Result};
use crate::fleet::outcome::{success_rate, DeviceOutcome, DispatchResult, FleetMode};
use crate::fleet::session::DeviceSession;
use crate::navigation::{CancelToken, Navigator};
use crate::vision::ScreenshotStore;

/// Action run against one session. `Ok(true)` is success; `Ok(false)` and
/// errors are failures.
pub type DeviceAction = Arc<dyn Fn(&mut DeviceSession) -> Result<bool> + Send + Sync>;

/// Which sessions a dispatch reaches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchTarget {
    All,
    Device(String),
}

/// A session whose worker missed the dispatch deadline
struct Straggler {
    name: String,
    handle: JoinHandle<(DeviceSession, bool)>,
    cancel: CancelToken,
}

pub struct FleetOrchestrator {
    config: FleetConfig,
    heuristics: Heuristics,
    transport: Arc<dyn DeviceTransport>,
    discovered: Vec<DeviceIdentity>,
    /// Idle sessions, sorted by ordinal
    sessions: Vec<DeviceSession>,
    /// Devices the last `connect_all` meant to reach
    expected: usize,
    connect_failures: BTreeMap<String, String>,
    stragglers: Vec<Straggler>,
    cancel: CancelToken,
}

impl FleetOrchestrator {
    pub fn new(config: FleetConfig, transport: Arc<dyn DeviceTransport>) -> Result<Self> {
        config.validate()?;
        let heuristics = config.heuristics();
        Ok(Self {
            config,
            heuristics,
            transport,
            discovered: Vec::new(),
            sessions: Vec::new(),
            expected: 0,
            connect_failures: BTreeMap::new(),
            stragglers: Vec::new(),
            cancel: CancelToken::new(),
        })
    }

    /// Orchestrator over the `adb` found on `PATH`
    pub fn with_adb(config: FleetConfig) -> Result<Self> {
        Self::new(config, Arc::new(AdbTransport::new()))
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn mode(&self) -> FleetMode {
        FleetMode::from_auto_discovery(self.config.options.auto_discovery)
    }

    /// Ready devices reported by the transport, named `device1`, `device2`...
    /// in listing order
    pub fn discover_devices(&mut self) -> Result<Vec<DeviceIdentity>> {
        let listings = self.transport.list_devices()?;
        let total = listings.len();
        let identities: Vec<DeviceIdentity> = listings
            .into_iter()
            .filter(|l| l.is_ready())
            .enumerate()
            .map(|(i, l)| DeviceIdentity::new(format!("device{}", i + 1), l.serial))
            .collect();

        log::info!(
            "Discovered {} ready device(s) out of {} listed",
            identities.len(),
            total
        );
        for identity in &identities {
            log::debug!("  {}", identity);
        }
        self.discovered = identities.clone();
        Ok(identities)
    }

    pub fn discovered(&self) -> &[DeviceIdentity] {
        &self.discovered
    }

    /// Connect every identity not already connected and build its session.
    /// A device that fails to connect is logged and skipped.
    ///
    /// Returns the number of new sessions.
    pub fn build_sessions(&mut self, identities: &[DeviceIdentity]) -> usize {
        let mut built = 0;
        for (ordinal, identity) in identities.iter().enumerate() {
            if self.is_known(identity) {
                log::warn!("{} is already connected, skipping", identity);
                continue;
            }
            match self.build_session(identity, ordinal) {
                Ok(session) => {
                    log::info!("Connected {}", identity);
                    self.connect_failures.remove(&identity.name);
                    self.sessions.push(session);
                    built += 1;
                }
                Err(e) => {
                    log::error!("Failed to connect {}: {}", identity, e);
                    self.connect_failures.insert(identity.name.clone(), e.to_string());
                }
            }
        }
        self.sessions.sort_by_key(|s| s.ordinal());
        built
    }

    fn is_known(&self, identity: &DeviceIdentity) -> bool {
        let same = |other: &DeviceIdentity| {
            other.name == identity.name || other.connect_info == identity.connect_info
        };
        self.sessions.iter().any(|s| same(s.identity()))
            || self.stragglers.iter().any(|s| s.name == identity.name)
    }

    fn build_session(&self, identity: &DeviceIdentity, ordinal: usize) -> Result<DeviceSession> {
        let mut driver = self
            .transport
            .connect(identity)
            .map_err(|e| FleetError::Connection {
                device: identity.name.clone(),
                reason: e.to_string(),
            })?;
        // A handle that cannot report its screen size is not usable
        let (w, h) = driver.screen_size().map_err(|e| FleetError::Connection {
            device: identity.name.clone(),
            reason: e.to_string(),
        })?;
        log::debug!("{} screen is {}x{}", identity.name, w, h);

        let miniprogram = self.config.miniprogram_for(&identity.name);
        let template = miniprogram
            .template
            .as_ref()
            .and_then(|path| match image::open(path) {
                Ok(img) => Some(Arc::new(img)),
                Err(e) => {
                    log::warn!(
                        "{}: ignoring template {}: {}",
                        identity.name,
                        path.display(),
                        e
                    );
                    None
                }
            });
        let navigator = Navigator::new(
            &identity.name,
            miniprogram,
            self.heuristics.clone(),
            self.config.timeouts.clone(),
            self.config.options.policy,
        )
        .with_template(template);

        let store = if self.config.options.save_screenshots {
            ScreenshotStore::new(&self.config.options.screenshot_root, &identity.name)
        } else {
            ScreenshotStore::disabled(&identity.name)
        };

        Ok(DeviceSession::new(identity.clone(), ordinal, driver, navigator, store))
    }

    /// Drop existing sessions, then connect the discovered (auto mode) or
    /// configured (static mode) devices.
    ///
    /// Returns the fleet verdict for the connection step.
    pub fn connect_all(&mut self) -> bool {
        self.disconnect_all();
        self.connect_failures.clear();

        let identities = if self.config.options.auto_discovery {
            match self.discover_devices() {
                Ok(identities) => identities,
                Err(e) => {
                    log::error!("Device discovery failed: {}", e);
                    self.expected = 0;
                    return false;
                }
            }
        } else {
            self.config.static_identities()
        };

        self.expected = identities.len();
        let connected = self.build_sessions(&identities);
        let mode = self.mode();
        log::info!(
            "Connected {}/{} device(s) ({:.1}%, {:?})",
            connected,
            self.expected,
            success_rate(self.expected, connected),
            mode
        );
        mode.is_success(self.expected, connected)
    }

    /// Tear down every session. One failing teardown does not stop the rest.
    pub fn disconnect_all(&mut self) {
        self.reclaim_stragglers();
        for straggler in self.stragglers.drain(..) {
            straggler.cancel.cancel();
            log::warn!(
                "{} is still running, detaching without teardown",
                straggler.name
            );
        }

        for mut session in self.sessions.drain(..) {
            match session.teardown() {
                Ok(()) => log::info!("Disconnected {}", session.name()),
                Err(e) => log::warn!("Teardown of {} failed: {}", session.name(), e),
            }
        }
    }

    /// Sessions that are idle or still running a timed-out action
    pub fn connected_count(&self) -> usize {
        self.sessions.len() + self.stragglers.len()
    }

    pub fn expected_count(&self) -> usize {
        self.expected
    }

    pub fn straggler_count(&self) -> usize {
        self.stragglers.len()
    }

    /// Idle device names in dispatch order
    pub fn device_names(&self) -> Vec<&str> {
        self.sessions.iter().map(|s| s.name()).collect()
    }

    pub fn session(&self, name: &str) -> Option<&DeviceSession> {
        self.sessions.iter().find(|s| s.name() == name)
    }

    pub fn session_mut(&mut self, name: &str) -> Option<&mut DeviceSession> {
        self.sessions.iter_mut().find(|s| s.name() == name)
    }

    /// Devices that failed to connect and why
    pub fn connect_failures(&self) -> &BTreeMap<String, String> {
        &self.connect_failures
    }

    /// Raise cancellation for every in-flight and future action until
    /// [`Self::reset_cancellation`]
    pub fn cancel(&self) {
        log::info!("Cancelling fleet actions");
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn reset_cancellation(&mut self) {
        self.cancel = CancelToken::new();
    }

    pub fn run_on_device<F>(&mut self, name: &str, action: F) -> bool
    where
        F: Fn(&mut DeviceSession) -> Result<bool> + Send + Sync + 'static,
    {
        self.dispatch(DispatchTarget::Device(name.to_string()), action, false)
            .is_success()
    }

    pub fn run_on_all<F>(&mut self, action: F, concurrent: bool) -> BTreeMap<String, bool>
    where
        F: Fn(&mut DeviceSession) -> Result<bool> + Send + Sync + 'static,
    {
        self.dispatch(DispatchTarget::All, action, concurrent)
            .to_bool_map()
    }

    /// Open the configured mini-program on every device
    pub fn launch_on_all(&mut self, concurrent: bool) -> DispatchResult {
        self.dispatch(DispatchTarget::All, DeviceSession::launch_miniprogram, concurrent)
    }

    /// [`Self::dispatch`] to every device, concurrently when the
    /// `concurrent` option is set
    pub fn dispatch_all<F>(&mut self, action: F) -> DispatchResult
    where
        F: Fn(&mut DeviceSession) -> Result<bool> + Send + Sync + 'static,
    {
        let concurrent = self.config.options.concurrent;
        self.dispatch(DispatchTarget::All, action, concurrent)
    }

    /// [`Self::launch_on_all`] using the `concurrent` option
    pub fn launch_all(&mut self) -> DispatchResult {
        self.dispatch_all(DeviceSession::launch_miniprogram)
    }

    pub fn launch_on_device(&mut self, name: &str) -> bool {
        self.run_on_device(name, DeviceSession::launch_miniprogram)
    }

    /// Run `action` on the targeted sessions and collect one outcome per
    /// device. Devices whose action fails with a lost connection are dropped
    /// from the fleet.
    pub fn dispatch<F>(&mut self, target: DispatchTarget, action: F, concurrent: bool) -> DispatchResult
    where
        F: Fn(&mut DeviceSession) -> Result<bool> + Send + Sync + 'static,
    {
        let action: DeviceAction = Arc::new(action);
        self.reclaim_stragglers();

        let mut outcomes = BTreeMap::new();
        let (selected, expected) = match &target {
            DispatchTarget::All => {
                for straggler in &self.stragglers {
                    outcomes.insert(
                        straggler.name.clone(),
                        DeviceOutcome::failed("still running a previous action"),
                    );
                }
                (std::mem::take(&mut self.sessions), None)
            }
            DispatchTarget::Device(name) => {
                let mut selected = Vec::new();
                if let Some(i) = self.sessions.iter().position(|s| s.name() == name) {
                    selected.push(self.sessions.remove(i));
                } else if self.stragglers.iter().any(|s| &s.name == name) {
                    outcomes.insert(name.clone(), DeviceOutcome::failed("still running a previous action"));
                } else {
                    let err = FleetError::UnknownDevice(name.clone());
                    log::error!("{}", err);
                    outcomes.insert(name.clone(), DeviceOutcome::failed(err.to_string()));
                }
                (selected, Some(1))
            }
        };

        log::info!(
            "Dispatching to {} device(s) ({})",
            selected.len(),
            if concurrent { "concurrent" } else { "serial" }
        );

        let ran = if concurrent {
            self.run_concurrent(selected, action)
        } else {
            self.run_serial(selected, action)
        };
        outcomes.extend(ran);

        let expected_count = expected.unwrap_or_else(|| self.expected.max(outcomes.len()));
        let result = DispatchResult {
            mode: self.mode(),
            outcomes,
            expected_count,
        };
        for (name, reason) in result.failures() {
            log::warn!("{} failed: {}", name, reason);
        }
        log::info!(
            "Dispatch finished: {}/{} succeeded ({:.1}%), fleet {}",
            result.success_count(),
            result.expected_count,
            result.success_rate(),
            if result.is_success() { "ok" } else { "failed" }
        );
        result
    }

    fn run_serial(
        &mut self,
        sessions: Vec<DeviceSession>,
        action: DeviceAction,
    ) -> BTreeMap<String, DeviceOutcome> {
        let mut outcomes = BTreeMap::new();
        for mut session in sessions {
            let name = session.name().to_string();
            if self.cancel.is_cancelled() {
                outcomes.insert(name, DeviceOutcome::failed(FleetError::Cancelled.to_string()));
                self.sessions.push(session);
                continue;
            }
            session.set_cancel_token(self.cancel.child());
            let (outcome, fatal) = run_guarded(&mut session, &action);
            outcomes.insert(name, outcome);
            self.keep_or_drop(session, fatal);
        }
        self.sessions.sort_by_key(|s| s.ordinal());
        outcomes
    }

    fn run_concurrent(
        &mut self,
        sessions: Vec<DeviceSession>,
        action: DeviceAction,
    ) -> BTreeMap<String, DeviceOutcome> {
        let results: Arc<Mutex<BTreeMap<String, DeviceOutcome>>> = Arc::default();
        let (done_tx, done_rx) = mpsc::channel::<String>();
        let mut workers: BTreeMap<String, (JoinHandle<(DeviceSession, bool)>, CancelToken)> =
            BTreeMap::new();

        for mut session in sessions {
            let name = session.name().to_string();
            let cancel = self.cancel.child();
            session.set_cancel_token(cancel.clone());

            let worker_results = results.clone();
            let done_tx = done_tx.clone();
            let action = action.clone();
            let worker_name = name.clone();
            let spawned = thread::Builder::new()
                .name(format!("fleet-{name}"))
                .spawn(move || {
                    let (outcome, fatal) = run_guarded(&mut session, &action);
                    worker_results.lock().insert(worker_name.clone(), outcome);
                    let _ = done_tx.send(worker_name);
                    (session, fatal)
                });

            match spawned {
                Ok(handle) => {
                    workers.insert(name, (handle, cancel));
                }
                Err(e) => {
                    log::error!("Failed to spawn worker for {}: {}", name, e);
                    results
                        .lock()
                        .insert(name, DeviceOutcome::failed(format!("worker spawn failed: {e}")));
                }
            }
        }
        drop(done_tx);

        let seconds = self.config.options.device_timeout_secs;
        // An unrepresentable deadline means waiting for every worker
        let deadline = Instant::now().checked_add(Duration::from_secs(seconds));
        let mut pending: BTreeSet<String> = workers.keys().cloned().collect();
        while !pending.is_empty() {
            let received = match deadline {
                Some(deadline) => done_rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
                None => done_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(name) => {
                    pending.remove(&name);
                }
                Err(RecvTimeoutError::Timeout) => break,
                // Every worker has exited; any left in `pending` died outside the guard
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        for name in &pending {
            if let Some((handle, cancel)) = workers.remove(name) {
                if handle.is_finished() {
                    workers.insert(name.clone(), (handle, cancel));
                    continue;
                }
                let err = FleetError::Timeout {
                    device: name.clone(),
                    seconds,
                };
                log::error!("{}", err);
                results
                    .lock()
                    .insert(name.clone(), DeviceOutcome::failed(err.to_string()));
                cancel.cancel();
                self.stragglers.push(Straggler {
                    name: name.clone(),
                    handle,
                    cancel,
                });
            }
        }

        // Late stragglers write into the map after this, not into our result
        let mut outcomes = std::mem::take(&mut *results.lock());

        for (name, (handle, _)) in workers {
            match handle.join() {
                Ok((session, fatal)) => self.keep_or_drop(session, fatal),
                Err(_) => {
                    log::error!("Worker for {} panicked, dropping its session", name);
                    outcomes
                        .entry(name)
                        .or_insert_with(|| DeviceOutcome::failed("worker panicked"));
                }
            }
        }
        self.sessions.sort_by_key(|s| s.ordinal());
        outcomes
    }

    fn keep_or_drop(&mut self, session: DeviceSession, fatal: bool) {
        if fatal {
            log::error!("{} lost its connection, removing it from the fleet", session.name());
        } else {
            self.sessions.push(session);
        }
    }

    /// Take back stragglers whose workers have finished
    fn reclaim_stragglers(&mut self) {
        if self.stragglers.is_empty() {
            return;
        }
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.stragglers)
            .into_iter()
            .partition(|s| s.handle.is_finished());
        self.stragglers = running;

        for straggler in finished {
            match straggler.handle.join() {
                Ok((mut session, fatal)) => {
                    log::info!("Reclaimed {} after a timed-out action", straggler.name);
                    session.set_cancel_token(CancelToken::new());
                    self.keep_or_drop(session, fatal);
                }
                Err(_) => log::error!("Straggler {} panicked, dropping its session", straggler.name),
            }
        }
        self.sessions.sort_by_key(|s| s.ordinal());
    }
}

impl Drop for FleetOrchestrator {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

/// Run `action`, turning errors and panics into a failed outcome.
/// The flag is set when the error means the device is gone.
fn run_guarded(session: &mut DeviceSession, action: &DeviceAction) -> (DeviceOutcome, bool) {
    let started = Instant::now();
    let result = panic::catch_unwind(AssertUnwindSafe(|| action(session)));
    let target = session.navigator().log_target();
    let elapsed = started.elapsed().as_secs_f32();

    match result {
        Ok(Ok(true)) => {
            log::info!(target: target, "Action succeeded in {:.1}s", elapsed);
            (DeviceOutcome::ok(), false)
        }
        Ok(Ok(false)) => {
            log::warn!(target: target, "Action reported failure after {:.1}s", elapsed);
            (DeviceOutcome::failed("action reported failure"), false)
        }
        Ok(Err(e)) => {
            log::warn!(target: target, "Action failed after {:.1}s: {}", elapsed, e);
            (DeviceOutcome::failed(e.to_string()), e.is_driver_fatal())
        }
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!(target: target, "Action panicked: {}", msg);
            (DeviceOutcome::failed(format!("action panicked: {msg}")), false)
        }
    }
}
