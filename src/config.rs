//! Fleet configuration
//!
//! Loaded from TOML. Host-app specifics (tab labels, resource ids, grid
//! coordinates, activity names) live in versioned [`HeuristicTable`]s rather
//! than in the navigator, with a built-in table as the last fallback.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::DeviceIdentity;
use crate::error::{FleetError, Result};
use crate::navigation::{Backoff, VerificationPolicy};
use crate::vision::{Band, ShapeConstraints};

/// Host app package used when none is configured
pub const DEFAULT_HOST_PACKAGE: &str = "com.tencent.mm";
/// Mini-program opened when none is configured
pub const DEFAULT_MINIPROGRAM_NAME: &str = "胖东来";
/// Version string of the built-in heuristic table
pub const BUILTIN_VERSION: &str = "builtin";
/// Upper bound on `device_timeout_secs`, one day
pub const MAX_DEVICE_TIMEOUT_SECS: u64 = 86_400;

/// Top-level configuration document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub options: FleetOptions,
    /// Target used for devices without their own `miniprogram` table,
    /// including every auto-discovered device
    #[serde(default)]
    pub default_miniprogram: MiniprogramConfig,
    /// Statically configured devices, in dispatch order
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Host-app heuristic tables, highest priority first
    #[serde(default)]
    pub heuristics: Vec<HeuristicTable>,
}

/// Fleet-wide switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetOptions {
    /// Use every ready device the transport reports instead of `devices`
    pub auto_discovery: bool,
    /// Dispatch to all devices at once
    pub concurrent: bool,
    /// How long a concurrent dispatch waits for one device
    pub device_timeout_secs: u64,
    /// Whether diagnostic screenshots are written at all
    pub save_screenshots: bool,
    pub screenshot_root: PathBuf,
    pub policy: VerificationPolicy,
    /// Host app version, selects which heuristic table is tried first
    pub host_version: Option<String>,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            auto_discovery: true,
            concurrent: false,
            device_timeout_secs: 300,
            save_screenshots: true,
            screenshot_root: PathBuf::from("screenshots"),
            policy: VerificationPolicy::Lenient,
            host_version: None,
        }
    }
}

/// The mini-program a device should open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiniprogramConfig {
    /// Display name, also used as a text anchor
    pub name: String,
    /// Host app package
    pub package: String,
    pub search_keyword: Option<String>,
    pub search_timeout_secs: u64,
    /// Extra texts that only appear inside the mini-program
    pub anchors: Vec<String>,
    /// Reference image of the mini-program's grid icon
    pub template: Option<PathBuf>,
    pub template_threshold: f32,
    /// Downscale factor applied before template matching
    pub template_scale: f32,
}

impl Default for MiniprogramConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_MINIPROGRAM_NAME.to_string(),
            package: DEFAULT_HOST_PACKAGE.to_string(),
            search_keyword: None,
            search_timeout_secs: 5,
            anchors: Vec::new(),
            template: None,
            template_threshold: 0.8,
            template_scale: 0.5,
        }
    }
}

/// A statically configured device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    /// Serial, `host:port` or emulator id
    pub connect_info: String,
    #[serde(default)]
    pub miniprogram: Option<MiniprogramConfig>,
}

impl DeviceConfig {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(&self.name, &self.connect_info)
    }
}

/// Waits and poll budgets, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// After a tap, before looking at the result
    pub settle_ms: u64,
    /// Between repeated back presses and after scroll gestures
    pub back_ms: u64,
    /// After launching the host app
    pub launch_ms: u64,
    /// Budget for the mini-program grid to appear after tapping its entry
    pub grid_load_ms: u64,
    /// Budget for verifying any other page
    pub page_load_ms: u64,
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
    pub backoff_factor: f32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            settle_ms: 1000,
            back_ms: 500,
            launch_ms: 2000,
            grid_load_ms: 10_000,
            page_load_ms: 3000,
            poll_initial_ms: 200,
            poll_max_ms: 1000,
            backoff_factor: 1.5,
        }
    }
}

impl Timeouts {
    /// No waiting at all; every poll checks exactly once
    pub fn instant() -> Self {
        Self {
            settle_ms: 0,
            back_ms: 0,
            launch_ms: 0,
            grid_load_ms: 0,
            page_load_ms: 0,
            poll_initial_ms: 0,
            poll_max_ms: 0,
            backoff_factor: 1.0,
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn back(&self) -> Duration {
        Duration::from_millis(self.back_ms)
    }

    pub fn launch(&self) -> Duration {
        Duration::from_millis(self.launch_ms)
    }

    pub fn grid_load(&self) -> Duration {
        Duration::from_millis(self.grid_load_ms)
    }

    pub fn page_load(&self) -> Duration {
        Duration::from_millis(self.page_load_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.poll_initial_ms),
            Duration::from_millis(self.poll_max_ms),
            self.backoff_factor,
        )
    }
}

/// How to find the host's discover tab when its text is not exposed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabTarget {
    pub text: Option<String>,
    pub description: Option<String>,
    pub resource_ids: Vec<String>,
    /// Tab strip container class
    pub container_class: Option<String>,
    /// Class of the tab labels inside the container
    pub child_class: Option<String>,
    /// Ordinal of the discover tab among the labels
    pub index: Option<usize>,
}

/// Where to look for a wide search bar
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchBarTarget {
    pub band: Band,
    pub constraints: ShapeConstraints,
}

/// Host-app heuristics for one app version. Every field is optional; unset
/// fields fall through to lower-priority tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicTable {
    pub version: String,
    /// Labels that must all be visible on the main interface
    pub host_tabs: Vec<String>,
    /// Tab tapped once when the main interface is not recognized
    pub home_tab_label: Option<String>,
    pub tab_class: Option<String>,
    pub discover_tab: Option<TabTarget>,
    /// Text of the menu entry that opens the mini-program grid
    pub miniprogram_entry_text: Option<String>,
    /// Scroll-and-retry cycles when the entry is not visible
    pub entry_scroll_attempts: Option<usize>,
    pub grid_activity_suffixes: Vec<String>,
    pub home_activity_suffixes: Vec<String>,
    /// Texts that identify the mini-program grid
    pub grid_texts: Vec<String>,
    /// Fractional grid coordinates, most likely first
    pub grid_positions: Vec<[f32; 2]>,
    /// How many of `grid_positions` are retried after one scroll
    pub post_scroll_positions: Option<usize>,
    /// Fractional coordinate of the search affordance
    pub search_affordance: Option<[f32; 2]>,
    pub search_bar: Option<SearchBarTarget>,
    /// Texts of the search page's cancel control
    pub cancel_texts: Vec<String>,
    /// Classes of text-input controls
    pub input_classes: Vec<String>,
}

impl HeuristicTable {
    /// The constants the navigator falls back to
    pub fn builtin() -> Self {
        let h = Heuristics::default();
        Self {
            version: BUILTIN_VERSION.to_string(),
            host_tabs: h.host_tabs,
            home_tab_label: Some(h.home_tab_label),
            tab_class: Some(h.tab_class),
            discover_tab: Some(TabTarget {
                text: Some(h.discover.text),
                description: Some(h.discover.description),
                resource_ids: h.discover.resource_ids,
                container_class: Some(h.discover.container_class),
                child_class: Some(h.discover.child_class),
                index: Some(h.discover.index),
            }),
            miniprogram_entry_text: Some(h.miniprogram_entry_text),
            entry_scroll_attempts: Some(h.entry_scroll_attempts),
            grid_activity_suffixes: h.grid_activity_suffixes,
            home_activity_suffixes: h.home_activity_suffixes,
            grid_texts: h.grid_texts,
            grid_positions: h.grid_positions.iter().map(|&(x, y)| [x, y]).collect(),
            post_scroll_positions: Some(h.post_scroll_positions),
            search_affordance: Some([h.search_affordance.0, h.search_affordance.1]),
            search_bar: Some(h.search_bar),
            cancel_texts: h.cancel_texts,
            input_classes: h.input_classes,
        }
    }
}

/// Discover tab lookup with every field resolved
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoverTab {
    pub text: String,
    pub description: String,
    pub resource_ids: Vec<String>,
    pub container_class: String,
    pub child_class: String,
    pub index: usize,
}

/// Heuristics after merging all applicable tables
#[derive(Debug, Clone, PartialEq)]
pub struct Heuristics {
    /// Versions of the tables that contributed, in priority order
    pub sources: Vec<String>,
    pub host_tabs: Vec<String>,
    pub home_tab_label: String,
    pub tab_class: String,
    pub discover: DiscoverTab,
    pub miniprogram_entry_text: String,
    pub entry_scroll_attempts: usize,
    pub grid_activity_suffixes: Vec<String>,
    pub home_activity_suffixes: Vec<String>,
    pub grid_texts: Vec<String>,
    pub grid_positions: Vec<(f32, f32)>,
    pub post_scroll_positions: usize,
    pub search_affordance: (f32, f32),
    pub search_bar: SearchBarTarget,
    pub cancel_texts: Vec<String>,
    pub input_classes: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for Heuristics {
    fn default() -> Self {
        Self {
            sources: vec![BUILTIN_VERSION.to_string()],
            host_tabs: strings(&["微信", "通讯录", "发现", "我"]),
            home_tab_label: "微信".to_string(),
            tab_class: "android.widget.TextView".to_string(),
            discover: DiscoverTab {
                text: "发现".to_string(),
                description: "发现".to_string(),
                resource_ids: strings(&[
                    "com.tencent.mm:id/discover_tab",
                    "com.tencent.mm:id/tab_discover",
                    "com.tencent.mm:id/tab_3",
                ]),
                container_class: "android.widget.TabWidget".to_string(),
                child_class: "android.widget.TextView".to_string(),
                index: 2,
            },
            miniprogram_entry_text: "小程序".to_string(),
            entry_scroll_attempts: 3,
            grid_activity_suffixes: strings(&[
                ".plugin.appbrand.ui.AppBrandPluginUI",
                ".plugin.appbrand.ui.recents.AppBrandLauncherUI",
            ]),
            home_activity_suffixes: strings(&[
                ".plugin.appbrand.ui.AppBrandUI",
                ".plugin.appbrand.ui.AppBrandUI00",
                ".plugin.appbrand.ui.AppBrandUI01",
                ".plugin.appbrand.ui.AppBrandUI02",
                ".plugin.appbrand.ui.AppBrandUI03",
                ".plugin.appbrand.ui.AppBrandUI04",
                ".plugin.appbrand.ui.AppBrandInToolsUI",
            ]),
            grid_texts: strings(&["小程序", "最近使用", "我的小程序", "搜索小程序"]),
            grid_positions: vec![
                (0.25, 0.4),
                (0.5, 0.4),
                (0.25, 0.25),
                (0.5, 0.25),
                (0.75, 0.25),
                (0.75, 0.4),
                (0.25, 0.55),
                (0.5, 0.55),
                (0.75, 0.55),
            ],
            post_scroll_positions: 3,
            search_affordance: (0.5, 0.08),
            search_bar: SearchBarTarget::default(),
            cancel_texts: strings(&["取消", "Cancel"]),
            input_classes: strings(&["android.widget.EditText"]),
        }
    }
}

/// The configured heuristic tables
#[derive(Debug, Clone, Default)]
pub struct HeuristicSet {
    tables: Vec<HeuristicTable>,
}

impl HeuristicSet {
    pub fn new(tables: Vec<HeuristicTable>) -> Self {
        Self { tables }
    }

    /// Tables in priority order: an exact `version` match first, then the
    /// rest in declaration order. The built-in table is not included.
    pub fn ordered(&self, version: Option<&str>) -> Vec<&HeuristicTable> {
        let exact = |t: &&HeuristicTable| version.map_or(false, |v| t.version == v);
        let mut out: Vec<&HeuristicTable> = self.tables.iter().filter(exact).collect();
        out.extend(self.tables.iter().filter(|t| !exact(t)));
        out
    }

    /// Merge the tables for `version` over the built-in defaults.
    ///
    /// Scalars come from the highest-priority table that sets them. Lists are
    /// concatenated in priority order, built-in entries last, without
    /// duplicates.
    pub fn resolve(&self, version: Option<&str>) -> Heuristics {
        let tables = self.ordered(version);
        let base = Heuristics::default();

        let first = |f: &dyn Fn(&HeuristicTable) -> Option<String>, fallback: String| {
            tables.iter().find_map(|t| f(t)).unwrap_or(fallback)
        };
        let tab = |f: &dyn Fn(&TabTarget) -> Option<String>, fallback: String| {
            tables
                .iter()
                .find_map(|t| t.discover_tab.as_ref().and_then(|d| f(d)))
                .unwrap_or(fallback)
        };

        let discover = DiscoverTab {
            text: tab(&|d| d.text.clone(), base.discover.text),
            description: tab(&|d| d.description.clone(), base.discover.description),
            resource_ids: merged(
                tables
                    .iter()
                    .filter_map(|t| t.discover_tab.as_ref())
                    .map(|d| d.resource_ids.as_slice()),
                &base.discover.resource_ids,
            ),
            container_class: tab(&|d| d.container_class.clone(), base.discover.container_class),
            child_class: tab(&|d| d.child_class.clone(), base.discover.child_class),
            index: tables
                .iter()
                .find_map(|t| t.discover_tab.as_ref().and_then(|d| d.index))
                .unwrap_or(base.discover.index),
        };

        let grid_positions: Vec<(f32, f32)> = merged(
            tables.iter().map(|t| t.grid_positions.as_slice()),
            &base.grid_positions.iter().map(|&(x, y)| [x, y]).collect::<Vec<_>>(),
        )
        .into_iter()
        .map(|[x, y]| (x, y))
        .collect();

        let mut sources: Vec<String> = tables.iter().map(|t| t.version.clone()).collect();
        sources.push(BUILTIN_VERSION.to_string());

        Heuristics {
            sources,
            host_tabs: tables
                .iter()
                .map(|t| &t.host_tabs)
                .find(|tabs| !tabs.is_empty())
                .cloned()
                .unwrap_or(base.host_tabs),
            home_tab_label: first(&|t| t.home_tab_label.clone(), base.home_tab_label),
            tab_class: first(&|t| t.tab_class.clone(), base.tab_class),
            discover,
            miniprogram_entry_text: first(
                &|t| t.miniprogram_entry_text.clone(),
                base.miniprogram_entry_text,
            ),
            entry_scroll_attempts: tables
                .iter()
                .find_map(|t| t.entry_scroll_attempts)
                .unwrap_or(base.entry_scroll_attempts),
            grid_activity_suffixes: merged(
                tables.iter().map(|t| t.grid_activity_suffixes.as_slice()),
                &base.grid_activity_suffixes,
            ),
            home_activity_suffixes: merged(
                tables.iter().map(|t| t.home_activity_suffixes.as_slice()),
                &base.home_activity_suffixes,
            ),
            grid_texts: merged(tables.iter().map(|t| t.grid_texts.as_slice()), &base.grid_texts),
            grid_positions,
            post_scroll_positions: tables
                .iter()
                .find_map(|t| t.post_scroll_positions)
                .unwrap_or(base.post_scroll_positions),
            search_affordance: tables
                .iter()
                .find_map(|t| t.search_affordance)
                .map(|[x, y]| (x, y))
                .unwrap_or(base.search_affordance),
            search_bar: tables
                .iter()
                .find_map(|t| t.search_bar)
                .unwrap_or(base.search_bar),
            cancel_texts: merged(tables.iter().map(|t| t.cancel_texts.as_slice()), &base.cancel_texts),
            input_classes: merged(
                tables.iter().map(|t| t.input_classes.as_slice()),
                &base.input_classes,
            ),
        }
    }
}

/// Concatenate `lists` then `tail`, keeping the first occurrence of each item
fn merged<'a, T, I>(lists: I, tail: &'a [T]) -> Vec<T>
where
    T: Clone + PartialEq + 'a,
    I: IntoIterator<Item = &'a [T]>,
{
    let mut out: Vec<T> = Vec::new();
    for item in lists.into_iter().flatten().chain(tail.iter()) {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

impl FleetConfig {
    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        log::info!(
            "Loaded fleet config from {} ({} static devices, auto_discovery={})",
            path.display(),
            config.devices.len(),
            config.options.auto_discovery
        );
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: FleetConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(FleetError::Config("device with empty name".into()));
            }
            if !names.insert(device.name.as_str()) {
                return Err(FleetError::Config(format!("duplicate device name `{}`", device.name)));
            }
            if device.connect_info.trim().is_empty() {
                return Err(FleetError::Config(format!(
                    "device `{}` has empty connect_info",
                    device.name
                )));
            }
            if let Some(mp) = &device.miniprogram {
                validate_miniprogram(mp, &device.name)?;
            }
        }
        validate_miniprogram(&self.default_miniprogram, "default_miniprogram")?;

        if self.options.device_timeout_secs == 0 {
            return Err(FleetError::Config("device_timeout_secs must be positive".into()));
        }
        if self.options.device_timeout_secs > MAX_DEVICE_TIMEOUT_SECS {
            return Err(FleetError::Config(format!(
                "device_timeout_secs {} exceeds {MAX_DEVICE_TIMEOUT_SECS}",
                self.options.device_timeout_secs
            )));
        }
        let factor = self.timeouts.backoff_factor;
        if !factor.is_finite() || factor < 1.0 {
            return Err(FleetError::Config(format!(
                "backoff_factor {factor} must be finite and at least 1.0"
            )));
        }

        for table in &self.heuristics {
            let fractions = table
                .grid_positions
                .iter()
                .chain(table.search_affordance.iter())
                .flatten();
            for &f in fractions {
                if !(0.0..=1.0).contains(&f) {
                    return Err(FleetError::Config(format!(
                        "heuristics `{}`: screen fraction {f} outside [0, 1]",
                        table.version
                    )));
                }
            }
            if let Some(bar) = &table.search_bar {
                let band = bar.band;
                if !(0.0..=1.0).contains(&band.top) || !(0.0..=1.0).contains(&band.bottom) || band.top >= band.bottom {
                    return Err(FleetError::Config(format!(
                        "heuristics `{}`: invalid search bar band",
                        table.version
                    )));
                }
            }
        }
        Ok(())
    }

    /// Mini-program settings for a statically configured device, or the
    /// default for anything else
    pub fn miniprogram_for(&self, device: &str) -> MiniprogramConfig {
        self.devices
            .iter()
            .find(|d| d.name == device)
            .and_then(|d| d.miniprogram.clone())
            .unwrap_or_else(|| self.default_miniprogram.clone())
    }

    /// Identities of the statically configured devices, in declaration order
    pub fn static_identities(&self) -> Vec<DeviceIdentity> {
        self.devices.iter().map(DeviceConfig::identity).collect()
    }

    /// Heuristics for the configured host version
    pub fn heuristics(&self) -> Heuristics {
        HeuristicSet::new(self.heuristics.clone()).resolve(self.options.host_version.as_deref())
    }
}

fn validate_miniprogram(mp: &MiniprogramConfig, owner: &str) -> Result<()> {
    if mp.package.trim().is_empty() {
        return Err(FleetError::Config(format!("{owner}: empty package")));
    }
    if !(0.0..=1.0).contains(&mp.template_threshold) {
        return Err(FleetError::Config(format!(
            "{owner}: template_threshold {} outside [0, 1]",
            mp.template_threshold
        )));
    }
    if !(mp.template_scale > 0.0 && mp.template_scale <= 1.0) {
        return Err(FleetError::Config(format!(
            "{owner}: template_scale {} outside (0, 1]",
            mp.template_scale
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = FleetConfig::from_toml_str("").unwrap();
        assert!(config.options.auto_discovery);
        assert!(!config.options.concurrent);
        assert_eq!(config.options.device_timeout_secs, 300);
        assert_eq!(config.options.policy, VerificationPolicy::Lenient);
        assert_eq!(config.default_miniprogram.name, DEFAULT_MINIPROGRAM_NAME);
        assert_eq!(config.default_miniprogram.package, DEFAULT_HOST_PACKAGE);
        assert_eq!(config.default_miniprogram.search_timeout_secs, 5);
        assert!(config.devices.is_empty());
        assert_eq!(config.timeouts, Timeouts::default());
    }

    #[test]
    fn test_static_devices_keep_order() {
        let config = FleetConfig::from_toml_str(
            r#"
            [options]
            auto_discovery = false
            policy = "strict"

            [[devices]]
            name = "mumu_1"
            connect_info = "127.0.0.1:16384"

            [[devices]]
            name = "leidian_1"
            connect_info = "emulator-5554"
            [devices.miniprogram]
            name = "其他小程序"
            search_keyword = "啤酒"
        "#,
        )
        .unwrap();

        assert!(!config.options.auto_discovery);
        assert_eq!(config.options.policy, VerificationPolicy::Strict);
        let ids = config.static_identities();
        assert_eq!(ids[0].name, "mumu_1");
        assert_eq!(ids[1].connect_info, "emulator-5554");

        let mp = config.miniprogram_for("leidian_1");
        assert_eq!(mp.name, "其他小程序");
        assert_eq!(mp.package, DEFAULT_HOST_PACKAGE);
        assert_eq!(mp.search_keyword.as_deref(), Some("啤酒"));
        assert_eq!(config.miniprogram_for("mumu_1").name, DEFAULT_MINIPROGRAM_NAME);
    }

    #[test]
    fn test_validation_rejects_bad_documents() {
        let dup = r#"
            [[devices]]
            name = "a"
            connect_info = "x"
            [[devices]]
            name = "a"
            connect_info = "y"
        "#;
        assert!(matches!(FleetConfig::from_toml_str(dup), Err(FleetError::Config(_))));

        let empty_connect = r#"
            [[devices]]
            name = "a"
            connect_info = " "
        "#;
        assert!(FleetConfig::from_toml_str(empty_connect).is_err());

        let bad_fraction = r#"
            [[heuristics]]
            version = "8.0"
            grid_positions = [[0.25, 1.4]]
        "#;
        assert!(FleetConfig::from_toml_str(bad_fraction).is_err());

        let bad_threshold = r#"
            [default_miniprogram]
            template_threshold = 1.5
        "#;
        assert!(FleetConfig::from_toml_str(bad_threshold).is_err());

        assert!(FleetConfig::from_toml_str("options = 3").is_err());
    }

    #[test]
    fn test_builtin_heuristics() {
        let h = HeuristicSet::default().resolve(None);
        assert_eq!(h.host_tabs, vec!["微信", "通讯录", "发现", "我"]);
        assert_eq!(h.grid_positions.len(), 9);
        assert_eq!(h.grid_positions[0], (0.25, 0.4));
        assert_eq!(h.post_scroll_positions, 3);
        assert_eq!(h.entry_scroll_attempts, 3);
        assert_eq!(h.discover.index, 2);
        assert_eq!(h.sources, vec![BUILTIN_VERSION]);
        assert_eq!(HeuristicTable::builtin().version, BUILTIN_VERSION);
    }

    #[test]
    fn test_resolve_prefers_exact_version() {
        let config = FleetConfig::from_toml_str(
            r#"
            [options]
            host_version = "8.0.50"

            [[heuristics]]
            version = "8.0.40"
            grid_positions = [[0.1, 0.1]]
            miniprogram_entry_text = "Mini Programs"

            [[heuristics]]
            version = "8.0.50"
            grid_positions = [[0.3, 0.3], [0.25, 0.4]]
            home_activity_suffixes = [".ui.AppBrandUI05"]
            [heuristics.discover_tab]
            resource_ids = ["com.tencent.mm:id/new_tab"]
        "#,
        )
        .unwrap();

        let h = config.heuristics();
        assert_eq!(h.sources, vec!["8.0.50", "8.0.40", BUILTIN_VERSION]);
        // Exact match first, then the other table, then built-in without repeats
        assert_eq!(h.grid_positions[0], (0.3, 0.3));
        assert_eq!(h.grid_positions[1], (0.25, 0.4));
        assert_eq!(h.grid_positions[2], (0.1, 0.1));
        assert_eq!(h.grid_positions.len(), 11);
        assert_eq!(h.miniprogram_entry_text, "Mini Programs");
        assert_eq!(h.home_activity_suffixes[0], ".ui.AppBrandUI05");
        assert_eq!(h.discover.resource_ids[0], "com.tencent.mm:id/new_tab");
        assert_eq!(h.discover.resource_ids.len(), 4);
        // Unset scalars fall through to built-in
        assert_eq!(h.discover.text, "发现");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, "[options]\nconcurrent = true\n").unwrap();
        let config = FleetConfig::load(&path).unwrap();
        assert!(config.options.concurrent);

        assert!(matches!(
            FleetConfig::load(dir.path().join("missing.toml")),
            Err(FleetError::Io(_))
        ));
    }

    #[test]
    fn test_instant_timeouts() {
        let t = Timeouts::instant();
        assert_eq!(t.grid_load(), Duration::ZERO);
        assert_eq!(t.backoff().factor, 1.0);
    }

    #[test]
    fn test_device_timeout_bounds() {
        let at_cap = format!("[options]\ndevice_timeout_secs = {MAX_DEVICE_TIMEOUT_SECS}\n");
        assert!(FleetConfig::from_toml_str(&at_cap).is_ok());

        for secs in [0, MAX_DEVICE_TIMEOUT_SECS + 1, i64::MAX as u64] {
            let doc = format!("[options]\ndevice_timeout_secs = {secs}\n");
            assert!(
                matches!(FleetConfig::from_toml_str(&doc), Err(FleetError::Config(_))),
                "{secs} accepted"
            );
        }
    }

    #[test]
    fn test_backoff_factor_must_be_finite() {
        for factor in ["inf", "+inf", "nan", "0.5"] {
            let doc = format!("[timeouts]\nbackoff_factor = {factor}\n");
            assert!(
                matches!(FleetConfig::from_toml_str(&doc), Err(FleetError::Config(_))),
                "{factor} accepted"
            );
        }
        assert!(FleetConfig::from_toml_str("[timeouts]\nbackoff_factor = 2.0\n").is_ok());
    }
}
