//! Device transport over the `adb` command-line tool

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use image::DynamicImage;
use regex::Regex;

use super::traits::{
    DeviceDriver, DeviceIdentity, DeviceListing, DeviceTransport, DriverResult, ForegroundApp, Key,
};
use super::uitree::{parse_hierarchy, UiTree};
use crate::error::DriverError;

/// Packages of the on-device automation agent stopped on teardown
const AUTOMATION_PACKAGES: &[&str] = &["com.github.uiautomator", "com.github.uiautomator.test"];

/// Number of delete key events sent when clearing an input
const CLEAR_DELETES: usize = 64;

/// Transport that shells out to `adb`
#[derive(Debug, Clone)]
pub struct AdbTransport {
    adb: PathBuf,
}

impl AdbTransport {
    /// Use `adb` from `PATH`
    pub fn new() -> Self {
        Self {
            adb: PathBuf::from("adb"),
        }
    }

    /// Use a specific adb binary
    pub fn with_binary(path: impl Into<PathBuf>) -> Self {
        Self { adb: path.into() }
    }
}

impl Default for AdbTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTransport for AdbTransport {
    fn list_devices(&self) -> DriverResult<Vec<DeviceListing>> {
        let out = run(&self.adb, &["devices"])?;
        Ok(parse_device_list(&String::from_utf8_lossy(&out)))
    }

    fn connect(&self, identity: &DeviceIdentity) -> DriverResult<Box<dyn DeviceDriver>> {
        let serial = identity.connect_info.clone();

        if identity.is_network() {
            let out = run(&self.adb, &["connect", serial.as_str()])?;
            let text = String::from_utf8_lossy(&out).to_lowercase();
            if !text.contains("connected to") {
                return Err(DriverError::Disconnected(format!(
                    "adb connect {}: {}",
                    serial,
                    text.trim()
                )));
            }
        }

        let state = run(&self.adb, &["-s", serial.as_str(), "get-state"])?;
        let state = String::from_utf8_lossy(&state).trim().to_string();
        if state != "device" {
            return Err(DriverError::Disconnected(format!("{serial} is {state}")));
        }

        log::debug!("adb handshake with {} complete", identity);
        Ok(Box::new(AdbDriver {
            adb: self.adb.clone(),
            serial,
            screen_size: None,
        }))
    }
}

/// Parse `adb devices` output, skipping the header and blank lines
pub fn parse_device_list(output: &str) -> Vec<DeviceListing> {
    output
        .lines()
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(serial), Some(state)) => Some(DeviceListing::new(serial, state)),
                _ => None,
            }
        })
        .collect()
}

/// Driver handle for one adb-attached device
pub struct AdbDriver {
    adb: PathBuf,
    serial: String,
    screen_size: Option<(u32, u32)>,
}

impl AdbDriver {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    fn shell(&self, args: &[&str]) -> DriverResult<String> {
        let mut full = vec!["-s", self.serial.as_str(), "shell"];
        full.extend_from_slice(args);
        let out = run(&self.adb, &full)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn exec_out(&self, args: &[&str]) -> DriverResult<Vec<u8>> {
        let mut full = vec!["-s", self.serial.as_str(), "exec-out"];
        full.extend_from_slice(args);
        run(&self.adb, &full)
    }
}

impl DeviceDriver for AdbDriver {
    fn capture(&mut self) -> DriverResult<DynamicImage> {
        let png = self.exec_out(&["screencap", "-p"])?;
        image::load_from_memory(&png).map_err(|e| DriverError::parse("screencap", e.to_string()))
    }

    fn dump_ui_tree(&mut self) -> DriverResult<UiTree> {
        let raw = self.exec_out(&["uiautomator", "dump", "/dev/tty"])?;
        parse_hierarchy(&String::from_utf8_lossy(&raw))
    }

    fn tap(&mut self, x: u32, y: u32) -> DriverResult<()> {
        let (x, y) = (x.to_string(), y.to_string());
        self.shell(&["input", "tap", x.as_str(), y.as_str()]).map(|_| ())
    }

    fn swipe(&mut self, from: (u32, u32), to: (u32, u32)) -> DriverResult<()> {
        let coords = [from.0, from.1, to.0, to.1].map(|v| v.to_string());
        let mut args = vec!["input", "swipe"];
        args.extend(coords.iter().map(String::as_str));
        args.push("300");
        self.shell(&args).map(|_| ())
    }

    fn send_keys(&mut self, text: &str) -> DriverResult<()> {
        if text.is_ascii() {
            let escaped = escape_input_text(text);
            self.shell(&["input", "text", escaped.as_str()]).map(|_| ())
        } else {
            // `input text` cannot carry non-ASCII; this needs the ADB keyboard IME
            let quoted = format!("'{}'", text.replace('\'', r"'\''"));
            self.shell(&["am", "broadcast", "-a", "ADB_INPUT_TEXT", "--es", "msg", quoted.as_str()])
                .map(|_| ())
        }
    }

    fn clear_text(&mut self) -> DriverResult<()> {
        self.shell(&["input", "keyevent", "KEYCODE_MOVE_END"])?;
        let mut args = vec!["input", "keyevent"];
        args.extend(std::iter::repeat("KEYCODE_DEL").take(CLEAR_DELETES));
        self.shell(&args).map(|_| ())
    }

    fn press_key(&mut self, key: Key) -> DriverResult<()> {
        let code = keycode(&key);
        self.shell(&["input", "keyevent", code.as_str()]).map(|_| ())
    }

    fn foreground_app(&mut self) -> DriverResult<ForegroundApp> {
        let out = self.shell(&["dumpsys", "window"])?;
        parse_focus(&out).ok_or_else(|| DriverError::parse("dumpsys window", "no focused window"))
    }

    fn screen_size(&mut self) -> DriverResult<(u32, u32)> {
        if let Some(size) = self.screen_size {
            return Ok(size);
        }
        let out = self.shell(&["wm", "size"])?;
        let size = parse_wm_size(&out).ok_or_else(|| DriverError::parse("wm size", out.trim()))?;
        self.screen_size = Some(size);
        Ok(size)
    }

    fn app_start(&mut self, package: &str) -> DriverResult<()> {
        self.shell(&[
            "monkey",
            "-p",
            package,
            "-c",
            "android.intent.category.LAUNCHER",
            "1",
        ])
        .map(|_| ())
    }

    fn stop_automation_service(&mut self) -> DriverResult<()> {
        for package in AUTOMATION_PACKAGES {
            self.shell(&["am", "force-stop", package])?;
        }
        Ok(())
    }
}

fn run(adb: &Path, args: &[&str]) -> DriverResult<Vec<u8>> {
    let output = Command::new(adb)
        .args(args)
        .output()
        .map_err(|e| DriverError::Io(format!("spawning {}: {}", adb.display(), e)))?;

    if output.status.success() {
        return Ok(output.stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let lower = stderr.to_lowercase();
    if lower.contains("not found") || lower.contains("offline") || lower.contains("no devices") {
        return Err(DriverError::Disconnected(stderr));
    }
    Err(DriverError::Command {
        command: format!("adb {}", args.join(" ")),
        stderr,
    })
}

fn keycode(key: &Key) -> String {
    match key {
        Key::Home => "KEYCODE_HOME".to_string(),
        Key::Back => "KEYCODE_BACK".to_string(),
        Key::Enter => "KEYCODE_ENTER".to_string(),
        Key::Search => "KEYCODE_SEARCH".to_string(),
        Key::Delete => "KEYCODE_DEL".to_string(),
        Key::Named(name) => {
            if name.starts_with("KEYCODE_") || name.chars().all(|c| c.is_ascii_digit()) {
                name.clone()
            } else {
                format!("KEYCODE_{}", name.to_uppercase())
            }
        }
    }
}

/// Escape text for `input text`: spaces become `%s`, shell metacharacters are backslashed
fn escape_input_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for c in text.chars() {
        match c {
            ' ' => out.push_str("%s"),
            '\\' | '"' | '\'' | '`' | '$' | '&' | '|' | ';' | '<' | '>' | '(' | ')' | '*' | '~'
            | '#' | '?' | '%' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Extract the focused package/activity from `dumpsys window` output
pub fn parse_focus(output: &str) -> Option<ForegroundApp> {
    static CURRENT: OnceLock<Regex> = OnceLock::new();
    static FOCUSED_APP: OnceLock<Regex> = OnceLock::new();

    let current = CURRENT.get_or_init(|| {
        Regex::new(r"mCurrentFocus=Window\{[^}]*?\s([\w.]+)/([\w.$]+)\}")
            .unwrap_or_else(|e| panic!("invalid focus regex: {e}"))
    });
    let focused = FOCUSED_APP.get_or_init(|| {
        Regex::new(r"mFocusedApp=.*?\s([\w.]+)/([\w.$]+)")
            .unwrap_or_else(|e| panic!("invalid focused-app regex: {e}"))
    });

    current
        .captures(output)
        .or_else(|| focused.captures(output))
        .map(|caps| ForegroundApp::new(&caps[1], &caps[2]))
}

/// Parse `wm size`, preferring an override size over the physical one
pub fn parse_wm_size(output: &str) -> Option<(u32, u32)> {
    static SIZE: OnceLock<Regex> = OnceLock::new();
    let re = SIZE.get_or_init(|| {
        Regex::new(r"(Physical|Override) size:\s*(\d+)x(\d+)")
            .unwrap_or_else(|e| panic!("invalid size regex: {e}"))
    });

    let mut physical = None;
    for caps in re.captures_iter(output) {
        let w: u32 = caps[2].parse().ok()?;
        let h: u32 = caps[3].parse().ok()?;
        if &caps[1] == "Override" {
            return Some((w, h));
        }
        physical = Some((w, h));
    }
    physical
}
