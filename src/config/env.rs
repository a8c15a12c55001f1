use std::path::PathBuf;

use log::LevelFilter;
use rust_tport_core::capture::CaptureTarget;

pub const TPORT_LOG: &str = "TPORT_LOG";
pub const TPORT_DEBUG: &str = "TPORT_DEBUG";
pub const TPORT_DUMP: &str = "TPORT_DUMP";
pub const TPORT_CAPT: &str = "TPORT_CAPT";

/// Diagnostic switches, normally taken from the environment.
#[derive(Clone, Debug, Default)]
pub struct Diagnostics {
    /// Log every sent and received message at info level.
    pub log_messages: bool,
    /// Verbosity 0..=9.
    pub debug_level: Option<u8>,
    pub dump: Option<PathBuf>,
    pub capture: Option<CaptureTarget>,
}

impl Diagnostics {
    pub fn from_env() -> Diagnostics {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Diagnostics {
        let log_messages = lookup(TPORT_LOG).is_some_and(|v| is_truthy(&v));
        let debug_level = lookup(TPORT_DEBUG).and_then(|v| match v.trim().parse::<u8>() {
            Ok(level) => Some(level.min(9)),
            Err(_) => {
                log::warn!("ignoring {TPORT_DEBUG}={v:?}");
                None
            }
        });
        let dump = lookup(TPORT_DUMP)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let capture = lookup(TPORT_CAPT).and_then(|v| match v.parse::<CaptureTarget>() {
            Ok(target) => Some(target),
            Err(e) => {
                log::warn!("ignoring {TPORT_CAPT}={v:?}: {e}");
                None
            }
        });
        Diagnostics {
            log_messages,
            debug_level,
            dump,
            capture,
        }
    }

    /// Fills what is unset here from `env`. Explicit settings win.
    pub fn merge(mut self, env: Diagnostics) -> Self {
        self.log_messages |= env.log_messages;
        self.debug_level = self.debug_level.or(env.debug_level);
        self.dump = self.dump.or(env.dump);
        self.capture = self.capture.or(env.capture);
        self
    }

    pub fn set_log_messages(mut self, log_messages: bool) -> Self {
        self.log_messages = log_messages;
        self
    }
    pub fn set_dump(mut self, path: impl Into<PathBuf>) -> Self {
        self.dump.replace(path.into());
        self
    }
    pub fn set_capture(mut self, target: CaptureTarget) -> Self {
        self.capture.replace(target);
        self
    }

    /// Applies `debug_level` to the global log filter.
    pub(crate) fn apply_level(&self) {
        if let Some(level) = self.debug_level {
            log::set_max_level(level_filter(level));
        }
    }
}

fn is_truthy(v: &str) -> bool {
    !matches!(v.trim(), "" | "0" | "false" | "no" | "off")
}

pub fn level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::Off,
        1 | 2 => LevelFilter::Error,
        3 => LevelFilter::Warn,
        4 | 5 => LevelFilter::Info,
        6..=8 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}
