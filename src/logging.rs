//! Logging setup with runtime level control.
//!
//! Initializes a `tracing` subscriber whose maximum level can be stepped up
//! or down at runtime, driving the manager's LogLevelUp/LogLevelDown
//! requests.

use crate::error::{HavenError, Result};
use parking_lot::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, reload, Registry};

/// Level ordering for runtime stepping, quietest first.
const LEVELS: [LevelFilter; 5] = [
    LevelFilter::ERROR,
    LevelFilter::WARN,
    LevelFilter::INFO,
    LevelFilter::DEBUG,
    LevelFilter::TRACE,
];

/// Handle for stepping the global log level at runtime.
pub struct LogHandle {
    reload: reload::Handle<LevelFilter, Registry>,
    current: Mutex<LevelFilter>,
}

impl LogHandle {
    /// Step toward more verbose output. Returns the new level, or `Err`
    /// when the maximum level is already set.
    pub fn increase(&self) -> Result<LevelFilter> {
        self.step(true)
    }

    /// Step toward quieter output. Returns the new level, or `Err` when
    /// the minimum level is already set.
    pub fn decrease(&self) -> Result<LevelFilter> {
        self.step(false)
    }

    pub fn current(&self) -> LevelFilter {
        *self.current.lock()
    }

    fn step(&self, up: bool) -> Result<LevelFilter> {
        let mut current = self.current.lock();
        let next = next_level(*current, up).ok_or_else(|| {
            HavenError::Internal(format!(
                "{} level has been already set",
                if up { "maximum" } else { "minimum" }
            ))
        })?;

        self.reload
            .reload(next)
            .map_err(|e| HavenError::Internal(format!("cannot change log level: {}", e)))?;
        *current = next;
        Ok(next)
    }
}

fn next_level(current: LevelFilter, up: bool) -> Option<LevelFilter> {
    let index = LEVELS.iter().position(|l| *l == current)?;
    if up {
        LEVELS.get(index + 1).copied()
    } else {
        index.checked_sub(1).map(|i| LEVELS[i])
    }
}

fn parse_level(level: &str) -> Result<LevelFilter> {
    level.parse().map_err(|_| HavenError::InvalidConfig {
        field: "log_level".to_string(),
        reason: format!("unknown level \"{}\"", level),
    })
}

/// Initialize logging at the given level and return the runtime handle.
///
/// Fails if a global subscriber is already installed.
pub fn init(level: &str) -> Result<LogHandle> {
    let level = parse_level(level)?;
    let (filter, handle) = reload::Layer::new(level);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| HavenError::Internal(format!("cannot init logging: {}", e)))?;

    Ok(LogHandle {
        reload: handle,
        current: Mutex::new(level),
    })
}
