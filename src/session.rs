//! Mode exclusivity
//!
//! Grid trading and volume cycling compete for the same balances, so only
//! one of them may run at a time. A worker holds a [`ModeGuard`] for as long
//! as it runs; dropping the guard frees the session.

use std::fmt;
use std::sync::{Arc, Mutex};

use log::info;
use serde::{Deserialize, Serialize};

use crate::grid::errors::{GridError, GridResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    #[default]
    Grid,
    Volume,
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Grid => write!(f, "grid"),
            TradingMode::Volume => write!(f, "volume"),
        }
    }
}

/// Tracks which mode, if any, currently owns the account
#[derive(Debug, Clone, Default)]
pub struct TradingSession {
    active: Arc<Mutex<Option<TradingMode>>>,
}

impl TradingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the session for `mode`
    ///
    /// Fails with [`GridError::ModeConflict`] while any mode, including the
    /// same one, is already running.
    pub fn acquire(&self, mode: TradingMode) -> GridResult<ModeGuard> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| GridError::Inconsistent("session lock poisoned".into()))?;
        if let Some(running) = *active {
            return Err(GridError::ModeConflict {
                requested: mode.to_string(),
                running: running.to_string(),
            });
        }
        *active = Some(mode);
        info!("Trading session acquired for {} mode", mode);
        Ok(ModeGuard {
            mode,
            active: self.active.clone(),
        })
    }

    pub fn active(&self) -> Option<TradingMode> {
        self.active.lock().ok().and_then(|active| *active)
    }
}

/// Releases the session when dropped
#[derive(Debug)]
pub struct ModeGuard {
    mode: TradingMode,
    active: Arc<Mutex<Option<TradingMode>>>,
}

impl ModeGuard {
    pub fn mode(&self) -> TradingMode {
        self.mode
    }
}

impl Drop for ModeGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            if *active == Some(self.mode) {
                *active = None;
            }
        }
        info!("Trading session released by {} mode", self.mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modes_are_mutually_exclusive() {
        let session = TradingSession::new();
        let guard = session.acquire(TradingMode::Grid).unwrap();
        assert_eq!(session.active(), Some(TradingMode::Grid));

        let err = session.acquire(TradingMode::Volume).unwrap_err();
        assert!(matches!(
            err,
            GridError::ModeConflict { ref requested, ref running }
                if requested == "volume" && running == "grid"
        ));
        assert!(session.acquire(TradingMode::Grid).is_err());

        drop(guard);
        assert_eq!(session.active(), None);
        let guard = session.acquire(TradingMode::Volume).unwrap();
        assert_eq!(guard.mode(), TradingMode::Volume);
    }

    #[test]
    fn test_mode_parses_lowercase() {
        let mode: TradingMode = serde_json::from_str("\"volume\"").unwrap();
        assert_eq!(mode, TradingMode::Volume);
        assert_eq!(TradingMode::default(), TradingMode::Grid);
    }
}
