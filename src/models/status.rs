//! Per-version lifecycle state machine.
//!
//! `Start -> Loading -> Available -> Unloading -> End`, with two side exits:
//! a failed load stays in `Loading` carrying an error code, and a version
//! retired before it became available goes `Loading -> End` (or `Start -> End`).
//! Every transition is applied under the watch channel's lock and wakes all
//! subscribers, so request handlers can wait for a load to settle.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

/// Lifecycle state of one model version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionState {
    Start,
    Loading,
    Available,
    Unloading,
    End,
}

impl VersionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionState::Start => "START",
            VersionState::Loading => "LOADING",
            VersionState::Available => "AVAILABLE",
            VersionState::Unloading => "UNLOADING",
            VersionState::End => "END",
        }
    }

    /// States in which a version still counts as wanted by the registry.
    pub fn is_live(&self) -> bool {
        matches!(self, VersionState::Start | VersionState::Loading | VersionState::Available)
    }
}

impl fmt::Display for VersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason a version failed to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    PathInvalid,
    ModelFileMissing,
    InvalidFormat,
    UnsupportedDevice,
    BackendFailure,
    Io,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PathInvalid => "path_invalid",
            ErrorCode::ModelFileMissing => "model_file_missing",
            ErrorCode::InvalidFormat => "invalid_format",
            ErrorCode::UnsupportedDevice => "unsupported_device",
            ErrorCode::BackendFailure => "backend_failure",
            ErrorCode::Io => "io",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Invalid version state transition: {from} -> {to}")]
    Invalid { from: VersionState, to: VersionState },

    #[error("Version was retired while loading")]
    RetiredWhileLoading,
}

/// Point-in-time view of a version status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub state: VersionState,
    pub error_code: Option<ErrorCode>,
    pub changed_at: DateTime<Utc>,
}

impl StatusSnapshot {
    /// True once waiting on this version can no longer change the outcome.
    pub fn is_settled(&self) -> bool {
        match self.state {
            VersionState::Start | VersionState::Loading => self.error_code.is_some(),
            _ => true,
        }
    }

    pub fn is_available(&self) -> bool {
        self.state == VersionState::Available
    }

    pub fn is_load_failed(&self) -> bool {
        self.state == VersionState::Loading && self.error_code.is_some()
    }
}

/// What `begin_retire` did to the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetireStep {
    /// Nothing was loaded; the status went straight to `End`.
    Ended,
    /// A load is in flight; the load worker finishes the retirement.
    Deferred,
    /// `Available -> Unloading`; teardown waits for pins to drain.
    Unloading,
    /// Already `Unloading` or `End`.
    AlreadyRetiring,
}

#[derive(Debug, Clone, Copy)]
struct Inner {
    snapshot: StatusSnapshot,
    retire_pending: bool,
}

/// Monitor-guarded lifecycle state with change broadcast.
#[derive(Debug)]
pub struct VersionStatus {
    tx: watch::Sender<Inner>,
}

impl VersionStatus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Inner {
            snapshot: StatusSnapshot {
                state: VersionState::Start,
                error_code: None,
                changed_at: Utc::now(),
            },
            retire_pending: false,
        });
        Self { tx }
    }

    pub fn state(&self) -> VersionState {
        self.tx.borrow().snapshot.state
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.tx.borrow().snapshot.error_code
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.tx.borrow().snapshot
    }

    pub fn set_loading(&self) -> Result<(), TransitionError> {
        self.transition(VersionState::Loading, |inner| {
            inner.snapshot.state == VersionState::Start
        })
    }

    /// `Loading -> Available`, refused if a retirement arrived mid-load.
    pub fn set_available(&self) -> Result<(), TransitionError> {
        let mut result = Ok(());
        self.tx.send_if_modified(|inner| {
            let snap = &mut inner.snapshot;
            if snap.state != VersionState::Loading || snap.error_code.is_some() {
                result = Err(TransitionError::Invalid {
                    from: snap.state,
                    to: VersionState::Available,
                });
                return false;
            }
            if inner.retire_pending {
                result = Err(TransitionError::RetiredWhileLoading);
                return false;
            }
            snap.state = VersionState::Available;
            snap.changed_at = Utc::now();
            true
        });
        result
    }

    /// Record a load failure; the state stays `Loading`.
    pub fn set_load_failed(&self, code: ErrorCode) -> Result<(), TransitionError> {
        let mut result = Ok(());
        self.tx.send_if_modified(|inner| {
            let snap = &mut inner.snapshot;
            if snap.state != VersionState::Loading || snap.error_code.is_some() {
                result = Err(TransitionError::Invalid {
                    from: snap.state,
                    to: VersionState::Loading,
                });
                return false;
            }
            snap.error_code = Some(code);
            snap.changed_at = Utc::now();
            true
        });
        result
    }

    pub fn set_unloading(&self) -> Result<(), TransitionError> {
        self.transition(VersionState::Unloading, |inner| {
            inner.snapshot.state == VersionState::Available
        })
    }

    pub fn set_end(&self) -> Result<(), TransitionError> {
        self.transition(VersionState::End, |inner| {
            matches!(
                inner.snapshot.state,
                VersionState::Start | VersionState::Loading | VersionState::Unloading
            )
        })
    }

    /// Apply the retirement step appropriate for the current state, atomically.
    pub(crate) fn begin_retire(&self) -> RetireStep {
        let mut step = RetireStep::AlreadyRetiring;
        self.tx.send_if_modified(|inner| {
            let now = Utc::now();
            match inner.snapshot.state {
                VersionState::Start => {
                    inner.snapshot.state = VersionState::End;
                    inner.snapshot.changed_at = now;
                    step = RetireStep::Ended;
                    true
                }
                VersionState::Loading if inner.snapshot.error_code.is_some() => {
                    inner.snapshot.state = VersionState::End;
                    inner.snapshot.changed_at = now;
                    step = RetireStep::Ended;
                    true
                }
                VersionState::Loading => {
                    step = RetireStep::Deferred;
                    inner.retire_pending = true;
                    false
                }
                VersionState::Available => {
                    inner.snapshot.state = VersionState::Unloading;
                    inner.snapshot.changed_at = now;
                    step = RetireStep::Unloading;
                    true
                }
                VersionState::Unloading | VersionState::End => false,
            }
        });
        step
    }

    pub(crate) fn is_retire_pending(&self) -> bool {
        self.tx.borrow().retire_pending
    }

    /// Wait until the version leaves the in-progress part of its lifecycle.
    ///
    /// Returns `None` on timeout. Never mutates the state.
    pub async fn wait_settled(&self, timeout: Duration) -> Option<StatusSnapshot> {
        let mut rx = self.tx.subscribe();
        let wait = rx.wait_for(|inner| inner.snapshot.is_settled());
        let settled = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(inner)) => Some(inner.snapshot),
            // The sender lives as long as `self`, so a closed channel cannot happen here.
            Ok(Err(_)) => Some(self.snapshot()),
            Err(_) => None,
        };
        settled
    }

    /// Wait until the status reaches `state`. False on timeout.
    pub async fn wait_for_state(&self, state: VersionState, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let wait = rx.wait_for(|inner| inner.snapshot.state == state);
        let reached = matches!(tokio::time::timeout(timeout, wait).await, Ok(Ok(_)));
        reached
    }

    fn transition<F>(&self, to: VersionState, allowed: F) -> Result<(), TransitionError>
    where
        F: FnOnce(&Inner) -> bool,
    {
        let mut result = Ok(());
        self.tx.send_if_modified(|inner| {
            if !allowed(inner) {
                result = Err(TransitionError::Invalid {
                    from: inner.snapshot.state,
                    to,
                });
                return false;
            }
            inner.snapshot.state = to;
            inner.snapshot.changed_at = Utc::now();
            true
        });
        result
    }
}

impl Default for VersionStatus {
    fn default() -> Self {
        Self::new()
    }
}
