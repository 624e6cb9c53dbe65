//! The process-wide detection switch.
//!
//! Only explicit admin start/stop requests change it. Every change is written
//! to disk before it becomes visible in memory, so a failed write leaves the
//! previous state in effect.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::settings::write_atomic;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("failed to read activation state {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to persist activation state: {0}")]
    Persist(#[source] std::io::Error),
    #[error("failed to encode activation state: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationState {
    pub active: bool,
    /// Present only while active.
    pub session_id: Option<Uuid>,
    pub started_by: Option<String>,
    pub changed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activated {
    Started(Uuid),
    AlreadyActive(Uuid),
}

/// Lock-free view of the `active` bit for blocking worker loops.
#[derive(Clone, Default)]
pub struct ActiveFlag(Arc<AtomicBool>);

impl ActiveFlag {
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, active: bool) {
        self.0.store(active, Ordering::Release);
    }
}

pub struct Activation {
    path: PathBuf,
    state: RwLock<ActivationState>,
    flag: ActiveFlag,
}

impl Activation {
    /// Load the persisted state; a missing or unreadable document means Inactive.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let state = match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<ActivationState>(&bytes) {
                Ok(state) => normalize(state),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "corrupt activation state; starting inactive");
                    ActivationState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ActivationState::default(),
            Err(source) => {
                return Err(StateError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        tracing::info!(active = state.active, session_id = ?state.session_id, "activation state loaded");
        let flag = ActiveFlag::default();
        flag.set(state.active);
        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(state),
            flag,
        })
    }

    pub fn get(&self) -> ActivationState {
        self.state.read().clone()
    }

    pub fn is_active(&self) -> bool {
        self.flag.get()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.state.read().session_id
    }

    pub fn flag(&self) -> ActiveFlag {
        self.flag.clone()
    }

    /// Inactive -> Active with a fresh session id. Idempotent.
    pub fn activate(&self, actor: &str) -> Result<Activated, StateError> {
        let mut state = self.state.write();
        if let (true, Some(id)) = (state.active, state.session_id) {
            return Ok(Activated::AlreadyActive(id));
        }

        let session_id = Uuid::new_v4();
        let next = ActivationState {
            active: true,
            session_id: Some(session_id),
            started_by: Some(actor.to_string()),
            changed_at: Some(Utc::now()),
        };
        self.persist(&next)?;
        *state = next;
        self.flag.set(true);

        tracing::info!(actor, %session_id, "detection activated");
        Ok(Activated::Started(session_id))
    }

    /// Active -> Inactive. Returns false if already inactive.
    pub fn deactivate(&self, actor: &str) -> Result<bool, StateError> {
        let mut state = self.state.write();
        if !state.active {
            return Ok(false);
        }

        let next = ActivationState {
            active: false,
            session_id: None,
            started_by: None,
            changed_at: Some(Utc::now()),
        };
        self.persist(&next)?;
        let previous = std::mem::replace(&mut *state, next);
        self.flag.set(false);

        tracing::info!(actor, session_id = ?previous.session_id, "detection deactivated");
        Ok(true)
    }

    fn persist(&self, state: &ActivationState) -> Result<(), StateError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path, &bytes).map_err(StateError::Persist)
    }
}

/// An active record without a session id gets one; an inactive one loses it.
fn normalize(mut state: ActivationState) -> ActivationState {
    if state.active && state.session_id.is_none() {
        state.session_id = Some(Uuid::new_v4());
    }
    if !state.active {
        state.session_id = None;
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_inactive_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let activation = Activation::load(&dir.path().join("state.json")).unwrap();
        assert!(!activation.is_active());
        assert!(activation.session_id().is_none());
    }

    #[test]
    fn test_activate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let activation = Activation::load(&dir.path().join("state.json")).unwrap();

        let Activated::Started(first) = activation.activate("admin").unwrap() else {
            panic!("expected a fresh session");
        };
        assert_eq!(activation.activate("other").unwrap(), Activated::AlreadyActive(first));
        assert_eq!(activation.session_id(), Some(first));
        assert_eq!(activation.get().started_by.as_deref(), Some("admin"));
    }

    #[test]
    fn test_state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let session = match Activation::load(&path).unwrap().activate("admin").unwrap() {
            Activated::Started(id) => id,
            Activated::AlreadyActive(id) => id,
        };

        let reloaded = Activation::load(&path).unwrap();
        assert!(reloaded.is_active());
        assert_eq!(reloaded.session_id(), Some(session));

        assert!(reloaded.deactivate("admin").unwrap());
        assert!(!reloaded.deactivate("admin").unwrap());
        assert!(!Activation::load(&path).unwrap().is_active());
    }

    #[test]
    fn test_failed_persist_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::create_dir(&path).unwrap();
        let activation = Activation {
            path,
            state: RwLock::new(ActivationState::default()),
            flag: ActiveFlag::default(),
        };

        assert!(matches!(activation.activate("admin"), Err(StateError::Persist(_))));
        assert!(!activation.is_active());
    }

    #[test]
    fn test_corrupt_file_starts_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(!Activation::load(&path).unwrap().is_active());
    }
}
