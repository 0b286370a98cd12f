//! Lifecycle events emitted for the audit/quota collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{BackendKind, SessionKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Started {
        session_id: String,
        user_id: String,
        kind: SessionKind,
        backend: BackendKind,
        at: DateTime<Utc>,
    },
    Stopped {
        session_id: String,
        user_id: String,
        reason: String,
        usage_minutes: i64,
        at: DateTime<Utc>,
    },
    Expired {
        session_id: String,
        user_id: String,
        at: DateTime<Utc>,
    },
    Error {
        session_id: String,
        user_id: String,
        message: String,
        at: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    pub fn session_id(&self) -> &str {
        match self {
            LifecycleEvent::Started { session_id, .. }
            | LifecycleEvent::Stopped { session_id, .. }
            | LifecycleEvent::Expired { session_id, .. }
            | LifecycleEvent::Error { session_id, .. } => session_id,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            LifecycleEvent::Started { user_id, .. }
            | LifecycleEvent::Stopped { user_id, .. }
            | LifecycleEvent::Expired { user_id, .. }
            | LifecycleEvent::Error { user_id, .. } => user_id,
        }
    }
}
