use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{FlowgateError, Result, ShareLock, session::ToolAccess, utils};

/// Permission tier bound at session creation. Cannot be elevated
/// mid-session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionMode {
    /// Read-classified tools only.
    #[default]
    Safe,
    /// Read, write, and management tools.
    Power,
}

impl SessionMode {
    pub fn allows(
        &self,
        access: ToolAccess,
    ) -> bool {
        match access {
            ToolAccess::Read => true,
            ToolAccess::Write | ToolAccess::Manage => *self == SessionMode::Power,
        }
    }
}

/// One RPC connection's state.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub mode: SessionMode,
    /// Bound workspace context, released on close.
    pub workspace: Option<String>,
    pub created_at: i64,
    pub last_activity: i64,
}

/// Session registry with idle expiry.
#[derive(Clone)]
pub struct SessionManager {
    sessions: ShareLock<HashMap<String, Session>>,
    idle_timeout_ms: i64,
}

impl SessionManager {
    pub fn new(idle_timeout_seconds: u64) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            idle_timeout_ms: (idle_timeout_seconds as i64) * 1000,
        }
    }

    /// Create a session; the mode is fixed for its lifetime.
    pub fn open(
        &self,
        mode: SessionMode,
        workspace: Option<String>,
    ) -> Session {
        self.sweep_expired();

        let now = utils::time::time_millis();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            mode,
            workspace,
            created_at: now,
            last_activity: now,
        };
        self.sessions.write().unwrap().insert(session.id.clone(), session.clone());
        session
    }

    /// Resolve a session by id, refreshing its activity timestamp.
    pub fn get(
        &self,
        id: &str,
    ) -> Result<Session> {
        self.sweep_expired();

        let mut sessions = self.sessions.write().unwrap();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| FlowgateError::NotFound(format!("unknown or expired session '{}'", id)))?;
        session.last_activity = utils::time::time_millis();
        Ok(session.clone())
    }

    /// Tear down a session. In-flight pipeline runs it triggered are not
    /// affected.
    pub fn close(
        &self,
        id: &str,
    ) -> bool {
        self.sessions.write().unwrap().remove(id).is_some()
    }

    fn sweep_expired(&self) {
        let now = utils::time::time_millis();
        let mut sessions = self.sessions.write().unwrap();
        sessions.retain(|_, session| now - session.last_activity <= self.idle_timeout_ms);
    }

    /// Active sessions, for diagnostics.
    pub fn active(&self) -> Vec<Session> {
        self.sessions.read().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_gating() {
        assert!(SessionMode::Safe.allows(ToolAccess::Read));
        assert!(!SessionMode::Safe.allows(ToolAccess::Write));
        assert!(!SessionMode::Safe.allows(ToolAccess::Manage));
        assert!(SessionMode::Power.allows(ToolAccess::Write));
        assert!(SessionMode::Power.allows(ToolAccess::Manage));
    }

    #[test]
    fn test_open_get_close() {
        let manager = SessionManager::new(1800);
        let session = manager.open(SessionMode::Power, None);

        let found = manager.get(&session.id).unwrap();
        assert_eq!(found.mode, SessionMode::Power);

        assert!(manager.close(&session.id));
        assert!(manager.get(&session.id).is_err());
    }

    #[test]
    fn test_expired_sessions_are_swept() {
        let manager = SessionManager::new(0);
        let session = manager.open(SessionMode::Safe, None);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(manager.get(&session.id).is_err());
    }
}
