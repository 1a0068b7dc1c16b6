//! Session manager: the authoritative registry of recording sessions.
//!
//! A session id is in the active registry exactly when the session has no end
//! time. Completion removes the session and stamps its end time under one
//! write lock, then persists `session_metadata.json` atomically.

use crate::core::{ListenerRegistry, Session, SharedTimeBase, SubscriptionId};
use crate::storage::{read_json, write_json_atomic, SessionLayout, StorageError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} already exists")]
    DuplicateId(String),

    #[error("session {0} not found")]
    NotFound(String),

    #[error("invalid session id {0:?}: must be a single path component")]
    InvalidId(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A session id names one directory directly under the sessions root.
fn validate_session_id(session_id: &str) -> Result<(), SessionError> {
    let escapes = session_id.is_empty()
        || session_id.contains("..")
        || session_id.contains(['/', '\\', '\0'])
        || session_id == ".";
    if escapes {
        return Err(SessionError::InvalidId(session_id.to_string()));
    }
    Ok(())
}

/// Events published by the session manager.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Created(Session),
    Updated(Session),
    Completed(Session),
    Error { session_id: String, message: String },
}

/// Read-only statistics for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,
    pub duration_ms: i64,
    pub sample_count: u64,
    pub sync_mark_count: usize,
    pub is_active: bool,
    pub data_types: String,
}

/// Parameters of a new session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub session_id: Option<String>,
    pub participant_id: Option<String>,
    pub study_name: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl NewSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn participant(mut self, participant_id: impl Into<String>) -> Self {
        self.participant_id = Some(participant_id.into());
        self
    }

    pub fn study(mut self, study_name: impl Into<String>) -> Self {
        self.study_name = Some(study_name.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub struct SessionManager {
    time_base: SharedTimeBase,
    sessions_root: PathBuf,
    id_prefix: String,
    host: String,
    /// Identifies this process run across the sessions it records
    instance_id: Uuid,
    active: RwLock<HashMap<String, Session>>,
    completed: RwLock<HashMap<String, Session>>,
    listeners: ListenerRegistry<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        time_base: SharedTimeBase,
        sessions_root: impl Into<PathBuf>,
        id_prefix: impl Into<String>,
    ) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            time_base,
            sessions_root: sessions_root.into(),
            id_prefix: id_prefix.into(),
            host,
            instance_id: Uuid::new_v4(),
            active: RwLock::new(HashMap::new()),
            completed: RwLock::new(HashMap::new()),
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn sessions_root(&self) -> &Path {
        &self.sessions_root
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.layout(session_id).dir().to_path_buf()
    }

    pub fn layout(&self, session_id: &str) -> SessionLayout {
        SessionLayout::new(&self.sessions_root, session_id)
    }

    /// Generates a fresh, time-ordered session id.
    pub fn generate_id(&self) -> String {
        self.time_base.new_session_id(&self.id_prefix)
    }

    /// Registers a new active session and creates its directory.
    ///
    /// Fails with [`SessionError::DuplicateId`] if the id is active, was
    /// completed in this process, or already has finalized metadata on disk,
    /// and with [`SessionError::InvalidId`] if the id would leave the
    /// sessions root.
    pub fn create_session(&self, request: NewSession) -> Result<Session, SessionError> {
        let session_id = request.session_id.unwrap_or_else(|| self.generate_id());
        validate_session_id(&session_id)?;
        let layout = self.layout(&session_id);

        let session = {
            let mut active = self.active.write();
            if active.contains_key(&session_id)
                || self.completed.read().contains_key(&session_id)
                || layout.session_metadata_json().exists()
            {
                return Err(SessionError::DuplicateId(session_id));
            }
            layout.ensure()?;

            let now = self.time_base.now();
            let mut session = Session::new(session_id.clone(), now.wall_clock_ms);
            session.participant_id = request.participant_id;
            session.study_name = request.study_name;
            session.metadata = self.time_base.timing_metadata();
            session.metadata.insert("host".to_string(), self.host.clone());
            session
                .metadata
                .insert("instance_id".to_string(), self.instance_id.to_string());
            session
                .metadata
                .insert("created_at".to_string(), crate::core::TimeBase::format_timestamp(now.wall_clock_ms));
            session.metadata.extend(request.metadata);

            active.insert(session_id.clone(), session.clone());
            session
        };

        info!(session_id = %session_id, dir = %layout.dir().display(), "session created");
        self.listeners.emit(&SessionEvent::Created(session.clone()));
        Ok(session)
    }

    /// Snapshot of an active or completed session.
    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        if let Some(session) = self.active.read().get(session_id) {
            return Some(session.clone());
        }
        if let Some(session) = self.completed.read().get(session_id) {
            return Some(session.clone());
        }
        self.load_session(session_id).ok()
    }

    pub fn get_active_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.active.read().values().cloned().collect();
        sessions.sort_by(|a, b| {
            a.start_time_ms
                .cmp(&b.start_time_ms)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.active.read().contains_key(session_id)
    }

    /// Applies `update` to an active session. Returns false if the session is
    /// not active.
    pub fn update_session<F>(&self, session_id: &str, update: F) -> bool
    where
        F: FnOnce(&mut Session),
    {
        let snapshot = {
            let mut active = self.active.write();
            let Some(session) = active.get_mut(session_id) else {
                debug!(session_id, "update ignored, session not active");
                return false;
            };
            update(session);
            session.clone()
        };
        self.listeners.emit(&SessionEvent::Updated(snapshot));
        true
    }

    /// Finalizes an active session and persists its metadata.
    ///
    /// Returns `None` if the session was not active, so repeated completion is
    /// harmless. A persistence failure is logged and published as
    /// [`SessionEvent::Error`]; the finalized snapshot is still returned.
    pub fn complete_session(&self, session_id: &str) -> Option<Session> {
        let session = {
            let mut active = self.active.write();
            let mut session = active.remove(session_id)?;
            session.finish(self.time_base.now().wall_clock_ms);
            self.completed
                .write()
                .insert(session_id.to_string(), session.clone());
            session
        };

        let path = self.layout(session_id).session_metadata_json();
        match write_json_atomic(&path, &session) {
            Ok(()) => info!(
                session_id,
                duration_ms = session.duration_ms(0),
                samples = session.sample_count(),
                data = %session.data_type_summary(),
                "session completed"
            ),
            Err(e) => {
                error!(session_id, error = %e, "failed to persist session metadata");
                self.listeners.emit(&SessionEvent::Error {
                    session_id: session_id.to_string(),
                    message: e.to_string(),
                });
            }
        }

        self.listeners.emit(&SessionEvent::Completed(session.clone()));
        Some(session)
    }

    pub fn complete_all_sessions(&self) -> Vec<Session> {
        let ids: Vec<String> = self.active.read().keys().cloned().collect();
        ids.iter()
            .filter_map(|id| self.complete_session(id))
            .collect()
    }

    pub fn session_stats(&self, session_id: &str) -> Option<SessionStats> {
        let session = self.get_session(session_id)?;
        let now = self.time_base.now().wall_clock_ms;
        Some(SessionStats {
            session_id: session.session_id.clone(),
            duration_ms: session.duration_ms(now),
            sample_count: session.sample_count(),
            sync_mark_count: session.sync_marks.len(),
            is_active: session.is_active(),
            data_types: session.data_type_summary(),
        })
    }

    /// Reloads a finalized session from its `session_metadata.json`.
    pub fn load_session(&self, session_id: &str) -> Result<Session, SessionError> {
        validate_session_id(session_id)?;
        let path = self.layout(session_id).session_metadata_json();
        if !path.exists() {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        Ok(read_json(&path)?)
    }

    /// Session directories under the sessions root, sorted by name.
    pub fn list_sessions(&self) -> Result<Vec<String>, SessionError> {
        if !self.sessions_root.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.sessions_root)
            .map_err(|e| StorageError::io(&self.sessions_root, e))?;

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&self.sessions_root, e))?;
            if entry.path().is_dir() {
                sessions.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    pub fn report_session_error(&self, session_id: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(session_id, "session error: {message}");
        self.listeners.emit(&SessionEvent::Error {
            session_id: session_id.to_string(),
            message,
        });
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions_root", &self.sessions_root)
            .field("active", &self.active.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ManualClock, SensorKind, TimeBase};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> (Arc<ManualClock>, SessionManager) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let time_base = Arc::new(TimeBase::with_clock(clock.clone()));
        (clock, SessionManager::new(time_base, dir.path(), "GSR"))
    }

    #[test]
    fn test_create_and_complete() {
        let dir = TempDir::new().unwrap();
        let (clock, manager) = manager(&dir);

        let session = manager
            .create_session(NewSession::new().participant("P01").study("pilot"))
            .unwrap();
        assert!(session.session_id.starts_with("GSR_"));
        assert!(manager.is_active(&session.session_id));
        assert!(session.metadata.contains_key("host"));
        assert_eq!(
            session.metadata["instance_id"],
            manager.instance_id().to_string()
        );
        assert!(session.metadata.contains_key("timing.external_offset_ms"));

        clock.advance(2_500);
        let done = manager.complete_session(&session.session_id).unwrap();
        assert!(!done.is_active());
        assert_eq!(done.duration_ms(0), 2_500);
        assert!(!manager.is_active(&session.session_id));

        // Idempotent double completion.
        assert!(manager.complete_session(&session.session_id).is_none());

        let loaded = manager.load_session(&session.session_id).unwrap();
        assert_eq!(loaded, done);
        assert_eq!(loaded.participant_id.as_deref(), Some("P01"));
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        let (_clock, manager) = manager(&dir);

        manager
            .create_session(NewSession::new().with_id("S1"))
            .unwrap();
        assert!(matches!(
            manager.create_session(NewSession::new().with_id("S1")),
            Err(SessionError::DuplicateId(_))
        ));

        manager.complete_session("S1");
        assert!(matches!(
            manager.create_session(NewSession::new().with_id("S1")),
            Err(SessionError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_ids_outside_the_sessions_root_are_rejected() {
        let dir = TempDir::new().unwrap();
        let (_clock, manager) = manager(&dir);

        for id in ["../x", "..", ".", "", "a/b", "a\\b", "/etc", "x/../../y"] {
            assert!(
                matches!(
                    manager.create_session(NewSession::new().with_id(id)),
                    Err(SessionError::InvalidId(_))
                ),
                "{id:?} was accepted"
            );
        }
        assert!(!dir.path().parent().unwrap().join("x").exists());
        assert!(manager.get_active_sessions().is_empty());
        assert!(matches!(
            manager.load_session("../x"),
            Err(SessionError::InvalidId(_))
        ));

        manager
            .create_session(NewSession::new().with_id("P01_run-2.v1"))
            .unwrap();
        assert!(dir.path().join("P01_run-2.v1").is_dir());
    }

    #[test]
    fn test_update_only_applies_to_active_sessions() {
        let dir = TempDir::new().unwrap();
        let (_clock, manager) = manager(&dir);
        manager
            .create_session(NewSession::new().with_id("S1"))
            .unwrap();

        assert!(manager.update_session("S1", |s| {
            s.record_sample_count(42);
            s.mark_data_present(SensorKind::Biosignal);
        }));
        let stats = manager.session_stats("S1").unwrap();
        assert_eq!(stats.sample_count, 42);
        assert_eq!(stats.data_types, "Biosignal");
        assert!(stats.is_active);

        manager.complete_session("S1");
        assert!(!manager.update_session("S1", |s| s.record_sample_count(100)));
        assert_eq!(manager.session_stats("S1").unwrap().sample_count, 42);
    }

    #[test]
    fn test_complete_all_and_listing() {
        let dir = TempDir::new().unwrap();
        let (clock, manager) = manager(&dir);
        let a = manager.create_session(NewSession::new()).unwrap();
        clock.advance(1_000);
        let b = manager.create_session(NewSession::new()).unwrap();

        assert_eq!(manager.get_active_sessions().len(), 2);
        assert_eq!(manager.complete_all_sessions().len(), 2);
        assert!(manager.get_active_sessions().is_empty());

        assert_eq!(
            manager.list_sessions().unwrap(),
            vec![a.session_id, b.session_id]
        );
    }

    #[test]
    fn test_events_are_published() {
        let dir = TempDir::new().unwrap();
        let (_clock, manager) = manager(&dir);
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&events);
        let id = manager.subscribe(move |event| {
            let label = match event {
                SessionEvent::Created(_) => "created",
                SessionEvent::Updated(_) => "updated",
                SessionEvent::Completed(_) => "completed",
                SessionEvent::Error { .. } => "error",
            };
            e.lock().push(label);
        });

        manager
            .create_session(NewSession::new().with_id("S1"))
            .unwrap();
        manager.update_session("S1", |_| {});
        manager.report_session_error("S1", "thermal frame gap");
        manager.complete_session("S1");
        assert!(manager.unsubscribe(id));

        assert_eq!(
            *events.lock(),
            vec!["created", "updated", "error", "completed"]
        );
    }
}
