//! Process-wide map of live download sessions.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::session::{DownloadSession, SessionState};
use crate::{Error, Result};

/// At most one session per download id.
///
/// Injected wherever sessions are looked up; every mutation goes through one
/// lock so create/remove never interleave.
#[derive(Default)]
pub struct DownloadRegistry {
    sessions: Mutex<HashMap<String, Arc<DownloadSession>>>,
}

impl DownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for `id`, or hand back the one already there.
    ///
    /// Returns `(session, created)`. An existing paused session is returned
    /// as is; a terminal one is replaced. Any other live session means the
    /// download is already running and the call fails with `Conflict`.
    pub fn get_or_create(
        &self,
        id: &str,
        create: impl FnOnce() -> Arc<DownloadSession>,
    ) -> Result<(Arc<DownloadSession>, bool)> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(id) {
            match existing.state() {
                SessionState::Paused => return Ok((existing.clone(), false)),
                state if state.is_terminal() => {
                    debug!(download_id = %id, %state, "Replacing ended session");
                }
                _ => return Err(Error::conflict(id)),
            }
        }

        let session = create();
        sessions.insert(id.to_string(), session.clone());
        debug!(download_id = %id, total = sessions.len(), "Session registered");
        Ok((session, true))
    }

    pub fn get(&self, id: &str) -> Option<Arc<DownloadSession>> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<DownloadSession>> {
        self.sessions.lock().remove(id)
    }

    /// Remove `id` only while it still maps to `session`.
    ///
    /// Terminal hooks use this so a late hook never drops a newer session.
    pub fn remove_if_same(&self, id: &str, session: &Arc<DownloadSession>) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(id);
                debug!(download_id = %id, "Session unregistered");
                true
            }
            _ => false,
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    pub fn sessions(&self) -> Vec<Arc<DownloadSession>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::record::{DownloadRecord, QualitySelector};
    use crate::download::session::SessionDeps;
    use crate::testing::TestEnv;
    use media_types::OutputKind;

    fn record() -> DownloadRecord {
        DownloadRecord::new(
            "https://media.example.com/a",
            OutputKind::Audio,
            QualitySelector::highest(),
            "a.mp3",
        )
    }

    fn deps(env: &TestEnv) -> SessionDeps {
        env.deps.clone()
    }

    #[tokio::test]
    async fn test_idle_session_conflicts() {
        let env = TestEnv::new(1024).await;
        let registry = DownloadRegistry::new();
        let rec = record();
        let id = rec.id.clone();

        let (first, created) = registry
            .get_or_create(&id, || DownloadSession::new(rec.clone(), deps(&env)))
            .unwrap();
        assert!(created);

        let err = registry
            .get_or_create(&id, || DownloadSession::new(rec.clone(), deps(&env)))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(&id).unwrap(), &first));
    }

    #[tokio::test]
    async fn test_paused_session_is_reused() {
        let env = TestEnv::new(1024).await;
        let registry = DownloadRegistry::new();
        let rec = record();
        let id = rec.id.clone();

        let (first, _) = registry
            .get_or_create(&id, || DownloadSession::restore(rec.clone(), deps(&env)))
            .unwrap();
        let (second, created) = registry
            .get_or_create(&id, || DownloadSession::new(rec.clone(), deps(&env)))
            .unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_terminal_session_is_replaced() {
        let env = TestEnv::new(1024).await;
        let registry = DownloadRegistry::new();
        let rec = record();
        let id = rec.id.clone();

        let (first, _) = registry
            .get_or_create(&id, || DownloadSession::restore(rec.clone(), deps(&env)))
            .unwrap();
        first.cancel().await.unwrap();

        let (second, created) = registry
            .get_or_create(&id, || DownloadSession::new(rec.clone(), deps(&env)))
            .unwrap();
        assert!(created);
        assert!(!Arc::ptr_eq(&first, &second));

        assert!(!registry.remove_if_same(&id, &first));
        assert!(registry.remove_if_same(&id, &second));
        assert!(registry.is_empty());
    }
}
