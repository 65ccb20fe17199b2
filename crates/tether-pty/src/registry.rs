use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::session::{Session, SessionConfig, SessionError, SessionId, SessionInfo};

/// When sessions are removed from the registry by [`SessionRegistry::reap_expired`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapPolicy {
    /// Kill and remove running sessions that have had no attached connection
    /// and no client activity for this long. `None` disables idle reaping.
    pub idle_timeout: Option<Duration>,
    /// Keep exited sessions this long so late attaches get a "dead" answer
    /// instead of "not found".
    pub exited_retention: Duration,
}

impl Default for ReapPolicy {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(24 * 60 * 60)),
            exited_retention: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapReason {
    Exited,
    Idle,
}

/// The authoritative map of live sessions.
///
/// One instance per broker, shared by reference. Creation and reaping take
/// the write lock; lookups share the read lock. Process spawning happens
/// outside the lock so a slow spawn never blocks lookups.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Spawn a shell in `workspace_dir` and register it as running.
    pub fn create(
        &self,
        workspace_dir: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<Session>, SessionError> {
        let session = Session::spawn(&self.config, workspace_dir, cols, rows)?;
        self.write().insert(session.id(), Arc::clone(&session));
        log::info!(
            "session {}: created in {} ({cols}x{rows})",
            session.id(),
            workspace_dir.display()
        );
        Ok(session)
    }

    /// Find a session by id. Exited sessions are still returned until reaped.
    pub fn lookup(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.read().get(id).cloned()
    }

    /// Remove an exited session.
    pub fn reap(&self, id: &SessionId) -> Result<Arc<Session>, SessionError> {
        let mut sessions = self.write();
        let session = sessions.get(id).ok_or(SessionError::NotFound(*id))?;
        if !session.is_exited() {
            return Err(SessionError::StillRunning(*id));
        }
        let session = sessions.remove(id).ok_or(SessionError::NotFound(*id))?;
        log::info!("session {id}: reaped");
        Ok(session)
    }

    /// Remove a session regardless of state and kill its process.
    pub fn terminate(&self, id: &SessionId) -> Result<Arc<Session>, SessionError> {
        let session = self.write().remove(id).ok_or(SessionError::NotFound(*id))?;
        session.terminate();
        Ok(session)
    }

    /// Apply `policy` as of `now`, returning what was removed.
    ///
    /// Idle sessions are killed after being unregistered; their attached set
    /// is empty by definition, so nobody observes the exit event.
    pub fn reap_expired(&self, now: DateTime<Utc>, policy: &ReapPolicy) -> Vec<(SessionId, ReapReason)> {
        let retention = to_chrono(policy.exited_retention);
        let idle_timeout = policy.idle_timeout.map(to_chrono);

        let mut removed = Vec::new();
        {
            let mut sessions = self.write();
            sessions.retain(|id, session| {
                let reason = if let Some(exited_at) = session.exited_at() {
                    (now - exited_at >= retention).then_some(ReapReason::Exited)
                } else {
                    idle_timeout.and_then(|timeout| {
                        let idle = session.attached_count() == 0
                            && now - session.last_activity_at() >= timeout;
                        idle.then_some(ReapReason::Idle)
                    })
                };
                match reason {
                    Some(reason) => {
                        removed.push((*id, reason, Arc::clone(session)));
                        false
                    }
                    None => true,
                }
            });
        }

        removed
            .into_iter()
            .map(|(id, reason, session)| {
                if reason == ReapReason::Idle {
                    session.terminate();
                }
                log::info!("session {id}: reaped ({reason:?})");
                (id, reason)
            })
            .collect()
    }

    /// Snapshot of every registered session, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.read().values().map(|s| s.info()).collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{collect_until, quiet_config, shell_config, wait_for_exit};
    use crate::session::SessionState;
    use crate::session::subscriber_channel;
    use uuid::Uuid;

    #[test]
    fn test_create_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(shell_config());

        let session = registry.create(dir.path(), 80, 24).unwrap();

        let found = registry.lookup(&session.id()).unwrap();
        assert_eq!(found.id(), session.id());
        assert_eq!(found.state(), SessionState::Running);
        assert_eq!(registry.len(), 1);
        session.terminate();
    }

    #[test]
    fn test_lookup_unknown() {
        let registry = SessionRegistry::default();
        assert!(registry.lookup(&Uuid::new_v4()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_create_in_missing_workspace_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(shell_config());
        let result = registry.create(&dir.path().join("missing"), 80, 24);
        assert!(matches!(result, Err(SessionError::WorkspaceMissing(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_session_ids_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(quiet_config(1024));
        let a = registry.create(dir.path(), 80, 24).unwrap();
        let b = registry.create(dir.path(), 80, 24).unwrap();
        assert_ne!(a.id(), b.id());
        let listed: Vec<SessionId> = registry.list().iter().map(|i| i.id).collect();
        assert_eq!(listed, vec![a.id(), b.id()]);
        a.terminate();
        b.terminate();
    }

    #[test]
    fn test_reap_refuses_running_session() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(quiet_config(1024));
        let session = registry.create(dir.path(), 80, 24).unwrap();

        let result = registry.reap(&session.id());
        assert!(matches!(result, Err(SessionError::StillRunning(_))));
        assert!(registry.lookup(&session.id()).is_some());
        session.terminate();
    }

    #[test]
    fn test_reap_exited_session() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(shell_config());
        let session = registry.create(dir.path(), 80, 24).unwrap();
        let conn = Uuid::new_v4();
        let (tx, mut rx) = subscriber_channel();
        session.attach(conn, tx, false).unwrap();
        session.input(conn, b"exit\n").unwrap();
        assert!(wait_for_exit(&mut rx).is_some());

        // Until reaped, attach reports the session as dead rather than missing.
        let found = registry.lookup(&session.id()).unwrap();
        let (tx, _rx) = subscriber_channel();
        assert!(matches!(found.attach(conn, tx, true), Err(SessionError::Dead(_))));

        registry.reap(&session.id()).unwrap();
        assert!(registry.lookup(&session.id()).is_none());
        assert!(matches!(registry.reap(&session.id()), Err(SessionError::NotFound(_))));
    }

    #[test]
    fn test_terminate_removes_and_kills() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(shell_config());
        let session = registry.create(dir.path(), 80, 24).unwrap();
        let (tx, mut rx) = subscriber_channel();
        session.attach(Uuid::new_v4(), tx, false).unwrap();

        registry.terminate(&session.id()).unwrap();

        assert!(registry.lookup(&session.id()).is_none());
        assert!(wait_for_exit(&mut rx).is_some());
        assert!(matches!(
            registry.terminate(&session.id()),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn test_independent_sessions_do_not_cross_talk() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(shell_config());
        let a = registry.create(dir.path(), 80, 24).unwrap();
        let b = registry.create(dir.path(), 80, 24).unwrap();
        let conn = Uuid::new_v4();
        let (tx_a, mut rx_a) = subscriber_channel();
        let (tx_b, mut rx_b) = subscriber_channel();
        a.attach(conn, tx_a, false).unwrap();
        b.attach(conn, tx_b, false).unwrap();

        a.input(conn, b"echo ALPHA$((1+1))\n").unwrap();
        b.input(conn, b"echo BRAVO$((2+2))\n").unwrap();

        let out_a = collect_until(&mut rx_a, "ALPHA2");
        let out_b = collect_until(&mut rx_b, "BRAVO4");
        assert!(out_a.contains("ALPHA2") && !out_a.contains("BRAVO"), "a: {out_a}");
        assert!(out_b.contains("BRAVO4") && !out_b.contains("ALPHA"), "b: {out_b}");
        a.terminate();
        b.terminate();
    }

    #[test]
    fn test_reap_expired_idle_and_exited() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(quiet_config(1024));
        let idle = registry.create(dir.path(), 80, 24).unwrap();
        let watched = registry.create(dir.path(), 80, 24).unwrap();
        let exited = registry.create(dir.path(), 80, 24).unwrap();

        let (tx, _rx) = subscriber_channel();
        watched.attach(Uuid::new_v4(), tx, false).unwrap();
        exited.handle_exit(Some(0));

        let policy = ReapPolicy {
            idle_timeout: Some(Duration::from_secs(60)),
            exited_retention: Duration::from_secs(30),
        };

        // Nothing is old enough yet.
        assert!(registry.reap_expired(Utc::now(), &policy).is_empty());

        let later = Utc::now() + chrono::Duration::seconds(120);
        let mut reaped = registry.reap_expired(later, &policy);
        reaped.sort_by_key(|(id, _)| *id);
        let mut expected = vec![(idle.id(), ReapReason::Idle), (exited.id(), ReapReason::Exited)];
        expected.sort_by_key(|(id, _)| *id);
        assert_eq!(reaped, expected);

        assert!(registry.lookup(&watched.id()).is_some());
        assert_eq!(registry.len(), 1);
        watched.terminate();
        exited.terminate();
    }

    #[test]
    fn test_idle_reaping_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(quiet_config(1024));
        let session = registry.create(dir.path(), 80, 24).unwrap();
        let policy = ReapPolicy {
            idle_timeout: None,
            exited_retention: Duration::from_secs(0),
        };

        let much_later = Utc::now() + chrono::Duration::days(30);
        assert!(registry.reap_expired(much_later, &policy).is_empty());
        assert_eq!(registry.len(), 1);
        session.terminate();
    }

    #[test]
    fn test_concurrent_create_lookup_and_reap() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SessionRegistry::new(quiet_config(1024)));

        let creators: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let dir = dir.path().to_path_buf();
                std::thread::spawn(move || {
                    (0..5)
                        .map(|_| {
                            let session = registry.create(&dir, 80, 24).unwrap();
                            assert!(registry.lookup(&session.id()).is_some());
                            session.id()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let sweeper = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    assert!(registry.reap_expired(Utc::now(), &ReapPolicy::default()).is_empty());
                    assert!(registry.list().len() <= 20);
                }
            })
        };

        let ids: Vec<SessionId> = creators
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        sweeper.join().unwrap();

        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 20);
        assert_eq!(registry.len(), 20);

        let terminators: Vec<_> = ids
            .chunks(5)
            .map(|chunk| {
                let registry = Arc::clone(&registry);
                let chunk = chunk.to_vec();
                std::thread::spawn(move || {
                    for id in chunk {
                        registry.terminate(&id).unwrap();
                        assert!(registry.lookup(&id).is_none());
                        assert!(registry.terminate(&id).is_err());
                    }
                })
            })
            .collect();
        for handle in terminators {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
