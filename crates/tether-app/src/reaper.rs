//! Background task applying the registry's reap policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tether_pty::{ReapPolicy, ReapReason, SessionRegistry};
use tokio::task::JoinHandle;

/// Sweep `registry` every `every` until the runtime shuts down.
pub fn start_reaper(
    registry: Arc<SessionRegistry>,
    policy: ReapPolicy,
    every: Duration,
) -> JoinHandle<()> {
    log::info!(
        "reaper: every {}s, idle timeout {:?}, exited retention {}s",
        every.as_secs(),
        policy.idle_timeout.map(|d| d.as_secs()),
        policy.exited_retention.as_secs()
    );
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(every).await;
            sweep(&registry, &policy, Utc::now());
        }
    })
}

/// One pass. Returns how many sessions were removed.
pub fn sweep(registry: &SessionRegistry, policy: &ReapPolicy, now: DateTime<Utc>) -> usize {
    let removed = registry.reap_expired(now, policy);
    for (id, reason) in &removed {
        match reason {
            ReapReason::Exited => log::info!("reaper: removed exited session {id}"),
            ReapReason::Idle => log::info!("reaper: killed idle session {id}"),
        }
    }
    removed.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_pty::{subscriber_channel, SessionConfig};
    use uuid::Uuid;

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(SessionConfig {
            shell: Some("/bin/sh".into()),
            scrollback_bytes: 1024,
        }))
    }

    #[test]
    fn test_sweep_kills_idle_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let session = registry.create(dir.path(), 80, 24).unwrap();

        let policy = ReapPolicy {
            idle_timeout: Some(Duration::from_secs(60)),
            exited_retention: Duration::from_secs(60),
        };
        assert_eq!(sweep(&registry, &policy, Utc::now()), 0);

        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(sweep(&registry, &policy, later), 1);
        assert!(registry.lookup(&session.id()).is_none());
    }

    #[test]
    fn test_sweep_spares_attached_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let session = registry.create(dir.path(), 80, 24).unwrap();
        let (tx, _rx) = subscriber_channel();
        session.attach(Uuid::new_v4(), tx, false).unwrap();

        let policy = ReapPolicy {
            idle_timeout: Some(Duration::from_secs(1)),
            exited_retention: Duration::from_secs(1),
        };
        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(sweep(&registry, &policy, later), 0);

        registry.terminate(&session.id()).unwrap();
    }

    #[tokio::test]
    async fn test_reaper_task_removes_exited_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let session = registry.create(dir.path(), 80, 24).unwrap();

        let conn = Uuid::new_v4();
        let (tx, _rx) = subscriber_channel();
        session.attach(conn, tx, false).unwrap();
        session.input(conn, b"exit 0\n").unwrap();

        let policy = ReapPolicy {
            idle_timeout: None,
            exited_retention: Duration::ZERO,
        };
        let task = start_reaper(Arc::clone(&registry), policy, Duration::from_millis(20));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !registry.is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "session was never reaped");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(session.is_exited());
        task.abort();
    }
}
