use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::io_thread::{kill_switch, start_io_threads, KillSwitch};
use crate::pty::{PtyError, PtyHandle};
use crate::scrollback::{ScrollbackBuffer, DEFAULT_SCROLLBACK_BYTES};

/// Unique identifier for a terminal session.
pub type SessionId = Uuid;

/// Identifier the transport assigns to each live connection.
pub type ConnectionId = Uuid;

/// Largest accepted value for either terminal dimension.
pub const MAX_DIMENSION: u16 = 1000;

/// Events delivered to attached connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Raw process output, or the scrollback replay sent on attach.
    Output(Vec<u8>),
    /// The process is gone. Sent once, after which the receiver is dropped by the session.
    Exited { code: Option<u32> },
}

/// Sending half handed to [`Session::attach`]; one per attached connection.
pub type Subscriber = mpsc::Sender<SessionEvent>;

/// Receiving half kept by the connection.
pub type SubscriberReceiver = mpsc::Receiver<SessionEvent>;

/// Output chunks queued per connection before it is considered stalled.
pub const SUBSCRIBER_QUEUE_CHUNKS: usize = 256;

/// A bounded subscriber queue of [`SUBSCRIBER_QUEUE_CHUNKS`] events.
///
/// A connection that lets its queue fill is detached rather than buffered
/// without limit; it can come back with a replay attach.
pub fn subscriber_channel() -> (Subscriber, SubscriberReceiver) {
    mpsc::channel(SUBSCRIBER_QUEUE_CHUNKS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    Exited,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to spawn shell: {0}")]
    ProcessSpawn(String),
    #[error("workspace directory does not exist: {}", .0.display())]
    WorkspaceMissing(PathBuf),
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("session {0} has exited")]
    Dead(SessionId),
    #[error("session {0} is still running")]
    StillRunning(SessionId),
    #[error("invalid terminal geometry {cols}x{rows}")]
    Geometry { cols: u16, rows: u16 },
    #[error("connection is not attached to this session")]
    NotAttached,
    #[error(transparent)]
    Pty(#[from] PtyError),
}

/// How sessions are spawned. Shared by every session a registry creates.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Shell binary; `None` means the user's default shell.
    pub shell: Option<String>,
    /// Scrollback capacity in bytes.
    pub scrollback_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: None,
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
        }
    }
}

/// Point-in-time view of a session, for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub workspace_dir: PathBuf,
    pub state: SessionState,
    pub exit_code: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub attached: usize,
    pub cols: u16,
    pub rows: u16,
    pub scrollback_bytes: usize,
    /// Output produced over the session's lifetime, including evicted bytes.
    pub output_bytes: u64,
}

/// Reject zero-sized or absurd terminal dimensions.
pub fn validate_geometry(cols: u16, rows: u16) -> Result<(), SessionError> {
    if cols == 0 || rows == 0 || cols > MAX_DIMENSION || rows > MAX_DIMENSION {
        return Err(SessionError::Geometry { cols, rows });
    }
    Ok(())
}

struct SessionInner {
    state: SessionState,
    exit_code: Option<u32>,
    exited_at: Option<DateTime<Utc>>,
    buffer: ScrollbackBuffer,
    attached: HashMap<ConnectionId, Subscriber>,
    last_activity_at: DateTime<Utc>,
    cols: u16,
    rows: u16,
}

/// One shell process, its scrollback, and the connections watching it.
///
/// Attach, detach, output fan-out and exit are serialized by one lock, so a
/// connection that attaches with replay receives the snapshot followed by
/// exactly the output produced after it, with no gap and no overlap.
/// Writes and resizes are serialized separately by the PTY lock.
pub struct Session {
    id: SessionId,
    workspace_dir: PathBuf,
    created_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
    pty: Mutex<PtyHandle>,
    kill_switch: KillSwitch,
}

impl Session {
    /// Spawn a shell in `workspace_dir` and start its reader and waiter threads.
    ///
    /// `workspace_dir` is canonicalized, so the recorded directory is absolute.
    pub fn spawn(
        config: &SessionConfig,
        workspace_dir: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<Self>, SessionError> {
        validate_geometry(cols, rows)?;
        let workspace_dir = match std::fs::canonicalize(workspace_dir) {
            Ok(dir) if dir.is_dir() => dir,
            _ => return Err(SessionError::WorkspaceMissing(workspace_dir.to_path_buf())),
        };

        let mut pty = PtyHandle::spawn(config.shell.as_deref(), &workspace_dir, cols, rows)
            .map_err(|e| SessionError::ProcessSpawn(e.to_string()))?;
        let (reader, child) = match (pty.take_reader(), pty.take_child()) {
            (Some(reader), Some(child)) => (reader, child),
            _ => {
                pty.kill();
                return Err(SessionError::ProcessSpawn("PTY reader already taken".into()));
            }
        };

        log::debug!("spawned shell pid {:?} in {}", pty.pid(), workspace_dir.display());

        let (kill_switch, kill_requests) = kill_switch();
        let now = Utc::now();
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            workspace_dir,
            created_at: now,
            inner: Mutex::new(SessionInner {
                state: SessionState::Running,
                exit_code: None,
                exited_at: None,
                buffer: ScrollbackBuffer::new(config.scrollback_bytes),
                attached: HashMap::new(),
                last_activity_at: now,
                cols,
                rows,
            }),
            pty: Mutex::new(pty),
            kill_switch,
        });

        if let Err(e) = start_io_threads(Arc::clone(&session), reader, child, kill_requests) {
            session.terminate();
            return Err(SessionError::ProcessSpawn(format!("failed to start PTY threads: {e}")));
        }

        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    pub fn state(&self) -> SessionState {
        self.lock_inner().state
    }

    pub fn is_exited(&self) -> bool {
        self.state() == SessionState::Exited
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.lock_inner().exit_code
    }

    pub fn exited_at(&self) -> Option<DateTime<Utc>> {
        self.lock_inner().exited_at
    }

    /// Last client interaction (attach, detach, input, resize). Output does not count.
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.lock_inner().last_activity_at
    }

    pub fn attached_count(&self) -> usize {
        self.lock_inner().attached.len()
    }

    /// Current retained scrollback, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock_inner().buffer.snapshot()
    }

    pub fn info(&self) -> SessionInfo {
        let inner = self.lock_inner();
        SessionInfo {
            id: self.id,
            workspace_dir: self.workspace_dir.clone(),
            state: inner.state,
            exit_code: inner.exit_code,
            created_at: self.created_at,
            last_activity_at: inner.last_activity_at,
            attached: inner.attached.len(),
            cols: inner.cols,
            rows: inner.rows,
            scrollback_bytes: inner.buffer.capacity(),
            output_bytes: inner.buffer.total_appended(),
        }
    }

    /// Subscribe `conn` to live output.
    ///
    /// With `replay`, the current scrollback is queued to `subscriber` before
    /// any live output. Returns the number of replayed bytes. Re-attaching an
    /// already attached connection replaces its subscriber.
    pub fn attach(
        &self,
        conn: ConnectionId,
        subscriber: Subscriber,
        replay: bool,
    ) -> Result<usize, SessionError> {
        let mut inner = self.lock_inner();
        if inner.state == SessionState::Exited {
            return Err(SessionError::Dead(self.id));
        }

        let mut replayed = 0;
        if replay {
            let snapshot = inner.buffer.snapshot();
            if !snapshot.is_empty() {
                replayed = snapshot.len();
                let _ = subscriber.try_send(SessionEvent::Output(snapshot));
            }
        }

        inner.attached.insert(conn, subscriber);
        inner.last_activity_at = Utc::now();
        log::info!(
            "session {}: attached {conn} (replay {replayed} bytes, {} attached)",
            self.id,
            inner.attached.len()
        );
        Ok(replayed)
    }

    /// Unsubscribe `conn`. Idempotent, and never touches the process.
    pub fn detach(&self, conn: ConnectionId) -> bool {
        let mut inner = self.lock_inner();
        let removed = inner.attached.remove(&conn).is_some();
        if removed {
            inner.last_activity_at = Utc::now();
            log::info!(
                "session {}: detached {conn} ({} attached)",
                self.id,
                inner.attached.len()
            );
        }
        removed
    }

    /// Forward input from an attached connection to the shell.
    ///
    /// Input racing with process exit is dropped silently.
    pub fn input(&self, conn: ConnectionId, data: &[u8]) -> Result<(), SessionError> {
        {
            let mut inner = self.lock_inner();
            if inner.state == SessionState::Exited {
                log::debug!("session {}: dropping {} input bytes after exit", self.id, data.len());
                return Ok(());
            }
            if !inner.attached.contains_key(&conn) {
                return Err(SessionError::NotAttached);
            }
            inner.last_activity_at = Utc::now();
        }

        if let Err(e) = self.lock_pty().write(data) {
            log::debug!("session {}: input lost: {e}", self.id);
        }
        Ok(())
    }

    /// Apply new geometry on behalf of an attached connection.
    pub fn resize(&self, conn: ConnectionId, cols: u16, rows: u16) -> Result<(), SessionError> {
        validate_geometry(cols, rows)?;
        {
            let inner = self.lock_inner();
            if inner.state == SessionState::Exited {
                return Ok(());
            }
            if !inner.attached.contains_key(&conn) {
                return Err(SessionError::NotAttached);
            }
        }

        // Held across the geometry update so concurrent resizes land in order.
        let pty = self.lock_pty();
        pty.resize(cols, rows)?;
        let mut inner = self.lock_inner();
        inner.cols = cols;
        inner.rows = rows;
        inner.last_activity_at = Utc::now();
        Ok(())
    }

    /// Kill the shell: SIGHUP now, SIGKILL shortly after if it ignores the hangup.
    /// The waiter thread then runs the exit path.
    pub fn terminate(&self) {
        log::info!("session {}: terminating", self.id);
        self.lock_pty().kill();
        self.kill_switch.trip();
    }

    /// Record a chunk of process output and fan it out to every attached connection.
    pub(crate) fn handle_output(&self, chunk: &[u8]) {
        let mut inner = self.lock_inner();
        if inner.state == SessionState::Exited {
            return;
        }
        inner.buffer.append(chunk);

        // The last queue slot is kept free so the exit event always fits.
        let id = self.id;
        inner.attached.retain(|conn, tx| {
            if tx.is_closed() {
                log::debug!("session {id}: pruning closed subscriber {conn}");
                return false;
            }
            if tx.capacity() <= 1 {
                log::warn!("session {id}: detaching stalled subscriber {conn}");
                return false;
            }
            tx.try_send(SessionEvent::Output(chunk.to_vec())).is_ok()
        });
    }

    /// Transition to `Exited`, notify attached connections once, and drop them.
    pub(crate) fn handle_exit(&self, code: Option<u32>) {
        let mut inner = self.lock_inner();
        if inner.state == SessionState::Exited {
            return;
        }
        inner.state = SessionState::Exited;
        inner.exit_code = code;
        inner.exited_at = Some(Utc::now());

        for tx in inner.attached.values() {
            let _ = tx.try_send(SessionEvent::Exited { code });
        }
        let notified = inner.attached.len();
        inner.attached.clear();
        log::info!(
            "session {}: process exited with {code:?}, notified {notified} connection(s)",
            self.id
        );
    }

    // Poisoning is recovered from: every critical section leaves the state consistent.
    fn lock_inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pty(&self) -> MutexGuard<'_, PtyHandle> {
        self.pty.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("workspace_dir", &self.workspace_dir)
            .finish_non_exhaustive()
    }
}
