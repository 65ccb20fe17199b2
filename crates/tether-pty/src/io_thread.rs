//! Per-session threads that pump PTY output into the session and watch the shell.
//!
//! PTY reads are blocking, so each session gets a dedicated reader thread.
//! A second thread owns the child: it polls for exit, escalates kill
//! requests, and runs the session's exit path once the shell is gone. Exit
//! does not wait for PTY EOF, because background jobs can hold the terminal
//! open long after the shell itself has died.

use std::io::{ErrorKind, Read};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use portable_pty::Child;

use crate::session::Session;

/// How often the waiter checks whether the shell has exited.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long the waiter lets the reader drain after the shell exits.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Asks the waiter thread to kill the shell.
///
/// The waiter calls the child's own `kill`, which follows SIGHUP with
/// SIGKILL when the shell ignores the hangup.
pub(crate) struct KillSwitch(Sender<()>);

impl KillSwitch {
    pub(crate) fn trip(&self) {
        let _ = self.0.send(());
    }
}

pub(crate) fn kill_switch() -> (KillSwitch, Receiver<()>) {
    let (tx, rx) = mpsc::channel();
    (KillSwitch(tx), rx)
}

/// Start the reader and waiter threads for `session`.
pub(crate) fn start_io_threads(
    session: Arc<Session>,
    reader: Box<dyn Read + Send>,
    child: Box<dyn Child + Send + Sync>,
    kill_requests: Receiver<()>,
) -> std::io::Result<()> {
    let (drained_tx, drained_rx) = mpsc::channel();

    let reader_session = Arc::clone(&session);
    std::thread::Builder::new()
        .name(format!("pty-io-{}", session.id()))
        .spawn(move || {
            read_loop(&reader_session, reader);
            let _ = drained_tx.send(());
        })?;

    std::thread::Builder::new()
        .name(format!("pty-wait-{}", session.id()))
        .spawn(move || wait_loop(session, child, kill_requests, drained_rx))?;

    Ok(())
}

fn read_loop(session: &Session, mut reader: Box<dyn Read + Send>) {
    let mut buf = [0u8; 65536];

    loop {
        // No session lock is held here, so a blocked read never stalls attach or input.
        let n = match reader.read(&mut buf) {
            Ok(0) => break, // EOF, PTY closed
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO once the last slave fd closes.
                log::debug!("session {}: PTY read ended: {e}", session.id());
                break;
            }
        };

        session.handle_output(&buf[..n]);
    }
}

fn wait_loop(
    session: Arc<Session>,
    mut child: Box<dyn Child + Send + Sync>,
    kill_requests: Receiver<()>,
    drained: Receiver<()>,
) {
    let mut kill_requests = Some(kill_requests);

    let code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status.exit_code()),
            Ok(None) => {}
            Err(e) => {
                log::warn!("session {}: failed to reap shell: {e}", session.id());
                break None;
            }
        }

        match kill_requests.as_ref().map(|rx| rx.recv_timeout(EXIT_POLL_INTERVAL)) {
            Some(Ok(())) => {
                if let Err(e) = child.kill() {
                    log::debug!("session {}: kill failed: {e}", session.id());
                }
            }
            Some(Err(RecvTimeoutError::Timeout)) => {}
            Some(Err(RecvTimeoutError::Disconnected)) => kill_requests = None,
            None => std::thread::sleep(EXIT_POLL_INTERVAL),
        }
    };

    // Output the shell wrote before dying is still in the PTY; give the reader a moment.
    if let Err(RecvTimeoutError::Timeout) = drained.recv_timeout(DRAIN_GRACE) {
        log::debug!(
            "session {}: PTY still held open after shell exit",
            session.id()
        );
    }
    session.handle_exit(code);
}
