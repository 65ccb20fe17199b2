use std::io::{Read, Write};
use std::path::Path;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};

/// Errors from PTY operations.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("PTY spawn failed: {0}")]
    SpawnFailed(String),
    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PTY resize failed: {0}")]
    ResizeFailed(String),
}

/// Owns the master side of a pseudo-terminal and the shell running on it.
///
/// The reader and the child are handed out once (see [`PtyHandle::take_reader`]
/// and [`PtyHandle::take_child`]) so that a dedicated thread can block on
/// output and reap the process without holding whatever lock guards this handle.
pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    reader: Option<Box<dyn Read + Send>>,
    child: Option<Box<dyn Child + Send + Sync>>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Spawn `shell` on a fresh PTY with its working directory set to `cwd`.
    ///
    /// If `shell` is `None`, uses the user's default shell (`$SHELL` or `/bin/sh`).
    pub fn spawn(shell: Option<&str>, cwd: &Path, cols: u16, rows: u16) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(cols, rows))
            .map_err(|e| PtyError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let shell_path = match shell {
            Some(s) => s.to_string(),
            None => default_shell(),
        };
        let mut cmd = CommandBuilder::new(&shell_path);
        cmd.cwd(cwd);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("failed to spawn {shell_path}: {e}")))?;
        // The slave fd must not outlive the spawn, otherwise the reader never sees EOF.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to clone reader: {e}")))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to take writer: {e}")))?;

        let killer = child.clone_killer();
        let pid = child.process_id();

        Ok(Self {
            master: pair.master,
            writer,
            killer,
            reader: Some(reader),
            child: Some(child),
            pid,
        })
    }

    /// Resize the PTY to new dimensions.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .resize(pty_size(cols, rows))
            .map_err(|e| PtyError::ResizeFailed(format!("{e}")))
    }

    /// Geometry the PTY currently reports, as `(cols, rows)`.
    pub fn size(&self) -> Result<(u16, u16), PtyError> {
        let size = self
            .master
            .get_size()
            .map_err(|e| PtyError::ResizeFailed(format!("{e}")))?;
        Ok((size.cols, size.rows))
    }

    /// Write bytes to the PTY master (client input -> shell).
    pub fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Hand out the blocking output reader. Returns `None` after the first call.
    pub fn take_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        self.reader.take()
    }

    /// Hand out the child process so it can be waited on. Returns `None` after the first call.
    pub fn take_child(&mut self) -> Option<Box<dyn Child + Send + Sync>> {
        self.child.take()
    }

    /// Hang up the shell (SIGHUP on unix). A shell that ignores the hangup
    /// survives this; escalation needs the child itself, see `take_child`.
    /// Errors are ignored if it is already gone.
    pub fn kill(&mut self) {
        if let Err(e) = self.killer.kill() {
            log::debug!("kill of pid {:?} failed: {e}", self.pid);
        }
    }

    /// OS process id of the shell, when the platform reports one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Returns the user's default shell, falling back to `/bin/sh`.
pub fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}
