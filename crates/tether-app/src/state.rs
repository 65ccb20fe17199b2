//! State shared by every connection and HTTP handler.

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use tether_pty::SessionRegistry;

use crate::auth::Authenticator;
use crate::workspace::WorkspaceResolver;

#[derive(Clone)]
pub struct AppState {
    /// Live sessions, keyed by id.
    pub registry: Arc<SessionRegistry>,
    /// Tab ledger database.
    pub ledger: Arc<Mutex<Connection>>,
    pub workspaces: Arc<WorkspaceResolver>,
    pub auth: Arc<dyn Authenticator>,
}

impl AppState {
    pub fn new(
        registry: SessionRegistry,
        ledger: Connection,
        workspaces: WorkspaceResolver,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            ledger: Arc::new(Mutex::new(ledger)),
            workspaces: Arc::new(workspaces),
            auth,
        }
    }

    pub fn ledger(&self) -> MutexGuard<'_, Connection> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }
}
