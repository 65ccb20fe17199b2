//! Per-connection protocol state machine.
//!
//! A [`Connection`] moves between three states:
//!
//! ```text
//! Unauthenticated --authenticate--> Idle <--create/attach--> Attached
//!                                        <--detach/exit/drop--
//! ```
//!
//! Dropping a connection runs the same detach path as an explicit
//! `detach-session`, so a network drop never affects the session's process.

use std::sync::Arc;

use uuid::Uuid;

use tether_pty::{
    subscriber_channel, validate_geometry, ConnectionId, Session, SessionError, SessionEvent,
    SessionId, SubscriberReceiver,
};

use crate::auth::{AuthError, Identity};
use crate::protocol::{decode_text, ClientMessage, DecodeError, ErrorKind, Outbound, ServerMessage};
use crate::state::AppState;
use crate::workspace::WorkspaceError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("authenticate before sending other messages")]
    Unauthenticated,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("{0}")]
    InvalidMessage(String),
    #[error("{0}")]
    Geometry(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Auth(_) | GatewayError::Unauthenticated => ErrorKind::Authentication,
            GatewayError::Session(e) => match e {
                SessionError::ProcessSpawn(_) | SessionError::WorkspaceMissing(_) => {
                    ErrorKind::SpawnFailed
                }
                SessionError::NotFound(_) => ErrorKind::SessionNotFound,
                SessionError::Dead(_) => ErrorKind::SessionDead,
                SessionError::Geometry { .. } => ErrorKind::Geometry,
                SessionError::NotAttached => ErrorKind::NotAttached,
                SessionError::StillRunning(_) | SessionError::Pty(_) => ErrorKind::Internal,
            },
            GatewayError::Workspace(_) => ErrorKind::SpawnFailed,
            GatewayError::InvalidMessage(_) => ErrorKind::InvalidMessage,
            GatewayError::Geometry(_) => ErrorKind::Geometry,
            GatewayError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Authentication failures end the connection; everything else is reported and survived.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Authentication
    }

    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Error {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<DecodeError> for GatewayError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::Malformed(msg) => GatewayError::InvalidMessage(msg),
            DecodeError::Geometry(msg) => GatewayError::Geometry(msg),
        }
    }
}

pub enum ConnectionState {
    Unauthenticated,
    Idle {
        identity: Identity,
    },
    Attached {
        identity: Identity,
        session: Arc<Session>,
    },
}

pub struct Connection {
    id: ConnectionId,
    state: ConnectionState,
    /// Receiver for the attached session's events; `None` unless attached.
    events: Option<SubscriberReceiver>,
    app: AppState,
}

impl Connection {
    pub fn new(app: AppState) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: ConnectionState::Unauthenticated,
            events: None,
            app,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        match &self.state {
            ConnectionState::Unauthenticated => None,
            ConnectionState::Idle { identity } | ConnectionState::Attached { identity, .. } => {
                Some(identity)
            }
        }
    }

    /// Id of the session this connection is attached to, if any.
    pub fn attached_session(&self) -> Option<SessionId> {
        match &self.state {
            ConnectionState::Attached { session, .. } => Some(session.id()),
            _ => None,
        }
    }

    pub fn authenticate(&mut self, token: &str) -> Result<ServerMessage, GatewayError> {
        if !matches!(self.state, ConnectionState::Unauthenticated) {
            return Err(GatewayError::InvalidMessage("already authenticated".into()));
        }
        let identity = self.app.auth.authenticate(token).map_err(|e| {
            log::warn!("connection {}: authentication failed: {e}", self.id);
            e
        })?;
        log::info!("connection {}: authenticated as {}", self.id, identity.principal);
        let principal = identity.principal.clone();
        self.state = ConnectionState::Idle { identity };
        Ok(ServerMessage::Authenticated { principal })
    }

    pub async fn handle_text(&mut self, text: &str) -> Result<Option<ServerMessage>, GatewayError> {
        // Unauthenticated peers get the authentication error even for garbage.
        if matches!(self.state, ConnectionState::Unauthenticated) {
            return match decode_text(text) {
                Ok(msg) => self.handle(msg).await,
                Err(_) => Err(GatewayError::Unauthenticated),
            };
        }
        let msg = decode_text(text)?;
        self.handle(msg).await
    }

    /// Apply one client message and produce the reply, if the message has one.
    pub async fn handle(&mut self, msg: ClientMessage) -> Result<Option<ServerMessage>, GatewayError> {
        if let ClientMessage::Authenticate { token } = &msg {
            return self.authenticate(token).map(Some);
        }
        if matches!(self.state, ConnectionState::Unauthenticated) {
            return Err(GatewayError::Unauthenticated);
        }

        match msg {
            ClientMessage::Authenticate { .. } => Ok(None),
            ClientMessage::CreateSession {
                cols,
                rows,
                workspace_ref,
            } => self.create_session(cols, rows, &workspace_ref).await.map(Some),
            ClientMessage::AttachSession {
                id,
                cols,
                rows,
                replay,
            } => self.attach_session(id, cols, rows, replay).map(Some),
            ClientMessage::Input { data } => {
                self.current_session()?.input(self.id, &data)?;
                Ok(None)
            }
            ClientMessage::Resize { cols, rows } => {
                self.current_session()?.resize(self.id, cols, rows)?;
                Ok(None)
            }
            ClientMessage::DetachSession => {
                Ok(self.detach().map(|id| ServerMessage::SessionDetached { id }))
            }
            ClientMessage::ListSessions => Ok(Some(ServerMessage::SessionList {
                sessions: self.app.registry.list(),
            })),
            ClientMessage::KillSession { id } => {
                self.app.registry.terminate(&id)?;
                log::info!("connection {}: killed session {id}", self.id);
                Ok(Some(ServerMessage::SessionKilled { id }))
            }
        }
    }

    async fn create_session(
        &mut self,
        cols: u16,
        rows: u16,
        workspace_ref: &str,
    ) -> Result<ServerMessage, GatewayError> {
        validate_geometry(cols, rows)?;
        let dir = self.app.workspaces.resolve(workspace_ref)?;

        let registry = Arc::clone(&self.app.registry);
        let session = tokio::task::spawn_blocking(move || registry.create(&dir, cols, rows))
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))??;

        // Replay covers whatever the shell printed before the subscription landed.
        self.attach_to(session.clone(), true)?;
        Ok(ServerMessage::SessionCreated { id: session.id() })
    }

    fn attach_session(
        &mut self,
        id: SessionId,
        cols: u16,
        rows: u16,
        replay: bool,
    ) -> Result<ServerMessage, GatewayError> {
        validate_geometry(cols, rows)?;
        let session = self
            .app
            .registry
            .lookup(&id)
            .ok_or(SessionError::NotFound(id))?;
        let replayed = self.attach_to(session.clone(), replay)?;
        if let Err(e) = session.resize(self.id, cols, rows) {
            log::warn!("session {id}: resize on attach failed: {e}");
        }
        Ok(ServerMessage::SessionAttached { id, replayed })
    }

    /// Subscribe to `session`, then release any previous attachment.
    ///
    /// A failed attach leaves the current attachment untouched.
    fn attach_to(&mut self, session: Arc<Session>, replay: bool) -> Result<usize, GatewayError> {
        let (tx, rx) = subscriber_channel();
        let replayed = session.attach(self.id, tx, replay)?;

        let identity = match std::mem::replace(&mut self.state, ConnectionState::Unauthenticated) {
            ConnectionState::Attached {
                identity,
                session: previous,
            } => {
                if previous.id() != session.id() {
                    previous.detach(self.id);
                }
                identity
            }
            ConnectionState::Idle { identity } => identity,
            ConnectionState::Unauthenticated => {
                session.detach(self.id);
                return Err(GatewayError::Unauthenticated);
            }
        };
        self.state = ConnectionState::Attached { identity, session };
        self.events = Some(rx);
        Ok(replayed)
    }

    fn current_session(&self) -> Result<&Arc<Session>, GatewayError> {
        match &self.state {
            ConnectionState::Attached { session, .. } => Ok(session),
            _ => Err(SessionError::NotAttached.into()),
        }
    }

    /// Leave the attached session, if any. The single detach path for
    /// explicit `detach-session`, session exit and disconnects.
    fn detach(&mut self) -> Option<SessionId> {
        self.events = None;
        match std::mem::replace(&mut self.state, ConnectionState::Unauthenticated) {
            ConnectionState::Attached { identity, session } => {
                session.detach(self.id);
                self.state = ConnectionState::Idle { identity };
                Some(session.id())
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Wait for the next event from the attached session.
    ///
    /// Pending forever while not attached, so it can sit in a `select!`.
    pub async fn next_event(&mut self) -> Outbound {
        loop {
            let Some(events) = self.events.as_mut() else {
                return std::future::pending().await;
            };
            match events.recv().await {
                Some(SessionEvent::Output(bytes)) => return Outbound::Output(bytes),
                Some(SessionEvent::Exited { code }) => {
                    if let Some(id) = self.detach() {
                        return Outbound::Message(ServerMessage::SessionExited {
                            id,
                            exit_code: code,
                        });
                    }
                }
                None => {
                    // Dropped as a stalled subscriber; the client may re-attach with replay.
                    if let Some(id) = self.detach() {
                        log::warn!("connection {}: fell behind session {id}, detached", self.id);
                        return Outbound::Message(ServerMessage::SessionDetached { id });
                    }
                }
            }
        }
    }

    /// Explicit end of the connection; identical to dropping it.
    pub fn disconnect(self) {}
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(id) = self.detach() {
            log::info!("connection {}: dropped while attached to {id}", self.id);
        }
    }
}
