//! tether-pty: shell processes that outlive the connections watching them.
//!
//! # Architecture
//!
//! - [`PtyHandle`]: Low-level PTY process management (spawn, write, resize, kill).
//! - [`ScrollbackBuffer`]: Bounded byte ring holding recent output for replay.
//! - [`Session`]: One shell, its scrollback, and the set of attached connections.
//! - [`SessionRegistry`]: The map of live sessions; creates, looks up, and reaps them.

pub mod io_thread;
pub mod pty;
pub mod registry;
pub mod scrollback;
pub mod session;

pub use pty::{PtyError, PtyHandle};
pub use registry::{ReapPolicy, ReapReason, SessionRegistry};
pub use scrollback::{ScrollbackBuffer, DEFAULT_SCROLLBACK_BYTES};
pub use session::{
    subscriber_channel, validate_geometry, ConnectionId, Session, SessionConfig, SessionError,
    SessionEvent, SessionId, SessionInfo, SessionState, Subscriber, SubscriberReceiver,
    MAX_DIMENSION, SUBSCRIBER_QUEUE_CHUNKS,
};
