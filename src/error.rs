//! Error types for the proxy's internal operations.
//!
//! Client-facing errors are always flattened to the `error: String` field of
//! a [`crate::protocol::Response`]; each variant's `Display` text below is
//! the exact message clients are expected to parse. Process-boundary
//! failures (listener setup) propagate as `anyhow::Error` up to `main`.

use thiserror::Error;

/// Errors raised while bringing up the listening socket.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("too many activated sockets ({0})")]
    TooManyActivatedSockets(usize),
    #[error("couldn't remove existing socket: {0}")]
    RemoveExisting(#[source] std::io::Error),
    #[error("couldn't create AF_UNIX socket: {0}")]
    Bind(#[source] std::io::Error),
    #[error("couldn't set mode on socket: {0}")]
    Chmod(#[source] std::io::Error),
    #[error("couldn't listen on activated socket: {0}")]
    ActivatedListen(#[source] std::io::Error),
}

/// Errors raised while connecting to or transacting with a VM's agent.
///
/// Every variant's `Display` text is the exact message a `hello`/`hyper`
/// response surfaces to the client.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected message {0}")]
    UnexpectedMessage(u32),
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("hyperstart returned an error")]
    AgentError,
    #[error("message too long {0}")]
    MessageTooLong(usize),
}
