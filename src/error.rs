use std::io;

use thiserror::Error;

/// Everything that can go wrong inside the subagent runtime.
///
/// SET rejections (`NOT_WRITABLE`, `WRONG_VALUE`) are not part of this enum:
/// they travel inside Response PDUs as error code + index and never surface
/// as Rust errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A string could not be parsed as a dotted-decimal OID.
    #[error("invalid OID: {0}")]
    InvalidOid(String),

    /// Malformed wire data: unknown PDU tag, version mismatch, short frame,
    /// or a reply of the wrong PDU type.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket failure, missing reply, or EOF in the middle of a PDU.
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation attempted without a live session.
    #[error("session error: {0}")]
    Session(String),

    /// The master rejected a Register PDU or never answered it.
    #[error("registration error: {0}")]
    Registration(String),

    /// `start()` called on an agent that is already up.
    #[error("agent is already running")]
    AlreadyRunning,

    /// Trap send through a handle whose agent no longer exists.
    #[error("not bound to an agent")]
    NotBound,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
