//! Coordinator error taxonomy
//!
//! Every lobby and match operation returns `Result<_, Error>`. At the RPC
//! boundary the error collapses into a wire `Status` plus an optional
//! message; nothing else crosses a coordinator boundary.

use crate::ws::protocol::Status;

pub type RpcResult<T> = Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Client is not registered")]
    NotRegistered,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Not authorized")]
    NotAuthorized,

    #[error("Not found: {0}")]
    NotFound(&'static str),

    #[error("Player index {0} is out of range")]
    IndexOutOfRange(usize),

    #[error("Already exists")]
    AlreadyExists,

    #[error("Already joined a room")]
    AlreadyJoined,

    #[error("Room already launched")]
    AlreadyLaunched,

    #[error("Too many local players")]
    TooMuchLocalPlayers,

    #[error("Too many players in room")]
    TooMuchPlayersInRoom,

    #[error("Not allowed: {0}")]
    NotAllowed(&'static str),

    #[error("Not ready")]
    NotReady,

    #[error("Paused")]
    Paused,

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Request timed out")]
    RequestTimeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unhandled exception: {0}")]
    Unhandled(String),
}

impl Error {
    /// Wire status for this error
    pub fn status(&self) -> Status {
        match self {
            Error::NotRegistered => Status::NotRegistered,
            Error::NotAuthenticated => Status::NotAuthenticated,
            Error::NotAuthorized => Status::NotAuthorized,
            Error::NotFound(_) | Error::IndexOutOfRange(_) => Status::NotFound,
            Error::AlreadyExists => Status::AlreadyExists,
            Error::AlreadyJoined => Status::AlreadyJoined,
            Error::AlreadyLaunched => Status::AlreadyLaunched,
            Error::TooMuchLocalPlayers => Status::TooMuchLocalPlayers,
            Error::TooMuchPlayersInRoom => Status::TooMuchPlayersInRoom,
            Error::NotAllowed(_) => Status::NotAllowed,
            Error::NotReady => Status::NotReady,
            Error::Paused => Status::Paused,
            Error::ConnectionError(_) => Status::ConnectionError,
            Error::RequestTimeout => Status::RequestTimeout,
            Error::ConnectionClosed => Status::ConnectionClosed,
            Error::Unhandled(_) => Status::UnhandledException,
        }
    }

    /// Rebuild an error from a wire status, e.g. from a match server reply
    pub fn from_status(status: Status, message: Option<String>) -> Option<Self> {
        let message = message.unwrap_or_default();
        let error = match status {
            Status::Ok => return None,
            Status::NotRegistered => Error::NotRegistered,
            Status::NotAuthenticated => Error::NotAuthenticated,
            Status::NotAuthorized => Error::NotAuthorized,
            Status::NotFound => Error::NotFound("remote resource"),
            Status::AlreadyExists => Error::AlreadyExists,
            Status::AlreadyJoined => Error::AlreadyJoined,
            Status::AlreadyLaunched => Error::AlreadyLaunched,
            Status::TooMuchLocalPlayers => Error::TooMuchLocalPlayers,
            Status::TooMuchPlayersInRoom => Error::TooMuchPlayersInRoom,
            Status::NotAllowed => Error::NotAllowed("rejected by remote"),
            Status::NotReady => Error::NotReady,
            Status::Paused => Error::Paused,
            Status::ConnectionError => Error::ConnectionError(message),
            Status::RequestTimeout => Error::RequestTimeout,
            Status::ConnectionClosed => Error::ConnectionClosed,
            Status::UnhandledException => Error::Unhandled(message),
        };
        Some(error)
    }

    /// Message carried next to the status on the wire
    pub fn wire_message(&self) -> Option<String> {
        match self {
            Error::NotFound(_)
            | Error::IndexOutOfRange(_)
            | Error::NotAllowed(_)
            | Error::ConnectionError(_)
            | Error::Unhandled(_) => Some(self.to_string()),
            _ => None,
        }
    }
}

impl From<crate::store::StoreError> for Error {
    fn from(e: crate::store::StoreError) -> Self {
        match e {
            crate::store::StoreError::NotFound(what) => Error::NotFound(what),
            crate::store::StoreError::AlreadyExists => Error::AlreadyExists,
            other => Error::Unhandled(other.to_string()),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Unhandled(format!("serialization failed: {}", e))
    }
}
