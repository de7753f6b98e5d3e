use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Per-message routing failure; the message is dropped and the batch carries on.
    #[error("routing error in {router}: {message}")]
    Routing { router: &'static str, message: String },
    #[error("{0} has been closed")]
    Disposed(&'static str),
    #[error("key already exists")]
    KeyExists,
    #[error("key not found")]
    KeyNotFound,
    #[error("cache capacity exceeded")]
    CapacityExceeded,
    #[error("entry size is required when the cache has a finite capacity")]
    SizeRequired,
    #[error("invalid argument, {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    #[inline]
    pub fn routing<S: Into<String>>(router: &'static str, message: S) -> Self {
        Error::Routing { router, message: message.into() }
    }

    #[inline]
    pub fn is_routing(&self) -> bool {
        matches!(self, Error::Routing { .. })
    }
}

impl From<String> for Error {
    #[inline]
    fn from(e: String) -> Self {
        Error::Msg(e)
    }
}

impl From<&str> for Error {
    #[inline]
    fn from(e: &str) -> Self {
        Error::Msg(e.to_string())
    }
}
