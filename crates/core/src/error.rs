//! Error taxonomy shared by every operation in the controller.
//!
//! The variants mirror the classes a request channel can act on: `Invalid`
//! and `OutOfRange` turn into `ERR` replies, `Interrupted` and `Timeout` end
//! the current blocking call, `Unexpected` aborts the current run, and
//! `Fatal` is reserved for violated state invariants where the only safe
//! path is process exit. Success is plain `Ok(())`; there is no "all good"
//! variant to forget to check.

/// Result type used throughout the alignment engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong below the request channels.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed request or parameters outside their declared range.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// A numeric argument fell outside its bounds.
    #[error("{0} out of range")]
    OutOfRange(&'static str),

    /// A blocking call exceeded its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A signal arrived during a blocking call.
    #[error("interrupted")]
    Interrupted,

    /// A subsystem reported failure without further classification.
    #[error("unexpected failure: {0}")]
    Unexpected(String),

    /// A state invariant no longer holds. The process must exit.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Process exit code for this error, following the convention that
    /// recoverable classes are positive and fatal errors are negative.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Unexpected(_) => 1,
            Error::Interrupted => 2,
            Error::Invalid(_) => 3,
            Error::Timeout(_) => 4,
            Error::OutOfRange(_) => 5,
            Error::Fatal(_) => -1,
        }
    }
}

impl From<mams_hal::Error> for Error {
    fn from(e: mams_hal::Error) -> Error {
        Error::Unexpected(e.to_string())
    }
}
