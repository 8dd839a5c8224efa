use thiserror::Error;

/// Errors delivered to completion handlers.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not connected to the Avahi daemon")]
    NotConnected,

    /// The client was set up on a runtime other than a current-thread one.
    #[error("The Avahi client needs a current-thread tokio runtime")]
    UnsupportedRuntime,

    /// The daemon answered with a D-Bus error reply.
    #[error("{name}: {message}")]
    Daemon { name: String, message: String },

    /// A reply did not match the expected signature.
    #[error("{0}")]
    Parse(String),

    #[error("D-Bus error: {0}")]
    Bus(#[from] zbus::Error),
}

impl Error {
    /// D-Bus error name if the daemon rejected the call.
    pub fn daemon_error_name(&self) -> Option<&str> {
        match self {
            Error::Daemon { name, .. } => Some(name),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
