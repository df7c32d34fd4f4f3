use std::fmt;
use std::io;

/// Errors returned by tidepool setup paths.
///
/// Runtime I/O failures inside the loop never surface here; they are logged
/// and either retried or turned into connection-state transitions.
#[derive(Debug)]
pub enum Error {
    /// A system call failed during setup (socket, bind, eventfd, timerfd...).
    Io(io::Error),
    /// A worker thread could not be spawned or never reported its loop.
    ThreadSpawn(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::ThreadSpawn(msg) => write!(f, "thread spawn: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
