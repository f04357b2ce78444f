//! Core types shared by every endpoint and the redirect configuration
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// What a pipe endpoint is bound to. Only affects `is_file`/`is_console`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeKind {
    /// Anonymous pipe pair
    Pipe,
    /// Regular file opened by path
    File,
    /// Inherited standard stream of the controller
    Console,
}

impl fmt::Display for PipeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeKind::Pipe => write!(f, "pipe"),
            PipeKind::File => write!(f, "file"),
            PipeKind::Console => write!(f, "console"),
        }
    }
}

/// Direction of an endpoint side.
///
/// For `create_pipe` and `open_file` this selects which end the controller
/// keeps; for `close` it selects the side being released.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeMode {
    Read,
    Write,
}

impl fmt::Display for PipeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeMode::Read => write!(f, "read"),
            PipeMode::Write => write!(f, "write"),
        }
    }
}

/// Standard stream slot of a process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdStream {
    Input,
    Output,
    Error,
}

impl StdStream {
    pub fn name(self) -> &'static str {
        match self {
            StdStream::Input => "stdin",
            StdStream::Output => "stdout",
            StdStream::Error => "stderr",
        }
    }

    /// Direction the child uses on this slot
    pub fn child_mode(self) -> PipeMode {
        match self {
            StdStream::Input => PipeMode::Read,
            StdStream::Output | StdStream::Error => PipeMode::Write,
        }
    }
}

impl fmt::Display for StdStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StdStream {
    type Err = PipeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "stdin" | "input" => Ok(StdStream::Input),
            "stdout" | "output" => Ok(StdStream::Output),
            "stderr" | "error" => Ok(StdStream::Error),
            other => Err(PipeError::UnknownStream(other.to_string())),
        }
    }
}

/// Unrecoverable failures of the redirection layer.
///
/// Peer-gone and cancellation conditions are never reported here; they show
/// up as zero-byte transfers.
#[derive(Error, Debug)]
pub enum PipeError {
    #[error("Pipe creation failed: {0}")]
    Create(Errno),

    #[error("Failed to adjust handle inheritance: {0}")]
    Inheritance(Errno),

    #[error("Failed to duplicate {handle} handle: {source}")]
    Duplicate {
        handle: String,
        source: std::io::Error,
    },

    #[error("{}: {source}", .path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{}: file is locked for exclusive access", .path.display())]
    Locked { path: PathBuf },

    #[error("Read failed: {0}")]
    Read(std::io::Error),

    #[error("Write failed: {0}")]
    Write(std::io::Error),

    #[error("Flush failed: {0}")]
    Flush(std::io::Error),

    #[error("Failed to cancel blocking I/O: {0}")]
    Cancel(Errno),

    #[error("Worker thread error: {0}")]
    Worker(String),

    #[error("Unrecognized standard stream: {0}")]
    UnknownStream(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<&PipeError> for i32 {
    fn from(err: &PipeError) -> i32 {
        match err {
            PipeError::Config(_) | PipeError::UnknownStream(_) => 78, // EX_CONFIG
            PipeError::Open { .. } => 66,                              // EX_NOINPUT
            PipeError::Locked { .. } => 75,                            // EX_TEMPFAIL
            PipeError::Create(_)
            | PipeError::Inheritance(_)
            | PipeError::Duplicate { .. }
            | PipeError::Cancel(_)
            | PipeError::Worker(_) => 71, // EX_OSERR
            PipeError::Read(_) | PipeError::Write(_) | PipeError::Flush(_) => 74, // EX_IOERR
        }
    }
}

pub type Result<T> = std::result::Result<T, PipeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_std_stream_parse() {
        assert_eq!("stdin".parse::<StdStream>().unwrap(), StdStream::Input);
        assert_eq!("output".parse::<StdStream>().unwrap(), StdStream::Output);
        assert_eq!(" stderr ".parse::<StdStream>().unwrap(), StdStream::Error);
    }

    #[test]
    fn test_unknown_std_stream_is_rejected() {
        let err = "stdlog".parse::<StdStream>().unwrap_err();
        assert!(matches!(err, PipeError::UnknownStream(ref name) if name == "stdlog"));
        assert_eq!(i32::from(&err), 78);
    }

    #[test]
    fn test_child_mode() {
        assert_eq!(StdStream::Input.child_mode(), PipeMode::Read);
        assert_eq!(StdStream::Output.child_mode(), PipeMode::Write);
        assert_eq!(StdStream::Error.child_mode(), PipeMode::Write);
    }

    #[test]
    fn test_open_error_mentions_path() {
        let err = PipeError::Open {
            path: PathBuf::from("/nonexistent/in.txt"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.to_string().starts_with("/nonexistent/in.txt: "));
        assert_eq!(i32::from(&err), 66);
    }

    #[test]
    fn test_display() {
        assert_eq!(PipeKind::Console.to_string(), "console");
        assert_eq!(PipeMode::Write.to_string(), "write");
        assert_eq!(StdStream::Error.to_string(), "stderr");
    }
}
