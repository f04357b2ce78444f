//! Redirect configuration for the three standard slots of a child process
use crate::config::types::{PipeError, PipeMode, Result, StdStream};
use crate::pipe::SystemPipe;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// How one standard slot of the child is wired
///
/// Textual form: `std`, `pipe`, `file:<path>` or `file!:<path>` (exclusive).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RedirectSpec {
    /// Share the controller's own console stream
    #[default]
    Std,
    /// Anonymous pipe relayed by the controller
    Pipe,
    /// File on disk
    File { path: PathBuf, exclusive: bool },
}

impl FromStr for RedirectSpec {
    type Err = PipeError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (path, exclusive) = if let Some(path) = s.strip_prefix("file!:") {
            (path, true)
        } else if let Some(path) = s.strip_prefix("file:") {
            (path, false)
        } else {
            return match s {
                "std" => Ok(RedirectSpec::Std),
                "pipe" => Ok(RedirectSpec::Pipe),
                _ => Err(PipeError::Config(format!(
                    "Unknown redirect '{}'. Use: std, pipe, file:<path> or file!:<path>",
                    s
                ))),
            };
        };

        if path.is_empty() {
            return Err(PipeError::Config(format!("Missing file path in redirect '{}'", s)));
        }
        Ok(RedirectSpec::File {
            path: PathBuf::from(path),
            exclusive,
        })
    }
}

impl fmt::Display for RedirectSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedirectSpec::Std => write!(f, "std"),
            RedirectSpec::Pipe => write!(f, "pipe"),
            RedirectSpec::File { path, exclusive } => {
                let prefix = if *exclusive { "file!" } else { "file" };
                write!(f, "{}:{}", prefix, path.display())
            }
        }
    }
}

impl Serialize for RedirectSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RedirectSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Redirects for a child's stdin, stdout and stderr
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
    pub stdin: RedirectSpec,
    pub stdout: RedirectSpec,
    pub stderr: RedirectSpec,
    /// Post a flush request after every successful write
    pub autoflush: bool,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        RedirectConfig {
            stdin: RedirectSpec::Std,
            stdout: RedirectSpec::Std,
            stderr: RedirectSpec::Std,
            autoflush: true,
        }
    }
}

impl RedirectConfig {
    /// Load from a JSON file; missing keys keep their defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| PipeError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    pub fn spec(&self, stream: StdStream) -> &RedirectSpec {
        match stream {
            StdStream::Input => &self.stdin,
            StdStream::Output => &self.stdout,
            StdStream::Error => &self.stderr,
        }
    }

    pub fn spec_mut(&mut self, stream: StdStream) -> &mut RedirectSpec {
        match stream {
            StdStream::Input => &mut self.stdin,
            StdStream::Output => &mut self.stdout,
            StdStream::Error => &mut self.stderr,
        }
    }

    /// Reject wirings that could never open: a path claimed exclusively by
    /// more than one slot, or an input file that an output slot would truncate.
    pub fn validate(&self) -> Result<()> {
        let files: Vec<(StdStream, &Path, bool)> = STREAMS
            .iter()
            .filter_map(|&stream| match self.spec(stream) {
                RedirectSpec::File { path, exclusive } => Some((stream, path.as_path(), *exclusive)),
                _ => None,
            })
            .collect();

        for (i, (first, path, first_exclusive)) in files.iter().enumerate() {
            for (second, other, second_exclusive) in &files[i + 1..] {
                if path != other {
                    continue;
                }
                if *first_exclusive || *second_exclusive {
                    return Err(PipeError::Config(format!(
                        "{} and {} both use {} but one of them requires exclusive access",
                        first,
                        second,
                        path.display()
                    )));
                }
                if *first == StdStream::Input {
                    return Err(PipeError::Config(format!(
                        "{} would truncate {} before {} reads it",
                        second,
                        path.display(),
                        first
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Slots in the order they are wired
pub const STREAMS: [StdStream; 3] = [StdStream::Input, StdStream::Output, StdStream::Error];

/// Build the endpoint behind one child slot.
///
/// `pipe` slots keep the controller's end non-inheritable: stdin gets a
/// write-mode pipe, stdout/stderr a read-mode one. Files are opened in the
/// direction the child uses them.
pub fn open_redirect(spec: &RedirectSpec, stream: StdStream, autoflush: bool) -> Result<SystemPipe> {
    match spec {
        RedirectSpec::Std => SystemPipe::open_std(stream, autoflush),
        RedirectSpec::Pipe => {
            let controller_mode = match stream.child_mode() {
                PipeMode::Read => PipeMode::Write,
                PipeMode::Write => PipeMode::Read,
            };
            SystemPipe::create_pipe(controller_mode, autoflush)
        }
        RedirectSpec::File { path, exclusive } => {
            SystemPipe::open_file(path, stream.child_mode(), autoflush, *exclusive)
        }
    }
}

/// An opened redirect: the endpoint plus the slot it serves
#[derive(Debug)]
pub struct Redirect {
    pub stream: StdStream,
    pub spec: RedirectSpec,
    pub endpoint: SystemPipe,
}

impl Redirect {
    pub fn open(spec: &RedirectSpec, stream: StdStream, autoflush: bool) -> Result<Self> {
        Ok(Redirect {
            stream,
            spec: spec.clone(),
            endpoint: open_redirect(spec, stream, autoflush)?,
        })
    }

    /// Owned handle for the child's slot
    pub fn child_handle(&self) -> Result<OwnedFd> {
        self.endpoint
            .duplicate_handle(self.stream.child_mode())?
            .ok_or_else(|| {
                PipeError::Config(format!(
                    "{} endpoint has no {} side",
                    self.stream,
                    self.stream.child_mode()
                ))
            })
    }

    /// Whether the controller has to pump data through this slot
    pub fn is_relayed(&self) -> bool {
        self.spec == RedirectSpec::Pipe
    }
}
