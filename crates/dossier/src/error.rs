use std::error::Error;
use std::fmt;
use std::io;

use crate::source::SourceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    DuplicateName { name: String },
    InvalidName { name: String, reason: &'static str },
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateName { name } => {
                write!(f, "a source named {name:?} is already registered")
            }
            Self::InvalidName { name, reason } => {
                write!(f, "invalid source name {name:?}: {reason}")
            }
        }
    }
}

impl Error for RegisterError {}

#[derive(Debug)]
pub enum BuildError {
    /// A source failed while writing its entry. The archive is discarded.
    Source { name: String, source: SourceError },
    /// The zip container rejected an entry or could not be finalized.
    Archive {
        name: Option<String>,
        source: zip::result::ZipError,
    },
    /// The finished archive could not be copied to the caller's sink.
    Io(io::Error),
}

impl BuildError {
    /// Name of the source whose entry was being written when the build failed.
    pub fn source_name(&self) -> Option<&str> {
        match self {
            Self::Source { name, .. } => Some(name),
            Self::Archive { name, .. } => name.as_deref(),
            Self::Io(_) => None,
        }
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source { name, source } => {
                write!(f, "source {name:?} failed to write: {source}")
            }
            Self::Archive {
                name: Some(name),
                source,
            } => write!(f, "zip entry {name:?} could not be written: {source}"),
            Self::Archive { name: None, source } => {
                write!(f, "zip archive could not be finalized: {source}")
            }
            Self::Io(e) => write!(f, "failed to write archive to sink: {e}"),
        }
    }
}

impl Error for BuildError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Source { source, .. } => Some(source.as_ref()),
            Self::Archive { source, .. } => Some(source),
            Self::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for BuildError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    InvalidPath { path: String },
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPath { path } => {
                write!(f, "route path must be literal and start with '/', got {path:?}")
            }
        }
    }
}

impl Error for RouteError {}
