//! Debug-data bundler.
//!
//! A [`Registry`] maps names to diagnostic [`Source`]s. Building the registry
//! runs every source and packages each payload as one entry of a zip archive;
//! the build is all-or-nothing, so an archive is only ever returned when
//! every source succeeded. [`http`] exposes the build as a GET route.

pub mod error;
pub mod http;
pub mod registry;
pub mod source;

pub use error::{BuildError, RegisterError, RouteError};
pub use registry::{ArchiveOptions, EntryCompression, Registry};
pub use source::{Source, SourceError, StaticSource};
