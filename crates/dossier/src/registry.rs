use std::io::{self, Cursor, Write};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{BuildError, RegisterError};
use crate::source::{Source, SourceError};

/// How each entry is stored inside the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryCompression {
    #[default]
    Deflated,
    Stored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArchiveOptions {
    pub compression: EntryCompression,
    /// Deflate level; `None` uses the zip writer's default.
    pub compression_level: Option<i64>,
}

impl ArchiveOptions {
    fn file_options(&self) -> SimpleFileOptions {
        match self.compression {
            EntryCompression::Deflated => SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(self.compression_level),
            EntryCompression::Stored => {
                SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
            }
        }
    }
}

#[derive(Clone)]
struct Entry {
    name: String,
    source: Arc<dyn Source>,
}

/// Named diagnostic sources, bundled into one zip archive on demand.
///
/// Names are unique for the lifetime of the registry and entries are never
/// removed. Builds work on a snapshot of the entries taken under the read
/// lock, so registration may race with an in-flight build without either
/// observing a half-added source.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<Vec<Entry>>,
    options: ArchiveOptions,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ArchiveOptions) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            options,
        }
    }

    pub fn options(&self) -> ArchiveOptions {
        self.options
    }

    /// Register `source` under `name`, which becomes its entry name in the archive.
    pub fn register_source(
        &self,
        name: impl Into<String>,
        source: impl Source + 'static,
    ) -> Result<(), RegisterError> {
        self.register_arc(name, Arc::new(source))
    }

    /// Register a source that is shared with other owners.
    pub fn register_arc(
        &self,
        name: impl Into<String>,
        source: Arc<dyn Source>,
    ) -> Result<(), RegisterError> {
        let name = name.into();
        validate_name(&name)?;

        let mut entries = self.entries.write();
        if entries.iter().any(|entry| entry.name == name) {
            return Err(RegisterError::DuplicateName { name });
        }
        debug!(source = %name, "registered diagnostic source");
        entries.push(Entry { name, source });
        Ok(())
    }

    /// Register a closure as a source, for call sites where the closure's
    /// argument type would otherwise need an annotation.
    pub fn register_fn<F>(&self, name: impl Into<String>, f: F) -> Result<(), RegisterError>
    where
        F: Fn(&mut dyn Write) -> Result<(), SourceError> + Send + Sync + 'static,
    {
        self.register_source(name, f)
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().iter().any(|entry| entry.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Build the archive and copy it into `sink`.
    ///
    /// The archive is assembled in memory first. If any source fails, nothing
    /// is written to `sink`.
    pub fn write_zip<W: Write>(&self, sink: &mut W) -> Result<(), BuildError> {
        let archive = self.build_archive()?;
        sink.write_all(&archive)?;
        sink.flush()?;
        Ok(())
    }

    /// Build the archive in memory, invoking every source in registration order.
    ///
    /// Stops at the first failing source and returns its error; the partial
    /// archive is dropped.
    pub fn build_archive(&self) -> Result<Vec<u8>, BuildError> {
        let entries = self.entries.read().clone();
        let started = Instant::now();

        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for entry in &entries {
            writer
                .start_file(entry.name.as_str(), self.options.file_options())
                .map_err(|source| BuildError::Archive {
                    name: Some(entry.name.clone()),
                    source,
                })?;

            let entry_started = Instant::now();
            let mut counting = CountingWriter::new(&mut writer);
            if let Err(source) = entry.source.write_to(&mut counting) {
                warn!(source = %entry.name, error = %source, "diagnostic source failed, aborting archive");
                return Err(BuildError::Source {
                    name: entry.name.clone(),
                    source,
                });
            }
            debug!(
                source = %entry.name,
                bytes = counting.bytes,
                elapsed_ms = entry_started.elapsed().as_millis() as u64,
                "wrote archive entry"
            );
        }

        let archive = writer
            .finish()
            .map_err(|source| BuildError::Archive { name: None, source })?
            .into_inner();
        debug!(
            entries = entries.len(),
            bytes = archive.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "built diagnostic archive"
        );
        Ok(archive)
    }
}

fn validate_name(name: &str) -> Result<(), RegisterError> {
    let reason = if name.is_empty() {
        "name must be non-empty"
    } else if name.ends_with('/') {
        "name must not end with '/'"
    } else {
        return Ok(());
    };
    Err(RegisterError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

struct CountingWriter<'a> {
    inner: &'a mut dyn Write,
    bytes: u64,
}

impl<'a> CountingWriter<'a> {
    fn new(inner: &'a mut dyn Write) -> Self {
        Self { inner, bytes: 0 }
    }
}

impl Write for CountingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
