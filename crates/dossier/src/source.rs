use std::error::Error;
use std::io::Write;

/// Error type returned by a [`Source`] that failed to produce its payload.
pub type SourceError = Box<dyn Error + Send + Sync>;

/// Something that can write a diagnostic payload.
///
/// A source is invoked once per archive build with a sink that belongs to the
/// archive entry being written. It borrows the sink for the duration of the
/// call only.
pub trait Source: Send + Sync {
    /// Write the entire payload into `sink`.
    fn write_to(&self, sink: &mut dyn Write) -> Result<(), SourceError>;
}

impl<F> Source for F
where
    F: Fn(&mut dyn Write) -> Result<(), SourceError> + Send + Sync,
{
    fn write_to(&self, sink: &mut dyn Write) -> Result<(), SourceError> {
        self(sink)
    }
}

/// A source that always writes the same bytes.
#[derive(Debug, Clone, Default)]
pub struct StaticSource(Vec<u8>);

impl StaticSource {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }
}

impl Source for StaticSource {
    fn write_to(&self, sink: &mut dyn Write) -> Result<(), SourceError> {
        sink.write_all(&self.0)?;
        Ok(())
    }
}
