// file: src/writer.rs
// description: Append-only JSON-lines writer that encodes a whole batch before touching the stream.
// author: cipher-rc5

use std::io::Write;

use crate::capture::CaptureError;
use crate::record::TraceRecord;

/// Batches are staged in `scratch` and reach `inner` in a single `write_all`.
pub struct TraceWriter<W: Write> {
    inner: W,
    scratch: Vec<u8>,
    lines_written: u64,
}

impl<W: Write> TraceWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            scratch: Vec::new(),
            lines_written: 0,
        }
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    pub fn write_record(&mut self, record: &TraceRecord) -> Result<(), CaptureError> {
        self.write_batch(std::slice::from_ref(record)).map(|_| ())
    }

    /// Encodes every record first, then appends them and flushes once.
    ///
    /// An encoding failure leaves the stream untouched.
    pub fn write_batch(&mut self, records: &[TraceRecord]) -> Result<usize, CaptureError> {
        self.scratch.clear();
        for record in records {
            serde_json::to_writer(&mut self.scratch, record)?;
            self.scratch.push(b'\n');
        }
        self.inner.write_all(&self.scratch)?;
        self.inner.flush()?;
        self.lines_written += records.len() as u64;
        Ok(records.len())
    }

    pub fn flush(&mut self) -> Result<(), CaptureError> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(mut self) -> Result<W, CaptureError> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}
