use std::io::Read;

use crate::retry::is_retryable_io;

/// A download stream that restarts after mid-stream disconnects.
///
/// Wraps the body reader of a GET response together with a `reopen` closure
/// that re-issues the request with a `Range: bytes=<offset>-` header. When a
/// read fails with a transient I/O error the stream is reopened from the
/// byte offset reached so far; the caller observes one contiguous body.
pub struct ResumingReader {
    inner: Box<dyn Read + Send>,
    offset: u64,
    restarts_left: u32,
    reopen: Box<dyn Fn(u64) -> std::io::Result<Box<dyn Read + Send>> + Send>,
}

impl ResumingReader {
    pub fn new(
        inner: Box<dyn Read + Send>,
        restarts: u32,
        reopen: impl Fn(u64) -> std::io::Result<Box<dyn Read + Send>> + Send + 'static,
    ) -> Self {
        Self {
            inner,
            offset: 0,
            restarts_left: restarts,
            reopen: Box::new(reopen),
        }
    }
}

impl Read for ResumingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Ok(n) => {
                    self.offset += n as u64;
                    return Ok(n);
                }
                Err(e) if is_retryable_io(&e) && self.restarts_left > 0 => {
                    self.restarts_left -= 1;
                    tracing::warn!(
                        offset = self.offset,
                        "download stream interrupted, resuming with range request: {e}"
                    );
                    self.inner = (self.reopen)(self.offset)?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
