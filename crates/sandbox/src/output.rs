use tokio::io::{AsyncRead, AsyncReadExt};

use crate::types::{OutputChunk, OutputSender, OutputStream};

/// Appended once to a stream that hit its ceiling.
pub const TRUNCATION_MARKER: &[u8] = b"\n...[truncated]";

const READ_CHUNK: usize = 8192;

/// Bounded accumulator for one output stream.
///
/// Bytes past `capacity` are dropped as they arrive, never buffered and
/// trimmed later, so an unbounded producer cannot grow memory. The first
/// dropped byte appends [`TRUNCATION_MARKER`]; later ones change nothing.
///
/// With a tap attached, everything appended to the buffer (marker included)
/// is also forwarded as an [`OutputChunk`], so a live view ends up identical
/// to the final capture.
#[derive(Debug)]
pub struct OutputCollector {
    buf: Vec<u8>,
    capacity: usize,
    truncated: bool,
    tap: Option<(OutputStream, OutputSender)>,
}

impl OutputCollector {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.min(READ_CHUNK)),
            capacity,
            truncated: false,
            tap: None,
        }
    }

    /// Forward captured bytes for `stream` to `sender`, when there is one.
    pub fn forward_to(mut self, stream: OutputStream, sender: Option<&OutputSender>) -> Self {
        self.tap = sender.map(|sender| (stream, sender.clone()));
        self
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.truncated {
            return;
        }
        let room = self.capacity.saturating_sub(self.buf.len());
        match chunk.split_at_checked(room) {
            Some((kept, dropped)) => {
                self.append(kept);
                if !dropped.is_empty() {
                    self.mark_truncated();
                }
            }
            None => self.append(chunk),
        }
    }

    fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.buf.extend_from_slice(data);
        if let Some((stream, sender)) = &self.tap {
            // A closed receiver only means nobody is watching any more.
            let _ = sender.send(OutputChunk {
                stream: *stream,
                data: data.to_vec(),
            });
        }
    }

    fn mark_truncated(&mut self) {
        self.truncated = true;
        self.append(TRUNCATION_MARKER);
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Captured bytes, including the marker if one was appended.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Read `reader` to EOF, keeping what fits. Read errors end the stream.
    pub async fn drain<R>(&mut self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Some(data) = chunk.get(..n) {
                        self.push(data);
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "output stream read failed");
                    break;
                }
            }
        }
    }
}
