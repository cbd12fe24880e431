//! Output plumbing shared by the supervisor and interactive sessions.
//!
//! Each child stream is turned into its own `Stream` of byte chunks and
//! consumed independently, so cancelling one consumer never affects the
//! other.

use std::io;

use futures::stream::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_stream::StreamExt;

const CHUNK_SIZE: usize = 8 * 1024;

/// Read `reader` to EOF as a stream of chunks.
pub fn chunks<R>(mut reader: R) -> impl Stream<Item = io::Result<Vec<u8>>> + Send
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async_stream::try_stream! {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            yield buf[..n].to_vec();
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl CapturedOutput {
    /// Append `chunk`, keeping at most `limit` bytes in total.
    pub fn push(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.bytes.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(chunk);
        }
    }

    pub fn into_text(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&format!("[output truncated at {} bytes]", self.bytes.len()));
        }
        text
    }
}

/// Drain a chunk stream, keeping at most `limit` bytes.
///
/// Reading continues past the limit so the child never blocks on a full
/// pipe. A read error ends the stream.
pub async fn collect<S>(stream: S, limit: usize) -> CapturedOutput
where
    S: Stream<Item = io::Result<Vec<u8>>>,
{
    tokio::pin!(stream);
    let mut out = CapturedOutput::default();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => out.push(&chunk, limit),
            Err(e) => {
                tracing::debug!(error = %e, "output stream read failed");
                break;
            }
        }
    }
    out
}

/// Incremental UTF-8 decoder for chunked output.
///
/// A code point split across two chunks is held back until its remaining
/// bytes arrive; invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // incomplete sequence at the end: wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is still held back at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunks_reads_to_eof() {
        let data: &[u8] = b"hello world";
        let out = collect(chunks(data), 1024).await;
        assert_eq!(out.bytes, b"hello world");
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn collect_truncates_at_limit() {
        let data = vec![b'x'; 3 * CHUNK_SIZE];
        let out = collect(chunks(std::io::Cursor::new(data)), 100).await;
        assert_eq!(out.bytes.len(), 100);
        assert!(out.truncated);
        assert!(out.into_text().ends_with("[output truncated at 100 bytes]"));
    }

    #[tokio::test]
    async fn collect_stops_on_error() {
        let stream = tokio_stream::iter(vec![
            Ok(b"partial".to_vec()),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")),
            Ok(b"never".to_vec()),
        ]);
        let out = collect(stream, 1024).await;
        assert_eq!(out.bytes, b"partial");
    }

    #[test]
    fn untruncated_text_is_verbatim() {
        let out = CapturedOutput {
            bytes: b"ok\n".to_vec(),
            truncated: false,
        };
        assert_eq!(out.into_text(), "ok\n");
    }

    #[test]
    fn decoder_holds_split_code_point() {
        let bytes = "héllo".as_bytes();
        // 'é' is two bytes; split between them
        let mut dec = Utf8Decoder::default();
        assert_eq!(dec.push(&bytes[..2]), "h");
        assert_eq!(dec.push(&bytes[2..]), "éllo");
        assert_eq!(dec.finish(), "");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut dec = Utf8Decoder::default();
        assert_eq!(dec.push(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn decoder_flushes_dangling_bytes_on_finish() {
        let mut dec = Utf8Decoder::default();
        assert_eq!(dec.push(&"€".as_bytes()[..1]), "");
        assert_eq!(dec.finish(), "\u{FFFD}");
    }
}
