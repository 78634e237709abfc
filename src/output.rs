//! Process output streaming and the terminal buffer it feeds.

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default cap for a session's terminal buffer (1 MiB).
pub const DEFAULT_TERMINAL_CAP: usize = 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// One piece of process output as the sandbox delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Text(String),
    Bytes(Vec<u8>),
}

/// Incremental UTF-8 decoder; carries an incomplete trailing sequence over to
/// the next chunk instead of mangling it.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
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
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is left once the source is done.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Drain `source` until it ends, handing each decoded chunk to `on_chunk` in
/// arrival order.
pub async fn stream_output<S, F>(mut source: S, mut on_chunk: F) -> io::Result<()>
where
    S: Stream<Item = io::Result<OutputChunk>> + Unpin,
    F: FnMut(&str),
{
    let mut decoder = Utf8Decoder::default();
    while let Some(chunk) = source.next().await {
        let text = match chunk? {
            OutputChunk::Text(text) => text,
            OutputChunk::Bytes(bytes) => decoder.decode(&bytes),
        };
        if !text.is_empty() {
            on_chunk(&text);
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        on_chunk(&rest);
    }
    Ok(())
}

/// Adapt a raw reader into a chunk stream ending at EOF.
pub fn reader_chunks<R>(reader: R) -> BoxStream<'static, io::Result<OutputChunk>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold(Some(reader), |state| async move {
        let mut reader = state?;
        let mut buf = vec![0u8; READ_CHUNK];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(OutputChunk::Bytes(buf)), Some(reader)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

/// Append-only text buffer with a byte cap. On overflow the oldest text is
/// dropped, cut at a character boundary.
#[derive(Debug, Clone)]
pub struct TerminalBuffer {
    text: String,
    cap: usize,
    dropped: u64,
}

impl TerminalBuffer {
    pub fn with_cap(cap: usize) -> Self {
        Self {
            text: String::new(),
            cap,
            dropped: 0,
        }
    }

    pub fn unbounded() -> Self {
        Self::with_cap(usize::MAX)
    }

    pub fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() > self.cap {
            let mut cut = self.text.len() - self.cap;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
            self.dropped += cut as u64;
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Bytes discarded from the front so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for TerminalBuffer {
    fn default() -> Self {
        Self::with_cap(DEFAULT_TERMINAL_CAP)
    }
}
