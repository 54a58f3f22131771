use std::{fmt, io, sync::Arc};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// One line of text fanned out to connected sessions.
///
/// The text is shared behind an `Arc` so fanning a message out to many
/// outbound queues clones a pointer, not the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessage {
    text: Arc<str>,
}

impl BroadcastMessage {
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        Self { text: text.into() }
    }

    /// Sent only to a freshly connected client, before it joins.
    pub fn greeting(who: impl fmt::Display) -> Self {
        Self::new(format!("Connected new client: {who}"))
    }

    pub fn joined(who: impl fmt::Display) -> Self {
        Self::new(format!("{who} has joined conversation"))
    }

    pub fn chat(who: impl fmt::Display, line: &str) -> Self {
        Self::new(format!("{who}: {line}"))
    }

    pub fn left(who: impl fmt::Display) -> Self {
        Self::new(format!("{who} has left"))
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for BroadcastMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // Encode once so the line and its delimiter go out in a single write.
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

/// Newline-delimited reader that tolerates bytes which are not UTF-8.
///
/// Invalid sequences become U+FFFD instead of failing the read, so only a
/// real I/O error ends the stream early. A trailing `\r` is stripped along
/// with the `\n`, and a final line without a newline is still returned.
///
/// [`next_line`](Self::next_line) is cancel safe: bytes of a partial line
/// stay buffered until the rest of the line arrives.
#[derive(Debug)]
pub struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R> LineReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }

        let mut end = self.buf.len();
        if self.buf[..end].ends_with(b"\n") {
            end -= 1;
            if self.buf[..end].ends_with(b"\r") {
                end -= 1;
            }
        }
        let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }
}
