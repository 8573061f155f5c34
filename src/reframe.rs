//! Stream re-framing between the backend and the client.
//!
//! The backend delivers event records separated by a blank line, chunked at
//! arbitrary byte boundaries. Only whole records may go downstream: a record
//! can span many chunks, a chunk can carry many records, and a multi-byte
//! character can straddle a chunk boundary.

use crate::errors::GatewayResult;
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::Timer;
use std::time::Duration;

/// Record boundary in the backend's streamed output.
pub const RECORD_DELIMITER: &str = "\n\n";

/// Throttle between forwarded records so incrementally rendering consumers
/// do not receive bursts.
pub const RECORD_PACING: Duration = Duration::from_millis(30);

const READ_BUFFER_SIZE: usize = 4096;

/// Pending buffer plus decode-state cursor for one re-framing pass.
///
/// Owned by a single session; after every [`feed`](Self::feed) the buffer
/// holds exactly the unflushed tail (bytes not yet terminated by the
/// delimiter), and `carry` holds at most one incomplete UTF-8 sequence.
#[derive(Debug, Default)]
pub struct ReframeSession {
    pending: String,
    carry: Vec<u8>,
}

impl ReframeSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one chunk and return every record it completes, in arrival
    /// order. Incomplete trailing bytes stay buffered for the next chunk.
    pub fn feed(&mut self, chunk: &[u8], delimiter: &str) -> Vec<String> {
        self.decode(chunk);
        self.split_complete(delimiter)
    }

    /// Unflushed tail once the source is exhausted. Undecodable holdover
    /// bytes are replaced rather than dropped.
    pub fn finish(&mut self) -> Option<String> {
        if !self.carry.is_empty() {
            let leftover = std::mem::take(&mut self.carry);
            self.pending.push_str(&String::from_utf8_lossy(&leftover));
        }
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    fn decode(&mut self, chunk: &[u8]) {
        self.carry.extend_from_slice(chunk);
        loop {
            match std::str::from_utf8(&self.carry) {
                Ok(text) => {
                    self.pending.push_str(text);
                    self.carry.clear();
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    let prefix = std::str::from_utf8(&self.carry[..valid])
                        .expect("valid_up_to marks a UTF-8 boundary");
                    self.pending.push_str(prefix);
                    match err.error_len() {
                        // incomplete trailing sequence, wait for the next chunk
                        None => {
                            self.carry.drain(..valid);
                            break;
                        }
                        Some(bad) => {
                            self.pending.push(char::REPLACEMENT_CHARACTER);
                            self.carry.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }

    fn split_complete(&mut self, delimiter: &str) -> Vec<String> {
        let mut pieces: Vec<&str> = self.pending.split(delimiter).collect();
        // the last piece may be a fractional record and is never emitted here
        let tail = pieces.pop().unwrap_or_default().to_string();
        let complete: Vec<String> = pieces.into_iter().map(str::to_string).collect();
        self.pending = tail;
        complete
    }
}

/// Copy `source` to `sink`, re-framed on `delimiter` with `pacing` between
/// records. Terminates when the source is exhausted: the tail is flushed
/// verbatim, one line feed is appended, and the sink is closed.
pub async fn reframe<R, W>(
    source: &mut R,
    sink: &mut W,
    delimiter: &str,
    pacing: Duration,
) -> GatewayResult<()>
where
    R: AsyncReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    reframe_with_initial(&[], source, sink, delimiter, pacing).await
}

/// Same as [`reframe`] for a source whose first bytes were already consumed
/// (e.g. read together with the response headers).
pub async fn reframe_with_initial<R, W>(
    initial: &[u8],
    source: &mut R,
    sink: &mut W,
    delimiter: &str,
    pacing: Duration,
) -> GatewayResult<()>
where
    R: AsyncReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let mut session = ReframeSession::new();
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    write_records(sink, session.feed(initial, delimiter), delimiter, pacing).await?;

    loop {
        let n = source.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        write_records(sink, session.feed(&buffer[..n], delimiter), delimiter, pacing).await?;
    }

    if let Some(tail) = session.finish() {
        sink.write_all(tail.as_bytes()).await?;
    }
    sink.write_all(b"\n").await?;
    sink.flush().await?;
    sink.close().await?;
    Ok(())
}

async fn write_records<W>(
    sink: &mut W,
    records: Vec<String>,
    delimiter: &str,
    pacing: Duration,
) -> GatewayResult<()>
where
    W: AsyncWriteExt + Unpin,
{
    for mut record in records {
        record.push_str(delimiter);
        sink.write_all(record.as_bytes()).await?;
        sink.flush().await?;
        Timer::after(pacing).await;
    }
    Ok(())
}
