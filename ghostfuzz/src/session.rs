//! The client side of the batch protocol.
//!
//! All integers are big-endian `u32`. The client announces itself once with
//! `len, name`; afterwards the server sends `batch_size, word * batch_size`
//! and the client answers each batch with `len, log text`. A `batch_size` of
//! zero ends the session, and so does the server dropping the connection at
//! any point.

use std::io::{self, ErrorKind, Read, Write};

use anyhow::{Context, Result};
use slog::{Logger, info, warn};

use crate::log::LogBuffer;

/// Executes the instruction words of one batch.
pub trait BatchRunner {
    fn run_batch(&mut self, words: &[u32]);
}

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server sent a zero batch size.
    NoMoreInstructions,
    /// The server went away: EOF, reset or broken pipe.
    Disconnected,
    /// The server announced more words than the client accepts.
    BatchTooLarge { size: u32 },
}

/// What the server sent next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Batch {
    Words(Vec<u32>),
    End(SessionEnd),
}

/// Summary of a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub end: SessionEnd,
    pub batches: usize,
    pub instructions: usize,
}

/// Whether `err` means the peer is gone rather than a local failure.
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
    )
}

pub fn send_handshake(stream: &mut impl Write, name: &str) -> io::Result<()> {
    send_frame(stream, name)
}

/// Reads the next batch header and its instruction words.
pub fn read_batch(stream: &mut impl Read, max_batch: u32) -> Result<Batch> {
    let mut header = [0u8; 4];
    match stream.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if is_disconnect(&err) => return Ok(Batch::End(SessionEnd::Disconnected)),
        Err(err) => return Err(err).context("reading batch size"),
    }
    let batch_size = u32::from_be_bytes(header);
    if batch_size == 0 {
        return Ok(Batch::End(SessionEnd::NoMoreInstructions));
    }
    if batch_size > max_batch {
        return Ok(Batch::End(SessionEnd::BatchTooLarge { size: batch_size }));
    }

    let mut raw = vec![0u8; batch_size as usize * 4];
    match stream.read_exact(&mut raw) {
        Ok(()) => {}
        Err(err) if is_disconnect(&err) => return Ok(Batch::End(SessionEnd::Disconnected)),
        Err(err) => return Err(err).context("reading instructions"),
    }
    Ok(Batch::Words(
        raw.chunks_exact(4)
            .map(|word| u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
            .collect(),
    ))
}

pub fn send_log(stream: &mut impl Write, text: &str) -> io::Result<()> {
    send_frame(stream, text)
}

fn send_frame(stream: &mut impl Write, text: &str) -> io::Result<()> {
    let len = u32::try_from(text.len()).map_err(|_| io::Error::new(ErrorKind::InvalidInput, "frame too long"))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(text.as_bytes())?;
    stream.flush()
}

/// Drives a whole session over `stream`: handshake, then batches until the
/// server is done. Every batch is answered with exactly one log frame.
///
/// Anything the server does to end the session, including vanishing, is a
/// [`SessionEnd`]; only local I/O failures are errors.
pub fn run_session<S, R>(
    stream: &mut S,
    name: &str,
    max_batch: u32,
    runner: &mut R,
    log: &LogBuffer,
    logger: &Logger,
) -> Result<SessionSummary>
where
    S: Read + Write,
    R: BatchRunner,
{
    let mut summary = SessionSummary {
        end: SessionEnd::Disconnected,
        batches: 0,
        instructions: 0,
    };
    match send_handshake(stream, name) {
        Ok(()) => {}
        Err(err) if is_disconnect(&err) => {
            warn!(logger, "server closed connection during handshake"; "error" => %err);
            return Ok(summary);
        }
        Err(err) => return Err(err).context("sending handshake"),
    }
    loop {
        let words = match read_batch(stream, max_batch)? {
            Batch::Words(words) => words,
            Batch::End(end) => {
                summary.end = end;
                match end {
                    SessionEnd::NoMoreInstructions => info!(logger, "No more instructions"),
                    SessionEnd::Disconnected => info!(logger, "Server closed connection"),
                    SessionEnd::BatchTooLarge { size } => {
                        warn!(logger, "batch_size too large"; "size" => size, "limit" => max_batch)
                    }
                }
                return Ok(summary);
            }
        };
        info!(logger, "got instructions"; "count" => words.len());
        runner.run_batch(&words);
        summary.batches += 1;
        summary.instructions += words.len();
        match send_log(stream, &log.take()) {
            Ok(()) => {}
            Err(err) if is_disconnect(&err) => {
                warn!(logger, "server closed connection before the log was sent"; "error" => %err);
                return Ok(summary);
            }
            Err(err) => return Err(err).context("sending log"),
        }
    }
}
