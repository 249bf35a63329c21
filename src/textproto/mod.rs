//! The SMTP wire codec: buffered line I/O, multi-line reply parsing, the
//! dot-stuffed body transducers, and in-place transport replacement for
//! STARTTLS upgrades.

mod dot;

use std::io;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream,
};
use tokio_rustls::{
    TlsAcceptor, TlsConnector,
    rustls::pki_types::ServerName,
};

pub use dot::{DotReader, DotWriter};

use crate::{
    enhanced::EnhancedCode,
    error::{FrameError, Result},
    reply::ReplyCode,
};

/// Maximum length of a command line including CRLF (RFC 5321
/// Section 4.5.3.1.4).
pub const MAX_COMMAND_LINE: usize = 512;

/// Generous limit for reply lines, bounding memory on hostile peers.
pub const MAX_REPLY_LINE: usize = 2048;

/// Anything that can back an SMTP connection. Blanket-implemented; tests
/// use in-memory duplex pipes, and callers that terminate TLS themselves
/// can hand over an already-wrapped stream.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type BufferedStream = BufStream<Box<dyn Transport>>;

/// A parsed SMTP reply: one shared code and one or more text lines, with
/// the `code-` / `code SP` prefixes stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: ReplyCode,
    pub lines: Vec<String>,
}

impl Reply {
    /// All text lines joined with `\n`.
    #[must_use]
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// A buffered SMTP connection over an arbitrary transport.
///
/// After a STARTTLS handshake the buffered reader and writer are rebuilt
/// around the TLS stream, so plaintext bytes a peer pipelined before the
/// handshake are never interpreted afterwards.
pub struct Conn {
    // `None` after a failed TLS upgrade; every operation then reports
    // `NotConnected`.
    stream: Option<BufferedStream>,
}

impl Conn {
    /// Wraps a transport in the codec.
    pub fn new<S: Transport + 'static>(stream: S) -> Self {
        Self {
            stream: Some(BufStream::new(Box::new(stream))),
        }
    }

    fn stream_mut(&mut self) -> io::Result<&mut BufferedStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection unusable"))
    }

    /// Reads one line, tolerating a bare LF terminator and stripping the
    /// line ending. Enforces `max_len` against the raw line including its
    /// CRLF; an oversized line is drained to its end before the error is
    /// returned, so the stream stays line-aligned.
    ///
    /// # Errors
    ///
    /// [`Error::Frame`] for oversized or non-UTF-8 lines, [`Error::Io`]
    /// for transport failures (including a closed connection).
    pub async fn read_line(&mut self, max_len: usize) -> Result<String> {
        let stream = self.stream_mut()?;
        let mut line: Vec<u8> = Vec::new();
        let mut total = 0_usize;

        loop {
            let available = stream.fill_buf().await?;
            if available.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )
                .into());
            }

            if let Some(pos) = available.iter().position(|&b| b == b'\n') {
                total += pos + 1;
                if total <= max_len {
                    line.extend_from_slice(&available[..pos]);
                }
                stream.consume(pos + 1);

                if total > max_len {
                    return Err(FrameError::LineTooLong {
                        length: total,
                        max: max_len,
                    }
                    .into());
                }

                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return String::from_utf8(line).map_err(|_| FrameError::InvalidUtf8.into());
            }

            total += available.len();
            if total <= max_len {
                line.extend_from_slice(available);
            }
            let n = available.len();
            stream.consume(n);
        }
    }

    /// Writes a line followed by CRLF and flushes.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let stream = self.stream_mut()?;
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await?;
        Ok(())
    }

    /// Reads a single- or multi-line reply. Continuation lines use
    /// `code-`, the final line `code SP`; a bare three-character line is a
    /// single-line reply with empty text. A malformed code or separator is
    /// an error without any attempt at resynchronization.
    ///
    /// # Errors
    ///
    /// [`Error::Frame`] for malformed replies, [`Error::Io`] otherwise.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();
        let mut code: Option<u16> = None;

        loop {
            let line = self.read_line(MAX_REPLY_LINE).await?;
            let bytes = line.as_bytes();
            if bytes.len() < 3 {
                return Err(FrameError::ReplyTooShort(line).into());
            }

            let digits = &bytes[..3];
            let parsed: u16 = std::str::from_utf8(digits)
                .ok()
                .and_then(|digits| digits.parse().ok())
                .ok_or_else(|| {
                    FrameError::InvalidReplyCode(String::from_utf8_lossy(digits).into_owned())
                })?;

            match code {
                Some(expected) if expected != parsed => {
                    return Err(FrameError::CodeMismatch {
                        expected,
                        got: parsed,
                    }
                    .into());
                }
                Some(_) => {}
                None => code = Some(parsed),
            }

            if bytes.len() == 3 {
                lines.push(String::new());
                return Ok(Reply {
                    code: parsed.into(),
                    lines,
                });
            }

            match bytes[3] {
                b'-' => lines.push(line[4..].to_owned()),
                b' ' => {
                    lines.push(line[4..].to_owned());
                    return Ok(Reply {
                        code: parsed.into(),
                        lines,
                    });
                }
                sep => return Err(FrameError::InvalidReplySeparator(char::from(sep)).into()),
            }
        }
    }

    /// Writes a reply, using `code-` on all but the last line. An empty
    /// line list is written as a single empty-text line; an empty final
    /// line is written as the bare code.
    pub async fn write_reply(&mut self, code: ReplyCode, lines: &[String]) -> Result<()> {
        let stream = self.stream_mut()?;
        let empty = [String::new()];
        let lines = if lines.is_empty() { &empty[..] } else { lines };

        for (idx, line) in lines.iter().enumerate() {
            let last = idx == lines.len() - 1;
            let formatted = match (last, line.is_empty()) {
                (true, true) => format!("{:03}", code.as_u16()),
                (true, false) => format!("{:03} {line}", code.as_u16()),
                (false, _) => format!("{:03}-{line}", code.as_u16()),
            };
            stream.write_all(formatted.as_bytes()).await?;
            stream.write_all(b"\r\n").await?;
        }

        stream.flush().await?;
        Ok(())
    }

    /// Sends a command line and reads the reply.
    pub async fn cmd(&mut self, command: &str) -> Result<Reply> {
        self.write_line(command).await?;
        self.read_reply().await
    }

    /// Reads exactly `n` raw bytes (BDAT chunks are not dot-stuffed).
    pub async fn read_exact_body(&mut self, n: usize) -> Result<Vec<u8>> {
        let stream = self.stream_mut()?;
        let mut chunk = vec![0_u8; n];
        stream.read_exact(&mut chunk).await?;
        Ok(chunk)
    }

    /// Reads and discards exactly `n` raw bytes, keeping the stream
    /// aligned when an oversized BDAT chunk has to be rejected.
    pub async fn read_discard(&mut self, mut n: u64) -> Result<()> {
        let stream = self.stream_mut()?;
        let mut scratch = [0_u8; 4096];
        while n > 0 {
            let take = scratch.len().min(usize::try_from(n).unwrap_or(scratch.len()));
            stream.read_exact(&mut scratch[..take]).await?;
            n -= take as u64;
        }
        Ok(())
    }

    /// Writes raw bytes and flushes (the sending half of BDAT).
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream_mut()?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    /// A destuffing reader over the incoming DATA body.
    ///
    /// # Errors
    ///
    /// Fails only when the connection is already unusable.
    pub fn dot_reader(&mut self) -> io::Result<DotReader<'_, BufferedStream>> {
        Ok(DotReader::new(self.stream_mut()?))
    }

    /// A stuffing writer for an outgoing DATA body.
    ///
    /// # Errors
    ///
    /// Fails only when the connection is already unusable.
    pub fn dot_writer(&mut self) -> io::Result<DotWriter<'_, BufferedStream>> {
        Ok(DotWriter::new(self.stream_mut()?))
    }

    /// Server half of the STARTTLS upgrade. The buffered reader and
    /// writer are discarded with the plaintext transport; on handshake
    /// failure the connection becomes unusable.
    pub async fn upgrade_server(&mut self, acceptor: &TlsAcceptor) -> Result<()> {
        let raw = self.take_transport()?;
        let tls = acceptor.accept(raw).await?;
        self.stream = Some(BufStream::new(Box::new(tls)));
        Ok(())
    }

    /// Client half of the STARTTLS upgrade.
    pub async fn upgrade_client(
        &mut self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<()> {
        let raw = self.take_transport()?;
        let tls = connector.connect(server_name, raw).await?;
        self.stream = Some(BufStream::new(Box::new(tls)));
        Ok(())
    }

    fn take_transport(&mut self) -> io::Result<Box<dyn Transport>> {
        self.stream
            .take()
            .map(BufStream::into_inner)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection unusable"))
    }

    /// Flushes and shuts down the write half, signalling EOF to the peer.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            stream.flush().await?;
            stream.shutdown().await?;
        }
        Ok(())
    }
}

/// Splits a leading `X.Y.Z ` enhanced status code (RFC 2034) off a reply
/// text line. Only classes 2 through 5 are accepted; anything else yields
/// the zero code and the text unchanged.
#[must_use]
pub fn parse_enhanced_code(text: &str) -> (EnhancedCode, &str) {
    let (candidate, rest) = match text.split_once(' ') {
        Some((candidate, rest)) => (candidate, rest),
        None => (text, ""),
    };

    let mut segments = candidate.splitn(3, '.');
    let parsed = (|| {
        let class: u16 = segments.next()?.parse().ok()?;
        let subject: u16 = segments.next()?.parse().ok()?;
        let detail: u16 = segments.next()?.parse().ok()?;
        (2..=5).contains(&class).then_some(EnhancedCode::new(class, subject, detail))
    })();

    match parsed {
        Some(code) => (code, rest),
        None => (EnhancedCode::zero(), text),
    }
}
