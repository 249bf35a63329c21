//! Dot-stuffed DATA body transducers (RFC 5321 Section 4.5.2).
//!
//! [`DotReader`] removes dot-stuffing from an incoming body and stops at
//! the `CRLF.CRLF` terminator. [`DotWriter`] doubles leading dots on the
//! way out and appends the terminator on close. The body handed to or
//! received from the application never includes the terminator itself.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Reader-side transducer states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DotState {
    /// At the beginning of a line.
    BeginLine,
    /// In the middle of a line.
    InLine,
    /// Just saw `\r`.
    SawCr,
    /// Saw `.` at the beginning of a line.
    SawDotAtBol,
    /// Saw `.` then `\r` at the beginning of a line.
    SawDotCr,
    /// The terminator was consumed; all further reads return EOF.
    Ended,
}

/// One transition of the destuffing state machine: the bytes to emit for
/// an input byte, the next state, and whether the terminator was reached.
struct Step {
    emit: [u8; 3],
    emit_len: usize,
    next: DotState,
    terminal: bool,
}

impl Step {
    const fn to(next: DotState, emit: [u8; 3], emit_len: usize) -> Self {
        Self {
            emit,
            emit_len,
            next,
            terminal: false,
        }
    }

    const fn end() -> Self {
        Self {
            emit: [0; 3],
            emit_len: 0,
            next: DotState::Ended,
            terminal: true,
        }
    }
}

fn step(state: DotState, b: u8) -> Step {
    match state {
        DotState::BeginLine => match b {
            b'.' => Step::to(DotState::SawDotAtBol, [0; 3], 0),
            b'\r' => Step::to(DotState::SawCr, [b, 0, 0], 1),
            // Bare LF is accepted as a line ending for robustness.
            b'\n' => Step::to(DotState::BeginLine, [b, 0, 0], 1),
            _ => Step::to(DotState::InLine, [b, 0, 0], 1),
        },
        DotState::InLine => match b {
            b'\r' => Step::to(DotState::SawCr, [b, 0, 0], 1),
            b'\n' => Step::to(DotState::BeginLine, [b, 0, 0], 1),
            _ => Step::to(DotState::InLine, [b, 0, 0], 1),
        },
        DotState::SawCr => match b {
            b'\n' => Step::to(DotState::BeginLine, [b, 0, 0], 1),
            // A CR run stays in this state.
            b'\r' => Step::to(DotState::SawCr, [b, 0, 0], 1),
            _ => Step::to(DotState::InLine, [b, 0, 0], 1),
        },
        DotState::SawDotAtBol => match b {
            b'\r' => Step::to(DotState::SawDotCr, [0; 3], 0),
            // ".\n" is accepted as a lenient terminator.
            b'\n' => Step::end(),
            // ".." destuffs to a single dot.
            b'.' => Step::to(DotState::InLine, [b'.', 0, 0], 1),
            _ => Step::to(DotState::InLine, [b'.', b, 0], 2),
        },
        DotState::SawDotCr => match b {
            b'\n' => Step::end(),
            // False alarm: the buffered ".\r" belongs to the body.
            _ => Step::to(DotState::InLine, [b'.', b'\r', b], 3),
        },
        DotState::Ended => Step::end(),
    }
}

/// An [`AsyncRead`] that yields the destuffed DATA body and returns EOF
/// once the `CRLF.CRLF` terminator has been consumed from the underlying
/// stream. Underlying EOF before the terminator is an error.
pub struct DotReader<'a, R: AsyncBufRead + Unpin> {
    inner: &'a mut R,
    state: DotState,
    // Emitted bytes that did not fit the caller's buffer (at most two).
    pending: [u8; 2],
    pending_len: usize,
}

impl<'a, R: AsyncBufRead + Unpin> DotReader<'a, R> {
    /// Wraps a buffered reader positioned at the start of a DATA body.
    pub fn new(inner: &'a mut R) -> Self {
        Self {
            inner,
            state: DotState::BeginLine,
            pending: [0; 2],
            pending_len: 0,
        }
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for DotReader<'_, R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let start = buf.filled().len();

        while this.pending_len > 0 && buf.remaining() > 0 {
            buf.put_slice(&[this.pending[0]]);
            this.pending[0] = this.pending[1];
            this.pending_len -= 1;
        }

        if this.state == DotState::Ended {
            return Poll::Ready(Ok(()));
        }

        loop {
            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            let mut consumed = 0;
            let mut done = false;

            {
                let chunk = match Pin::new(&mut *this.inner).poll_fill_buf(cx) {
                    Poll::Pending => {
                        return if buf.filled().len() > start {
                            Poll::Ready(Ok(()))
                        } else {
                            Poll::Pending
                        };
                    }
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                    Poll::Ready(Ok(chunk)) => chunk,
                };

                if chunk.is_empty() {
                    return if buf.filled().len() > start {
                        Poll::Ready(Ok(()))
                    } else {
                        Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed before end of DATA body",
                        )))
                    };
                }

                while consumed < chunk.len() && buf.remaining() > 0 && !done {
                    let Step {
                        emit,
                        emit_len,
                        next,
                        terminal,
                    } = step(this.state, chunk[consumed]);

                    consumed += 1;
                    this.state = next;

                    let fits = emit_len.min(buf.remaining());
                    buf.put_slice(&emit[..fits]);
                    if fits < emit_len {
                        let spill = &emit[fits..emit_len];
                        this.pending[..spill.len()].copy_from_slice(spill);
                        this.pending_len = spill.len();
                        done = true;
                    }

                    if terminal {
                        done = true;
                    }
                }
            }

            Pin::new(&mut *this.inner).consume(consumed);

            if done || this.state == DotState::Ended {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

/// Writes a dot-stuffed DATA body. [`DotWriter::close`] terminates the
/// body with `.\r\n` (adding a line ending first when the body did not
/// end with one) and flushes; closing twice is a no-op.
pub struct DotWriter<'a, W: AsyncWrite + Unpin> {
    inner: &'a mut W,
    at_line_start: bool,
    closed: bool,
}

impl<'a, W: AsyncWrite + Unpin> DotWriter<'a, W> {
    /// Wraps a writer about to carry a DATA body.
    pub fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            at_line_start: true,
            closed: false,
        }
    }

    /// Writes body bytes, doubling any dot that starts a line.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error, or `BrokenPipe` after `close`.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after close of DATA body",
            ));
        }

        let mut rest = data;
        while !rest.is_empty() {
            if self.at_line_start && rest[0] == b'.' {
                self.inner.write_all(b".").await?;
            }

            // One line at a time, including its newline when present.
            let end = rest
                .iter()
                .position(|&b| b == b'\n')
                .map_or(rest.len(), |pos| pos + 1);
            self.inner.write_all(&rest[..end]).await?;
            self.at_line_start = rest[end - 1] == b'\n';
            rest = &rest[end..];
        }

        Ok(())
    }

    /// Writes the body terminator and flushes.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if !self.at_line_start {
            self.inner.write_all(b"\r\n").await?;
        }
        self.inner.write_all(b".\r\n").await?;
        self.inner.flush().await
    }
}
