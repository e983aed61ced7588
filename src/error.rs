//! Small outcome types for the socket layer.
//!
//! The original protocol's I/O primitives return C-style numeric sentinels
//! (`-1` error, `0` clean-close, `len` success). Here those outcomes become
//! explicit enums carried inside `std::io::Result`, with timeouts and
//! external wake-ups both surfacing as `io::ErrorKind::TimedOut` — by
//! design the two are indistinguishable to callers (see
//! [`crate::socket::InterruptibleSocket`]).

use std::io;

/// Result of a `recvExact`/`recvDiscard`-style read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// The requested number of bytes were read.
    Complete,
    /// The peer closed the connection before any byte was read.
    ClosedAtStart,
}

/// Result of a `sendTo`/`sendAll`-style write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The entire buffer was written.
    All,
    /// Only part of the buffer could be written in one non-blocking attempt
    /// (datagram sends only; `sendAll` never returns this, it loops instead).
    Partial(usize),
}

/// Turns a would-block error after a successful readiness wait into a
/// timeout: a spurious wakeup should look identical to a deadline to
/// every caller, never propagate as its own error kind.
pub(crate) fn would_block_as_timeout(err: io::Error) -> io::Error {
    if err.kind() == io::ErrorKind::WouldBlock {
        io::Error::new(io::ErrorKind::TimedOut, "wait returned ready but read/write would block")
    } else {
        err
    }
}

pub(crate) fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded or externally woken")
}
