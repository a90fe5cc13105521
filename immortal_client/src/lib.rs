// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Client runtime for an application ("Immortal") whose message stream is made
//! durable by a local Coordinator sidecar.
//!
//! The Coordinator logs every message the application sends and receives, so
//! the application never touches the network itself: outbound calls are framed
//! as envelopes and queued on a ring buffer that a dedicated progress thread
//! drains to the Coordinator, while inbound log records are parsed and
//! dispatched back into the application one message at a time.

pub mod handshake;
pub mod ring;
pub mod runtime;
pub mod stream;
pub mod varint;
pub mod wire;

use std::fmt;

pub use runtime::{Immortal, OutgoingCall, Runtime, RuntimeHandle, DEFAULT_BUFFER_BYTES};
pub use wire::{LogHeader, MsgType};

/// The possible errors that can arise while speaking the Coordinator protocol.
///
/// Every one of these is fatal at this level: the Coordinator is the source of
/// truth and replay must restart from a durable log position, so there is no
/// meaningful local recovery. Callers log a diagnostic and exit.
#[derive(Debug)]
pub enum Error {
    /// A varint would have needed a sixth continuation byte.
    InvalidVarint,

    /// The stream ended before a full header or payload could be read.
    ShortRead,

    /// A message payload ended in the middle of an envelope.
    UnexpectedEof,

    /// A tag byte outside the enumerated message-type set.
    UnknownTag(u8),

    /// A known but unexpected message type at a point in the protocol where
    /// only specific types are legal (the startup handshake).
    Protocol(u8),

    /// A protocol branch this runtime does not implement yet.
    NotImplemented(&'static str),

    /// Errors returned by socket I/O.
    Socket(std::io::Error),

    /// A ring buffer reservation larger than the whole buffer.
    TooLarge { requested: usize, capacity: usize },

    /// A log record whose length field is outside the legal range.
    OversizedRecord { total_size: i32 },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidVarint => write!(f, "varint ran past its five-byte maximum"),
            Self::ShortRead => write!(f, "stream ended mid-read"),
            Self::UnexpectedEof => write!(f, "payload ended mid-envelope"),
            Self::UnknownTag(t) => write!(f, "unknown message type tag {t}"),
            Self::Protocol(t) => write!(f, "unexpected message type {t} during startup"),
            Self::NotImplemented(what) => write!(f, "not implemented: {what}"),
            Self::Socket(e) => write!(f, "socket error: {e}"),
            Self::TooLarge {
                requested,
                capacity,
            } => write!(
                f,
                "reservation of {requested} bytes exceeds the {capacity}-byte ring"
            ),
            Self::OversizedRecord { total_size } => {
                write!(f, "log record claims an illegal total size of {total_size}")
            }
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        // Premature EOF on a blocking full read is its own kind; everything
        // else is a transport failure.
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::ShortRead
        } else {
            Self::Socket(e)
        }
    }
}

/// A "pipe", constructed using socketpair(2), that can stand in for the
/// Coordinator connection when testing the runtime in-process.
pub mod pipe {
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    pub struct Endpoint {
        fd: std::os::fd::OwnedFd,
    }

    pub fn pipe() -> std::io::Result<(Endpoint, Endpoint)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;

        Ok((Endpoint { fd: a }, Endpoint { fd: b }))
    }

    impl std::io::Read for Endpoint {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(nix::unistd::read(&self.fd, buf)?)
        }
    }

    impl std::io::Write for Endpoint {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(nix::unistd::write(&self.fd, buf)?)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
