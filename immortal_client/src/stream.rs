// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Socket plumbing for the two Coordinator streams.
//!
//! The Coordinator pairing follows the rule that the receiving side acts as
//! the server: we *connect* to the Coordinator on the up port for outbound
//! data, and we *listen* on the down port for the Coordinator's inbound
//! connection. Everything above this module is generic over `Read`/`Write`,
//! so the [`pipe`](crate::pipe) module can stand in for both streams in tests.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

use log::*;

use crate::Error;

/// Writes the whole buffer, retrying partial sends until everything is on the
/// wire. Any I/O failure is fatal to the runtime.
pub fn send_all<W: Write>(stream: &mut W, buf: &[u8]) -> Result<(), Error> {
    stream.write_all(buf)?;
    Ok(())
}

/// Fills the whole buffer from the stream, failing with
/// [`Error::ShortRead`] if it ends early.
pub fn recv_exact<R: Read>(stream: &mut R, buf: &mut [u8]) -> Result<(), Error> {
    stream.read_exact(buf)?;
    Ok(())
}

/// Establishes both Coordinator streams on the loopback `host` ("127.0.0.1"
/// or "::1"): binds and listens on `down_port`, connects out on `up_port`,
/// then accepts the Coordinator's inbound connection.
///
/// Returns `(up, down)`. Nagle batching is disabled on both streams; the
/// traffic is small framed messages on loopback and latency is the point.
pub fn connect_coordinator(
    host: &str,
    up_port: u16,
    down_port: u16,
) -> Result<(TcpStream, TcpStream), Error> {
    let listener = TcpListener::bind((host, down_port))?;
    debug!("listening for the coordinator on {host}:{down_port}");

    let up = TcpStream::connect((host, up_port))?;
    up.set_nodelay(true)?;
    debug!("connected up stream to {host}:{up_port}");

    let (down, peer) = listener.accept()?;
    down.set_nodelay(true)?;
    debug!("coordinator connected down stream from {peer}");

    Ok((up, down))
}
