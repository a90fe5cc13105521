// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Framing for the Coordinator wire protocol.
//!
//! Inbound traffic arrives as *log records*: a 24-byte little-endian header
//! followed by a payload of concatenated envelopes. Outbound traffic is bare
//! envelopes with no enclosing record — log headers are minted by the
//! Coordinator, never by the client. An envelope is `varint size || tag ||
//! body`, where `size` counts the tag byte and body but not the varint itself.

use std::fmt::Write as _;
use std::io::Read;

use crate::varint;
use crate::Error;

/// Byte size of the log record header.
pub const LOG_HEADER_SIZE: usize = 24;

/// Upper bound accepted for a single log record. A length field beyond this is
/// treated as corruption rather than an instruction to allocate.
pub const MAX_RECORD_BYTES: i32 = 1 << 30;

/// Marker for the `rpc_or_return` byte of an outbound RPC that is a call
/// rather than a returned value.
pub const RPC_OR_RETURN_CALL: u8 = 0;

/// Header of one durable log record delivered by the Coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    /// Commit identifier assigned by the Coordinator.
    pub commit_id: i32,

    /// Size of the whole record in bytes, including this header.
    pub total_size: i32,

    /// Per-byte running sum over the payload (see [`payload_checksum`]).
    pub checksum: i64,

    /// Monotonic sequence number.
    pub seq_id: i64,
}

impl LogHeader {
    /// Reads exactly one header off the stream.
    pub fn read_from<R: Read>(stream: &mut R) -> Result<Self, Error> {
        let mut raw = [0u8; LOG_HEADER_SIZE];
        stream.read_exact(&mut raw)?;
        Ok(Self::decode(&raw))
    }

    pub fn decode(raw: &[u8; LOG_HEADER_SIZE]) -> Self {
        Self {
            commit_id: i32::from_le_bytes(raw[0..4].try_into().unwrap()),
            total_size: i32::from_le_bytes(raw[4..8].try_into().unwrap()),
            checksum: i64::from_le_bytes(raw[8..16].try_into().unwrap()),
            seq_id: i64::from_le_bytes(raw[16..24].try_into().unwrap()),
        }
    }

    pub fn encode(&self) -> [u8; LOG_HEADER_SIZE] {
        let mut raw = [0u8; LOG_HEADER_SIZE];
        raw[0..4].copy_from_slice(&self.commit_id.to_le_bytes());
        raw[4..8].copy_from_slice(&self.total_size.to_le_bytes());
        raw[8..16].copy_from_slice(&self.checksum.to_le_bytes());
        raw[16..24].copy_from_slice(&self.seq_id.to_le_bytes());
        raw
    }

    /// Validated size of the payload that follows this header.
    pub fn payload_size(&self) -> Result<usize, Error> {
        if self.total_size < LOG_HEADER_SIZE as i32 || self.total_size > MAX_RECORD_BYTES {
            return Err(Error::OversizedRecord {
                total_size: self.total_size,
            });
        }
        Ok(self.total_size as usize - LOG_HEADER_SIZE)
    }
}

/// Message type tags. The integer assignments are wire-fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Rpc = 0,
    AttachTo = 1,
    TakeCheckpoint = 2,
    RpcBatch = 5,
    Checkpoint = 8,
    InitialMessage = 9,
    UpgradeTakeCheckpoint = 10,
    TakeBecomingPrimaryCheckpoint = 11,
    UpgradeService = 12,
}

impl MsgType {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MsgType {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self, Error> {
        Ok(match tag {
            0 => Self::Rpc,
            1 => Self::AttachTo,
            2 => Self::TakeCheckpoint,
            5 => Self::RpcBatch,
            8 => Self::Checkpoint,
            9 => Self::InitialMessage,
            10 => Self::UpgradeTakeCheckpoint,
            11 => Self::TakeBecomingPrimaryCheckpoint,
            12 => Self::UpgradeService,
            other => return Err(Error::UnknownTag(other)),
        })
    }
}

/// One decoded envelope borrowed out of a record payload.
#[derive(Debug, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub tag: MsgType,
    pub body: &'a [u8],
}

/// Iterates the envelopes packed into a record payload (or any other
/// concatenation of envelopes), yielding each `(tag, body)` in order.
///
/// The iterator fuses after the first error; a truncated final envelope is
/// [`Error::UnexpectedEof`] rather than a silent partial message.
pub struct EnvelopeIter<'a> {
    rest: &'a [u8],
    consumed: usize,
    failed: bool,
}

impl<'a> EnvelopeIter<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            rest: payload,
            consumed: 0,
            failed: false,
        }
    }

    /// Byte offset of the next unread envelope, for diagnostics.
    pub fn offset(&self) -> usize {
        self.consumed
    }

    fn fail(&mut self, e: Error) -> Option<Result<Envelope<'a>, Error>> {
        self.failed = true;
        Some(Err(e))
    }
}

impl<'a> Iterator for EnvelopeIter<'a> {
    type Item = Result<Envelope<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.is_empty() {
            return None;
        }

        let (size, prefix) = match varint::read(self.rest) {
            Ok(v) => v,
            Err(e) => return self.fail(e),
        };
        if size < 1 {
            // An envelope must at least hold its tag byte.
            return self.fail(Error::UnexpectedEof);
        }
        let size = size as usize;
        if self.rest.len() < prefix + size {
            return self.fail(Error::UnexpectedEof);
        }

        let tag = match MsgType::try_from(self.rest[prefix]) {
            Ok(t) => t,
            Err(e) => return self.fail(e),
        };
        let body = &self.rest[prefix + 1..prefix + size];

        self.rest = &self.rest[prefix + size..];
        self.consumed += prefix + size;

        Some(Ok(Envelope { tag, body }))
    }
}

/// An inbound-form RPC parsed out of an envelope body. The destination is
/// implicit: the Coordinator only delivers us our own messages.
#[derive(Debug, PartialEq, Eq)]
pub struct IncomingRpc<'a> {
    pub method_id: i32,
    pub fire_and_forget: bool,
    pub args: &'a [u8],
}

/// Parses the body of an inbound `Rpc` envelope: one reserved byte, the
/// method id, the fire-and-forget flag, and the raw arguments to the end.
pub fn parse_incoming_rpc(body: &[u8]) -> Result<IncomingRpc<'_>, Error> {
    if body.is_empty() {
        return Err(Error::UnexpectedEof);
    }
    let (method_id, used) = varint::read(&body[1..])?;
    let flag = *body.get(1 + used).ok_or(Error::UnexpectedEof)?;
    Ok(IncomingRpc {
        method_id,
        fire_and_forget: flag != 0,
        args: &body[1 + used + 1..],
    })
}

// Envelope encoders
// --------------------------------------------------------------------------
//
// Each message type gets a `*_size` function returning the exact frame size
// (varint prefix included) and a `write_*` function that encodes into the
// front of a buffer of at least that size and returns the bytes written. The
// pairing lets callers reserve exactly what they release on the ring buffer.

fn frame_size(envelope_size: usize) -> usize {
    varint::size(envelope_size as i32) + envelope_size
}

fn write_prefix(buf: &mut [u8], envelope_size: usize, tag: MsgType) -> usize {
    let mut off = varint::write(buf, envelope_size as i32);
    buf[off] = tag.tag();
    off += 1;
    off
}

fn outgoing_rpc_body_size(dest: &[u8], method_id: i32, args_len: usize) -> usize {
    varint::size(dest.len() as i32) + dest.len() + 1 + varint::size(method_id) + 1 + args_len
}

/// Exact frame size of an outbound-form RPC envelope.
pub fn outgoing_rpc_size(dest: &[u8], method_id: i32, args_len: usize) -> usize {
    frame_size(1 + outgoing_rpc_body_size(dest, method_id, args_len))
}

/// Writes everything of an outbound RPC envelope except the argument bytes,
/// which the caller fills in place directly after the returned offset. The
/// header still needs `args_len` up front because the envelope size prefix
/// counts the arguments.
pub fn write_outgoing_rpc_hdr(
    buf: &mut [u8],
    dest: &[u8],
    rpc_or_return: u8,
    method_id: i32,
    fire_and_forget: bool,
    args_len: usize,
) -> usize {
    let envelope_size = 1 + outgoing_rpc_body_size(dest, method_id, args_len);
    let mut off = write_prefix(buf, envelope_size, MsgType::Rpc);
    off += varint::write(&mut buf[off..], dest.len() as i32);
    buf[off..off + dest.len()].copy_from_slice(dest);
    off += dest.len();
    buf[off] = rpc_or_return;
    off += 1;
    off += varint::write(&mut buf[off..], method_id);
    buf[off] = fire_and_forget as u8;
    off += 1;
    off
}

/// Writes one complete outbound-form RPC envelope.
pub fn write_outgoing_rpc(
    buf: &mut [u8],
    dest: &[u8],
    rpc_or_return: u8,
    method_id: i32,
    fire_and_forget: bool,
    args: &[u8],
) -> usize {
    let off = write_outgoing_rpc_hdr(buf, dest, rpc_or_return, method_id, fire_and_forget, args.len());
    buf[off..off + args.len()].copy_from_slice(args);
    off + args.len()
}

fn incoming_rpc_body_size(method_id: i32, args_len: usize) -> usize {
    1 + varint::size(method_id) + 1 + args_len
}

/// Exact frame size of an inbound-form RPC envelope.
pub fn incoming_rpc_size(method_id: i32, args_len: usize) -> usize {
    frame_size(1 + incoming_rpc_body_size(method_id, args_len))
}

/// Writes one complete inbound-form RPC envelope (reserved byte zeroed).
pub fn write_incoming_rpc(
    buf: &mut [u8],
    method_id: i32,
    fire_and_forget: bool,
    args: &[u8],
) -> usize {
    let envelope_size = 1 + incoming_rpc_body_size(method_id, args.len());
    let mut off = write_prefix(buf, envelope_size, MsgType::Rpc);
    buf[off] = 0;
    off += 1;
    off += varint::write(&mut buf[off..], method_id);
    buf[off] = fire_and_forget as u8;
    off += 1;
    buf[off..off + args.len()].copy_from_slice(args);
    off + args.len()
}

/// Exact frame size of an `AttachTo` envelope.
pub fn attach_to_size(dest: &[u8]) -> usize {
    frame_size(1 + dest.len())
}

/// Writes an `AttachTo` envelope; the body is the bare destination name.
pub fn write_attach_to(buf: &mut [u8], dest: &[u8]) -> usize {
    let off = write_prefix(buf, 1 + dest.len(), MsgType::AttachTo);
    buf[off..off + dest.len()].copy_from_slice(dest);
    off + dest.len()
}

/// Exact frame size of a `Checkpoint` envelope carrying `payload_len` opaque
/// bytes. The opaque bytes trail the envelope: its size field counts only the
/// tag and the 8-byte length.
pub fn checkpoint_size(payload_len: usize) -> usize {
    frame_size(1 + 8) + payload_len
}

/// Writes a `Checkpoint` envelope followed by the opaque checkpoint payload.
pub fn write_checkpoint(buf: &mut [u8], payload: &[u8]) -> usize {
    let mut off = write_prefix(buf, 1 + 8, MsgType::Checkpoint);
    buf[off..off + 8].copy_from_slice(&(payload.len() as i64).to_le_bytes());
    off += 8;
    buf[off..off + payload.len()].copy_from_slice(payload);
    off + payload.len()
}

/// Exact frame size of an `InitialMessage` envelope wrapping an inbound-form
/// RPC with the given method and argument length.
pub fn initial_message_size(method_id: i32, args_len: usize) -> usize {
    frame_size(1 + incoming_rpc_size(method_id, args_len))
}

/// Writes an `InitialMessage` envelope. By convention the body is itself a
/// complete inbound-form RPC envelope naming the application's startup method.
pub fn write_initial_message(buf: &mut [u8], method_id: i32, args: &[u8]) -> usize {
    let envelope_size = 1 + incoming_rpc_size(method_id, args.len());
    let off = write_prefix(buf, envelope_size, MsgType::InitialMessage);
    off + write_incoming_rpc(&mut buf[off..], method_id, true, args)
}

/// Exact frame size of an `RPCBatch` envelope whose inner envelopes total
/// `inner_len` bytes.
pub fn rpc_batch_size(count: usize, inner_len: usize) -> usize {
    frame_size(1 + varint::size(count as i32) + inner_len)
}

/// Writes the prefix of an `RPCBatch` envelope; the caller appends `count`
/// complete RPC envelopes totalling `inner_len` bytes.
pub fn write_rpc_batch_hdr(buf: &mut [u8], count: usize, inner_len: usize) -> usize {
    let envelope_size = 1 + varint::size(count as i32) + inner_len;
    let mut off = write_prefix(buf, envelope_size, MsgType::RpcBatch);
    off += varint::write(&mut buf[off..], count as i32);
    off
}

/// The per-byte checksum the Coordinator carries in each log header: a 32-bit
/// signed sum of the payload bytes, each sign-extended.
pub fn payload_checksum(payload: &[u8]) -> i64 {
    i64::from(
        payload
            .iter()
            .fold(0i32, |sum, &b| sum.wrapping_add(i32::from(b as i8))),
    )
}

/// Renders bytes as space-separated hex for fatal-error diagnostics.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{b:02x}");
    }
    out
}
