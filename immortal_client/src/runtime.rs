// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The runtime facade: initialize / run / shutdown, the dispatch loop, the
//! network progress thread, and the outbound helpers the application calls.
//!
//! Exactly two threads touch runtime state. The application/dispatch thread
//! reads log records and makes upcalls, and those upcalls produce outbound
//! envelopes into the ring buffer. The progress thread consumes the ring and
//! owns the up stream. The ring is strictly single-producer/single-consumer;
//! no third thread may send.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::*;

use crate::handshake::startup_protocol;
use crate::ring;
use crate::stream::{connect_coordinator, recv_exact, send_all};
use crate::varint;
use crate::wire::{self, EnvelopeIter, LogHeader, MsgType};
use crate::Error;

/// Ring buffer size used when the caller passes a nonpositive request.
pub const DEFAULT_BUFFER_BYTES: usize = 20 * 1024 * 1024;

/// Times the progress thread re-polls an empty ring before yielding.
const HOT_SPIN_TRIES: u32 = 100;

/// The application half of the runtime: upcalls the dispatch loop makes and
/// the payloads the protocol needs from the application.
pub trait Immortal {
    /// Handles one inbound RPC. Runs synchronously on the dispatch thread;
    /// outbound calls made through `out` are ordered after everything sent
    /// before this upcall.
    fn dispatch(&mut self, out: &mut RuntimeHandle, method_id: i32, args: &[u8]);

    /// Produces an opaque checkpoint payload on demand, both for the startup
    /// handshake and whenever the Coordinator asks.
    fn checkpoint(&mut self) -> Vec<u8>;

    /// The startup call wrapped in the handshake's InitialMessage, as
    /// `(method_id, args)`.
    fn initial_message(&mut self) -> (i32, Vec<u8>);
}

/// One call in an outbound [`RuntimeHandle::send_rpc_batch`].
pub struct OutgoingCall<'a> {
    pub method_id: i32,
    pub fire_and_forget: bool,
    pub args: &'a [u8],
}

/// The outbound surface handed to application upcalls: RPC senders over the
/// ring buffer, the attach-once bookkeeping, and the shutdown flag.
pub struct RuntimeHandle {
    ring: ring::Producer,
    attached: HashSet<String>,
    shutdown: Arc<AtomicBool>,
}

impl RuntimeHandle {
    /// Requests cooperative shutdown: the dispatch loop finishes the record
    /// in hand and returns from [`Runtime::run`]. Does not unwind anything.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Announces `dest` to the Coordinator with an AttachTo envelope the
    /// first time it is used. The empty destination means self-send and
    /// needs no attach.
    pub fn attach_if_needed(&mut self, dest: &str) -> Result<(), Error> {
        if dest.is_empty() || self.attached.contains(dest) {
            return Ok(());
        }

        let frame = wire::attach_to_size(dest.as_bytes());
        let buf = self.ring.reserve(frame)?;
        let used = wire::write_attach_to(buf, dest.as_bytes());
        self.ring.release(used);

        self.attached.insert(dest.to_owned());
        debug!("attached to destination {dest:?}");
        Ok(())
    }

    /// Queues one outbound RPC.
    pub fn send_rpc(
        &mut self,
        dest: &str,
        method_id: i32,
        fire_and_forget: bool,
        args: &[u8],
    ) -> Result<(), Error> {
        self.attach_if_needed(dest)?;

        let frame = wire::outgoing_rpc_size(dest.as_bytes(), method_id, args.len());
        let buf = self.ring.reserve(frame)?;
        let used = wire::write_outgoing_rpc(
            buf,
            dest.as_bytes(),
            wire::RPC_OR_RETURN_CALL,
            method_id,
            fire_and_forget,
            args,
        );
        self.ring.release(used);
        Ok(())
    }

    /// Queues one outbound RPC, letting the caller write the `args_len`
    /// argument bytes straight into the reservation instead of staging them
    /// in a separate buffer first.
    pub fn send_rpc_with(
        &mut self,
        dest: &str,
        method_id: i32,
        fire_and_forget: bool,
        args_len: usize,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<(), Error> {
        self.attach_if_needed(dest)?;

        let frame = wire::outgoing_rpc_size(dest.as_bytes(), method_id, args_len);
        let buf = self.ring.reserve(frame)?;
        let hdr = wire::write_outgoing_rpc_hdr(
            buf,
            dest.as_bytes(),
            wire::RPC_OR_RETURN_CALL,
            method_id,
            fire_and_forget,
            args_len,
        );
        fill(&mut buf[hdr..hdr + args_len]);
        self.ring.release(hdr + args_len);
        Ok(())
    }

    /// Queues a whole RPCBatch as one envelope: one reservation, one release,
    /// so the batch can never interleave with anything else outbound.
    pub fn send_rpc_batch(&mut self, dest: &str, calls: &[OutgoingCall<'_>]) -> Result<(), Error> {
        if calls.is_empty() {
            return Ok(());
        }
        self.attach_if_needed(dest)?;

        let inner_len: usize = calls
            .iter()
            .map(|c| wire::outgoing_rpc_size(dest.as_bytes(), c.method_id, c.args.len()))
            .sum();
        let frame = wire::rpc_batch_size(calls.len(), inner_len);

        let buf = self.ring.reserve(frame)?;
        let mut off = wire::write_rpc_batch_hdr(buf, calls.len(), inner_len);
        for call in calls {
            off += wire::write_outgoing_rpc(
                &mut buf[off..],
                dest.as_bytes(),
                wire::RPC_OR_RETURN_CALL,
                call.method_id,
                call.fire_and_forget,
                call.args,
            );
        }
        self.ring.release(off);
        Ok(())
    }

    /// Queues a Checkpoint envelope. Goes through the ring like every other
    /// outbound message so it lands in the byte stream exactly between the
    /// sends that preceded and followed the TakeCheckpoint prompt.
    fn send_checkpoint(&mut self, payload: &[u8]) -> Result<(), Error> {
        let frame = wire::checkpoint_size(payload.len());
        let buf = self.ring.reserve(frame)?;
        let used = wire::write_checkpoint(buf, payload);
        self.ring.release(used);
        debug!("checkpoint queued ({} payload bytes)", payload.len());
        Ok(())
    }
}

/// A connected client runtime: one application, one Coordinator.
pub struct Runtime<A, R> {
    app: A,
    down: R,
    handle: RuntimeHandle,
    stop_progress: Arc<AtomicBool>,
    progress: Option<JoinHandle<()>>,
}

impl<A: Immortal> Runtime<A, TcpStream> {
    /// Establishes both Coordinator streams on loopback and initializes.
    pub fn connect(
        app: A,
        host: &str,
        up_port: u16,
        down_port: u16,
        buffer_bytes: i64,
    ) -> Result<Self, Error> {
        let (up, down) = connect_coordinator(host, up_port, down_port)?;
        Self::initialize(app, up, down, buffer_bytes)
    }
}

impl<A: Immortal, R: Read> Runtime<A, R> {
    /// Runs the startup handshake over the given streams, allocates the ring
    /// buffer (the default size for a nonpositive `buffer_bytes`; callers
    /// should leave room for their largest message plus some tens of bytes of
    /// envelope overhead), and spawns the progress thread, which takes
    /// ownership of the up stream.
    pub fn initialize<W>(mut app: A, mut up: W, mut down: R, buffer_bytes: i64) -> Result<Self, Error>
    where
        W: Write + Send + 'static,
    {
        let capacity = if buffer_bytes <= 0 {
            DEFAULT_BUFFER_BYTES
        } else {
            buffer_bytes as usize
        };

        let (method_id, args) = app.initial_message();
        let first_checkpoint = app.checkpoint();
        startup_protocol(&mut down, &mut up, (method_id, args.as_slice()), &first_checkpoint)?;

        let (producer, consumer) = ring::with_capacity(capacity);
        let stop_progress = Arc::new(AtomicBool::new(false));

        let stop = Arc::clone(&stop_progress);
        let progress = thread::Builder::new()
            .name("network-progress".to_string())
            .spawn(move || progress_loop(consumer, up, stop))?;

        info!("runtime ready ({capacity} byte ring)");

        Ok(Self {
            app,
            down,
            handle: RuntimeHandle {
                ring: producer,
                attached: HashSet::new(),
                shutdown: Arc::new(AtomicBool::new(false)),
            },
            stop_progress,
            progress: Some(progress),
        })
    }

    /// The normal processing loop: reads one log record per iteration and
    /// dispatches its messages, until the shutdown flag is set. On return the
    /// progress thread has drained the ring and exited.
    pub fn run(&mut self) -> Result<(), Error> {
        let result = self.dispatch_loop();

        self.stop_progress.store(true, Ordering::Release);
        if let Some(worker) = self.progress.take() {
            let _ = worker.join();
        }

        result
    }

    /// Requests cooperative shutdown; equivalent to the handle's.
    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    /// The outbound surface, for sends made outside an upcall.
    pub fn handle(&mut self) -> &mut RuntimeHandle {
        &mut self.handle
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }

    fn dispatch_loop(&mut self) -> Result<(), Error> {
        let mut records: u64 = 0;

        while !self.handle.shutdown.load(Ordering::Acquire) {
            let hdr = LogHeader::read_from(&mut self.down)?;
            let payload_size = hdr.payload_size()?;

            let mut payload = vec![0u8; payload_size];
            recv_exact(&mut self.down, &mut payload)?;

            records += 1;
            trace!(
                "record {records}: seq {}, commit {}, {payload_size} payload bytes",
                hdr.seq_id,
                hdr.commit_id
            );

            if let Err(e) = self.process_record(&payload) {
                let tail = &payload[payload.len().saturating_sub(100)..];
                error!(
                    "fatal in record seq {}: {e}; last {} payload bytes: {}",
                    hdr.seq_id,
                    tail.len(),
                    wire::hex_dump(tail)
                );
                return Err(e);
            }
        }

        debug!("shutdown requested; leaving the processing loop");
        Ok(())
    }

    /// Dispatches every envelope in one record payload, in order.
    fn process_record(&mut self, payload: &[u8]) -> Result<(), Error> {
        let mut envelopes = EnvelopeIter::new(payload);

        while let Some(envelope) = envelopes.next() {
            let envelope = envelope.map_err(|e| {
                error!("bad envelope at payload offset {}", envelopes.offset());
                e
            })?;

            match envelope.tag {
                MsgType::Rpc => {
                    let rpc = wire::parse_incoming_rpc(envelope.body)?;
                    self.app
                        .dispatch(&mut self.handle, rpc.method_id, rpc.args);
                }
                MsgType::RpcBatch => self.process_batch(envelope.body)?,
                MsgType::TakeCheckpoint => {
                    let snapshot = self.app.checkpoint();
                    self.handle.send_checkpoint(&snapshot)?;
                }
                MsgType::InitialMessage => {
                    // The Coordinator echoes our initial message back once it
                    // is durable; nothing to dispatch.
                    debug!("initial message acknowledged by the coordinator");
                }
                other => {
                    // Known tags we have no behavior for yet (the Upgrade
                    // family); skipping keeps us forward compatible.
                    warn!("ignoring message type {other:?}");
                }
            }
        }

        Ok(())
    }

    /// Dispatches the inner envelopes of an RPCBatch as if each arrived at
    /// the top level.
    fn process_batch(&mut self, body: &[u8]) -> Result<(), Error> {
        let (count, used) = varint::read(body)?;
        let count = u32::try_from(count).map_err(|_| Error::UnexpectedEof)?;
        trace!("batch of {count} messages");

        let mut envelopes = EnvelopeIter::new(&body[used..]);
        for _ in 0..count {
            let envelope = envelopes.next().ok_or(Error::UnexpectedEof)??;
            match envelope.tag {
                MsgType::Rpc => {
                    let rpc = wire::parse_incoming_rpc(envelope.body)?;
                    self.app
                        .dispatch(&mut self.handle, rpc.method_id, rpc.args);
                }
                other => warn!("ignoring non-RPC message type {other:?} inside a batch"),
            }
        }

        Ok(())
    }
}

/// The network progress thread: drains the ring to the up stream, one send
/// per peeked slice, so bursts of small RPCs coalesce into single syscalls.
/// Never decodes what it ships.
fn progress_loop<W: Write>(mut outbound: ring::Consumer, mut up: W, stop: Arc<AtomicBool>) {
    debug!("network progress thread running");

    let mut spin = HOT_SPIN_TRIES;
    loop {
        let shipped = match outbound.peek() {
            Some(chunk) => {
                trace!("shipping {} bytes", chunk.len());
                if let Err(e) = send_all(&mut up, chunk) {
                    // There is no thread to report to and no local recovery;
                    // the Coordinator replays from its log after a restart.
                    error!("send to the coordinator failed: {e}");
                    std::process::abort();
                }
                chunk.len()
            }
            None => 0,
        };

        if shipped > 0 {
            outbound.pop(shipped);
            spin = HOT_SPIN_TRIES;
        } else if stop.load(Ordering::Acquire) && outbound.peek().is_none() {
            break;
        } else if spin == 0 {
            spin = HOT_SPIN_TRIES;
            thread::yield_now();
        } else {
            spin -= 1;
        }
    }

    debug!("network progress thread drained and stopped");
}
