// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Startup protocol with the Coordinator.
//!
//! Runs exactly once, after both streams are up and before the progress
//! thread exists, so it may write the up stream directly. The Coordinator
//! opens with one log record telling us whether this is a first start
//! (TakeBecomingPrimaryCheckpoint) or a recovery from a logged checkpoint;
//! we answer with the application's initial message and a first checkpoint.

use std::io::{Read, Write};

use log::*;

use crate::stream::{recv_exact, send_all};
use crate::wire::{self, EnvelopeIter, LogHeader, MsgType};
use crate::Error;

/// Exchanges the startup records. `initial` is the application's startup call
/// as `(method_id, args)`; `checkpoint` is its first checkpoint payload.
///
/// Any failure here is fatal: the runtime cannot enter normal processing
/// without knowing which startup branch the Coordinator chose.
pub fn startup_protocol<R: Read, W: Write>(
    down: &mut R,
    up: &mut W,
    initial: (i32, &[u8]),
    checkpoint: &[u8],
) -> Result<(), Error> {
    let hdr = LogHeader::read_from(down)?;
    let payload_size = hdr.payload_size()?;

    let mut payload = vec![0u8; payload_size];
    recv_exact(down, &mut payload)?;

    debug!(
        "startup record: seq {}, commit {}, {} payload bytes",
        hdr.seq_id, hdr.commit_id, payload_size
    );
    // The Coordinator's intent for this field is unclear, so compare by eye
    // rather than rejecting (see the design notes).
    debug!(
        "startup checksum: header {}, computed {}",
        hdr.checksum,
        wire::payload_checksum(&payload)
    );

    let first = EnvelopeIter::new(&payload)
        .next()
        .ok_or(Error::UnexpectedEof)??;

    match first.tag {
        MsgType::TakeBecomingPrimaryCheckpoint => {
            debug!("becoming primary; first-time startup");
        }
        MsgType::Checkpoint => {
            // Recovery would reapply this checkpoint to rebuild application
            // state before resuming the log.
            return Err(Error::NotImplemented("checkpoint recovery"));
        }
        other => return Err(Error::Protocol(other.tag())),
    }

    let (method_id, args) = initial;
    let mut buf = vec![0u8; wire::initial_message_size(method_id, args.len())];
    let used = wire::write_initial_message(&mut buf, method_id, args);
    debug_assert_eq!(used, buf.len());
    send_all(up, &buf)?;
    debug!("initial message sent (method {method_id}, {} arg bytes)", args.len());

    let mut buf = vec![0u8; wire::checkpoint_size(checkpoint.len())];
    let used = wire::write_checkpoint(&mut buf, checkpoint);
    debug_assert_eq!(used, buf.len());
    send_all(up, &buf)?;
    debug!("first checkpoint sent ({} bytes)", checkpoint.len());

    Ok(())
}
