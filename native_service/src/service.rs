// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The benchmark service itself: a sender/receiver pair measuring either
//! bulk throughput (rounds of fixed-size messages, sizes halving each round)
//! or ping-pong latency (single-byte messages bounced back and forth).

use std::time::Instant;

use log::*;

use immortal_client::{Error, Immortal, RuntimeHandle};

pub const STARTUP_ID: i32 = 32;
pub const TPUT_MSG_ID: i32 = 33;
pub const ACK_MSG_ID: i32 = 34;

/// Largest (and first) per-message size of a throughput trial.
pub const MAX_MESSAGE_BYTES: i64 = 2 * 1024 * 1024;

/// Smallest per-message size; the round after this one ends the trial.
pub const MIN_MESSAGE_BYTES: i64 = 16;

const ONE_GIBIBYTE: i64 = 1024 * 1024 * 1024;

/// Latencies printed from the tail of a ping-pong run.
const LATENCY_REPORT_COUNT: usize = 10_000;

pub struct NativeService {
    is_sender: bool,
    pingpong: bool,
    dest: String,
    bytes_per_round: i64,

    /// Per-message size of the current round.
    msg_bytes: i64,

    /// Messages the receiver still expects this round.
    expected: i64,

    /// The first round of each trial sends its volume twice: once to fill
    /// the pipe, once measured.
    prefill: bool,

    trials_remaining: u32,
    waiting_final_ack: bool,
    round_start: Option<Instant>,

    pingpong_target: usize,
    pingpong_count: usize,
    latencies: Vec<f64>,
}

impl NativeService {
    pub fn new(
        is_sender: bool,
        pingpong: bool,
        dest: String,
        bytes_per_round: i64,
        trials: u32,
        pingpong_target: usize,
    ) -> Self {
        Self {
            is_sender,
            pingpong,
            dest,
            bytes_per_round,
            msg_bytes: if pingpong { 1 } else { MAX_MESSAGE_BYTES },
            expected: 0,
            prefill: !pingpong,
            trials_remaining: trials,
            waiting_final_ack: false,
            round_start: None,
            pingpong_target,
            pingpong_count: 0,
            latencies: Vec::with_capacity(if pingpong { pingpong_target } else { 0 }),
        }
    }

    fn reset_trial(&mut self) {
        self.msg_bytes = if self.pingpong { 1 } else { MAX_MESSAGE_BYTES };
        self.prefill = !self.pingpong;
        self.waiting_final_ack = false;
        self.round_start = None;
        self.pingpong_count = 0;
        self.latencies.clear();
    }

    fn round_messages(&self) -> i64 {
        self.bytes_per_round / self.msg_bytes
    }

    /// Kicks off a round. The first round of a run is driven by the startup
    /// message the Coordinator delivers back to us; later rounds by the
    /// startup messages we bounce to ourselves.
    fn start_round(&mut self, out: &mut RuntimeHandle) {
        if self.is_sender {
            self.send_round(out);
        } else {
            self.expected = self.round_messages() * if self.prefill { 2 } else { 1 };
            if self.pingpong {
                self.expected = 1;
            }
            println!(
                "Receiver starting round: message size {}, expecting {} messages.",
                self.msg_bytes, self.expected
            );
        }
    }

    fn send_round(&mut self, out: &mut RuntimeHandle) {
        if self.pingpong {
            self.round_start = Some(Instant::now());
            must(out.send_rpc(&self.dest, TPUT_MSG_ID, true, &[0]));
            return;
        }

        let iterations = self.round_messages();
        let reps = if self.prefill {
            2 * iterations
        } else {
            iterations
        };
        let msg_bytes = self.msg_bytes as usize;

        must(out.attach_if_needed(&self.dest));
        for rep in 0..reps {
            // The measured window starts after any prefill volume is queued.
            if rep == reps - iterations {
                self.round_start = Some(Instant::now());
            }
            must(out.send_rpc_with(&self.dest, TPUT_MSG_ID, true, msg_bytes, |args| {
                for (i, byte) in args.iter_mut().enumerate() {
                    *byte = i as u8;
                }
            }));
        }

        let duration = self.round_start.expect("round was started").elapsed();
        let secs = duration.as_secs_f64();
        let throughput = (iterations * self.msg_bytes) as f64 / ONE_GIBIBYTE as f64 / secs;
        println!(
            " *X*  {}\t {:.6}\t {:.6}\t {}",
            self.msg_bytes, throughput, secs, iterations
        );

        self.end_round(out);
    }

    /// Moves to the next round's message size, or reports that the trial's
    /// round schedule is exhausted. Only throughput mode has rounds.
    fn advance_round(&mut self) -> bool {
        self.prefill = false;
        if self.msg_bytes > MIN_MESSAGE_BYTES {
            self.msg_bytes /= 2;
            return true;
        }
        false
    }

    fn end_round(&mut self, out: &mut RuntimeHandle) {
        if self.advance_round() {
            // Bounce a startup message to ourselves; the next round begins
            // when the Coordinator logs and redelivers it.
            must(out.send_rpc("", STARTUP_ID, true, &[]));
        } else {
            debug!("last round queued; waiting for the receiver's final ack");
            self.waiting_final_ack = true;
        }
    }

    fn receive_message(&mut self, out: &mut RuntimeHandle, len: usize) {
        if self.pingpong {
            must(out.send_rpc(&self.dest, ACK_MSG_ID, true, &[]));
            self.pingpong_count += 1;
            if self.pingpong_count >= self.pingpong_target {
                self.trial_finished(out);
            }
            return;
        }

        self.expected -= 1;
        trace!("got {len} byte message, {} more expected this round", self.expected);
        if self.expected > 0 {
            return;
        }

        if self.advance_round() {
            self.expected = self.round_messages();
            println!(
                "Receiver starting round: message size {}, expecting {} messages.",
                self.msg_bytes, self.expected
            );
        } else {
            println!("Receiver finished the last round; acknowledging.");
            must(out.send_rpc(&self.dest, ACK_MSG_ID, true, &[]));
            self.trial_finished(out);
        }
    }

    fn receive_ack(&mut self, out: &mut RuntimeHandle) {
        if self.pingpong {
            let elapsed = self
                .round_start
                .expect("ack without an outstanding ping")
                .elapsed()
                .as_secs_f64();
            self.latencies.push(elapsed);
            self.pingpong_count += 1;

            if self.pingpong_count < self.pingpong_target {
                self.send_round(out);
            } else {
                self.report_latencies();
                self.trial_finished(out);
            }
            return;
        }

        if self.waiting_final_ack {
            println!("Sender received the final ack.");
            self.trial_finished(out);
        } else {
            error!("unexpected ack mid-round");
            out.shutdown();
        }
    }

    fn trial_finished(&mut self, out: &mut RuntimeHandle) {
        self.trials_remaining -= 1;
        if self.trials_remaining == 0 {
            println!(" *** Last trial finished; shutting down.");
            out.shutdown();
            return;
        }

        println!(" *** Trial finished; {} remaining.", self.trials_remaining);
        self.reset_trial();
        if self.is_sender {
            // The first trial was driven by the Coordinator's startup
            // message; subsequent ones we drive ourselves.
            must(out.send_rpc("", STARTUP_ID, true, &[]));
        } else {
            // The receiver gets no startup message for later trials, so
            // re-arm its expectations directly.
            self.start_round(out);
        }
    }

    fn report_latencies(&self) {
        let start = self.latencies.len().saturating_sub(LATENCY_REPORT_COUNT);
        println!("Microsecond latencies of the last {} ping-pongs:", self.latencies.len() - start);
        for latency in &self.latencies[start..] {
            print!("{} ", (latency * 1_000_000.0) as i64);
        }
        println!();
    }
}

impl Immortal for NativeService {
    fn dispatch(&mut self, out: &mut RuntimeHandle, method_id: i32, args: &[u8]) {
        match method_id {
            STARTUP_ID => self.start_round(out),
            TPUT_MSG_ID => self.receive_message(out, args.len()),
            ACK_MSG_ID => self.receive_ack(out),
            other => {
                error!("cannot dispatch unknown method id {other}");
                out.shutdown();
            }
        }
    }

    fn checkpoint(&mut self) -> Vec<u8> {
        // Nothing durable to save yet; the Coordinator just needs a payload
        // it can hold for us.
        b"dummyckpt".to_vec()
    }

    fn initial_message(&mut self) -> (i32, Vec<u8>) {
        (STARTUP_ID, vec![5, 4, 3])
    }
}

/// Outbound failures inside an upcall have nowhere to propagate; treat them
/// like the fatal errors they are.
fn must(result: Result<(), Error>) {
    if let Err(e) = result {
        error!("fatal while sending: {e}");
        std::process::exit(1);
    }
}
