// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A native benchmark service that talks to its Coordinator sidecar: a
//! sender/receiver pair measuring message throughput or ping-pong latency
//! through the durable message log.

mod service;

use clap::Parser;
use log::*;

use immortal_client::{Runtime, DEFAULT_BUFFER_BYTES};
use service::{NativeService, MAX_MESSAGE_BYTES};

#[derive(Parser)]
#[command(about = "Benchmark service speaking the coordinator protocol")]
struct Cli {
    /// 0/1: sender/receiver in throughput mode, 2/3: sender/receiver in
    /// ping-pong mode
    role: u8,

    /// Name of the peer service to send to
    dest: String,

    /// Port the coordinator accepts our outbound stream on
    up_port: u16,

    /// Port we accept the coordinator's inbound stream on
    down_port: u16,

    /// Log base 2 of bytes per round (ping-pong mode: of the number of
    /// ping-pongs)
    round_bytes_log2: Option<u32>,

    /// Repeat the whole experiment this many times
    trials: Option<u32>,

    /// Log base 2 of the outbound ring buffer size in bytes
    buffer_bytes_log2: Option<u32>,

    /// Use the IPv6 loopback instead of IPv4
    #[arg(long)]
    ipv6: bool,
}

fn main() {
    env_logger::init();
    let args = Cli::parse();

    let (is_sender, pingpong) = match args.role {
        0 => (true, false),
        1 => (false, false),
        2 => (true, true),
        3 => (false, true),
        other => {
            eprintln!("role must be 0-3, not {other} (0/1 throughput, 2/3 ping-pong)");
            std::process::exit(2);
        }
    };

    let bytes_per_round = 1i64 << args.round_bytes_log2.unwrap_or(30);
    if !pingpong && bytes_per_round <= MAX_MESSAGE_BYTES {
        eprintln!("bytes per round must exceed the max message size ({MAX_MESSAGE_BYTES})");
        std::process::exit(2);
    }

    let pingpong_target = args
        .round_bytes_log2
        .map(|v| 1usize << v)
        .unwrap_or(20_000);

    let trials = args.trials.unwrap_or(1).max(1);

    let buffer_bytes = match args.buffer_bytes_log2 {
        Some(b) => 1i64 << b,
        None => (DEFAULT_BUFFER_BYTES as i64).max(MAX_MESSAGE_BYTES + 64),
    };

    println!("Begin native benchmark, interacting with the coordinator...");
    println!(
        "We are running the {}",
        if is_sender { "SENDER" } else { "RECEIVER" }
    );
    println!(
        "Connecting to the coordinator on ports {} (up) and {} (down).",
        args.up_port, args.down_port
    );
    println!(" *** BUFFER SIZE: {buffer_bytes}");
    println!(" *** BYTES PER ROUND: {bytes_per_round}");
    println!(" *** PINGPONG mode: {pingpong}");
    println!(" *** Beginning experiment, first trial of {trials}.");
    if is_sender && !pingpong {
        println!("Bytes per RPC,  Throughput (GiB/sec),  Round-Time,  Round-Msgs");
    }

    let service = NativeService::new(
        is_sender,
        pingpong,
        args.dest,
        bytes_per_round,
        trials,
        pingpong_target,
    );

    let host = if args.ipv6 { "::1" } else { "127.0.0.1" };
    let mut runtime =
        match Runtime::connect(service, host, args.up_port, args.down_port, buffer_bytes) {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("could not initialize against the coordinator: {e}");
                std::process::exit(1);
            }
        };

    if let Err(e) = runtime.run() {
        error!("runtime failed: {e}");
        std::process::exit(1);
    }

    println!("Done.");
}
