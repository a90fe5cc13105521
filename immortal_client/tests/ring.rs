// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::thread;

use immortal_client::ring;
use immortal_client::Error;

#[test]
fn single_threaded_fifo() {
    let (mut producer, mut consumer) = ring::with_capacity(64);

    let region = producer.reserve(4).unwrap();
    region.copy_from_slice(b"abcd");
    producer.release(4);

    let region = producer.reserve(2).unwrap();
    region.copy_from_slice(b"ef");
    producer.release(2);

    let readable = consumer.peek().unwrap();
    assert_eq!(readable, b"abcdef");
    consumer.pop(6);

    assert!(consumer.peek().is_none());
}

#[test]
fn release_may_publish_less_than_reserved() {
    let (mut producer, mut consumer) = ring::with_capacity(16);

    let region = producer.reserve(10).unwrap();
    region[..4].copy_from_slice(b"wxyz");
    producer.release(4);

    assert_eq!(consumer.peek().unwrap(), b"wxyz");
    consumer.pop(4);
    assert!(consumer.peek().is_none());
}

/// The byte at stream position `i` of the concatenated released records.
fn expected_byte(record: usize, offset: usize) -> u8 {
    (record * 7 + offset) as u8
}

#[test]
fn consumer_sees_release_order() {
    const RECORDS: usize = 5_000;

    let (mut producer, mut consumer) = ring::with_capacity(256);

    let mut expected = Vec::new();
    for record in 0..RECORDS {
        let len = record % 13 + 1;
        for offset in 0..len {
            expected.push(expected_byte(record, offset));
        }
    }

    let writer = thread::spawn(move || {
        for record in 0..RECORDS {
            let len = record % 13 + 1;
            let region = producer.reserve(len).unwrap();
            for (offset, byte) in region.iter_mut().enumerate() {
                *byte = expected_byte(record, offset);
            }
            producer.release(len);
        }
        producer
    });

    let mut observed = Vec::with_capacity(expected.len());
    while observed.len() < expected.len() {
        match consumer.peek() {
            Some(chunk) => {
                let len = chunk.len();
                observed.extend_from_slice(chunk);
                consumer.pop(len);
            }
            None => thread::yield_now(),
        }
    }

    writer.join().unwrap();
    assert_eq!(observed, expected);
}

#[test]
fn early_wrap_survives_oversized_alternation() {
    // Every record is bigger than half the ring, so every iteration after
    // the first has to wrap early.
    const CAPACITY: usize = 64;
    const RECORD: usize = 40;
    const ITERATIONS: usize = 1_000;

    let (mut producer, mut consumer) = ring::with_capacity(CAPACITY);

    let writer = thread::spawn(move || {
        for record in 0..ITERATIONS {
            let region = producer.reserve(RECORD).unwrap();
            region.fill(record as u8);
            producer.release(RECORD);
        }
        producer
    });

    let mut position = 0usize;
    while position < RECORD * ITERATIONS {
        match consumer.peek() {
            Some(chunk) => {
                for (i, byte) in chunk.iter().enumerate() {
                    let record = (position + i) / RECORD;
                    assert_eq!(*byte, record as u8, "corrupt byte at stream position {}", position + i);
                }
                let len = chunk.len();
                position += len;
                consumer.pop(len);
            }
            None => thread::yield_now(),
        }
    }

    writer.join().unwrap();
}

#[test]
fn full_capacity_reservation_succeeds_once_drained() {
    const CAPACITY: usize = 32;

    let (mut producer, mut consumer) = ring::with_capacity(CAPACITY);

    let region = producer.reserve(16).unwrap();
    region.fill(3);
    producer.release(16);

    let reader = thread::spawn(move || {
        let mut observed = Vec::new();
        while observed.len() < 16 + CAPACITY {
            match consumer.peek() {
                Some(chunk) => {
                    let len = chunk.len();
                    observed.extend_from_slice(chunk);
                    consumer.pop(len);
                }
                None => thread::yield_now(),
            }
        }
        observed
    });

    // Blocks until the reader drains and the ring rewinds, then gets the
    // whole buffer in one contiguous region.
    let region = producer.reserve(CAPACITY).unwrap();
    region.fill(7);
    producer.release(CAPACITY);

    let observed = reader.join().unwrap();
    assert_eq!(&observed[..16], &[3u8; 16]);
    assert_eq!(&observed[16..], &[7u8; CAPACITY]);
}

#[test]
fn oversized_reservation_fails() {
    let (mut producer, _consumer) = ring::with_capacity(32);

    assert!(matches!(
        producer.reserve(33),
        Err(Error::TooLarge {
            requested: 33,
            capacity: 32,
        })
    ));
}
