// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Single-producer, single-consumer ring buffer for variable-sized byte
//! records.
//!
//! The producer reserves a contiguous region, writes a complete message into
//! it, and releases it; the consumer peeks the largest readable slice and pops
//! what it has shipped. Because records are variable-sized, the ring cannot
//! use the usual power-of-two index masking. Instead it keeps an explicit
//! logical end and is always in exactly one of two states:
//!
//! - *natural*: `head <= tail <= end`; readable is `[head, tail)`, writable is
//!   `[tail, end)`.
//! - *torn*: `tail < head <= end`; readable is `[head, end)`, writable is
//!   `[tail, head)`.
//!
//! A producer that would overshoot `end` wraps early: it shrinks `end` down to
//! `tail` and rewinds `tail` to zero (natural → torn). The shrunk `end` tells
//! the consumer where the readable bytes stop. When the consumer catches up to
//! the shrunk `end` it restores `end` to the full capacity and rewinds `head`
//! (torn → natural). `end` is written only in those two transitions, and only
//! by the side the state entitles to it.
//!
//! `head == tail` always means empty. The early wrap therefore stalls while
//! `head` sits at zero: wrapping then would make a full buffer look empty.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use log::*;

use crate::Error;

struct Ring {
    storage: Box<[UnsafeCell<u8>]>,

    /// Full capacity; the value `end` is restored to.
    capacity: usize,

    /// Consumer-owned advance point.
    head: AtomicUsize,

    /// Producer-owned advance point.
    tail: AtomicUsize,

    /// Current logical capacity. Shrunk by the producer on early wrap,
    /// restored by the consumer when it drains past the shrink point.
    end: AtomicUsize,
}

// SAFETY: the head/tail/end protocol above partitions the storage so that the
// producer only writes `[tail, ..)` regions the consumer cannot read yet, and
// the consumer only reads `[head, ..)` regions the producer has released with
// a release-store. The two handles are the only way in, and each is owned by
// one thread.
unsafe impl Sync for Ring {}

impl Ring {
    /// SAFETY: the caller must hold the producer side and `off + len` must lie
    /// within the writable region for the current state.
    #[allow(clippy::mut_from_ref)]
    unsafe fn write_region(&self, off: usize, len: usize) -> &mut [u8] {
        let start = UnsafeCell::raw_get(self.storage.as_ptr().add(off));
        std::slice::from_raw_parts_mut(start, len)
    }

    /// SAFETY: the caller must hold the consumer side and `off + len` must lie
    /// within the readable region for the current state.
    unsafe fn read_region(&self, off: usize, len: usize) -> &[u8] {
        let start = UnsafeCell::raw_get(self.storage.as_ptr().add(off));
        std::slice::from_raw_parts(start as *const u8, len)
    }
}

/// Allocates a ring of `capacity` bytes and splits it into its two handles.
pub fn with_capacity(capacity: usize) -> (Producer, Consumer) {
    assert!(capacity > 0, "ring buffer needs a nonzero capacity");

    let storage = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
    let ring = Arc::new(Ring {
        storage,
        capacity,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
        end: AtomicUsize::new(capacity),
    });

    (
        Producer {
            ring: Arc::clone(&ring),
            last_reserved: 0,
        },
        Consumer { ring },
    )
}

/// The writing half. Owned by exactly one thread at a time.
pub struct Producer {
    ring: Arc<Ring>,
    last_reserved: usize,
}

impl Producer {
    /// Waits until `len` contiguous bytes are writable and returns the region.
    ///
    /// Blocks by yielding while the consumer catches up. Fails immediately
    /// with [`Error::TooLarge`] if the request can never fit.
    pub fn reserve(&mut self, len: usize) -> Result<&mut [u8], Error> {
        if len > self.ring.capacity {
            return Err(Error::TooLarge {
                requested: len,
                capacity: self.ring.capacity,
            });
        }

        loop {
            let tail = self.ring.tail.load(Ordering::Acquire);
            let head = self.ring.head.load(Ordering::Acquire);
            let end = self.ring.end.load(Ordering::Acquire);

            if tail < head {
                // Torn state: the writable gap is [tail, head). Stop strictly
                // short of head so head == tail keeps meaning empty.
                if len < head - tail {
                    self.last_reserved = len;
                    // SAFETY: [tail, tail+len) is inside the torn-state gap
                    // and the consumer will not read it until release().
                    return Ok(unsafe { self.ring.write_region(tail, len) });
                }
            } else {
                // Natural state: the writable region is [tail, end), and
                // filling it to the brim is fine because tail never passes
                // end.
                if len <= end - tail {
                    self.last_reserved = len;
                    // SAFETY: [tail, tail+len) is unread space past the
                    // released bytes.
                    return Ok(unsafe { self.ring.write_region(tail, len) });
                }

                if head != 0 {
                    trace!("ring: early wrap, end {end} -> {tail}");
                    // Natural state entitles the producer to move end. The
                    // shrink must be visible before the rewound tail, which
                    // the release/acquire pair on tail provides.
                    self.ring.end.store(tail, Ordering::Release);
                    self.ring.tail.store(0, Ordering::Release);
                    continue;
                }
                // head is parked at the start: wrapping now would alias a
                // full buffer with an empty one. Wait for it to move.
            }

            thread::yield_now();
        }
    }

    /// Publishes the first `len` bytes of the last reservation. Call once per
    /// complete message; the consumer may ship anything released here in a
    /// single send.
    pub fn release(&mut self, len: usize) {
        assert!(
            len <= self.last_reserved,
            "released {len} bytes but only {} were reserved",
            self.last_reserved
        );
        self.last_reserved = 0;

        let tail = self.ring.tail.load(Ordering::Acquire);
        self.ring.tail.store(tail + len, Ordering::Release);
    }
}

/// The reading half. Owned by exactly one thread at a time.
pub struct Consumer {
    ring: Arc<Ring>,
}

impl Consumer {
    /// Returns the largest currently-readable contiguous slice, or `None` if
    /// the ring is empty. Idempotent; only [`pop`](Self::pop) frees bytes.
    pub fn peek(&self) -> Option<&[u8]> {
        loop {
            let head = self.ring.head.load(Ordering::Acquire);
            let tail = self.ring.tail.load(Ordering::Acquire);
            let end = self.ring.end.load(Ordering::Acquire);

            if head == tail {
                return None;
            }

            // Nonempty with head at the shrunk end: the torn tail segment is
            // exhausted, so restore the full capacity and rewind. Torn state
            // entitles the consumer to move end.
            if head == end {
                trace!("ring: restoring end {} -> {}", end, self.ring.capacity);
                self.ring.end.store(self.ring.capacity, Ordering::Release);
                self.ring.head.store(0, Ordering::Release);
                continue;
            }

            let len = if head < tail { tail - head } else { end - head };
            // SAFETY: [head, head+len) was released by the producer (tail and
            // end were acquire-loaded) and cannot be rewritten before pop().
            return Some(unsafe { self.ring.read_region(head, len) });
        }
    }

    /// Frees `len` bytes, which must be at most the last peeked length.
    pub fn pop(&mut self, len: usize) {
        assert!(len > 0, "pop of zero bytes");

        let mut head = self.ring.head.load(Ordering::Acquire);
        let tail = self.ring.tail.load(Ordering::Acquire);
        let mut end = self.ring.end.load(Ordering::Acquire);

        // Same fixup as peek(), in case a caller pops through the shrink
        // point without peeking again.
        if head == end && tail < head {
            self.ring.end.store(self.ring.capacity, Ordering::Release);
            self.ring.head.store(0, Ordering::Release);
            head = 0;
            end = self.ring.capacity;
        }

        debug_assert!(
            len <= if tail >= head { tail - head } else { end - head },
            "pop of {len} bytes exceeds the readable region (head {head}, tail {tail}, end {end})"
        );

        if head + len < end {
            self.ring.head.store(head + len, Ordering::Release);
        } else if head + len == end {
            if tail < head {
                // Torn: the tail segment is consumed; restore capacity and
                // flip back to natural state.
                trace!("ring: head wrapped, restoring end to {}", self.ring.capacity);
                self.ring.end.store(self.ring.capacity, Ordering::Release);
                self.ring.head.store(0, Ordering::Release);
            } else {
                // Natural with the producer parked at the brim (tail == end):
                // a plain advance, leaving head == tail == end, i.e. empty.
                self.ring.head.store(head + len, Ordering::Release);
            }
        } else {
            panic!(
                "pop of {len} bytes past the end (head {head}, tail {tail}, end {end})"
            );
        }
    }
}
