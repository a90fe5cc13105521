// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use immortal_client::wire::{
    self, EnvelopeIter, LogHeader, MsgType, LOG_HEADER_SIZE, MAX_RECORD_BYTES,
    RPC_OR_RETURN_CALL,
};
use immortal_client::Error;

#[test]
fn log_header_round_trips() {
    let hdr = LogHeader {
        commit_id: -7,
        total_size: 129,
        checksum: -12345,
        seq_id: 1 << 40,
    };

    let raw = hdr.encode();
    assert_eq!(raw.len(), LOG_HEADER_SIZE);
    assert_eq!(LogHeader::decode(&raw), hdr);
    assert_eq!(hdr.payload_size().unwrap(), 129 - LOG_HEADER_SIZE);

    // Little-endian layout, field by field.
    assert_eq!(&raw[0..4], &(-7i32).to_le_bytes());
    assert_eq!(&raw[4..8], &129i32.to_le_bytes());
    assert_eq!(&raw[8..16], &(-12345i64).to_le_bytes());
    assert_eq!(&raw[16..24], &(1i64 << 40).to_le_bytes());
}

#[test]
fn log_header_rejects_illegal_sizes() {
    let mut hdr = LogHeader {
        commit_id: 0,
        total_size: LOG_HEADER_SIZE as i32 - 1,
        checksum: 0,
        seq_id: 0,
    };
    assert!(matches!(
        hdr.payload_size(),
        Err(Error::OversizedRecord { total_size }) if total_size == LOG_HEADER_SIZE as i32 - 1
    ));

    hdr.total_size = -1;
    assert!(matches!(hdr.payload_size(), Err(Error::OversizedRecord { .. })));

    hdr.total_size = MAX_RECORD_BYTES + 1;
    assert!(matches!(hdr.payload_size(), Err(Error::OversizedRecord { .. })));

    hdr.total_size = LOG_HEADER_SIZE as i32;
    assert_eq!(hdr.payload_size().unwrap(), 0);
}

#[test]
fn short_header_read_fails() {
    let mut short: &[u8] = &[0u8; 10];
    assert!(matches!(
        LogHeader::read_from(&mut short),
        Err(Error::ShortRead)
    ));
}

#[test]
fn outgoing_rpc_layout() {
    let mut buf = vec![0u8; wire::outgoing_rpc_size(b"ab", 7, 1)];
    let used = wire::write_outgoing_rpc(&mut buf, b"ab", RPC_OR_RETURN_CALL, 7, true, &[0x09]);
    assert_eq!(used, buf.len());

    assert_eq!(
        buf,
        [
            0x10, // envelope size 8
            0x00, // tag: RPC
            0x04, // dest_len 2
            0x61, 0x62, // "ab"
            0x00, // rpc_or_return: call
            0x0e, // method id 7
            0x01, // fire and forget
            0x09, // args
        ]
    );
}

#[test]
fn checkpoint_layout() {
    let mut buf = vec![0u8; wire::checkpoint_size(9)];
    let used = wire::write_checkpoint(&mut buf, b"dummyckpt");
    assert_eq!(used, buf.len());

    // The envelope's size field counts only the tag and the 8-byte length;
    // the opaque payload trails it.
    assert_eq!(&buf[..2], &[0x12, 0x08]);
    assert_eq!(&buf[2..10], &9i64.to_le_bytes());
    assert_eq!(&buf[10..], b"dummyckpt");
}

#[test]
fn envelope_sequence_round_trips() {
    let mut bytes = Vec::new();

    let mut attach = vec![0u8; wire::attach_to_size(b"peer")];
    wire::write_attach_to(&mut attach, b"peer");
    bytes.extend_from_slice(&attach);

    let mut outgoing = vec![0u8; wire::outgoing_rpc_size(b"peer", 33, 3)];
    wire::write_outgoing_rpc(
        &mut outgoing,
        b"peer",
        RPC_OR_RETURN_CALL,
        33,
        false,
        &[1, 2, 3],
    );
    bytes.extend_from_slice(&outgoing);

    let mut incoming = vec![0u8; wire::incoming_rpc_size(-5, 0)];
    wire::write_incoming_rpc(&mut incoming, -5, true, &[]);
    bytes.extend_from_slice(&incoming);

    let envelopes: Vec<_> = EnvelopeIter::new(&bytes)
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(envelopes.len(), 3);

    assert_eq!(envelopes[0].tag, MsgType::AttachTo);
    assert_eq!(envelopes[0].body, b"peer");

    assert_eq!(envelopes[1].tag, MsgType::Rpc);
    assert_eq!(envelopes[2].tag, MsgType::Rpc);

    let rpc = wire::parse_incoming_rpc(envelopes[2].body).unwrap();
    assert_eq!(rpc.method_id, -5);
    assert!(rpc.fire_and_forget);
    assert_eq!(rpc.args, &[] as &[u8]);
}

#[test]
fn incoming_rpc_round_trips() {
    let mut buf = vec![0u8; wire::incoming_rpc_size(33, 3)];
    wire::write_incoming_rpc(&mut buf, 33, false, &[0, 1, 2]);

    let envelope = EnvelopeIter::new(&buf).next().unwrap().unwrap();
    assert_eq!(envelope.tag, MsgType::Rpc);

    let rpc = wire::parse_incoming_rpc(envelope.body).unwrap();
    assert_eq!(rpc.method_id, 33);
    assert!(!rpc.fire_and_forget);
    assert_eq!(rpc.args, &[0, 1, 2]);
}

#[test]
fn unknown_tag_is_fatal() {
    let payload = [0x02, 0x63];
    let mut iter = EnvelopeIter::new(&payload);
    assert!(matches!(iter.next(), Some(Err(Error::UnknownTag(0x63)))));
    // Fused after the error.
    assert!(iter.next().is_none());
}

#[test]
fn truncated_envelope_is_fatal() {
    // Claims three bytes of envelope but only one follows.
    let payload = [0x06, 0x00];
    let mut iter = EnvelopeIter::new(&payload);
    assert!(matches!(iter.next(), Some(Err(Error::UnexpectedEof))));
}

#[test]
fn payload_checksum_sign_extends() {
    assert_eq!(wire::payload_checksum(&[]), 0);
    assert_eq!(wire::payload_checksum(&[1, 2, 3]), 6);
    assert_eq!(wire::payload_checksum(&[0xff]), -1);
    assert_eq!(wire::payload_checksum(&[0x80, 0x7f]), -1);
}

#[test]
fn hex_dump_formats_bytes() {
    assert_eq!(wire::hex_dump(&[]), "");
    assert_eq!(wire::hex_dump(&[0x00, 0xab, 0x10]), "00 ab 10");
}
