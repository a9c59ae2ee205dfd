//
// Copyright (c) The Vigil Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::LazyLock as Lazy;

use bytes::Bytes;
use vigil_bfd::auth::{self, AuthError};
use vigil_bfd::config::AuthCfg;
use vigil_bfd::packet::{
    AuthTlv, AuthenticationType, DecodeError, Packet, PacketFlags, State,
};

//
// Helper functions.
//

fn test_encode_packet(
    bytes_expected: &[u8],
    key: Option<&[u8]>,
    packet: &Result<Packet, DecodeError>,
) {
    let bytes_actual = packet.as_ref().unwrap().encode(key);
    assert_eq!(bytes_expected, bytes_actual.as_ref());
}

fn test_decode_packet(
    bytes: &[u8],
    packet_expected: &Result<Packet, DecodeError>,
) {
    let packet_actual = Packet::decode(bytes);
    assert_eq!(*packet_expected, packet_actual);
}

//
// Test packets.
//

static PACKET1: Lazy<(Vec<u8>, Result<Packet, DecodeError>)> =
    Lazy::new(|| {
        (
            vec![
                0x20, 0xc0, 0x03, 0x18, 0x9f, 0xb2, 0x05, 0xd6, 0x4a, 0x23,
                0x57, 0xdc, 0x00, 0x04, 0x93, 0xe0, 0x00, 0x04, 0x93, 0xe0,
                0x00, 0x00, 0xc3, 0x50,
            ],
            Ok(Packet {
                version: 1,
                diag: 0,
                state: State::Up,
                flags: PacketFlags::empty(),
                detect_mult: 3,
                my_discr: 0x9fb205d6,
                your_discr: 0x4a2357dc,
                desired_min_tx: 300000,
                req_min_rx: 300000,
                req_min_echo_rx: 50000,
                auth: None,
            }),
        )
    });

// Down packet announcing a session, with the P bit and a diagnostic.
static PACKET2: Lazy<(Vec<u8>, Result<Packet, DecodeError>)> =
    Lazy::new(|| {
        (
            vec![
                0x21, 0x68, 0x05, 0x18, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00,
                0x00, 0x00, 0x00, 0x0f, 0x42, 0x40, 0x00, 0x0f, 0x42, 0x40,
                0x00, 0x00, 0x00, 0x00,
            ],
            Ok(Packet {
                version: 1,
                diag: 1,
                state: State::Down,
                flags: PacketFlags::P | PacketFlags::C,
                detect_mult: 5,
                my_discr: 1,
                your_discr: 0,
                desired_min_tx: 1000000,
                req_min_rx: 1000000,
                req_min_echo_rx: 0,
                auth: None,
            }),
        )
    });

// Simple Password authentication, password "secret", key ID 5.
static PACKET3: Lazy<(Vec<u8>, Result<Packet, DecodeError>)> =
    Lazy::new(|| {
        (
            vec![
                0x20, 0x44, 0x03, 0x21, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00,
                0x00, 0x00, 0x00, 0x0f, 0x42, 0x40, 0x00, 0x0f, 0x42, 0x40,
                0x00, 0x00, 0x00, 0x00, 0x01, 0x09, 0x05, 0x73, 0x65, 0x63,
                0x72, 0x65, 0x74,
            ],
            Ok(Packet {
                version: 1,
                diag: 0,
                state: State::Down,
                flags: PacketFlags::A,
                detect_mult: 3,
                my_discr: 1,
                your_discr: 0,
                desired_min_tx: 1000000,
                req_min_rx: 1000000,
                req_min_echo_rx: 0,
                auth: Some(AuthTlv::new(
                    AuthenticationType::SimplePassword,
                    5,
                    None,
                    Bytes::from_static(b"secret"),
                )),
            }),
        )
    });

//
// Tests.
//

#[test]
fn test_encode_packet1() {
    let (ref bytes, ref packet) = *PACKET1;
    test_encode_packet(bytes, None, packet);
}

#[test]
fn test_decode_packet1() {
    let (ref bytes, ref packet) = *PACKET1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_packet2() {
    let (ref bytes, ref packet) = *PACKET2;
    test_encode_packet(bytes, None, packet);
}

#[test]
fn test_decode_packet2() {
    let (ref bytes, ref packet) = *PACKET2;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_packet3() {
    let (ref bytes, ref packet) = *PACKET3;
    test_encode_packet(bytes, Some(b"secret"), packet);
}

#[test]
fn test_decode_packet3() {
    let (ref bytes, ref packet) = *PACKET3;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_decode_truncated() {
    let (ref bytes, _) = *PACKET1;
    test_decode_packet(&bytes[..23], &Err(DecodeError::IncompletePacket));
}

#[test]
fn test_decode_bad_version() {
    let (ref bytes, _) = *PACKET1;
    let mut bytes = bytes.clone();
    bytes[0] = 0x40;
    test_decode_packet(&bytes, &Err(DecodeError::InvalidVersion(2)));
}

#[test]
fn test_decode_bad_length() {
    let (ref bytes, _) = *PACKET1;
    let mut bytes = bytes.clone();
    bytes[3] = 23;
    test_decode_packet(&bytes, &Err(DecodeError::InvalidPacketLength(23)));

    // Length larger than the datagram.
    bytes[3] = 32;
    test_decode_packet(&bytes, &Err(DecodeError::InvalidPacketLength(32)));
}

#[test]
fn test_decode_bad_detect_mult() {
    let (ref bytes, _) = *PACKET1;
    let mut bytes = bytes.clone();
    bytes[2] = 0;
    test_decode_packet(&bytes, &Err(DecodeError::InvalidDetectMult(0)));
}

#[test]
fn test_decode_multicast_flag() {
    let (ref bytes, _) = *PACKET1;
    let mut bytes = bytes.clone();
    bytes[1] |= 0x01;
    let flags = PacketFlags::M;
    test_decode_packet(&bytes, &Err(DecodeError::InvalidFlags(flags)));
}

#[test]
fn test_decode_bad_my_discr() {
    let (ref bytes, _) = *PACKET2;
    let mut bytes = bytes.clone();
    bytes[4..8].copy_from_slice(&[0; 4]);
    test_decode_packet(&bytes, &Err(DecodeError::InvalidMyDiscriminator(0)));
}

#[test]
fn test_decode_bad_your_discr() {
    // Your Discriminator of zero is only acceptable in Down and AdminDown.
    let (ref bytes, _) = *PACKET1;
    let mut bytes = bytes.clone();
    bytes[8..12].copy_from_slice(&[0; 4]);
    test_decode_packet(
        &bytes,
        &Err(DecodeError::InvalidYourDiscriminator(0)),
    );
}

#[test]
fn test_decode_bad_auth_type() {
    let (ref bytes, _) = *PACKET3;
    let mut bytes = bytes.clone();
    bytes[24] = 99;
    test_decode_packet(
        &bytes,
        &Err(DecodeError::InvalidAuthenticationType(99)),
    );
}

#[test]
fn test_decode_bad_auth_length() {
    let (ref bytes, _) = *PACKET3;
    let mut bytes = bytes.clone();
    bytes[25] = 10;
    test_decode_packet(
        &bytes,
        &Err(DecodeError::InvalidAuthenticationLength(10)),
    );
}

#[test]
fn test_keyed_sha1_round_trip() {
    let cfg = AuthCfg {
        auth_type: AuthenticationType::MeticulousKeyedSha1,
        key_id: 7,
        key: b"sw0rdf1sh".to_vec(),
    };
    let packet = Packet {
        version: 1,
        diag: 0,
        state: State::Up,
        flags: PacketFlags::C,
        detect_mult: 3,
        my_discr: 0x1000,
        your_discr: 0x2000,
        desired_min_tx: 100000,
        req_min_rx: 100000,
        req_min_echo_rx: 0,
        auth: Some(AuthTlv::new(
            cfg.auth_type,
            cfg.key_id,
            Some(42),
            Bytes::new(),
        )),
    };

    let bytes = packet.encode(Some(&cfg.key));
    assert_eq!(bytes.len(), 24 + 28);
    assert_eq!(bytes[3], 52);

    let decoded = Packet::decode(&bytes).unwrap();
    let auth = decoded.auth.as_ref().unwrap();
    assert_eq!(auth.auth_type, cfg.auth_type);
    assert_eq!(auth.key_id, 7);
    assert_eq!(auth.seq, Some(42));
    assert_eq!(auth.data.len(), 20);

    // The digest checks out against the key...
    assert_eq!(auth::verify_auth(&bytes, auth, &cfg, None), Ok(Some(42)));

    // ...fails against a different key...
    let bad_cfg = AuthCfg {
        key: b"letmein".to_vec(),
        ..cfg.clone()
    };
    assert_eq!(
        auth::verify_auth(&bytes, auth, &bad_cfg, None),
        Err(AuthError::DigestMismatch)
    );

    // ...and fails when the packet was tampered with.
    let mut tampered = bytes.clone();
    tampered[2] = 10;
    assert_eq!(
        auth::verify_auth(&tampered, auth, &cfg, None),
        Err(AuthError::DigestMismatch)
    );
}

#[test]
fn test_keyed_md5_replay_window() {
    let cfg = AuthCfg {
        auth_type: AuthenticationType::KeyedMd5,
        key_id: 1,
        key: b"secret".to_vec(),
    };
    let meticulous_cfg = AuthCfg {
        auth_type: AuthenticationType::MeticulousKeyedMd5,
        ..cfg.clone()
    };

    let mut packet = Packet {
        version: 1,
        diag: 0,
        state: State::Up,
        flags: PacketFlags::empty(),
        detect_mult: 3,
        my_discr: 1,
        your_discr: 2,
        desired_min_tx: 100000,
        req_min_rx: 100000,
        req_min_echo_rx: 0,
        auth: Some(AuthTlv::new(cfg.auth_type, 1, Some(100), Bytes::new())),
    };

    let bytes = packet.encode(Some(&cfg.key));
    let decoded = Packet::decode(&bytes).unwrap();
    let auth_tlv = decoded.auth.as_ref().unwrap();
    assert_eq!(auth_tlv.data.len(), 16);

    // Non-meticulous: an unchanged sequence number is acceptable.
    assert_eq!(
        auth::verify_auth(&bytes, auth_tlv, &cfg, Some(100)),
        Ok(Some(100))
    );
    // A regression is not.
    assert_eq!(
        auth::verify_auth(&bytes, auth_tlv, &cfg, Some(101)),
        Err(AuthError::SequenceRegression)
    );

    // Meticulous: the sequence number must strictly increase.
    packet.auth = Some(AuthTlv::new(
        meticulous_cfg.auth_type,
        1,
        Some(100),
        Bytes::new(),
    ));
    let bytes = packet.encode(Some(&meticulous_cfg.key));
    let decoded = Packet::decode(&bytes).unwrap();
    let auth_tlv = decoded.auth.as_ref().unwrap();
    assert_eq!(
        auth::verify_auth(&bytes, auth_tlv, &meticulous_cfg, Some(100)),
        Err(AuthError::SequenceRegression)
    );
    assert_eq!(
        auth::verify_auth(&bytes, auth_tlv, &meticulous_cfg, Some(99)),
        Ok(Some(100))
    );
}

#[test]
fn test_round_trip_preserves_fields() {
    for state in [State::AdminDown, State::Down, State::Init, State::Up] {
        let your_discr =
            if matches!(state, State::Init | State::Up) { 7 } else { 0 };
        let packet = Packet {
            version: 1,
            diag: 3,
            state,
            flags: PacketFlags::C | PacketFlags::D,
            detect_mult: 255,
            my_discr: u32::MAX,
            your_discr,
            desired_min_tx: 250,
            req_min_rx: u32::MAX,
            req_min_echo_rx: 0,
            auth: None,
        };
        let bytes = packet.encode(None);
        assert_eq!(Packet::decode(&bytes), Ok(packet));
    }
}
