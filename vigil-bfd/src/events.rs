//
// Copyright (c) The Vigil Project Contributors
//
// SPDX-License-Identifier: MIT
//

use bytes::Bytes;
use tracing::trace;

use crate::auth::{self, AuthError};
use crate::debug::Debug;
use crate::error::Error;
use crate::master::Master;
use crate::network::PacketInfo;
use crate::packet::{DiagnosticCode, Packet, PacketFlags, State};
use crate::session::{Session, SessionId, SessionRemoteInfo};

// Handles a validated datagram from one of the Rx sockets.
pub(crate) fn process_udp_packet(
    master: &mut Master,
    packet_info: PacketInfo,
    packet: Packet,
    data: Bytes,
) -> Result<(), Error> {
    trace!(?packet_info, ?packet, "received packet");

    // Session lookup varies depending on whether the Your Discriminator
    // field is zero or not.
    let Some((_, sess)) = (match packet.your_discr {
        0 => master
            .sessions
            .get_mut_by_addrs(packet_info.src.ip(), packet_info.dst),
        _ => master.sessions.get_mut_by_discr(packet.your_discr),
    }) else {
        // Discard the packet.
        master.statistics.unknown_session_count += 1;
        return Err(Error::SessionNoMatch(packet_info.src, packet.your_discr));
    };

    // Update packet counter.
    sess.statistics.rx_packet_count += 1;
    sess.statistics.last_rx_time = Some(chrono::Utc::now());

    // GTSM check (RFC 5082): with the default TTL requirement of 255 only
    // on-link packets survive.
    if packet_info.ttl < sess.config.ttl {
        sess.statistics.rx_error_count += 1;
        return Err(Error::TtlTooLow(packet_info.src, packet_info.ttl));
    }

    // Validation checks.
    if let Err(error) = validate_packet(&packet) {
        sess.statistics.rx_error_count += 1;
        return Err(error);
    }

    // Authenticate the packet. A sustained authentication failure is not a
    // state change by itself; the detection timer converts it into one.
    if let Err(error) = authenticate_packet(sess, &packet, &data) {
        sess.statistics.auth_fail_count += 1;
        return Err(error.into());
    }

    // Packets received while administratively down are silently discarded.
    if sess.state.local_state == State::AdminDown {
        return Ok(());
    }

    // Update session's view of the remote endpoint.
    let old_remote_min_rx = sess.remote_min_rx_interval();
    sess.state.remote = Some(SessionRemoteInfo::new(
        packet.state,
        packet.my_discr,
        packet.diag,
        packet.detect_mult,
        packet.desired_min_tx,
        packet.req_min_rx,
    ));

    // If a Poll Sequence is being transmitted by the local system and the
    // Final (F) bit in the received packet is set, the Poll Sequence MUST
    // be terminated and the updated timing parameters take effect.
    if sess.poll_sequence_is_active() && packet.flags.contains(PacketFlags::F)
    {
        Debug::PollSequenceTerminate(&sess.key).log();
        sess.poll_sequence_terminate();
        sess.state.curr_min_tx = sess.desired_tx_interval();
        sess.state.curr_min_rx = sess.config.min_rx;
        sess.rearm_tx_timer(&master.tx.tx_timer);
    }

    // Honor a changed remote Required Min Rx Interval immediately
    // (RFC 5880, section 6.8.2).
    if sess.remote_min_rx_interval() != old_remote_min_rx {
        sess.rearm_tx_timer(&master.tx.tx_timer);
    }

    // Update the Detection Time as described in section 6.8.4.
    sess.rearm_detection_timer(&master.tx.detect_timer);

    // Invoke FSM event.
    let next_state = match (sess.state.local_state, packet.state) {
        (State::Init | State::Up, State::AdminDown) => {
            Some((State::Down, DiagnosticCode::NbrDown))
        }
        (State::Down, State::Down) => {
            Some((State::Init, DiagnosticCode::Nothing))
        }
        (State::Down, State::Init) => {
            Some((State::Up, DiagnosticCode::Nothing))
        }
        (State::Init, State::Init | State::Up) => {
            Some((State::Up, DiagnosticCode::Nothing))
        }
        (State::Up, State::Down) => {
            Some((State::Down, DiagnosticCode::NbrDown))
        }
        _ => None,
    };
    if let Some((state, diag)) = next_state {
        // Effectively transition to the new FSM state.
        sess.state_update(
            state,
            diag,
            &mut master.publisher,
            &master.tx.tx_timer,
        );
    }

    // If the Poll (P) bit is set, send a BFD Control packet to the remote
    // system with the Poll (P) bit clear, and the Final (F) bit set.
    if packet.flags.contains(PacketFlags::P) {
        sess.send_packet(true);
    }

    // A passive session starts transmitting once the peer has spoken.
    if sess.state.tx_timer.is_none() {
        sess.rearm_tx_timer(&master.tx.tx_timer);
    }

    Ok(())
}

// Semantic checks beyond what the codec enforces.
fn validate_packet(packet: &Packet) -> Result<(), Error> {
    if packet.flags.contains(PacketFlags::P | PacketFlags::F) {
        return Err(Error::InvalidFlags(packet.flags));
    }

    Ok(())
}

// Checks the packet's authentication section against the session
// configuration (RFC 5880, section 6.7).
fn authenticate_packet(
    sess: &mut Session,
    packet: &Packet,
    data: &[u8],
) -> Result<(), AuthError> {
    match (&sess.config.auth, &packet.auth) {
        (None, None) => Ok(()),
        (None, Some(_)) => Err(AuthError::UnexpectedAuthentication),
        (Some(_), None) => Err(AuthError::MissingAuthentication),
        (Some(auth_cfg), Some(auth_tlv)) => {
            let seq = auth::verify_auth(
                data,
                auth_tlv,
                auth_cfg,
                sess.state.auth_rx_seq,
            )?;
            if seq.is_some() {
                sess.state.auth_rx_seq = seq;
            }
            Ok(())
        }
    }
}

// Declares the session down after detection time elapsed without a valid
// packet.
pub(crate) fn process_detection_timer_expiry(
    master: &mut Master,
    sess_id: SessionId,
) -> Result<(), Error> {
    let (_, sess) = master.sessions.get_mut_by_id(sess_id)?;

    // A stale expiry can arrive after the remote state was already reset.
    if sess.state.remote.is_none() {
        return Ok(());
    }

    Debug::DetectionTimeExpiry(&sess.key).log();

    // Transition to the "Down" state.
    sess.state_update(
        State::Down,
        DiagnosticCode::TimeExpired,
        &mut master.publisher,
        &master.tx.tx_timer,
    );

    // Reset remote data since the peer is dead, and fall back to the slow
    // transmission rate.
    sess.state.remote = None;
    sess.state.detection_timer = None;
    sess.rearm_tx_timer(&master.tx.tx_timer);

    Ok(())
}

// Transmits one periodic control packet and schedules the next one with
// fresh jitter.
pub(crate) fn process_tx_timer(
    master: &mut Master,
    sess_id: SessionId,
) -> Result<(), Error> {
    let (_, sess) = master.sessions.get_mut_by_id(sess_id)?;

    // A tick queued before the session was shut down is ignored.
    if sess.state.local_state == State::AdminDown {
        return Ok(());
    }

    sess.send_packet(false);
    sess.rearm_tx_timer(&master.tx.tx_timer);

    Ok(())
}
