//
// Copyright (c) The Vigil Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, SocketAddr};

use vigil_bfd::config::{BfdConfig, InstanceCfg};
use vigil_bfd::master::{Master, MasterChannelsRx};
use vigil_bfd::network::PacketInfo;
use vigil_bfd::notify::EventKind;
use vigil_bfd::packet::{Packet, PacketFlags, State};
use vigil_bfd::reload;
use vigil_bfd::session::SessionKey;
use vigil_bfd::tasks::messages::MasterMsg;
use vigil_bfd::tasks::messages::input::{DetectTimerMsg, UdpRxPacketMsg};

//
// Helper functions.
//

const LOCAL: &str = "10.0.0.1";
const PEER: &str = "10.0.0.2";

fn instance(name: &str) -> InstanceCfg {
    InstanceCfg {
        name: name.to_owned(),
        local_addr: LOCAL.parse().unwrap(),
        peer_addr: PEER.parse().unwrap(),
        min_tx: 100_000,
        min_rx: 100_000,
        idle_tx: 1_000_000,
        multiplier: 3,
        ttl: 255,
        passive: false,
        control_independent: true,
        auth: None,
    }
}

fn key() -> SessionKey {
    SessionKey::new(LOCAL.parse().unwrap(), PEER.parse().unwrap())
}

fn master_with(instances: Vec<InstanceCfg>) -> (Master, MasterChannelsRx) {
    let config = BfdConfig { instances };
    let (mut master, channels) = Master::new(config.clone());
    reload::apply(&mut master, config);
    (master, channels)
}

// Feeds one packet from the peer into the dispatcher.
fn rx_packet(master: &mut Master, packet: Packet) {
    rx_packet_ttl(master, packet, 255);
}

fn rx_packet_ttl(master: &mut Master, packet: Packet, ttl: u8) {
    let src = SocketAddr::new(PEER.parse::<IpAddr>().unwrap(), 49152);
    let dst = LOCAL.parse().unwrap();
    let data = packet.encode(None).freeze();
    let msg = UdpRxPacketMsg {
        packet_info: PacketInfo { src, dst, ttl },
        packet,
        data,
    };
    master.process_msg(MasterMsg::UdpRxPacket(msg));
}

// Control packet as the peer would generate it.
fn peer_packet(state: State, your_discr: u32) -> Packet {
    Packet {
        version: 1,
        diag: 0,
        state,
        flags: PacketFlags::C,
        detect_mult: 3,
        my_discr: 0xcafe,
        your_discr,
        desired_min_tx: 100_000,
        req_min_rx: 100_000,
        req_min_echo_rx: 0,
        auth: None,
    }
}

fn local_discr(master: &Master) -> u32 {
    master.sessions.get_by_key(&key()).unwrap().state.local_discr
}

fn local_state(master: &Master) -> State {
    master.sessions.get_by_key(&key()).unwrap().state.local_state
}

// Drives the session from Down to Up through the three-way handshake.
fn bring_up(master: &mut Master) {
    rx_packet(master, peer_packet(State::Down, 0));
    assert_eq!(local_state(master), State::Init);
    let discr = local_discr(master);
    rx_packet(master, peer_packet(State::Init, discr));
    assert_eq!(local_state(master), State::Up);
}

//
// Tests.
//

#[test]
fn cold_handshake() {
    let (mut master, _channels) = master_with(vec![instance("peer-a")]);

    // A freshly configured session starts Down with a scheduled Tx.
    {
        let sess = master.sessions.get_by_key(&key()).unwrap();
        assert_eq!(sess.state.local_state, State::Down);
        assert!(sess.state.tx_timer.is_some());
        assert!(sess.state.detection_timer.is_none());
        assert_ne!(sess.state.local_discr, 0);
    }

    bring_up(&mut master);

    // Exactly one Up event was published.
    assert_eq!(master.publisher.published.len(), 1);
    let event = &master.publisher.published[0];
    assert_eq!(event.kind, EventKind::Up);
    assert_eq!(event.local_discr, local_discr(&master));
    assert_eq!(event.peer, PEER.parse::<IpAddr>().unwrap());

    // The remote endpoint is known and the detection timer armed.
    let sess = master.sessions.get_by_key(&key()).unwrap();
    let remote = sess.state.remote.as_ref().unwrap();
    assert_eq!(remote.discr, 0xcafe);
    assert!(sess.state.detection_timer.is_some());
    assert_eq!(sess.detection_time(), Some(3 * 100_000));
}

#[test]
fn detection_timeout() {
    let (mut master, _channels) = master_with(vec![instance("peer-a")]);
    bring_up(&mut master);

    let sess_id = master.sessions.get_by_key(&key()).unwrap().id;
    master.process_msg(MasterMsg::DetectTimer(DetectTimerMsg { sess_id }));

    let sess = master.sessions.get_by_key(&key()).unwrap();
    assert_eq!(sess.state.local_state, State::Down);
    assert!(sess.state.remote.is_none());
    // No remote discriminator, no detection time.
    assert_eq!(sess.detection_time(), None);

    // One Up event from the handshake, one Down event from the expiry.
    assert_eq!(master.publisher.published.len(), 2);
    let event = &master.publisher.published[1];
    assert_eq!(event.kind, EventKind::Down);
    assert_eq!(
        event.diag,
        vigil_bfd::packet::DiagnosticCode::TimeExpired as u8
    );
}

#[test]
fn poll_sequence_on_parameter_change() {
    let (mut master, _channels) = master_with(vec![instance("peer-a")]);
    bring_up(&mut master);
    let discr = local_discr(&master);

    // Entering Up starts a Poll Sequence to leave the slow Tx rate; the
    // peer's Final bit commits the fast interval.
    assert!(
        master.sessions.get_by_key(&key()).unwrap().state.poll_active
    );
    let mut final_packet = peer_packet(State::Up, discr);
    final_packet.flags.insert(PacketFlags::F);
    rx_packet(&mut master, final_packet);
    {
        let sess = master.sessions.get_by_key(&key()).unwrap();
        assert!(!sess.state.poll_active);
        assert_eq!(sess.state.curr_min_tx, 100_000);
    }
    let events_so_far = master.publisher.published.len();

    // Reconfigure the required receive interval; the session stays Up and
    // renegotiates through a new Poll Sequence.
    let mut changed = instance("peer-a");
    changed.min_rx = 50_000;
    reload::apply(&mut master, BfdConfig { instances: vec![changed] });
    {
        let sess = master.sessions.get_by_key(&key()).unwrap();
        assert_eq!(sess.state.local_state, State::Up);
        assert!(sess.state.poll_active);
    }

    // The peer acknowledges with Final; the new parameters take effect.
    let mut final_packet = peer_packet(State::Up, discr);
    final_packet.flags.insert(PacketFlags::F);
    rx_packet(&mut master, final_packet);
    let sess = master.sessions.get_by_key(&key()).unwrap();
    assert!(!sess.state.poll_active);
    assert_eq!(sess.state.curr_min_rx, 50_000);
    assert_eq!(sess.state.local_state, State::Up);

    // No state transition, no extra events.
    assert_eq!(master.publisher.published.len(), events_so_far);
}

#[test]
fn remote_poll_gets_immediate_final() {
    let (mut master, _channels) = master_with(vec![instance("peer-a")]);
    bring_up(&mut master);
    let discr = local_discr(&master);

    let tx_before =
        master.sessions.get_by_key(&key()).unwrap().statistics.tx_packet_count;

    let mut poll_packet = peer_packet(State::Up, discr);
    poll_packet.flags.insert(PacketFlags::P);
    rx_packet(&mut master, poll_packet);

    // One packet went out immediately, outside the periodic schedule.
    let sess = master.sessions.get_by_key(&key()).unwrap();
    assert_eq!(sess.statistics.tx_packet_count, tx_before + 1);
}

#[test]
fn admin_down_on_session_removal() {
    let (mut master, _channels) = master_with(vec![instance("peer-a")]);
    bring_up(&mut master);

    // The operator removes the peer from the configuration.
    reload::apply(&mut master, BfdConfig { instances: vec![] });

    assert_eq!(master.sessions.iter().count(), 0);
    let event = master.publisher.published.last().unwrap();
    assert_eq!(event.kind, EventKind::Admin);
}

#[test]
fn neighbor_signaled_admin_down() {
    let (mut master, _channels) = master_with(vec![instance("peer-a")]);
    bring_up(&mut master);
    let discr = local_discr(&master);

    rx_packet(&mut master, peer_packet(State::AdminDown, discr));

    assert_eq!(local_state(&master), State::Down);
    let event = master.publisher.published.last().unwrap();
    assert_eq!(event.kind, EventKind::Down);
    assert_eq!(
        event.diag,
        vigil_bfd::packet::DiagnosticCode::NbrDown as u8
    );
}

#[test]
fn unknown_discriminator_is_counted() {
    let (mut master, _channels) = master_with(vec![instance("peer-a")]);

    rx_packet(&mut master, peer_packet(State::Up, 99999));

    assert_eq!(master.statistics.unknown_session_count, 1);
    assert_eq!(local_state(&master), State::Down);
    assert!(master.publisher.published.is_empty());
}

#[test]
fn gtsm_rejects_low_ttl() {
    let (mut master, _channels) = master_with(vec![instance("peer-a")]);

    rx_packet_ttl(&mut master, peer_packet(State::Down, 0), 254);

    let sess = master.sessions.get_by_key(&key()).unwrap();
    assert_eq!(sess.state.local_state, State::Down);
    assert_eq!(sess.statistics.rx_error_count, 1);
    assert!(sess.state.remote.is_none());
}

#[test]
fn unauthenticated_packet_rejected() {
    let mut with_auth = instance("peer-a");
    with_auth.auth = Some(vigil_bfd::config::AuthCfg {
        auth_type: vigil_bfd::packet::AuthenticationType::KeyedMd5,
        key_id: 1,
        key: b"secret".to_vec(),
    });
    let (mut master, _channels) = master_with(vec![with_auth]);

    rx_packet(&mut master, peer_packet(State::Down, 0));

    let sess = master.sessions.get_by_key(&key()).unwrap();
    assert_eq!(sess.state.local_state, State::Down);
    assert_eq!(sess.statistics.auth_fail_count, 1);
    assert!(sess.state.remote.is_none());
}

#[test]
fn passive_session_waits_for_peer() {
    let mut passive = instance("peer-a");
    passive.passive = true;
    let (mut master, _channels) = master_with(vec![passive]);

    // No periodic transmission before the peer speaks.
    assert!(
        master.sessions.get_by_key(&key()).unwrap().state.tx_timer.is_none()
    );

    rx_packet(&mut master, peer_packet(State::Down, 0));

    let sess = master.sessions.get_by_key(&key()).unwrap();
    assert_eq!(sess.state.local_state, State::Init);
    assert!(sess.state.tx_timer.is_some());
}

#[test]
fn reload_is_idempotent() {
    let (mut master, _channels) = master_with(vec![instance("peer-a")]);
    bring_up(&mut master);
    let discr = local_discr(&master);

    // Settle the Poll Sequence started when the session came up.
    let mut final_packet = peer_packet(State::Up, discr);
    final_packet.flags.insert(PacketFlags::F);
    rx_packet(&mut master, final_packet);
    let events = master.publisher.published.len();

    reload::apply(
        &mut master,
        BfdConfig { instances: vec![instance("peer-a")] },
    );

    // Same session, same state, nothing republished.
    let sess = master.sessions.get_by_key(&key()).unwrap();
    assert_eq!(sess.state.local_discr, discr);
    assert_eq!(sess.state.local_state, State::Up);
    assert!(!sess.state.poll_active);
    assert_eq!(master.publisher.published.len(), events);
}

#[test]
fn tx_timer_scheduled_in_active_states() {
    let (mut master, _channels) = master_with(vec![instance("peer-a")]);

    // Down.
    assert!(
        master.sessions.get_by_key(&key()).unwrap().state.tx_timer.is_some()
    );

    // Init.
    rx_packet(&mut master, peer_packet(State::Down, 0));
    assert!(
        master.sessions.get_by_key(&key()).unwrap().state.tx_timer.is_some()
    );

    // Up.
    let discr = local_discr(&master);
    rx_packet(&mut master, peer_packet(State::Init, discr));
    assert!(
        master.sessions.get_by_key(&key()).unwrap().state.tx_timer.is_some()
    );
}
