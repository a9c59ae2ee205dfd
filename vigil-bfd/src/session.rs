//
// Copyright (c) The Vigil Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use derive_new::new;
use generational_arena::{Arena, Index};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;
use vigil_utils::socket::UdpSocket;
use vigil_utils::task::TimeoutTask;

use crate::config::InstanceCfg;
use crate::debug::Debug;
use crate::error::{Error, IoError};
use crate::notify::{Event, Publisher};
use crate::packet::{
    AuthTlv, DiagnosticCode, Packet, PacketFlags, State,
};
use crate::tasks::messages::input::{DetectTimerMsg, TxTimerMsg};
use crate::{network, tasks};

// The slow Tx interval is used to conserve bandwidth when the session is not
// up (RFC 5880, section 6.8.3).
pub const SLOW_TX_INTERVAL: u32 = 1_000_000;

pub type SessionId = usize;
pub type SessionIndex = Index;

// BFD session key: one session per local/peer address pair.
#[derive(Clone, Copy, Debug, Eq, Hash, new, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct SessionKey {
    pub local: IpAddr,
    pub peer: IpAddr,
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub key: SessionKey,
    pub config: InstanceCfg,
    pub state: SessionState,
    pub statistics: SessionStatistics,
}

#[derive(Debug)]
pub struct SessionState {
    pub socket_tx: Option<UdpSocket>,
    pub sockaddr: SocketAddr,
    // Committed timing parameters (updated when a Poll Sequence ends).
    pub curr_min_tx: u32,
    pub curr_min_rx: u32,
    pub local_state: State,
    pub local_discr: u32,
    pub local_diag: DiagnosticCode,
    pub poll_active: bool,
    pub remote: Option<SessionRemoteInfo>,
    // Authentication sequence numbers (RFC 5880, section 6.7.3).
    pub auth_tx_seq: u32,
    pub auth_rx_seq: Option<u32>,
    pub tx_timer: Option<TimeoutTask>,
    pub detection_timer: Option<TimeoutTask>,
}

#[derive(Debug, new)]
pub struct SessionRemoteInfo {
    pub state: State,
    pub discr: u32,
    pub diag: u8,
    pub multiplier: u8,
    pub min_tx: u32,
    pub min_rx: u32,
}

#[derive(Debug)]
pub struct SessionStatistics {
    pub create_time: DateTime<Utc>,
    pub last_state_change_time: Option<DateTime<Utc>>,
    pub last_down_time: Option<DateTime<Utc>>,
    pub last_up_time: Option<DateTime<Utc>>,
    pub last_rx_time: Option<DateTime<Utc>>,
    pub down_count: u32,
    pub admin_down_count: u32,
    pub rx_packet_count: u64,
    pub tx_packet_count: u64,
    pub rx_error_count: u64,
    pub tx_error_count: u64,
    pub auth_fail_count: u64,
}

#[derive(Debug, Default)]
pub struct Sessions {
    // Session arena.
    arena: Arena<Session>,
    // Session hash table keyed by ID (1:1).
    id_tree: HashMap<SessionId, SessionIndex>,
    // Session binary tree keyed by local/peer address pair (1:1).
    key_tree: BTreeMap<SessionKey, SessionIndex>,
    // Session binary tree keyed by local discriminator (1:1), sorted so the
    // administrative dump iterates in discriminator order.
    discr_tree: BTreeMap<u32, SessionIndex>,
    // Session hash table keyed by (peer, local) address pair, used to
    // resolve packets whose Your Discriminator field is zero.
    addr_tree: HashMap<(IpAddr, IpAddr), SessionIndex>,
    // Next available ID.
    next_id: SessionId,
    // Discriminator allocation cursor.
    next_discr: u32,
}

// ===== impl SessionKey =====

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.local, self.peer)
    }
}

// ===== impl Session =====

impl Session {
    fn new(
        id: SessionId,
        key: SessionKey,
        local_discr: u32,
        config: InstanceCfg,
    ) -> Session {
        Debug::SessionCreate(&key, local_discr).log();

        let sockaddr = SocketAddr::new(key.peer, network::PORT_DST);
        let curr_min_tx = std::cmp::max(config.idle_tx, SLOW_TX_INTERVAL);
        let curr_min_rx = config.min_rx;
        Session {
            id,
            key,
            config,
            state: SessionState {
                socket_tx: None,
                sockaddr,
                curr_min_tx,
                curr_min_rx,
                local_state: State::Down,
                local_discr,
                local_diag: DiagnosticCode::Nothing,
                poll_active: false,
                remote: None,
                auth_tx_seq: rand::random(),
                auth_rx_seq: None,
                tx_timer: None,
                detection_timer: None,
            },
            statistics: SessionStatistics::default(),
        }
    }

    // Updates the FSM state of the BFD session, publishing the transition to
    // the external consumers when it is one they act on.
    pub(crate) fn state_update(
        &mut self,
        state: State,
        diag: DiagnosticCode,
        publisher: &mut Publisher,
        tx_timerp: &Sender<TxTimerMsg>,
    ) {
        let old_state = self.state.local_state;
        if old_state == state {
            return;
        }
        self.state.local_state = state;
        self.state.local_diag = diag;

        Debug::FsmTransition(&self.key, old_state, state).log();

        // Update statistics.
        self.statistics.last_state_change_time = Some(Utc::now());
        match state {
            State::AdminDown => {
                self.statistics.admin_down_count += 1;
            }
            State::Down => {
                self.statistics.last_down_time = Some(Utc::now());
                self.statistics.down_count += 1;
            }
            State::Up => {
                self.statistics.last_up_time = Some(Utc::now());
            }
            _ => {}
        }

        // Notify the tracker processes.
        if state == State::Up {
            publisher.publish(Event::up(self));
        } else if old_state == State::Up && state == State::Down {
            publisher.publish(Event::down(self, diag));
        } else if state == State::AdminDown {
            publisher.publish(Event::admin(self));
        }

        if old_state == State::Up {
            // Fall back to the slow Tx interval and forget everything
            // learned from the peer; the next packet starts over.
            self.state.curr_min_tx = self.desired_tx_interval();
            self.state.remote = None;
            self.state.detection_timer = None;
            self.state.auth_rx_seq = None;
        } else if state == State::Up {
            // Start a Poll Sequence to leave the slow Tx interval.
            self.poll_sequence_start();
        }

        // Synchronize the Tx timer since the local state has changed.
        self.rearm_tx_timer(tx_timerp);
    }

    // Returns the locally desired Min Tx Interval.
    //
    // When the session is not Up, the advertised interval is raised to at
    // least one second so that sessions that never come up consume
    // negligible bandwidth (RFC 5880, section 6.8.3).
    pub(crate) fn desired_tx_interval(&self) -> u32 {
        if self.state.local_state != State::Up {
            return std::cmp::max(self.config.idle_tx, SLOW_TX_INTERVAL);
        }

        self.config.min_tx
    }

    // Returns the last value of Required Min Rx Interval received from the
    // remote system, or the initial value of 1 microsecond if the peer
    // hasn't been heard from yet.
    pub(crate) fn remote_min_rx_interval(&self) -> u32 {
        self.state.remote.as_ref().map(|remote| remote.min_rx).unwrap_or(1)
    }

    // Returns the negotiated Tx interval for the session.
    pub(crate) fn negotiated_tx_interval(&self) -> Option<u32> {
        let remote_min_rx = self.remote_min_rx_interval();

        // A system MUST NOT periodically transmit BFD Control packets if
        // bfd.RemoteMinRxInterval is zero.
        if remote_min_rx == 0 {
            return None;
        }

        Some(std::cmp::max(self.state.curr_min_tx, remote_min_rx))
    }

    // Returns the negotiated Rx interval for the session.
    pub(crate) fn negotiated_rx_interval(&self) -> Option<u32> {
        self.state
            .remote
            .as_ref()
            .map(|remote| std::cmp::max(self.state.curr_min_rx, remote.min_tx))
    }

    // Returns the negotiated detection time for the session.
    //
    // The Detection Time is the Detect Mult received from the remote system
    // multiplied by the agreed transmit interval of the remote system (the
    // greater of the local Required Min Rx Interval and the last received
    // Desired Min Tx Interval).
    pub fn detection_time(&self) -> Option<u32> {
        self.state.remote.as_ref().map(|remote| {
            remote.multiplier as u32 * self.negotiated_rx_interval().unwrap()
        })
    }

    // Generates a BFD Control packet reflecting the session's current state.
    //
    // A mutable borrow is needed because every authenticated packet consumes
    // a transmit sequence number.
    pub(crate) fn generate_packet(&mut self, final_flag: bool) -> Packet {
        let mut flags = PacketFlags::empty();
        if final_flag {
            flags.insert(PacketFlags::F);
        } else if self.state.poll_active {
            // The P and F bits are never both set in one packet.
            flags.insert(PacketFlags::P);
        }
        if self.config.control_independent {
            flags.insert(PacketFlags::C);
        }

        let auth = self.config.auth.as_ref().map(|auth_cfg| {
            self.state.auth_tx_seq = self.state.auth_tx_seq.wrapping_add(1);
            AuthTlv::new(
                auth_cfg.auth_type,
                auth_cfg.key_id,
                Some(self.state.auth_tx_seq),
                Default::default(),
            )
        });

        Packet {
            version: Packet::VERSION,
            diag: self.state.local_diag as u8,
            state: self.state.local_state,
            flags,
            detect_mult: self.config.multiplier,
            my_discr: self.state.local_discr,
            your_discr: self
                .state
                .remote
                .as_ref()
                .map(|remote| remote.discr)
                .unwrap_or(0),
            desired_min_tx: self.desired_tx_interval(),
            req_min_rx: self.config.min_rx,
            req_min_echo_rx: 0,
            auth,
        }
    }

    // Creates the UDP socket used to send BFD packets for this session.
    pub(crate) fn update_socket_tx(&mut self) {
        let ttl = self.config.ttl;
        match network::socket_tx(self.key.local, ttl) {
            Ok(socket) => self.state.socket_tx = Some(socket),
            Err(error) => {
                IoError::UdpSocketError(error).log();
            }
        }
    }

    // Encodes and sends one BFD control packet.
    pub(crate) fn send_packet(&mut self, final_flag: bool) {
        let packet = self.generate_packet(final_flag);
        if let Some(socket) = &self.state.socket_tx {
            network::send_packet(
                socket,
                self.state.sockaddr,
                packet,
                self.config.auth.as_ref().map(|auth| auth.key.as_slice()),
                &mut self.statistics,
            );
        }
    }

    // (Re)starts or stops the periodic transmission of BFD packets, drawing
    // fresh jitter for the next interval.
    pub(crate) fn rearm_tx_timer(&mut self, tx_timerp: &Sender<TxTimerMsg>) {
        // A passive session waits for the peer to speak first.
        if self.config.passive && self.state.remote.is_none() {
            self.state.tx_timer = None;
            return;
        }

        let Some(interval) = self.negotiated_tx_interval() else {
            // The remote system asked for no periodic traffic.
            self.state.tx_timer = None;
            return;
        };

        let interval = tasks::tx_jitter(interval, self.config.multiplier);
        match self.state.tx_timer.take() {
            Some(mut tx_timer) => {
                tx_timer.rearm(interval);
                self.state.tx_timer = Some(tx_timer);
            }
            None => {
                let tx_timer = tasks::tx_timer(self, interval, tx_timerp);
                self.state.tx_timer = Some(tx_timer);
            }
        }
    }

    // (Re)sets the detection timer for this session.
    pub(crate) fn rearm_detection_timer(
        &mut self,
        detect_timerp: &Sender<DetectTimerMsg>,
    ) {
        let Some(detection_time) = self.detection_time() else {
            self.state.detection_timer = None;
            return;
        };

        let detection_time =
            std::time::Duration::from_micros(detection_time as u64);
        match self.state.detection_timer.take() {
            Some(mut timer) => {
                timer.rearm(detection_time);
                self.state.detection_timer = Some(timer);
            }
            None => {
                let timer = tasks::detection_timer(
                    self,
                    detection_time,
                    detect_timerp,
                );
                self.state.detection_timer = Some(timer);
            }
        }
    }

    // Shuts the session down administratively: one farewell packet, one
    // event, no more timers.
    pub(crate) fn admin_shutdown(&mut self, publisher: &mut Publisher) {
        let old_state = self.state.local_state;
        self.state.local_state = State::AdminDown;
        self.state.local_diag = DiagnosticCode::AdminDown;
        self.state.tx_timer = None;
        self.state.detection_timer = None;
        self.statistics.last_state_change_time = Some(Utc::now());
        self.statistics.admin_down_count += 1;

        Debug::FsmTransition(&self.key, old_state, State::AdminDown).log();

        self.send_packet(false);
        publisher.publish(Event::admin(self));
    }

    // Initiates a Poll Sequence.
    pub(crate) fn poll_sequence_start(&mut self) {
        self.state.poll_active = true;
    }

    // Terminates a Poll Sequence.
    pub(crate) fn poll_sequence_terminate(&mut self) {
        self.state.poll_active = false;
    }

    // Checks whether a Poll Sequence is in progress.
    pub(crate) fn poll_sequence_is_active(&self) -> bool {
        self.state.poll_active
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        Debug::SessionDelete(&self.key, self.state.local_discr).log();
    }
}

// ===== impl SessionStatistics =====

impl Default for SessionStatistics {
    fn default() -> SessionStatistics {
        SessionStatistics {
            create_time: Utc::now(),
            last_state_change_time: None,
            last_down_time: None,
            last_up_time: None,
            last_rx_time: None,
            down_count: 0,
            admin_down_count: 0,
            rx_packet_count: 0,
            tx_packet_count: 0,
            rx_error_count: 0,
            tx_error_count: 0,
            auth_fail_count: 0,
        }
    }
}

// ===== impl Sessions =====

impl Sessions {
    // Creates a session for the given key and configuration, allocating a
    // fresh local discriminator.
    pub(crate) fn insert(
        &mut self,
        key: SessionKey,
        config: InstanceCfg,
    ) -> Result<(SessionIndex, &mut Session), Error> {
        // Reuse the existing session, if any.
        if let Some(sess_idx) = self.key_tree.get(&key).copied() {
            return Ok((sess_idx, &mut self.arena[sess_idx]));
        }

        // Create and insert session into the arena.
        let id = self.next_id();
        let local_discr = self.allocate_discr()?;
        let sess = Session::new(id, key, local_discr, config);
        let sess_idx = self.arena.insert(sess);

        // Link session to the lookup collections.
        let sess = &mut self.arena[sess_idx];
        self.id_tree.insert(sess.id, sess_idx);
        self.key_tree.insert(sess.key, sess_idx);
        self.discr_tree.insert(sess.state.local_discr, sess_idx);
        self.addr_tree.insert((key.peer, key.local), sess_idx);

        Ok((sess_idx, sess))
    }

    pub(crate) fn delete(&mut self, sess_idx: SessionIndex) {
        let sess = &self.arena[sess_idx];

        // Unlink session from the lookup collections.
        self.id_tree.remove(&sess.id);
        self.key_tree.remove(&sess.key);
        self.discr_tree.remove(&sess.state.local_discr);
        self.addr_tree.remove(&(sess.key.peer, sess.key.local));

        // Remove session from the arena.
        self.arena.remove(sess_idx);
    }

    // Returns a mutable reference to the session corresponding to the given
    // ID.
    pub(crate) fn get_mut_by_id(
        &mut self,
        id: SessionId,
    ) -> Result<(SessionIndex, &mut Session), Error> {
        self.id_tree
            .get(&id)
            .copied()
            .map(move |sess_idx| (sess_idx, &mut self.arena[sess_idx]))
            .ok_or(Error::SessionIdNotFound(id))
    }

    // Returns a mutable reference to the session corresponding to the given
    // local/peer address pair.
    pub(crate) fn get_mut_by_key(
        &mut self,
        key: &SessionKey,
    ) -> Option<(SessionIndex, &mut Session)> {
        self.key_tree
            .get(key)
            .copied()
            .map(move |sess_idx| (sess_idx, &mut self.arena[sess_idx]))
    }

    // Returns a mutable reference to the session corresponding to the given
    // local discriminator.
    pub(crate) fn get_mut_by_discr(
        &mut self,
        discr: u32,
    ) -> Option<(SessionIndex, &mut Session)> {
        self.discr_tree
            .get(&discr)
            .copied()
            .map(move |sess_idx| (sess_idx, &mut self.arena[sess_idx]))
    }

    // Returns a mutable reference to the session matching the source and
    // destination addresses of a received packet.
    pub(crate) fn get_mut_by_addrs(
        &mut self,
        peer: IpAddr,
        local: IpAddr,
    ) -> Option<(SessionIndex, &mut Session)> {
        self.addr_tree
            .get(&(peer, local))
            .copied()
            .map(move |sess_idx| (sess_idx, &mut self.arena[sess_idx]))
    }

    // Returns a reference to the session corresponding to the given
    // local/peer address pair.
    pub fn get_by_key(&self, key: &SessionKey) -> Option<&Session> {
        self.key_tree.get(key).map(|sess_idx| &self.arena[*sess_idx])
    }

    // Returns an iterator visiting all sessions, ordered by local
    // discriminator.
    pub fn iter(&self) -> impl Iterator<Item = &'_ Session> + '_ {
        self.discr_tree.values().map(|sess_idx| &self.arena[*sess_idx])
    }

    // Returns an iterator over the keys of all live sessions.
    pub(crate) fn keys(&self) -> impl Iterator<Item = SessionKey> + '_ {
        self.key_tree.keys().copied()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    // Get next session ID.
    fn next_id(&mut self) -> SessionId {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    // Allocates an unused local discriminator.
    //
    // Discriminators come from a wrapping 32-bit counter that skips zero and
    // values still held by live sessions.
    fn allocate_discr(&mut self) -> Result<u32, Error> {
        let mut wrapped = false;
        loop {
            let (next, overflow) = self.next_discr.overflowing_add(1);
            self.next_discr = next;
            if overflow {
                if wrapped {
                    return Err(Error::DiscriminatorsExhausted);
                }
                wrapped = true;
            }
            if next != 0 && !self.discr_tree.contains_key(&next) {
                return Ok(next);
            }
        }
    }
}

impl std::ops::Index<SessionIndex> for Sessions {
    type Output = Session;

    fn index(&self, index: SessionIndex) -> &Self::Output {
        &self.arena[index]
    }
}

impl std::ops::IndexMut<SessionIndex> for Sessions {
    fn index_mut(&mut self, index: SessionIndex) -> &mut Self::Output {
        &mut self.arena[index]
    }
}

// ===== unit tests =====
