//
// Copyright (c) The Vigil Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::Arc;
use std::sync::atomic::{self, AtomicU64};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{error, info};
use vigil_utils::ip::AddressFamily;
use vigil_utils::task::Task;

use crate::config::BfdConfig;
use crate::error::{Error, IoError};
use crate::notify::Publisher;
use crate::packet::{DiagnosticCode, State};
use crate::session::{Session, Sessions};
use crate::tasks::messages::MasterMsg;
use crate::tasks::messages::input::{
    DetectTimerMsg, PipeWritableMsg, TxTimerMsg, UdpRxPacketMsg,
};
use crate::{events, network, reload, tasks};

#[derive(Debug)]
pub struct Master {
    // Active configuration.
    pub config: BfdConfig,
    // BFD sessions.
    pub sessions: Sessions,
    // State-change fan-out to the sibling daemons.
    pub publisher: Publisher,
    // Process-wide counters.
    pub statistics: MasterStatistics,
    // Master Tx channels.
    pub tx: MasterChannelsTx,
    // UDP Rx tasks.
    udp_rx_tasks: Option<UdpRxTasks>,
}

#[derive(Debug)]
pub struct MasterStatistics {
    pub unknown_session_count: u64,
    pub decode_error_count: Arc<AtomicU64>,
}

#[derive(Debug)]
struct UdpRxTasks {
    _ipv4: Task<()>,
    _ipv6: Task<()>,
}

#[derive(Clone, Debug)]
pub struct MasterChannelsTx {
    // UDP Rx event.
    pub udp_packet_rx: mpsc::Sender<UdpRxPacketMsg>,
    // Periodic transmission timer.
    pub tx_timer: mpsc::Sender<TxTimerMsg>,
    // Detection timer.
    pub detect_timer: mpsc::Sender<DetectTimerMsg>,
    // Event pipe drained below capacity.
    pub pipe_writable: mpsc::Sender<PipeWritableMsg>,
}

#[derive(Debug)]
pub struct MasterChannelsRx {
    udp_packet_rx: mpsc::Receiver<UdpRxPacketMsg>,
    tx_timer: mpsc::Receiver<TxTimerMsg>,
    detect_timer: mpsc::Receiver<DetectTimerMsg>,
    pipe_writable: mpsc::Receiver<PipeWritableMsg>,
}

// One line of the SIGUSR1 state dump.
#[derive(Debug, Serialize)]
struct DumpEntry<'a> {
    name: &'a str,
    key: String,
    local_discr: u32,
    remote_discr: u32,
    state: State,
    diag: DiagnosticCode,
    remote_state: Option<State>,
    poll_active: bool,
    negotiated_tx: Option<u32>,
    detection_time: Option<u32>,
    create_time: DateTime<Utc>,
    last_rx_time: Option<DateTime<Utc>>,
    down_count: u32,
    rx_packets: u64,
    tx_packets: u64,
    rx_errors: u64,
    tx_errors: u64,
    auth_failures: u64,
}

// ===== impl Master =====

impl Master {
    pub fn new(config: BfdConfig) -> (Master, MasterChannelsRx) {
        let (udp_packet_rxp, udp_packet_rxc) = mpsc::channel(4);
        let (tx_timerp, tx_timerc) = mpsc::channel(4);
        let (detect_timerp, detect_timerc) = mpsc::channel(4);
        let (pipe_writablep, pipe_writablec) = mpsc::channel(4);

        let tx = MasterChannelsTx {
            udp_packet_rx: udp_packet_rxp,
            tx_timer: tx_timerp,
            detect_timer: detect_timerp,
            pipe_writable: pipe_writablep,
        };
        let rx = MasterChannelsRx {
            udp_packet_rx: udp_packet_rxc,
            tx_timer: tx_timerc,
            detect_timer: detect_timerc,
            pipe_writable: pipe_writablec,
        };

        let master = Master {
            config,
            sessions: Default::default(),
            publisher: Publisher::new(tx.pipe_writable.clone()),
            statistics: MasterStatistics {
                unknown_session_count: 0,
                decode_error_count: Arc::new(AtomicU64::new(0)),
            },
            tx,
            udp_rx_tasks: None,
        };

        (master, rx)
    }

    // Binds the Rx sockets and instantiates the configured session set.
    //
    // Failure to bind the well-known BFD port is fatal.
    pub fn start(&mut self) -> Result<(), Error> {
        let socket_ipv4 = network::socket_rx(AddressFamily::Ipv4)
            .map_err(IoError::UdpSocketError)?;
        let socket_ipv6 = network::socket_rx(AddressFamily::Ipv6)
            .map_err(IoError::UdpSocketError)?;
        self.udp_rx_tasks = Some(UdpRxTasks {
            _ipv4: tasks::udp_rx(
                socket_ipv4,
                AddressFamily::Ipv4,
                &self.tx.udp_packet_rx,
                self.statistics.decode_error_count.clone(),
            ),
            _ipv6: tasks::udp_rx(
                socket_ipv6,
                AddressFamily::Ipv6,
                &self.tx.udp_packet_rx,
                self.statistics.decode_error_count.clone(),
            ),
        });

        // Instantiate the initial session set.
        let config = self.config.clone();
        reload::apply(self, config);

        Ok(())
    }

    // Runs the dispatcher loop, multiplexing packets, timers, pipe
    // writability and signals. Returns after a graceful stop.
    pub async fn run(
        mut self,
        mut channels: MasterChannelsRx,
        reload_config: impl Fn() -> Result<BfdConfig, String>,
    ) -> Result<(), Error> {
        self.start()?;

        let mut sighup =
            signal(SignalKind::hangup()).map_err(IoError::SignalSetupError)?;
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(IoError::SignalSetupError)?;
        let mut sigusr1 = signal(SignalKind::user_defined1())
            .map_err(IoError::SignalSetupError)?;

        info!("BFD dispatcher running");

        loop {
            tokio::select! {
                msg = channels.recv() => {
                    match msg {
                        Some(msg) => self.process_msg(msg),
                        None => break,
                    }
                }
                _ = sighup.recv() => {
                    info!("reload requested");
                    match reload_config() {
                        Ok(config) => reload::apply(&mut self, config),
                        Err(err) => {
                            error!(%err, "configuration rejected, keeping the running one");
                        }
                    }
                }
                _ = sigusr1.recv() => {
                    self.dump_state();
                }
                _ = sigterm.recv() => {
                    info!("shutting down");
                    break;
                }
            }
        }

        self.shutdown();

        Ok(())
    }

    // Dispatches one message from the child tasks.
    pub fn process_msg(&mut self, msg: MasterMsg) {
        let result = match msg {
            // Received UDP packet.
            MasterMsg::UdpRxPacket(msg) => events::process_udp_packet(
                self,
                msg.packet_info,
                msg.packet,
                msg.data,
            ),
            // Session Tx timer ticked.
            MasterMsg::TxTimer(msg) => {
                events::process_tx_timer(self, msg.sess_id)
            }
            // Session detection timer expired.
            MasterMsg::DetectTimer(msg) => {
                events::process_detection_timer_expiry(self, msg.sess_id)
            }
            // An event pipe has room again.
            MasterMsg::PipeWritable(msg) => {
                #[cfg(not(feature = "testing"))]
                self.publisher.flush(msg.kind);
                Ok(())
            }
        };
        if let Err(error) = result {
            error.log();
        }
    }

    // Logs the state of every session, ordered by local discriminator, plus
    // the process-wide counters.
    fn dump_state(&self) {
        info!("state dump requested");

        for sess in self.sessions.iter() {
            match serde_json::to_string(&DumpEntry::from_session(sess)) {
                Ok(dump) => info!(session = %dump, "session state"),
                Err(error) => error!(%error, "failed to serialize session"),
            }
        }

        info!(
            unknown_sessions = self.statistics.unknown_session_count,
            decode_errors = self
                .statistics
                .decode_error_count
                .load(atomic::Ordering::Relaxed),
            "global counters"
        );
        for (kind, overflow) in self.publisher.overflow_counts() {
            info!(consumer = %kind, overflow, "event pipe counters");
        }
    }

    // Final farewell: every session signals AdminDown to its peer and to
    // the consumers before the process exits.
    fn shutdown(&mut self) {
        let keys = self.sessions.keys().collect::<Vec<_>>();
        for key in keys {
            if let Some((_, sess)) = self.sessions.get_mut_by_key(&key) {
                sess.admin_shutdown(&mut self.publisher);
            }
        }
    }
}

// ===== impl MasterChannelsRx =====

impl MasterChannelsRx {
    pub(crate) async fn recv(&mut self) -> Option<MasterMsg> {
        tokio::select! {
            msg = self.udp_packet_rx.recv() => {
                msg.map(MasterMsg::UdpRxPacket)
            }
            msg = self.tx_timer.recv() => {
                msg.map(MasterMsg::TxTimer)
            }
            msg = self.detect_timer.recv() => {
                msg.map(MasterMsg::DetectTimer)
            }
            msg = self.pipe_writable.recv() => {
                msg.map(MasterMsg::PipeWritable)
            }
        }
    }
}

// ===== impl DumpEntry =====

impl<'a> DumpEntry<'a> {
    fn from_session(sess: &'a Session) -> DumpEntry<'a> {
        DumpEntry {
            name: &sess.config.name,
            key: sess.key.to_string(),
            local_discr: sess.state.local_discr,
            remote_discr: sess
                .state
                .remote
                .as_ref()
                .map(|remote| remote.discr)
                .unwrap_or(0),
            state: sess.state.local_state,
            diag: sess.state.local_diag,
            remote_state: sess.state.remote.as_ref().map(|remote| remote.state),
            poll_active: sess.state.poll_active,
            negotiated_tx: sess.negotiated_tx_interval(),
            detection_time: sess.detection_time(),
            create_time: sess.statistics.create_time,
            last_rx_time: sess.statistics.last_rx_time,
            down_count: sess.statistics.down_count,
            rx_packets: sess.statistics.rx_packet_count,
            tx_packets: sess.statistics.tx_packet_count,
            rx_errors: sess.statistics.rx_error_count,
            tx_errors: sess.statistics.tx_error_count,
            auth_failures: sess.statistics.auth_fail_count,
        }
    }
}
