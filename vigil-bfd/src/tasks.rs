//
// Copyright (c) The Vigil Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc::Sender;
use tracing::Instrument;
use vigil_utils::ip::AddressFamily;
use vigil_utils::socket::UdpSocket;
use vigil_utils::task::{Task, TimeoutTask};

use crate::network;
use crate::session::Session;

//
// BFD tasks diagram:
//                                +--------------+
//                 udp_rx (2x) -> |              | -> (Nx) Tx packets
//           tx_timer (Nx) -----> |    master    |
//           detection_timer (Nx) |              | -> event pipes
//                                +--------------+
//                                      ^
//                                      | SIGHUP / SIGTERM / SIGUSR1
//

// BFD inter-task message types.
pub mod messages {
    use serde::{Deserialize, Serialize};

    // Type aliases.
    pub type MasterMsg = input::MasterMsg;

    // Input messages (child task -> main task).
    pub mod input {
        use bytes::Bytes;

        use super::*;
        use crate::network::PacketInfo;
        use crate::notify::ConsumerKind;
        use crate::packet::Packet;
        use crate::session::SessionId;

        #[derive(Debug, Deserialize, Serialize)]
        pub enum MasterMsg {
            UdpRxPacket(UdpRxPacketMsg),
            TxTimer(TxTimerMsg),
            DetectTimer(DetectTimerMsg),
            PipeWritable(PipeWritableMsg),
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct UdpRxPacketMsg {
            pub packet_info: PacketInfo,
            pub packet: Packet,
            // Raw datagram, kept around for digest verification.
            #[serde(skip)]
            pub data: Bytes,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct TxTimerMsg {
            pub sess_id: SessionId,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct DetectTimerMsg {
            pub sess_id: SessionId,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct PipeWritableMsg {
            pub kind: ConsumerKind,
        }
    }
}

// ===== BFD tasks =====

// UDP Rx task.
pub(crate) fn udp_rx(
    socket: UdpSocket,
    af: AddressFamily,
    udp_packet_rxp: &Sender<messages::input::UdpRxPacketMsg>,
    decode_error_count: Arc<AtomicU64>,
) -> Task<()> {
    #[cfg(not(feature = "testing"))]
    {
        let socket = Arc::new(socket);
        let udp_packet_rxp = udp_packet_rxp.clone();
        Task::spawn(
            async move {
                let _ = network::read_loop(
                    socket,
                    udp_packet_rxp,
                    decode_error_count,
                )
                .await;
            }
            .instrument(tracing::debug_span!("udp-rx", %af)),
        )
    }
    #[cfg(feature = "testing")]
    {
        Task::spawn(async move { std::future::pending().await })
    }
}

// Periodic transmission timer, re-armed with fresh jitter after every tick.
pub(crate) fn tx_timer(
    sess: &Session,
    interval: Duration,
    tx_timerp: &Sender<messages::input::TxTimerMsg>,
) -> TimeoutTask {
    let sess_id = sess.id;
    let tx_timerp = tx_timerp.clone();
    TimeoutTask::new(interval, move || {
        let tx_timerp = tx_timerp.clone();
        async move {
            let msg = messages::input::TxTimerMsg { sess_id };
            let _ = tx_timerp.send(msg).await;
        }
    })
}

// BFD session detection timer.
pub(crate) fn detection_timer(
    sess: &Session,
    detection_time: Duration,
    detect_timerp: &Sender<messages::input::DetectTimerMsg>,
) -> TimeoutTask {
    let sess_id = sess.id;
    let detect_timerp = detect_timerp.clone();
    TimeoutTask::new(detection_time, move || {
        let detect_timerp = detect_timerp.clone();
        async move {
            let msg = messages::input::DetectTimerMsg { sess_id };
            let _ = detect_timerp.send(msg).await;
        }
    })
}

// ===== global functions =====

// Applies transmission jitter to the negotiated interval (RFC 5880, section
// 6.8.7).
//
// The interval between transmitted packets must be jittered by up to 25%,
// i.e. drawn uniformly from [0.75 * T, T]. If the local Detect Mult is 1,
// the interval must additionally not exceed 90% of the negotiated value.
pub(crate) fn tx_jitter(interval: u32, detect_mult: u8) -> Duration {
    let interval = interval as u64;
    let floor = interval * 75 / 100;
    let ceil = if detect_mult == 1 {
        interval * 90 / 100
    } else {
        interval
    };
    let jittered = rand::rng().random_range(floor..=ceil);
    Duration::from_micros(jittered)
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_jitter_bounds() {
        for _ in 0..1000 {
            let jitter = tx_jitter(100_000, 3);
            assert!(jitter >= Duration::from_micros(75_000));
            assert!(jitter <= Duration::from_micros(100_000));
        }
    }

    #[test]
    fn tx_jitter_bounds_single_mult() {
        for _ in 0..1000 {
            let jitter = tx_jitter(100_000, 1);
            assert!(jitter >= Duration::from_micros(75_000));
            assert!(jitter <= Duration::from_micros(90_000));
        }
    }

    #[test]
    fn tx_jitter_zero_interval() {
        assert_eq!(tx_jitter(0, 3), Duration::ZERO);
    }
}
