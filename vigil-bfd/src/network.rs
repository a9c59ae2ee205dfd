//
// Copyright (c) The Vigil Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;
use vigil_utils::ip::AddressFamily;
use vigil_utils::socket::UdpSocket;

#[cfg(not(feature = "testing"))]
use {
    crate::error::{Error, IoError},
    crate::packet::Packet,
    crate::tasks::messages::input::UdpRxPacketMsg,
    bytes::Bytes,
    nix::sys::socket::{self, ControlMessageOwned},
    std::io::IoSliceMut,
    std::net::{SocketAddrV4, SocketAddrV6},
    std::ops::Deref,
    std::os::fd::AsRawFd,
    std::sync::atomic,
    vigil_utils::ip::IpAddrExt,
    vigil_utils::socket::{SocketExt, UdpSocketExt},
};

// BFD control packets travel over UDP port 3784 (RFC 5881); the echo port
// is not used.
pub const PORT_DST: u16 = 3784;
pub const PORT_SRC_RANGE: std::ops::RangeInclusive<u16> = 49152..=65535;

// Ancillary data about a received packet.
#[derive(Clone, Copy, Debug)]
#[derive(Deserialize, Serialize)]
pub struct PacketInfo {
    pub src: SocketAddr,
    pub dst: IpAddr,
    pub ttl: u8,
}

// Creates the shared Rx socket for the given address family.
pub(crate) fn socket_rx(
    af: AddressFamily,
) -> Result<UdpSocket, std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        let addr = IpAddr::unspecified(af);
        let sockaddr = SocketAddr::from((addr, PORT_DST));
        let socket = UdpSocket::bind_reuseaddr(sockaddr)?;

        // Set socket options.
        //
        // The received TTL travels up as ancillary data; the GTSM check
        // (RFC 5082) is done per session against its configured TTL
        // requirement, since the shared Rx socket serves sessions with
        // different requirements.
        match af {
            AddressFamily::Ipv4 => {
                socket.set_ipv4_pktinfo(true)?;
                socket.set_ipv4_recvttl(true)?;
            }
            AddressFamily::Ipv6 => {
                socket.set_ipv6_pktinfo(true)?;
                socket.set_ipv6_recvhoplimit(true)?;
            }
        }

        Ok(socket)
    }
    #[cfg(feature = "testing")]
    {
        Ok(UdpSocket::default())
    }
}

// Creates the per-session Tx socket, bound to the session's local address.
pub(crate) fn socket_tx(
    addr: IpAddr,
    ttl: u8,
) -> Result<UdpSocket, std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        // RFC 5881 says the following:
        // "The source port MUST be in the range 49152 through 65535.  The
        // same UDP source port number MUST be used for all BFD Control
        // packets associated with a particular session.  The source port
        // number SHOULD be unique among all BFD sessions on the system".
        //
        // For simplicity's sake, use the first port of the range for all
        // sessions. The remote peer matches incoming packets to sessions by
        // discriminator or address, never by source port.
        let port = *PORT_SRC_RANGE.start();
        let sockaddr = SocketAddr::from((addr, port));
        let socket = UdpSocket::bind_reuseaddr(sockaddr)?;

        // Set socket options.
        match addr.address_family() {
            AddressFamily::Ipv4 => {
                socket.set_ipv4_tos(libc::IPTOS_PREC_INTERNETCONTROL)?;
                socket.set_ipv4_ttl(ttl)?;
            }
            AddressFamily::Ipv6 => {
                socket.set_ipv6_tclass(libc::IPTOS_PREC_INTERNETCONTROL)?;
                socket.set_ipv6_unicast_hops(ttl)?;
            }
        }

        Ok(socket)
    }
    #[cfg(feature = "testing")]
    {
        Ok(UdpSocket::default())
    }
}

// Encodes and sends one BFD control packet.
//
// The Tx sockets are nonblocking; a send that would block is dropped and
// counted, surfacing at the peer as nothing worse than a missed interval.
pub(crate) fn send_packet(
    socket: &UdpSocket,
    sockaddr: SocketAddr,
    packet: crate::packet::Packet,
    key: Option<&[u8]>,
    statistics: &mut crate::session::SessionStatistics,
) {
    let buf = packet.encode(key);

    match socket.try_send_to(&buf, sockaddr) {
        Ok(_) => {
            statistics.tx_packet_count += 1;
        }
        Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
            statistics.tx_error_count += 1;
        }
        Err(error) => {
            crate::error::IoError::UdpSendError(error).log();
            statistics.tx_error_count += 1;
        }
    }
}

#[cfg(not(feature = "testing"))]
fn get_packet_src(sa: Option<&socket::SockaddrStorage>) -> Option<SocketAddr> {
    sa.and_then(|sa| {
        sa.as_sockaddr_in()
            .map(|sa| SocketAddrV4::from(*sa).into())
            .or_else(|| {
                sa.as_sockaddr_in6()
                    .map(|sa| SocketAddrV6::from(*sa).into())
            })
    })
}

#[cfg(not(feature = "testing"))]
fn get_packet_dst_ttl(
    cmsgs: socket::CmsgIterator<'_>,
) -> (Option<IpAddr>, Option<u8>) {
    let mut dst = None;
    let mut ttl = None;

    for cmsg in cmsgs {
        match cmsg {
            ControlMessageOwned::Ipv4PacketInfo(pktinfo) => {
                dst = Some(
                    Ipv4Addr::from(pktinfo.ipi_spec_dst.s_addr.to_be()).into(),
                );
            }
            ControlMessageOwned::Ipv6PacketInfo(pktinfo) => {
                dst = Some(Ipv6Addr::from(pktinfo.ipi6_addr.s6_addr).into());
            }
            ControlMessageOwned::Ipv4Ttl(hops) => {
                ttl = Some(hops as u8);
            }
            ControlMessageOwned::Ipv6HopLimit(hops) => {
                ttl = Some(hops as u8);
            }
            _ => {}
        }
    }

    (dst, ttl)
}

#[cfg(not(feature = "testing"))]
pub(crate) async fn read_loop(
    socket: Arc<UdpSocket>,
    udp_packet_rxp: Sender<UdpRxPacketMsg>,
    decode_error_count: Arc<AtomicU64>,
) -> Result<(), tokio::sync::mpsc::error::SendError<UdpRxPacketMsg>> {
    let mut buf = [0; 1024];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsgspace = nix::cmsg_space!(libc::in6_pktinfo, libc::c_int);

    loop {
        // Receive data from the network.
        match socket
            .async_io(tokio::io::Interest::READABLE, || {
                match socket::recvmsg::<socket::SockaddrStorage>(
                    socket.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsgspace),
                    socket::MsgFlags::empty(),
                ) {
                    Ok(msg) => {
                        // Retrieve source address, destination address and
                        // TTL of the packet.
                        let src = get_packet_src(msg.address.as_ref());
                        let (dst, ttl) =
                            get_packet_dst_ttl(msg.cmsgs().unwrap());
                        Ok((src, dst, ttl, msg.bytes))
                    }
                    Err(errno) => Err(errno.into()),
                }
            })
            .await
        {
            Ok((src, dst, ttl, bytes)) => {
                let src = match src {
                    Some(addr) => addr,
                    None => {
                        IoError::UdpRecvMissingSourceAddr.log();
                        continue;
                    }
                };
                let (dst, ttl) = match (dst, ttl) {
                    (Some(dst), Some(ttl)) => (dst, ttl),
                    _ => {
                        IoError::UdpRecvMissingAncillaryData.log();
                        continue;
                    }
                };

                // Validate packet's source address.
                if !src.ip().is_usable() {
                    Error::UdpInvalidSourceAddr(src.ip()).log();
                    continue;
                }

                // Decode packet, counting and discarding malformed ones.
                let data = Bytes::copy_from_slice(&iov[0].deref()[0..bytes]);
                let packet = match Packet::decode(&data) {
                    Ok(packet) => packet,
                    Err(error) => {
                        decode_error_count
                            .fetch_add(1, atomic::Ordering::Relaxed);
                        Error::UdpPacketDecodeError(error).log();
                        continue;
                    }
                };

                // Notify the master task about the received packet.
                let packet_info = PacketInfo { src, dst, ttl };
                let msg = UdpRxPacketMsg {
                    packet_info,
                    packet,
                    data,
                };
                udp_packet_rxp.send(msg).await?;
            }
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {
                // Retry if the syscall was interrupted (EINTR).
                continue;
            }
            Err(error) => {
                IoError::UdpRecvError(error).log();
            }
        }
    }
}
