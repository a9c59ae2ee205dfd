//
// Copyright (c) The Vigil Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, SocketAddr};

use tracing::{debug, info, warn};

use crate::auth::AuthError;
use crate::packet::{DecodeError, PacketFlags};
use crate::session::SessionId;

// BFD errors.
#[derive(Debug)]
pub enum Error {
    // I/O errors
    IoError(IoError),
    // Inter-task communication
    SessionIdNotFound(SessionId),
    // Packet input
    UdpInvalidSourceAddr(IpAddr),
    UdpPacketDecodeError(DecodeError),
    SessionNoMatch(SocketAddr, u32),
    TtlTooLow(SocketAddr, u8),
    InvalidFlags(PacketFlags),
    AuthFailure(AuthError),
    // Resource exhaustion
    DiscriminatorsExhausted,
}

// BFD I/O errors.
#[derive(Debug)]
pub enum IoError {
    UdpSocketError(std::io::Error),
    UdpRecvError(std::io::Error),
    UdpSendError(std::io::Error),
    UdpRecvMissingSourceAddr,
    UdpRecvMissingAncillaryData,
    PipeOpenError(std::io::Error),
    PipeWriteError(std::io::Error),
    SignalSetupError(std::io::Error),
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::IoError(error) => {
                error.log();
            }
            Error::SessionIdNotFound(sess_id) => {
                warn!(?sess_id, "{}", self);
            }
            // Per-packet noise stays at debug level; the counters tell the
            // aggregate story.
            Error::UdpInvalidSourceAddr(addr) => {
                debug!(address = %addr, "{}", self);
            }
            Error::UdpPacketDecodeError(error) => {
                debug!(error = %with_source(error), "{}", self);
            }
            Error::SessionNoMatch(src, your_discr) => {
                debug!(%src, %your_discr, "{}", self);
            }
            Error::TtlTooLow(src, ttl) => {
                debug!(%src, %ttl, "{}", self);
            }
            Error::InvalidFlags(flags) => {
                debug!(?flags, "{}", self);
            }
            Error::AuthFailure(error) => {
                info!(reason = %error, "{}", self);
            }
            Error::DiscriminatorsExhausted => {
                warn!("{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(error) => error.fmt(f),
            Error::SessionIdNotFound(..) => {
                write!(f, "session ID not found")
            }
            Error::UdpInvalidSourceAddr(..) => {
                write!(f, "invalid source address")
            }
            Error::UdpPacketDecodeError(..) => {
                write!(f, "failed to decode packet")
            }
            Error::SessionNoMatch(..) => {
                write!(f, "failed to find session")
            }
            Error::TtlTooLow(..) => {
                write!(f, "received packet below the TTL requirement")
            }
            Error::InvalidFlags(..) => {
                write!(f, "received invalid flags")
            }
            Error::AuthFailure(..) => {
                write!(f, "failed to authenticate packet")
            }
            Error::DiscriminatorsExhausted => {
                write!(f, "no local discriminator available")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(error) => Some(error),
            Error::UdpPacketDecodeError(error) => Some(error),
            Error::AuthFailure(error) => Some(error),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Error {
        Error::IoError(error)
    }
}

impl From<AuthError> for Error {
    fn from(error: AuthError) -> Error {
        Error::AuthFailure(error)
    }
}

// ===== impl IoError =====

impl IoError {
    pub(crate) fn log(&self) {
        match self {
            IoError::UdpSocketError(error)
            | IoError::UdpRecvError(error)
            | IoError::UdpSendError(error)
            | IoError::PipeOpenError(error)
            | IoError::PipeWriteError(error)
            | IoError::SignalSetupError(error) => {
                warn!(error = %with_source(error), "{}", self);
            }
            IoError::UdpRecvMissingSourceAddr
            | IoError::UdpRecvMissingAncillaryData => {
                warn!("{}", self);
            }
        }
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoError::UdpSocketError(..) => {
                write!(f, "failed to create UDP socket")
            }
            IoError::UdpRecvError(..) => {
                write!(f, "failed to receive UDP packet")
            }
            IoError::UdpSendError(..) => {
                write!(f, "failed to send UDP packet")
            }
            IoError::UdpRecvMissingSourceAddr => {
                write!(
                    f,
                    "failed to retrieve source address from received packet"
                )
            }
            IoError::UdpRecvMissingAncillaryData => {
                write!(
                    f,
                    "failed to retrieve ancillary data from received packet"
                )
            }
            IoError::PipeOpenError(..) => {
                write!(f, "failed to open event pipe")
            }
            IoError::PipeWriteError(..) => {
                write!(f, "failed to write to event pipe")
            }
            IoError::SignalSetupError(..) => {
                write!(f, "failed to install signal handler")
            }
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoError::UdpSocketError(error)
            | IoError::UdpRecvError(error)
            | IoError::UdpSendError(error)
            | IoError::PipeOpenError(error)
            | IoError::PipeWriteError(error)
            | IoError::SignalSetupError(error) => Some(error),
            _ => None,
        }
    }
}

// ===== global functions =====

fn with_source<E: std::error::Error>(error: E) -> String {
    if let Some(source) = error.source() {
        format!("{} ({})", error, with_source(source))
    } else {
        error.to_string()
    }
}
