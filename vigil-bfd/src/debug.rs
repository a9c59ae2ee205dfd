//
// Copyright (c) The Vigil Project Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::{debug, debug_span};

use crate::notify::Event;
use crate::packet::State;
use crate::session::SessionKey;

// BFD debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    SessionCreate(&'a SessionKey, u32),
    SessionDelete(&'a SessionKey, u32),
    SessionConfigUpdate(&'a SessionKey),
    FsmTransition(&'a SessionKey, State, State),
    DetectionTimeExpiry(&'a SessionKey),
    PollSequenceTerminate(&'a SessionKey),
    EventPublish(&'a Event),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::SessionCreate(sess_key, discr)
            | Debug::SessionDelete(sess_key, discr) => {
                debug_span!("session", key = %sess_key, %discr).in_scope(
                    || {
                        debug!("{}", self);
                    },
                );
            }
            Debug::SessionConfigUpdate(sess_key)
            | Debug::DetectionTimeExpiry(sess_key)
            | Debug::PollSequenceTerminate(sess_key) => {
                debug_span!("session", key = %sess_key).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::FsmTransition(sess_key, old_state, new_state) => {
                debug_span!("session", key = %sess_key).in_scope(|| {
                    debug!(?old_state, ?new_state, "{}", self);
                });
            }
            Debug::EventPublish(event) => {
                debug!(?event, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::SessionCreate(..) => {
                write!(f, "session created")
            }
            Debug::SessionDelete(..) => {
                write!(f, "session deleted")
            }
            Debug::SessionConfigUpdate(..) => {
                write!(f, "session configuration updated")
            }
            Debug::FsmTransition(..) => {
                write!(f, "state transition")
            }
            Debug::DetectionTimeExpiry(..) => {
                write!(f, "detection timer expired")
            }
            Debug::PollSequenceTerminate(..) => {
                write!(f, "poll sequence terminated")
            }
            Debug::EventPublish(..) => {
                write!(f, "publishing state-change event")
            }
        }
    }
}
