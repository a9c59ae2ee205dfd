//
// Copyright (c) The Vigil Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use tracing::info;

use crate::config::{BfdConfig, InstanceCfg};
use crate::debug::Debug;
use crate::master::Master;
use crate::session::SessionKey;

// Applies a validated configuration to the live session set.
//
// Sessions are diffed by their local/peer address pair. A session whose
// tuneables changed keeps its FSM state and renegotiates via a Poll
// Sequence; a session whose authentication changed is torn down and
// recreated, since the peer relationship is no longer the same. The
// resulting events reach the consumers in a fixed order: deletes first,
// then updates, then creates.
//
// Applying the running configuration again is a no-op.
pub fn apply(master: &mut Master, new_config: BfdConfig) {
    let new_instances = new_config
        .instances
        .iter()
        .map(|instance| (instance.key(), instance.clone()))
        .collect::<BTreeMap<SessionKey, InstanceCfg>>();

    // Deleted peers: farewell packet, final event, destroy.
    let deleted_keys = master
        .sessions
        .keys()
        .filter(|key| !new_instances.contains_key(key))
        .collect::<Vec<_>>();
    for key in deleted_keys {
        delete_session(master, &key);
    }

    // Surviving peers.
    for (key, instance) in &new_instances {
        let Some((_, sess)) = master.sessions.get_mut_by_key(key) else {
            continue;
        };

        if sess.config == *instance {
            // Unchanged: leave the session alone.
            continue;
        }

        if sess.config.auth_changed(instance) {
            // The peer relationship changed identity; destroy now, recreate
            // in the create pass below.
            delete_session(master, key);
            continue;
        }

        // Keep the FSM state; a change to the timing or role tuneables is
        // renegotiated with the peer through a Poll Sequence.
        Debug::SessionConfigUpdate(&sess.key).log();
        let tuneables_changed = sess.config.tuneables_changed(instance);
        let ttl_changed = sess.config.ttl != instance.ttl;
        sess.config = instance.clone();
        if tuneables_changed {
            if ttl_changed {
                sess.update_socket_tx();
            }
            sess.poll_sequence_start();
            sess.rearm_tx_timer(&master.tx.tx_timer);
        }
    }

    // New peers (and recreations after an authentication change).
    for (key, instance) in &new_instances {
        if master.sessions.get_by_key(key).is_some() {
            continue;
        }
        create_session(master, *key, instance.clone());
    }

    master.config = new_config;
}

fn create_session(master: &mut Master, key: SessionKey, config: InstanceCfg) {
    match master.sessions.insert(key, config) {
        Ok((_, sess)) => {
            sess.update_socket_tx();
            // Schedule the first transmission.
            sess.rearm_tx_timer(&master.tx.tx_timer);
        }
        Err(error) => {
            error.log();
        }
    }
}

fn delete_session(master: &mut Master, key: &SessionKey) {
    if let Some((sess_idx, sess)) = master.sessions.get_mut_by_key(key) {
        info!(%key, "removing session");
        sess.admin_shutdown(&mut master.publisher);
        master.sessions.delete(sess_idx);
    }
}
