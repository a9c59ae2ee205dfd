//
// Copyright (c) The Vigil Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::VecDeque;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;
#[cfg(not(feature = "testing"))]
use {
    crate::error::IoError, std::path::Path, std::sync::Arc,
    tokio::net::unix::pipe, tracing::Instrument, vigil_utils::task::Task,
};

use crate::debug::Debug;
use crate::packet::DiagnosticCode;
use crate::session::Session;
use crate::tasks::messages::input::PipeWritableMsg;

// Fixed-size state-change record written to the consumer pipes.
pub const RECORD_LEN: usize = 28;

// Per-consumer bounded backlog; once full, the oldest record is discarded.
pub const EVENT_QUEUE_DEPTH: usize = 1024;

// State-change notification kinds, as encoded on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum EventKind {
    Up = 1,
    Down = 2,
    Admin = 3,
}

// A state-change notification, before encoding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub local_discr: u32,
    pub diag: u8,
    pub peer: IpAddr,
}

// The sibling daemons fed by this publisher.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ConsumerKind {
    Vrrp,
    Checker,
}

// Bounded drop-oldest FIFO of encoded records.
#[derive(Debug)]
pub struct EventQueue {
    records: VecDeque<[u8; RECORD_LEN]>,
    capacity: usize,
    pub overflow_count: u64,
}

#[derive(Debug)]
struct Consumer {
    kind: ConsumerKind,
    #[cfg(not(feature = "testing"))]
    pipe: Arc<pipe::Sender>,
    queue: EventQueue,
    // Task waiting for the pipe to drain, armed only while a backlog
    // exists.
    #[cfg(not(feature = "testing"))]
    drain_task: Option<Task<()>>,
}

// Fan-out point for state-change notifications.
//
// Writes never block: a record that does not fit in the pipe goes to the
// consumer's backlog, and the master loop flushes the backlog when the
// consumer catches up. The daemon never waits on its consumers.
#[derive(Debug)]
pub struct Publisher {
    writablep: Sender<PipeWritableMsg>,
    consumers: Vec<Consumer>,
    #[cfg(feature = "testing")]
    pub published: Vec<Event>,
}

// ===== impl Event =====

impl Event {
    pub(crate) fn up(sess: &Session) -> Event {
        Event {
            kind: EventKind::Up,
            local_discr: sess.state.local_discr,
            diag: DiagnosticCode::Nothing as u8,
            peer: sess.key.peer,
        }
    }

    pub(crate) fn down(sess: &Session, diag: DiagnosticCode) -> Event {
        Event {
            kind: EventKind::Down,
            local_discr: sess.state.local_discr,
            diag: diag as u8,
            peer: sess.key.peer,
        }
    }

    pub(crate) fn admin(sess: &Session) -> Event {
        Event {
            kind: EventKind::Admin,
            local_discr: sess.state.local_discr,
            diag: DiagnosticCode::AdminDown as u8,
            peer: sess.key.peer,
        }
    }

    // Encodes the event into its fixed-size little-endian record.
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut record = [0; RECORD_LEN];
        record[0..4].copy_from_slice(&(self.kind as u32).to_le_bytes());
        record[4..8].copy_from_slice(&self.local_discr.to_le_bytes());
        record[8] = self.diag;
        match self.peer {
            IpAddr::V4(addr) => {
                record[9] = 1;
                // IPv4 addresses are left-padded with zeros.
                record[24..28].copy_from_slice(&addr.octets());
            }
            IpAddr::V6(addr) => {
                record[9] = 2;
                record[12..28].copy_from_slice(&addr.octets());
            }
        }
        record
    }
}

// ===== impl ConsumerKind =====

impl std::fmt::Display for ConsumerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumerKind::Vrrp => write!(f, "vrrp"),
            ConsumerKind::Checker => write!(f, "checker"),
        }
    }
}

// ===== impl EventQueue =====

impl EventQueue {
    pub fn new(capacity: usize) -> EventQueue {
        EventQueue {
            records: VecDeque::new(),
            capacity,
            overflow_count: 0,
        }
    }

    // Appends a record, discarding the oldest one when the queue is full.
    pub fn push(&mut self, record: [u8; RECORD_LEN]) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
            self.overflow_count += 1;
        }
        self.records.push_back(record);
    }

    pub fn front(&self) -> Option<&[u8; RECORD_LEN]> {
        self.records.front()
    }

    pub fn pop_front(&mut self) -> Option<[u8; RECORD_LEN]> {
        self.records.pop_front()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ===== impl Consumer =====

impl Consumer {
    // Hands one record to the consumer: straight into the pipe when there
    // is no backlog, into the backlog otherwise.
    fn offer(&mut self, record: &[u8; RECORD_LEN]) {
        #[cfg(not(feature = "testing"))]
        if self.queue.is_empty() {
            match self.pipe.try_write(record) {
                // Records are smaller than PIPE_BUF, so pipe writes are
                // all-or-nothing.
                Ok(_) => return,
                Err(error)
                    if error.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(error) => {
                    IoError::PipeWriteError(error).log();
                }
            }
        }
        self.queue.push(*record);
    }

    // Drains as much backlog as the pipe accepts right now.
    #[cfg(not(feature = "testing"))]
    fn flush(&mut self) {
        while let Some(record) = self.queue.front() {
            match self.pipe.try_write(record) {
                Ok(_) => {
                    self.queue.pop_front();
                }
                Err(error)
                    if error.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    break;
                }
                Err(error) => {
                    IoError::PipeWriteError(error).log();
                    break;
                }
            }
        }
    }

    // Arms the task that notifies the master loop once the pipe has room
    // again.
    #[cfg(not(feature = "testing"))]
    fn arm_drain_task(&mut self, writablep: &Sender<PipeWritableMsg>) {
        let kind = self.kind;
        let pipe = self.pipe.clone();
        let writablep = writablep.clone();
        self.drain_task = Some(Task::spawn(
            async move {
                if pipe.writable().await.is_ok() {
                    let msg = PipeWritableMsg { kind };
                    let _ = writablep.send(msg).await;
                }
            }
            .in_current_span(),
        ));
    }
}

// ===== impl Publisher =====

impl Publisher {
    pub(crate) fn new(writablep: Sender<PipeWritableMsg>) -> Publisher {
        Publisher {
            writablep,
            consumers: Vec::new(),
            #[cfg(feature = "testing")]
            published: Vec::new(),
        }
    }

    // Opens the write end of a consumer FIFO.
    //
    // The FIFO is opened in read-write mode so that the BFD daemon can come
    // up before (or independently of) its consumers.
    #[cfg(not(feature = "testing"))]
    pub fn add_consumer(
        &mut self,
        kind: ConsumerKind,
        path: &Path,
    ) -> Result<(), IoError> {
        let pipe = pipe::OpenOptions::new()
            .read_write(true)
            .open_sender(path)
            .map_err(IoError::PipeOpenError)?;
        self.consumers.push(Consumer {
            kind,
            pipe: Arc::new(pipe),
            queue: EventQueue::new(EVENT_QUEUE_DEPTH),
            drain_task: None,
        });
        Ok(())
    }

    // Delivers one event to every consumer.
    pub(crate) fn publish(&mut self, event: Event) {
        Debug::EventPublish(&event).log();

        #[cfg(feature = "testing")]
        self.published.push(event);

        let record = event.encode();
        for consumer in &mut self.consumers {
            consumer.offer(&record);
            #[cfg(not(feature = "testing"))]
            if !consumer.queue.is_empty() && consumer.drain_task.is_none() {
                consumer.arm_drain_task(&self.writablep);
            }
        }
    }

    // Flushes the backlog of the given consumer, re-arming the drain task
    // if the pipe filled up again.
    #[cfg(not(feature = "testing"))]
    pub(crate) fn flush(&mut self, kind: ConsumerKind) {
        if let Some(consumer) =
            self.consumers.iter_mut().find(|consumer| consumer.kind == kind)
        {
            consumer.drain_task = None;
            consumer.flush();
            if !consumer.queue.is_empty() {
                consumer.arm_drain_task(&self.writablep);
            }
        }
    }

    // Overflow counters, for the administrative dump.
    pub(crate) fn overflow_counts(
        &self,
    ) -> impl Iterator<Item = (ConsumerKind, u64)> + '_ {
        self.consumers
            .iter()
            .map(|consumer| (consumer.kind, consumer.queue.overflow_count))
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn record_encoding_ipv4() {
        let event = Event {
            kind: EventKind::Down,
            local_discr: 0x01020304,
            diag: 1,
            peer: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        };
        let record = event.encode();

        assert_eq!(record.len(), RECORD_LEN);
        assert_eq!(&record[0..4], &[2, 0, 0, 0]);
        assert_eq!(&record[4..8], &[4, 3, 2, 1]);
        assert_eq!(record[8], 1);
        assert_eq!(record[9], 1);
        assert_eq!(&record[10..12], &[0, 0]);
        assert_eq!(&record[12..24], &[0; 12]);
        assert_eq!(&record[24..28], &[192, 0, 2, 1]);
    }

    #[test]
    fn record_encoding_ipv6() {
        let peer: IpAddr = "2001:db8::1".parse().unwrap();
        let event = Event {
            kind: EventKind::Up,
            local_discr: 1,
            diag: 0,
            peer,
        };
        let record = event.encode();

        assert_eq!(&record[0..4], &[1, 0, 0, 0]);
        assert_eq!(record[9], 2);
        assert_eq!(record[12], 0x20);
        assert_eq!(record[13], 0x01);
        assert_eq!(record[27], 0x01);
    }

    #[test]
    fn queue_overflow_drops_oldest() {
        let mut queue = EventQueue::new(1024);

        for i in 0..1025u32 {
            let mut record = [0; RECORD_LEN];
            record[0..4].copy_from_slice(&i.to_le_bytes());
            queue.push(record);
        }

        // The first record was discarded; the rest drain in order.
        assert_eq!(queue.len(), 1024);
        assert_eq!(queue.overflow_count, 1);
        for i in 1..1025u32 {
            let record = queue.pop_front().unwrap();
            assert_eq!(record[0..4], i.to_le_bytes());
        }
        assert!(queue.is_empty());
    }
}
