//! Reply correlation
//!
//! Matches sequence ids to waiting senders so forged UDP replies from other
//! addresses cannot complete a request. Outbound entries hold the waiter's
//! notifier; inbound entries hold the reply until the woken sender collects
//! it.

use crate::wire::DataPacket;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Notify;

type CorrelationKey = (String, SocketAddr);

/// Manages the matching of sequence ids to reply waiters
#[derive(Default)]
pub struct ReplyTable {
    out_table: Mutex<HashMap<CorrelationKey, Arc<Notify>>>,
    in_table: Mutex<HashMap<CorrelationKey, DataPacket>>,
}

impl ReplyTable {
    pub fn new() -> Self {
        ReplyTable::default()
    }

    /// Record that a packet with this sequence id expects a reply from the
    /// address
    pub fn add_out_entry(&self, sequence_id: &str, address: SocketAddr, notify: Arc<Notify>) {
        self.out_table
            .lock()
            .insert((sequence_id.to_string(), address), notify);
    }

    /// Remove and return the waiter for a sequence id, if one is registered
    pub fn take_out_entry(&self, sequence_id: &str, address: SocketAddr) -> Option<Arc<Notify>> {
        self.out_table
            .lock()
            .remove(&(sequence_id.to_string(), address))
    }

    /// Store a reply packet for the woken sender to collect
    pub fn add_in_entry(&self, sequence_id: &str, address: SocketAddr, packet: DataPacket) {
        self.in_table
            .lock()
            .insert((sequence_id.to_string(), address), packet);
    }

    /// Remove and return a stored reply
    pub fn take_in_entry(&self, sequence_id: &str, address: SocketAddr) -> Option<DataPacket> {
        self.in_table
            .lock()
            .remove(&(sequence_id.to_string(), address))
    }

    /// Accept an inbound reply: if a sender is waiting on the correlation,
    /// store the packet and wake it. Unknown correlations report `false`.
    pub fn accept_reply(&self, packet: DataPacket) -> bool {
        let sequence_id = match &packet.sequence_id {
            Some(id) => id.clone(),
            None => return false,
        };

        let notify = match self.take_out_entry(&sequence_id, packet.address) {
            Some(notify) => notify,
            None => return false,
        };

        self.add_in_entry(&sequence_id, packet.address, packet);
        notify.notify_one();

        true
    }

    /// Wake every outstanding waiter so it observes an absent reply.
    ///
    /// Used at shutdown.
    pub fn signal_outstanding(&self) {
        let mut out_table = self.out_table.lock();

        for notify in out_table.values() {
            notify.notify_one();
        }

        out_table.clear();
    }

    /// Number of sends still waiting for a reply
    pub fn outstanding(&self) -> usize {
        self.out_table.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::PacketDict;
    use serde_json::Value;

    fn reply_packet(sequence_id: &str, address: SocketAddr) -> DataPacket {
        let mut payload = PacketDict::new();
        payload.insert(
            "reply_id".to_string(),
            Value::String(sequence_id.to_string()),
        );

        DataPacket::new(address, payload)
    }

    #[test]
    fn test_correlation_by_id_and_address() {
        let table = ReplyTable::new();
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let other: SocketAddr = "127.0.0.1:5001".parse().unwrap();

        table.add_out_entry("s1", addr, Arc::new(Notify::new()));

        // Same id from a different address is a forgery and is dropped
        assert!(!table.accept_reply(reply_packet("s1", other)));
        assert!(table.accept_reply(reply_packet("s1", addr)));

        // Consumed on acceptance
        assert!(!table.accept_reply(reply_packet("s1", addr)));
        assert!(table.take_in_entry("s1", addr).is_some());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_reply() {
        let table = Arc::new(ReplyTable::new());
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let notify = Arc::new(Notify::new());

        table.add_out_entry("s2", addr, notify.clone());

        let waiter = {
            let notify = notify.clone();
            tokio::spawn(async move { notify.notified().await })
        };

        table.accept_reply(reply_packet("s2", addr));
        waiter.await.unwrap();

        assert_eq!(table.outstanding(), 0);
    }

    #[test]
    fn test_signal_outstanding_clears() {
        let table = ReplyTable::new();
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        table.add_out_entry("a", addr, Arc::new(Notify::new()));
        table.add_out_entry("b", addr, Arc::new(Notify::new()));

        table.signal_outstanding();
        assert_eq!(table.outstanding(), 0);
    }
}
