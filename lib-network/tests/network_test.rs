//! Two-node loopback tests for the network layer

use lib_events::EventReactor;
use lib_network::wire::json_keys;
use lib_network::{DataPacket, Network, PacketDict, PacketReceiver};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

async fn start_network() -> (Arc<EventReactor>, Arc<Network>) {
    let reactor = EventReactor::new(100);
    let network = Network::new(reactor.clone(), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    {
        let reactor = reactor.clone();
        tokio::spawn(async move { reactor.run().await });
    }

    (reactor, network)
}

/// Replies to every fresh packet with a fixed payload
struct EchoReceiver {
    network: Arc<Network>,
    reply_with: PacketDict,
}

impl PacketReceiver for EchoReceiver {
    fn receive_packet(&self, packet: DataPacket) {
        let _ = self.network.send_answer_reply(&packet, self.reply_with.clone());
    }
}

fn payload(pairs: &[(&str, Value)]) -> PacketDict {
    let mut map = PacketDict::new();

    for (key, value) in pairs {
        map.insert(key.to_string(), value.clone());
    }

    map
}

#[tokio::test]
async fn test_request_reply_round_trip() {
    let (_reactor_a, network_a) = start_network().await;
    let (_reactor_b, network_b) = start_network().await;

    let receiver: Arc<dyn PacketReceiver> = Arc::new(EchoReceiver {
        network: network_b.clone(),
        reply_with: payload(&[("pong", Value::from(1))]),
    });
    network_b.set_receive_handler(&receiver);

    let task = network_a
        .send_expect_reply(
            network_b.server_address(),
            payload(&[("rpc", Value::from("ping"))]),
            Duration::from_secs(5),
        )
        .unwrap();

    let reply = task.result().await.expect("reply expected");
    assert_eq!(reply.payload.get("pong"), Some(&Value::from(1)));
    assert_eq!(reply.address, network_b.server_address());
}

#[tokio::test]
async fn test_missing_reply_is_absent_not_error() {
    let (_reactor_a, network_a) = start_network().await;

    // A socket that never answers
    let deaf = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let task = network_a
        .send_expect_reply(
            deaf.local_addr().unwrap(),
            payload(&[("rpc", Value::from("ping"))]),
            Duration::from_millis(200),
        )
        .unwrap();

    assert!(task.result().await.is_none());
}

#[tokio::test]
async fn test_chunked_transfer_round_trip() {
    let (_reactor_a, network_a) = start_network().await;
    let (_reactor_b, network_b) = start_network().await;

    let data: Vec<u8> = std::iter::repeat([0x0Fu8, 0xF0])
        .take(10_000)
        .flatten()
        .collect();
    assert_eq!(data.len(), 20_000);

    let download = network_b.expect_incoming_transfer("xfer-1", Duration::from_secs(5), None);

    let upload = network_a.send_bytes(
        network_b.server_address(),
        "xfer-1",
        data.clone(),
        Duration::from_secs(5),
    );

    let received = download.task().result().await;
    let sent = upload.result().await;

    assert_eq!(received, data);
    assert_eq!(sent, 20_000);
}

#[tokio::test]
async fn test_transfer_inactivity_times_out() {
    let (_reactor_b, network_b) = start_network().await;

    let download = network_b.expect_incoming_transfer("xfer-2", Duration::from_millis(100), None);

    // Nothing ever arrives; the sweep terminates the download with what it has
    let received = download.task().result().await;
    assert!(received.is_empty());
}

#[tokio::test]
async fn test_stop_cancels_outstanding_sends() {
    let (reactor_a, network_a) = start_network().await;

    let deaf = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let task = network_a
        .send_expect_reply(
            deaf.local_addr().unwrap(),
            payload(&[("rpc", Value::from("ping"))]),
            Duration::from_secs(60),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    reactor_a.put_stop().unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), task.result())
        .await
        .expect("send task should observe shutdown");
    assert!(result.is_none());
}

#[tokio::test]
async fn test_unknown_transfer_chunks_are_discarded() {
    let (_reactor_a, network_a) = start_network().await;
    let (_reactor_b, network_b) = start_network().await;

    // No expect_incoming_transfer on B for this id
    let upload = network_a.send_bytes(
        network_b.server_address(),
        "unknown-xfer",
        vec![1u8; 100],
        Duration::from_millis(200),
    );

    // Nothing acknowledged
    assert_eq!(upload.result().await, 0);

    // B still works afterwards
    let _ = network_b.send(
        network_a.server_address(),
        payload(&[(json_keys::TRANSFER_ID, Value::from("noop"))]),
    );
}
