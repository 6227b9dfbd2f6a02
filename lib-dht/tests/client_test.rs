//! Whole-node assembly tests

use lib_dht::{Client, NodeConfig};
use lib_keys::KeyBytes;
use std::time::Duration;
use tempfile::TempDir;

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    panic!("timed out waiting for {}", what);
}

fn local_config(cache_dir: &TempDir) -> NodeConfig {
    let mut config = NodeConfig::new(cache_dir.path().to_path_buf());
    config.listen_address = "127.0.0.1:0".parse().unwrap();
    config
}

#[tokio::test]
async fn test_shared_file_is_served_over_the_network() {
    let share_dir = TempDir::new().unwrap();
    let cache_b = TempDir::new().unwrap();
    let cache_a = TempDir::new().unwrap();

    let contents = b"a file worth sharing with the network".to_vec();
    std::fs::write(share_dir.path().join("shared.bin"), &contents).unwrap();

    let mut config_b = local_config(&cache_b);
    config_b.shared_directories = vec![share_dir.path().to_path_buf()];
    let b = Client::start(config_b).await.unwrap();

    // Wait for the sharing node to finish hashing
    {
        let table = b.shared_files_table().clone();
        wait_for("directory hashing", move || {
            table.num_files().unwrap_or(0) == 1
        })
        .await;
    }

    let mut config_a = local_config(&cache_a);
    config_a.known_node_address = Some(b.address());
    let a = Client::start(config_a).await.unwrap();

    {
        let dht = a.dht().clone();
        wait_for("join to seed the routing table", move || {
            dht.routing_table().num_contacts() > 0
        })
        .await;
    }

    // A single-part file is addressed by its own content hash
    let part_hash = KeyBytes::new_hash(&contents);
    let downloaded = a
        .dht()
        .get_value(&part_hash, &part_hash)
        .result()
        .await
        .expect("shared part should download");

    assert_eq!(downloaded, contents);

    // The sharing node also reports a file-info pair under the same key
    let found = a
        .dht()
        .find_value_from_node(&b.dht().node(), &part_hash, None)
        .result()
        .await
        .expect("reply expected");
    let infos = found.kvp_infos.expect("value infos expected");

    assert_eq!(infos.len(), 2);

    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_stop_shuts_the_node_down() {
    let cache = TempDir::new().unwrap();
    let client = Client::start(local_config(&cache)).await.unwrap();

    let address = client.address();
    client.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A fresh node can take over cleanly; the old socket is released
    let probe = tokio::net::UdpSocket::bind(address).await;
    assert!(probe.is_ok());
}
