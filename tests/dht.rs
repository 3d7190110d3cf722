//! End to end scenarios over an in-memory network.

use std::thread;
use std::time::Duration;

use kademlia_dht::{
    rpc::{Config, IdPolicy, MaintenanceTask, MemoryNetwork},
    Bytes, Dht, Id, RequestError, Testnet,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[test]
fn three_nodes_one_seed() {
    init_tracing();

    let network = MemoryNetwork::new();

    let seed = Dht::builder()
        .seed()
        .transport(Box::new(network.transport()))
        .build()
        .unwrap();

    let bootstrap = [seed.local_addr()];

    let nodes: Vec<Dht> = (0..3)
        .map(|_| {
            Dht::builder()
                .bootstrap(&bootstrap)
                .transport(Box::new(network.transport()))
                .build()
                .unwrap()
        })
        .collect();

    let (a, c) = (&nodes[0], &nodes[2]);

    let key = a.set(&b"Hello World!"[..]).unwrap();

    assert_eq!(
        c.get(&key).unwrap(),
        Some(Bytes::from_static(b"Hello World!"))
    );
}

#[test]
fn address_derived_ids() {
    let network = MemoryNetwork::new();

    let seed = Dht::builder()
        .seed()
        .id_policy(IdPolicy::FromAddress)
        .transport(Box::new(network.transport()))
        .build()
        .unwrap();

    assert_eq!(seed.id(), &Id::from_address(seed.local_addr()));
}

#[test]
fn values_expire_without_republish() {
    let config = Config {
        expire: Duration::from_millis(800),
        republish: Duration::from_millis(700),
        sweep: Duration::from_millis(50),
        ..Default::default()
    };

    let testnet = Testnet::with_config(5, config.clone()).unwrap();

    let a = Dht::builder()
        .config(config)
        .bootstrap(&testnet.bootstrap)
        .transport(Box::new(testnet.network.transport()))
        .build()
        .unwrap();

    assert!(a.cancel_maintenance(MaintenanceTask::Republish));

    let key = a.set(vec![4, 5, 6]).unwrap();

    assert_eq!(
        testnet.nodes[3].get(&key).unwrap().as_deref(),
        Some(&[4, 5, 6][..])
    );

    thread::sleep(Duration::from_millis(1200));

    assert_eq!(testnet.nodes[3].get(&key).unwrap(), None);
    assert_eq!(a.get(&key).unwrap(), None);

    // Swept.
    assert_eq!(a.info().stored_records(), 0);
    for node in &testnet.nodes {
        assert_eq!(node.info().stored_records(), 0);
    }
}

#[test]
fn republish_keeps_values_alive() {
    let config = Config {
        expire: Duration::from_millis(800),
        republish: Duration::from_millis(200),
        sweep: Duration::from_millis(50),
        ..Default::default()
    };

    let testnet = Testnet::with_config(5, config.clone()).unwrap();

    let a = Dht::builder()
        .config(config)
        .bootstrap(&testnet.bootstrap)
        .transport(Box::new(testnet.network.transport()))
        .build()
        .unwrap();

    let key = a.set(vec![7, 8, 9]).unwrap();

    thread::sleep(Duration::from_millis(1200));

    assert_eq!(
        testnet.nodes[2].get(&key).unwrap().as_deref(),
        Some(&[7, 8, 9][..])
    );
}

#[test]
fn wrong_key_width_sends_nothing() {
    let testnet = Testnet::new(3).unwrap();
    let node = &testnet.nodes[2];

    let before = testnet.network.total_sends();

    let key = Id::random(128);

    assert_eq!(
        node.get(&key),
        Err(RequestError::InvalidKeyLength {
            expected: 160,
            actual: 128
        })
    );
    assert!(node.find_node(&key).is_err());

    assert_eq!(testnet.network.total_sends(), before);
}

#[test]
fn lookups_skip_offline_nodes() {
    let config = Config {
        request_timeout: Duration::from_millis(100),
        ..Default::default()
    };

    let testnet = Testnet::with_config(6, config).unwrap();

    let offline = &testnet.nodes[5];
    testnet.network.set_offline(offline.local_addr(), true);

    let closest = testnet.nodes[1].find_node(&Id::random(160)).unwrap();

    assert_eq!(closest.len(), 4);
    assert!(closest.iter().all(|contact| contact.id() != offline.id()));
}

#[test]
fn narrow_ids() {
    let config = Config {
        bits: 64,
        k: 4,
        ..Default::default()
    };

    let testnet = Testnet::with_config(10, config).unwrap();

    let key = testnet.nodes[4].set(&b"narrow"[..]).unwrap();
    assert_eq!(key.bits(), 64);

    assert_eq!(
        testnet.nodes[7].get(&key).unwrap(),
        Some(Bytes::from_static(b"narrow"))
    );
    assert!(testnet.nodes[7].get(&Id::random(160)).is_err());
}

#[test]
fn maintenance_control() {
    let testnet = Testnet::new(4).unwrap();
    let node = &testnet.nodes[1];

    assert_eq!(node.info().scheduled(), &MaintenanceTask::ALL);

    assert!(node.cancel_maintenance(MaintenanceTask::Refresh));
    assert!(!node.info().scheduled().contains(&MaintenanceTask::Refresh));

    // Still runnable on demand.
    for task in MaintenanceTask::ALL {
        node.run_maintenance(task);
    }

    let key = node.set(vec![1]).unwrap();
    node.run_maintenance(MaintenanceTask::Replicate);
    node.run_maintenance(MaintenanceTask::Republish);

    assert_eq!(
        testnet.nodes[3].get(&key).unwrap().as_deref(),
        Some(&[1][..])
    );
}

#[test]
fn to_bootstrap() {
    let testnet = Testnet::new(4).unwrap();

    let mut bootstrap = testnet.nodes[0].to_bootstrap();
    bootstrap.sort();

    let mut expected: Vec<String> = testnet.nodes[1..]
        .iter()
        .map(|node| node.local_addr().to_string())
        .collect();
    expected.sort();

    assert_eq!(bootstrap, expected);

    let a = Dht::builder()
        .bootstrap(&bootstrap)
        .transport(Box::new(testnet.network.transport()))
        .build()
        .unwrap();

    assert_eq!(a.info().routing_table_size(), 4);
}
