//! Multicast tests that need a host with a multicast-capable IPv4 route.
//!
//! Run with:
//! ```sh
//! cargo test --features integration-multicast --test multicast_loopback
//! ```

#![cfg(feature = "integration-multicast")]

mod common;

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::rr::RecordType;
use parking_lot::Mutex;

use mdns_querier::config::{Config, ExecutorsConfig, NetworkConfig};
use mdns_querier::listener::ListenerResult;
use mdns_querier::net::multicast::GROUP_V4;
use mdns_querier::net::{MulticastProcessor, NetworkProcessor, Packet, PacketListener};
use mdns_querier::querier::multicast::MulticastQuerier;
use mdns_querier::querier::{MulticastDnsQuerier, Querier, Resolver};
use mdns_querier::Executors;

use common::*;

const TEST_PORT: u16 = 25353;
const ANY_V4: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
const IP_A: Ipv4Addr = Ipv4Addr::new(192, 168, 7, 1);

#[derive(Default)]
struct CollectingListener {
    packets: Mutex<Vec<Packet>>,
}

impl PacketListener for CollectingListener {
    fn packet_received(&self, packet: &Packet) -> ListenerResult {
        self.packets.lock().push(packet.clone());
        Ok(())
    }
}

fn test_config(port: u16) -> Config {
    let mut config = Config::default();
    config.querier.ipv6 = false;
    config.querier.multicast_port = port;
    config.querier.nameservers = vec!["127.0.0.1:9".parse().unwrap()];
    config.querier.response_wait_ms = 200;
    config.querier.timeout_ms = 1000;
    config
}

// =========================================================================
// Processor
// =========================================================================

#[test]
fn processor_sees_its_own_packets_with_loopback() {
    let executors = Executors::new(&ExecutorsConfig::default()).unwrap();
    let listener = Arc::new(CollectingListener::default());
    let processor = MulticastProcessor::open(
        ANY_V4,
        IpAddr::V4(GROUP_V4),
        TEST_PORT,
        listener.clone(),
        Arc::clone(&executors),
        &NetworkConfig::default(),
    )
    .unwrap();
    processor.start().unwrap();
    assert!(processor.is_operational());

    let message = build_response(0, vec![a_record(HOST, IP_A)]);
    processor.send(&message.to_vec().unwrap()).unwrap();

    assert!(wait_for(Duration::from_secs(2), || !listener.packets.lock().is_empty()));
    let decoded = listener.packets.lock()[0].decode().unwrap();
    assert_eq!(extract_a_ips(&decoded), vec![IpAddr::V4(IP_A)]);

    processor.close();
    assert!(!processor.is_operational());
    executors.shutdown();
}

#[test]
fn closed_processor_releases_its_port() {
    let executors = Executors::new(&ExecutorsConfig::default()).unwrap();
    let port = TEST_PORT + 3;
    let processor = MulticastProcessor::open(
        ANY_V4,
        IpAddr::V4(GROUP_V4),
        port,
        Arc::new(CollectingListener::default()),
        Arc::clone(&executors),
        &NetworkConfig::default(),
    )
    .unwrap();
    processor.start().unwrap();
    assert_eq!(processor.local_addr().port(), port);

    // A plain bind without SO_REUSEADDR collides with the open socket.
    assert!(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).is_err());

    processor.close();
    assert_eq!(processor.local_addr().port(), port);
    assert!(processor.send(b"late").is_ok());
    assert!(processor.start().is_err());
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).unwrap();
    executors.shutdown();
}

// =========================================================================
// Queriers
// =========================================================================

#[test]
fn multicast_querier_broadcast_reaches_registered_listener() {
    let executors = Executors::new(&ExecutorsConfig::default()).unwrap();
    let querier =
        MulticastQuerier::open(ANY_V4, &test_config(TEST_PORT + 1), Arc::clone(&executors))
            .unwrap();
    let listener = RecordingListener::new();
    querier.register_listener(listener.clone()).unwrap();

    querier
        .broadcast(&build_response(0, vec![a_record(HOST, IP_A)]), true)
        .unwrap();
    assert!(wait_for(Duration::from_secs(2), || listener.response_count() >= 1));

    querier.close();
    executors.shutdown();
}

#[test]
fn composite_query_on_quiet_network_returns_nxdomain() {
    let executors = Executors::new(&ExecutorsConfig::default()).unwrap();
    let querier =
        MulticastDnsQuerier::new(&test_config(TEST_PORT + 2), Arc::clone(&executors)).unwrap();
    assert_eq!(querier.multicast_count(), 1);

    // Our own looped-back query is not a response and is ignored.
    let response = querier
        .send(&build_query("nobody-here.local.", RecordType::A, 77))
        .unwrap();
    assert!(response.answers().is_empty());

    querier.close();
    executors.shutdown();
}
