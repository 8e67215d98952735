use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use ipnet::IpNet;

use crate::db::Catalog;
use crate::models::SshKey;
use crate::router::Router;
use crate::tests::test_utils::TestCatalog;

const SOURCE_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7));

fn router(tc: &TestCatalog, restricted: &[&str]) -> Router {
    let catalog: Arc<dyn Catalog> = tc.catalog.clone();
    let networks = restricted
        .iter()
        .map(|net| net.parse::<IpNet>().unwrap())
        .collect();
    Router::new(catalog, networks)
}

fn ssh_key(target_host: &str, target_port: i32, target_user: &str) -> SshKey {
    SshKey {
        id: 1,
        fingerprint: String::from("SHA256:router-test"),
        username: String::from("alice"),
        target_host: target_host.to_owned(),
        target_port,
        target_user: target_user.to_owned(),
        enabled: true,
    }
}

#[test]
fn routes_valid_binding() {
    let tc = TestCatalog::new();
    let target = router(&tc, &[])
        .route(&ssh_key("10.0.0.5", 22, "ubuntu"), "alice", SOURCE_IP)
        .expect("valid binding should route");

    assert_eq!(target.host, "10.0.0.5");
    assert_eq!(target.port, 22);
    assert_eq!(target.user, "ubuntu");

    let events = tc.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, "success");
    assert_eq!(events[0].target_host, "10.0.0.5");
    assert_eq!(events[0].target_user, "ubuntu");
}

#[test]
fn rejects_disabled_binding() {
    let tc = TestCatalog::new();
    let mut key = ssh_key("10.0.0.5", 22, "ubuntu");
    key.enabled = false;

    assert!(router(&tc, &[]).route(&key, "alice", SOURCE_IP).is_none());
    assert_eq!(tc.events()[0].status, "denied");
}

#[test]
fn rejects_port_zero() {
    let tc = TestCatalog::new();
    let key = ssh_key("10.0.0.5", 0, "ubuntu");

    assert!(router(&tc, &[]).route(&key, "alice", SOURCE_IP).is_none());
}

#[test]
fn rejects_port_above_range() {
    let tc = TestCatalog::new();
    let key = ssh_key("10.0.0.5", 65536, "ubuntu");

    assert!(router(&tc, &[]).route(&key, "alice", SOURCE_IP).is_none());
}

#[test]
fn rejects_empty_target_user() {
    let tc = TestCatalog::new();
    let key = ssh_key("10.0.0.5", 22, "");

    assert!(router(&tc, &[]).route(&key, "alice", SOURCE_IP).is_none());
}

#[test]
fn rejects_target_in_restricted_network() {
    let tc = TestCatalog::new();
    let key = ssh_key("10.10.254.42", 22, "ubuntu");

    let denied = router(&tc, &["10.10.254.0/24"]).route(&key, "alice", SOURCE_IP);
    assert!(denied.is_none());

    let events = tc.events();
    assert_eq!(events[0].status, "denied");
    assert!(events[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("restricted network"));
}

#[test]
fn rejects_network_address_of_restricted_cidr() {
    let tc = TestCatalog::new();
    let key = ssh_key("10.10.254.0", 22, "ubuntu");

    assert!(router(&tc, &["10.10.254.0/24"])
        .route(&key, "alice", SOURCE_IP)
        .is_none());
}

#[test]
fn any_matching_network_denies() {
    let tc = TestCatalog::new();
    let key = ssh_key("192.168.7.1", 22, "ubuntu");

    assert!(router(&tc, &["10.0.0.0/8", "192.168.0.0/16"])
        .route(&key, "alice", SOURCE_IP)
        .is_none());
}

#[test]
fn target_outside_restricted_networks_routes() {
    let tc = TestCatalog::new();
    let key = ssh_key("172.16.0.9", 22, "ubuntu");

    assert!(router(&tc, &["10.0.0.0/8", "192.168.0.0/16"])
        .route(&key, "alice", SOURCE_IP)
        .is_some());
}

#[test]
fn hostname_targets_skip_the_network_check() {
    let tc = TestCatalog::new();
    let key = ssh_key("db.internal", 22, "ubuntu");

    let target = router(&tc, &["10.0.0.0/8"])
        .route(&key, "alice", SOURCE_IP)
        .expect("hostnames are not checked against restricted networks");
    assert_eq!(target.host, "db.internal");
}
