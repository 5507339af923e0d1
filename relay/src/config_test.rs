use super::*;

// =============================================================================
// env_parse
// =============================================================================

#[test]
fn env_parse_missing_returns_default() {
    let val: u64 = env_parse("__RELAY_TEST_MISSING_KEY__", 42);
    assert_eq!(val, 42);
}

#[test]
fn env_parse_present_valid() {
    unsafe { std::env::set_var("__RELAY_TEST_EP_VALID__", " 99 ") };
    let val: u32 = env_parse("__RELAY_TEST_EP_VALID__", 0);
    assert_eq!(val, 99);
    unsafe { std::env::remove_var("__RELAY_TEST_EP_VALID__") };
}

#[test]
fn env_parse_invalid_returns_default() {
    unsafe { std::env::set_var("__RELAY_TEST_EP_INVALID__", "soon") };
    let val: bool = env_parse("__RELAY_TEST_EP_INVALID__", true);
    assert!(val);
    unsafe { std::env::remove_var("__RELAY_TEST_EP_INVALID__") };
}

// =============================================================================
// RelayConfig
// =============================================================================

#[test]
fn defaults_use_the_well_known_port() {
    let config = RelayConfig::default();
    assert_eq!(config.port, DEFAULT_PORT);
    assert_eq!(config.addr(), "127.0.0.1:47921".parse().expect("addr"));
    assert_eq!(config.query_timeout, Duration::from_secs(10));
    assert!(config.snapshot_path.is_none());
}

#[test]
fn client_timeout_is_clamped_to_hub_timeout() {
    let config = RelayConfig {
        query_timeout: Duration::from_secs(10),
        client_timeout: Duration::from_secs(2),
        ..RelayConfig::default()
    }
    .normalized();
    assert_eq!(config.client_timeout, Duration::from_secs(10));
    assert_eq!(config.client().query_timeout, Duration::from_secs(10));
}

#[test]
fn unparseable_host_falls_back_to_loopback() {
    let config = RelayConfig { host: "not an ip".to_owned(), port: 9, ..RelayConfig::default() };
    assert_eq!(config.addr(), "127.0.0.1:9".parse().expect("addr"));
}

#[test]
fn election_settings_follow_config() {
    let config = RelayConfig { probe_retries: 3, settle_delay: Duration::from_millis(5), ..RelayConfig::default() };
    let election = config.election();
    assert_eq!(election.probe_retries, 3);
    assert_eq!(election.settle_delay, Duration::from_millis(5));
    assert_eq!(election.addr, config.addr());
}

// =============================================================================
// WorkspaceIdentity
// =============================================================================

#[test]
fn workspace_id_is_a_stable_hex_prefix() {
    let a = workspace_id_for(Path::new("/home/dev/project"));
    let b = workspace_id_for(Path::new("/home/dev/project"));
    let c = workspace_id_for(Path::new("/home/dev/other"));
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.len(), WORKSPACE_ID_LEN);
    assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
}

#[test]
fn identity_names_workspace_after_its_directory() {
    let identity = WorkspaceIdentity::from_root("/home/dev/project");
    assert_eq!(identity.name, "project");
    let registration = identity.registration();
    assert_eq!(registration.root_path, "/home/dev/project");
    assert_eq!(registration.workspace_id, identity.workspace_id);
}
