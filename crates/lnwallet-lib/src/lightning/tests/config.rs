use std::{fs, time::Duration};

use crate::{
    lightning::{
        config::{
            DEFAULT_MAX_FUNDING_AMOUNT_SAT, DEFAULT_MAX_PAYMENT_PARTS, DEFAULT_MAX_PEERS,
            DEFAULT_MIN_TO_SELF_DELAY, PAYMENT_MAX_PARTS_LIMIT,
        },
        types::Privkey,
    },
    Config, Error, LightningConfig,
};

#[test]
fn test_default_lightning_config() {
    let config = LightningConfig::default();
    assert_eq!(config.max_peers(), DEFAULT_MAX_PEERS);
    assert_eq!(config.max_payment_parts(), DEFAULT_MAX_PAYMENT_PARTS);
    assert_eq!(config.connect_timeout(), Duration::from_secs(10));
    assert_eq!(config.payment_timeout(), Duration::from_secs(60));
    assert!(config.trampoline_enabled());
    assert!(!config.trampoline_forced());
    assert!(!config.auto_accept_channels());
    assert!(config.trampoline_nodes().is_empty());
    assert_eq!(
        config.channel_limits().min_to_self_delay,
        DEFAULT_MIN_TO_SELF_DELAY
    );
    assert_eq!(
        config.channel_limits().max_funding_amount_sat,
        DEFAULT_MAX_FUNDING_AMOUNT_SAT
    );
}

#[test]
fn test_max_payment_parts_is_clamped() {
    let mut config = LightningConfig::default();
    config.max_payment_parts = Some(0);
    assert_eq!(config.max_payment_parts(), 1);
    config.max_payment_parts = Some(100);
    assert_eq!(config.max_payment_parts(), PAYMENT_MAX_PARTS_LIMIT);
}

#[test]
fn test_invalid_trampoline_nodes_are_skipped() {
    let key = Privkey::generate().pubkey();
    let config = LightningConfig {
        trampoline_nodes: vec![
            format!("{}@10.0.0.1:9735", key),
            "not-a-node".to_string(),
            format!("{}@10.0.0.2", key),
        ],
        ..Default::default()
    };
    let nodes = config.trampoline_nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].pubkey, key);
    assert_eq!(nodes[0].socket_addr_string(), "10.0.0.1:9735");
}

#[test]
fn test_config_file_in_base_dir() {
    let dir = tempfile::tempdir().expect("create temp dir");
    fs::write(
        dir.path().join("config.yml"),
        "lightning:\n  max_peers: 3\n  auto_accept_channels: true\n",
    )
    .expect("write config");

    let config = Config::parse_from(["lnwalletd", "-d", dir.path().to_str().unwrap()])
        .expect("parse config");
    assert_eq!(config.base_dir, dir.path());
    assert_eq!(config.lightning.max_peers(), 3);
    assert!(config.lightning.auto_accept_channels());
    assert_eq!(
        config.lightning.base_dir(),
        Some(&dir.path().join("lightning"))
    );
}

#[test]
fn test_command_line_overrides_config_file() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("custom.yml");
    fs::write(&path, "lightning:\n  max_peers: 3\n  max_payment_parts: 4\n")
        .expect("write config");

    let config = Config::parse_from([
        "lnwalletd",
        "-d",
        dir.path().to_str().unwrap(),
        "-c",
        path.to_str().unwrap(),
        "--ln-max-peers",
        "5",
    ])
    .expect("parse config");
    assert_eq!(config.lightning.max_peers(), 5);
    assert_eq!(config.lightning.max_payment_parts(), 4);
}

#[test]
fn test_missing_explicit_config_file() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("missing.yml");
    let result = Config::parse_from(["lnwalletd", "-c", path.to_str().unwrap()]);
    assert!(matches!(result, Err(Error::IO(_))));
}

#[test]
fn test_missing_default_config_file_uses_defaults() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = Config::parse_from(["lnwalletd", "-d", dir.path().to_str().unwrap()])
        .expect("parse config");
    assert_eq!(config.lightning.max_peers(), DEFAULT_MAX_PEERS);
}

#[test]
fn test_invalid_config_file() {
    let dir = tempfile::tempdir().expect("create temp dir");
    fs::write(dir.path().join("config.yml"), "lightning:\n  max_peers: many\n")
        .expect("write config");
    let result = Config::parse_from(["lnwalletd", "-d", dir.path().to_str().unwrap()]);
    assert!(matches!(result, Err(Error::InvalidParameter(_))));
}
