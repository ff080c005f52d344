//! Unit tests for session configuration and the driver file reader.

use super::*;
use crate::test_support::EnvGuard;
use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

#[fixture]
fn base_config() -> SessionConfig {
    SessionConfig {
        driver_bin: String::from("acloud"),
        driver_config: Some(String::from("/etc/acloud/config.cfg")),
        ssh_bin: String::from("ssh"),
        scp_bin: String::from("scp"),
        adb_bin: String::from("adb"),
        gcloud_bin: String::from("gcloud"),
        ssh_key_path: Some(String::from("/keys/id_rsa")),
        instance_user: String::from("vsoc-01"),
        instance_type: String::from("cuttlefish"),
        build_target: Some(String::from("aosp_cf_x86_64_phone-userdebug")),
        build_branch: Some(String::from("aosp-main")),
        build_id: None,
        host_user: None,
        service_account_key_path: None,
        email: None,
        boot_timeout_secs: 1800,
        tunnel_online_timeout_secs: 120,
        adb_connect_timeout_secs: 60,
        command_timeout_secs: 60,
        max_launch_attempts: 1,
        extra_remote_logs: None,
        remote_adb_port: None,
        driver_verbose: true,
        skip_teardown: false,
        nonblocking_teardown: false,
        artifact_dir: String::from("avd-artifacts"),
        nested_user_map: None,
    }
}

#[rstest]
fn validate_accepts_complete_config(base_config: SessionConfig) {
    assert!(base_config.validate().is_ok());
}

#[rstest]
#[case::driver_config(
    |cfg: &mut SessionConfig| cfg.driver_config = None,
    "AVD_TETHER_DRIVER_CONFIG",
    "driver_config"
)]
#[case::ssh_key(
    |cfg: &mut SessionConfig| cfg.ssh_key_path = Some(String::from("  ")),
    "AVD_TETHER_SSH_KEY_PATH",
    "ssh_key_path"
)]
#[case::driver_bin(
    |cfg: &mut SessionConfig| cfg.driver_bin = String::new(),
    "AVD_TETHER_DRIVER_BIN",
    "driver_bin"
)]
fn validate_reports_actionable_missing_fields(
    base_config: SessionConfig,
    #[case] clear: fn(&mut SessionConfig),
    #[case] env_var: &str,
    #[case] toml_key: &str,
) {
    let mut cfg = base_config;
    clear(&mut cfg);
    let err = cfg.validate().expect_err("missing value should fail");
    let ConfigError::MissingField(message) = err else {
        panic!("expected MissingField, got {err:?}");
    };
    assert!(message.contains(env_var), "message should name {env_var}: {message}");
    assert!(message.contains(toml_key), "message should name {toml_key}: {message}");
    assert!(message.contains("avd-tether.toml"));
}

#[rstest]
fn validate_rejects_zero_attempts(base_config: SessionConfig) {
    let cfg = SessionConfig {
        max_launch_attempts: 0,
        ..base_config
    };
    let err = cfg.validate().expect_err("zero attempts should fail");
    assert!(matches!(err, ConfigError::Invalid(ref message) if message.contains("max_launch_attempts")));
}

#[rstest]
#[case::boot(|cfg: &mut SessionConfig| cfg.boot_timeout_secs = u64::MAX, "boot_timeout_secs")]
#[case::tunnel(
    |cfg: &mut SessionConfig| cfg.tunnel_online_timeout_secs = MAX_TIMEOUT_SECS + 1,
    "tunnel_online_timeout_secs"
)]
#[case::command(
    |cfg: &mut SessionConfig| cfg.command_timeout_secs = u64::MAX,
    "command_timeout_secs"
)]
fn validate_rejects_unbounded_timeouts(
    base_config: SessionConfig,
    #[case] tweak: fn(&mut SessionConfig),
    #[case] toml_key: &str,
) {
    let mut cfg = base_config;
    tweak(&mut cfg);
    let err = cfg.validate().expect_err("oversized timeout should fail");
    assert!(
        matches!(err, ConfigError::Invalid(ref message) if message.contains(toml_key)),
        "unexpected error: {err}"
    );
}

#[rstest]
fn validate_accepts_week_long_boot_timeout(base_config: SessionConfig) {
    let cfg = SessionConfig {
        boot_timeout_secs: MAX_TIMEOUT_SECS,
        ..base_config
    };
    assert!(cfg.validate().is_ok());
}

#[rstest]
fn validate_driver_skips_ssh_key(base_config: SessionConfig) {
    let cfg = SessionConfig {
        ssh_key_path: None,
        ..base_config
    };
    assert!(cfg.validate_driver().is_ok());
    assert!(matches!(cfg.validate(), Err(ConfigError::MissingField(_))));
}

#[rstest]
fn validate_driver_requires_driver_config(base_config: SessionConfig) {
    let cfg = SessionConfig {
        driver_config: None,
        ..base_config
    };
    let err = cfg.validate_driver().expect_err("driver config is required");
    assert!(err.to_string().contains("AVD_TETHER_DRIVER_CONFIG"));
}

#[rstest]
fn validate_rejects_unknown_instance_type(base_config: SessionConfig) {
    let cfg = SessionConfig {
        instance_type: String::from("physical"),
        ..base_config
    };
    let err = cfg.validate().expect_err("unknown type should fail");
    assert!(matches!(err, ConfigError::Invalid(ref message) if message.contains("physical")));
}

#[rstest]
#[case("gce", InstanceType::Gce, true, false, 6520)]
#[case("remote-avd", InstanceType::RemoteAvd, true, false, 6520)]
#[case("cuttlefish", InstanceType::Cuttlefish, false, true, 6520)]
#[case("remote-nested-avd", InstanceType::RemoteNestedAvd, false, true, 6520)]
#[case("emulator", InstanceType::Emulator, false, false, 5555)]
fn instance_type_traits(
    #[case] raw: &str,
    #[case] expected: InstanceType,
    #[case] cloud: bool,
    #[case] nested: bool,
    #[case] port: u16,
) {
    let parsed: InstanceType = raw.parse().expect("type should parse");
    assert_eq!(parsed, expected);
    assert_eq!(parsed.is_cloud(), cloud);
    assert_eq!(parsed.is_nested_runtime(), nested);
    assert_eq!(parsed.default_adb_port(), port);
    assert_eq!(parsed.to_string(), raw);
}

#[rstest]
fn adb_port_prefers_override(base_config: SessionConfig) {
    let cfg = SessionConfig {
        instance_type: String::from("emulator"),
        remote_adb_port: Some(5556),
        ..base_config
    };
    assert_eq!(cfg.adb_port().expect("port"), 5556);
}

#[rstest]
fn extra_remote_logs_split_and_trim(base_config: SessionConfig) {
    let cfg = SessionConfig {
        extra_remote_logs: Some(String::from(" /var/log/syslog, ,/tmp/trace.txt ")),
        ..base_config
    };
    assert_eq!(
        cfg.extra_remote_logs(),
        vec![String::from("/var/log/syslog"), String::from("/tmp/trace.txt")]
    );
}

#[rstest]
fn nested_users_parse_pairs(base_config: SessionConfig) {
    let cfg = SessionConfig {
        nested_user_map: Some(String::from("127.0.0.1:6520=vsoc-01, 127.0.0.1:6521=vsoc-02")),
        ..base_config
    };
    let users = cfg.nested_users().expect("mapping should parse");
    assert_eq!(users.get("127.0.0.1:6521").map(String::as_str), Some("vsoc-02"));
    assert_eq!(users.len(), 2);
}

#[rstest]
#[case("127.0.0.1:6520")]
#[case("=vsoc-01")]
#[case("127.0.0.1:6520=")]
fn nested_users_reject_malformed_entries(base_config: SessionConfig, #[case] raw: &str) {
    let cfg = SessionConfig {
        nested_user_map: Some(raw.to_owned()),
        ..base_config
    };
    assert!(matches!(cfg.nested_users(), Err(ConfigError::Invalid(_))));
}

#[rstest]
fn ssh_key_expands_home(base_config: SessionConfig) {
    let cfg = SessionConfig {
        ssh_key_path: Some(String::from("~/.ssh/avd")),
        ..base_config
    };
    let home = std::env::var("HOME").expect("HOME should be set");
    assert_eq!(cfg.ssh_key().expect("key"), Utf8PathBuf::from(format!("{home}/.ssh/avd")));
}

#[rstest]
#[tokio::test]
async fn load_merges_environment() {
    let _guard = EnvGuard::set_vars(&[
        ("AVD_TETHER_INSTANCE_TYPE", "emulator"),
        ("AVD_TETHER_BOOT_TIMEOUT_SECS", "600"),
        ("AVD_TETHER_SSH_KEY_PATH", "/keys/env"),
    ])
    .await;

    let cfg = SessionConfig::load_without_cli_args().expect("config should load");

    assert_eq!(cfg.instance_type().expect("type"), InstanceType::Emulator);
    assert_eq!(cfg.boot_timeout(), Duration::from_secs(600));
    assert_eq!(cfg.ssh_key_path.as_deref(), Some("/keys/env"));
    assert_eq!(cfg.driver_bin, "acloud");
}

const DRIVER_CONFIG: &str = r#"
# Driver configuration
project: "android-devices"
zone: 'us-central1-c'
service_account_json_private_key_path: "/keys/sa.json"
machine_type: n1-standard-4
metadata_variable {
  key: "cvd_01_launch"
  value: "true"
}
"#;

#[rstest]
fn driver_config_reads_top_level_values() {
    let parsed = DriverConfig::parse(DRIVER_CONFIG);
    assert_eq!(parsed.project(), Some("android-devices"));
    assert_eq!(parsed.zone(), Some("us-central1-c"));
    assert_eq!(parsed.service_account_key(), Some("/keys/sa.json"));
    assert_eq!(parsed.get("machine_type"), Some("n1-standard-4"));
    assert_eq!(parsed.get("key"), None, "nested block values are skipped");
}

#[rstest]
fn parse_driver_config_reads_file() {
    let dir = TempDir::new().expect("temp dir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("acloud.config")).expect("utf8 path");
    std::fs::write(&path, DRIVER_CONFIG).expect("write config");

    let parsed = parse_driver_config(&path).expect("config should parse");
    assert_eq!(parsed.into_map().get("project").map(String::as_str), Some("android-devices"));
}

#[rstest]
fn parse_driver_config_missing_file_is_none() {
    let dir = TempDir::new().expect("temp dir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("absent.config")).expect("utf8 path");
    assert!(parse_driver_config(&path).is_none());
}
