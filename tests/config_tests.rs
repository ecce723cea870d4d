//! Unit tests for soak configuration loading and validation.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use flashsoak::test_support::{EnvGuard, RecordingLog};
use flashsoak::{ConfigError, Device, FormatterKind, SoakConfig};
use rstest::*;
use tempfile::TempDir;

#[fixture]
fn valid_config() -> SoakConfig {
    SoakConfig {
        source_dir: Some(String::from("/srv/reference")),
        rewrite_period_secs: 10_800,
        recovery_attempts: 4,
        clean_start: false,
        stagger_interval_secs: 1_800,
        pause_poll_ms: 1_000,
        cycle_delay_ms: 10,
        stop_timeout_secs: 30,
        rewrite_retry_limit: None,
        rewrite_retry_backoff_ms: 0,
        formatter: String::from("command"),
        format_bin: String::from("mkfs.vfat"),
        quick_format: true,
    }
}

#[rstest]
fn validation_rejects_missing_source_with_actionable_error(valid_config: SoakConfig) {
    let cfg = SoakConfig {
        source_dir: None,
        ..valid_config
    };

    let error = cfg.validate().expect_err("source is required");
    let ConfigError::MissingField(ref message) = error else {
        panic!("expected MissingField error, got {error:?}");
    };
    assert!(
        message.contains("FLASHSOAK_SOURCE_DIR"),
        "error should mention env var: {message}"
    );
    assert!(
        message.contains("flashsoak.toml"),
        "error should mention config file: {message}"
    );
    assert!(
        message.contains("source_dir"),
        "error should mention TOML key: {message}"
    );
}

#[rstest]
fn validation_treats_blank_source_as_missing(valid_config: SoakConfig) {
    let cfg = SoakConfig {
        source_dir: Some(String::from("   ")),
        ..valid_config
    };

    assert!(matches!(cfg.validate(), Err(ConfigError::MissingField(_))));
}

#[rstest]
#[case::rewrite_period("FLASHSOAK_REWRITE_PERIOD_SECS", |cfg: &mut SoakConfig| cfg.rewrite_period_secs = 0)]
#[case::pause_poll("FLASHSOAK_PAUSE_POLL_MS", |cfg: &mut SoakConfig| cfg.pause_poll_ms = 0)]
#[case::stop_timeout("FLASHSOAK_STOP_TIMEOUT_SECS", |cfg: &mut SoakConfig| cfg.stop_timeout_secs = 0)]
fn validation_rejects_zero_durations(
    valid_config: SoakConfig,
    #[case] env_var: &str,
    #[case] breaker: fn(&mut SoakConfig),
) {
    let mut cfg = valid_config;
    breaker(&mut cfg);

    let error = cfg.validate().expect_err("zero duration should be rejected");
    let ConfigError::Invalid(ref message) = error else {
        panic!("expected Invalid error, got {error:?}");
    };
    assert!(message.contains("greater than zero"), "message: {message}");
    assert!(message.contains(env_var), "message: {message}");
}

#[rstest]
fn validation_rejects_unknown_formatter(valid_config: SoakConfig) {
    let cfg = SoakConfig {
        formatter: String::from("diskpart"),
        ..valid_config
    };

    let err = cfg.validate().expect_err("unknown formatter");
    assert!(
        err.to_string().contains("unknown formatter 'diskpart'"),
        "unexpected error: {err}"
    );
}

#[rstest]
fn command_formatter_requires_a_program(valid_config: SoakConfig) {
    let cfg = SoakConfig {
        format_bin: String::new(),
        ..valid_config
    };
    let err = cfg.validate().expect_err("program required");
    assert!(err.to_string().contains("FLASHSOAK_FORMAT_BIN"), "got: {err}");

    let wipe = SoakConfig {
        formatter: String::from("wipe"),
        ..cfg
    };
    assert_eq!(wipe.validate(), Ok(()));
    assert_eq!(wipe.formatter_kind(), Ok(FormatterKind::Wipe));
}

#[rstest]
fn command_formatter_requires_a_block_node_per_device(valid_config: SoakConfig) {
    let with_node = Device::new("a", "/media/a").with_node("/dev/sdb1");
    let devices = [with_node.clone(), Device::new("b", "/media/b")];

    let err = valid_config
        .check_devices(&devices)
        .expect_err("device b has no node");
    let message = err.to_string();
    assert!(matches!(err, ConfigError::Invalid(_)));
    assert!(message.contains("device b"), "got: {message}");
    assert!(message.contains("b=/media/b@NODE"), "got: {message}");
    assert!(message.contains("FLASHSOAK_FORMATTER=wipe"), "got: {message}");

    assert_eq!(valid_config.check_devices(std::slice::from_ref(&with_node)), Ok(()));

    let wipe = SoakConfig {
        formatter: String::from("wipe"),
        ..valid_config
    };
    assert_eq!(wipe.check_devices(&devices), Ok(()));
}

#[rstest]
fn settings_carry_configured_values(valid_config: SoakConfig) {
    let cfg = SoakConfig {
        source_dir: Some(String::from(" /srv/reference ")),
        rewrite_period_secs: 600,
        recovery_attempts: 2,
        clean_start: true,
        rewrite_retry_limit: Some(5),
        rewrite_retry_backoff_ms: 250,
        quick_format: false,
        ..valid_config
    };

    let settings = cfg
        .settings_for(Arc::new(RecordingLog::new()))
        .unwrap_or_else(|err| panic!("settings: {err}"));

    assert_eq!(settings.source_dir, Utf8PathBuf::from("/srv/reference"));
    assert_eq!(settings.rewrite_period, Duration::from_secs(600));
    assert_eq!(settings.recovery_attempts, 2);
    assert!(settings.clean_start);
    assert!(!settings.quick_format);
    assert_eq!(settings.retry.limit, Some(5));
    assert_eq!(settings.retry.backoff, Duration::from_millis(250));
    assert_eq!(settings.pause_poll, Duration::from_secs(1));
    assert_eq!(settings.stop_timeout, Duration::from_secs(30));
    assert_eq!(cfg.stagger_interval(), Duration::from_secs(1_800));
}

#[tokio::test]
async fn loader_merges_config_file_and_environment() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let tmp_root =
        Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap_or_else(|non_utf8_path| {
            panic!("temp dir should be utf8: {}", non_utf8_path.display())
        });
    Dir::open_ambient_dir(&tmp_root, ambient_authority())
        .unwrap_or_else(|err| panic!("open temp dir: {err}"))
        .write(
            "flashsoak.toml",
            "source_dir = \"/srv/from-file\"\nstagger_interval_secs = 90\n",
        )
        .unwrap_or_else(|err| panic!("write config: {err}"));
    let config_path = tmp_root.join("flashsoak.toml");

    let _guard = EnvGuard::set_vars(&[
        ("FLASHSOAK_CONFIG_PATH", config_path.as_str()),
        ("FLASHSOAK_RECOVERY_ATTEMPTS", "7"),
    ])
    .await;
    let cfg = SoakConfig::load_without_cli_args().unwrap_or_else(|err| panic!("load: {err}"));

    assert_eq!(cfg.source_dir.as_deref(), Some("/srv/from-file"));
    assert_eq!(cfg.stagger_interval_secs, 90);
    assert_eq!(cfg.recovery_attempts, 7);
    assert_eq!(cfg.rewrite_period_secs, 10_800);
    assert_eq!(cfg.formatter, "command");
}
