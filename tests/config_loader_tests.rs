use chrono::{TimeZone, Utc};
use fhir_lake_sync::config::{ConfigError, ConfigLoader};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    let keys: Vec<String> = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("FHIRLAKE_"))
        .collect();
    unsafe {
        for key in keys {
            env::remove_var(key);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn loader(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(PathBuf::from(dir.path()))
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let cfg = loader(&temp_dir).load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.log_format, "json");
    assert_eq!(cfg.source.resource_types, vec!["Patient", "Observation"]);
    assert_eq!(cfg.job.max_range_hours, 24);
    assert_eq!(cfg.scheduler.start_time, chrono::DateTime::<Utc>::UNIX_EPOCH);
    assert_eq!(cfg.scheduler.end_time, None);
    cfg.source.parsed_base_url().expect("default base url parses");
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "FHIRLAKE_JOB_CONCURRENCY=2\n");
    write_env_file(&temp_dir, ".env.test", "FHIRLAKE_JOB_CONCURRENCY=6\n");
    write_env_file(&temp_dir, ".env.test.local", "FHIRLAKE_JOB_CONCURRENCY=8\n");

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "FHIRLAKE_PROFILE=test\nFHIRLAKE_JOB_CONCURRENCY=4\nFHIRLAKE_SOURCE_BASE_URL=https://fhir.test/r4\n",
    );

    let cfg = loader(&temp_dir)
        .load()
        .expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.job.concurrency, 8);
    assert_eq!(cfg.source.base_url, "https://fhir.test/r4");
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "FHIRLAKE_SCHEDULER_SAFETY_LAG_SECONDS=600\nFHIRLAKE_LOG_LEVEL=debug\n",
    );

    unsafe {
        env::set_var("FHIRLAKE_SCHEDULER_SAFETY_LAG_SECONDS", "30");
    }

    let cfg = loader(&temp_dir).load().expect("config loads with env override");
    assert_eq!(cfg.scheduler.safety_lag_seconds, 30);
    assert_eq!(cfg.log_level, "debug");

    clear_env();
}

#[test]
fn resource_types_and_window_are_parsed() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "FHIRLAKE_SOURCE_RESOURCE_TYPES=Patient, Encounter,,Condition\nFHIRLAKE_SCHEDULER_START_TIME=2021-01-01T00:00:00Z\nFHIRLAKE_SCHEDULER_END_TIME=2021-02-01T00:00:00+00:00\n",
    );

    let cfg = loader(&temp_dir).load().unwrap();
    assert_eq!(
        cfg.source.resource_types,
        vec!["Patient", "Encounter", "Condition"]
    );
    assert_eq!(
        cfg.scheduler.start_time,
        Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()
    );
    assert_eq!(
        cfg.scheduler.end_time,
        Some(Utc.with_ymd_and_hms(2021, 2, 1, 0, 0, 0).unwrap())
    );

    clear_env();
}

#[test]
fn heartbeat_timeout_must_exceed_intervals() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "FHIRLAKE_JOB_HEARTBEAT_INTERVAL_SECONDS=30\nFHIRLAKE_JOB_HEARTBEAT_TIMEOUT_SECONDS=20\n",
    );

    let err = loader(&temp_dir).load().unwrap_err();
    assert!(matches!(err, ConfigError::InvalidHeartbeatTimeout { .. }));

    clear_env();
}

#[test]
fn invalid_start_time_returns_error() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("FHIRLAKE_SCHEDULER_START_TIME", "yesterday");
    }

    let err = loader(&temp_dir).load().unwrap_err();
    assert!(matches!(
        err,
        ConfigError::InvalidTimestamp { ref value, .. } if value == "yesterday"
    ));

    clear_env();
}

#[test]
fn scheduler_window_must_be_ordered() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "FHIRLAKE_SCHEDULER_START_TIME=2021-02-01T00:00:00Z\nFHIRLAKE_SCHEDULER_END_TIME=2021-01-01T00:00:00Z\n",
    );

    let err = loader(&temp_dir).load().unwrap_err();
    assert!(matches!(err, ConfigError::InvalidSchedulerWindow { .. }));

    clear_env();
}

#[test]
fn invalid_base_url_returns_error() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("FHIRLAKE_SOURCE_BASE_URL", "::not-a-url::");
    }

    let err = loader(&temp_dir).load().unwrap_err();
    assert!(matches!(err, ConfigError::InvalidUrl { .. }));

    clear_env();
}
