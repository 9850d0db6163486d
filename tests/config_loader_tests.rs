use permsync::config::{ConfigError, ConfigLoader};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

const VARS: &[&str] = &[
    "PERMSYNC_PROFILE",
    "PERMSYNC_API_BIND_ADDR",
    "PERMSYNC_LOG_LEVEL",
    "PERMSYNC_DATABASE_URL",
    "PERMSYNC_OPERATOR_TOKEN",
    "PERMSYNC_OPERATOR_TOKENS",
    "PERMSYNC_REDIS_URL",
    "PERMSYNC_GITHUB_URL",
    "PERMSYNC_WORKER_CONCURRENCY",
    "PERMSYNC_SCHEDULER_BATCH_SIZE",
];

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
    for var in VARS {
        unsafe {
            env::remove_var(var);
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
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.worker.concurrency, 4);
    assert_eq!(cfg.scheduler.perms_stale_after_seconds, 259_200);
    assert!(cfg.operator_tokens.is_empty());
    cfg.bind_addr().expect("default bind addr parses");
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "PERMSYNC_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(&temp_dir, ".env.test", "PERMSYNC_API_BIND_ADDR=192.168.0.10:5000\n");
    write_env_file(&temp_dir, ".env.test.local", "PERMSYNC_API_BIND_ADDR=10.0.0.5:6000\n");

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "PERMSYNC_PROFILE=test\nPERMSYNC_API_BIND_ADDR=127.0.0.1:4000\nPERMSYNC_OPERATOR_TOKEN=layered-token\n",
    );

    let cfg = loader(&temp_dir).load().expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.operator_tokens, vec!["layered-token".to_string()]);
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "PERMSYNC_API_BIND_ADDR=127.0.0.1:3000\nPERMSYNC_WORKER_CONCURRENCY=2\n",
    );

    unsafe {
        env::set_var("PERMSYNC_API_BIND_ADDR", "0.0.0.0:9090");
    }

    let cfg = loader(&temp_dir).load().expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.worker.concurrency, 2);

    clear_env();
}

#[test]
fn operator_token_list_is_split_and_trimmed() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "PERMSYNC_OPERATOR_TOKENS= first , second,,\nPERMSYNC_OPERATOR_TOKEN=ignored\n",
    );

    let cfg = loader(&temp_dir).load().unwrap();
    assert_eq!(cfg.operator_tokens, vec!["first".to_string(), "second".to_string()]);
}

#[test]
fn production_profile_requires_backing_services() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "PERMSYNC_PROFILE=prod\nPERMSYNC_DATABASE_URL=postgres://localhost/permsync\nPERMSYNC_OPERATOR_TOKEN=t\n",
    );

    let err = loader(&temp_dir).load().expect_err("redis is required outside local profiles");
    assert!(matches!(err, ConfigError::MissingRedisUrl));

    write_env_file(&temp_dir, ".env.prod", "PERMSYNC_REDIS_URL=redis://localhost:6379\n");
    let cfg = loader(&temp_dir).load().expect("complete prod config loads");
    assert_eq!(cfg.redis_url.as_deref(), Some("redis://localhost:6379"));
    assert!(!cfg.redacted_json().unwrap().contains("localhost:6379"));
}

#[test]
fn invalid_numbers_name_the_variable() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "PERMSYNC_SCHEDULER_BATCH_SIZE=lots\n");

    let err = loader(&temp_dir).load().expect_err("non-numeric batch size fails");
    assert!(matches!(
        err,
        ConfigError::InvalidValue { ref key, .. } if key == "PERMSYNC_SCHEDULER_BATCH_SIZE"
    ));
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("PERMSYNC_API_BIND_ADDR", "not-an-addr");
    }
    let temp_dir = TempDir::new().unwrap();
    let err = loader(&temp_dir).load().expect_err("invalid bind addr should fail");
    assert!(format!("{}", err).contains("invalid api bind address"));

    clear_env();
}
