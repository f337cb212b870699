use super::*;
use tempfile::tempdir;

#[test]
fn expands_tilde_to_home() {
    let home = PathBuf::from("/tmp/home-user");
    assert_eq!(
        expand_with_home("~/Cumulus", &home),
        PathBuf::from("/tmp/home-user/Cumulus")
    );
    assert_eq!(expand_with_home("~", &home), home);
    assert_eq!(
        expand_with_home("/absolute/path", &home),
        PathBuf::from("/absolute/path")
    );
}

#[test]
fn reads_intervals_from_env_or_default() {
    assert_eq!(read_u64_env("NO_SUCH_ENV_FOR_TEST", 42), 42);
}

#[test]
fn local_watcher_is_enabled_by_default() {
    assert!(read_bool_env("NO_SUCH_BOOL_ENV_FOR_TEST", true));
    assert!(!read_bool_env("NO_SUCH_BOOL_ENV_FOR_TEST", false));
}

#[test]
fn now_unix_is_after_2020() {
    assert!(now_unix() > 1_577_836_800);
}

#[test]
fn config_paths_hang_off_the_data_dir() {
    let config = DaemonConfig {
        sync_root: PathBuf::from("/home/user/Cumulus"),
        api_url: "https://api.example".to_string(),
        data_dir: PathBuf::from("/data/cumulus"),
        socket_path: PathBuf::from("/data/cumulus/control.sock"),
        poll_interval: Duration::from_millis(1500),
        debounce: Duration::from_secs(2),
        enable_local_watcher: true,
    };
    assert_eq!(
        config.settings_path(),
        PathBuf::from("/data/cumulus/settings.json")
    );
    assert_eq!(config.local_db_path(), PathBuf::from("/data/cumulus/local.db"));
    assert_eq!(
        config.remote_db_path(),
        PathBuf::from("/data/cumulus/remote.db")
    );
}

#[test]
fn reset_state_clears_databases_and_bootstrap_flag() {
    let dir = tempdir().unwrap();
    let config = DaemonConfig {
        sync_root: dir.path().join("root"),
        api_url: "https://api.example".to_string(),
        data_dir: dir.path().to_path_buf(),
        socket_path: dir.path().join("control.sock"),
        poll_interval: Duration::from_millis(1500),
        debounce: Duration::from_secs(2),
        enable_local_watcher: true,
    };
    std::fs::write(config.local_db_path(), b"db").unwrap();
    std::fs::write(config.remote_db_path(), b"db").unwrap();
    let settings = SettingsStore::load(config.settings_path()).unwrap();
    settings.set_bootstrap_done(true).unwrap();
    settings.set_watermark(123).unwrap();

    reset_state(&config).unwrap();

    assert!(!config.local_db_path().exists());
    assert!(!config.remote_db_path().exists());
    let reloaded = SettingsStore::load(config.settings_path()).unwrap();
    assert!(!reloaded.bootstrap_done());
    assert_eq!(reloaded.watermark(), 0);
}
