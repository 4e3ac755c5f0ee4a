use std::{
    env,
    time::{SystemTime, UNIX_EPOCH},
};

use super::*;

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
}

#[test]
fn leaves_memory_url_untouched() {
    assert_eq!(
        normalize_database_url("sqlite::memory:"),
        "sqlite::memory:"
    );
}

#[test]
fn empty_url_falls_back_to_default() {
    assert_eq!(
        normalize_database_url("   "),
        Settings::default().database_url
    );
}

#[test]
fn creates_parent_dir_for_relative_sqlite_url() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();

    let temp_root = env::temp_dir().join(format!("yo_server_test_{suffix}"));
    std::fs::create_dir_all(&temp_root).expect("temp root");

    let original_dir = env::current_dir().expect("cwd");
    env::set_current_dir(&temp_root).expect("set cwd");

    prepare_database_url("./data/test.db").expect("prepare db url");
    assert!(temp_root.join("data").exists());

    env::set_current_dir(original_dir).expect("restore cwd");
    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[test]
fn default_receipt_delay_matches_provider_guidance() {
    assert_eq!(Settings::default().push_receipt_delay_seconds, 900);
}
