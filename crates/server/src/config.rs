use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub push_api_url: String,
    pub push_access_token: Option<String>,
    pub push_receipt_delay_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:3000".into(),
            database_url: "sqlite://./data/server.db".into(),
            push_api_url: "https://exp.host/--/api/v2/push".into(),
            push_access_token: None,
            // The provider recommends checking receipts on the order of
            // minutes after the hand-off.
            push_receipt_delay_seconds: 900,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("bind_addr") {
                settings.server_bind = v.clone();
            }
            if let Some(v) = file_cfg.get("database_url") {
                settings.database_url = v.clone();
            }
            if let Some(v) = file_cfg.get("push_api_url") {
                settings.push_api_url = v.clone();
            }
            if let Some(v) = file_cfg.get("push_access_token") {
                settings.push_access_token = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("push_receipt_delay_seconds") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.push_receipt_delay_seconds = parsed;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Ok(v) = std::env::var("PUSH_API_URL") {
        settings.push_api_url = v;
    }
    if let Ok(v) = std::env::var("APP__PUSH_API_URL") {
        settings.push_api_url = v;
    }

    if let Ok(v) = std::env::var("PUSH_ACCESS_TOKEN") {
        settings.push_access_token = Some(v);
    }
    if let Ok(v) = std::env::var("APP__PUSH_ACCESS_TOKEN") {
        settings.push_access_token = Some(v);
    }

    if let Ok(v) = std::env::var("APP__PUSH_RECEIPT_DELAY_SECONDS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.push_receipt_delay_seconds = parsed;
        }
    }

    settings
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
