use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::Context;
use serde::Deserialize;

/// Connection details for the hosted image model.
#[derive(Debug, Clone, Deserialize)]
pub struct AiConfig {
    pub endpoint: String,
    pub project: String,
    pub location: String,
    pub model: String,
    pub access_token: Option<String>,
    pub timeout_secs: u64,
}

impl AiConfig {
    /// Full URL of the model's `:predict` method.
    pub fn predict_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/locations/{}/publishers/google/models/{}:predict",
            self.endpoint.trim_end_matches('/'),
            self.project,
            self.location,
            self.model
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub host: String,
    pub port: u16,
    pub storage_dir: PathBuf,
    pub static_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub default_owner_id: i64,
    pub ai: AiConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so tests don't have to
    /// touch the process environment.
    pub fn from_lookup<F>(get: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = get("DATABASE_URL").context("DATABASE_URL is not set")?;
        let ai = AiConfig {
            endpoint: get("AI_ENDPOINT")
                .unwrap_or_else(|| "https://us-central1-aiplatform.googleapis.com".into()),
            project: get("AI_PROJECT").unwrap_or_else(|| "flowify".into()),
            location: get("AI_LOCATION").unwrap_or_else(|| "us-central1".into()),
            model: get("AI_MODEL").unwrap_or_else(|| "imagegeneration@006".into()),
            access_token: get("AI_ACCESS_TOKEN").filter(|t| !t.trim().is_empty()),
            timeout_secs: parse_or(&get, "AI_TIMEOUT_SECS", 120)?,
        };
        Ok(Self {
            database_url,
            db_max_connections: parse_or(&get, "DB_MAX_CONNECTIONS", 10)?,
            host: get("APP_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "APP_PORT", 8080)?,
            storage_dir: get("STORAGE_DIR").unwrap_or_else(|| "uploads".into()).into(),
            static_dir: get("STATIC_DIR").unwrap_or_else(|| "static".into()).into(),
            max_upload_bytes: parse_or(&get, "MAX_UPLOAD_BYTES", 10 * 1024 * 1024)?,
            default_owner_id: parse_or(&get, "DEFAULT_OWNER_ID", 1)?,
            ai,
        })
    }
}

fn parse_or<F, T>(get: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}
