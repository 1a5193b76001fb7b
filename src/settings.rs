use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde_json::Value;

use crate::error::HobsError;
use crate::poll::PollPolicy;

pub const CREDENTIALS_PATH_VAR: &str = "PATH_GOOGLE_CREDENTIALS";
pub const USER_EMAIL_VAR: &str = "REGROW_EMAIL";

const DEFAULT_HOBS_URL: &str = "http://api.us.prod.internal:9089/hobs-service/";
const DEFAULT_BUCKET: &str = "env_sci_scratch";
const DEFAULT_BASE_FOLDER: &str = "hobs/temp_configs";
const DEFAULT_DB_PATH: &str = "hobs_concat_tables.db";
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 6000;

#[derive(Debug, Clone)]
pub struct Settings {
    pub credentials_path: PathBuf,
    pub credentials: Value,
    pub user_email: String,
    pub hobs_url: String,
    pub bucket: String,
    pub base_folder: String,
    pub mirror_root: Utf8PathBuf,
    pub poll: PollPolicy,
    pub download_timeout: Duration,
    pub db_path: PathBuf,
}

pub struct SettingsLoader;

impl SettingsLoader {
    pub fn from_env() -> Result<Settings, HobsError> {
        Self::resolve(|name| std::env::var(name).ok())
    }

    /// Builds settings from any variable lookup; `from_env` passes the process environment.
    pub fn resolve<F>(lookup: F) -> Result<Settings, HobsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let required =
            |name: &str| optional(name).ok_or_else(|| HobsError::MissingSetting(name.to_string()));

        let credentials_path = PathBuf::from(required(CREDENTIALS_PATH_VAR)?);
        let user_email = required(USER_EMAIL_VAR)?;
        let credentials = read_credentials(&credentials_path)?;

        let hobs_url = normalize_base_url(
            &optional("HOBS_URL").unwrap_or_else(|| DEFAULT_HOBS_URL.to_string()),
        );
        let bucket = optional("HOBS_GCS_BUCKET").unwrap_or_else(|| DEFAULT_BUCKET.to_string());
        let base_folder = optional("HOBS_GCS_BASE_FOLDER")
            .map(|value| value.trim_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_FOLDER.to_string());
        let mirror_root = match optional("HOBS_MIRROR_ROOT") {
            Some(value) => Utf8PathBuf::from(value),
            None => default_mirror_root()?,
        };

        let interval = parse_u64("HOBS_POLL_INTERVAL_SECS", optional("HOBS_POLL_INTERVAL_SECS"))?
            .map(Duration::from_secs)
            .unwrap_or(PollPolicy::DEFAULT_INTERVAL);
        let max_attempts = match parse_u64("HOBS_POLL_MAX_ATTEMPTS", optional("HOBS_POLL_MAX_ATTEMPTS"))? {
            Some(0) => None,
            Some(value) => Some(u32::try_from(value).map_err(|_| HobsError::InvalidSetting {
                name: "HOBS_POLL_MAX_ATTEMPTS".to_string(),
                value: value.to_string(),
            })?),
            None => Some(PollPolicy::DEFAULT_MAX_ATTEMPTS),
        };
        let download_timeout = parse_u64(
            "HOBS_DOWNLOAD_TIMEOUT_SECS",
            optional("HOBS_DOWNLOAD_TIMEOUT_SECS"),
        )?
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS));
        let db_path = Self::db_path(&lookup);

        Ok(Settings {
            credentials_path,
            credentials,
            user_email,
            hobs_url,
            bucket,
            base_folder,
            mirror_root,
            poll: PollPolicy {
                interval,
                max_attempts,
            },
            download_timeout,
            db_path,
        })
    }

    /// Staging database location; needs no credentials, so local commands use it alone.
    pub fn db_path<F>(lookup: F) -> PathBuf
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup("HOBS_DB_PATH")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH))
    }
}

fn read_credentials(path: &Path) -> Result<Value, HobsError> {
    let content = fs::read_to_string(path).map_err(|source| HobsError::CredentialsRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| HobsError::CredentialsParse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_u64(name: &str, value: Option<String>) -> Result<Option<u64>, HobsError> {
    value
        .map(|raw| {
            raw.parse::<u64>().map_err(|_| HobsError::InvalidSetting {
                name: name.to_string(),
                value: raw.clone(),
            })
        })
        .transpose()
}

fn normalize_base_url(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

fn default_mirror_root() -> Result<Utf8PathBuf, HobsError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(
                dirs.home_dir()
                    .join(".cache")
                    .join("hobs-toolkit")
                    .join("buckets"),
            )
            .ok()
        })
        .ok_or_else(|| HobsError::Filesystem("unable to resolve mirror directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_trailing_slash() {
        assert_eq!(normalize_base_url("http://host/hobs"), "http://host/hobs/");
        assert_eq!(normalize_base_url("http://host/hobs/"), "http://host/hobs/");
    }

    #[test]
    fn numeric_setting_rejects_garbage() {
        let err = parse_u64("HOBS_POLL_INTERVAL_SECS", Some("soon".to_string())).unwrap_err();
        assert!(matches!(err, HobsError::InvalidSetting { .. }));
    }
}
