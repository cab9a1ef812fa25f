//! Configuration loading from `.env` files.

use std::{env, path::PathBuf};

use anyhow::{Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for all persisted collections.
    pub store_root: PathBuf,
    /// HTTP bind address for the webhook server, e.g. `127.0.0.1:8080`.
    pub bind_http: String,
    /// Base URL of the chat bot API, e.g. `https://api.telegram.org`.
    pub chat_api_url: String,
    /// Bot token appended to the chat API path.
    pub chat_token: String,
    /// Base URL of the invoice API.
    pub pay_api_url: String,
    /// API key sent as a bearer token to the invoice API.
    pub pay_api_key: String,
    /// Radius for proximity search results, in km.
    pub search_radius_km: f64,
    /// Radius for paid push broadcasts, in km.
    pub push_radius_km: f64,
    /// User ids allowed to place banners.
    pub admin_users: Vec<i64>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_root = PathBuf::from(env::var("STORE_ROOT")?);
        let bind_http = env::var("BIND_HTTP")?;
        let chat_api_url = env::var("CHAT_API_URL")?;
        let chat_token = env::var("CHAT_TOKEN").unwrap_or_default();
        let pay_api_url = env::var("PAY_API_URL")?;
        let pay_api_key = env::var("PAY_API_KEY").unwrap_or_default();
        let search_radius_km = parse_km(env::var("SEARCH_RADIUS_KM").ok(), 30.0);
        let push_radius_km = parse_km(env::var("PUSH_RADIUS_KM").ok(), 30.0);
        let admin_users = csv_i64(env::var("ADMIN_USERS").unwrap_or_default());
        Ok(Self {
            store_root,
            bind_http,
            chat_api_url,
            chat_token,
            pay_api_url,
            pay_api_key,
            search_radius_km,
            push_radius_km,
            admin_users,
        })
    }
}

/// Parse an optional km value, falling back to `default` when absent or
/// not a positive number.
fn parse_km(raw: Option<String>, default: f64) -> f64 {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| *v > 0.0)
        .unwrap_or(default)
}

/// Split a comma-separated string into `i64` values, skipping invalid entries.
pub fn csv_i64(input: impl AsRef<str>) -> Vec<i64> {
    input
        .as_ref()
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs, sync::Mutex};
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: [&str; 9] = [
        "STORE_ROOT",
        "BIND_HTTP",
        "CHAT_API_URL",
        "CHAT_TOKEN",
        "PAY_API_URL",
        "PAY_API_KEY",
        "SEARCH_RADIUS_KM",
        "PUSH_RADIUS_KM",
        "ADMIN_USERS",
    ];

    fn clear_vars() {
        for v in ALL_VARS {
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "STORE_ROOT=/tmp\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "CHAT_API_URL=https://chat.example\n",
                "CHAT_TOKEN=tok\n",
                "PAY_API_URL=https://pay.example\n",
                "PAY_API_KEY=key\n",
                "SEARCH_RADIUS_KM=15\n",
                "PUSH_RADIUS_KM=50\n",
                "ADMIN_USERS=\"1, 2 ,x,3\"\n"
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.store_root, PathBuf::from("/tmp"));
        assert_eq!(cfg.bind_http, "127.0.0.1:8080");
        assert_eq!(cfg.chat_api_url, "https://chat.example");
        assert_eq!(cfg.chat_token, "tok");
        assert_eq!(cfg.pay_api_url, "https://pay.example");
        assert_eq!(cfg.pay_api_key, "key");
        assert_eq!(cfg.search_radius_km, 15.0);
        assert_eq!(cfg.push_radius_km, 50.0);
        assert_eq!(cfg.admin_users, vec![1, 2, 3]);
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "STORE_ROOT=/tmp\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "CHAT_API_URL=https://chat.example\n",
                "PAY_API_URL=https://pay.example\n"
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.chat_token, "");
        assert_eq!(cfg.pay_api_key, "");
        assert_eq!(cfg.search_radius_km, 30.0);
        assert_eq!(cfg.push_radius_km, 30.0);
        assert!(cfg.admin_users.is_empty());
    }

    #[test]
    fn invalid_radius_falls_back_to_default() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "STORE_ROOT=/tmp\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "CHAT_API_URL=https://chat.example\n",
                "PAY_API_URL=https://pay.example\n",
                "SEARCH_RADIUS_KM=stones\n",
                "PUSH_RADIUS_KM=-4\n"
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.search_radius_km, 30.0);
        assert_eq!(cfg.push_radius_km, 30.0);
    }

    #[test]
    fn missing_required_fields_error() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "BIND_HTTP=127.0.0.1:8080\n").unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn csv_helper() {
        assert_eq!(csv_i64("10, 20 ,,x,30"), vec![10, 20, 30]);
        assert!(csv_i64("").is_empty());
    }
}
