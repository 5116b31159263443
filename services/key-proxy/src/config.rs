//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys are loaded from the API_KEYS env var or `pool.keys_file`,
//! never stored in the TOML directly to avoid leaking secrets.

use axum::http::{HeaderName, HeaderValue};
use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Resolved key material, in rotation order
    #[serde(skip)]
    pub keys: Vec<Secret<String>>,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Key rotation settings
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// Signed so that a negative value is reported instead of failing to parse
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: i64,
    /// File with one API key per line (alternative to API_KEYS env var)
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
    /// Header that carries the key upstream
    #[serde(default = "default_auth_header")]
    pub auth_header: String,
    /// Prefix placed before the key, e.g. "Bearer". Empty sends the raw key.
    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown(),
            keys_file: None,
            auth_header: default_auth_header(),
            auth_scheme: default_auth_scheme(),
        }
    }
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_cooldown() -> i64 {
    300
}

fn default_auth_header() -> String {
    "authorization".into()
}

fn default_auth_scheme() -> String {
    "Bearer".into()
}

impl Config {
    /// Load configuration from a TOML file, then resolve API keys.
    ///
    /// Key resolution order:
    /// 1. API_KEYS env var (comma-separated)
    /// 2. keys_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.proxy.upstream_url.starts_with("http://")
            && !config.proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                config.proxy.upstream_url
            )));
        }

        if config.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.pool.cooldown_secs < 0 {
            return Err(common::Error::Config(format!(
                "cooldown_secs must be >= 0, got: {}",
                config.pool.cooldown_secs
            )));
        }

        if HeaderName::from_str(&config.pool.auth_header).is_err() {
            return Err(common::Error::Config(format!(
                "auth_header is not a valid header name: {}",
                config.pool.auth_header
            )));
        }

        config.keys = resolve_keys(config.pool.keys_file.as_deref())?;
        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("key-proxy.toml")
    }
}

/// Collect keys from API_KEYS, falling back to `keys_file`.
///
/// A set but blank API_KEYS counts as unset. Keys must be usable as header
/// values. Duplicate keys are rejected: the same credential under two labels
/// would be handed out twice per cooldown.
fn resolve_keys(keys_file: Option<&Path>) -> common::Result<Vec<Secret<String>>> {
    let raw: Vec<String> = match std::env::var("API_KEYS") {
        Ok(value) if !value.trim().is_empty() => value
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_owned)
            .collect(),
        _ => match keys_file {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|e| {
                    common::Error::Config(format!(
                        "failed to read keys_file {}: {e}",
                        path.display()
                    ))
                })?;
                parse_keys_file(&contents)
            }
            None => Vec::new(),
        },
    };

    if raw.is_empty() {
        return Err(common::Error::NoKeys);
    }

    for (idx, key) in raw.iter().enumerate() {
        if HeaderValue::from_str(key).is_err() {
            return Err(common::Error::Config(format!(
                "API key at position {} is not a valid header value",
                idx + 1
            )));
        }
        if raw[..idx].contains(key) {
            return Err(common::Error::Config(format!(
                "duplicate API key at position {}",
                idx + 1
            )));
        }
    }

    Ok(raw.into_iter().map(Secret::new).collect())
}

/// One key per line; blank lines and `#` comments are skipped.
fn parse_keys_file(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that read or mutate environment variables,
    /// preventing data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn write_keys(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("api_keys");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn config_with_keys_file(keys_path: &Path) -> String {
        format!(
            r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.groq.com"

[pool]
keys_file = "{}"
"#,
            keys_path.display()
        )
    }

    fn minimal_toml() -> &'static str {
        r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.groq.com"
"#
    }

    #[test]
    fn test_load_valid_config_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let keys_path = write_keys(&dir, "gsk_one\ngsk_two\n");
        let path = write_config(&dir, &config_with_keys_file(&keys_path));
        unsafe { remove_env("API_KEYS") };

        let config = Config::load(&path).unwrap();
        assert_eq!(config.proxy.upstream_url, "https://api.groq.com");
        assert_eq!(config.proxy.timeout_secs, 60);
        assert_eq!(config.proxy.max_connections, 1000);
        assert_eq!(config.pool.cooldown_secs, 300);
        assert_eq!(config.pool.auth_header, "authorization");
        assert_eq!(config.pool.auth_scheme, "Bearer");
        assert_eq!(config.keys.len(), 2);
        assert_eq!(config.keys[0].expose(), "gsk_one");
        assert_eq!(config.keys[1].expose(), "gsk_two");
    }

    #[test]
    fn test_pool_section_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.groq.com"
max_connections = 500

[pool]
cooldown_secs = 0
auth_header = "x-api-key"
auth_scheme = ""
"#,
        );
        unsafe { set_env("API_KEYS", "k1") };

        let config = Config::load(&path).unwrap();
        assert_eq!(config.proxy.max_connections, 500);
        assert_eq!(config.pool.cooldown_secs, 0);
        assert_eq!(config.pool.auth_header, "x-api-key");
        assert_eq!(config.pool.auth_scheme, "");
        unsafe { remove_env("API_KEYS") };
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");

        let result = Config::load(&path);
        assert!(matches!(result, Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_keys_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, minimal_toml());

        unsafe { set_env("API_KEYS", " gsk_a , gsk_b,,gsk_c ") };
        let config = Config::load(&path).unwrap();
        let keys: Vec<&str> = config.keys.iter().map(|k| k.expose().as_str()).collect();
        assert_eq!(keys, vec!["gsk_a", "gsk_b", "gsk_c"]);
        unsafe { remove_env("API_KEYS") };
    }

    #[test]
    fn test_keys_file_skips_comments_and_blanks() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let keys_path = write_keys(
            &dir,
            "# groq keys\n\n  gsk_first  \n#gsk_disabled\ngsk_second\n",
        );
        let path = write_config(&dir, &config_with_keys_file(&keys_path));
        unsafe { remove_env("API_KEYS") };

        let config = Config::load(&path).unwrap();
        let keys: Vec<&str> = config.keys.iter().map(|k| k.expose().as_str()).collect();
        assert_eq!(keys, vec!["gsk_first", "gsk_second"]);
    }

    #[test]
    fn test_keys_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let keys_path = write_keys(&dir, "gsk_from_file\n");
        let path = write_config(&dir, &config_with_keys_file(&keys_path));

        unsafe { set_env("API_KEYS", "gsk_from_env") };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.keys.len(), 1);
        assert_eq!(
            config.keys[0].expose(),
            "gsk_from_env",
            "API_KEYS env var must take precedence over keys_file"
        );
        unsafe { remove_env("API_KEYS") };
    }

    #[test]
    fn test_blank_env_falls_back_to_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let keys_path = write_keys(&dir, "gsk_from_file\n");
        let path = write_config(&dir, &config_with_keys_file(&keys_path));

        unsafe { set_env("API_KEYS", "   ") };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.keys[0].expose(), "gsk_from_file");
        unsafe { remove_env("API_KEYS") };
    }

    #[test]
    fn test_keys_env_overrides_nonexistent_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            &config_with_keys_file(Path::new("/nonexistent/path/api_keys")),
        );

        unsafe { set_env("API_KEYS", "gsk_env_wins") };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.keys[0].expose(), "gsk_env_wins");
        unsafe { remove_env("API_KEYS") };
    }

    #[test]
    fn test_keys_file_nonexistent_returns_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            &config_with_keys_file(Path::new("/nonexistent/path/api_keys")),
        );
        unsafe { remove_env("API_KEYS") };

        let err = Config::load(&path).unwrap_err();
        assert!(
            err.to_string().contains("failed to read keys_file"),
            "got: {err}"
        );
    }

    #[test]
    fn test_no_keys_anywhere_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, minimal_toml());
        unsafe { remove_env("API_KEYS") };

        let result = Config::load(&path);
        assert!(matches!(result, Err(common::Error::NoKeys)));
    }

    #[test]
    fn test_keys_file_with_only_comments_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let keys_path = write_keys(&dir, "# nothing here\n\n");
        let path = write_config(&dir, &config_with_keys_file(&keys_path));
        unsafe { remove_env("API_KEYS") };

        assert!(matches!(Config::load(&path), Err(common::Error::NoKeys)));
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, minimal_toml());

        unsafe { set_env("API_KEYS", "gsk_a,gsk_b,gsk_a") };
        let err = Config::load(&path).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("duplicate API key at position 3"), "got: {msg}");
        assert!(!msg.contains("gsk_a"), "error must not leak the key: {msg}");
        unsafe { remove_env("API_KEYS") };
    }

    #[test]
    fn test_key_with_control_character_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let keys_path = write_keys(&dir, "gsk_ok\ngsk_bad\u{1}key\n");
        let path = write_config(&dir, &config_with_keys_file(&keys_path));
        unsafe { remove_env("API_KEYS") };

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, common::Error::Config(_)), "got: {err:?}");
        let msg = err.to_string();
        assert!(msg.contains("position 2"), "got: {msg}");
        assert!(!msg.contains("gsk_bad"), "key material leaked: {msg}");
    }

    #[test]
    fn test_negative_cooldown_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.groq.com"

[pool]
cooldown_secs = -5
"#,
        );
        unsafe { set_env("API_KEYS", "k1") };

        let err = Config::load(&path).unwrap_err();
        assert!(
            err.to_string().contains("cooldown_secs must be >= 0"),
            "got: {err}"
        );
        unsafe { remove_env("API_KEYS") };
    }

    #[test]
    fn test_invalid_auth_header_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.groq.com"

[pool]
auth_header = "bad header"
"#,
        );
        unsafe { set_env("API_KEYS", "k1") };

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("auth_header"), "got: {err}");
        unsafe { remove_env("API_KEYS") };
    }

    #[test]
    fn test_invalid_upstream_url_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "api.groq.com"
"#,
        );
        unsafe { set_env("API_KEYS", "k1") };

        let err = Config::load(&path).unwrap_err();
        assert!(
            err.to_string().contains("upstream_url must start with http"),
            "error message should explain the issue, got: {err}"
        );
        unsafe { remove_env("API_KEYS") };
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.groq.com"
timeout_secs = 0
"#,
        );

        assert!(Config::load(&path).is_err(), "timeout_secs = 0 must be rejected");
    }

    #[test]
    fn test_zero_max_connections_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.groq.com"
max_connections = 0
"#,
        );

        assert!(
            Config::load(&path).is_err(),
            "max_connections = 0 must be rejected"
        );
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("key-proxy.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(path, PathBuf::from("/cli/wins.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_parse_keys_file_trims_lines() {
        let keys = parse_keys_file("  a  \r\nb\n\n# c\n");
        assert_eq!(keys, vec!["a", "b"]);
    }
}
