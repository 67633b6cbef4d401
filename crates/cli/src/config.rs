//! Config file resolution and environment overrides for `gatewayd`.

use std::path::{Path, PathBuf};

use gateway::GatewayConfig;
use proto::ConfigError;
use tracing::{debug, warn};

/// File name looked up in the working directory and under `~/.gateway/`.
pub const CONFIG_FILE: &str = "gateway.toml";

/// Returns `~/.gateway`, falling back to `./.gateway` without `HOME`.
pub fn home_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".gateway")
}

/// Loads configuration from an explicit path or the fallback locations,
/// then applies environment overrides. No file at all yields the defaults.
pub fn load(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    let config_path = path.map(Path::to_path_buf).or_else(|| {
        let cwd = std::env::current_dir().ok()?.join(CONFIG_FILE);
        if cwd.exists() {
            return Some(cwd);
        }
        let home_config = home_dir().join(CONFIG_FILE);
        home_config.exists().then_some(home_config)
    });
    debug!(path = ?config_path, "Config file resolved");

    let mut config = match config_path {
        Some(path) => {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content).map_err(|e| ConfigError::Toml(e.to_string()))?
        }
        None => GatewayConfig::default(),
    };
    apply_env_overrides(&mut config);

    debug!(
        socket = config.enable_socket,
        http = config.enable_http,
        websocket = config.enable_websocket,
        inner = config.enable_inner,
        "Config loaded"
    );
    Ok(config)
}

/// Environment variable overrides (highest priority).
fn apply_env_overrides(config: &mut GatewayConfig) {
    if let Ok(addr) = std::env::var("GATEWAY_SOCKET_ADDR") {
        config.outer_socket.listen_address = addr;
    }
    if let Ok(addr) = std::env::var("GATEWAY_HTTP_ADDR") {
        config.outer_http.listen_address = addr;
    }
    if let Ok(addr) = std::env::var("GATEWAY_WS_ADDR") {
        config.outer_websocket.listen_address = addr;
    }
    if let Ok(addr) = std::env::var("GATEWAY_INNER_ADDR") {
        config.inner_socket.listen_address = addr;
    }
    override_flag("GATEWAY_ENABLE_SOCKET", &mut config.enable_socket);
    override_flag("GATEWAY_ENABLE_HTTP", &mut config.enable_http);
    override_flag("GATEWAY_ENABLE_WEBSOCKET", &mut config.enable_websocket);
    override_flag("GATEWAY_ENABLE_INNER", &mut config.enable_inner);
}

fn override_flag(var: &str, flag: &mut bool) {
    let Ok(raw) = std::env::var(var) else {
        return;
    };
    match parse_flag(&raw) {
        Some(value) => *flag = value,
        None => warn!(var, value = %raw, "Ignoring non-boolean environment override"),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{remove_env_var, set_env_var, with_locked_env};

    const VARS: [&str; 8] = [
        "GATEWAY_SOCKET_ADDR",
        "GATEWAY_HTTP_ADDR",
        "GATEWAY_WS_ADDR",
        "GATEWAY_INNER_ADDR",
        "GATEWAY_ENABLE_SOCKET",
        "GATEWAY_ENABLE_HTTP",
        "GATEWAY_ENABLE_WEBSOCKET",
        "GATEWAY_ENABLE_INNER",
    ];

    fn clear_vars() {
        for var in VARS {
            remove_env_var(var);
        }
    }

    fn write_file(path: &Path, content: &str) {
        std::fs::write(path, content).expect("write config");
    }

    #[test]
    fn parse_flag_accepts_common_spellings() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" on "), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn load_reads_explicit_file() {
        with_locked_env(|| {
            clear_vars();
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("gw.toml");
            write_file(
                &path,
                r#"
enable_websocket = true

[outer_socket]
listen_address = "127.0.0.1:7000"
enable_heartbeat = true
default_context_age = "5s"

[[discovery.services]]
name = "orders"
addr = "127.0.0.1:7001"
"#,
            );
            let cfg = load(Some(&path)).expect("load");
            assert!(cfg.enable_websocket);
            assert!(cfg.enable_socket);
            assert_eq!(cfg.outer_socket.listen_address, "127.0.0.1:7000");
            assert!(cfg.outer_socket.enable_heartbeat);
            assert_eq!(
                cfg.outer_socket.default_context_age,
                std::time::Duration::from_secs(5)
            );
            assert_eq!(cfg.discovery.services[0].name, "orders");
            cfg.check().expect("valid");
        });
    }

    #[test]
    fn env_overrides_file_values() {
        with_locked_env(|| {
            clear_vars();
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("gw.toml");
            write_file(&path, "enable_http = true\n");

            set_env_var("GATEWAY_ENABLE_HTTP", "false");
            set_env_var("GATEWAY_ENABLE_WEBSOCKET", "not-a-bool");
            set_env_var("GATEWAY_SOCKET_ADDR", "127.0.0.1:9999");
            let cfg = load(Some(&path)).expect("load");
            clear_vars();

            assert!(!cfg.enable_http);
            assert!(!cfg.enable_websocket, "invalid override ignored");
            assert_eq!(cfg.outer_socket.listen_address, "127.0.0.1:9999");
        });
    }

    #[test]
    fn load_returns_toml_error_for_invalid_content() {
        with_locked_env(|| {
            clear_vars();
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("gw.toml");
            write_file(&path, "[outer_socket\nlisten_address = 1");
            let err = load(Some(&path)).expect_err("invalid toml must fail");
            assert!(err.to_string().contains("TOML parse error"));
        });
    }

    #[test]
    fn missing_explicit_file_is_an_io_error() {
        with_locked_env(|| {
            let tmp = tempfile::tempdir().expect("tempdir");
            let err = load(Some(&tmp.path().join("absent.toml"))).expect_err("missing file");
            assert!(matches!(err, ConfigError::Io(_)));
        });
    }

    #[test]
    fn home_dir_points_to_dot_gateway() {
        assert!(home_dir().ends_with(".gateway"));
    }
}
