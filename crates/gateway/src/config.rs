//! Startup configuration and its validation.
//!
//! Raw `*Config` structs are what the TOML file deserializes into.
//! [`SrvConfig::peer_config`] and [`GatewayConfig::check`] normalize defaults
//! and reject malformed input before any listener is built.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use proto::{BodyCodec, ConfigError};
use serde::{Deserialize, Serialize};

const DEFAULT_NETWORK: &str = "tcp";
const DEFAULT_SOCKET_ADDR: &str = "0.0.0.0:9090";
const DEFAULT_INNER_ADDR: &str = "0.0.0.0:9091";
const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_WS_ADDR: &str = "0.0.0.0:5050";

/// Humantime (`30s`, `1h 5m`, `0`) duration fields.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        let raw = raw.trim();
        if raw.is_empty() || raw == "0" || raw.starts_with('-') {
            return Ok(Duration::ZERO);
        }
        humantime::parse_duration(raw).map_err(serde::de::Error::custom)
    }
}

/// Socket network family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
}

impl Network {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            "unix" => Ok(Self::Unix),
            "unixpacket" => Err(ConfigError::invalid(
                "network",
                "unixpacket (SOCK_SEQPACKET) listeners are not supported",
            )),
            other => Err(ConfigError::invalid(
                "network",
                format!("{other:?} is not one of tcp, tcp4, tcp6, unix, unixpacket"),
            )),
        }
    }
}

/// Validated bind address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// TLS certificate and key file paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Socket peer config as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SrvConfig {
    /// Network; tcp, tcp4, tcp6, unix or unixpacket.
    pub network: String,
    /// Listen address, `host:port` or a unix socket path.
    pub listen_address: String,
    /// TLS certificate file path.
    pub tls_cert_file: String,
    /// TLS key file path.
    pub tls_key_file: String,
    /// Default session max age; `0` means no limit.
    #[serde(with = "duration_str")]
    pub default_session_age: Duration,
    /// Default call/push context max age; `0` means no limit.
    #[serde(with = "duration_str")]
    pub default_context_age: Duration,
    /// Slow operation alarm threshold; `0` disables the alarm.
    #[serde(with = "duration_str")]
    pub slow_comet_duration: Duration,
    /// Default body codec id.
    pub default_body_codec: String,
    /// Log frame bodies and metadata.
    pub print_detail: bool,
    /// Log handler cost time.
    pub count_time: bool,
    /// Answer heartbeat frames.
    pub enable_heartbeat: bool,
}

impl Default for SrvConfig {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK.to_string(),
            listen_address: DEFAULT_SOCKET_ADDR.to_string(),
            tls_cert_file: String::new(),
            tls_key_file: String::new(),
            default_session_age: Duration::ZERO,
            default_context_age: Duration::ZERO,
            slow_comet_duration: Duration::ZERO,
            default_body_codec: BodyCodec::Json.id().to_string(),
            print_detail: false,
            count_time: false,
            enable_heartbeat: false,
        }
    }
}

impl SrvConfig {
    /// Socket config listening on `addr` with every other field defaulted.
    pub fn with_address(addr: impl Into<String>) -> Self {
        Self {
            listen_address: addr.into(),
            ..Self::default()
        }
    }

    /// Port part of the listen address, such as `9090`.
    pub fn listen_port(&self) -> Result<u16, ConfigError> {
        let (_, port) = split_host_port(&self.listen_address, "listen_address")?;
        Ok(port)
    }

    /// Validates the raw config into an immutable [`PeerConfig`].
    pub fn peer_config(&self) -> Result<PeerConfig, ConfigError> {
        let network = Network::parse(&self.network)?;
        let raw_addr = non_empty_or(&self.listen_address, DEFAULT_SOCKET_ADDR);
        let listen = parse_listen_addr(network, raw_addr, "listen_address")?;
        let default_codec = non_empty_or(&self.default_body_codec, "j")
            .parse::<BodyCodec>()
            .map_err(|e| ConfigError::invalid("default_body_codec", e.to_string()))?;

        Ok(PeerConfig {
            network,
            listen,
            tls: tls_files(&self.tls_cert_file, &self.tls_key_file)?,
            session_age: non_zero(self.default_session_age),
            context_age: non_zero(self.default_context_age),
            slow_comet: non_zero(self.slow_comet_duration),
            default_codec,
            print_detail: self.print_detail,
            count_time: self.count_time,
            enable_heartbeat: self.enable_heartbeat,
        })
    }
}

/// Validated, immutable peer parameters.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub network: Network,
    pub listen: ListenAddr,
    pub tls: Option<TlsFiles>,
    /// `None` means sessions never expire.
    pub session_age: Option<Duration>,
    /// `None` means requests never time out.
    pub context_age: Option<Duration>,
    pub slow_comet: Option<Duration>,
    pub default_codec: BodyCodec,
    pub print_detail: bool,
    pub count_time: bool,
    pub enable_heartbeat: bool,
}

/// HTTP transport config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSrvConfig {
    pub listen_address: String,
    pub tls_cert_file: String,
    pub tls_key_file: String,
    /// Send permissive CORS headers.
    pub allow_cross: bool,
    /// Require a bearer token validated by the business strategy.
    pub require_auth: bool,
}

impl Default for HttpSrvConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_HTTP_ADDR.to_string(),
            tls_cert_file: String::new(),
            tls_key_file: String::new(),
            allow_cross: false,
            require_auth: false,
        }
    }
}

/// WebSocket transport config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WsSrvConfig {
    pub listen_address: String,
    /// Upgrade path.
    pub path: String,
    pub tls_cert_file: String,
    pub tls_key_file: String,
}

impl Default for WsSrvConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_WS_ADDR.to_string(),
            path: "/".to_string(),
            tls_cert_file: String::new(),
            tls_key_file: String::new(),
        }
    }
}

/// Validated endpoint of an HTTP-based listener.
#[derive(Debug, Clone)]
pub struct WebEndpoint {
    pub addr: SocketAddr,
    pub tls: Option<TlsFiles>,
}

impl HttpSrvConfig {
    pub fn endpoint(&self) -> Result<WebEndpoint, ConfigError> {
        web_endpoint(
            &self.listen_address,
            DEFAULT_HTTP_ADDR,
            &self.tls_cert_file,
            &self.tls_key_file,
        )
    }
}

impl WsSrvConfig {
    pub fn endpoint(&self) -> Result<WebEndpoint, ConfigError> {
        web_endpoint(
            &self.listen_address,
            DEFAULT_WS_ADDR,
            &self.tls_cert_file,
            &self.tls_key_file,
        )
    }

    /// Upgrade path, always starting with `/`.
    pub fn upgrade_path(&self) -> String {
        let path = self.path.trim();
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        }
    }
}

/// Backend forwarding client config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,
    /// Max time to wait for a backend reply; `0` means no limit.
    #[serde(with = "duration_str")]
    pub call_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// A statically configured backend instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticService {
    pub name: String,
    pub addr: String,
}

/// Discovery client config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Lease given to instances registered at runtime.
    #[serde(with = "duration_str")]
    pub lease_ttl: Duration,
    /// Instances registered without a lease at startup.
    pub services: Vec<StaticService>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            services: Vec::new(),
        }
    }
}

/// Whole-gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub enable_http: bool,
    pub enable_socket: bool,
    pub enable_websocket: bool,
    /// Backend-facing control server.
    pub enable_inner: bool,
    pub outer_http: HttpSrvConfig,
    pub outer_socket: SrvConfig,
    pub outer_websocket: WsSrvConfig,
    pub inner_socket: SrvConfig,
    pub inner_client: ClientConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enable_http: true,
            enable_socket: true,
            enable_websocket: false,
            enable_inner: false,
            outer_http: HttpSrvConfig::default(),
            outer_socket: SrvConfig::default(),
            outer_websocket: WsSrvConfig::default(),
            inner_socket: SrvConfig::with_address(DEFAULT_INNER_ADDR),
            inner_client: ClientConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Checks every enabled section; the first problem is returned.
    pub fn check(&self) -> Result<(), ConfigError> {
        // Socket and websocket sessions share the outer peer, so its
        // config is validated even when only websocket is enabled.
        let outer = self.outer_socket.peer_config()?;
        let mut bound: Vec<(&str, String)> = Vec::new();
        if self.enable_socket {
            bound.push(("outer_socket", outer.listen.to_string()));
        }
        if self.enable_http {
            let ep = self.outer_http.endpoint()?;
            bound.push(("outer_http", ep.addr.to_string()));
        }
        if self.enable_websocket {
            let ep = self.outer_websocket.endpoint()?;
            bound.push(("outer_websocket", ep.addr.to_string()));
        }
        if self.enable_inner {
            let inner = self.inner_socket.peer_config()?;
            bound.push(("inner_socket", inner.listen.to_string()));
        }
        for (i, (name, addr)) in bound.iter().enumerate() {
            if addr.ends_with(":0") {
                continue;
            }
            if let Some((other, _)) = bound[..i].iter().find(|(_, a)| a == addr) {
                return Err(ConfigError::invalid(
                    format!("{name}.listen_address"),
                    format!("{addr} is already used by {other}"),
                ));
            }
        }
        for svc in &self.discovery.services {
            if svc.name.trim().is_empty() {
                return Err(ConfigError::MissingField("discovery.services.name".into()));
            }
            split_host_port(&svc.addr, "discovery.services.addr")?;
        }
        Ok(())
    }
}

fn non_empty_or<'a>(value: &'a str, default: &'a str) -> &'a str {
    let value = value.trim();
    if value.is_empty() { default } else { value }
}

fn non_zero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

fn tls_files(cert: &str, key: &str) -> Result<Option<TlsFiles>, ConfigError> {
    match (cert.trim(), key.trim()) {
        ("", "") => Ok(None),
        ("", _) => Err(ConfigError::MissingField("tls_cert_file".into())),
        (_, "") => Err(ConfigError::MissingField("tls_key_file".into())),
        (cert, key) => Ok(Some(TlsFiles {
            cert: PathBuf::from(cert),
            key: PathBuf::from(key),
        })),
    }
}

fn web_endpoint(
    raw: &str,
    default: &str,
    cert: &str,
    key: &str,
) -> Result<WebEndpoint, ConfigError> {
    let addr = match parse_listen_addr(Network::Tcp, non_empty_or(raw, default), "listen_address")? {
        ListenAddr::Inet(addr) => addr,
        ListenAddr::Unix(path) => {
            return Err(ConfigError::invalid(
                "listen_address",
                format!("{} is not a tcp address", path.display()),
            ));
        }
    };
    Ok(WebEndpoint {
        addr,
        tls: tls_files(cert, key)?,
    })
}

fn split_host_port<'a>(raw: &'a str, field: &str) -> Result<(&'a str, u16), ConfigError> {
    let (host, port) = raw
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::invalid(field, format!("{raw:?} is missing a port")))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| ConfigError::invalid(field, format!("bad port in {raw:?}: {e}")))?;
    Ok((host.trim_start_matches('[').trim_end_matches(']'), port))
}

fn parse_listen_addr(network: Network, raw: &str, field: &str) -> Result<ListenAddr, ConfigError> {
    if network == Network::Unix {
        let path = raw.strip_prefix("unix:").unwrap_or(raw);
        return Ok(ListenAddr::Unix(PathBuf::from(path)));
    }
    split_host_port(raw, field)?;
    let candidates: Vec<SocketAddr> = match raw.parse::<SocketAddr>() {
        Ok(addr) => vec![addr],
        Err(_) => raw
            .to_socket_addrs()
            .map_err(|e| ConfigError::invalid(field, format!("cannot resolve {raw:?}: {e}")))?
            .collect(),
    };
    candidates
        .into_iter()
        .find(|addr| match network {
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
            _ => true,
        })
        .map(ListenAddr::Inet)
        .ok_or_else(|| {
            ConfigError::invalid(field, format!("{raw:?} has no address for {network:?}"))
        })
}
