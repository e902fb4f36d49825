//! Service configuration
//!
//! Every service reads an optional YAML file whose values may embed
//! `${VAR:default}` environment substitutions, then applies direct
//! environment-variable overrides on top. Precedence is environment >
//! YAML > built-in default, matching how the services are deployed
//! (container env wins over the shipped file).

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level configuration shared by the services
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub bucket: BucketConfig,
    pub protocol: ProtocolConfig,
    pub tcp: TcpConfig,
    pub websocket: WsConfig,
    pub registry: RegistryConfig,
    pub rpc: RpcConfig,
    pub controller: ControllerConfig,
}

/// Identity and RPC bind address of this service instance
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub id: String,
    /// Bind address for the service's RPC listener
    pub addr: String,
    /// Port for the auxiliary HTTP surface, when one is attached
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: "connect-node-1".into(),
            addr: "0.0.0.0:50052".into(),
            http_port: 8080,
        }
    }
}

/// Registry shard geometry
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    /// Number of bucket shards
    pub size: usize,
    /// Expected channels per bucket (map capacity hint)
    pub channel: usize,
    /// Expected rooms per bucket (map capacity hint)
    pub room: usize,
    /// Room-broadcast workers per bucket
    pub routine_amount: usize,
    /// Queue depth per room-broadcast worker
    pub routine_size: usize,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            size: 32,
            channel: 1024,
            room: 1024,
            routine_amount: 32,
            routine_size: 1024,
        }
    }
}

/// Per-session queue geometry and handshake deadline
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Inbound ring slots per session
    pub cli_proto: usize,
    /// Signal mailbox entries per session
    pub svr_proto: usize,
    pub handshake_timeout_secs: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            cli_proto: 5,
            svr_proto: 10,
            handshake_timeout_secs: 5,
        }
    }
}

impl ProtocolConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Read-buffer pool geometry
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Number of reader pools sessions are spread over
    pub reader: usize,
    /// Buffers per pool growth step
    pub read_buf: usize,
    /// Bytes per buffer
    pub read_buf_size: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            reader: 32,
            read_buf: 1024,
            read_buf_size: 8192,
        }
    }
}

/// WebSocket listener and session lifecycle settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WsConfig {
    pub host: String,
    pub port: u16,
    /// Upgrade path clients must request
    pub path: String,
    /// Idle sessions are closed after this long without traffic
    pub session_timeout_secs: u64,
    /// How often the idle check runs
    pub heartbeat_period_secs: u64,
    /// Maximum concurrent sessions (0 = unlimited)
    pub session_number: usize,
    /// Bound on a single outbound write
    pub write_timeout_secs: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8083,
            path: "/connect".into(),
            session_timeout_secs: 60,
            heartbeat_period_secs: 60,
            session_number: 1000,
            write_timeout_secs: 5,
        }
    }
}

impl WsConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Registry (service discovery) endpoints
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub endpoints: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["localhost:2379".into()],
        }
    }
}

/// Deadlines for outbound RPC calls
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub timeout_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self { timeout_secs: 5 }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Where the membership Controller answers RPCs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub addr: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:50051".into(),
        }
    }
}

impl Config {
    /// Load `config.yaml` from the working directory; a missing file means
    /// defaults plus environment overrides
    pub fn load() -> Result<Self> {
        Self::load_from_file("config.yaml")
    }

    /// Load a specific YAML file; a missing file is not an error
    pub fn load_from_file(path: &str) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_yaml(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path, "no config file, using defaults");
                Self::default()
            }
            Err(err) => return Err(err.into()),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse YAML after `${VAR:default}` expansion
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let expanded = expand_env_vars(raw);
        serde_yaml::from_str(&expanded).map_err(|err| Error::Config(err.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        env_string("SERVER_ID", &mut self.server.id);
        env_string("SERVER_ADDR", &mut self.server.addr);
        if let Some(port) = env_parse::<u16>("GRPC_PORT") {
            self.server.addr = replace_port(&self.server.addr, port);
        }
        env_value("HTTP_PORT", &mut self.server.http_port);

        env_value("BUCKET_SIZE", &mut self.bucket.size);
        env_value("BUCKET_CHANNEL", &mut self.bucket.channel);
        env_value("BUCKET_ROOM", &mut self.bucket.room);
        env_value("BUCKET_ROUTINE_AMOUNT", &mut self.bucket.routine_amount);
        env_value("BUCKET_ROUTINE_SIZE", &mut self.bucket.routine_size);

        env_value("PROTOCOL_CLI_PROTO", &mut self.protocol.cli_proto);
        env_value("PROTOCOL_SVR_PROTO", &mut self.protocol.svr_proto);
        env_value(
            "PROTOCOL_HANDSHAKE_TIMEOUT_SECONDS",
            &mut self.protocol.handshake_timeout_secs,
        );

        env_value("TCP_READER", &mut self.tcp.reader);
        env_value("TCP_READBUF", &mut self.tcp.read_buf);
        env_value("TCP_READBUF_SIZE", &mut self.tcp.read_buf_size);

        env_string("GETTY_HOST", &mut self.websocket.host);
        env_value("GETTY_PORT", &mut self.websocket.port);
        env_string("GETTY_PATH", &mut self.websocket.path);
        env_value("GETTY_SESSION_TIMEOUT", &mut self.websocket.session_timeout_secs);
        env_value("GETTY_HEARTBEAT_PERIOD", &mut self.websocket.heartbeat_period_secs);
        env_value("GETTY_SESSION_NUMBER", &mut self.websocket.session_number);
        env_value("GETTY_TCP_WRITE_TIMEOUT", &mut self.websocket.write_timeout_secs);

        if let Ok(eps) = std::env::var("ETCD_ENDPOINTS") {
            let endpoints: Vec<String> = eps
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !endpoints.is_empty() {
                self.registry.endpoints = endpoints;
            }
        }

        env_value("RPC_TIMEOUT_SECONDS", &mut self.rpc.timeout_secs);
        env_string("CONTROLLER_ADDR", &mut self.controller.addr);
    }
}

fn env_string(key: &str, target: &mut String) {
    if let Ok(val) = std::env::var(key) {
        if !val.is_empty() {
            *target = val;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_value<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Some(val) = env_parse(key) {
        *target = val;
    }
}

fn replace_port(addr: &str, port: u16) -> String {
    match addr.rsplit_once(':') {
        Some((host, _)) => format!("{host}:{port}"),
        None => format!("{addr}:{port}"),
    }
}

/// Expand `${VAR}` and `${VAR:default}` references against the environment
fn expand_env_vars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(rel_end) => {
                let inner = &rest[start + 2..start + 2 + rel_end];
                let (name, default) = match inner.split_once(':') {
                    Some((name, default)) => (name, default),
                    None => (inner, ""),
                };
                match std::env::var(name) {
                    Ok(val) if !val.is_empty() => out.push_str(&val),
                    _ => out.push_str(default),
                }
                rest = &rest[start + 2 + rel_end + 1..];
            }
            None => {
                // Unterminated reference; keep the text as-is.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bucket.size, 32);
        assert_eq!(config.protocol.cli_proto, 5);
        assert_eq!(config.protocol.svr_proto, 10);
        assert_eq!(config.tcp.read_buf_size, 8192);
        assert_eq!(config.websocket.session_timeout(), Duration::from_secs(60));
        assert_eq!(config.websocket.path, "/connect");
        assert_eq!(config.rpc.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_yaml_partial_override() {
        let yaml = "bucket:\n  size: 8\nwebsocket:\n  port: 9000\n";
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.bucket.size, 8);
        assert_eq!(config.websocket.port, 9000);
        // Untouched sections keep defaults.
        assert_eq!(config.bucket.routine_amount, 32);
        assert_eq!(config.websocket.path, "/connect");
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("PUSHRELAY_TEST_HOST", "10.1.2.3");
        std::env::remove_var("PUSHRELAY_TEST_MISSING");

        let expanded = expand_env_vars(
            "host: ${PUSHRELAY_TEST_HOST:0.0.0.0}\nport: ${PUSHRELAY_TEST_MISSING:8083}\nplain: value\n",
        );
        assert!(expanded.contains("host: 10.1.2.3"));
        assert!(expanded.contains("port: 8083"));
        assert!(expanded.contains("plain: value"));
    }

    #[test]
    fn test_expand_env_vars_unterminated() {
        assert_eq!(expand_env_vars("x: ${BROKEN"), "x: ${BROKEN");
    }

    #[test]
    fn test_substitution_prefers_env_over_default() {
        std::env::set_var("PUSHRELAY_TEST_BUCKET_SIZE", "4");
        let yaml = "bucket:\n  size: ${PUSHRELAY_TEST_BUCKET_SIZE:16}\n";
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.bucket.size, 4);
    }

    #[test]
    fn test_replace_port() {
        assert_eq!(replace_port("0.0.0.0:50052", 60000), "0.0.0.0:60000");
        assert_eq!(replace_port("hostonly", 1234), "hostonly:1234");
    }
}
