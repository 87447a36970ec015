//! Per-endpoint configuration: parsing, defaulting, and validation.
//!
//! Grounded in the teacher's top-level `config.rs` for the JSON-vs-YAML
//! dispatch-on-leading-brace idiom, and in `resolver/config.rs` /
//! `server/config.rs` for the `Option<T>`-with-defaults,
//! validate-then-convert (`resolve`) pattern mirroring
//! `NamerdConfig::into_namerd`.

use std::time::Duration;
use std::io;

use crate::buffer::{DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_CAPACITY};
use crate::transport::DEFAULT_SOCKET_TIMEOUT;

/// Parses `txt` as either JSON or YAML, picking the format by sniffing the
/// first non-whitespace byte: `{` means JSON, anything else is handed to
/// the YAML parser. Matches the teacher's dispatch-on-brace, not a
/// try-both fallback.
pub fn from_str(txt: &str) -> io::Result<EndpointConfig> {
    let trimmed = txt.trim_start();
    if trimmed.starts_with('{') {
        serde_json::from_str(trimmed).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    } else {
        serde_yaml::from_str(trimmed).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// As specified by a configuration file or admin API, before defaults are
/// applied. Unknown fields are rejected so a typo in a config file fails
/// loudly rather than silently falling back to a default.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
    pub initial_buffer_bytes: Option<usize>,
    pub max_buffer_bytes: Option<usize>,
    pub recv_timeout_ms: Option<u64>,
    pub send_timeout_ms: Option<u64>,
    pub reconnect_min_gap_ms: Option<u64>,
    pub reconnect_back_off_ms: Option<u64>,
    pub log_tag: Option<String>,
}

/// Defaults applied by `EndpointConfig::resolve`, named the way the
/// teacher's `resolver/config.rs` names its `DEFAULT_*` constants.
pub const DEFAULT_RECONNECT_MIN_GAP_MS: u64 = 60_000;
pub const DEFAULT_RECONNECT_BACK_OFF_MS: u64 = 30_000;

/// `EndpointConfig` with every optional field defaulted and validated;
/// this is what `StreamClientService::new` actually consumes.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub initial_buffer_bytes: usize,
    pub max_buffer_bytes: usize,
    pub recv_timeout: Duration,
    pub send_timeout: Duration,
    pub reconnect_min_gap: Duration,
    pub reconnect_back_off: Duration,
    pub log_tag: String,
}

impl EndpointConfig {
    /// Applies defaults and validates cross-field invariants (e.g.
    /// `initial_buffer_bytes <= max_buffer_bytes`), the same
    /// validate-then-convert step `NamerdConfig::into_namerd` performs.
    pub fn resolve(&self) -> Result<ResolvedConfig, String> {
        let initial_buffer_bytes = self.initial_buffer_bytes.unwrap_or(DEFAULT_INITIAL_CAPACITY);
        let max_buffer_bytes = self.max_buffer_bytes.unwrap_or(DEFAULT_MAX_CAPACITY);
        if initial_buffer_bytes > max_buffer_bytes {
            return Err(format!(
                "initialBufferBytes ({}) exceeds maxBufferBytes ({})",
                initial_buffer_bytes, max_buffer_bytes
            ));
        }
        if self.host.is_empty() {
            return Err("host must not be empty".into());
        }
        Ok(ResolvedConfig {
            host: self.host.clone(),
            port: self.port,
            secure: self.secure,
            initial_buffer_bytes,
            max_buffer_bytes,
            recv_timeout: self
                .recv_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SOCKET_TIMEOUT),
            send_timeout: self
                .send_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SOCKET_TIMEOUT),
            reconnect_min_gap: Duration::from_millis(
                self.reconnect_min_gap_ms.unwrap_or(DEFAULT_RECONNECT_MIN_GAP_MS),
            ),
            reconnect_back_off: Duration::from_millis(
                self.reconnect_back_off_ms
                    .unwrap_or(DEFAULT_RECONNECT_BACK_OFF_MS),
            ),
            log_tag: self.log_tag.clone().unwrap_or_default(),
        })
    }
}

impl ResolvedConfig {
    pub fn socket_addr_hint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
