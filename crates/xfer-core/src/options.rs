//! Engine-wide options.

use crate::error::{EngineError, EngineResult};
use crate::proxy::ProxyConfig;
use crate::server::FtpProxy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Passive-reply address fallback policy.
///
/// * `0` use the announced address; if an unroutable one fails, retry with
///   the control peer address.
/// * `1` replace an unroutable announced address with the peer address.
/// * `2` always connect to the peer address.
pub type PasvFallbackMode = u8;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineOptions {
    /// Inactivity timeout in seconds, 0 disables it.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub keepalive: bool,
    /// Idle seconds before a keep-alive command is sent.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default)]
    pub view_hidden_files: bool,
    #[serde(default)]
    pub preserve_timestamps: bool,
    #[serde(default = "default_true")]
    pub use_passive: bool,
    #[serde(default = "default_true")]
    pub allow_transfer_mode_fallback: bool,
    #[serde(default = "default_pasv_fallback")]
    pub pasv_reply_fallback_mode: PasvFallbackMode,
    /// External address announced in PORT/EPRT, empty to use the local one.
    #[serde(default)]
    pub external_ip: String,
    #[serde(default)]
    pub limit_ports: bool,
    #[serde(default = "default_port_low")]
    pub port_range_low: u16,
    #[serde(default = "default_port_high")]
    pub port_range_high: u16,
    /// Bytes per second, 0 for unlimited.
    #[serde(default)]
    pub speed_limit_inbound: u32,
    #[serde(default)]
    pub speed_limit_outbound: u32,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_entries")]
    pub cache_max_entries: usize,
    /// Plain FTP may continue unencrypted when AUTH is refused.
    #[serde(default = "default_true")]
    pub allow_unencrypted_fallback: bool,
    #[serde(default = "default_sftp_helper")]
    pub sftp_helper: PathBuf,
    /// Sent as `CLNT <name>` when the server advertises it.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_mlst_facts")]
    pub mlst_facts: String,
    #[serde(default = "default_buffer_size")]
    pub transfer_buffer_size: usize,
    /// 0 to 4, gates the debug message types.
    #[serde(default)]
    pub debug_level: u8,
    #[serde(default)]
    pub log_raw_listing: bool,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub ftp_proxy: Option<FtpProxy>,
}

fn default_timeout() -> u64 {
    20
}
fn default_keepalive_interval() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_pasv_fallback() -> PasvFallbackMode {
    0
}
fn default_port_low() -> u16 {
    6000
}
fn default_port_high() -> u16 {
    7000
}
fn default_cache_ttl() -> u64 {
    1800
}
fn default_cache_entries() -> usize {
    crate::cache::DEFAULT_MAX_ENTRIES
}
fn default_sftp_helper() -> PathBuf {
    PathBuf::from("fzsftp")
}
fn default_client_name() -> String {
    format!("xfer {}", env!("CARGO_PKG_VERSION"))
}
fn default_mlst_facts() -> String {
    "type;size;modify;perm;unix.mode;unix.owner;unix.group;".to_string()
}
fn default_buffer_size() -> usize {
    256 * 1024
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            keepalive: true,
            keepalive_interval_secs: default_keepalive_interval(),
            view_hidden_files: false,
            preserve_timestamps: false,
            use_passive: true,
            allow_transfer_mode_fallback: true,
            pasv_reply_fallback_mode: default_pasv_fallback(),
            external_ip: String::new(),
            limit_ports: false,
            port_range_low: default_port_low(),
            port_range_high: default_port_high(),
            speed_limit_inbound: 0,
            speed_limit_outbound: 0,
            cache_ttl_secs: default_cache_ttl(),
            cache_max_entries: default_cache_entries(),
            allow_unencrypted_fallback: true,
            sftp_helper: default_sftp_helper(),
            client_name: default_client_name(),
            mlst_facts: default_mlst_facts(),
            transfer_buffer_size: default_buffer_size(),
            debug_level: 0,
            log_raw_listing: false,
            proxy: ProxyConfig::default(),
            ftp_proxy: None,
        }
    }
}

impl EngineOptions {
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let opts: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::invalid_config(format!("Invalid options: {}", e)))?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.pasv_reply_fallback_mode > 2 {
            return Err(EngineError::invalid_config(format!(
                "pasvReplyFallbackMode must be 0, 1 or 2, got {}",
                self.pasv_reply_fallback_mode
            )));
        }
        if self.limit_ports && self.port_range_low > self.port_range_high {
            return Err(EngineError::invalid_config("Active port range is empty"));
        }
        if self.transfer_buffer_size == 0 {
            return Err(EngineError::invalid_config("transferBufferSize must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let opts = EngineOptions::from_json(r#"{"timeoutSecs": 5, "pasvReplyFallbackMode": 1}"#).unwrap();
        assert_eq!(opts.timeout_secs, 5);
        assert_eq!(opts.pasv_reply_fallback_mode, 1);
        assert!(opts.use_passive);
        assert_eq!(opts.cache_ttl_secs, 1800);
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(EngineOptions::from_json(r#"{"pasvReplyFallbackMode": 3}"#).is_err());
        assert!(EngineOptions::from_json("not json").is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opts.json");
        std::fs::write(&path, r#"{"viewHiddenFiles": true}"#).unwrap();
        assert!(EngineOptions::from_file(&path).unwrap().view_hidden_files);
    }
}
