//! Ledger geometry and identity.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RecoveryError, RecoveryResult};
use crate::layout::{CLIENT_RECORD_LEN, SERVER_HEADER_LEN, UUID_LEN};

/// Where records live in the ledger and who owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Identity of the server that owns the ledger.
    pub server_uuid: String,
    /// Client slot capacity.
    pub max_clients: u32,
    /// Byte offset of the first client record.
    pub client_start: u32,
    /// Bytes reserved per client record.
    pub client_size: u16,
    /// Bytes reserved for the server header.
    pub server_size: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            server_uuid: String::new(),
            max_clients: 32768,
            client_start: 8192,
            client_size: 128,
            server_size: 512,
        }
    }
}

impl LedgerConfig {
    /// Default geometry for `server_uuid`.
    pub fn for_server(server_uuid: impl Into<String>) -> Self {
        Self {
            server_uuid: server_uuid.into(),
            ..Default::default()
        }
    }

    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: LedgerConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that the identity fits and records do not overlap.
    pub fn validate(&self) -> RecoveryResult<()> {
        if self.server_uuid.is_empty() {
            return Err(RecoveryError::InvalidConfig("server_uuid must be set".to_string()));
        }
        if self.server_uuid.len() >= UUID_LEN {
            return Err(RecoveryError::InvalidConfig(format!(
                "server_uuid longer than {} bytes",
                UUID_LEN - 1
            )));
        }
        if self.max_clients == 0 {
            return Err(RecoveryError::InvalidConfig("max_clients must be non-zero".to_string()));
        }
        if (self.server_size as usize) < SERVER_HEADER_LEN {
            return Err(RecoveryError::InvalidConfig(format!(
                "server_size {} below header length {}",
                self.server_size, SERVER_HEADER_LEN
            )));
        }
        if (self.client_size as usize) < CLIENT_RECORD_LEN {
            return Err(RecoveryError::InvalidConfig(format!(
                "client_size {} below record length {}",
                self.client_size, CLIENT_RECORD_LEN
            )));
        }
        if self.client_start < self.server_size {
            return Err(RecoveryError::InvalidConfig(format!(
                "client_start {} overlaps the {}-byte server header",
                self.client_start, self.server_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_default_values() {
        let config = LedgerConfig::default();
        assert_eq!(config.max_clients, 32768);
        assert_eq!(config.client_start, 8192);
        assert_eq!(config.client_size, 128);
        assert_eq!(config.server_size, 512);
        assert!(config.validate().is_err());
        assert!(LedgerConfig::for_server("mds1_UUID").validate().is_ok());
    }

    #[test]
    fn test_validate_geometry() {
        let mut config = LedgerConfig::for_server("mds1_UUID");
        config.client_size = 16;
        assert!(matches!(config.validate(), Err(RecoveryError::InvalidConfig(_))));

        let mut config = LedgerConfig::for_server("mds1_UUID");
        config.client_start = 256;
        assert!(config.validate().is_err());

        let config = LedgerConfig::for_server("x".repeat(UUID_LEN));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "server_uuid = \"mds7_UUID\"\nmax_clients = 64").unwrap();

        let config = LedgerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server_uuid, "mds7_UUID");
        assert_eq!(config.max_clients, 64);
        assert_eq!(config.client_size, 128);
    }

    #[test]
    fn test_from_json_file_validates() {
        let mut file = Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(file, "{{\"max_clients\": 4}}").unwrap();
        assert!(LedgerConfig::from_file(file.path()).is_err());
    }
}
