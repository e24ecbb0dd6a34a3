//! The persisted log configuration and the local config/lock directory
//! the writer boots from.
//!
//! The config blob lives next to the leader lease so that whoever holds
//! the lease reads the matching configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use ct_core::signing::LogSigner;
use ct_store::{FsStore, S3Config, S3Store, Storage};

use crate::chain::AcceptancePolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to parse config: {0}")]
    Parse(String),
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
    #[error("log ID mismatch: key derives {derived}, config says {configured}")]
    LogIdMismatch { derived: String, configured: String },
}

/// The configuration blob, as persisted by `itko-setup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Checkpoint origin line.
    pub name: String,
    /// PEM ECDSA P-256 private key.
    pub key_path: String,
    /// base64 SHA-256 of the SPKI; sanity-checks the key file.
    #[serde(rename = "logID")]
    pub log_id: String,
    pub listen_address: String,
    /// Hex-character prefix length for index partitioning.
    pub mask_size: usize,
    /// Non-empty selects filesystem storage over S3.
    #[serde(default)]
    pub root_directory: String,
    #[serde(default)]
    pub s3_bucket: String,
    #[serde(default)]
    pub s3_region: String,
    #[serde(default)]
    pub s3_endpoint_url: String,
    #[serde(default)]
    pub s3_static_credential_user_name: String,
    #[serde(default)]
    pub s3_static_credential_password: String,
    /// RFC 3339 bounds of the leaf acceptance window.
    pub not_after_start: String,
    pub not_after_limit: String,
    /// Stage-1 flush period in milliseconds.
    #[serde(default = "default_flush_ms")]
    pub flush_ms: u64,
    /// When false, leaves with any (or no) EKU are accepted.
    #[serde(default = "default_require_server_auth_eku")]
    pub require_server_auth_eku: bool,
}

fn default_flush_ms() -> u64 {
    100
}

fn default_require_server_auth_eku() -> bool {
    true
}

impl GlobalConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Loads the signing key and checks it derives the configured log ID.
    pub fn load_signer(&self) -> Result<LogSigner, ConfigError> {
        let pem =
            std::fs::read_to_string(&self.key_path).map_err(|source| ConfigError::Read {
                path: self.key_path.clone(),
                source,
            })?;
        let signer = LogSigner::from_pem(&pem).map_err(|e| ConfigError::Invalid {
            field: "keyPath",
            reason: e.to_string(),
        })?;
        let derived = {
            use base64::Engine as _;
            base64::engine::general_purpose::STANDARD.encode(signer.log_id())
        };
        if derived != self.log_id {
            return Err(ConfigError::LogIdMismatch {
                derived,
                configured: self.log_id.clone(),
            });
        }
        Ok(signer)
    }

    pub fn build_store(&self) -> Result<Arc<dyn Storage>, ConfigError> {
        if !self.root_directory.is_empty() {
            return Ok(Arc::new(FsStore::new(&self.root_directory)));
        }
        let store = S3Store::new(S3Config {
            bucket: self.s3_bucket.clone(),
            region: self.s3_region.clone(),
            endpoint: self.s3_endpoint_url.clone(),
            access_key: self.s3_static_credential_user_name.clone(),
            secret_key: self.s3_static_credential_password.clone(),
        })
        .map_err(|e| ConfigError::Invalid {
            field: "s3EndpointUrl",
            reason: e.to_string(),
        })?;
        Ok(Arc::new(store))
    }

    pub fn acceptance_policy(&self) -> Result<AcceptancePolicy, ConfigError> {
        let not_after_start = parse_rfc3339("notAfterStart", &self.not_after_start)?;
        let not_after_limit = parse_rfc3339("notAfterLimit", &self.not_after_limit)?;
        if not_after_start >= not_after_limit {
            return Err(ConfigError::Invalid {
                field: "notAfterLimit",
                reason: "acceptance window is empty".to_string(),
            });
        }
        Ok(AcceptancePolicy {
            not_after_start,
            not_after_limit,
            require_server_auth_eku: self.require_server_auth_eku,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "name",
                reason: "empty".to_string(),
            });
        }
        if self.mask_size == 0 || self.mask_size % 2 != 0 || self.mask_size > 32 {
            return Err(ConfigError::Invalid {
                field: "maskSize",
                reason: "must be an even number of hex characters".to_string(),
            });
        }
        if self.root_directory.is_empty() && self.s3_bucket.is_empty() {
            return Err(ConfigError::Invalid {
                field: "rootDirectory",
                reason: "either rootDirectory or the s3 settings are required".to_string(),
            });
        }
        self.acceptance_policy()?;
        Ok(())
    }
}

fn parse_rfc3339(field: &'static str, value: &str) -> Result<OffsetDateTime, ConfigError> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|e| ConfigError::Invalid {
        field,
        reason: format!("{value:?}: {e}"),
    })
}

/// The writer's local state directory: `config.json` plus the lease db.
pub struct KvDir {
    dir: PathBuf,
}

impl KvDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join("config.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join("lock")
    }

    pub fn load_config(&self) -> Result<GlobalConfig, ConfigError> {
        GlobalConfig::load(&self.config_path())
    }

    pub fn store_config(&self, config: &GlobalConfig) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| ConfigError::Read {
            path: self.dir.display().to_string(),
            source,
        })?;
        let bytes = serde_json::to_vec_pretty(config).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(self.config_path(), bytes).map_err(|source| ConfigError::Read {
            path: self.config_path().display().to_string(),
            source,
        })
    }
}
