//! Configuration types for the REM database.
//!
//! The [`Config`] struct controls database behavior including:
//! - Tenant scoping (every key and stream is partitioned by tenant)
//! - Default embedding provider and planner model
//! - Replication peers and optional entry encryption
//!
//! # Example
//! ```rust
//! use remdb::Config;
//!
//! // Use defaults (tenant "default", builtin hash embeddings)
//! let config = Config::default();
//!
//! // Customize for production
//! let config = Config {
//!     tenant_id: "acme".to_string(),
//!     default_embedding_provider: "all-MiniLM-L6-v2".to_string(),
//!     ..Default::default()
//! };
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Environment variable for the database root path.
pub const ENV_DB_PATH: &str = "P8_DB_PATH";
/// Environment variable for the tenant id.
pub const ENV_TENANT_ID: &str = "P8_TENANT_ID";
/// Environment variable for the default embedding provider name.
pub const ENV_DEFAULT_EMBEDDING: &str = "P8_DEFAULT_EMBEDDING";
/// Environment variable for the default planner model.
pub const ENV_DEFAULT_LLM: &str = "P8_DEFAULT_LLM";
/// Environment variable listing replication peers (`peer@host:port,...`).
pub const ENV_REPLICATION_PEERS: &str = "REM_REPLICATION_PEERS";
/// Environment variable for the replication tenant scope.
pub const ENV_REPLICATION_TENANT_ID: &str = "REM_REPLICATION_TENANT_ID";

/// Database configuration options.
///
/// All fields have sensible defaults. Use struct update syntax to override
/// specific settings:
///
/// ```rust
/// use remdb::Config;
///
/// let config = Config {
///     tenant_id: "tenant-a".to_string(),
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Tenant this database instance is scoped to.
    pub tenant_id: String,

    /// Default embedding provider bound to schemas that don't name one.
    ///
    /// Must be present in the provider registry. The default,
    /// `builtin-hash`, needs no network or model files.
    pub default_embedding_provider: String,

    /// Model identifier passed to the LLM planner, if one is attached.
    pub planner_model: String,

    /// Whether the background embedding worker runs.
    ///
    /// When disabled, `insert` never enqueues embedding work and `SEARCH`
    /// only sees vectors supplied inline by the caller.
    pub enable_embeddings: bool,

    /// Capacity of the bounded embedding queue.
    ///
    /// When the queue is full, writers block until the worker drains it,
    /// which bounds memory under sustained overload.
    pub embedding_queue_capacity: usize,

    /// Maximum embed attempts per queued item before the failure is
    /// recorded on the entity as `embedding_error`.
    pub embedding_max_attempts: u32,

    /// HNSW vector index parameters.
    pub hnsw: HnswConfig,

    /// Replication settings; `None` disables the peer mesh.
    pub replication: Option<ReplicationConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tenant_id: "default".to_string(),
            // builtin-hash is the safe default - deterministic, no model files
            default_embedding_provider: "builtin-hash".to_string(),
            planner_model: "gpt-4.1-mini".to_string(),
            enable_embeddings: true,
            embedding_queue_capacity: 1024,
            embedding_max_attempts: 3,
            hnsw: HnswConfig::default(),
            replication: None,
        }
    }
}

impl Config {
    /// Creates a new Config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a Config for the given tenant.
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Default::default()
        }
    }

    /// Builds a Config from process environment variables.
    ///
    /// Reads `P8_TENANT_ID`, `P8_DEFAULT_EMBEDDING`, `P8_DEFAULT_LLM`,
    /// `REM_REPLICATION_PEERS` and `REM_REPLICATION_TENANT_ID`. The database
    /// path itself (`P8_DB_PATH`) is read by [`crate::RemDb::open_from_env`].
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(tenant) = std::env::var(ENV_TENANT_ID) {
            if !tenant.is_empty() {
                config.tenant_id = tenant;
            }
        }
        if let Ok(provider) = std::env::var(ENV_DEFAULT_EMBEDDING) {
            if !provider.is_empty() {
                config.default_embedding_provider = provider;
            }
        }
        if let Ok(model) = std::env::var(ENV_DEFAULT_LLM) {
            if !model.is_empty() {
                config.planner_model = model;
            }
        }

        if let Ok(peers) = std::env::var(ENV_REPLICATION_PEERS) {
            let tenant = std::env::var(ENV_REPLICATION_TENANT_ID)
                .unwrap_or_else(|_| config.tenant_id.clone());
            let peers = PeerAddress::parse_list(&peers);
            if !peers.is_empty() {
                // Identity and bind address fall back to deployable
                // defaults; override on the returned Config when several
                // instances share a host
                config.replication = Some(ReplicationConfig {
                    peer_id: format!("{}-node", config.tenant_id),
                    listen_addr: "0.0.0.0:9000".to_string(),
                    peers,
                    tenant_id: tenant,
                    encryption_key: None,
                });
            }
        }

        config
    }

    /// Validates the configuration.
    ///
    /// Called automatically by `RemDb::open()`. You can also call this
    /// explicitly to check configuration before attempting to open.
    ///
    /// # Errors
    /// Returns `ValidationError` if:
    /// - `tenant_id` is empty or contains `/` (reserved as key separator)
    /// - queue capacity or retry attempts are zero
    /// - HNSW parameters are zero
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.tenant_id.is_empty() {
            return Err(ValidationError::required_field("tenant_id"));
        }
        if self.tenant_id.contains('/') {
            return Err(ValidationError::invalid_field(
                "tenant_id",
                "must not contain '/' (reserved as key separator)",
            ));
        }
        if self.embedding_queue_capacity == 0 {
            return Err(ValidationError::invalid_field(
                "embedding_queue_capacity",
                "must be greater than 0",
            ));
        }
        if self.embedding_max_attempts == 0 {
            return Err(ValidationError::invalid_field(
                "embedding_max_attempts",
                "must be greater than 0",
            ));
        }

        if self.hnsw.max_nb_connection == 0 {
            return Err(ValidationError::invalid_field(
                "hnsw.max_nb_connection",
                "must be greater than 0",
            ));
        }
        if self.hnsw.ef_construction == 0 {
            return Err(ValidationError::invalid_field(
                "hnsw.ef_construction",
                "must be greater than 0",
            ));
        }
        if self.hnsw.ef_search == 0 {
            return Err(ValidationError::invalid_field(
                "hnsw.ef_search",
                "must be greater than 0",
            ));
        }

        if let Some(replication) = &self.replication {
            replication.validate()?;
        }

        Ok(())
    }
}

/// Configuration for the HNSW vector index.
///
/// Controls the trade-off between index build time, memory usage,
/// and search accuracy. Defaults are tuned for per-schema indexes in the
/// 10K-500K vector range.
///
/// # Tuning Guide
///
/// | Use Case     | M  | ef_construction | ef_search |
/// |--------------|----|-----------------|-----------|
/// | Low memory   |  8 |             100 |        30 |
/// | Balanced     | 16 |             200 |        50 |
/// | High recall  | 32 |             400 |       100 |
#[derive(Clone, Debug)]
pub struct HnswConfig {
    /// Maximum bidirectional connections per node (M parameter).
    ///
    /// Higher values improve recall but increase memory and build time.
    /// Default: 16
    pub max_nb_connection: usize,

    /// Number of candidates tracked during index construction.
    ///
    /// Rule of thumb: ef_construction >= 2 * max_nb_connection.
    /// Default: 200
    pub ef_construction: usize,

    /// Number of candidates tracked during search.
    ///
    /// Must be >= k (the number of results requested).
    /// Default: 50
    pub ef_search: usize,

    /// Maximum number of layers in the skip-list structure.
    /// Default: 16
    pub max_layer: usize,

    /// Initial pre-allocated capacity (number of vectors).
    /// Default: 10_000
    pub max_elements: usize,

    /// Tombstone ratio above which the graph is rebuilt on the next insert.
    ///
    /// Deleted vectors stay in the graph (filtered from search) until the
    /// ratio of deleted to total crosses this threshold.
    /// Default: 0.3
    pub rebuild_tombstone_ratio: f32,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            max_nb_connection: 16,
            ef_construction: 200,
            ef_search: 50,
            max_layer: 16,
            max_elements: 10_000,
            rebuild_tombstone_ratio: 0.3,
        }
    }
}

/// Replication configuration: this node's identity plus its peer mesh.
#[derive(Clone, Debug, Default)]
pub struct ReplicationConfig {
    /// This instance's peer id, carried on every WAL entry it originates.
    pub peer_id: String,

    /// Address the replication server binds to, e.g. `0.0.0.0:9000`.
    pub listen_addr: String,

    /// Peers this instance subscribes to.
    pub peers: Vec<PeerAddress>,

    /// Tenant scope replicated over this mesh.
    pub tenant_id: String,

    /// Optional 32-byte ChaCha20-Poly1305 key for sealing entries on
    /// cross-tenant streams. `None` sends entries in the clear.
    pub encryption_key: Option<[u8; 32]>,
}

impl ReplicationConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.peer_id.is_empty() {
            return Err(ValidationError::required_field("replication.peer_id"));
        }
        if self.listen_addr.is_empty() {
            return Err(ValidationError::required_field("replication.listen_addr"));
        }
        for peer in &self.peers {
            if peer.peer_id.is_empty() || peer.address.is_empty() {
                return Err(ValidationError::invalid_field(
                    "replication.peers",
                    "peer entries need both an id and an address",
                ));
            }
        }
        Ok(())
    }
}

/// A single replication peer: identity plus network address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Unique identifier for the peer instance.
    pub peer_id: String,
    /// `host:port` the peer's replication server listens on.
    pub address: String,
}

impl PeerAddress {
    /// Creates a peer address.
    pub fn new(peer_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            address: address.into(),
        }
    }

    /// Parses a `peer@host:port,peer2@host2:port2` list.
    ///
    /// Entries without an `@` separator are skipped. This is the format of
    /// the `REM_REPLICATION_PEERS` environment variable.
    pub fn parse_list(value: &str) -> Vec<PeerAddress> {
        value
            .split(',')
            .filter_map(|entry| {
                let entry = entry.trim();
                let (peer_id, address) = entry.split_once('@')?;
                if peer_id.is_empty() || address.is_empty() {
                    return None;
                }
                Some(PeerAddress::new(peer_id, address))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.tenant_id, "default");
        assert_eq!(config.default_embedding_provider, "builtin-hash");
        assert!(config.enable_embeddings);
        assert!(config.replication.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_for_tenant() {
        let config = Config::for_tenant("acme");
        assert_eq!(config.tenant_id, "acme");
    }

    #[test]
    fn test_validate_empty_tenant() {
        let config = Config {
            tenant_id: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_tenant_with_separator() {
        let config = Config {
            tenant_id: "a/b".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ValidationError::InvalidField { field, .. } if field == "tenant_id"));
    }

    #[test]
    fn test_validate_zero_queue_capacity() {
        let config = Config {
            embedding_queue_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_hnsw_zero_ef_search() {
        let config = Config {
            hnsw: HnswConfig {
                ef_search: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_peer_list_parsing() {
        let peers = PeerAddress::parse_list("instance-a@localhost:9000, instance-b@db2:9001");
        assert_eq!(
            peers,
            vec![
                PeerAddress::new("instance-a", "localhost:9000"),
                PeerAddress::new("instance-b", "db2:9001"),
            ]
        );
    }

    #[test]
    fn test_peer_list_skips_malformed_entries() {
        let peers = PeerAddress::parse_list("no-separator,@missing-id,ok@host:1");
        assert_eq!(peers, vec![PeerAddress::new("ok", "host:1")]);
    }

    #[test]
    fn test_replication_config_validation() {
        let config = Config {
            replication: Some(ReplicationConfig {
                peer_id: "instance-a".to_string(),
                listen_addr: "127.0.0.1:9000".to_string(),
                peers: vec![PeerAddress::new("instance-b", "127.0.0.1:9001")],
                tenant_id: "default".to_string(),
                encryption_key: None,
            }),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let bad = Config {
            replication: Some(ReplicationConfig::default()),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
