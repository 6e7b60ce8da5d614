//! Shop records and the shop/key resolver.
//!
//! A shop record carries everything the rest of the pipeline needs: domains
//! for the origin pre-check, ingestion secrets (current plus a previous one
//! during rotation), and per-platform destination settings. Records are JSON
//! files under `<data_dir>/shops/<domain>.json`, loaded through an in-process
//! read-through cache.
//!
//! The cache is the only in-process mutable state in the request path, and it
//! is purely a read-through copy: correctness never depends on it.

pub mod environment;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::types::{Platform, Region, ShopId};

pub use environment::{
    Environment, EnvironmentConfig, EnvironmentSnapshot, MissingCredentials, PlatformCredentials,
    required_credentials,
};

/// Errors resolving a shop.
#[derive(Debug, Error)]
pub enum ShopError {
    /// No record exists for the domain.
    #[error("unknown shop: {0}")]
    Unknown(String),

    /// The record exists but the shop is not active.
    #[error("inactive shop: {0}")]
    Inactive(String),

    /// The record could not be read or parsed.
    #[error("shop record error for {domain}: {source}")]
    Unreadable {
        domain: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result type for shop resolution.
pub type Result<T> = std::result::Result<T, ShopError>;

/// Ingestion secrets with a rotation grace window.
///
/// During rotation both secrets verify; once `previous` is removed, only the
/// current one does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionSecrets {
    pub current: String,
    #[serde(default)]
    pub previous: Option<String>,
}

/// Per-platform destination settings for a shop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformSettings {
    #[serde(default)]
    pub server_side_enabled: bool,
    #[serde(default)]
    pub client_side_enabled: bool,
    /// Whether this destination is treated as marketing for consent purposes.
    #[serde(default)]
    pub treat_as_marketing: bool,
    /// Whether this destination requires explicit sale-of-data consent.
    #[serde(default)]
    pub requires_sale_of_data: bool,
    #[serde(default)]
    pub region: Region,
    #[serde(default)]
    pub environment: EnvironmentConfig,
}

/// A resolved shop record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShopRecord {
    pub id: ShopId,
    /// Canonical shop domain, also the key for the record file.
    pub domain: String,
    /// Additional storefront domains accepted by the origin pre-check.
    #[serde(default)]
    pub storefront_domains: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    pub secrets: IngestionSecrets,
    /// When true, unsigned non-purchase telemetry is accepted at partial trust.
    #[serde(default)]
    pub signature_optional: bool,
    /// Reject untrusted requests outright instead of passing them through.
    #[serde(default = "default_strict")]
    pub strict_auth: bool,
    #[serde(default)]
    pub platforms: HashMap<Platform, PlatformSettings>,
    /// Ingestion requests allowed per shop per minute.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
}

fn default_active() -> bool {
    true
}

fn default_strict() -> bool {
    true
}

fn default_rate_limit() -> u32 {
    600
}

impl ShopRecord {
    /// Platforms with server-side delivery configured at all, in dispatch
    /// order. Consent filtering narrows this set further per event.
    pub fn configured_platforms(&self) -> Vec<Platform> {
        Platform::ALL
            .into_iter()
            .filter(|p| self.platforms.contains_key(p))
            .collect()
    }
}

/// Read-through resolver for shop records.
pub struct ShopResolver {
    shops_dir: PathBuf,
    cache: RwLock<HashMap<String, Arc<ShopRecord>>>,
}

impl ShopResolver {
    /// Creates a resolver rooted at `<data_dir>/shops`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            shops_dir: data_dir.into().join("shops"),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves an active shop by domain.
    pub async fn resolve(&self, domain: &str) -> Result<Arc<ShopRecord>> {
        if let Some(record) = self.cache.read().await.get(domain) {
            return check_active(record.clone());
        }

        let record = Arc::new(self.load(domain)?);
        self.cache
            .write()
            .await
            .insert(domain.to_string(), record.clone());
        check_active(record)
    }

    /// Drops a cached record, forcing a reload on next resolve.
    pub async fn invalidate(&self, domain: &str) {
        self.cache.write().await.remove(domain);
    }

    /// Persists a record to disk and drops any cached copy, so the next
    /// resolve sees the new state.
    pub async fn save(&self, record: &ShopRecord) -> Result<()> {
        let unreadable = |source: Box<dyn std::error::Error + Send + Sync>| ShopError::Unreadable {
            domain: record.domain.clone(),
            source,
        };

        std::fs::create_dir_all(&self.shops_dir).map_err(|err| unreadable(Box::new(err)))?;
        let bytes = serde_json::to_vec_pretty(record).map_err(|err| unreadable(Box::new(err)))?;
        let path = self.shops_dir.join(format!("{}.json", record.domain));
        std::fs::write(&path, bytes).map_err(|err| unreadable(Box::new(err)))?;

        self.invalidate(&record.domain).await;
        Ok(())
    }

    fn load(&self, domain: &str) -> Result<ShopRecord> {
        // Domains become file names; refuse anything that could escape.
        if domain.is_empty()
            || domain.contains('/')
            || domain.contains('\\')
            || domain.starts_with('.')
        {
            return Err(ShopError::Unknown(domain.to_string()));
        }

        let path = self.shops_dir.join(format!("{domain}.json"));
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ShopError::Unknown(domain.to_string()));
            }
            Err(err) => {
                return Err(ShopError::Unreadable {
                    domain: domain.to_string(),
                    source: Box::new(err),
                });
            }
        };

        serde_json::from_slice(&bytes).map_err(|err| ShopError::Unreadable {
            domain: domain.to_string(),
            source: Box::new(err),
        })
    }
}

fn check_active(record: Arc<ShopRecord>) -> Result<Arc<ShopRecord>> {
    if record.active {
        Ok(record)
    } else {
        Err(ShopError::Inactive(record.domain.clone()))
    }
}
