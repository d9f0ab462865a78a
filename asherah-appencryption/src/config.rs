//! Engine configuration.
//!
//! [`Config`] is the JSON-facing shape (PascalCase field names, durations in
//! whole seconds). [`Config::validate`] turns it into a [`ValidatedConfig`]
//! with typed adapter choices and the derived [`CryptoPolicy`].

use crate::error::{AsherahError, AsherahResult};
use crate::policy::CryptoPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::warn;
use zeroize::Zeroizing;

/// Configuration accepted by [`Asherah::setup`](crate::Asherah::setup).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of this service (required).
    #[serde(rename = "ServiceName")]
    pub service_name: String,

    /// Product that owns this service (required).
    #[serde(rename = "ProductID")]
    pub product_id: String,

    /// Seconds a key stays valid for new encryptions.
    #[serde(rename = "ExpireAfter", skip_serializing_if = "Option::is_none")]
    pub expire_after: Option<i64>,

    /// Seconds before a cached key is re-read from the metastore.
    #[serde(rename = "CheckInterval", skip_serializing_if = "Option::is_none")]
    pub check_interval: Option<i64>,

    /// `memory`, `rdbms`, or `dynamodb` (required).
    #[serde(rename = "Metastore")]
    pub metastore: String,

    /// Database path or `:memory:` (required when `Metastore` is `rdbms`).
    #[serde(rename = "ConnectionString", skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,

    /// `eventual`, `global`, or `session`.
    #[serde(rename = "ReplicaReadConsistency", skip_serializing_if = "Option::is_none")]
    pub replica_read_consistency: Option<String>,

    #[serde(rename = "DynamoDBEndpoint", skip_serializing_if = "Option::is_none")]
    pub dynamodb_endpoint: Option<String>,

    #[serde(rename = "DynamoDBRegion", skip_serializing_if = "Option::is_none")]
    pub dynamodb_region: Option<String>,

    #[serde(rename = "DynamoDBTableName", skip_serializing_if = "Option::is_none")]
    pub dynamodb_table_name: Option<String>,

    #[serde(rename = "SessionCacheMaxSize", skip_serializing_if = "Option::is_none")]
    pub session_cache_max_size: Option<i64>,

    /// Seconds an idle session stays cached.
    #[serde(rename = "SessionCacheDuration", skip_serializing_if = "Option::is_none")]
    pub session_cache_duration: Option<i64>,

    /// `static` or `aws` (required).
    #[serde(rename = "KMS", skip_serializing_if = "Option::is_none")]
    pub kms: Option<String>,

    /// Region name to key resource (required when `KMS` is `aws`).
    #[serde(rename = "RegionMap", skip_serializing_if = "Option::is_none")]
    pub region_map: Option<BTreeMap<String, String>>,

    #[serde(rename = "PreferredRegion", skip_serializing_if = "Option::is_none")]
    pub preferred_region: Option<String>,

    #[serde(rename = "EnableRegionSuffix", skip_serializing_if = "Option::is_none")]
    pub enable_region_suffix: Option<bool>,

    #[serde(rename = "EnableSessionCaching", skip_serializing_if = "Option::is_none")]
    pub enable_session_caching: Option<bool>,

    #[serde(rename = "Verbose", skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,

    /// Seconds new key timestamps are truncated to.
    #[serde(rename = "CreateDatePrecision", skip_serializing_if = "Option::is_none")]
    pub create_date_precision: Option<i64>,

    /// 64 hex characters overriding the static KMS master key.
    #[serde(rename = "StaticMasterKey", skip_serializing_if = "Option::is_none")]
    pub static_master_key: Option<String>,

    #[serde(rename = "AdapterTimeoutMillis", skip_serializing_if = "Option::is_none")]
    pub adapter_timeout_millis: Option<u64>,
}

/// Which KMS to build.
#[derive(Clone, PartialEq, Eq)]
pub enum KmsKind {
    Static {
        /// `None` selects the well-known development key.
        master_key: Option<Zeroizing<Vec<u8>>>,
    },
    MultiRegion {
        region_map: BTreeMap<String, String>,
        preferred_region: String,
    },
}

impl fmt::Debug for KmsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static { master_key } => f
                .debug_struct("Static")
                .field("master_key", &master_key.as_ref().map(|_| "[REDACTED]"))
                .finish(),
            Self::MultiRegion {
                region_map,
                preferred_region,
            } => f
                .debug_struct("MultiRegion")
                .field("region_map", region_map)
                .field("preferred_region", preferred_region)
                .finish(),
        }
    }
}

/// Which metastore to build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetastoreKind {
    Memory,
    Rdbms {
        connection_string: String,
    },
    /// No bundled adapter; one must be injected through the engine builder.
    DynamoDb {
        endpoint: Option<String>,
        region: Option<String>,
        table_name: Option<String>,
    },
}

/// A checked configuration, ready to build an engine from.
#[derive(Clone, Debug)]
pub struct ValidatedConfig {
    pub service_name: String,
    pub product_id: String,
    pub kms: KmsKind,
    pub metastore: MetastoreKind,
    pub policy: CryptoPolicy,
    pub region_suffix: Option<String>,
    pub verbose: bool,
}

fn config_error(msg: impl Into<String>) -> AsherahError {
    AsherahError::Config(msg.into())
}

fn positive(name: &str, value: Option<i64>, default: i64) -> AsherahResult<i64> {
    match value {
        None => Ok(default),
        Some(v) if v > 0 => Ok(v),
        Some(v) => Err(config_error(format!("{name} must be positive, got {v}"))),
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

impl Config {
    /// A minimal config using the static KMS and the in-memory metastore.
    pub fn new(service_name: &str, product_id: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            product_id: product_id.to_string(),
            kms: Some("static".to_string()),
            metastore: "memory".to_string(),
            ..Self::default()
        }
    }

    /// Parses a JSON config. `RegionMap` must be an object; comma-joined
    /// string forms are rejected.
    pub fn from_json(json: &str) -> AsherahResult<Self> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| config_error(format!("config is not valid JSON: {e}")))?;
        let Some(object) = value.as_object() else {
            return Err(config_error("config must be a JSON object"));
        };
        if object.get("RegionMap").is_some_and(serde_json::Value::is_string) {
            return Err(config_error(
                "RegionMap must be a JSON object of region to key ARN, not a string",
            ));
        }
        serde_json::from_value(value).map_err(|e| config_error(e.to_string()))
    }

    pub fn to_json(&self) -> AsherahResult<String> {
        serde_json::to_string(self).map_err(|e| config_error(e.to_string()))
    }

    pub fn validate(&self) -> AsherahResult<ValidatedConfig> {
        if self.service_name.is_empty() {
            return Err(config_error("ServiceName is required"));
        }
        if self.product_id.is_empty() {
            return Err(config_error("ProductID is required"));
        }

        let kms = self.validate_kms()?;
        let metastore = self.validate_metastore()?;
        let policy = self.policy()?;

        if let Some(consistency) = non_empty(&self.replica_read_consistency) {
            if !matches!(consistency, "eventual" | "global" | "session") {
                return Err(config_error(format!(
                    "ReplicaReadConsistency must be eventual, global, or session, got {consistency}"
                )));
            }
        }

        let region_suffix = if self.enable_region_suffix.unwrap_or(false) {
            match &metastore {
                MetastoreKind::DynamoDb { .. } => {
                    let region = non_empty(&self.dynamodb_region)
                        .or_else(|| non_empty(&self.preferred_region))
                        .ok_or_else(|| {
                            config_error(
                                "EnableRegionSuffix requires DynamoDBRegion or PreferredRegion",
                            )
                        })?;
                    Some(region.to_string())
                }
                _ => {
                    warn!("EnableRegionSuffix only applies to the dynamodb metastore; ignoring");
                    None
                }
            }
        } else {
            None
        };

        Ok(ValidatedConfig {
            service_name: self.service_name.clone(),
            product_id: self.product_id.clone(),
            kms,
            metastore,
            policy,
            region_suffix,
            verbose: self.verbose.unwrap_or(false),
        })
    }

    fn validate_kms(&self) -> AsherahResult<KmsKind> {
        match non_empty(&self.kms) {
            None => Err(config_error("KMS is required")),
            Some("static") => {
                let master_key = match non_empty(&self.static_master_key) {
                    None => None,
                    Some(encoded) => {
                        let bytes = Zeroizing::new(hex::decode(encoded).map_err(|e| {
                            AsherahError::KmsConfig(format!("StaticMasterKey is not hex: {e}"))
                        })?);
                        if bytes.len() != asherah_crypto::KEY_SIZE {
                            return Err(AsherahError::KmsConfig(format!(
                                "StaticMasterKey must be {} bytes, got {}",
                                asherah_crypto::KEY_SIZE,
                                bytes.len()
                            )));
                        }
                        Some(bytes)
                    }
                };
                Ok(KmsKind::Static { master_key })
            }
            Some("aws") => {
                let region_map = self
                    .region_map
                    .clone()
                    .filter(|map| !map.is_empty())
                    .ok_or_else(|| AsherahError::KmsConfig("RegionMap is required for KMS aws".into()))?;
                let preferred_region = non_empty(&self.preferred_region)
                    .ok_or_else(|| {
                        AsherahError::KmsConfig("PreferredRegion is required for KMS aws".into())
                    })?
                    .to_string();
                if !region_map.contains_key(&preferred_region) {
                    return Err(AsherahError::KmsConfig(format!(
                        "PreferredRegion {preferred_region} is not in RegionMap"
                    )));
                }
                Ok(KmsKind::MultiRegion {
                    region_map,
                    preferred_region,
                })
            }
            Some(other) => Err(config_error(format!(
                "unknown KMS {other:?} (expected static or aws)"
            ))),
        }
    }

    fn validate_metastore(&self) -> AsherahResult<MetastoreKind> {
        match self.metastore.as_str() {
            "" => Err(config_error("Metastore is required")),
            "memory" => Ok(MetastoreKind::Memory),
            "rdbms" => {
                let connection_string = non_empty(&self.connection_string)
                    .ok_or_else(|| config_error("ConnectionString is required for Metastore rdbms"))?;
                Ok(MetastoreKind::Rdbms {
                    connection_string: connection_string.to_string(),
                })
            }
            "dynamodb" => Ok(MetastoreKind::DynamoDb {
                endpoint: non_empty(&self.dynamodb_endpoint).map(str::to_string),
                region: non_empty(&self.dynamodb_region).map(str::to_string),
                table_name: non_empty(&self.dynamodb_table_name).map(str::to_string),
            }),
            other => Err(config_error(format!(
                "unknown Metastore {other:?} (expected memory, rdbms, or dynamodb)"
            ))),
        }
    }

    fn policy(&self) -> AsherahResult<CryptoPolicy> {
        let defaults = CryptoPolicy::default();

        let session_cache_max_size = positive(
            "SessionCacheMaxSize",
            self.session_cache_max_size,
            defaults.session_cache_max_size as i64,
        )?;
        let create_date_precision_secs = match self.create_date_precision {
            None => defaults.create_date_precision_secs,
            Some(v) if v >= 0 => v,
            Some(v) => {
                return Err(config_error(format!(
                    "CreateDatePrecision must not be negative, got {v}"
                )));
            }
        };
        let adapter_timeout = match self.adapter_timeout_millis {
            None => None,
            Some(0) => return Err(config_error("AdapterTimeoutMillis must be positive")),
            Some(ms) => Some(Duration::from_millis(ms)),
        };

        Ok(CryptoPolicy {
            expire_key_after_secs: positive(
                "ExpireAfter",
                self.expire_after,
                defaults.expire_key_after_secs,
            )?,
            revoke_check_interval_secs: positive(
                "CheckInterval",
                self.check_interval,
                defaults.revoke_check_interval_secs,
            )?,
            create_date_precision_secs,
            cache_sessions: self.enable_session_caching.unwrap_or(true),
            session_cache_max_size: usize::try_from(session_cache_max_size)
                .map_err(|e| config_error(format!("SessionCacheMaxSize: {e}")))?,
            session_cache_duration_secs: positive(
                "SessionCacheDuration",
                self.session_cache_duration,
                defaults.session_cache_duration_secs,
            )?,
            adapter_timeout,
            ..defaults
        })
    }
}
