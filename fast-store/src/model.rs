//! Cached configuration entities.
//!
//! These are denormalized, disposable projections of the relational
//! configuration records. They are fully reconstructed on each refresh cycle
//! and carry no identity beyond the current materialized view.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Distinguishes browser write keys from server-to-server write keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyClass {
    Browser,
    S2s,
}

impl KeyClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyClass::Browser => "browser",
            KeyClass::S2s => "s2s",
        }
    }
}

/// A hashed API key attached to a stream. The plaintext secret is never
/// stored; `hash` is the hex sha256 of the secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// An event-source identity, as cached.
///
/// Keys in `public_keys` are browser-class, keys in `private_keys` are
/// server-to-server-class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    pub id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub public_keys: Vec<ApiKey>,
    #[serde(default)]
    pub private_keys: Vec<ApiKey>,
}

/// Closed catalog of destination types.
///
/// Unknown type ids are a decode-time error: a destination row with a type
/// outside this catalog indicates a data-integrity bug upstream and fails the
/// refresh cycle rather than being silently skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DestinationKind {
    Webhook,
    Postgres,
    Mysql,
    Clickhouse,
    Bigquery,
    Snowflake,
    Redshift,
    Mongodb,
    S3,
    Gcs,
    Kafka,
    Mixpanel,
    Amplitude,
    Posthog,
    Hubspot,
    Intercom,
    June,
    #[serde(rename = "gtm")]
    Gtm,
    #[serde(rename = "ga4-tag")]
    Ga4Tag,
    #[serde(rename = "logrocket")]
    Logrocket,
    /// Synthetic type used for workspace event backups.
    BlockStorage,
}

impl DestinationKind {
    /// Device-mode destinations run in the caller's browser; their options are
    /// returned in the ingest response instead of being forwarded server-side.
    pub fn is_device(&self) -> bool {
        matches!(
            self,
            DestinationKind::Gtm | DestinationKind::Ga4Tag | DestinationKind::Logrocket
        )
    }
}

/// A sink identity, as cached. Everything in the configuration blob that is
/// not the type tag or the display name is treated as credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationConfig {
    pub id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub name: String,
    pub destination_type: DestinationKind,
    #[serde(flatten)]
    pub credentials: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    #[default]
    Batch,
    Stream,
}

/// Connection-specific options carried on a stream → destination link.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkOptions {
    #[serde(default)]
    pub mode: LinkMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_layout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub deduplicate: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<String>,
}

/// A destination as seen from a stream's fan-out record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedDestination {
    pub id: String,
    pub connection_id: String,
    pub destination_type: DestinationKind,
    #[serde(default)]
    pub options: LinkOptions,
    #[serde(default)]
    pub credentials: Map<String, Value>,
}

/// Materialized join of a link with its stream and destination, cached by
/// link id so consumers resolve a connection in one lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedConnection {
    pub id: String,
    pub workspace_id: String,
    pub stream_id: String,
    pub destination_id: String,
    pub destination_type: DestinationKind,
    #[serde(default)]
    pub options: LinkOptions,
    #[serde(default)]
    pub credentials: Map<String, Value>,
    /// Content hash over `credentials`; lets consumers detect credential
    /// changes without comparing the whole blob.
    pub credentials_hash: String,
}

/// One stream plus all destinations attached to it, split into device-mode
/// (synchronous) and forwarded (asynchronous) lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamWithDestinations {
    pub stream: StreamConfig,
    #[serde(default)]
    pub synchronous_destinations: Vec<EnrichedDestination>,
    #[serde(default)]
    pub asynchronous_destinations: Vec<EnrichedDestination>,
    #[serde(default)]
    pub backup_enabled: bool,
}

impl StreamWithDestinations {
    pub fn without_destinations(stream: StreamConfig, backup_enabled: bool) -> Self {
        StreamWithDestinations {
            stream,
            synchronous_destinations: Vec::new(),
            asynchronous_destinations: Vec::new(),
            backup_enabled,
        }
    }
}

/// Maps a key id to what is needed to verify a write key without scanning
/// all streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyBinding {
    pub hash: String,
    pub key_class: KeyClass,
    pub stream_id: String,
}

/// Hex sha256 of an API key secret. The CRUD layer stores hashes produced the
/// same way; the router verifies presented secrets against them.
pub fn hash_api_key_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Content hash over a credentials object.
///
/// `serde_json::Map` keeps keys sorted, so serializing it yields a canonical
/// byte sequence and the hash is stable across refreshes.
pub fn credentials_hash(credentials: &Map<String, Value>) -> String {
    let bytes = serde_json::to_vec(credentials).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Merges a type-specific configuration blob with the generic envelope
/// fields into one flat object. Envelope fields win on conflict.
pub fn flatten_config(envelope: &Map<String, Value>, blob: &Value) -> Value {
    let mut merged = match blob {
        Value::Object(fields) => fields.clone(),
        _ => Map::new(),
    };
    for (key, value) in envelope {
        merged.insert(key.clone(), value.clone());
    }
    Value::Object(merged)
}
