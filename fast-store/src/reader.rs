//! Read-only API over the published cache projections.
//!
//! Each lookup is a single cache `get` plus a JSON decode. A miss is
//! returned as `Ok(None)` for the caller to decide on; only transport and
//! corruption problems are errors.

use crate::kv::{KvCache, KvError};
use crate::maps;
use crate::model::{ApiKeyBinding, EnrichedConnection, StreamWithDestinations};
use serde::de::DeserializeOwned;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum FastStoreError {
    #[error("cache error: {0}")]
    Kv(#[from] KvError),

    #[error("corrupt cache entry {map}/{key}: {source}")]
    Corrupt {
        map: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Clone)]
pub struct FastStore {
    kv: Arc<dyn KvCache>,
}

impl FastStore {
    pub fn new(kv: Arc<dyn KvCache>) -> Self {
        FastStore { kv }
    }

    /// All streams filed under a domain, case-insensitively. Streams without
    /// configured domains live under the [`maps::NO_DOMAIN`] bucket only.
    pub async fn streams_by_domain(
        &self,
        domain: &str,
    ) -> Result<Option<Vec<StreamWithDestinations>>, FastStoreError> {
        self.get(maps::STREAMS_BY_DOMAIN, &domain.to_lowercase())
            .await
    }

    pub async fn stream_by_id(
        &self,
        id: &str,
    ) -> Result<Option<StreamWithDestinations>, FastStoreError> {
        self.get(maps::STREAMS_BY_ID, id).await
    }

    pub async fn api_key_binding(
        &self,
        key_id: &str,
    ) -> Result<Option<ApiKeyBinding>, FastStoreError> {
        self.get(maps::API_KEYS, key_id).await
    }

    pub async fn enriched_connection(
        &self,
        link_id: &str,
    ) -> Result<Option<EnrichedConnection>, FastStoreError> {
        self.get(maps::CONNECTIONS, link_id).await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        map: &str,
        key: &str,
    ) -> Result<Option<T>, FastStoreError> {
        match self.kv.hget(map, key).await? {
            Some(raw) => {
                let value =
                    serde_json::from_str(&raw).map_err(|source| FastStoreError::Corrupt {
                        map: map.to_string(),
                        key: key.to_string(),
                        source,
                    })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}
