//! Maps an inbound request to exactly one event stream.
//!
//! Resolution order: Basic auth write key, then the explicit write-key
//! header, then the request host (ingest subdomain slug or custom domain).
//! The first source that is present decides; it is never skipped in favor
//! of a later one.

use crate::errors::IngestError;
use crate::event::RequestMeta;
use fast_store::model::{KeyClass, StreamWithDestinations, hash_api_key_secret};
use fast_store::reader::FastStore;

pub struct StreamResolver {
    store: FastStore,
    /// Hostname whose subdomains address streams by id, e.g.
    /// `acme.ingest.example.com` for public host `ingest.example.com`.
    public_host: String,
    allow_bare_write_keys: bool,
}

impl StreamResolver {
    pub fn new(store: FastStore, public_host: String, allow_bare_write_keys: bool) -> Self {
        StreamResolver {
            store,
            public_host: public_host.to_lowercase(),
            allow_bare_write_keys,
        }
    }

    pub async fn resolve(
        &self,
        meta: &RequestMeta,
        key_class: KeyClass,
    ) -> Result<StreamWithDestinations, IngestError> {
        if let Some((id, secret)) = &meta.basic_auth {
            return self.resolve_credentials(id, secret, key_class).await;
        }
        if let Some(key) = &meta.write_key_header {
            return self.resolve_write_key(key, key_class).await;
        }
        self.resolve_host(&meta.host, key_class).await
    }

    /// Resolves a combined `id:secret` write key, as carried in the
    /// `X-Write-Key` header or a per-event `writeKey` field. A key without a
    /// colon addresses the stream by id directly when that shorthand is
    /// enabled.
    pub async fn resolve_write_key(
        &self,
        key: &str,
        key_class: KeyClass,
    ) -> Result<StreamWithDestinations, IngestError> {
        match key.split_once(':') {
            Some((id, secret)) => self.resolve_credentials(id, secret, key_class).await,
            None => {
                if !self.allow_bare_write_keys {
                    return Err(IngestError::InvalidWriteKey);
                }
                self.store
                    .stream_by_id(key)
                    .await?
                    .ok_or(IngestError::InvalidWriteKey)
            }
        }
    }

    async fn resolve_credentials(
        &self,
        key_id: &str,
        secret: &str,
        key_class: KeyClass,
    ) -> Result<StreamWithDestinations, IngestError> {
        let binding = self
            .store
            .api_key_binding(key_id)
            .await?
            .ok_or(IngestError::InvalidWriteKey)?;
        if binding.hash != hash_api_key_secret(secret) {
            return Err(IngestError::InvalidWriteKey);
        }
        if binding.key_class != key_class {
            return Err(IngestError::KeyClassMismatch {
                expected: key_class,
            });
        }
        self.store
            .stream_by_id(&binding.stream_id)
            .await?
            .ok_or_else(|| IngestError::StreamNotFound(binding.stream_id.clone()))
    }

    async fn resolve_host(
        &self,
        host: &str,
        key_class: KeyClass,
    ) -> Result<StreamWithDestinations, IngestError> {
        if host.is_empty() || host == self.public_host {
            return Err(IngestError::Malformed(
                "no write key and no stream-specific host".to_string(),
            ));
        }

        if let Some(slug) = host.strip_suffix(&format!(".{}", self.public_host)) {
            return self
                .store
                .stream_by_id(slug)
                .await?
                .ok_or_else(|| IngestError::StreamNotFound(slug.to_string()));
        }

        // Custom-domain requests are unauthenticated browser traffic.
        if key_class != KeyClass::Browser {
            return Err(IngestError::KeyClassMismatch {
                expected: key_class,
            });
        }
        let mut streams = self
            .store
            .streams_by_domain(host)
            .await?
            .unwrap_or_default();
        match streams.len() {
            0 => Err(IngestError::StreamNotFound(host.to_string())),
            1 => Ok(streams.remove(0)),
            _ => Err(IngestError::AmbiguousDomain(host.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fast_store::builder::FastStoreRefresh;
    use fast_store::model::ApiKey;
    use fast_store::testutils::{InMemoryKv, MemConfigStore};
    use std::sync::Arc;

    async fn resolver_for(store: MemConfigStore, bare_keys: bool) -> StreamResolver {
        let kv = Arc::new(InMemoryKv::default());
        FastStoreRefresh::new(Arc::new(store), kv.clone())
            .refresh()
            .await
            .unwrap();
        StreamResolver::new(
            FastStore::new(kv),
            "ingest.example.com".to_string(),
            bare_keys,
        )
    }

    fn store_with_acme() -> MemConfigStore {
        let mut store = MemConfigStore::default();
        store.add_stream(
            "acme",
            "ws1",
            &["data.acme.com"],
            vec![ApiKey {
                id: "pub1".into(),
                hash: Some(hash_api_key_secret("browser-secret")),
            }],
            vec![ApiKey {
                id: "priv1".into(),
                hash: Some(hash_api_key_secret("server-secret")),
            }],
        );
        store
    }

    #[tokio::test]
    async fn test_basic_auth_wins_over_host() {
        let resolver = resolver_for(store_with_acme(), true).await;
        let meta = RequestMeta {
            host: "nonsense.example.org".into(),
            basic_auth: Some(("pub1".into(), "browser-secret".into())),
            ..RequestMeta::default()
        };
        let stream = resolver.resolve(&meta, KeyClass::Browser).await.unwrap();
        assert_eq!(stream.stream.id, "acme");
    }

    #[tokio::test]
    async fn test_wrong_secret_is_unauthorized() {
        let resolver = resolver_for(store_with_acme(), true).await;
        let meta = RequestMeta {
            basic_auth: Some(("pub1".into(), "guess".into())),
            ..RequestMeta::default()
        };
        let err = resolver.resolve(&meta, KeyClass::Browser).await.unwrap_err();
        assert!(matches!(err, IngestError::InvalidWriteKey));
    }

    #[tokio::test]
    async fn test_browser_key_rejected_on_s2s_endpoint() {
        let resolver = resolver_for(store_with_acme(), true).await;
        let meta = RequestMeta {
            basic_auth: Some(("pub1".into(), "browser-secret".into())),
            ..RequestMeta::default()
        };
        let err = resolver.resolve(&meta, KeyClass::S2s).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::KeyClassMismatch {
                expected: KeyClass::S2s
            }
        ));
    }

    #[tokio::test]
    async fn test_write_key_header_resolves_s2s() {
        let resolver = resolver_for(store_with_acme(), true).await;
        let meta = RequestMeta {
            write_key_header: Some("priv1:server-secret".into()),
            ..RequestMeta::default()
        };
        let stream = resolver.resolve(&meta, KeyClass::S2s).await.unwrap();
        assert_eq!(stream.stream.id, "acme");
    }

    #[tokio::test]
    async fn test_bare_write_key_shorthand() {
        let resolver = resolver_for(store_with_acme(), true).await;
        let stream = resolver
            .resolve_write_key("acme", KeyClass::Browser)
            .await
            .unwrap();
        assert_eq!(stream.stream.id, "acme");

        let strict = resolver_for(store_with_acme(), false).await;
        let err = strict
            .resolve_write_key("acme", KeyClass::Browser)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidWriteKey));
    }

    #[tokio::test]
    async fn test_subdomain_slug_resolution() {
        let resolver = resolver_for(store_with_acme(), true).await;
        let meta = RequestMeta {
            host: "acme.ingest.example.com".into(),
            ..RequestMeta::default()
        };
        let stream = resolver.resolve(&meta, KeyClass::Browser).await.unwrap();
        assert_eq!(stream.stream.id, "acme");
    }

    #[tokio::test]
    async fn test_bare_public_host_is_rejected() {
        let resolver = resolver_for(store_with_acme(), true).await;
        let meta = RequestMeta {
            host: "ingest.example.com".into(),
            ..RequestMeta::default()
        };
        let err = resolver.resolve(&meta, KeyClass::Browser).await.unwrap_err();
        assert!(matches!(err, IngestError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_custom_domain_resolution() {
        let resolver = resolver_for(store_with_acme(), true).await;
        let meta = RequestMeta {
            host: "data.acme.com".into(),
            ..RequestMeta::default()
        };
        let stream = resolver.resolve(&meta, KeyClass::Browser).await.unwrap();
        assert_eq!(stream.stream.id, "acme");
    }

    #[tokio::test]
    async fn test_shared_domain_is_ambiguous() {
        let mut store = store_with_acme();
        store.add_stream("acme2", "ws1", &["data.acme.com"], vec![], vec![]);
        let resolver = resolver_for(store, true).await;
        let meta = RequestMeta {
            host: "data.acme.com".into(),
            ..RequestMeta::default()
        };
        let err = resolver.resolve(&meta, KeyClass::Browser).await.unwrap_err();
        assert!(matches!(err, IngestError::AmbiguousDomain(_)));
    }

    #[tokio::test]
    async fn test_unknown_domain_is_not_found() {
        let resolver = resolver_for(store_with_acme(), true).await;
        let meta = RequestMeta {
            host: "other.example.net".into(),
            ..RequestMeta::default()
        };
        let err = resolver.resolve(&meta, KeyClass::Browser).await.unwrap_err();
        assert!(matches!(err, IngestError::StreamNotFound(_)));
    }
}
