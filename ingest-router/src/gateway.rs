//! Ties resolution, stamping and delivery together into the responses the
//! ingest endpoints return.

use crate::delivery::{DeliveryError, EventForwarder};
use crate::errors::IngestError;
use crate::event::{EventKind, IngestEnvelope, RequestMeta, build_envelope};
use crate::metrics_defs::{BACKUP_FAILURES, DELIVERY_FAILURES, EVENTS_RECEIVED};
use crate::resolve::StreamResolver;
use fast_store::model::{KeyClass, StreamWithDestinations};
use serde_json::{Map, Value, json};
use shared::counter;
use std::sync::Arc;

pub struct IngestGateway {
    resolver: Arc<StreamResolver>,
    forwarder: EventForwarder,
}

impl IngestGateway {
    pub fn new(resolver: StreamResolver, forwarder: EventForwarder) -> Self {
        IngestGateway {
            resolver: Arc::new(resolver),
            forwarder,
        }
    }

    /// Handles one `POST /ingest/{type}` event.
    ///
    /// Delivery is fire-and-forget unless the caller asked for `?sync`; the
    /// response either way is the device-destination manifest so browser SDKs
    /// can run their client-side integrations.
    pub async fn handle_event(
        &self,
        kind: EventKind,
        key_class: KeyClass,
        meta: &RequestMeta,
        event: Value,
    ) -> Result<Value, IngestError> {
        let stream = self.resolver.resolve(meta, key_class).await?;
        let envelope = build_envelope(
            kind,
            key_class,
            meta,
            meta.write_key_id(),
            &stream.stream.id,
            event,
        )?;
        counter!(EVENTS_RECEIVED, "type" => kind.as_str()).increment(1);

        if meta.sync {
            self.deliver(&envelope, &stream).await?;
        } else {
            let forwarder = self.forwarder.clone();
            let workspace_id = stream.stream.workspace_id.clone();
            let backup_enabled = stream.backup_enabled;
            tokio::spawn(async move {
                if let Err(err) =
                    deliver_with(&forwarder, &envelope, &workspace_id, backup_enabled).await
                {
                    tracing::error!(%workspace_id, error = %err, "async event delivery failed");
                }
            });
        }

        Ok(device_manifest(&stream))
    }

    /// Handles `POST /ingest/batch`: a server-to-server payload carrying many
    /// events, each independently resolved and delivered. One bad event never
    /// fails its siblings.
    pub async fn handle_batch(
        &self,
        meta: &RequestMeta,
        body: Value,
    ) -> Result<Value, IngestError> {
        let (events, shared_context, batch_write_key) = split_batch(body)?;

        // The request-level stream is resolved once; a failure here only
        // matters for events without their own write key.
        let default_stream = match &batch_write_key {
            Some(key) => self.resolver.resolve_write_key(key, KeyClass::S2s).await,
            None => self.resolver.resolve(meta, KeyClass::S2s).await,
        };
        let default_stream = match default_stream {
            Ok(stream) => Ok(stream),
            Err(err) => Err(err.to_string()),
        };
        let default_write_key = batch_write_key
            .as_ref()
            .map(|key| key.split(':').next().unwrap_or(key).to_string())
            .or_else(|| meta.write_key_id());

        let received = events.len();
        let mut ok_events = 0usize;
        let mut errors: Vec<Value> = Vec::new();

        for (index, event) in events.into_iter().enumerate() {
            match self
                .process_batch_event(meta, &default_stream, &default_write_key, &shared_context, event)
                .await
            {
                Ok(()) => ok_events += 1,
                Err(err) => errors.push(json!({
                    "event": index,
                    "error": err.to_string(),
                })),
            }
        }

        let mut response = json!({
            "ok": errors.is_empty(),
            "receivedEvents": received,
            "okEvents": ok_events,
        });
        if !errors.is_empty() {
            response["errors"] = Value::Array(errors);
        }
        Ok(response)
    }

    async fn process_batch_event(
        &self,
        meta: &RequestMeta,
        default_stream: &Result<StreamWithDestinations, String>,
        default_write_key: &Option<String>,
        shared_context: &Option<Map<String, Value>>,
        mut event: Value,
    ) -> Result<(), IngestError> {
        let fields = event
            .as_object_mut()
            .ok_or_else(|| IngestError::Malformed("batch entry must be a JSON object".into()))?;

        let kind = fields
            .get("type")
            .and_then(Value::as_str)
            .and_then(EventKind::parse)
            .ok_or_else(|| {
                IngestError::UnknownEventType(
                    fields
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("missing")
                        .to_string(),
                )
            })?;

        if let Some(shared) = shared_context {
            merge_context(fields, shared);
        }

        // An entry-level `writeKey` overrides both the stream and the key id
        // reported in the envelope.
        let (stream, write_key) = match fields.get("writeKey").and_then(Value::as_str) {
            Some(key) => {
                let key = key.to_string();
                fields.remove("writeKey");
                let stream = self.resolver.resolve_write_key(&key, KeyClass::S2s).await?;
                let key_id = key.split(':').next().unwrap_or(&key).to_string();
                (stream, Some(key_id))
            }
            None => (
                default_stream.clone().map_err(IngestError::Internal)?,
                default_write_key.clone(),
            ),
        };

        let envelope = build_envelope(kind, KeyClass::S2s, meta, write_key, &stream.stream.id, event)?;
        counter!(EVENTS_RECEIVED, "type" => kind.as_str()).increment(1);
        self.deliver(&envelope, &stream).await?;
        Ok(())
    }

    async fn deliver(
        &self,
        envelope: &IngestEnvelope,
        stream: &StreamWithDestinations,
    ) -> Result<(), DeliveryError> {
        deliver_with(
            &self.forwarder,
            envelope,
            &stream.stream.workspace_id,
            stream.backup_enabled,
        )
        .await
    }
}

/// Primary forward, then the backup copy strictly after the primary settled.
/// A failed backup is logged and counted but never fails the event.
async fn deliver_with(
    forwarder: &EventForwarder,
    envelope: &IngestEnvelope,
    workspace_id: &str,
    backup_enabled: bool,
) -> Result<(), DeliveryError> {
    let primary = forwarder.forward(envelope).await;
    if primary.is_err() {
        counter!(DELIVERY_FAILURES).increment(1);
    }
    if backup_enabled {
        if let Err(err) = forwarder
            .forward_backup(workspace_id, &envelope.http_payload)
            .await
        {
            counter!(BACKUP_FAILURES).increment(1);
            tracing::error!(workspace_id, error = %err, "backup delivery failed");
        }
    }
    primary
}

/// The client-side integration manifest returned to browser SDKs.
fn device_manifest(stream: &StreamWithDestinations) -> Value {
    if stream.synchronous_destinations.is_empty() {
        return json!({"ok": true});
    }
    let destinations: Vec<Value> = stream
        .synchronous_destinations
        .iter()
        .map(|destination| {
            json!({
                "id": destination.id,
                "destinationType": destination.destination_type,
                "options": destination.options,
                "credentials": destination.credentials,
            })
        })
        .collect();
    json!({"ok": true, "destinations": destinations})
}

type BatchParts = (Vec<Value>, Option<Map<String, Value>>, Option<String>);

/// Accepts either a bare JSON array of events or an object with a `batch`
/// array plus optional request-level `context` and `writeKey`.
fn split_batch(body: Value) -> Result<BatchParts, IngestError> {
    match body {
        Value::Array(events) => Ok((events, None, None)),
        Value::Object(mut fields) => {
            let events = match fields.remove("batch") {
                Some(Value::Array(events)) => events,
                _ => {
                    return Err(IngestError::Malformed(
                        "batch body must contain a `batch` array".into(),
                    ));
                }
            };
            let context = match fields.remove("context") {
                Some(Value::Object(context)) => Some(context),
                _ => None,
            };
            let write_key = fields
                .get("writeKey")
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok((events, context, write_key))
        }
        _ => Err(IngestError::Malformed(
            "batch body must be an array or object".into(),
        )),
    }
}

/// Folds the request-level context into one event's context. Event-level
/// values win on conflict.
fn merge_context(fields: &mut Map<String, Value>, shared: &Map<String, Value>) {
    let context = fields
        .entry("context")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(context) = context.as_object_mut() {
        for (key, value) in shared {
            context.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fast_store::builder::FastStoreRefresh;
    use fast_store::model::{ApiKey, hash_api_key_secret};
    use fast_store::reader::FastStore;
    use fast_store::testutils::{InMemoryKv, MemConfigStore};
    use serde_json::json;
    use std::time::Duration;
    use url::Url;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn gateway_for(store: MemConfigStore, bulker: &MockServer) -> IngestGateway {
        let kv = Arc::new(InMemoryKv::default());
        FastStoreRefresh::new(Arc::new(store), kv.clone())
            .refresh()
            .await
            .unwrap();
        let resolver = StreamResolver::new(
            FastStore::new(kv),
            "ingest.example.com".to_string(),
            true,
        );
        let forwarder = EventForwarder::new(
            Url::parse(&bulker.uri()).unwrap(),
            None,
            Duration::from_secs(5),
            1,
            Duration::from_millis(1),
        )
        .unwrap();
        IngestGateway::new(resolver, forwarder)
    }

    fn store_with_keys() -> MemConfigStore {
        let mut store = MemConfigStore::default();
        store.add_stream(
            "acme",
            "ws1",
            &["data.acme.com"],
            vec![],
            vec![ApiKey {
                id: "priv1".into(),
                hash: Some(hash_api_key_secret("server-secret")),
            }],
        );
        store
    }

    fn sync_meta() -> RequestMeta {
        RequestMeta {
            host: "data.acme.com".into(),
            sync: true,
            ..RequestMeta::default()
        }
    }

    #[tokio::test]
    async fn test_sync_event_is_delivered_before_response() {
        let bulker = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .and(body_partial_json(json!({"type": "track"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&bulker)
            .await;

        let gateway = gateway_for(store_with_keys(), &bulker).await;
        let response = gateway
            .handle_event(
                EventKind::Track,
                KeyClass::Browser,
                &sync_meta(),
                json!({"event": "signup"}),
            )
            .await
            .unwrap();
        assert_eq!(response, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_device_destinations_are_returned_not_forwarded() {
        let bulker = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&bulker)
            .await;

        let mut store = store_with_keys();
        store.add_destination(
            "tag1",
            "ws1",
            json!({"destinationType": "gtm", "containerId": "GTM-XYZ"}),
        );
        store.add_link("l1", "acme", "tag1", json!({"mode": "stream"}));

        let gateway = gateway_for(store, &bulker).await;
        let response = gateway
            .handle_event(
                EventKind::Page,
                KeyClass::Browser,
                &sync_meta(),
                json!({"name": "home"}),
            )
            .await
            .unwrap();

        let destinations = response["destinations"].as_array().unwrap();
        assert_eq!(destinations.len(), 1);
        assert_eq!(destinations[0]["destinationType"], "gtm");
        assert_eq!(destinations[0]["credentials"]["containerId"], "GTM-XYZ");
    }

    #[tokio::test]
    async fn test_sync_delivery_failure_surfaces() {
        let bulker = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&bulker)
            .await;

        let gateway = gateway_for(store_with_keys(), &bulker).await;
        let err = gateway
            .handle_event(
                EventKind::Track,
                KeyClass::Browser,
                &sync_meta(),
                json!({"event": "signup"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::DeliveryFailed(_)));
    }

    #[tokio::test]
    async fn test_backup_copy_follows_primary() {
        let bulker = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&bulker)
            .await;
        Mock::given(method("POST"))
            .and(path("/post/ws1_backup"))
            .and(query_param("tableName", "backup"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&bulker)
            .await;

        let mut store = store_with_keys();
        store.enable_backup("ws1");

        let gateway = gateway_for(store, &bulker).await;
        gateway
            .handle_event(
                EventKind::Track,
                KeyClass::Browser,
                &sync_meta(),
                json!({"event": "signup"}),
            )
            .await
            .unwrap();

        // The backup copy is only sent after the primary forward settled.
        let received = bulker.received_requests().await.unwrap();
        let paths: Vec<&str> = received.iter().map(|r| r.url.path()).collect();
        assert_eq!(paths, vec!["/ingest", "/post/ws1_backup"]);
    }

    #[tokio::test]
    async fn test_backup_still_follows_a_failed_primary() {
        let bulker = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&bulker)
            .await;
        Mock::given(method("POST"))
            .and(path("/post/ws1_backup"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&bulker)
            .await;

        let mut store = store_with_keys();
        store.enable_backup("ws1");

        let gateway = gateway_for(store, &bulker).await;
        let err = gateway
            .handle_event(
                EventKind::Track,
                KeyClass::Browser,
                &sync_meta(),
                json!({"event": "signup"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::DeliveryFailed(_)));

        let received = bulker.received_requests().await.unwrap();
        let paths: Vec<&str> = received.iter().map(|r| r.url.path()).collect();
        assert_eq!(paths, vec!["/ingest", "/post/ws1_backup"]);
    }

    #[tokio::test]
    async fn test_batch_partial_failure() {
        let bulker = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(200))
            .expect(4)
            .mount(&bulker)
            .await;

        let gateway = gateway_for(store_with_keys(), &bulker).await;
        let meta = RequestMeta {
            write_key_header: Some("priv1:server-secret".into()),
            ..RequestMeta::default()
        };
        let body = json!({
            "context": {"library": "backend-sdk"},
            "batch": [
                {"type": "track", "event": "a"},
                {"type": "identify", "userId": "u1"},
                {"type": "track", "event": "orphan", "writeKey": "ghost"},
                {"type": "page", "name": "home"},
                {"type": "track", "event": "b"},
            ],
        });

        let response = gateway.handle_batch(&meta, body).await.unwrap();
        assert_eq!(response["ok"], false);
        assert_eq!(response["receivedEvents"], 5);
        assert_eq!(response["okEvents"], 4);
        let errors = response["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["event"], 2);
    }

    #[tokio::test]
    async fn test_batch_shared_context_does_not_override_event_context() {
        let bulker = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .and(body_partial_json(json!({
                "httpPayload": {
                    "context": {"library": "backend-sdk", "locale": "de"},
                }
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&bulker)
            .await;

        let gateway = gateway_for(store_with_keys(), &bulker).await;
        let meta = RequestMeta {
            write_key_header: Some("priv1:server-secret".into()),
            ..RequestMeta::default()
        };
        let body = json!({
            "context": {"library": "backend-sdk", "locale": "en"},
            "batch": [
                {"type": "track", "event": "a", "context": {"locale": "de"}},
            ],
        });

        let response = gateway.handle_batch(&meta, body).await.unwrap();
        assert_eq!(response["ok"], true);
    }

    #[tokio::test]
    async fn test_batch_per_event_write_key_override() {
        let bulker = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .and(body_partial_json(json!({
                "writeKey": "other",
                "origin": {"slug": "other"},
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&bulker)
            .await;

        let mut store = store_with_keys();
        store.add_stream("other", "ws2", &[], vec![], vec![]);

        let gateway = gateway_for(store, &bulker).await;
        let meta = RequestMeta {
            write_key_header: Some("priv1:server-secret".into()),
            ..RequestMeta::default()
        };
        let body = json!({
            "batch": [
                {"type": "track", "event": "a", "writeKey": "other"},
            ],
        });

        let response = gateway.handle_batch(&meta, body).await.unwrap();
        assert_eq!(response["ok"], true);
        assert_eq!(response["okEvents"], 1);
    }
}
