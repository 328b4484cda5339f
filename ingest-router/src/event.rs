//! Event types, request metadata extraction, and the canonical envelope
//! forwarded downstream.

use crate::errors::IngestError;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use fast_store::model::KeyClass;
use http::request::Parts;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

/// The closed set of accepted event types.
///
/// Custom event names ride on `track` via the event's `event` field; the
/// path segment itself must be one of these (or its one-letter shorthand).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Page,
    Identify,
    Track,
    Group,
    Alias,
    Screen,
}

impl EventKind {
    pub fn parse(token: &str) -> Option<EventKind> {
        match token {
            "p" | "page" => Some(EventKind::Page),
            "i" | "identify" => Some(EventKind::Identify),
            "t" | "track" => Some(EventKind::Track),
            "g" | "group" => Some(EventKind::Group),
            "a" | "alias" => Some(EventKind::Alias),
            "s" | "screen" => Some(EventKind::Screen),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Page => "page",
            EventKind::Identify => "identify",
            EventKind::Track => "track",
            EventKind::Group => "group",
            EventKind::Alias => "alias",
            EventKind::Screen => "screen",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum IngestPath {
    Event { kind: EventKind, key_class: KeyClass },
    Batch,
}

/// Parses the `{type}` segment of `POST /ingest/{type}`. An `s2s/` prefix
/// selects the server-to-server key class.
pub fn parse_ingest_path(path: &str) -> Result<IngestPath, IngestError> {
    let rest = path
        .strip_prefix("/ingest/")
        .ok_or_else(|| IngestError::Malformed(format!("unsupported path: {path}")))?;

    if rest == "batch" {
        return Ok(IngestPath::Batch);
    }

    let (key_class, token) = match rest.strip_prefix("s2s/") {
        Some(token) => (KeyClass::S2s, token),
        None => (KeyClass::Browser, rest),
    };

    EventKind::parse(token)
        .map(|kind| IngestPath::Event { kind, key_class })
        .ok_or_else(|| IngestError::UnknownEventType(token.to_string()))
}

/// Everything the pipeline needs from the inbound HTTP request, extracted
/// once so the rest of the code never touches hyper types.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// Effective hostname (`X-Forwarded-Host` over `Host`, port stripped).
    pub host: String,
    /// `X-Forwarded-Proto` or `http`.
    pub proto: String,
    /// First `X-Forwarded-For` entry; empty when unknown.
    pub remote_ip: String,
    /// Decoded `Authorization: Basic` credentials as (key id, key secret).
    pub basic_auth: Option<(String, String)>,
    /// Explicit write-key header.
    pub write_key_header: Option<String>,
    /// Scrubbed copy of the request headers, carried in the envelope.
    pub headers: BTreeMap<String, String>,
    /// `?sync=true|1`: suspend the response until delivery settles.
    pub sync: bool,
}

/// Headers never forwarded downstream: credentials and hop-by-hop headers.
const SCRUBBED_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "x-write-key",
    "connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

impl RequestMeta {
    pub fn from_parts(parts: &Parts) -> RequestMeta {
        let headers = &parts.headers;

        let raw_host = header_str(headers, "x-forwarded-host")
            .or_else(|| header_str(headers, "host"))
            .unwrap_or_default();
        let host = raw_host
            .split(':')
            .next()
            .unwrap_or_default()
            .to_lowercase();

        let proto = header_str(headers, "x-forwarded-proto")
            .unwrap_or("http")
            .to_string();

        let remote_ip = header_str(headers, "x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .unwrap_or_default();

        let basic_auth = header_str(headers, "authorization").and_then(parse_basic_auth);
        let write_key_header = header_str(headers, "x-write-key").map(str::to_string);

        let mut scrubbed = BTreeMap::new();
        for (name, value) in headers {
            let name = name.as_str().to_lowercase();
            if SCRUBBED_HEADERS.contains(&name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                scrubbed.insert(name, value.to_string());
            }
        }

        let sync = parts
            .uri
            .query()
            .map(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .any(|(k, v)| k == "sync" && (v == "true" || v == "1"))
            })
            .unwrap_or(false);

        RequestMeta {
            host,
            proto,
            remote_ip,
            basic_auth,
            write_key_header,
            headers: scrubbed,
            sync,
        }
    }

    /// Key id the request authenticated with, secret part stripped. Batch
    /// entries with their own `writeKey` override this per event.
    pub fn write_key_id(&self) -> Option<String> {
        self.basic_auth
            .as_ref()
            .map(|(id, _)| id.clone())
            .or_else(|| {
                self.write_key_header
                    .as_ref()
                    .map(|key| key.split(':').next().unwrap_or(key).to_string())
            })
    }
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn parse_basic_auth(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.as_bytes()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (id, secret) = decoded.split_once(':')?;
    Some((id.to_string(), secret.to_string()))
}

/// Where the event entered the platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventOrigin {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Canonical envelope POSTed to the downstream ingestion service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestEnvelope {
    pub message_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub ingest_type: KeyClass,
    pub message_created: DateTime<Utc>,
    /// Key id only; the secret is never forwarded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_key: Option<String>,
    pub origin: EventOrigin,
    pub http_headers: BTreeMap<String, String>,
    pub http_payload: Value,
}

/// Stamps the inbound event in place and wraps it in the canonical envelope.
///
/// The event gets a generated `messageId` when absent, the server-received
/// timestamp, the resolved type, and - for browser-origin events - the
/// caller's IP in `context.ip`.
pub fn build_envelope(
    kind: EventKind,
    key_class: KeyClass,
    meta: &RequestMeta,
    write_key: Option<String>,
    stream_id: &str,
    mut event: Value,
) -> Result<IngestEnvelope, IngestError> {
    let fields = event
        .as_object_mut()
        .ok_or_else(|| IngestError::Malformed("event body must be a JSON object".into()))?;

    let now = Utc::now();
    let message_id = match fields.get("messageId").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            fields.insert("messageId".into(), json!(id));
            id
        }
    };
    fields.insert("type".into(), json!(kind.as_str()));
    fields.insert("receivedAt".into(), json!(now.to_rfc3339()));
    if !meta.remote_ip.is_empty() {
        fields.insert("requestIp".into(), json!(meta.remote_ip));
        if key_class == KeyClass::Browser {
            let context = fields
                .entry("context")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(context) = context.as_object_mut() {
                context.insert("ip".into(), json!(meta.remote_ip));
            }
        }
    }

    Ok(IngestEnvelope {
        message_id,
        event_type: kind.as_str().to_string(),
        ingest_type: key_class,
        message_created: now,
        write_key,
        origin: EventOrigin {
            base_url: format!("{}://{}", meta.proto, meta.host),
            slug: Some(stream_id.to_string()),
            domain: (!meta.host.is_empty()).then(|| meta.host.clone()),
        },
        http_headers: meta.headers.clone(),
        http_payload: event,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn parts_for(uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (parts, ()) = builder.body(()).unwrap().into_parts();
        parts
    }

    #[test]
    fn test_parse_ingest_path() {
        assert_eq!(
            parse_ingest_path("/ingest/track").unwrap(),
            IngestPath::Event {
                kind: EventKind::Track,
                key_class: KeyClass::Browser
            }
        );
        assert_eq!(
            parse_ingest_path("/ingest/s2s/i").unwrap(),
            IngestPath::Event {
                kind: EventKind::Identify,
                key_class: KeyClass::S2s
            }
        );
        assert_eq!(parse_ingest_path("/ingest/batch").unwrap(), IngestPath::Batch);

        assert!(matches!(
            parse_ingest_path("/ingest/explode"),
            Err(IngestError::UnknownEventType(_))
        ));
        assert!(matches!(
            parse_ingest_path("/other"),
            Err(IngestError::Malformed(_))
        ));
    }

    #[test]
    fn test_meta_extraction_and_header_scrubbing() {
        let parts = parts_for(
            "http://ignored/ingest/track?sync=1",
            &[
                ("host", "Data.Acme.com:443"),
                ("x-forwarded-proto", "https"),
                ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
                ("authorization", "Basic a2V5MTpzM2NyZXQ="),
                ("x-write-key", "should-not-leak"),
                ("user-agent", "sdk/1.0"),
            ],
        );
        let meta = RequestMeta::from_parts(&parts);

        assert_eq!(meta.host, "data.acme.com");
        assert_eq!(meta.proto, "https");
        assert_eq!(meta.remote_ip, "203.0.113.7");
        assert!(meta.sync);
        // "a2V5MTpzM2NyZXQ=" is base64("key1:s3cret")
        assert_eq!(meta.basic_auth, Some(("key1".into(), "s3cret".into())));

        assert!(meta.headers.contains_key("user-agent"));
        assert!(!meta.headers.contains_key("authorization"));
        assert!(!meta.headers.contains_key("x-write-key"));
        assert!(!meta.headers.contains_key("cookie"));
    }

    #[test]
    fn test_write_key_id_strips_secret() {
        let meta = RequestMeta {
            write_key_header: Some("priv1:server-secret".into()),
            ..RequestMeta::default()
        };
        assert_eq!(meta.write_key_id().as_deref(), Some("priv1"));

        let meta = RequestMeta {
            basic_auth: Some(("pub1".into(), "s3cret".into())),
            write_key_header: Some("ignored:x".into()),
            ..RequestMeta::default()
        };
        assert_eq!(meta.write_key_id().as_deref(), Some("pub1"));

        assert_eq!(RequestMeta::default().write_key_id(), None);
    }

    #[test]
    fn test_envelope_stamping() {
        let meta = RequestMeta {
            host: "data.acme.com".into(),
            proto: "https".into(),
            remote_ip: "203.0.113.7".into(),
            ..RequestMeta::default()
        };

        let envelope = build_envelope(
            EventKind::Track,
            KeyClass::Browser,
            &meta,
            meta.write_key_id(),
            "acme",
            json!({"event": "signup"}),
        )
        .unwrap();

        assert_eq!(envelope.event_type, "track");
        assert_eq!(envelope.origin.base_url, "https://data.acme.com");
        assert_eq!(envelope.origin.slug.as_deref(), Some("acme"));

        let payload = envelope.http_payload.as_object().unwrap();
        assert_eq!(payload["type"], "track");
        assert_eq!(payload["messageId"].as_str(), Some(envelope.message_id.as_str()));
        assert_eq!(payload["context"]["ip"], "203.0.113.7");
        assert!(payload.contains_key("receivedAt"));
    }

    #[test]
    fn test_existing_message_id_is_kept() {
        let envelope = build_envelope(
            EventKind::Page,
            KeyClass::S2s,
            &RequestMeta::default(),
            None,
            "acme",
            json!({"messageId": "fixed"}),
        )
        .unwrap();
        assert_eq!(envelope.message_id, "fixed");
        // s2s events do not get a browser context stamped.
        assert!(envelope.http_payload.get("context").is_none());
    }

    #[test]
    fn test_non_object_event_is_malformed() {
        let result = build_envelope(
            EventKind::Track,
            KeyClass::Browser,
            &RequestMeta::default(),
            None,
            "acme",
            json!([1, 2, 3]),
        );
        assert!(matches!(result, Err(IngestError::Malformed(_))));
    }
}
