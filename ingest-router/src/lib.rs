//! Event ingestion edge: resolves inbound requests to a stream via the
//! configuration cache, stamps and envelopes the event, and forwards it to
//! the downstream ingestion service.

pub mod config;
pub mod delivery;
pub mod errors;
pub mod event;
pub mod gateway;
pub mod metrics_defs;
pub mod resolve;

use crate::config::Config;
use crate::delivery::EventForwarder;
use crate::errors::IngestError;
use crate::event::{IngestPath, RequestMeta, parse_ingest_path};
use crate::gateway::IngestGateway;
use crate::metrics_defs::{EVENTS_REJECTED, REQUEST_DURATION};
use crate::resolve::StreamResolver;
use fast_store::reader::FastStore;
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::{Value, json};
use shared::http::{error_response, json_response};
use shared::{counter, histogram};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

type IngestResponse = Response<BoxBody<Bytes, IngestError>>;

/// Hyper service for the ingest endpoints. Collects the request body and
/// hands off to [`handle`], which works on plain `Bytes` requests.
#[derive(Clone)]
pub struct IngestService {
    gateway: Arc<IngestGateway>,
}

impl IngestService {
    pub fn new(gateway: IngestGateway) -> Self {
        IngestService {
            gateway: Arc::new(gateway),
        }
    }
}

impl Service<Request<Incoming>> for IngestService {
    type Response = IngestResponse;
    type Error = IngestError;
    type Future = Pin<Box<dyn Future<Output = Result<IngestResponse, IngestError>> + Send>>;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        let gateway = self.gateway.clone();
        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let bytes = body
                .collect()
                .await
                .map_err(|e| IngestError::Internal(format!("failed to read body: {e}")))?
                .to_bytes();
            Ok(handle(&gateway, Request::from_parts(parts, bytes)).await)
        })
    }
}

/// Routes one buffered request. Errors become `{"error": ...}` responses
/// with the status of the underlying [`IngestError`].
pub async fn handle(gateway: &IngestGateway, request: Request<Bytes>) -> IngestResponse {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => json_response(StatusCode::OK, &json!({"status": "ok"})),
        (&Method::POST, path) if path.starts_with("/ingest/") => {
            match dispatch(gateway, request).await {
                Ok(body) => json_response(StatusCode::OK, &body),
                Err(err) => {
                    counter!(EVENTS_REJECTED, "status" => err.status().as_u16().to_string())
                        .increment(1);
                    tracing::debug!(%method, %path, error = %err, "ingest request rejected");
                    error_response(err.status(), &err.to_string())
                }
            }
        }
        _ => error_response(StatusCode::NOT_FOUND, "no such endpoint"),
    };

    histogram!(REQUEST_DURATION).record(started.elapsed().as_secs_f64());
    response
}

async fn dispatch(gateway: &IngestGateway, request: Request<Bytes>) -> Result<Value, IngestError> {
    let ingest_path = parse_ingest_path(request.uri().path())?;
    let (parts, body) = request.into_parts();
    let meta = RequestMeta::from_parts(&parts);

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| IngestError::Malformed(format!("invalid JSON body: {e}")))?;

    match ingest_path {
        IngestPath::Event { kind, key_class } => {
            gateway.handle_event(kind, key_class, &meta, payload).await
        }
        IngestPath::Batch => gateway.handle_batch(&meta, payload).await,
    }
}

/// Builds the gateway from configuration and runs the accept loop until the
/// process is stopped.
pub async fn run(config: Config, store: FastStore) -> Result<(), IngestError> {
    let resolver = StreamResolver::new(
        store,
        config.public_host.clone(),
        config.allow_bare_write_keys,
    );
    let forwarder = EventForwarder::new(
        config.bulker.base_url.clone(),
        config.bulker.auth_token.clone(),
        config.bulker.timeout(),
        config.bulker.attempts,
        config.bulker.base_retry(),
    )?;
    let service = IngestService::new(IngestGateway::new(resolver, forwarder));

    shared::http::run_http_service(&config.listener.host, config.listener.port, service).await
}
