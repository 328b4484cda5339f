use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Accept loop for a hyper service. Each connection is handed to hyper on its
/// own task with h1/h2 auto-detection.
pub async fn run_http_service<S, E>(host: &str, port: u16, service: S) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<BoxBody<Bytes, E>>, Error = E>
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!("listening on {host}:{port}");
    let service_arc = Arc::new(service);

    loop {
        let (stream, _peer_addr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = service_arc.clone();

        tokio::spawn(async move {
            if let Err(err) = Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await
            {
                tracing::debug!("connection error: {err}");
            }
        });
    }
}

/// Builds a JSON response body from any serializable value.
pub fn json_body<E>(value: &impl Serialize) -> BoxBody<Bytes, E> {
    let bytes = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    Full::new(Bytes::from(bytes)).map_err(|e| match e {}).boxed()
}

/// `{ "error": <message> }` with the given status.
pub fn error_response<E>(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, E>> {
    #[derive(Serialize)]
    struct ErrorBody<'a> {
        error: &'a str,
    }

    json_response(status, &ErrorBody { error: message })
}

pub fn json_response<E>(
    status: StatusCode,
    value: &impl Serialize,
) -> Response<BoxBody<Bytes, E>> {
    let mut response = Response::new(json_body(value));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}
