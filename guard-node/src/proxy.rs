use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::service::service_fn;
use hyper::{Body, Request, Response, StatusCode};
use metrics::counter;
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthEngine, Client};
use crate::config::GuardConfig;
use crate::error::{GuardError, Result};
use crate::request::{
    encode_json, Inspection, LocalResponse, RequestContext, RequestRegistry, ResponseTransform,
};
use crate::upstream::UpstreamPool;

/// Shared state of the proxy server
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<GuardConfig>,
    pub registry: Arc<RequestRegistry>,
    pub auth: Arc<AuthEngine>,
    pub upstream: Arc<UpstreamPool>,
}

/// The authorizing reverse proxy: accepts connections, authenticates each
/// client once, and dispatches every request through the inspection
/// registry before forwarding it upstream.
pub struct ProxyServer {
    state: ProxyState,
}

impl ProxyServer {
    pub fn new(state: ProxyState) -> Self {
        Self { state }
    }

    pub async fn run(&self) -> Result<()> {
        let listen_addr = self.state.config.listen_addr();
        let listener = TcpListener::bind(&listen_addr).await?;

        let tls_acceptor = if self.state.config.tls_enabled() {
            Some(TlsAcceptor::from(Arc::new(load_tls_config(
                &self.state.config,
            )?)))
        } else {
            None
        };

        info!(
            listen_addr = listen_addr.as_str(),
            secured = tls_acceptor.is_some(),
            "Proxy listening for connections"
        );

        loop {
            match listener.accept().await {
                Ok((stream, client_addr)) => {
                    let state = self.state.clone();
                    let tls_acceptor = tls_acceptor.clone();

                    tokio::spawn(async move {
                        let result = match tls_acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    serve_connection(tls_stream, client_addr, state).await
                                }
                                Err(e) => {
                                    counter!("tls_handshake_errors", 1);
                                    error!(client_addr = %client_addr, error = %e, "TLS handshake failed");
                                    return;
                                }
                            },
                            None => serve_connection(stream, client_addr, state).await,
                        };

                        if let Err(e) = result {
                            warn!(client_addr = %client_addr, error = %e, "Connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn serve_connection<S>(stream: S, client_addr: SocketAddr, state: ProxyState) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // The client is authenticated once per connection and then consulted
    // by every request dispatched on it
    let connection_client: Arc<Mutex<Option<Client>>> = Arc::new(Mutex::new(None));

    let service = service_fn(move |req: Request<Body>| {
        let state = state.clone();
        let connection_client = connection_client.clone();

        async move { handle_request(req, client_addr, state, connection_client).await }
    });

    hyper::server::conn::Http::new()
        .serve_connection(stream, service)
        .await
        .map_err(GuardError::from)
}

async fn handle_request(
    req: Request<Body>,
    client_addr: SocketAddr,
    state: ProxyState,
    connection_client: Arc<Mutex<Option<Client>>>,
) -> std::result::Result<Response<Body>, Infallible> {
    counter!("requests_received", 1);

    let client = {
        let mut cached = connection_client.lock().await;
        match cached.as_ref() {
            Some(client) => client.clone(),
            None => {
                let mut client = Client::new(client_addr.ip(), client_addr.port());
                client.peer_address = Some(client_addr.ip());
                client.peer_port = Some(client_addr.port());

                if let Some((username, password)) = basic_credentials(req.headers()) {
                    client.username = Some(username);
                    client.password = Some(password);
                }

                if !state.auth.authenticate(&mut client).await {
                    counter!("requests_unauthenticated", 1);
                    debug!(client = %client, "Authentication failed");
                    return Ok(unauthorized_response());
                }

                info!(client = %client, "Client authenticated");
                *cached = Some(client.clone());
                client
            }
        }
    };

    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();

    let Some((handler, params)) = state.registry.resolve(&parts.method, &path) else {
        counter!("requests_unrecognized", 1);
        debug!(client = %client, method = %parts.method, path = path.as_str(), "No handler for request");
        return Ok(error_response(
            400,
            "Unable to process this request: unknown API endpoint.",
        ));
    };

    // Only handlers that inspect the body get it buffered; for pass-through
    // handlers it keeps streaming to the upstream cluster untouched
    let mut streaming_body = None;
    let buffered = if handler.needs_body() {
        match hyper::body::to_bytes(body).await {
            Ok(body) => body.to_vec(),
            Err(e) => {
                warn!(client = %client, error = %e, "Failed to read request body");
                return Ok(error_response(400, "Failed to read the request body."));
            }
        }
    } else {
        streaming_body = Some(body);
        Vec::new()
    };

    let mut ctx = RequestContext::new(parts.method.clone(), &path, parts.uri.query(), buffered);
    ctx.set_params(params);

    debug!(
        client = %client,
        handler = handler.name(),
        method = %parts.method,
        path = path.as_str(),
        "Inspecting request"
    );

    let transform = match handler.inspect(&mut ctx, &client) {
        Err(e) => {
            counter!("requests_refused", 1);
            info!(
                client = %client,
                handler = handler.name(),
                status = e.status_code(),
                reason = %e,
                "Request refused"
            );
            return Ok(error_response(e.status_code(), &e.to_string()));
        }
        Ok(Inspection::Respond(local)) => {
            counter!("requests_answered_locally", 1);
            return Ok(local_response(local));
        }
        Ok(Inspection::Forward) => None,
        Ok(Inspection::ForwardWithTransform(transform)) => Some(transform),
    };

    let path_and_query = if ctx.query.is_empty() {
        ctx.path.clone()
    } else {
        format!("{}?{}", ctx.path, ctx.query.encode())
    };

    let mut headers = parts.headers;
    headers.insert(
        "x-forwarded-for",
        HeaderValue::from_str(&client_addr.ip().to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("unknown")),
    );

    let upstream_body = match streaming_body {
        Some(body) => body,
        None => Body::from(ctx.body),
    };

    let response = match state
        .upstream
        .forward(ctx.method.clone(), &path_and_query, &headers, upstream_body)
        .await
    {
        Ok(response) => response,
        Err(GuardError::Upstream(reason)) if reason.contains("timed out") => {
            counter!("upstream_timeouts", 1);
            return Ok(error_response(504, "The Elasticsearch cluster timed out."));
        }
        Err(e) => {
            counter!("upstream_errors", 1);
            error!(client = %client, error = %e, "Failed to reach the Elasticsearch cluster");
            return Ok(error_response(502, "Unable to reach the Elasticsearch cluster."));
        }
    };

    counter!("requests_proxied", 1);

    match transform {
        None => Ok(response),
        Some(transform) => match apply_transform(transform, response).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!(client = %client, error = %e, "Failed to transform the upstream response");
                Ok(error_response(502, "Invalid response from the Elasticsearch cluster."))
            }
        },
    }
}

/// Extract the username and password of a basic authentication header
fn basic_credentials(headers: &hyper::HeaderMap) -> Option<(String, String)> {
    let header = headers.get(hyper::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Apply a post-processing transform to the upstream response
async fn apply_transform(
    transform: ResponseTransform,
    response: Response<Body>,
) -> Result<Response<Body>> {
    match transform {
        ResponseTransform::MsearchErrors { errors, pretty } => {
            let (mut parts, body) = response.into_parts();
            let body = hyper::body::to_bytes(body).await?;

            let payload = match serde_json::from_slice::<Value>(&body) {
                Ok(mut data) => {
                    if let Some(responses) = data
                        .get_mut("responses")
                        .and_then(Value::as_array_mut)
                    {
                        for (position, error) in errors {
                            let position = position.min(responses.len());
                            responses.insert(position, error);
                        }
                    }
                    encode_json(&data, pretty).into_bytes()
                }
                // A non-JSON upstream answer passes through untouched
                Err(_) => body.to_vec(),
            };

            parts.headers.insert(
                CONTENT_LENGTH,
                HeaderValue::from_str(&payload.len().to_string())
                    .unwrap_or_else(|_| HeaderValue::from_static("0")),
            );
            Ok(Response::from_parts(parts, Body::from(payload)))
        }
    }
}

fn local_response(local: LocalResponse) -> Response<Body> {
    let mut response = Response::new(Body::from(local.body.clone()));
    *response.status_mut() =
        StatusCode::from_u16(local.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(local.content_type));
    response.headers_mut().insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&local.body.len().to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
    response
}

/// An Elasticsearch-style error response
fn error_response(status: u16, reason: &str) -> Response<Body> {
    let body = json!({
        "error": format!("[{}] {}", crate::APP_NAME, reason),
        "status": status,
    })
    .to_string();

    let mut response = Response::new(Body::from(body));
    *response.status_mut() =
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn unauthorized_response() -> Response<Body> {
    let mut response = error_response(401, "Unable to authenticate you.");
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response.headers_mut().insert(
        WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"elasticguard\""),
    );
    response
}

/// Load the TLS configuration for the secured listener
fn load_tls_config(config: &GuardConfig) -> Result<ServerConfig> {
    let cert_path = config.proxy.certificate.as_deref().unwrap_or_default();
    let key_path = config.proxy.private_key.as_deref().unwrap_or_default();

    info!(
        cert_path = cert_path,
        key_path = key_path,
        "Loading TLS configuration"
    );

    let cert_file = File::open(cert_path)?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<Certificate> = certs(&mut cert_reader)
        .map_err(|e| GuardError::Tls(format!("failed to parse certificate file: {e}")))?
        .into_iter()
        .map(Certificate)
        .collect();

    let key_file = File::open(key_path)?;
    let mut key_reader = BufReader::new(key_file);
    let keys = pkcs8_private_keys(&mut key_reader)
        .map_err(|e| GuardError::Tls(format!("failed to parse private key file: {e}")))?;

    let key = keys
        .into_iter()
        .next()
        .ok_or_else(|| GuardError::Tls("no private keys found in key file".to_string()))?;

    ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, PrivateKey(key))
        .map_err(|e| GuardError::Tls(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_credentials() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert(
            hyper::header::AUTHORIZATION,
            HeaderValue::from_static("Basic amRvZTpzZWNyZXQ="),
        );

        let (username, password) = basic_credentials(&headers).unwrap();
        assert_eq!(username, "jdoe");
        assert_eq!(password, "secret");

        headers.insert(
            hyper::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token"),
        );
        assert!(basic_credentials(&headers).is_none());
    }

    #[tokio::test]
    async fn test_msearch_transform_splices_errors() {
        let upstream = Response::new(Body::from(
            serde_json::to_vec(&json!({"responses": [{"hits": {"total": 1}}]})).unwrap(),
        ));

        let transform = ResponseTransform::MsearchErrors {
            errors: vec![(1, json!({"status": 403, "error": "denied"}))],
            pretty: false,
        };

        let response = apply_transform(transform, upstream).await.unwrap();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let data: Value = serde_json::from_slice(&body).unwrap();

        let responses = data["responses"].as_array().unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[1]["status"], json!(403));
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response(403, "nope");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
