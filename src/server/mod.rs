//! Server router.
//!
//! A hyper `service_fn` wrapped around a single `http1::Builder::
//! serve_connection` accept loop, dispatching on method/path with
//! header-driven request validation (one status per failure mode) ahead of
//! the method-id-keyed dispatch a [`crate::registry::MethodRegistry`] gives
//! us.

pub mod context;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::StreamExt;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode as HttpStatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use context::ServerCallContext;

use crate::auth::{AuthInterceptor, NoopAuthInterceptor};
use crate::codec::ContentCodec;
use crate::deadline::Deadline;
use crate::hooks::Hooks;
use crate::metadata::Metadata;
use crate::registry::{BoxStream, MethodRegistry, Shape};
use crate::status::{StatusCode, TempoError};
use crate::stream::{read_frames, write_frames};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, Infallible>;

fn full_body(bytes: Vec<u8>) -> BoxBody {
    Full::new(Bytes::from(bytes))
        .map_err(|never: Infallible| match never {})
        .boxed()
}

fn empty_body() -> BoxBody {
    full_body(Vec::new())
}

fn stream_body(source: BoxStream<Result<Bytes, TempoError>>) -> BoxBody {
    let frames = source.map(|item| match item {
        Ok(bytes) => Ok(Frame::data(bytes)),
        Err(e) => Err(e),
    });
    StreamBody::new(frames)
        .map_err(|_: TempoError| unreachable!("hyper never polls a body after an error frame"))
        .boxed()
}

/// CORS posture (§4.8).
#[derive(Debug, Clone)]
pub enum CorsMode {
    Disabled,
    Wildcard,
    AllowList(Vec<String>),
}

/// Optional, per-router defense against JSON-codec payloads carrying
/// attacker-controlled object keys or markup (§4.8, §9). Applied only to
/// the JSON wire codec; the binary codec is opaque bytes from a
/// code-generator and is never touched.
pub trait ObjectSanitizer: Send + Sync {
    fn sanitize(&self, value: serde_json::Value) -> serde_json::Value;
}

/// The sanitizer named in §9: HTML-escapes string values and drops any
/// object key beginning with `$` (a common NoSQL-operator-injection
/// vector), recursing through arrays and nested objects.
#[derive(Debug, Default)]
pub struct DefaultObjectSanitizer;

impl ObjectSanitizer for DefaultObjectSanitizer {
    fn sanitize(&self, value: serde_json::Value) -> serde_json::Value {
        use serde_json::Value;
        match value {
            Value::String(s) => Value::String(html_escape(&s)),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.sanitize(v)).collect())
            }
            Value::Object(obj) => {
                let mut out = serde_json::Map::with_capacity(obj.len());
                for (k, v) in obj {
                    if k.starts_with('$') {
                        continue;
                    }
                    out.insert(k, self.sanitize(v));
                }
                Value::Object(out)
            }
            other => other,
        }
    }
}

fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Router-wide configuration (§4.8). `None` fields fall back to the
/// behavior described inline.
#[derive(Clone)]
pub struct RouterConfig {
    pub cors: CorsMode,
    pub max_receive_size: usize,
    pub max_send_size: usize,
    pub max_retry_attempts: u32,
    pub discovery_enabled: bool,
    pub transmit_internal_errors: bool,
    /// Applied to outgoing JSON-codec payloads only (§4.8, §9). `None`
    /// disables sanitization entirely.
    pub sanitizer: Option<Arc<dyn ObjectSanitizer>>,
}

impl std::fmt::Debug for RouterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterConfig")
            .field("cors", &self.cors)
            .field("max_receive_size", &self.max_receive_size)
            .field("max_send_size", &self.max_send_size)
            .field("max_retry_attempts", &self.max_retry_attempts)
            .field("discovery_enabled", &self.discovery_enabled)
            .field("transmit_internal_errors", &self.transmit_internal_errors)
            .field("sanitizer", &self.sanitizer.is_some())
            .finish()
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cors: CorsMode::Disabled,
            max_receive_size: 4 * 1024 * 1024,
            max_send_size: 4 * 1024 * 1024,
            max_retry_attempts: 5,
            discovery_enabled: true,
            transmit_internal_errors: false,
            sanitizer: None,
        }
    }
}

#[derive(Serialize)]
struct DiscoveryDescriptor {
    tempo: &'static str,
    language: &'static str,
    runtime: &'static str,
    variant: &'static str,
}

const DISCOVERY: DiscoveryDescriptor = DiscoveryDescriptor {
    tempo: env!("CARGO_PKG_VERSION"),
    language: "rust",
    runtime: "tokio",
    variant: "tempo-rpc",
};

/// A bound set of methods plus the policy the router enforces around them.
pub struct ServerRouter {
    config: RouterConfig,
    registry: MethodRegistry,
    hooks: Hooks<ServerCallContext>,
    auth: Arc<dyn AuthInterceptor>,
}

impl ServerRouter {
    pub fn new(config: RouterConfig, registry: MethodRegistry) -> Self {
        Self {
            config,
            registry,
            hooks: Hooks::new(),
            auth: Arc::new(NoopAuthInterceptor),
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks<ServerCallContext>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthInterceptor>) -> Self {
        self.auth = auth;
        self
    }

    fn cors_origin_allowed(&self, origin: &str) -> bool {
        match &self.config.cors {
            CorsMode::Disabled => false,
            CorsMode::Wildcard => true,
            CorsMode::AllowList(allowed) => allowed.iter().any(|o| o == origin),
        }
    }

    fn cors_header_value(&self, origin: &str) -> &str {
        match &self.config.cors {
            CorsMode::Wildcard => "*",
            _ => origin,
        }
    }

    /// The `access-control-allow-origin` value to echo on a response, if
    /// any — only when CORS is enabled and the request carried an Origin
    /// (§4.8: "CORS headers if enabled and an Origin was sent").
    fn cors_allow_origin(&self, origin: Option<&str>) -> Option<String> {
        match (&self.config.cors, origin) {
            (CorsMode::Disabled, _) | (_, None) => None,
            (_, Some(origin)) => Some(self.cors_header_value(origin).to_string()),
        }
    }

    /// Bind and serve until `shutdown` fires: a plain accept loop raced
    /// against the shutdown signal via `select!`, one task per connection.
    pub async fn serve(
        self: Arc<Self>,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "tempo server listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let router = Arc::clone(&self);
                    tokio::task::spawn(async move {
                        router.serve_connection(stream, peer_addr).await;
                    });
                }
                _ = shutdown.changed() => {
                    info!("tempo server shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn serve_connection(self: Arc<Self>, stream: tokio::net::TcpStream, peer_addr: SocketAddr) {
        let io = TokioIo::new(stream);
        let router = Arc::clone(&self);
        let service = service_fn(move |req: Request<Incoming>| {
            let router = Arc::clone(&router);
            async move { Ok::<_, Infallible>(router.handle(req).await) }
        });

        if let Err(e) = hyper::server::conn::http1::Builder::new()
            .serve_connection(io, service)
            .await
        {
            if !e.to_string().contains("connection closed") {
                debug!(peer = %peer_addr, error = %e, "connection error");
            }
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<BoxBody> {
        let origin = req
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match *req.method() {
            Method::OPTIONS => self.handle_options(&req, origin.as_deref()),
            Method::GET if req.uri().path() == "/" && self.config.discovery_enabled => {
                self.handle_discovery()
            }
            Method::POST => self.handle_call(req, origin.as_deref()).await,
            _ => status_only_response(StatusCode::FailedPrecondition, "unsupported method", None),
        }
    }

    fn handle_discovery(&self) -> Response<BoxBody> {
        let body = serde_json::to_vec(&DISCOVERY).unwrap_or_default();
        Response::builder()
            .status(HttpStatusCode::OK)
            .header("content-type", "application/json")
            .header("cache-control", "public, max-age=31536000, immutable")
            .body(full_body(body))
            .expect("static discovery response is well-formed")
    }

    fn handle_options(&self, req: &Request<Incoming>, origin: Option<&str>) -> Response<BoxBody> {
        let preflight = origin.is_some()
            && req.headers().contains_key("access-control-request-method")
            && req.headers().contains_key("access-control-request-headers");

        let mut builder = Response::builder();
        if preflight {
            let origin = origin.unwrap();
            builder = builder
                .status(HttpStatusCode::NO_CONTENT)
                .header("access-control-allow-methods", "POST, OPTIONS")
                .header("access-control-allow-origin", self.cors_header_value(origin));
            if let Some(requested) = req.headers().get("access-control-request-headers") {
                builder = builder.header("access-control-allow-headers", requested.clone());
            }
        } else {
            builder = builder
                .status(HttpStatusCode::OK)
                .header("allow", "POST, OPTIONS");
        }
        builder
            .body(empty_body())
            .expect("static preflight response is well-formed")
    }

    async fn handle_call(&self, req: Request<Incoming>, origin: Option<&str>) -> Response<BoxBody> {
        if let (CorsMode::AllowList(_) | CorsMode::Wildcard, Some(origin)) = (&self.config.cors, origin) {
            if !self.cors_origin_allowed(origin) {
                return status_only_response(
                    StatusCode::PermissionDenied,
                    "origin not allowed",
                    None,
                );
            }
        }

        let headers = req.headers().clone();

        let method_id = match headers
            .get("tempo-method")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok())
        {
            Some(id) => id,
            None => {
                return status_only_response(
                    StatusCode::FailedPrecondition,
                    "missing or malformed tempo-method header",
                    self.cors_allow_origin(origin),
                )
            }
        };

        let codec = match headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
        {
            None => {
                return status_only_response(StatusCode::InvalidArgument, "missing content-type", self.cors_allow_origin(origin))
            }
            Some(raw) => match ContentCodec::from_content_type(raw) {
                Some(c) => c,
                None => {
                    return status_only_response(
                        StatusCode::UnknownContentType,
                        format!("unrecognized content-type {raw:?}"),
                        self.cors_allow_origin(origin),
                    )
                }
            },
        };

        let Some(method) = self.registry.lookup(method_id) else {
            return status_only_response(
                StatusCode::FailedPrecondition,
                format!("unknown method id {method_id}"),
                self.cors_allow_origin(origin),
            );
        };

        let previous_attempts = headers
            .get(crate::retry::PREVIOUS_ATTEMPTS_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        if previous_attempts > self.config.max_retry_attempts {
            return status_only_response(
                StatusCode::ResourceExhausted,
                "too many previous attempts",
                self.cors_allow_origin(origin),
            );
        }

        let deadline = headers
            .get("tempo-deadline")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Deadline::from_unix_millis);
        if let Some(d) = deadline {
            if d.is_expired() {
                return status_only_response(StatusCode::DeadlineExceeded, "deadline already expired", self.cors_allow_origin(origin));
            }
        }

        if let Some(len) = headers
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
        {
            if len > self.config.max_receive_size {
                return status_only_response(
                    StatusCode::ResourceExhausted,
                    "request body exceeds max receive size",
                    self.cors_allow_origin(origin),
                );
            }
        }

        let client_metadata = match headers
            .get("custom-metadata")
            .and_then(|v| v.to_str().ok())
            .map(Metadata::from_http_header)
        {
            Some(Ok(m)) => m,
            Some(Err(e)) => return status_only_response(e.status, e.message, self.cors_allow_origin(origin)),
            None => Metadata::new(),
        };

        let mut ctx = ServerCallContext::new(client_metadata, deadline);
        ctx.previous_attempts = previous_attempts;

        let authorization = headers.get("authorization").and_then(|v| v.to_str().ok());
        match self.auth.authenticate(authorization) {
            Ok(auth_ctx) => ctx.auth_context = Some(auth_ctx),
            Err(e) => return self.finish_error(ctx, e, origin),
        }

        if let Err(e) = self.hooks.request.run(&mut ctx) {
            return self.finish_error(ctx, e, origin);
        }

        let body = req.into_body();
        let result = match method.shape {
            Shape::Unary => self.dispatch_unary(method, ctx, body, codec, deadline, origin).await,
            Shape::ClientStream => {
                self.dispatch_client_stream(method, ctx, body, codec, deadline, origin).await
            }
            Shape::ServerStream => {
                self.dispatch_server_stream(method, ctx, body, codec, deadline, origin).await
            }
            Shape::DuplexStream => {
                self.dispatch_duplex_stream(method, ctx, body, codec, deadline, origin).await
            }
        };

        match result {
            Ok(resp) => resp,
            Err((ctx, e)) => self.finish_error(ctx, e, origin),
        }
    }

    async fn read_whole_body(&self, body: Incoming) -> Result<Vec<u8>, TempoError> {
        let max = self.config.max_receive_size;
        let collected = http_body_util::Limited::new(body, max)
            .collect()
            .await
            .map_err(|_| TempoError::new(StatusCode::ResourceExhausted, "request body exceeds max receive size"))?;
        Ok(collected.to_bytes().to_vec())
    }

    fn incoming_frame_stream(&self, body: Incoming, deadline: Option<Deadline>) -> BoxStream<Result<Vec<u8>, TempoError>> {
        let raw: BoxStream<Result<Bytes, TempoError>> = Box::pin(
            http_body_util::BodyStream::new(body).filter_map(|frame| async move {
                match frame {
                    Ok(f) => f.into_data().ok().map(Ok),
                    Err(e) => Some(Err(TempoError::new(StatusCode::Unknown, e.to_string()))),
                }
            }),
        );
        read_frames(raw, deadline, None)
    }

    /// Reject an outgoing payload that exceeds the router's configured
    /// `max_send_size` as `RESOURCE_EXHAUSTED`, mirroring the incoming-side
    /// `max_receive_size` check (§4.8's body-size validation, extended to
    /// the response path the config table names but leaves unspecified).
    fn check_send_size(&self, len: usize) -> Result<(), TempoError> {
        if len > self.config.max_send_size {
            return Err(TempoError::new(
                StatusCode::ResourceExhausted,
                format!("response body {len} exceeds max send size {}", self.config.max_send_size),
            ));
        }
        Ok(())
    }

    /// Run the configured object sanitizer over an outgoing single payload,
    /// if any, and only for the JSON codec (§4.8, §9). A no-op for the
    /// binary codec or when no sanitizer is configured.
    fn sanitize_payload(&self, codec: ContentCodec, bytes: Vec<u8>) -> Result<Vec<u8>, TempoError> {
        let Some(sanitizer) = &self.config.sanitizer else {
            return Ok(bytes);
        };
        if codec != ContentCodec::Json {
            return Ok(bytes);
        }
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        Ok(serde_json::to_vec(&sanitizer.sanitize(value))?)
    }

    /// Same as [`ServerRouter::sanitize_payload`], applied frame-by-frame
    /// to a streaming response.
    fn sanitize_stream(
        &self,
        codec: ContentCodec,
        stream: BoxStream<Result<Vec<u8>, TempoError>>,
    ) -> BoxStream<Result<Vec<u8>, TempoError>> {
        let Some(sanitizer) = self.config.sanitizer.clone() else {
            return stream;
        };
        if codec != ContentCodec::Json {
            return stream;
        }
        Box::pin(stream.map(move |item| {
            item.and_then(|bytes| {
                let value: serde_json::Value = serde_json::from_slice(&bytes)?;
                Ok(serde_json::to_vec(&sanitizer.sanitize(value))?)
            })
        }))
    }

    async fn dispatch_unary(
        &self,
        method: &crate::registry::ServerMethod,
        mut ctx: ServerCallContext,
        body: Incoming,
        codec: ContentCodec,
        deadline: Option<Deadline>,
        origin: Option<&str>,
    ) -> Result<Response<BoxBody>, (ServerCallContext, TempoError)> {
        let bytes = self.read_whole_body(body).await.map_err(|e| (clone_ctx(&ctx), e))?;
        let work = method.invoke_unary(ctx, bytes, codec, &self.hooks.decode);
        let (mut ctx, resp_bytes) = self.race(work, deadline).await?;
        let resp_bytes = self.sanitize_payload(codec, resp_bytes).map_err(|e| (clone_ctx(&ctx), e))?;
        self.check_send_size(resp_bytes.len()).map_err(|e| (clone_ctx(&ctx), e))?;
        self.hooks.response.run(&mut ctx).map_err(|e| (clone_ctx(&ctx), e))?;
        Ok(self.finish_single(ctx, resp_bytes, codec, origin))
    }

    async fn dispatch_client_stream(
        &self,
        method: &crate::registry::ServerMethod,
        ctx: ServerCallContext,
        body: Incoming,
        codec: ContentCodec,
        deadline: Option<Deadline>,
        origin: Option<&str>,
    ) -> Result<Response<BoxBody>, (ServerCallContext, TempoError)> {
        let frames = self.incoming_frame_stream(body, deadline);
        let work = method.invoke_client_stream(ctx, frames, codec);
        let (mut ctx, resp_bytes) = self.race(work, deadline).await?;
        let resp_bytes = self.sanitize_payload(codec, resp_bytes).map_err(|e| (clone_ctx(&ctx), e))?;
        self.check_send_size(resp_bytes.len()).map_err(|e| (clone_ctx(&ctx), e))?;
        self.hooks.response.run(&mut ctx).map_err(|e| (clone_ctx(&ctx), e))?;
        Ok(self.finish_single(ctx, resp_bytes, codec, origin))
    }

    async fn dispatch_server_stream(
        &self,
        method: &crate::registry::ServerMethod,
        ctx: ServerCallContext,
        body: Incoming,
        codec: ContentCodec,
        deadline: Option<Deadline>,
        origin: Option<&str>,
    ) -> Result<Response<BoxBody>, (ServerCallContext, TempoError)> {
        let bytes = self.read_whole_body(body).await.map_err(|e| (clone_ctx(&ctx), e))?;
        let work = method.invoke_server_stream(ctx, bytes, codec);
        let (mut ctx, payload_stream) = self.race(work, deadline).await?;
        self.hooks.response.run(&mut ctx).map_err(|e| (clone_ctx(&ctx), e))?;
        let payload_stream = self.sanitize_stream(codec, payload_stream);
        let payload_stream = self.guard_send_size(payload_stream);
        Ok(self.finish_stream(ctx, payload_stream, codec, deadline, origin))
    }

    async fn dispatch_duplex_stream(
        &self,
        method: &crate::registry::ServerMethod,
        ctx: ServerCallContext,
        body: Incoming,
        codec: ContentCodec,
        deadline: Option<Deadline>,
        origin: Option<&str>,
    ) -> Result<Response<BoxBody>, (ServerCallContext, TempoError)> {
        let frames = self.incoming_frame_stream(body, deadline);
        let work = method.invoke_duplex_stream(ctx, frames, codec);
        let (mut ctx, payload_stream) = self.race(work, deadline).await?;
        self.hooks.response.run(&mut ctx).map_err(|e| (clone_ctx(&ctx), e))?;
        let payload_stream = self.sanitize_stream(codec, payload_stream);
        let payload_stream = self.guard_send_size(payload_stream);
        Ok(self.finish_stream(ctx, payload_stream, codec, deadline, origin))
    }

    /// Wrap a server-produced frame-payload stream so any individual frame
    /// over `max_send_size` turns into a terminal `RESOURCE_EXHAUSTED` error
    /// instead of being written to the wire.
    fn guard_send_size(
        &self,
        stream: BoxStream<Result<Vec<u8>, TempoError>>,
    ) -> BoxStream<Result<Vec<u8>, TempoError>> {
        let max = self.config.max_send_size;
        Box::pin(stream.map(move |item| {
            item.and_then(|payload| {
                if payload.len() > max {
                    Err(TempoError::new(
                        StatusCode::ResourceExhausted,
                        format!("response frame {} bytes exceeds max send size {max}", payload.len()),
                    ))
                } else {
                    Ok(payload)
                }
            })
        }))
    }

    /// Race a handler invocation against the call's deadline, if any.
    async fn race<T>(
        &self,
        work: impl std::future::Future<Output = Result<(ServerCallContext, T), TempoError>>,
        deadline: Option<Deadline>,
    ) -> Result<(ServerCallContext, T), (ServerCallContext, TempoError)> {
        let result = match deadline {
            Some(d) => d.race(wrap_no_ctx(work), None).await,
            None => work.await,
        };
        result.map_err(|e| (ServerCallContext::new(Metadata::new(), deadline), e))
    }

    fn finish_single(
        &self,
        mut ctx: ServerCallContext,
        payload: Vec<u8>,
        codec: ContentCodec,
        origin: Option<&str>,
    ) -> Response<BoxBody> {
        ctx.freeze_outgoing();
        let mut builder = Response::builder()
            .status(HttpStatusCode::OK)
            .header("tempo-status", "0")
            .header("tempo-message", "OK")
            .header("content-type", codec.content_type())
            .header("content-length", payload.len().to_string());
        builder = attach_common_headers(builder, &ctx);
        builder = attach_cors_headers(builder, self.cors_allow_origin(origin));
        builder.body(full_body(payload)).expect("response is well-formed")
    }

    fn finish_stream(
        &self,
        mut ctx: ServerCallContext,
        payload: BoxStream<Result<Vec<u8>, TempoError>>,
        codec: ContentCodec,
        deadline: Option<Deadline>,
        origin: Option<&str>,
    ) -> Response<BoxBody> {
        ctx.freeze_outgoing();
        let mut builder = Response::builder()
            .status(HttpStatusCode::OK)
            .header("tempo-status", "0")
            .header("tempo-message", "OK")
            .header("content-type", codec.content_type());
        builder = attach_common_headers(builder, &ctx);
        builder = attach_cors_headers(builder, self.cors_allow_origin(origin));
        let wire = write_frames(payload, deadline, None);
        builder.body(stream_body(wire)).expect("response is well-formed")
    }

    fn finish_error(&self, mut ctx: ServerCallContext, e: TempoError, origin: Option<&str>) -> Response<BoxBody> {
        let _ = self.hooks.error.run(&mut ctx);
        let sanitized = e.sanitized(self.config.transmit_internal_errors);
        if sanitized.status.is_critical() {
            tracing::error!(status = %sanitized.status, message = %e.message, "call failed with a critical status");
        } else {
            tracing::warn!(status = %sanitized.status, message = %sanitized.message, "call failed");
        }
        status_only_response(sanitized.status, sanitized.message, self.cors_allow_origin(origin))
    }
}

fn clone_ctx(ctx: &ServerCallContext) -> ServerCallContext {
    let mut fresh = ServerCallContext::new(ctx.client_metadata.clone(), ctx.client_deadline);
    fresh.previous_attempts = ctx.previous_attempts;
    fresh
}

async fn wrap_no_ctx<T>(
    work: impl std::future::Future<Output = Result<(ServerCallContext, T), TempoError>>,
) -> Result<(ServerCallContext, T), TempoError> {
    work.await
}

fn attach_common_headers(
    mut builder: hyper::http::response::Builder,
    ctx: &ServerCallContext,
) -> hyper::http::response::Builder {
    if !ctx.outgoing_metadata.is_empty() {
        builder = builder.header("custom-metadata", ctx.outgoing_metadata.to_http_header());
    }
    if let Some(cred) = &ctx.outgoing_credential {
        builder = builder.header("tempo-credential", crate::credential::stringify_credential(cred));
    }
    builder
}

fn attach_cors_headers(
    mut builder: hyper::http::response::Builder,
    cors_origin: Option<String>,
) -> hyper::http::response::Builder {
    if let Some(origin) = cors_origin {
        builder = builder
            .header("access-control-allow-origin", origin)
            .header("vary", "Origin");
    }
    builder
}

fn status_only_response(
    status: StatusCode,
    message: impl Into<String>,
    cors_origin: Option<String>,
) -> Response<BoxBody> {
    let message = message.into();
    let mut builder = Response::builder()
        .status(HttpStatusCode::from_u16(status.to_http()).unwrap_or(HttpStatusCode::INTERNAL_SERVER_ERROR))
        .header("tempo-status", status.to_wire().to_string())
        .header("tempo-message", message)
        .header("content-length", "0");
    builder = attach_cors_headers(builder, cors_origin);
    builder.body(empty_body()).expect("status-only response is well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Message;
    use crate::registry::ServerMethod;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
    struct Req {
        name: String,
    }
    crate::impl_message_via_serde!(Req);

    #[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
    struct Resp {
        message: String,
    }
    crate::impl_message_via_serde!(Resp);

    fn build_router() -> Arc<ServerRouter> {
        let mut registry = MethodRegistry::new();
        registry
            .register(ServerMethod::unary(1, "Greeter", "sayHello", |ctx, req: Req| async move {
                Ok((
                    ctx,
                    Resp {
                        message: format!("Hello {}", req.name),
                    },
                ))
            }))
            .unwrap();
        Arc::new(ServerRouter::new(RouterConfig::default(), registry))
    }

    #[test]
    fn discovery_descriptor_serializes() {
        let body = serde_json::to_string(&DISCOVERY).unwrap();
        assert!(body.contains("\"language\":\"rust\""));
    }

    #[test]
    fn cors_wildcard_allows_any_origin() {
        let router = build_router();
        let mut config = RouterConfig::default();
        config.cors = CorsMode::Wildcard;
        let router = Arc::new(ServerRouter::new(config, MethodRegistry::new()));
        assert!(router.cors_origin_allowed("https://anything.example"));
        let _ = router;
    }

    #[test]
    fn cors_allow_list_rejects_unknown_origin() {
        let mut config = RouterConfig::default();
        config.cors = CorsMode::AllowList(vec!["https://ok.example".to_string()]);
        let router = ServerRouter::new(config, MethodRegistry::new());
        assert!(router.cors_origin_allowed("https://ok.example"));
        assert!(!router.cors_origin_allowed("https://evil.example"));
    }

    #[tokio::test]
    async fn unary_method_roundtrips_through_the_registry() {
        let router = build_router();
        let method = router.registry.lookup(1).unwrap();
        let ctx = ServerCallContext::new(Metadata::new(), None);
        let body = Req { name: "World".into() }.encode_with(ContentCodec::Json).unwrap();
        let (_ctx, resp_bytes) = method
            .invoke_unary(ctx, body, ContentCodec::Json, &crate::hooks::Phase::default())
            .await
            .unwrap();
        let resp = Resp::decode_with(&resp_bytes, ContentCodec::Json).unwrap();
        assert_eq!(resp.message, "Hello World");
    }

    #[test]
    fn cors_disabled_never_echoes_an_origin() {
        let router = ServerRouter::new(RouterConfig::default(), MethodRegistry::new());
        assert_eq!(router.cors_allow_origin(Some("https://example.com")), None);
    }

    #[test]
    fn cors_enabled_with_no_origin_header_is_not_a_cors_response() {
        let mut config = RouterConfig::default();
        config.cors = CorsMode::Wildcard;
        let router = ServerRouter::new(config, MethodRegistry::new());
        assert_eq!(router.cors_allow_origin(None), None);
    }

    #[test]
    fn cors_allow_list_echoes_the_specific_origin_not_a_wildcard() {
        let mut config = RouterConfig::default();
        config.cors = CorsMode::AllowList(vec!["https://ok.example".to_string()]);
        let router = ServerRouter::new(config, MethodRegistry::new());
        assert_eq!(
            router.cors_allow_origin(Some("https://ok.example")),
            Some("https://ok.example".to_string())
        );
    }

    #[test]
    fn cors_wildcard_echoes_a_star() {
        let mut config = RouterConfig::default();
        config.cors = CorsMode::Wildcard;
        let router = ServerRouter::new(config, MethodRegistry::new());
        assert_eq!(router.cors_allow_origin(Some("https://anything.example")), Some("*".to_string()));
    }

    #[test]
    fn successful_response_carries_cors_headers_when_enabled_and_origin_present() {
        let mut config = RouterConfig::default();
        config.cors = CorsMode::Wildcard;
        let router = ServerRouter::new(config, MethodRegistry::new());
        let ctx = ServerCallContext::new(Metadata::new(), None);
        let resp = router.finish_single(ctx, b"hi".to_vec(), ContentCodec::Json, Some("https://example.com"));
        assert_eq!(resp.headers().get("access-control-allow-origin").unwrap(), "*");
        assert_eq!(resp.headers().get("vary").unwrap(), "Origin");
    }

    #[test]
    fn default_sanitizer_escapes_html_and_drops_dollar_keys() {
        let sanitizer = DefaultObjectSanitizer;
        let input = serde_json::json!({
            "name": "<script>alert(1)</script>",
            "$where": "this.password == 'x'",
            "nested": { "$gt": 1, "safe": "A & B" },
        });
        let out = sanitizer.sanitize(input);
        assert_eq!(
            out["name"],
            serde_json::Value::String("&lt;script&gt;alert(1)&lt;/script&gt;".to_string())
        );
        assert!(out.get("$where").is_none());
        assert!(out["nested"].get("$gt").is_none());
        assert_eq!(out["nested"]["safe"], serde_json::Value::String("A &amp; B".to_string()));
    }

    #[test]
    fn sanitize_payload_is_a_noop_without_a_configured_sanitizer() {
        let router = ServerRouter::new(RouterConfig::default(), MethodRegistry::new());
        let body = serde_json::to_vec(&serde_json::json!({"$x": 1})).unwrap();
        let out = router.sanitize_payload(ContentCodec::Json, body.clone()).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn sanitize_payload_leaves_the_binary_codec_untouched() {
        let mut config = RouterConfig::default();
        config.sanitizer = Some(Arc::new(DefaultObjectSanitizer));
        let router = ServerRouter::new(config, MethodRegistry::new());
        let body = b"\x00\x01not-json-at-all".to_vec();
        let out = router.sanitize_payload(ContentCodec::Binary, body.clone()).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn sanitize_payload_applies_the_configured_sanitizer_to_json() {
        let mut config = RouterConfig::default();
        config.sanitizer = Some(Arc::new(DefaultObjectSanitizer));
        let router = ServerRouter::new(config, MethodRegistry::new());
        let body = serde_json::to_vec(&serde_json::json!({"$where": "x", "msg": "<b>hi</b>"})).unwrap();
        let out = router.sanitize_payload(ContentCodec::Json, body).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert!(value.get("$where").is_none());
        assert_eq!(value["msg"], serde_json::Value::String("&lt;b&gt;hi&lt;/b&gt;".to_string()));
    }
}
