//! Client channel.
//!
//! A `reqwest`-backed client with retry/backoff wired through the request
//! path and a shared header-building routine, covering all four call
//! shapes off one channel.

pub mod context;

use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

pub use context::ClientCallContext;

use crate::cancel::CancelToken;
use crate::codec::{ContentCodec, Message};
use crate::credential::{self, Credential};
use crate::deadline::Deadline;
use crate::hooks::Hooks;
use crate::metadata::Metadata;
use crate::registry::{BoxStream, MethodDescriptor};
use crate::retry::{execute_with_retry, RetryPolicy, PREVIOUS_ATTEMPTS_HEADER};
use crate::status::{StatusCode, TempoError};
use crate::stream::{read_frames, write_frames};

/// A call credential: attaches an `authorization` header and receives
/// whatever `tempo-credential` the server sends back. The default is an
/// insecure no-op that is exempt from the plaintext-transport guard (§9).
pub trait CallCredential: Send + Sync {
    fn get_header(&self) -> Option<String> {
        None
    }

    fn store(&self, _credential: Credential) {}

    fn is_insecure_noop(&self) -> bool {
        false
    }
}

pub struct NoCredential;

impl CallCredential for NoCredential {
    fn is_insecure_noop(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct ClientChannelConfig {
    pub target: String,
    pub codec: ContentCodec,
    pub max_receive_size: usize,
    pub user_agent: String,
    /// Allow a non-no-op credential on a plaintext target (§9: by default
    /// this is a construction-time error, not a silent downgrade).
    pub unsafe_allow_insecure: bool,
}

impl ClientChannelConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            codec: ContentCodec::Binary,
            max_receive_size: 4 * 1024 * 1024,
            user_agent: format!("tempo-rpc/{}", env!("CARGO_PKG_VERSION")),
            unsafe_allow_insecure: false,
        }
    }
}

pub struct ClientChannel {
    config: ClientChannelConfig,
    http: reqwest::Client,
    credential: Arc<dyn CallCredential>,
    hooks: Hooks<ClientCallContext>,
}

impl ClientChannel {
    pub fn new(config: ClientChannelConfig) -> Result<Self, TempoError> {
        Self::with_credential(config, Arc::new(NoCredential))
    }

    pub fn with_credential(
        config: ClientChannelConfig,
        credential: Arc<dyn CallCredential>,
    ) -> Result<Self, TempoError> {
        let target_url = url::Url::parse(&config.target)
            .map_err(|e| TempoError::new(StatusCode::InvalidArgument, format!("invalid target URL: {e}")))?;
        if !credential.is_insecure_noop()
            && !config.unsafe_allow_insecure
            && target_url.scheme() != "https"
        {
            return Err(TempoError::new(
                StatusCode::FailedPrecondition,
                "refusing to attach a credential over a plaintext target; set unsafe_allow_insecure to override",
            ));
        }
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(TempoError::from)?;
        Ok(Self {
            config,
            http,
            credential,
            hooks: Hooks::new(),
        })
    }

    /// Attach hooks. Spec: "hooks may be attached once" — enforced by
    /// consuming `self` and returning it, so there is no later setter to
    /// call twice.
    pub fn with_hooks(mut self, hooks: Hooks<ClientCallContext>) -> Self {
        self.hooks = hooks;
        self
    }

    fn url_for(&self, service: &str, method: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.target.trim_end_matches('/'),
            service,
            method
        )
    }

    fn build_headers(
        &self,
        method_id: u32,
        service: &str,
        method: &str,
        ctx: &ClientCallContext,
        attempt: u32,
    ) -> Result<HeaderMap, TempoError> {
        let mut headers = HeaderMap::new();
        let mut insert = |name: &'static str, value: String| -> Result<(), TempoError> {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| TempoError::new(StatusCode::InvalidArgument, e.to_string()))?;
            headers.insert(HeaderName::from_static(name), value);
            Ok(())
        };

        insert("tempo-method", method_id.to_string())?;
        insert("content-type", self.config.codec.content_type().to_string())?;
        insert("accept", self.config.codec.content_type().to_string())?;
        insert("path", format!("/{service}/{method}"))?;
        insert("service-name", service.to_string())?;
        if let Some(deadline) = ctx.deadline {
            insert("tempo-deadline", deadline.unix_millis().to_string())?;
        }
        if !ctx.outgoing_metadata.is_empty() {
            insert("custom-metadata", ctx.outgoing_metadata.to_http_header())?;
        }
        if let Some(auth) = self.credential.get_header() {
            insert("authorization", auth)?;
        }
        if attempt > 0 {
            insert(PREVIOUS_ATTEMPTS_HEADER, attempt.to_string())?;
        }
        Ok(headers)
    }

    fn check_status_header(&self, resp: &reqwest::Response) -> Result<(), TempoError> {
        let raw = resp
            .headers()
            .get("tempo-status")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u8>().ok());
        let Some(raw) = raw else {
            return Err(TempoError::new(
                StatusCode::Unknown,
                "response missing tempo-status header",
            ));
        };
        let status = StatusCode::from_wire(raw);
        if status != StatusCode::Ok {
            let message = resp
                .headers()
                .get("tempo-message")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            return Err(TempoError::new(status, message));
        }
        Ok(())
    }

    fn check_content_type(&self, resp: &reqwest::Response) -> Result<(), TempoError> {
        let content_type = resp.headers().get("content-type").and_then(|v| v.to_str().ok());
        match content_type.and_then(ContentCodec::from_content_type) {
            Some(codec) if codec == self.config.codec => Ok(()),
            _ => Err(TempoError::new(
                StatusCode::UnknownContentType,
                format!("unexpected content-type {content_type:?} for a {:?} channel", self.config.codec),
            )),
        }
    }

    fn check_content_length(&self, resp: &reqwest::Response) -> Result<(), TempoError> {
        let len = resp
            .content_length()
            .ok_or_else(|| TempoError::new(StatusCode::Unknown, "response missing content-length"))?
            as usize;
        if len > self.config.max_receive_size {
            return Err(TempoError::new(
                StatusCode::ResourceExhausted,
                format!("response body {len} exceeds max receive size {}", self.config.max_receive_size),
            ));
        }
        Ok(())
    }

    fn load_incoming(&self, resp: &reqwest::Response, ctx: &mut ClientCallContext) -> Result<(), TempoError> {
        if let Some(v) = resp.headers().get("custom-metadata").and_then(|v| v.to_str().ok()) {
            ctx.incoming_metadata = Metadata::from_http_header(v)?;
        }
        if let Some(v) = resp.headers().get("tempo-credential").and_then(|v| v.to_str().ok()) {
            let cred = credential::parse_credential(v)?;
            self.credential.store(cred);
        }
        Ok(())
    }

    /// Finishes a unary-shaped response: both `Unary` and `ClientStream`
    /// receive a single opaque payload (§4.7, §6).
    async fn complete_single_payload<Resp: Message>(
        &self,
        fetch_result: Result<reqwest::Response, TempoError>,
        ctx: &mut ClientCallContext,
    ) -> Result<Resp, TempoError> {
        let resp = fetch_result?;
        self.check_content_type(&resp)?;
        self.check_content_length(&resp)?;
        self.load_incoming(&resp, ctx)?;
        self.hooks.response.run(ctx)?;
        let bytes = resp.bytes().await.map_err(TempoError::from)?;
        let value = Resp::decode_with(&bytes, self.config.codec)?;
        self.hooks.decode.run(ctx)?;
        Ok(value)
    }

    fn fail<T>(&self, ctx: &mut ClientCallContext, e: TempoError) -> Result<(T, ClientCallContext), TempoError> {
        let _ = self.hooks.error.run(ctx);
        Err(e)
    }

    fn finish<T>(
        &self,
        mut ctx: ClientCallContext,
        result: Result<T, TempoError>,
    ) -> Result<(T, ClientCallContext), TempoError> {
        match result {
            Ok(value) => Ok((value, ctx)),
            Err(e) => {
                let _ = self.hooks.error.run(&mut ctx);
                Err(e)
            }
        }
    }

    /// Encode -> POST -> validate -> decode -> deliver (§4.7). If `retry`
    /// is set, the deadline wraps the whole retried operation rather than
    /// each individual attempt — only `retry`'s own per-attempt backoff
    /// sleeps are left unraced by the deadline, matching §4.7's "the
    /// deadline wraps the outer retried operation, not each attempt
    /// individually".
    pub async fn unary<Req, Resp>(
        &self,
        descriptor: &MethodDescriptor<Req, Resp>,
        req: Req,
        deadline: Option<Deadline>,
        retry: Option<&RetryPolicy>,
        cancel: Option<&CancelToken>,
    ) -> Result<(Resp, ClientCallContext), TempoError>
    where
        Req: Message,
        Resp: Message,
    {
        let mut ctx = ClientCallContext::new(deadline);
        if let Err(e) = self.hooks.request.run(&mut ctx) {
            return self.fail(&mut ctx, e);
        }
        let body_bytes = match req.encode_with(self.config.codec) {
            Ok(b) => b,
            Err(e) => return self.fail(&mut ctx, e),
        };
        let url = self.url_for(descriptor.service, descriptor.name);

        let fetch = |attempt: u32| {
            let body = body_bytes.clone();
            let url = url.clone();
            async move {
                let headers =
                    self.build_headers(descriptor.id, descriptor.service, descriptor.name, &ctx, attempt)?;
                let resp = self
                    .http
                    .post(&url)
                    .headers(headers)
                    .body(body)
                    .send()
                    .await
                    .map_err(TempoError::from)?;
                self.check_status_header(&resp)?;
                Ok(resp)
            }
        };

        let fetch_result: Result<reqwest::Response, TempoError> = match (retry, ctx.deadline) {
            (Some(policy), Some(dl)) => dl.race(execute_with_retry(fetch, policy, None, cancel), cancel).await,
            (Some(policy), None) => execute_with_retry(fetch, policy, None, cancel).await,
            (None, Some(dl)) => dl.race(fetch(0), cancel).await,
            (None, None) => fetch(0).await,
        };

        let result = self.complete_single_payload(fetch_result, &mut ctx).await;
        self.finish(ctx, result)
    }

    /// Open a streaming request body, send it, then decode a single
    /// response payload (§4.7).
    pub async fn client_stream<Req, Resp>(
        &self,
        descriptor: &MethodDescriptor<Req, Resp>,
        source: BoxStream<Result<Req, TempoError>>,
        deadline: Option<Deadline>,
        cancel: Option<&CancelToken>,
    ) -> Result<(Resp, ClientCallContext), TempoError>
    where
        Req: Message,
        Resp: Message,
    {
        let mut ctx = ClientCallContext::new(deadline);
        if let Err(e) = self.hooks.request.run(&mut ctx) {
            return self.fail(&mut ctx, e);
        }

        let codec = self.config.codec;
        let encoded: BoxStream<Result<Vec<u8>, TempoError>> =
            Box::pin(source.map(move |item| item.and_then(|r| r.encode_with(codec))));
        let wire = write_frames(encoded, ctx.deadline, cancel.cloned());
        let body = reqwest::Body::wrap_stream(wire);

        let url = self.url_for(descriptor.service, descriptor.name);
        let headers = match self.build_headers(descriptor.id, descriptor.service, descriptor.name, &ctx, 0) {
            Ok(h) => h,
            Err(e) => return self.fail(&mut ctx, e),
        };

        let send_fut = async {
            let resp = self
                .http
                .post(&url)
                .headers(headers)
                .body(body)
                .send()
                .await
                .map_err(TempoError::from)?;
            self.check_status_header(&resp)?;
            Ok(resp)
        };
        let fetch_result: Result<reqwest::Response, TempoError> = match ctx.deadline {
            Some(dl) => dl.race(send_fut, cancel).await,
            None => send_fut.await,
        };

        let result = self.complete_single_payload(fetch_result, &mut ctx).await;
        self.finish(ctx, result)
    }

    /// Encode a single request, POST it, then return a lazy reader over
    /// response frames (§4.7). Retry applies only to the initial POST.
    ///
    /// Decode hooks run per record inside the returned stream's pump
    /// rather than against the returned [`ClientCallContext`] (§9: decode
    /// hooks for server streaming are record-level, not call-level); this
    /// channel does not thread the call context into that per-frame hook
    /// since the context has already been handed back to the caller.
    pub async fn server_stream<Req, Resp>(
        &self,
        descriptor: &MethodDescriptor<Req, Resp>,
        req: Req,
        deadline: Option<Deadline>,
        retry: Option<&RetryPolicy>,
        cancel: Option<&CancelToken>,
    ) -> Result<(BoxStream<Result<Resp, TempoError>>, ClientCallContext), TempoError>
    where
        Req: Message,
        Resp: Message + 'static,
    {
        let mut ctx = ClientCallContext::new(deadline);
        if let Err(e) = self.hooks.request.run(&mut ctx) {
            return self.fail(&mut ctx, e);
        }
        let body_bytes = match req.encode_with(self.config.codec) {
            Ok(b) => b,
            Err(e) => return self.fail(&mut ctx, e),
        };
        let url = self.url_for(descriptor.service, descriptor.name);

        let fetch = |attempt: u32| {
            let body = body_bytes.clone();
            let url = url.clone();
            async move {
                let headers =
                    self.build_headers(descriptor.id, descriptor.service, descriptor.name, &ctx, attempt)?;
                let resp = self
                    .http
                    .post(&url)
                    .headers(headers)
                    .body(body)
                    .send()
                    .await
                    .map_err(TempoError::from)?;
                self.check_status_header(&resp)?;
                Ok(resp)
            }
        };

        let fetch_result: Result<reqwest::Response, TempoError> = match (retry, ctx.deadline) {
            (Some(policy), Some(dl)) => dl.race(execute_with_retry(fetch, policy, None, cancel), cancel).await,
            (Some(policy), None) => execute_with_retry(fetch, policy, None, cancel).await,
            (None, Some(dl)) => dl.race(fetch(0), cancel).await,
            (None, None) => fetch(0).await,
        };

        let resp = match fetch_result {
            Ok(r) => r,
            Err(e) => return self.fail(&mut ctx, e),
        };
        if let Err(e) = self.check_content_type(&resp) {
            return self.fail(&mut ctx, e);
        }
        if let Err(e) = self.load_incoming(&resp, &mut ctx) {
            return self.fail(&mut ctx, e);
        }
        if let Err(e) = self.hooks.response.run(&mut ctx) {
            return self.fail(&mut ctx, e);
        }

        let stream = self.decode_frame_stream::<Resp>(resp, ctx.deadline, cancel.cloned());
        Ok((stream, ctx))
    }

    /// Combine a streaming request with a streaming response (§4.7).
    pub async fn duplex_stream<Req, Resp>(
        &self,
        descriptor: &MethodDescriptor<Req, Resp>,
        source: BoxStream<Result<Req, TempoError>>,
        deadline: Option<Deadline>,
        cancel: Option<&CancelToken>,
    ) -> Result<(BoxStream<Result<Resp, TempoError>>, ClientCallContext), TempoError>
    where
        Req: Message,
        Resp: Message + 'static,
    {
        let mut ctx = ClientCallContext::new(deadline);
        if let Err(e) = self.hooks.request.run(&mut ctx) {
            return self.fail(&mut ctx, e);
        }

        let codec = self.config.codec;
        let encoded: BoxStream<Result<Vec<u8>, TempoError>> =
            Box::pin(source.map(move |item| item.and_then(|r| r.encode_with(codec))));
        let wire = write_frames(encoded, ctx.deadline, cancel.cloned());
        let body = reqwest::Body::wrap_stream(wire);

        let url = self.url_for(descriptor.service, descriptor.name);
        let headers = match self.build_headers(descriptor.id, descriptor.service, descriptor.name, &ctx, 0) {
            Ok(h) => h,
            Err(e) => return self.fail(&mut ctx, e),
        };

        let send_fut = async {
            let resp = self
                .http
                .post(&url)
                .headers(headers)
                .body(body)
                .send()
                .await
                .map_err(TempoError::from)?;
            self.check_status_header(&resp)?;
            Ok(resp)
        };
        let fetch_result: Result<reqwest::Response, TempoError> = match ctx.deadline {
            Some(dl) => dl.race(send_fut, cancel).await,
            None => send_fut.await,
        };

        let resp = match fetch_result {
            Ok(r) => r,
            Err(e) => return self.fail(&mut ctx, e),
        };
        if let Err(e) = self.check_content_type(&resp) {
            return self.fail(&mut ctx, e);
        }
        if let Err(e) = self.load_incoming(&resp, &mut ctx) {
            return self.fail(&mut ctx, e);
        }
        if let Err(e) = self.hooks.response.run(&mut ctx) {
            return self.fail(&mut ctx, e);
        }

        let stream = self.decode_frame_stream::<Resp>(resp, ctx.deadline, cancel.cloned());
        Ok((stream, ctx))
    }

    fn decode_frame_stream<Resp>(
        &self,
        resp: reqwest::Response,
        deadline: Option<Deadline>,
        cancel: Option<CancelToken>,
    ) -> BoxStream<Result<Resp, TempoError>>
    where
        Resp: Message + 'static,
    {
        let codec = self.config.codec;
        let max_receive = self.config.max_receive_size;
        let raw: BoxStream<Result<Bytes, TempoError>> =
            Box::pin(resp.bytes_stream().map(|r| r.map_err(TempoError::from)));
        let frames = read_frames(raw, deadline, cancel);
        Box::pin(frames.map(move |item| {
            item.and_then(|bytes| {
                if bytes.len() > max_receive {
                    return Err(TempoError::new(
                        StatusCode::ResourceExhausted,
                        format!("frame of {} bytes exceeds max receive size {max_receive}", bytes.len()),
                    ));
                }
                Resp::decode_with(&bytes, codec)
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RealCredential;
    impl CallCredential for RealCredential {
        fn get_header(&self) -> Option<String> {
            Some("Bearer real-token".to_string())
        }
    }

    #[test]
    fn plaintext_target_refuses_a_real_credential_by_default() {
        let config = ClientChannelConfig::new("http://127.0.0.1:7777");
        let err = ClientChannel::with_credential(config, Arc::new(RealCredential)).unwrap_err();
        assert_eq!(err.status, StatusCode::FailedPrecondition);
    }

    #[test]
    fn plaintext_target_accepts_the_noop_credential() {
        let config = ClientChannelConfig::new("http://127.0.0.1:7777");
        assert!(ClientChannel::new(config).is_ok());
    }

    #[test]
    fn unsafe_allow_insecure_permits_a_real_credential_over_plaintext() {
        let mut config = ClientChannelConfig::new("http://127.0.0.1:7777");
        config.unsafe_allow_insecure = true;
        assert!(ClientChannel::with_credential(config, Arc::new(RealCredential)).is_ok());
    }

    #[test]
    fn https_target_accepts_a_real_credential() {
        let config = ClientChannelConfig::new("https://example.com");
        assert!(ClientChannel::with_credential(config, Arc::new(RealCredential)).is_ok());
    }

    #[test]
    fn url_for_joins_service_and_method() {
        let channel = ClientChannel::new(ClientChannelConfig::new("http://127.0.0.1:7777/")).unwrap();
        assert_eq!(channel.url_for("Greeter", "sayHello"), "http://127.0.0.1:7777/Greeter/sayHello");
    }

    #[test]
    fn build_headers_sets_the_common_envelope() {
        let channel = ClientChannel::new(ClientChannelConfig::new("http://127.0.0.1:7777")).unwrap();
        let ctx = ClientCallContext::new(None);
        let headers = channel.build_headers(7, "Greeter", "sayHello", &ctx, 0).unwrap();
        assert_eq!(headers.get("tempo-method").unwrap(), "7");
        assert_eq!(headers.get("path").unwrap(), "/Greeter/sayHello");
        assert_eq!(headers.get("service-name").unwrap(), "Greeter");
        assert_eq!(headers.get("content-type").unwrap(), "application/tempo+bebop");
        assert!(headers.get(PREVIOUS_ATTEMPTS_HEADER).is_none());
    }

    #[test]
    fn build_headers_sets_previous_attempts_only_on_retries() {
        let channel = ClientChannel::new(ClientChannelConfig::new("http://127.0.0.1:7777")).unwrap();
        let ctx = ClientCallContext::new(None);
        let headers = channel.build_headers(7, "Greeter", "sayHello", &ctx, 2).unwrap();
        assert_eq!(headers.get(PREVIOUS_ATTEMPTS_HEADER).unwrap(), "2");
    }
}
