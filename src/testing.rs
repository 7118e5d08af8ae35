//! In-memory channel/router pair for fast unit tests of the four call
//! shapes, wired directly together with no real socket: dispatches
//! straight into `ServerMethod`/`MethodRegistry` rather than over a TCP
//! loopback.
//!
//! [`TestHarness`] dispatches straight into a [`MethodRegistry`], running
//! the same metadata/deadline extraction and status mapping the real
//! [`crate::server::ServerRouter`] performs, minus HTTP framing. It exists
//! for service-implementation tests that want the four shapes' semantics
//! without paying for a listener and an HTTP client per test.

use futures_util::stream::{self, StreamExt};

use crate::auth::{AuthContext, AuthInterceptor, NoopAuthInterceptor};
use crate::codec::{ContentCodec, Message};
use crate::credential::Credential;
use crate::deadline::Deadline;
use crate::hooks::Phase;
use crate::metadata::Metadata;
use crate::registry::{BoxStream, MethodDescriptor, MethodRegistry};
use crate::server::context::ServerCallContext;
use crate::status::{StatusCode, TempoError};

/// The call-scoped inputs a [`TestHarness`] accepts, mirroring the headers
/// a real transport would carry (§6).
pub struct TestCallOptions {
    pub metadata: Metadata,
    pub deadline: Option<Deadline>,
    pub authorization: Option<String>,
    pub codec: ContentCodec,
}

impl Default for TestCallOptions {
    fn default() -> Self {
        Self {
            metadata: Metadata::new(),
            deadline: None,
            authorization: None,
            codec: ContentCodec::Json,
        }
    }
}

impl TestCallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_codec(mut self, codec: ContentCodec) -> Self {
        self.codec = codec;
        self
    }
}

/// Everything a caller gets back from an in-memory call: the decoded
/// payload(s) plus the server's outgoing metadata/credential, the way a
/// real client call context surfaces `incoming_metadata` (§3).
pub struct TestOutcome<T> {
    pub value: T,
    pub metadata: Metadata,
    pub credential: Option<Credential>,
    pub auth_context: Option<AuthContext>,
}

/// A [`MethodRegistry`] paired with the policy bits the router would
/// otherwise enforce (auth, internal-error sanitization), callable
/// in-process (§B).
pub struct TestHarness {
    registry: MethodRegistry,
    auth: Box<dyn AuthInterceptor>,
    transmit_internal_errors: bool,
}

impl TestHarness {
    pub fn new(registry: MethodRegistry) -> Self {
        Self {
            registry,
            auth: Box::new(NoopAuthInterceptor),
            transmit_internal_errors: true,
        }
    }

    pub fn with_auth(mut self, auth: Box<dyn AuthInterceptor>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_transmit_internal_errors(mut self, transmit: bool) -> Self {
        self.transmit_internal_errors = transmit;
        self
    }

    fn build_context(&self, opts: &TestCallOptions) -> Result<ServerCallContext, TempoError> {
        if let Some(deadline) = opts.deadline {
            if deadline.is_expired() {
                return Err(TempoError::new(
                    StatusCode::DeadlineExceeded,
                    "deadline already expired",
                ));
            }
        }
        let mut ctx = ServerCallContext::new(opts.metadata.clone(), opts.deadline);
        let auth_ctx = self
            .auth
            .authenticate(opts.authorization.as_deref())
            .map_err(|e| e.sanitized(self.transmit_internal_errors))?;
        ctx.auth_context = Some(auth_ctx);
        Ok(ctx)
    }

    fn outcome<T>(ctx: ServerCallContext, value: T) -> TestOutcome<T> {
        TestOutcome {
            value,
            metadata: ctx.outgoing_metadata,
            credential: ctx.outgoing_credential,
            auth_context: ctx.auth_context,
        }
    }

    /// Dispatch a unary call directly through [`ServerMethod::invoke_unary`].
    pub async fn call_unary<Req, Resp>(
        &self,
        descriptor: &MethodDescriptor<Req, Resp>,
        req: Req,
        opts: TestCallOptions,
    ) -> Result<TestOutcome<Resp>, TempoError>
    where
        Req: Message,
        Resp: Message,
    {
        let ctx = self.build_context(&opts)?;
        let method = self.registry.lookup(descriptor.id).ok_or_else(|| {
            TempoError::new(
                StatusCode::FailedPrecondition,
                format!("unknown method id {}", descriptor.id),
            )
        })?;
        let body = req.encode_with(opts.codec)?;
        let (ctx, resp_bytes) = method
            .invoke_unary(ctx, body, opts.codec, &Phase::default())
            .await?;
        let resp = Resp::decode_with(&resp_bytes, opts.codec)?;
        Ok(Self::outcome(ctx, resp))
    }

    /// Dispatch a client-streaming call: `reqs` is consumed into a finite
    /// stream the handler reads record-by-record (§4.2, §9).
    pub async fn call_client_stream<Req, Resp>(
        &self,
        descriptor: &MethodDescriptor<Req, Resp>,
        reqs: Vec<Req>,
        opts: TestCallOptions,
    ) -> Result<TestOutcome<Resp>, TempoError>
    where
        Req: Message,
        Resp: Message,
    {
        let ctx = self.build_context(&opts)?;
        let method = self.registry.lookup(descriptor.id).ok_or_else(|| {
            TempoError::new(
                StatusCode::FailedPrecondition,
                format!("unknown method id {}", descriptor.id),
            )
        })?;
        let codec = opts.codec;
        let encoded: BoxStream<Result<Vec<u8>, TempoError>> = Box::pin(stream::iter(
            reqs.into_iter().map(move |r| r.encode_with(codec)),
        ));
        let (ctx, resp_bytes) = method.invoke_client_stream(ctx, encoded, codec).await?;
        let resp = Resp::decode_with(&resp_bytes, codec)?;
        Ok(Self::outcome(ctx, resp))
    }

    /// Dispatch a server-streaming call, collecting every yielded record
    /// eagerly (test convenience — production callers use the lazy stream
    /// the real router/channel hand back).
    pub async fn call_server_stream<Req, Resp>(
        &self,
        descriptor: &MethodDescriptor<Req, Resp>,
        req: Req,
        opts: TestCallOptions,
    ) -> Result<TestOutcome<Vec<Resp>>, TempoError>
    where
        Req: Message,
        Resp: Message,
    {
        let ctx = self.build_context(&opts)?;
        let method = self.registry.lookup(descriptor.id).ok_or_else(|| {
            TempoError::new(
                StatusCode::FailedPrecondition,
                format!("unknown method id {}", descriptor.id),
            )
        })?;
        let codec = opts.codec;
        let body = req.encode_with(codec)?;
        let (ctx, mut resp_stream) = method.invoke_server_stream(ctx, body, codec).await?;
        let mut collected = Vec::new();
        while let Some(item) = resp_stream.next().await {
            collected.push(Resp::decode_with(&item?, codec)?);
        }
        Ok(Self::outcome(ctx, collected))
    }

    /// Dispatch a duplex call, collecting every yielded response eagerly.
    pub async fn call_duplex_stream<Req, Resp>(
        &self,
        descriptor: &MethodDescriptor<Req, Resp>,
        reqs: Vec<Req>,
        opts: TestCallOptions,
    ) -> Result<TestOutcome<Vec<Resp>>, TempoError>
    where
        Req: Message,
        Resp: Message,
    {
        let ctx = self.build_context(&opts)?;
        let method = self.registry.lookup(descriptor.id).ok_or_else(|| {
            TempoError::new(
                StatusCode::FailedPrecondition,
                format!("unknown method id {}", descriptor.id),
            )
        })?;
        let codec = opts.codec;
        let encoded: BoxStream<Result<Vec<u8>, TempoError>> = Box::pin(stream::iter(
            reqs.into_iter().map(move |r| r.encode_with(codec)),
        ));
        let (ctx, mut resp_stream) = method.invoke_duplex_stream(ctx, encoded, codec).await?;
        let mut collected = Vec::new();
        while let Some(item) = resp_stream.next().await {
            collected.push(Resp::decode_with(&item?, codec)?);
        }
        Ok(Self::outcome(ctx, collected))
    }
}
