//! Method registry.
//!
//! The client only ever needs a method's id/name/service/shape — the actual
//! encode/decode lives on the `Message` impl of the request/response types
//! themselves, so [`MethodDescriptor`] stays a thin, fully generic, typed
//! handle. The server needs to dispatch by numeric id across heterogeneous
//! `Req`/`Resp` types at runtime, so [`ServerMethod`] erases them behind a
//! boxed closure operating on codec-tagged byte payloads, the way generated
//! gRPC service code erases handler signatures down to a byte-level
//! `Service`.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::stream::{Stream, StreamExt};

use crate::codec::{ContentCodec, Message};
use crate::hooks::Phase;
use crate::server::context::ServerCallContext;
use crate::status::{StatusCode, TempoError};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// One of the four call shapes (§3, glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    Unary,
    ClientStream,
    ServerStream,
    DuplexStream,
}

/// A typed, client-side handle to a method. Carries no executable code of
/// its own — encode/decode come from `Req`/`Resp`'s [`Message`] impl, and
/// invocation is done by [`crate::client::ClientChannel`].
#[derive(Debug, Clone)]
pub struct MethodDescriptor<Req, Resp> {
    pub id: u32,
    pub name: &'static str,
    pub service: &'static str,
    pub shape: Shape,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> MethodDescriptor<Req, Resp>
where
    Req: Message,
    Resp: Message,
{
    pub const fn new(id: u32, service: &'static str, name: &'static str, shape: Shape) -> Self {
        Self {
            id,
            name,
            service,
            shape,
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.name)
    }
}

/// The erased, per-shape handler a [`ServerMethod`] carries. Every variant
/// takes the codec the request actually arrived in, so encode/decode of the
/// (now-erased) `Req`/`Resp` happens once, inside the closure captured at
/// registration time when the concrete types were still in scope.
enum ErasedHandler {
    /// Unlike the other three shapes, the unary handler also takes the
    /// router's decode-hook phase, since §4.8 requires it to run between
    /// decode and handler invocation — a synchronous step that has to
    /// happen before the handler's future is even constructed, not inside
    /// it.
    Unary(
        Arc<
            dyn Fn(
                    ServerCallContext,
                    Vec<u8>,
                    ContentCodec,
                    &Phase<ServerCallContext>,
                ) -> BoxFuture<'static, Result<(ServerCallContext, Vec<u8>), TempoError>>
                + Send
                + Sync,
        >,
    ),
    ClientStream(
        Arc<
            dyn Fn(
                    ServerCallContext,
                    BoxStream<Result<Vec<u8>, TempoError>>,
                    ContentCodec,
                ) -> BoxFuture<'static, Result<(ServerCallContext, Vec<u8>), TempoError>>
                + Send
                + Sync,
        >,
    ),
    ServerStream(
        Arc<
            dyn Fn(
                    ServerCallContext,
                    Vec<u8>,
                    ContentCodec,
                ) -> BoxFuture<
                    'static,
                    Result<(ServerCallContext, BoxStream<Result<Vec<u8>, TempoError>>), TempoError>,
                > + Send
                + Sync,
        >,
    ),
    DuplexStream(
        Arc<
            dyn Fn(
                    ServerCallContext,
                    BoxStream<Result<Vec<u8>, TempoError>>,
                    ContentCodec,
                ) -> BoxFuture<
                    'static,
                    Result<(ServerCallContext, BoxStream<Result<Vec<u8>, TempoError>>), TempoError>,
                > + Send
                + Sync,
        >,
    ),
}

/// A registered, type-erased server method. Construct with the shape-
/// matching helper ([`ServerMethod::unary`] etc.); the router dispatches on
/// `.shape` and calls into the boxed handler.
pub struct ServerMethod {
    pub id: u32,
    pub name: String,
    pub service: String,
    pub shape: Shape,
    handler: ErasedHandler,
}

impl ServerMethod {
    pub fn unary<Req, Resp, F, Fut>(id: u32, service: &str, name: &str, handler: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: Fn(ServerCallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(ServerCallContext, Resp), TempoError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased = move |mut ctx: ServerCallContext,
                            bytes: Vec<u8>,
                            codec: ContentCodec,
                            decode_hooks: &Phase<ServerCallContext>| {
            let handler = Arc::clone(&handler);
            // Decode and run decode hooks synchronously, before the
            // handler's future even exists (§4.8: "decode, run decode
            // hooks, invoke handler").
            let decoded = Req::decode_with(&bytes, codec).and_then(|req| {
                decode_hooks.run(&mut ctx)?;
                Ok(req)
            });
            Box::pin(async move {
                let req = decoded?;
                let (ctx, resp) = handler(ctx, req).await?;
                Ok((ctx, resp.encode_with(codec)?))
            }) as BoxFuture<'static, Result<(ServerCallContext, Vec<u8>), TempoError>>
        };
        Self {
            id,
            name: name.to_string(),
            service: service.to_string(),
            shape: Shape::Unary,
            handler: ErasedHandler::Unary(Arc::new(erased)),
        }
    }

    pub fn client_stream<Req, Resp, F, Fut>(id: u32, service: &str, name: &str, handler: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: Fn(ServerCallContext, BoxStream<Result<Req, TempoError>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(ServerCallContext, Resp), TempoError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased = move |ctx: ServerCallContext,
                            raw: BoxStream<Result<Vec<u8>, TempoError>>,
                            codec: ContentCodec| {
            let handler = Arc::clone(&handler);
            let decoded: BoxStream<Result<Req, TempoError>> =
                Box::pin(raw.map(move |item| item.and_then(|b| Req::decode_with(&b, codec))));
            Box::pin(async move {
                let (ctx, resp) = handler(ctx, decoded).await?;
                Ok((ctx, resp.encode_with(codec)?))
            }) as BoxFuture<'static, Result<(ServerCallContext, Vec<u8>), TempoError>>
        };
        Self {
            id,
            name: name.to_string(),
            service: service.to_string(),
            shape: Shape::ClientStream,
            handler: ErasedHandler::ClientStream(Arc::new(erased)),
        }
    }

    pub fn server_stream<Req, Resp, F, Fut>(id: u32, service: &str, name: &str, handler: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: Fn(ServerCallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(ServerCallContext, BoxStream<Result<Resp, TempoError>>), TempoError>>
            + Send
            + 'static,
    {
        let handler = Arc::new(handler);
        let erased = move |ctx: ServerCallContext, bytes: Vec<u8>, codec: ContentCodec| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let req = Req::decode_with(&bytes, codec)?;
                let (ctx, resp_stream) = handler(ctx, req).await?;
                let encoded: BoxStream<Result<Vec<u8>, TempoError>> = Box::pin(
                    resp_stream.map(move |item| item.and_then(|r| r.encode_with(codec))),
                );
                Ok((ctx, encoded))
            })
                as BoxFuture<
                    'static,
                    Result<(ServerCallContext, BoxStream<Result<Vec<u8>, TempoError>>), TempoError>,
                >
        };
        Self {
            id,
            name: name.to_string(),
            service: service.to_string(),
            shape: Shape::ServerStream,
            handler: ErasedHandler::ServerStream(Arc::new(erased)),
        }
    }

    pub fn duplex_stream<Req, Resp, F, Fut>(id: u32, service: &str, name: &str, handler: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: Fn(ServerCallContext, BoxStream<Result<Req, TempoError>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(ServerCallContext, BoxStream<Result<Resp, TempoError>>), TempoError>>
            + Send
            + 'static,
    {
        let handler = Arc::new(handler);
        let erased = move |ctx: ServerCallContext,
                            raw: BoxStream<Result<Vec<u8>, TempoError>>,
                            codec: ContentCodec| {
            let handler = Arc::clone(&handler);
            let decoded: BoxStream<Result<Req, TempoError>> =
                Box::pin(raw.map(move |item| item.and_then(|b| Req::decode_with(&b, codec))));
            Box::pin(async move {
                let (ctx, resp_stream) = handler(ctx, decoded).await?;
                let encoded: BoxStream<Result<Vec<u8>, TempoError>> = Box::pin(
                    resp_stream.map(move |item| item.and_then(|r| r.encode_with(codec))),
                );
                Ok((ctx, encoded))
            })
                as BoxFuture<
                    'static,
                    Result<(ServerCallContext, BoxStream<Result<Vec<u8>, TempoError>>), TempoError>,
                >
        };
        Self {
            id,
            name: name.to_string(),
            service: service.to_string(),
            shape: Shape::DuplexStream,
            handler: ErasedHandler::DuplexStream(Arc::new(erased)),
        }
    }

    pub(crate) async fn invoke_unary(
        &self,
        ctx: ServerCallContext,
        body: Vec<u8>,
        codec: ContentCodec,
        decode_hooks: &Phase<ServerCallContext>,
    ) -> Result<(ServerCallContext, Vec<u8>), TempoError> {
        match &self.handler {
            ErasedHandler::Unary(f) => f(ctx, body, codec, decode_hooks).await,
            _ => Err(TempoError::new(
                StatusCode::Internal,
                "invoke_unary called on a non-unary method",
            )),
        }
    }

    pub(crate) async fn invoke_client_stream(
        &self,
        ctx: ServerCallContext,
        body: BoxStream<Result<Vec<u8>, TempoError>>,
        codec: ContentCodec,
    ) -> Result<(ServerCallContext, Vec<u8>), TempoError> {
        match &self.handler {
            ErasedHandler::ClientStream(f) => f(ctx, body, codec).await,
            _ => Err(TempoError::new(
                StatusCode::Internal,
                "invoke_client_stream called on a non-client-stream method",
            )),
        }
    }

    pub(crate) async fn invoke_server_stream(
        &self,
        ctx: ServerCallContext,
        body: Vec<u8>,
        codec: ContentCodec,
    ) -> Result<(ServerCallContext, BoxStream<Result<Vec<u8>, TempoError>>), TempoError> {
        match &self.handler {
            ErasedHandler::ServerStream(f) => f(ctx, body, codec).await,
            _ => Err(TempoError::new(
                StatusCode::Internal,
                "invoke_server_stream called on a non-server-stream method",
            )),
        }
    }

    pub(crate) async fn invoke_duplex_stream(
        &self,
        ctx: ServerCallContext,
        body: BoxStream<Result<Vec<u8>, TempoError>>,
        codec: ContentCodec,
    ) -> Result<(ServerCallContext, BoxStream<Result<Vec<u8>, TempoError>>), TempoError> {
        match &self.handler {
            ErasedHandler::DuplexStream(f) => f(ctx, body, codec).await,
            _ => Err(TempoError::new(
                StatusCode::Internal,
                "invoke_duplex_stream called on a non-duplex-stream method",
            )),
        }
    }
}

/// Id-keyed registry of server methods (§4.6). Immutable after
/// construction is complete; registration is the only mutating operation,
/// and it is meant to run once at startup.
#[derive(Default)]
pub struct MethodRegistry {
    by_id: HashMap<u32, ServerMethod>,
    service_methods: std::collections::HashSet<(String, String)>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method. Fails `INTERNAL` on a duplicate id or a duplicate
    /// `(service, name)` pair (§4.6, §9 — ids are wire-breaking to change,
    /// so collisions are caught eagerly rather than silently overwritten).
    pub fn register(&mut self, method: ServerMethod) -> Result<(), TempoError> {
        if self.by_id.contains_key(&method.id) {
            return Err(TempoError::new(
                StatusCode::Internal,
                format!("duplicate method id {}", method.id),
            ));
        }
        let key = (method.service.clone(), method.name.clone());
        if !self.service_methods.insert(key) {
            return Err(TempoError::new(
                StatusCode::Internal,
                format!("duplicate method {}/{}", method.service, method.name),
            ));
        }
        self.by_id.insert(method.id, method);
        Ok(())
    }

    /// Lookup by numeric id. `None` signals the router to raise
    /// `FAILED_PRECONDITION` (§4.6, §4.8).
    pub fn lookup(&self, id: u32) -> Option<&ServerMethod> {
        self.by_id.get(&id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::Credential;
    use crate::deadline::Deadline;
    use crate::metadata::Metadata;
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

    fn ctx() -> ServerCallContext {
        ServerCallContext::new(Metadata::new(), None::<Deadline>)
    }

    #[test]
    fn descriptor_builds_its_path() {
        let d: MethodDescriptor<Req, Resp> =
            MethodDescriptor::new(7, "Greeter", "sayHello", Shape::Unary);
        assert_eq!(d.path(), "/Greeter/sayHello");
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut reg = MethodRegistry::new();
        reg.register(ServerMethod::unary(1, "Svc", "a", |ctx, req: Req| async move {
            Ok((ctx, Resp { message: req.name }))
        }))
        .unwrap();
        let err = reg
            .register(ServerMethod::unary(1, "Svc", "b", |ctx, req: Req| async move {
                Ok((ctx, Resp { message: req.name }))
            }))
            .unwrap_err();
        assert_eq!(err.status, StatusCode::Internal);
    }

    #[test]
    fn duplicate_service_method_name_is_rejected() {
        let mut reg = MethodRegistry::new();
        reg.register(ServerMethod::unary(1, "Svc", "a", |ctx, req: Req| async move {
            Ok((ctx, Resp { message: req.name }))
        }))
        .unwrap();
        let err = reg
            .register(ServerMethod::unary(2, "Svc", "a", |ctx, req: Req| async move {
                Ok((ctx, Resp { message: req.name }))
            }))
            .unwrap_err();
        assert_eq!(err.status, StatusCode::Internal);
    }

    #[test]
    fn lookup_of_unknown_id_is_none() {
        let reg = MethodRegistry::new();
        assert!(reg.lookup(42).is_none());
    }

    #[tokio::test]
    async fn unary_handler_roundtrips_through_erasure() {
        let mut reg = MethodRegistry::new();
        reg.register(ServerMethod::unary(
            7,
            "Greeter",
            "sayHello",
            |ctx, req: Req| async move {
                Ok((
                    ctx,
                    Resp {
                        message: format!("Hello {}", req.name),
                    },
                ))
            },
        ))
        .unwrap();

        let method = reg.lookup(7).unwrap();
        let body = serde_json::to_vec(&Req {
            name: "World".to_string(),
        })
        .unwrap();
        let (_ctx, resp_bytes) = method
            .invoke_unary(ctx(), body, ContentCodec::Json, &Phase::default())
            .await
            .unwrap();
        let resp: Resp = serde_json::from_slice(&resp_bytes).unwrap();
        assert_eq!(resp.message, "Hello World");
    }

    #[tokio::test]
    async fn unary_decode_hook_runs_between_decode_and_handler() {
        let mut reg = MethodRegistry::new();
        reg.register(ServerMethod::unary(1, "Svc", "a", |ctx, req: Req| async move {
            Ok((ctx, Resp { message: req.name }))
        }))
        .unwrap();

        let method = reg.lookup(1).unwrap();
        let body = serde_json::to_vec(&Req {
            name: "World".to_string(),
        })
        .unwrap();

        let mut decode_hooks: Phase<ServerCallContext> = Phase::default();
        decode_hooks.push(Arc::new(
            |ctx: &mut ServerCallContext, next: crate::hooks::Next<'_, ServerCallContext>| {
                ctx.previous_attempts += 1;
                next.call(ctx)
            },
        ));

        let (ctx, _resp_bytes) = method
            .invoke_unary(ctx(), body, ContentCodec::Json, &decode_hooks)
            .await
            .unwrap();
        assert_eq!(ctx.previous_attempts, 1);
    }

    #[tokio::test]
    async fn unary_decode_hook_error_prevents_handler_invocation() {
        let mut reg = MethodRegistry::new();
        reg.register(ServerMethod::unary(1, "Svc", "a", |_ctx, _req: Req| async move {
            panic!("handler must not run when a decode hook rejects the call");
        }))
        .unwrap();

        let method = reg.lookup(1).unwrap();
        let body = serde_json::to_vec(&Req {
            name: "World".to_string(),
        })
        .unwrap();

        let mut decode_hooks: Phase<ServerCallContext> = Phase::default();
        decode_hooks.push(Arc::new(
            |_ctx: &mut ServerCallContext, _next: crate::hooks::Next<'_, ServerCallContext>| {
                Err(TempoError::new(StatusCode::InvalidArgument, "rejected in decode hook"))
            },
        ));

        let err = method
            .invoke_unary(ctx(), body, ContentCodec::Json, &decode_hooks)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::InvalidArgument);
    }

    #[tokio::test]
    async fn server_stream_handler_yields_frames_via_erasure() {
        let mut reg = MethodRegistry::new();
        reg.register(ServerMethod::server_stream(
            8,
            "Greeter",
            "lotsOfReplies",
            |ctx, req: Req| async move {
                let items: Vec<Result<Resp, TempoError>> = (0..3)
                    .map(|i| {
                        Ok(Resp {
                            message: format!("{} / {}", req.name, i),
                        })
                    })
                    .collect();
                let stream: BoxStream<Result<Resp, TempoError>> =
                    Box::pin(futures_util::stream::iter(items));
                Ok((ctx, stream))
            },
        ))
        .unwrap();

        let method = reg.lookup(8).unwrap();
        let body = serde_json::to_vec(&Req {
            name: "World".to_string(),
        })
        .unwrap();
        let (_ctx, mut stream) = method
            .invoke_server_stream(ctx(), body, ContentCodec::Json)
            .await
            .unwrap();
        let mut collected = Vec::new();
        while let Some(item) = stream.next().await {
            let bytes = item.unwrap();
            let resp: Resp = serde_json::from_slice(&bytes).unwrap();
            collected.push(resp.message);
        }
        assert_eq!(
            collected,
            vec!["World / 0".to_string(), "World / 1".to_string(), "World / 2".to_string()]
        );
    }
}
