//! A tiny `Greeter` service exercising all four call shapes, standing in
//! for the code-generated records the real binary codec would produce
//! (§1 "assumed provided by a code-generator"). Records here implement
//! [`tempo_rpc::codec::Message`] via the crate's serde blanket impl.

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use tempo_rpc::impl_message_via_serde;
use tempo_rpc::registry::{BoxStream, MethodDescriptor, MethodRegistry, Shape, ServerMethod};
use tempo_rpc::status::TempoError;

pub const SERVICE: &str = "Greeter";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloRequest {
    pub name: String,
}
impl_message_via_serde!(HelloRequest);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResponse {
    pub service_message: String,
}
impl_message_via_serde!(HelloResponse);

/// Method id 7: `Greeter.sayHello`, unary (§8 scenario 1).
pub const SAY_HELLO: MethodDescriptor<HelloRequest, HelloResponse> =
    MethodDescriptor::new(7, SERVICE, "sayHello", Shape::Unary);

/// Method id 8: `Greeter.lotsOfReplies`, server-stream (§8 scenario 2).
pub const LOTS_OF_REPLIES: MethodDescriptor<HelloRequest, HelloResponse> =
    MethodDescriptor::new(8, SERVICE, "lotsOfReplies", Shape::ServerStream);

/// Method id 9: `Greeter.sumGreetings`, client-stream (§8 scenario 3).
pub const SUM_GREETINGS: MethodDescriptor<HelloRequest, HelloResponse> =
    MethodDescriptor::new(9, SERVICE, "sumGreetings", Shape::ClientStream);

/// Method id 10: `Greeter.echoGreetings`, duplex-stream (§8 scenario 4).
pub const ECHO_GREETINGS: MethodDescriptor<HelloRequest, HelloResponse> =
    MethodDescriptor::new(10, SERVICE, "echoGreetings", Shape::DuplexStream);

/// Register every `Greeter` handler into `registry` (§4.6).
pub fn register(registry: &mut MethodRegistry) -> Result<(), TempoError> {
    registry.register(ServerMethod::unary(
        SAY_HELLO.id,
        SERVICE,
        SAY_HELLO.name,
        |ctx, req: HelloRequest| async move {
            Ok((
                ctx,
                HelloResponse {
                    service_message: format!("Hello {}", req.name),
                },
            ))
        },
    ))?;

    registry.register(ServerMethod::server_stream(
        LOTS_OF_REPLIES.id,
        SERVICE,
        LOTS_OF_REPLIES.name,
        |ctx, req: HelloRequest| async move {
            let items: Vec<Result<HelloResponse, TempoError>> = (0..10)
                .map(|i| {
                    Ok(HelloResponse {
                        service_message: format!("Hello {} / {i}", req.name),
                    })
                })
                .collect();
            let stream: BoxStream<Result<HelloResponse, TempoError>> =
                Box::pin(stream::iter(items));
            Ok((ctx, stream))
        },
    ))?;

    registry.register(ServerMethod::client_stream(
        SUM_GREETINGS.id,
        SERVICE,
        SUM_GREETINGS.name,
        |ctx, mut reqs: BoxStream<Result<HelloRequest, TempoError>>| async move {
            let mut count = 0usize;
            while let Some(item) = reqs.next().await {
                item?;
                count += 1;
            }
            Ok((
                ctx,
                HelloResponse {
                    service_message: format!("You sent {count} messages"),
                },
            ))
        },
    ))?;

    registry.register(ServerMethod::duplex_stream(
        ECHO_GREETINGS.id,
        SERVICE,
        ECHO_GREETINGS.name,
        |ctx, reqs: BoxStream<Result<HelloRequest, TempoError>>| async move {
            let echoed: BoxStream<Result<HelloResponse, TempoError>> = Box::pin(reqs.map(|item| {
                item.map(|req| HelloResponse {
                    service_message: format!("Hello {}", req.name),
                })
            }));
            Ok((ctx, echoed))
        },
    ))?;

    Ok(())
}
