//! Demo binary for the Tempo RPC runtime: a `Greeter` service server and a
//! client able to invoke all four call shapes against it (§A.3, §8).
//!
//! ```text
//! tempo-demo serve --listen-addr 127.0.0.1:7777
//! tempo-demo call --target http://127.0.0.1:7777 say-hello --name World
//! ```

mod greeter;

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use futures_util::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::info;

use tempo_rpc::client::{ClientChannel, ClientChannelConfig};
use tempo_rpc::config::{init_tracing, ChannelConfig, ServerConfig};
use tempo_rpc::deadline::Deadline;
use tempo_rpc::registry::{BoxStream, MethodRegistry};
use tempo_rpc::retry::RetryPolicy;
use tempo_rpc::server::{DefaultObjectSanitizer, RouterConfig, ServerRouter};
use tempo_rpc::status::{StatusCode, TempoError};

use greeter::HelloRequest;

#[derive(Parser)]
#[command(name = "tempo-demo", version, about = "Tempo RPC Greeter demo server and client")]
enum Cli {
    /// Run the Greeter server.
    Serve(ServerConfig),
    /// Call the Greeter server.
    Call(CallArgs),
}

#[derive(Args)]
struct CallArgs {
    #[command(flatten)]
    channel: ChannelConfig,

    #[command(subcommand)]
    method: CallMethod,
}

#[derive(Subcommand)]
enum CallMethod {
    /// Unary: Greeter.sayHello.
    SayHello {
        #[arg(long, default_value = "World")]
        name: String,
    },
    /// Server-stream: Greeter.lotsOfReplies.
    LotsOfReplies {
        #[arg(long, default_value = "World")]
        name: String,
    },
    /// Client-stream: Greeter.sumGreetings.
    SumGreetings {
        #[arg(long, value_delimiter = ',', default_value = "A,B,C")]
        names: Vec<String>,
    },
    /// Duplex-stream: Greeter.echoGreetings.
    EchoGreetings {
        #[arg(long, value_delimiter = ',', default_value = "A,B,C")]
        names: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse() {
        Cli::Serve(config) => run_server(config).await,
        Cli::Call(args) => run_call(args).await,
    }
}

async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    init_tracing(&config.log_level, config.log_json);

    let mut registry = MethodRegistry::new();
    greeter::register(&mut registry)?;

    let router_config = RouterConfig {
        cors: config.cors_mode(),
        max_receive_size: config.max_receive_size,
        max_send_size: config.max_send_size,
        max_retry_attempts: config.max_retry_attempts,
        discovery_enabled: config.discovery,
        transmit_internal_errors: config.transmit_internal_errors,
        sanitizer: config
            .sanitize_json
            .then(|| std::sync::Arc::new(DefaultObjectSanitizer) as std::sync::Arc<_>),
    };
    let router = std::sync::Arc::new(ServerRouter::new(router_config, registry));

    let addr: SocketAddr = config.listen_addr.parse()?;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    info!(%addr, "starting tempo-demo Greeter server");
    router.serve(addr, shutdown_rx).await
}

async fn run_call(args: CallArgs) -> anyhow::Result<()> {
    init_tracing(&args.channel.log_level, args.channel.log_json);

    let mut channel_config = ClientChannelConfig::new(args.channel.target.clone());
    channel_config.max_receive_size = args.channel.max_receive_size;
    channel_config.unsafe_allow_insecure = args.channel.unsafe_allow_insecure;
    let channel = ClientChannel::new(channel_config)?;

    let deadline = args.channel.deadline_ms.map(|ms| Deadline::from_duration(Duration::from_millis(ms)));
    let retry = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1))
        .retryable([StatusCode::Unavailable]);

    match args.method {
        CallMethod::SayHello { name } => {
            let (resp, _ctx) = channel
                .unary(&greeter::SAY_HELLO, HelloRequest { name }, deadline, Some(&retry), None)
                .await
                .map_err(print_err)?;
            println!("{}", resp.service_message);
        }
        CallMethod::LotsOfReplies { name } => {
            let (mut stream, _ctx) = channel
                .server_stream(&greeter::LOTS_OF_REPLIES, HelloRequest { name }, deadline, Some(&retry), None)
                .await
                .map_err(print_err)?;
            while let Some(item) = stream.next().await {
                println!("{}", item.map_err(print_err)?.service_message);
            }
        }
        CallMethod::SumGreetings { names } => {
            let reqs: BoxStream<Result<HelloRequest, TempoError>> = Box::pin(stream::iter(
                names.into_iter().map(|name| Ok(HelloRequest { name })),
            ));
            let (resp, _ctx) = channel
                .client_stream(&greeter::SUM_GREETINGS, reqs, deadline, None)
                .await
                .map_err(print_err)?;
            println!("{}", resp.service_message);
        }
        CallMethod::EchoGreetings { names } => {
            let reqs: BoxStream<Result<HelloRequest, TempoError>> = Box::pin(stream::iter(
                names.into_iter().map(|name| Ok(HelloRequest { name })),
            ));
            let (mut stream, _ctx) = channel
                .duplex_stream(&greeter::ECHO_GREETINGS, reqs, deadline, None)
                .await
                .map_err(print_err)?;
            while let Some(item) = stream.next().await {
                println!("{}", item.map_err(print_err)?.service_message);
            }
        }
    }
    Ok(())
}

fn print_err(e: TempoError) -> anyhow::Error {
    anyhow::anyhow!("{}: {}", e.status, e.message)
}
