//! hello-world: a `Greeter` service and its client over the in-memory broker.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p pulsar-rpc-hello-world -- --name Ada --count 3
//! RUST_LOG=pulsar_rpc_core=debug cargo run -p pulsar-rpc-hello-world -- --duplicate-rate 2000
//! ```

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use pulsar_rpc::prelude::*;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hello-world")]
#[command(about = "Greeter service and client over an in-memory pub/sub broker")]
struct Args {
    /// Who to greet
    #[arg(long, default_value = "world")]
    name: String,

    /// Topic namespace shared by client and server
    #[arg(long, default_value = "demo")]
    namespace: String,

    /// Greetings requested from the streaming method
    #[arg(long, default_value_t = 3)]
    count: u32,

    /// Per-call deadline in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Broker duplicate rate in basis points (0-10000)
    #[arg(long, default_value_t = 0)]
    duplicate_rate: u32,

    /// Broker reorder rate in basis points (0-10000)
    #[arg(long, default_value_t = 0)]
    reorder_rate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HelloRequest {
    name: String,
    count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HelloReply {
    message: String,
}

fn say_hello() -> MethodDescriptor<HelloRequest, HelloReply> {
    MethodDescriptor::new(
        "Greeter",
        "SayHello",
        MethodKind::Unary,
        codec::postcard::<HelloRequest>(),
        codec::postcard::<HelloReply>(),
    )
}

fn say_hello_many() -> MethodDescriptor<HelloRequest, HelloReply> {
    MethodDescriptor::new(
        "Greeter",
        "SayHelloMany",
        MethodKind::ServerStreaming,
        codec::postcard::<HelloRequest>(),
        codec::postcard::<HelloReply>(),
    )
}

fn greeter() -> Result<ServiceTable, pulsar_rpc::DispatchError> {
    ServiceTable::new()
        .with(
            &say_hello(),
            Handler::unary(|ctx, request: HelloRequest| async move {
                tracing::info!(correlation_id = %ctx.correlation_id(), name = %request.name, "SayHello");
                Ok(HelloReply {
                    message: format!("Hello, {}!", request.name),
                })
            }),
        )?
        .with(
            &say_hello_many(),
            Handler::server_streaming(
                |_ctx, request: HelloRequest, responses: ResponseSink<HelloReply>| async move {
                    for i in 1..=request.count {
                        responses
                            .send(&HelloReply {
                                message: format!("Hello #{i}, {}!", request.name),
                            })
                            .await?;
                    }
                    Ok(())
                },
            ),
        )
}

fn main() -> ExitCode {
    // Output goes to stderr so stdout only carries the greetings.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to create runtime");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "demo failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let broker = MemBroker::with_faults(
        FaultConfig::default()
            .with_duplicate_rate(args.duplicate_rate)
            .with_reorder(args.reorder_rate, Duration::from_millis(20)),
    );

    let dispatcher = Dispatcher::new(
        broker.clone(),
        greeter()?,
        DispatcherConfig::default().with_namespace(&args.namespace),
    );
    let serving = dispatcher.serve(&broker).await?;
    tracing::info!(namespace = %args.namespace, "Greeter serving");

    let channel = Channel::new(
        broker.clone(),
        broker.clone(),
        ChannelConfig::default().with_namespace(&args.namespace),
    );
    let options = || CallOptions::new().with_timeout(Duration::from_millis(args.timeout_ms));
    let request = HelloRequest {
        name: args.name.clone(),
        count: args.count,
    };

    let reply = unary(&channel, &say_hello(), &request, options()).await?;
    println!("{}", reply.message);

    let mut replies = server_streaming(&channel, &say_hello_many(), &request, options()).await?;
    while let Some(reply) = replies.message().await? {
        println!("{}", reply.message);
    }

    let client = channel.metrics();
    let server = dispatcher.metrics();
    tracing::info!(
        sent = client.envelopes_sent,
        received = client.envelopes_received,
        duplicates = client.duplicates,
        served = server.calls_completed,
        broker = ?broker.stats(),
        "done"
    );

    channel.shutdown().await;
    dispatcher.shutdown();
    serving.join().await;
    Ok(())
}
