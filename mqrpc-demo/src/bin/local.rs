//! Server and client wired through an in-process broker.
use clap::Parser;
use mqrpc::{Client, ClientConfig, Server, ServerConfig, transport::memory::MemoryBroker};
use mqrpc_demo::{DEFAULT_QUEUE, bind_demo_methods, stress_test};
use std::{sync::Arc, time::Duration};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Request value.
    #[arg(short, long, default_value = "alice")]
    pub value: String,

    /// Call timeout in seconds.
    #[arg(long, default_value_t = 5)]
    pub timeout: u64,

    /// Enable stress testing.
    #[arg(long, default_value_t = false)]
    pub stress: bool,

    /// Stress testing duration.
    #[arg(long, default_value = "60")]
    pub secs: u64,

    /// The number of coroutines.
    #[arg(long, default_value = "32")]
    pub coroutines: usize,

    /// Requests handled concurrently by the server.
    #[arg(long, default_value_t = 64)]
    pub prefetch: u16,
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> mqrpc::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let broker = Arc::new(MemoryBroker::new());

    let server = Server::new(
        ServerConfig {
            queue: Some(DEFAULT_QUEUE.to_string()),
            prefetch: args.prefetch,
            ..Default::default()
        },
        broker.clone(),
    );
    bind_demo_methods(&server)?;
    server.run().await?;
    tracing::info!("serving {:?} on {}", server.method_names(), server.queue());

    let client = Arc::new(Client::new(
        ClientConfig {
            queue: Some(DEFAULT_QUEUE.to_string()),
            timeout: Duration::from_secs(args.timeout),
            ..Default::default()
        },
        broker,
    ));
    client.run().await?;

    if args.stress {
        stress_test(client.clone(), args.value.clone(), args.secs, args.coroutines).await;
    } else {
        let rsp = client.call("echo", &args.value)?.await;
        tracing::info!("echo rsp: {:?}", rsp);

        let rsp = client.call("greet", &args.value)?.await;
        tracing::info!("greet rsp: {:?}", rsp);

        for n in [5, 6, 90] {
            let rsp = client.call("fibonacci", n)?.await;
            tracing::info!("fibonacci({n}) rsp: {:?}", rsp);
        }
        let rsp = client.call("fibonacci", &args.value)?.await;
        tracing::info!("fibonacci({:?}) rsp: {:?}", args.value, rsp);
    }

    client.stop().await?;
    server.stop().await
}
