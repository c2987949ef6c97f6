use clap::Parser;
use mqrpc::{Server, ServerConfig, transport::amqp::AmqpTransport};
use mqrpc_demo::{BrokerArgs, bind_demo_methods};
use std::{sync::Arc, time::Duration};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Requests handled concurrently.
    #[arg(long, default_value_t = 3)]
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
    let config = ServerConfig {
        connection: args.broker.connection(),
        queue: Some(args.broker.queue.clone()),
        prefetch: args.prefetch,
        reconnect: true,
        reconnect_timeout: Duration::from_secs(args.broker.reconnect_secs),
        ..Default::default()
    };
    let server = Server::new(config, Arc::new(AmqpTransport));
    bind_demo_methods(&server)?;
    if let Err(err) = server.run().await {
        tracing::warn!("first connection attempt failed: {err}");
    }
    tracing::info!("serving {:?} on {}...", server.method_names(), server.queue());

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {err}");
    }
    server.stop().await
}
