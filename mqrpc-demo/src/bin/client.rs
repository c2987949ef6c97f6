use clap::Parser;
use mqrpc::{Client, ClientConfig, transport::amqp::AmqpTransport};
use mqrpc_demo::{BrokerArgs, stress_test};
use std::{sync::Arc, time::Duration};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Call timeout in seconds, zero waits forever.
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
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> mqrpc::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let config = ClientConfig {
        connection: args.broker.connection(),
        queue: Some(args.broker.queue.clone()),
        reconnect: true,
        reconnect_timeout: Duration::from_secs(args.broker.reconnect_secs),
        timeout: Duration::from_secs(args.timeout),
        ..Default::default()
    };
    let client = Arc::new(Client::new(config, Arc::new(AmqpTransport)));
    if let Err(err) = client.run().await {
        tracing::warn!("first connection attempt failed: {err}");
    }

    if args.stress {
        stress_test(client.clone(), "stress".to_string(), args.secs, args.coroutines).await;
        return client.stop().await;
    }

    // one echo per second; calls issued during an outage are sent on reconnect.
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut num = 0u64;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }
        num += 1;
        tracing::info!("send: {num}");
        let sent = client.call_with("echo", num, move |outcome| match outcome {
            Ok(rsp) => tracing::info!("received: {rsp}"),
            Err(err) => tracing::warn!("echo {num} failed: {err}"),
        });
        if let Err(err) = sent {
            tracing::error!("echo {num} not sent: {err}");
        }
    }
    client.stop().await
}
