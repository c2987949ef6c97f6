use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use mqrpc::{Client, ConnectionConfig, HandlerError, Result, Server};
use serde_json::Value;

pub const DEFAULT_QUEUE: &str = "server_bench";

/// Broker options shared by the demo binaries.
#[derive(clap::Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Broker host.
    #[arg(long, default_value = "localhost")]
    pub hostname: String,

    /// Broker port.
    #[arg(long, default_value_t = 5672)]
    pub port: u16,

    #[arg(long, default_value = "guest")]
    pub username: String,

    #[arg(long, default_value = "guest")]
    pub password: String,

    #[arg(long, default_value = "/")]
    pub vhost: String,

    /// Request queue of the server.
    #[arg(long, default_value = DEFAULT_QUEUE)]
    pub queue: String,

    /// Seconds between reconnect attempts.
    #[arg(long, default_value_t = 3)]
    pub reconnect_secs: u64,
}

impl BrokerArgs {
    #[must_use]
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            hostname: self.hostname.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            vhost: self.vhost.clone(),
            ..Default::default()
        }
    }
}

#[must_use]
pub fn fibonacci(n: u64) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        (a, b) = (b, a.wrapping_add(b));
    }
    a
}

/// Binds `echo`, `fibonacci` and `greet` on `server`.
///
/// # Errors
///
/// Fails if the parameter schema of `fibonacci` does not compile.
pub fn bind_demo_methods(server: &Server) -> Result<()> {
    server.bind("echo", |params: Value| async move { Ok(params) });
    server.bind("fibonacci", |n: u64| async move {
        if n > 93 {
            return Err(HandlerError::new(format!("fibonacci({n}) overflows u64")));
        }
        Ok(fibonacci(n))
    });
    server.bind_schema("fibonacci", &serde_json::json!({"type": "number"}))?;

    let greeted = Arc::new(AtomicU64::new(0));
    server.bind("greet", move |name: String| {
        let idx = greeted.fetch_add(1, Ordering::AcqRel);
        async move { Ok(format!("hello {name}({idx})!")) }
    });
    Ok(())
}

#[derive(Default)]
struct Counters {
    total: AtomicUsize,
    fails: AtomicUsize,
}

/// Calls `echo` from `coroutines` tasks for `secs` seconds, logging the
/// throughput every second.
pub async fn stress_test(client: Arc<Client>, value: String, secs: u64, coroutines: usize) {
    let counters = Arc::new(Counters::default());
    let start_time = Instant::now();
    let mut tasks = vec![];
    for _ in 0..coroutines {
        let client = client.clone();
        let value = value.clone();
        let counters = counters.clone();
        tasks.push(tokio::spawn(async move {
            while start_time.elapsed().as_secs() < secs {
                for _ in 0..256 {
                    let result = match client.call("echo", &value) {
                        Ok(reply) => reply.await.map_err(|e| e.to_string()),
                        Err(err) => Err(err.to_string()),
                    };
                    counters.total.fetch_add(1, Ordering::AcqRel);
                    if result.is_err() {
                        counters.fails.fetch_add(1, Ordering::AcqRel);
                    }
                }
            }
        }));
    }
    tokio::select! {
        _ = async {
            for task in tasks {
                if let Err(err) = task.await {
                    tracing::error!("stress task failed: {err}");
                }
            }
        } => {
        }
        _ = async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let total = counters.total.swap(0, Ordering::AcqRel);
                let fails = counters.fails.swap(0, Ordering::AcqRel);
                tracing::info!("QPS: {total}/s, fails: {fails}/s");
            }
        } => {
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibonacci() {
        assert_eq!(fibonacci(0), 0);
        assert_eq!(fibonacci(5), 5);
        assert_eq!(fibonacci(6), 8);
        assert_eq!(fibonacci(93), 12_200_160_415_121_876_738);
    }
}
