use std::{sync::Arc, time::Duration};

use tokio::time::{Instant, MissedTickBehavior};

use crate::{TaskSupervisor, Waiter};

/// Starts the periodic timeout sweep over `waiter`.
///
/// Calls older than `timeout` are failed with a timeout error every
/// `interval`. The sweep runs until `supervisor` stops.
pub(crate) fn start(
    supervisor: &TaskSupervisor,
    waiter: Arc<Waiter>,
    timeout: Duration,
    interval: Duration,
) {
    supervisor.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expired = waiter.expire(timeout, Instant::now());
            if expired > 0 {
                tracing::warn!("{expired} call(s) timed out after {timeout:?}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RpcError;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_expires_and_stops() {
        let waiter = Arc::new(Waiter::default());
        let supervisor = TaskSupervisor::create();
        start(
            &supervisor,
            waiter.clone(),
            Duration::from_secs(2),
            Duration::from_secs(1),
        );

        let started = Instant::now();
        let reply = waiter.register("id".into(), "longTime", serde_json::Value::Null);
        assert_eq!(
            reply.await,
            Err(RpcError::Timeout {
                method: "longTime".into()
            })
        );
        assert!(started.elapsed() <= Duration::from_secs(3));

        supervisor.stop();
        supervisor.all_stopped().await;

        let _reply = waiter.register("late".into(), "longTime", serde_json::Value::Null);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(waiter.contains("late"));
    }
}
