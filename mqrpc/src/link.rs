//! Connection lifecycle shared by [`Client`](crate::Client) and
//! [`Server`](crate::Server).
//!
//! A [`Link`] owns the transport session of one peer and walks it through
//! `Disconnected -> Connecting -> Connected`. Losing the channel while the
//! peer is running either schedules a single reconnect attempt or stops the
//! peer, depending on configuration. All outbound messages go through the
//! link's [`Outbox`], which a background flusher drains while connected.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};

use crate::{
    Channel, ChannelEvent, Connection, ConnectionConfig, Error, ErrorKind, Message, Result,
    TaskSupervisor, Transport, outbox::Outbox,
};

const FLUSH_BATCH: usize = 64;
const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Peer-specific part of a session: queue declaration and consumption.
#[async_trait]
pub(crate) trait Endpoint: Send + Sync + 'static {
    /// Called on every freshly opened channel. Consumer loops must be spawned
    /// on `session` so they end with the session.
    async fn attach(
        self: Arc<Self>,
        channel: Arc<dyn Channel>,
        session: &TaskSupervisor,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub(crate) struct LinkSettings {
    /// Used to tell peers apart in logs.
    pub name: String,
    pub connection: ConnectionConfig,
    pub prefetch: u16,
    pub reconnect: bool,
    pub reconnect_timeout: Duration,
    pub buffer_capacity: usize,
}

struct Session {
    epoch: u64,
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
    tasks: TaskSupervisor,
}

#[derive(Default)]
struct Shared {
    /// Set by `run`, cleared by `stop`.
    activated: bool,
    epoch: u64,
    endpoint: Option<Weak<dyn Endpoint>>,
    session: Option<Session>,
    retry: Option<JoinHandle<()>>,
    /// Tasks living as long as the peer runs (the flusher).
    background: Option<TaskSupervisor>,
}

pub(crate) struct Link {
    settings: LinkSettings,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    shared: Mutex<Shared>,
    connecting: tokio::sync::Mutex<()>,
    outbox: Outbox,
}

impl Link {
    pub fn new(settings: LinkSettings, transport: Arc<dyn Transport>) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            outbox: Outbox::new(settings.buffer_capacity),
            settings,
            transport,
            state,
            shared: Mutex::default(),
            connecting: tokio::sync::Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub async fn wait_for_state(&self, state: ConnectionState) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|current| *current == state).await;
    }

    pub fn is_activated(&self) -> bool {
        self.shared.lock().activated
    }

    pub fn buffered(&self) -> usize {
        self.outbox.len()
    }

    /// Activates the peer and runs the connect sequence.
    ///
    /// # Errors
    ///
    /// Returns the transport failure of the first attempt. A reconnect is
    /// scheduled or the peer is stopped before returning, per configuration.
    pub async fn run(self: &Arc<Self>, endpoint: Weak<dyn Endpoint>) -> Result<()> {
        {
            let mut shared = self.shared.lock();
            if shared.activated {
                tracing::debug!("{} is already running", self.settings.name);
                return Ok(());
            }
            shared.activated = true;
            shared.endpoint = Some(endpoint);
            let background = TaskSupervisor::create();
            background.spawn(Self::flush_loop(Arc::downgrade(self), self.state.subscribe()));
            shared.background = Some(background);
        }
        self.connect().await
    }

    /// Queues `msg` for publishing.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::NotRunning`] when the peer is not running and
    /// with [`ErrorKind::BufferFull`] when the outbox is at capacity.
    pub fn publish(&self, msg: Message) -> Result<()> {
        if !self.is_activated() {
            return Err(Error::new(
                ErrorKind::NotRunning,
                format!("{} is not running", self.settings.name),
            ));
        }
        self.outbox.push(msg)
    }

    /// Deactivates the peer and closes the transport session. Pending
    /// retries are cancelled and buffered messages dropped.
    pub async fn stop(&self) {
        let session = self.teardown();
        if let Some(session) = session {
            if let Err(err) = session.connection.close().await {
                tracing::warn!("{} failed to close its connection: {err}", self.settings.name);
            }
            tracing::info!("{} stopped", self.settings.name);
        }
    }

    /// Synchronous variant of [`stop`](Self::stop) for drop paths. The
    /// connection is closed in the background when a runtime is available.
    pub fn detach(&self) {
        if let Some(session) = self.teardown() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = session.connection.close().await;
                });
            }
        }
    }

    fn teardown(&self) -> Option<Session> {
        let (session, retry, background) = {
            let mut shared = self.shared.lock();
            shared.activated = false;
            shared.endpoint = None;
            (
                shared.session.take(),
                shared.retry.take(),
                shared.background.take(),
            )
        };
        if let Some(retry) = retry {
            retry.abort();
        }
        if let Some(background) = background {
            background.stop();
        }
        let dropped = self.outbox.clear();
        if dropped > 0 {
            tracing::warn!(
                "{} dropped {dropped} unpublished message(s)",
                self.settings.name
            );
        }
        self.state.send_replace(ConnectionState::Disconnected);
        if let Some(session) = &session {
            session.tasks.stop();
        }
        session
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        let _connecting = self.connecting.lock().await;
        let endpoint = {
            let shared = self.shared.lock();
            if !shared.activated {
                return Err(Error::new(
                    ErrorKind::NotRunning,
                    format!("{} is stopped", self.settings.name),
                ));
            }
            if shared.session.is_some() {
                return Ok(());
            }
            shared.endpoint.as_ref().and_then(Weak::upgrade)
        };
        let Some(endpoint) = endpoint else {
            return Err(Error::new(
                ErrorKind::NotRunning,
                format!("{} was dropped", self.settings.name),
            ));
        };

        self.state.send_replace(ConnectionState::Connecting);
        let config = &self.settings.connection;
        tracing::info!(
            "{} connecting to {}:{}{}",
            self.settings.name,
            config.hostname,
            config.port,
            config.vhost
        );
        match self.establish(endpoint).await {
            Ok(session) => self.install(session).await,
            Err(err) => {
                self.state.send_replace(ConnectionState::Disconnected);
                tracing::error!("{} failed to connect: {err}", self.settings.name);
                self.after_disconnect().await;
                Err(err)
            }
        }
    }

    async fn establish(&self, endpoint: Arc<dyn Endpoint>) -> Result<Session> {
        let connection = self.transport.connect(&self.settings.connection).await?;
        match self.open_channel(&connection, endpoint).await {
            Ok((channel, tasks)) => Ok(Session {
                epoch: 0,
                connection,
                channel,
                tasks,
            }),
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    tracing::debug!("closing a half-open connection failed: {close_err}");
                }
                Err(err)
            }
        }
    }

    async fn open_channel(
        &self,
        connection: &Arc<dyn Connection>,
        endpoint: Arc<dyn Endpoint>,
    ) -> Result<(Arc<dyn Channel>, TaskSupervisor)> {
        let channel = connection.create_channel().await?;
        channel.prefetch(self.settings.prefetch).await?;
        let tasks = TaskSupervisor::create();
        endpoint.attach(channel.clone(), &tasks).await?;
        Ok((channel, tasks))
    }

    async fn install(self: &Arc<Self>, mut session: Session) -> Result<()> {
        let stale = {
            let mut shared = self.shared.lock();
            if shared.activated {
                shared.epoch += 1;
                session.epoch = shared.epoch;
                self.watch_channel(&session);
                self.state.send_replace(ConnectionState::Connected);
                shared.session = Some(session);
                None
            } else {
                Some(session)
            }
        };

        match stale {
            None => {
                tracing::info!("{} connected", self.settings.name);
                self.outbox.wake();
                Ok(())
            }
            Some(session) => {
                session.tasks.stop();
                let _ = session.connection.close().await;
                self.state.send_replace(ConnectionState::Disconnected);
                Err(Error::new(
                    ErrorKind::NotRunning,
                    format!("{} stopped while connecting", self.settings.name),
                ))
            }
        }
    }

    fn watch_channel(self: &Arc<Self>, session: &Session) {
        let link = Arc::downgrade(self);
        let epoch = session.epoch;
        let channel = session.channel.clone();
        let mut events = channel.events();
        let guard = session.tasks.start_async_task();
        tokio::spawn(async move {
            let lost = tokio::select! {
                () = guard.stopped() => false,
                () = wait_closed(channel.as_ref(), &mut events, &link) => true,
            };
            drop(guard);
            if lost && let Some(link) = link.upgrade() {
                link.on_session_lost(epoch).await;
            }
        });
    }

    async fn on_session_lost(self: Arc<Self>, epoch: u64) {
        let session = {
            let mut shared = self.shared.lock();
            if shared.session.as_ref().is_some_and(|s| s.epoch == epoch) {
                shared.session.take()
            } else {
                None
            }
        };
        let Some(session) = session else {
            return;
        };

        self.state.send_replace(ConnectionState::Disconnected);
        tracing::warn!("{} lost its connection", self.settings.name);
        session.tasks.stop();
        if let Err(err) = session.connection.close().await {
            tracing::debug!("closing a lost connection failed: {err}");
        }
        self.after_disconnect().await;
    }

    async fn after_disconnect(self: &Arc<Self>) {
        if !self.is_activated() {
            return;
        }
        if self.settings.reconnect {
            self.schedule_retry();
        } else {
            tracing::warn!("{} stops: reconnect is disabled", self.settings.name);
            self.stop().await;
        }
    }

    fn schedule_retry(self: &Arc<Self>) {
        let mut shared = self.shared.lock();
        if !shared.activated {
            return;
        }
        if shared.retry.as_ref().is_some_and(|retry| !retry.is_finished()) {
            tracing::debug!("{} already has a reconnect scheduled", self.settings.name);
            return;
        }
        let delay = self.settings.reconnect_timeout;
        tracing::info!("{} reconnects in {delay:?}", self.settings.name);
        shared.retry = Some(tokio::spawn(retry_after(Arc::downgrade(self), delay)));
    }

    fn channel(&self) -> Option<Arc<dyn Channel>> {
        let shared = self.shared.lock();
        shared.session.as_ref().map(|s| s.channel.clone())
    }

    async fn flush_loop(link: Weak<Self>, mut state: watch::Receiver<ConnectionState>) {
        loop {
            state.borrow_and_update();
            let Some(this) = link.upgrade() else {
                return;
            };
            let Some(channel) = this.channel() else {
                drop(this);
                if state.changed().await.is_err() {
                    return;
                }
                continue;
            };

            let batch = this.outbox.take(FLUSH_BATCH);
            if batch.is_empty() {
                tokio::select! {
                    () = this.outbox.notified() => {}
                    changed = state.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                continue;
            }

            if let Err(err) = this.flush(channel.as_ref(), batch).await {
                tracing::warn!("{} failed to publish: {err}", this.settings.name);
                drop(this);
                tokio::select! {
                    _ = state.changed() => {}
                    () = tokio::time::sleep(PUBLISH_RETRY_DELAY) => {}
                }
            }
        }
    }

    async fn flush(&self, channel: &dyn Channel, batch: Vec<Message>) -> Result<()> {
        let mut pending = batch.into_iter();
        while let Some(msg) = pending.next() {
            if let Err(err) = channel
                .send_to_queue(&msg.destination, msg.payload.clone(), &msg.meta)
                .await
            {
                let mut unsent = vec![msg];
                unsent.extend(pending);
                self.outbox.restore(unsent);
                return Err(err);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("name", &self.settings.name)
            .field("state", &self.state())
            .finish()
    }
}

async fn retry_after(link: Weak<Link>, delay: Duration) {
    tokio::time::sleep(delay).await;
    let Some(link) = link.upgrade() else {
        return;
    };
    link.shared.lock().retry = None;
    if let Err(err) = link.connect().await {
        tracing::warn!("{} reconnect failed: {err}", link.settings.name);
    }
}

async fn wait_closed(
    channel: &dyn Channel,
    events: &mut broadcast::Receiver<ChannelEvent>,
    link: &Weak<Link>,
) {
    while channel.is_open() {
        match events.recv().await {
            Ok(ChannelEvent::Closed) | Err(broadcast::error::RecvError::Closed) => return,
            Ok(ChannelEvent::Error(err)) => {
                tracing::error!("channel error: {err}");
                return;
            }
            Ok(ChannelEvent::Returned(delivery)) => {
                tracing::warn!("broker returned an unroutable message: {:?}", delivery.meta);
            }
            Ok(ChannelEvent::Drain) => {
                if let Some(link) = link.upgrade() {
                    link.outbox.wake();
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("missed {n} channel events");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Idle;

    #[async_trait]
    impl Endpoint for Idle {
        async fn attach(
            self: Arc<Self>,
            _channel: Arc<dyn Channel>,
            _session: &TaskSupervisor,
        ) -> Result<()> {
            Ok(())
        }
    }

    /// Counts connection attempts made against the broker.
    struct Counting {
        broker: MemoryBroker,
        attempts: AtomicUsize,
    }

    impl Counting {
        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for Counting {
        async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.broker.connect(config).await
        }
    }

    fn link(broker: &MemoryBroker) -> (Arc<Link>, Arc<Counting>) {
        let transport = Arc::new(Counting {
            broker: broker.clone(),
            attempts: AtomicUsize::new(0),
        });
        let settings = LinkSettings {
            name: "test link".into(),
            connection: ConnectionConfig::default(),
            prefetch: 1,
            reconnect: true,
            reconnect_timeout: Duration::from_secs(5),
            buffer_capacity: 16,
        };
        (Link::new(settings, transport.clone()), transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_pending_retry() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let (link, transport) = link(&broker);
        let endpoint: Arc<dyn Endpoint> = Arc::new(Idle);

        assert!(link.run(Arc::downgrade(&endpoint)).await.is_err());
        assert_eq!(transport.attempts(), 1);
        link.schedule_retry();
        link.schedule_retry();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(transport.attempts(), 2);

        broker.set_available(true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.attempts(), 3);
        assert_eq!(link.state(), ConnectionState::Connected);
        assert_eq!(broker.connection_count(), 1);

        // the watcher and a late report of the same session schedule one retry.
        let epoch = link.shared.lock().epoch;
        broker.sever_connections();
        link.wait_for_state(ConnectionState::Disconnected).await;
        link.clone().on_session_lost(epoch).await;
        link.schedule_retry();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(transport.attempts(), 4);
        assert_eq!(link.state(), ConnectionState::Connected);
        assert_eq!(broker.connection_count(), 1);
        link.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_retry() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let (link, transport) = link(&broker);
        let endpoint: Arc<dyn Endpoint> = Arc::new(Idle);

        assert!(link.run(Arc::downgrade(&endpoint)).await.is_err());
        assert!(link.shared.lock().retry.is_some());

        link.stop().await;
        assert!(link.shared.lock().retry.is_none());
        link.schedule_retry();
        assert!(link.shared.lock().retry.is_none());

        broker.set_available(true);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(transport.attempts(), 1);
        assert_eq!(broker.connection_count(), 0);
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(!link.is_activated());
    }
}
