//! AMQP 0-9-1 transport backed by `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, ConnectionProperties,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
};
use tokio::sync::{broadcast, mpsc};

use super::{Channel, ChannelEvent, Connection, Consumer, Delivery, QueueFlags, Transport};
use crate::{ConnectionConfig, Error, ErrorKind, MsgMeta, Payload, Result};

const EVENT_CAPACITY: usize = 16;
const REPLY_SUCCESS: u16 = 200;

fn amqp_error(kind: ErrorKind, err: lapin::Error) -> Error {
    Error::new(kind, err.to_string())
}

fn uri(config: &ConnectionConfig) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.username.clone(),
                password: config.password.clone(),
            },
            host: config.hostname.clone(),
            port: config.port,
        },
        vhost: config.vhost.clone(),
        query: AMQPQueryString {
            frame_max: (config.frame_max > 0).then_some(config.frame_max),
            heartbeat: u16::try_from(config.heartbeat.as_secs()).ok(),
            ..Default::default()
        },
    }
}

/// Connects to an AMQP broker such as RabbitMQ.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpTransport;

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
        let properties = ConnectionProperties {
            locale: config.locale.clone(),
            ..Default::default()
        };
        let connection = lapin::Connection::connect_uri(uri(config), properties)
            .await
            .map_err(|e| amqp_error(ErrorKind::ConnectFailed, e))?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let sender = events.clone();
        connection.on_error(move |err| {
            let _ = sender.send(ChannelEvent::Error(amqp_error(ErrorKind::ChannelClosed, err)));
            let _ = sender.send(ChannelEvent::Closed);
        });
        Ok(Arc::new(AmqpConnection { connection, events }))
    }
}

struct AmqpConnection {
    connection: lapin::Connection,
    events: broadcast::Sender<ChannelEvent>,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| amqp_error(ErrorKind::CreateChannelFailed, e))?;

        let sender = self.events.clone();
        channel.on_error(move |err| {
            let _ = sender.send(ChannelEvent::Error(amqp_error(ErrorKind::ChannelClosed, err)));
        });
        Ok(Arc::new(AmqpChannel {
            channel,
            events: self.events.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        let result = self
            .connection
            .close(REPLY_SUCCESS, "bye")
            .await
            .map_err(|e| amqp_error(ErrorKind::ChannelClosed, e));
        let _ = self.events.send(ChannelEvent::Closed);
        result
    }
}

struct AmqpChannel {
    channel: lapin::Channel,
    events: broadcast::Sender<ChannelEvent>,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| amqp_error(ErrorKind::PrefetchFailed, e))
    }

    async fn assert_queue(&self, name: &str, flags: QueueFlags) -> Result<()> {
        let options = QueueDeclareOptions {
            durable: flags.contains(QueueFlags::Durable),
            exclusive: flags.contains(QueueFlags::Exclusive),
            auto_delete: flags.contains(QueueFlags::AutoDelete),
            ..Default::default()
        };
        self.channel
            .queue_declare(name, options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|e| amqp_error(ErrorKind::AssertQueueFailed, e))
    }

    async fn consume(&self, queue: &str, no_ack: bool) -> Result<Consumer> {
        let options = BasicConsumeOptions {
            no_ack,
            ..Default::default()
        };
        let mut stream = self
            .channel
            .basic_consume(queue, "", options, FieldTable::default())
            .await
            .map_err(|e| amqp_error(ErrorKind::ConsumeFailed, e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let delivery = match item {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        tracing::error!("consumer stream failed: {err}");
                        break;
                    }
                };
                let properties = &delivery.properties;
                let meta = MsgMeta {
                    correlation_id: properties.correlation_id().as_ref().map(|s| s.to_string()),
                    reply_to: properties.reply_to().as_ref().map(|s| s.to_string()),
                };
                let delivery = Delivery {
                    delivery_tag: delivery.delivery_tag,
                    redelivered: delivery.redelivered,
                    meta,
                    payload: Payload::from(delivery.data),
                };
                if tx.send(delivery).is_err() {
                    break;
                }
            }
        });
        Ok(Consumer::new(rx))
    }

    async fn send_to_queue(
        &self,
        destination: &str,
        payload: Payload,
        meta: &MsgMeta,
    ) -> Result<()> {
        let mut properties = BasicProperties::default().with_content_type("application/json".into());
        if let Some(correlation_id) = &meta.correlation_id {
            properties = properties.with_correlation_id(correlation_id.as_str().into());
        }
        if let Some(reply_to) = &meta.reply_to {
            properties = properties.with_reply_to(reply_to.as_str().into());
        }
        self.channel
            .basic_publish(
                "",
                destination,
                BasicPublishOptions::default(),
                payload.as_slice(),
                properties,
            )
            .await
            .map(|_| ())
            .map_err(|e| amqp_error(ErrorKind::PublishFailed, e))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| amqp_error(ErrorKind::AckFailed, e))
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}
