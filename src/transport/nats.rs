//! NATS JetStream transport
//!
//! Maps the bus contract onto JetStream: one stream over the `events.>`
//! subject space, durable pull consumers keyed by durable name (the
//! shared-subscription redelivery group), explicit ack/nak, and connection
//! events forwarded to the bridge's failure signal.

use crate::config::BusConfig;
use crate::error::{EventError, Result};
use crate::transport::{Delivery, Transport, TransportConnection, TransportConsumer, TransportSender};
use async_nats::jetstream;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

/// NATS JetStream transport factory
#[derive(Default)]
pub struct NatsTransport;

impl NatsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn connect(&self, config: &BusConfig) -> Result<Box<dyn TransportConnection>> {
        let (failure_tx, _) = broadcast::channel(16);

        let callback_tx = failure_tx.clone();
        let mut opts = async_nats::ConnectOptions::new()
            .connection_timeout(Duration::from_secs(10))
            .event_callback(move |event| {
                let tx = callback_tx.clone();
                async move {
                    match event {
                        async_nats::Event::Disconnected | async_nats::Event::Closed => {
                            let _ = tx.send(format!("{}", event));
                        }
                        other => {
                            tracing::debug!(event = %other, "NATS connection event");
                        }
                    }
                }
            });

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            opts = opts.user_and_password(username.clone(), password.clone());
        }

        let client = opts
            .connect(&config.url)
            .await
            .map_err(|e| EventError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        let stream = jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.stream_name.clone(),
                subjects: vec!["events.>".to_string()],
                retention: jetstream::stream::RetentionPolicy::Limits,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                EventError::Connection(format!(
                    "Failed to create/get stream '{}': {}",
                    config.stream_name, e
                ))
            })?;

        Ok(Box::new(NatsConnection {
            client,
            jetstream,
            stream: Mutex::new(stream),
            failure_tx,
        }))
    }

    fn name(&self) -> &str {
        "nats"
    }
}

/// One live NATS connection plus its JetStream context
pub struct NatsConnection {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    /// Mutex because consumer management needs `&mut` on the stream handle
    stream: Mutex<jetstream::stream::Stream>,
    failure_tx: broadcast::Sender<String>,
}

#[async_trait]
impl TransportConnection for NatsConnection {
    async fn create_sender(&self, address: &str) -> Result<Box<dyn TransportSender>> {
        Ok(Box::new(NatsSender {
            client: self.client.clone(),
            jetstream: self.jetstream.clone(),
            subject: address.to_string(),
        }))
    }

    async fn create_consumer(
        &self,
        address: &str,
        durable_name: &str,
    ) -> Result<Box<dyn TransportConsumer>> {
        let consumer = self
            .stream
            .lock()
            .await
            .get_or_create_consumer(
                durable_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    filter_subject: address.to_string(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| EventError::Subscribe {
                address: address.to_string(),
                reason: format!("Failed to create durable consumer '{}': {}", durable_name, e),
            })?;

        let messages = consumer.messages().await.map_err(|e| EventError::Subscribe {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        tracing::info!(
            consumer = durable_name,
            filter = address,
            "Durable consumer session created"
        );

        Ok(Box::new(NatsConsumer { messages }))
    }

    fn failure_signal(&self) -> broadcast::Receiver<String> {
        self.failure_tx.subscribe()
    }

    async fn close(&self) {
        if let Err(e) = self.client.flush().await {
            tracing::warn!(error = %e, "Flush on connection close failed");
        }
        // the client itself closes once the last clone is dropped
    }
}

/// Sender bound to one JetStream subject
pub struct NatsSender {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    subject: String,
}

#[async_trait]
impl TransportSender for NatsSender {
    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.jetstream
            .publish(self.subject.clone(), payload.to_vec().into())
            .await
            .map_err(|e| EventError::Publish {
                address: self.subject.clone(),
                reason: e.to_string(),
            })?
            .await
            .map_err(|e| EventError::Publish {
                address: self.subject.clone(),
                reason: format!("ack failed: {}", e),
            })?;

        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    async fn close(&mut self) {}
}

/// One pull-consumer session on a durable group
pub struct NatsConsumer {
    messages: jetstream::consumer::pull::Stream,
}

#[async_trait]
impl TransportConsumer for NatsConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        match self.messages.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(EventError::Connection(format!(
                "Consumer stream error: {}",
                e
            ))),
            Some(Ok(message)) => {
                let num_delivered = message
                    .info()
                    .map(|info| info.delivered as u64)
                    .unwrap_or(1);
                let payload = message.payload.to_vec();

                let message = Arc::new(message);
                let ack_message = message.clone();
                let nak_message = message;

                Ok(Some(Delivery::new(
                    payload,
                    num_delivered,
                    move || {
                        Box::pin(async move {
                            ack_message
                                .ack()
                                .await
                                .map_err(|e| EventError::Ack(e.to_string()))
                        })
                    },
                    move || {
                        Box::pin(async move {
                            nak_message
                                .ack_with(jetstream::AckKind::Nak(None))
                                .await
                                .map_err(|e| EventError::Ack(e.to_string()))
                        })
                    },
                )))
            }
        }
    }
}
