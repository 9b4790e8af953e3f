//! Ingestion listener.
//!
//! Connects a PULL socket to the broker's PUSH endpoint. The broker
//! round-robins messages across every connected listener, so each
//! notification reaches exactly one member of the consumer group. There is
//! no acknowledgement: a message that fails to decode is logged and dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use archivist_protocol::{decode_frames, Notification};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use zeromq::{PullSocket, Socket, SocketRecv, ZmqError};

use crate::metrics::ServiceMetrics;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Listener is already running")]
    AlreadyRunning,

    #[error("Listener is not running")]
    NotRunning,

    #[error("Failed to connect to broker {url}: {source}")]
    Connect { url: String, source: ZmqError },

    #[error("Timed out after {timeout:?} connecting to broker {url}")]
    ConnectTimeout { url: String, timeout: Duration },

    #[error("Listener task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Receives every decoded notification, once per message.
pub trait NotificationHandler: Send + Sync + 'static {
    fn handle(&self, notification: Notification) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub broker_url: String,
    pub subject: String,
    pub queue_group: String,
    /// The socket retries until the broker endpoint accepts; give up after this.
    pub connect_timeout: Duration,
}

impl From<&crate::config::BrokerConfig> for ListenerConfig {
    fn from(broker: &crate::config::BrokerConfig) -> Self {
        Self {
            broker_url: broker.url.clone(),
            subject: broker.subject.clone(),
            queue_group: broker.queue_group.clone(),
            connect_timeout: Duration::from_secs(broker.connect_timeout_secs),
        }
    }
}

struct Running {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<PullSocket>,
}

pub struct Listener {
    config: ListenerConfig,
    metrics: Arc<ServiceMetrics>,
    running: Option<Running>,
}

impl Listener {
    pub fn new(config: ListenerConfig, metrics: Arc<ServiceMetrics>) -> Self {
        Self {
            config,
            metrics,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Connect to the broker and start dispatching to `handler`.
    pub async fn start<H: NotificationHandler>(&mut self, handler: Arc<H>) -> Result<(), ListenerError> {
        if self.running.is_some() {
            return Err(ListenerError::AlreadyRunning);
        }

        let mut socket = PullSocket::new();
        let url = self.config.broker_url.clone();
        match tokio::time::timeout(self.config.connect_timeout, socket.connect(&url)).await {
            Ok(Ok(())) => {}
            Ok(Err(source)) => return Err(ListenerError::Connect { url, source }),
            Err(_) => {
                return Err(ListenerError::ConnectTimeout {
                    url,
                    timeout: self.config.connect_timeout,
                })
            }
        }

        info!(
            broker = %self.config.broker_url,
            subject = %self.config.subject,
            queue_group = %self.config.queue_group,
            "Listener connected"
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(receive_loop(
            socket,
            self.config.clone(),
            handler,
            Arc::clone(&self.metrics),
            shutdown_rx,
        ));
        self.running = Some(Running {
            shutdown_tx,
            join_handle,
        });
        Ok(())
    }

    /// Stop receiving, wait for in-flight handlers and close the socket.
    pub async fn stop(&mut self) -> Result<(), ListenerError> {
        let running = self.running.take().ok_or(ListenerError::NotRunning)?;
        let _ = running.shutdown_tx.send(());
        let socket = running.join_handle.await?;

        let errors = socket.close().await;
        if !errors.is_empty() {
            warn!(count = errors.len(), "Errors while closing listener socket: {:?}", errors);
        }
        info!(queue_group = %self.config.queue_group, "Listener stopped");
        Ok(())
    }
}

/// Main receive loop. Returns the socket so the caller can close it.
async fn receive_loop<H: NotificationHandler>(
    mut socket: PullSocket,
    config: ListenerConfig,
    handler: Arc<H>,
    metrics: Arc<ServiceMetrics>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> PullSocket {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_rx => {
                debug!(in_flight = in_flight.len(), "Listener shutdown requested");
                break;
            }

            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!("Notification handler task failed: {}", e);
                }
            }

            received = socket.recv() => {
                let multipart = match received {
                    Ok(multipart) => multipart,
                    Err(e) => {
                        error!("ZMQ recv error: {}", e);
                        break;
                    }
                };
                metrics.inc_messages_received();

                let frames: Vec<Vec<u8>> = multipart
                    .into_vec()
                    .into_iter()
                    .map(|b| b.to_vec())
                    .collect();

                let notification = match decode_frames(&frames) {
                    Ok((subject, _)) if subject != config.subject => {
                        warn!(subject = %subject, expected = %config.subject, "Dropping message for other subject");
                        continue;
                    }
                    Ok((_, notification)) => notification,
                    Err(e) => {
                        metrics.inc_decode_errors();
                        warn!(error = %e, "Dropping malformed notification");
                        continue;
                    }
                };

                debug!(id = %notification.id, "Notification received");
                let handler = Arc::clone(&handler);
                in_flight.spawn(async move { handler.handle(notification).await });
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!("Notification handler task failed: {}", e);
        }
    }
    socket
}
