//! One browser tab listening for reload signals.
//!
//! # Lifecycle
//! `Created → Opened → Started → Terminated`
//!
//! - `open` hands over the upgraded websocket
//! - `start` runs until the client disconnects or `stop` is called
//! - `reload` queues a signal for the running notifier
//! - `close` shuts the socket once `start` has returned
//!
//! Two tasks run while started: a liveness reader that watches for the
//! client going away, and a notifier that writes `reload` frames.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use uuid::Uuid;

use crate::observability::metrics;

/// Text frame sent to every client on reload.
pub const RELOAD_MESSAGE: &str = "reload";

type Sink = SplitSink<WebSocket, Message>;

/// Observable lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Opened,
    Started,
    Terminated,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("({id}) the connection is not started")]
    NotStarted { id: Uuid },

    #[error("({id}) the connection has already terminated")]
    Terminated { id: Uuid },

    #[error("({id}) cannot {operation} a connection that is {state:?}")]
    InvalidState {
        id: Uuid,
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("({id}) the connection is already closed")]
    AlreadyClosed { id: Uuid },

    #[error("({id}) reload was not accepted within {timeout:?}")]
    DeliveryTimeout { id: Uuid, timeout: Duration },

    #[error("({id}) the reload queue is closed")]
    QueueClosed { id: Uuid },

    #[error("({id}) something went wrong while the connection was active: {source}")]
    Failed {
        id: Uuid,
        #[source]
        source: JoinError,
    },

    #[error("({id}) failed to close the connection: {source}")]
    Close {
        id: Uuid,
        #[source]
        source: axum::Error,
    },
}

enum Lifecycle {
    Created,
    Opened(WebSocket),
    Started {
        reload: mpsc::Sender<()>,
        stop: Arc<watch::Sender<bool>>,
    },
    // The write half comes back from the notifier so `close` can send a close frame
    Terminated { sink: Option<Sink> },
}

impl Lifecycle {
    fn state(&self) -> ConnectionState {
        match self {
            Lifecycle::Created => ConnectionState::Created,
            Lifecycle::Opened(_) => ConnectionState::Opened,
            Lifecycle::Started { .. } => ConnectionState::Started,
            Lifecycle::Terminated { .. } => ConnectionState::Terminated,
        }
    }
}

/// A registered websocket client.
pub struct Connection {
    id: Uuid,
    queue_depth: usize,
    lifecycle: Mutex<Lifecycle>,
}

impl Connection {
    /// Create a connection with a fresh id and a reload queue of `queue_depth`.
    pub fn new(queue_depth: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue_depth: queue_depth.max(1),
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state()
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn invalid(&self, operation: &'static str, state: ConnectionState) -> ConnectionError {
        ConnectionError::InvalidState {
            id: self.id,
            operation,
            state,
        }
    }

    /// Attach the upgraded socket.
    pub fn open(&self, socket: WebSocket) -> Result<(), ConnectionError> {
        let mut lifecycle = self.lock();
        let state = lifecycle.state();
        if state != ConnectionState::Created {
            return Err(self.invalid("open", state));
        }
        *lifecycle = Lifecycle::Opened(socket);
        Ok(())
    }

    /// Run the connection until the client disconnects or `stop` is called.
    ///
    /// A panic in the liveness reader or the notifier is reported as
    /// [`ConnectionError::Failed`].
    pub async fn start(&self) -> Result<(), ConnectionError> {
        self.run(None).await
    }

    /// Like [`Connection::start`], but also returns once `halt` is raised,
    /// even if it was raised before the call.
    pub async fn start_until(&self, halt: watch::Receiver<bool>) -> Result<(), ConnectionError> {
        self.run(Some(halt)).await
    }

    async fn run(&self, halt: Option<watch::Receiver<bool>>) -> Result<(), ConnectionError> {
        let socket = {
            let mut lifecycle = self.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Created) {
                Lifecycle::Opened(socket) => socket,
                other => {
                    let state = other.state();
                    *lifecycle = other;
                    return Err(self.invalid("start", state));
                }
            }
        };

        let (sink, stream) = socket.split();
        let (reload_tx, reload_rx) = mpsc::channel(self.queue_depth);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let notifier_stop = stop_tx.subscribe();

        *self.lock() = Lifecycle::Started {
            reload: reload_tx,
            stop: stop_tx.clone(),
        };
        tracing::debug!(connection_id = %self.id, "Connection started");

        let mut liveness = tokio::spawn(watch_liveness(self.id, stream, stop_tx.clone()));
        let notifier = tokio::spawn(notify(self.id, sink, reload_rx, notifier_stop));

        let halted = async move {
            match halt {
                Some(mut halt) => stopped(&mut halt).await,
                None => std::future::pending::<()>().await,
            }
        };

        let mut failure = tokio::select! {
            _ = stopped(&mut stop_rx) => None,
            _ = halted => None,
            joined = &mut liveness => joined.err(),
        };

        // Drop the queue handle before waiting so no reload lands on a dying notifier
        *self.lock() = Lifecycle::Terminated { sink: None };
        stop_tx.send_replace(true);
        liveness.abort();

        let sink = match notifier.await {
            Ok(sink) => Some(sink),
            Err(e) => {
                failure.get_or_insert(e);
                None
            }
        };
        if let Lifecycle::Terminated { sink: slot } = &mut *self.lock() {
            *slot = sink;
        }

        match failure {
            Some(source) => Err(ConnectionError::Failed {
                id: self.id,
                source,
            }),
            None => Ok(()),
        }
    }

    /// Queue one reload signal, giving up after `timeout`.
    ///
    /// A client that cannot accept the signal in time is stopped.
    pub async fn reload(&self, timeout: Duration) -> Result<(), ConnectionError> {
        let reload = match &*self.lock() {
            Lifecycle::Started { reload, .. } => reload.clone(),
            Lifecycle::Terminated { .. } => return Err(ConnectionError::Terminated { id: self.id }),
            _ => return Err(ConnectionError::NotStarted { id: self.id }),
        };

        match tokio::time::timeout(timeout, reload.send(())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ConnectionError::QueueClosed { id: self.id }),
            Err(_) => {
                tracing::warn!(connection_id = %self.id, ?timeout, "Client too slow, stopping it");
                let _ = self.stop();
                Err(ConnectionError::DeliveryTimeout {
                    id: self.id,
                    timeout,
                })
            }
        }
    }

    /// Ask a running connection to terminate.
    pub fn stop(&self) -> Result<(), ConnectionError> {
        match &*self.lock() {
            Lifecycle::Started { stop, .. } => {
                stop.send_replace(true);
                Ok(())
            }
            Lifecycle::Terminated { .. } => Err(ConnectionError::Terminated { id: self.id }),
            _ => Err(ConnectionError::NotStarted { id: self.id }),
        }
    }

    /// Close the underlying socket.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        enum Closable {
            Socket(WebSocket),
            Sink(Sink),
        }

        let closable = {
            let mut lifecycle = self.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Terminated { sink: None }) {
                Lifecycle::Opened(socket) => Closable::Socket(socket),
                Lifecycle::Terminated { sink: Some(sink) } => Closable::Sink(sink),
                Lifecycle::Terminated { sink: None } => {
                    return Err(ConnectionError::AlreadyClosed { id: self.id })
                }
                other => {
                    let state = other.state();
                    *lifecycle = other;
                    return Err(self.invalid("close", state));
                }
            }
        };

        let result = match closable {
            Closable::Socket(mut socket) => SinkExt::close(&mut socket).await,
            Closable::Sink(mut sink) => SinkExt::close(&mut sink).await,
        };
        result.map_err(|source| ConnectionError::Close {
            id: self.id,
            source,
        })
    }
}

/// Resolve once the stop flag is raised (or its sender is gone).
async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn watch_liveness(
    id: Uuid,
    mut stream: SplitStream<WebSocket>,
    stop: Arc<watch::Sender<bool>>,
) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Close(_))) | None => {
                tracing::debug!(connection_id = %id, "Client disconnected");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(
                    connection_id = %id,
                    error = %e,
                    "Read failed, treating as disconnect"
                );
                break;
            }
        }
    }
    stop.send_replace(true);
}

async fn notify(
    id: Uuid,
    mut sink: Sink,
    mut reload: mpsc::Receiver<()>,
    mut stop: watch::Receiver<bool>,
) -> Sink {
    loop {
        let received = tokio::select! {
            _ = stopped(&mut stop) => None,
            received = reload.recv() => received,
        };
        if received.is_none() {
            break;
        }

        let sent = tokio::select! {
            result = sink.send(Message::Text(RELOAD_MESSAGE.into())) => Some(result),
            _ = stopped(&mut stop) => None,
        };
        match sent {
            Some(Ok(())) => {
                tracing::debug!(connection_id = %id, "Sent reload signal");
                metrics::record_delivery("sent");
            }
            Some(Err(e)) => {
                tracing::warn!(connection_id = %id, error = %e, "Failed to send reload signal");
                metrics::record_delivery("write_failed");
            }
            None => break,
        }
    }

    tracing::debug!(connection_id = %id, "Notifier stopped");
    sink
}


#[cfg(test)]
mod tests {
    use super::testing::socket_pair;
    use super::*;
    use tokio_tungstenite::tungstenite;

    async fn wait_for_state(connection: &Connection, state: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while connection.state() != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection should reach the expected state");
    }

    #[tokio::test]
    async fn test_unstarted_connection_rejects_operations() {
        let connection = Connection::new(1);
        assert_eq!(connection.state(), ConnectionState::Created);

        assert!(matches!(
            connection.reload(Duration::from_millis(10)).await,
            Err(ConnectionError::NotStarted { .. })
        ));
        assert!(matches!(connection.stop(), Err(ConnectionError::NotStarted { .. })));
        assert!(matches!(
            connection.start().await,
            Err(ConnectionError::InvalidState {
                operation: "start",
                state: ConnectionState::Created,
                ..
            })
        ));
        assert!(matches!(
            connection.close().await,
            Err(ConnectionError::InvalidState {
                operation: "close",
                ..
            })
        ));
        assert_eq!(connection.state(), ConnectionState::Created);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(Connection::new(1).id(), Connection::new(1).id());
    }

    #[tokio::test]
    async fn test_stopped_resolves_on_flag() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { stopped(&mut rx).await });
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("stop flag should release the waiter")
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_times_out_and_stops_connection() {
        let connection = Connection::new(1);
        let (_queue, stop) = connection.stall();

        connection.reload(Duration::from_millis(50)).await.unwrap();
        let err = connection.reload(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::DeliveryTimeout { timeout, .. } if timeout == Duration::from_millis(50)
        ));
        assert!(*stop.borrow());
    }

    #[tokio::test]
    async fn test_started_connection_delivers_reload_frame() {
        let (socket, mut client) = socket_pair().await;
        let connection = Arc::new(Connection::new(1));
        connection.open(socket).unwrap();
        assert_eq!(connection.state(), ConnectionState::Opened);

        let running = tokio::spawn({
            let connection = connection.clone();
            async move { connection.start().await }
        });
        wait_for_state(&connection, ConnectionState::Started).await;

        connection.reload(Duration::from_secs(1)).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame, tungstenite::Message::text(RELOAD_MESSAGE));

        connection.stop().unwrap();
        running.await.unwrap().unwrap();
        assert_eq!(connection.state(), ConnectionState::Terminated);
        assert!(matches!(
            connection.reload(Duration::from_millis(10)).await,
            Err(ConnectionError::Terminated { .. })
        ));
    }

    #[tokio::test]
    async fn test_second_close_is_rejected() {
        let (socket, _client) = socket_pair().await;
        let connection = Arc::new(Connection::new(1));
        connection.open(socket).unwrap();

        let running = tokio::spawn({
            let connection = connection.clone();
            async move { connection.start().await }
        });
        wait_for_state(&connection, ConnectionState::Started).await;
        assert!(matches!(
            connection.close().await,
            Err(ConnectionError::InvalidState { operation: "close", .. })
        ));

        connection.stop().unwrap();
        running.await.unwrap().unwrap();

        connection.close().await.unwrap();
        assert!(matches!(
            connection.close().await,
            Err(ConnectionError::AlreadyClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_raised_halt_ends_start_immediately() {
        let (socket, _client) = socket_pair().await;
        let connection = Connection::new(1);
        connection.open(socket).unwrap();

        let (halt, halt_rx) = watch::channel(true);
        tokio::time::timeout(Duration::from_secs(1), connection.start_until(halt_rx))
            .await
            .expect("a raised halt flag should end start")
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Terminated);
        drop(halt);
    }
}
