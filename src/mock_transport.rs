//! A scripted in-memory [`Transport`] for tests.
//!
//! Every write is recorded and handed to a responder closure, which decides
//! which notifications the fake ring emits in reply.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bluest::Uuid;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;

use crate::address::DeviceAddress;
use crate::packet;
use crate::transport::{Notifications, Transport, TransportError};

/// What the fake ring does in response to a write.
#[derive(Debug, Clone)]
pub enum MockReply {
    Notify(Vec<u8>),
    NotifyAfter(Duration, Vec<u8>),
    /// The link goes away: the notification stream ends and writes fail.
    DropLink,
}

/// Everything the transport was asked to do.
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    pub connects: usize,
    pub subscriptions: usize,
    pub disconnects: usize,
    pub writes: Vec<Vec<u8>>,
}

impl MockLog {
    /// Writes whose command id is `command_id`.
    pub fn writes_with_command(&self, command_id: u8) -> usize {
        self.writes.iter().filter(|w| w.first() == Some(&command_id)).count()
    }

    pub fn bytes_written(&self) -> usize {
        self.writes.iter().map(Vec::len).sum()
    }
}

type Responder = Box<dyn FnMut(&[u8]) -> Vec<MockReply> + Send>;

pub struct MockTransport {
    log: Arc<Mutex<MockLog>>,
    responder: Responder,
    connect_error: Option<TransportError>,
    /// Consumed one per `connect` before `connect_error` is consulted.
    connect_failures: VecDeque<TransportError>,
    hang_on_connect: bool,
    subscribe_error: Option<TransportError>,
    hang_on_subscribe: bool,
    hang_on_write: Option<u8>,
    unsolicited: Vec<Vec<u8>>,
    tx: Option<mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>>,
    connected: bool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A ring that connects fine and never answers.
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(MockLog::default())),
            responder: Box::new(|_| Vec::new()),
            connect_error: None,
            connect_failures: VecDeque::new(),
            hang_on_connect: false,
            subscribe_error: None,
            hang_on_subscribe: false,
            hang_on_write: None,
            unsolicited: Vec::new(),
            tx: None,
            connected: false,
        }
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<MockReply> + Send + 'static,
    {
        self.responder = Box::new(responder);
        self
    }

    pub fn fail_connect(mut self, err: TransportError) -> Self {
        self.connect_error = Some(err);
        self
    }

    /// The next `times` connects fail with `err`, later ones succeed.
    pub fn fail_connect_times(mut self, times: usize, err: TransportError) -> Self {
        self.connect_failures.extend(std::iter::repeat(err).take(times));
        self
    }

    /// `connect` never completes, leaving it to the caller's timeout.
    pub fn hang_on_connect(mut self) -> Self {
        self.hang_on_connect = true;
        self
    }

    pub fn fail_subscribe(mut self, err: TransportError) -> Self {
        self.subscribe_error = Some(err);
        self
    }

    pub fn hang_on_subscribe(mut self) -> Self {
        self.hang_on_subscribe = true;
        self
    }

    /// Writes of `command_id` are recorded but never complete, like a GATT
    /// write the adapter never acknowledges.
    pub fn hang_on_write(mut self, command_id: u8) -> Self {
        self.hang_on_write = Some(command_id);
        self
    }

    /// Notifications pushed as soon as the subscription is up.
    pub fn with_unsolicited(mut self, packets: Vec<Vec<u8>>) -> Self {
        self.unsolicited = packets;
        self
    }

    /// Shared handle to the recorded activity, usable after the transport is
    /// moved into a client.
    pub fn log_handle(&self) -> Arc<Mutex<MockLog>> {
        Arc::clone(&self.log)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn log(&self) -> MutexGuard<'_, MockLog> {
        self.log.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn apply(&mut self, replies: Vec<MockReply>) {
        for reply in replies {
            match reply {
                MockReply::Notify(bytes) => {
                    if let Some(tx) = &self.tx {
                        let _ = tx.send(Ok(bytes));
                    }
                }
                MockReply::NotifyAfter(delay, bytes) => {
                    if let Some(tx) = self.tx.clone() {
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(Ok(bytes));
                        });
                    }
                }
                MockReply::DropLink => {
                    self.tx = None;
                    self.connected = false;
                }
            }
        }
    }
}

/// Encode a valid packet, for building notifications in tests.
pub fn packet(command_id: u8, payload: &[u8]) -> Vec<u8> {
    packet::encode(command_id, payload).expect("test payload fits in a packet").to_bytes().to_vec()
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, _address: &DeviceAddress, _timeout: Duration) -> Result<(), TransportError> {
        self.log().connects += 1;
        if self.hang_on_connect {
            std::future::pending::<()>().await;
        }
        if let Some(err) = self.connect_failures.pop_front() {
            return Err(err);
        }
        if let Some(err) = self.connect_error.clone() {
            return Err(err);
        }
        self.connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, _characteristic: Uuid) -> Result<Notifications, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(err) = self.subscribe_error.clone() {
            return Err(err);
        }
        if self.hang_on_subscribe {
            std::future::pending::<()>().await;
        }
        self.log().subscriptions += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        for bytes in self.unsolicited.drain(..) {
            let _ = tx.send(Ok(bytes));
        }
        self.tx = Some(tx);

        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed())
    }

    async fn write(&mut self, _characteristic: Uuid, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.log().writes.push(bytes.to_vec());
        if bytes.first().is_some_and(|&id| Some(id) == self.hang_on_write) {
            std::future::pending::<()>().await;
        }
        let replies = (self.responder)(bytes);
        self.apply(replies);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.log().disconnects += 1;
        self.tx = None;
        self.connected = false;
        Ok(())
    }
}
