//! One physical connection to the ring, for the length of one cycle.
//!
//! The session turns the transport's notification stream into a pull based
//! [`Session::next_notification`] so the measurement code never deals with
//! callbacks, and it is the only place the connection state changes.

use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::address::DeviceAddress;
use crate::packet::{self, CommandFrame, DecodeError, ResponseFrame};
use crate::shutdown::Shutdown;
use crate::transport::{
    Notifications, Transport, TransportError, NOTIFY_CHARACTERISTIC_UUID, WRITE_CHARACTERISTIC_UUID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("timed out connecting to the ring")]
    TimedOut,
    #[error("adapter rejected the connection: {0}")]
    AdapterRejected(String),
    #[error("ring is connected to another central")]
    AlreadyConnectedElsewhere,
    #[error("ring {0} not found")]
    NotFound(String),
}

impl From<TransportError> for ConnectError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::TimedOut => Self::TimedOut,
            TransportError::AlreadyConnected => Self::AlreadyConnectedElsewhere,
            TransportError::DeviceNotFound(address) => Self::NotFound(address),
            other => Self::AdapterRejected(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("session is not connected")]
    NotConnected,
    #[error("adapter busy: {0}")]
    AdapterBusy(String),
    #[error("write not acknowledged within {0:?}")]
    TimedOut(Duration),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecvError {
    #[error("no notification before the deadline")]
    Timeout,
    #[error("connection dropped")]
    ConnectionDropped,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("cancelled")]
    Cancelled,
}

pub struct Session<'t, T: Transport + ?Sized> {
    transport: &'t mut T,
    address: DeviceAddress,
    state: SessionState,
    notifications: Option<Notifications>,
    /// The transport has been told to disconnect. A link that dropped on its
    /// own still needs this to free the transport for the next session.
    released: bool,
}

impl<'t, T: Transport + ?Sized> Session<'t, T> {
    /// Connect and subscribe to the notify characteristic in a single attempt.
    ///
    /// On failure the link is released before returning, so a failed open
    /// never leaves a half-open connection behind.
    pub async fn open(
        transport: &'t mut T,
        address: &DeviceAddress,
        connect_timeout: Duration,
    ) -> Result<Session<'t, T>, ConnectError> {
        Self::open_with_attempts(transport, address, connect_timeout, 1).await
    }

    /// Like [`Session::open`], but a failed attempt is released and retried
    /// up to `attempts` times in total.
    ///
    /// `connect_timeout` bounds the whole open across all attempts, subscribe
    /// included. Running out of it is not retried.
    pub async fn open_with_attempts(
        transport: &'t mut T,
        address: &DeviceAddress,
        connect_timeout: Duration,
        attempts: u32,
    ) -> Result<Session<'t, T>, ConnectError> {
        let mut session = Session {
            transport,
            address: address.clone(),
            state: SessionState::Disconnected,
            notifications: None,
            released: false,
        };
        let deadline = Instant::now() + connect_timeout;
        let attempts = attempts.max(1);

        for attempt in 1..=attempts {
            session.state = SessionState::Connecting;
            session.released = false;
            info!(%address, attempt, "connecting");

            match session.connect_and_subscribe(deadline).await {
                Ok(notifications) => {
                    session.notifications = Some(notifications);
                    session.state = SessionState::Connected;
                    info!(%address, "connected");
                    return Ok(session);
                }
                Err(err) => {
                    session.release().await;
                    if err == ConnectError::TimedOut || attempt == attempts {
                        warn!(%address, attempt, "connect failed: {err}");
                        return Err(err);
                    }
                    warn!(%address, attempt, "connect failed: {err}, retrying");
                }
            }
        }
        Err(ConnectError::TimedOut)
    }

    async fn connect_and_subscribe(&mut self, deadline: Instant) -> Result<Notifications, ConnectError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let transport = &mut *self.transport;
        let address = &self.address;
        let steps = async {
            transport.connect(address, remaining).await?;
            transport.subscribe(NOTIFY_CHARACTERISTIC_UUID).await
        };

        match tokio::time::timeout_at(deadline, steps).await {
            Ok(result) => result.map_err(ConnectError::from),
            Err(_) => Err(ConnectError::TimedOut),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Write `frame` to the ring.
    ///
    /// The write must be acknowledged within `timeout`, and gives up as soon
    /// as `shutdown` fires.
    pub async fn send(
        &mut self,
        frame: &CommandFrame,
        timeout: Duration,
        shutdown: &mut Shutdown,
    ) -> Result<(), WriteError> {
        if self.state != SessionState::Connected {
            return Err(WriteError::NotConnected);
        }

        let bytes = frame.to_bytes();
        debug!("TX: {}", hex::encode(bytes));

        let write = self.transport.write(WRITE_CHARACTERISTIC_UUID, &bytes);
        let written = tokio::select! {
            biased;
            () = shutdown.triggered() => return Err(WriteError::Cancelled),
            written = tokio::time::timeout(timeout, write) => written,
        };

        match written {
            Err(_) => Err(WriteError::TimedOut(timeout)),
            Ok(Ok(())) => Ok(()),
            Ok(Err(TransportError::NotConnected | TransportError::Disconnected)) => {
                self.mark_dropped();
                Err(WriteError::NotConnected)
            }
            Ok(Err(err)) => Err(WriteError::AdapterBusy(err.to_string())),
        }
    }

    /// Wait for the next notification, in the order the ring emitted them.
    ///
    /// Returns as soon as `shutdown` fires rather than sitting out the timeout.
    pub async fn next_notification(
        &mut self,
        timeout: Duration,
        shutdown: &mut Shutdown,
    ) -> Result<ResponseFrame, RecvError> {
        if shutdown.is_triggered() {
            return Err(RecvError::Cancelled);
        }
        let Some(notifications) = self.notifications.as_mut() else {
            return Err(RecvError::ConnectionDropped);
        };

        let item = tokio::select! {
            biased;
            () = shutdown.triggered() => return Err(RecvError::Cancelled),
            item = tokio::time::timeout(timeout, notifications.next()) => item,
        };

        match item {
            Err(_) => Err(RecvError::Timeout),
            Ok(Some(Ok(bytes))) => {
                debug!("RX: {}", hex::encode(&bytes));
                Ok(packet::decode(&bytes)?)
            }
            Ok(Some(Err(err))) => {
                warn!("notification error: {err}");
                self.mark_dropped();
                Err(RecvError::ConnectionDropped)
            }
            Ok(None) => {
                warn!("notification stream ended");
                self.mark_dropped();
                Err(RecvError::ConnectionDropped)
            }
        }
    }

    /// Disconnect. Calling this more than once is harmless.
    pub async fn close(&mut self) {
        if self.released {
            return;
        }
        self.release().await;
        info!(address = %self.address, "disconnected");
    }

    async fn release(&mut self) {
        self.state = SessionState::Disconnecting;
        self.notifications = None;
        if let Err(err) = self.transport.disconnect().await {
            warn!(address = %self.address, "disconnect failed: {err}");
        }
        self.state = SessionState::Disconnected;
        self.released = true;
    }

    fn mark_dropped(&mut self) {
        self.notifications = None;
        self.state = SessionState::Disconnected;
    }
}

impl<T: Transport + ?Sized> Drop for Session<'_, T> {
    fn drop(&mut self) {
        if !self.released {
            warn!(address = %self.address, "session dropped while {:?}; link not closed", self.state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_transport::{packet, MockReply, MockTransport};
    use crate::packet::{DecodeErrorReason, CMD_BATTERY};

    fn address() -> DeviceAddress {
        "AA:BB:CC:DD:EE:FF".parse().unwrap()
    }

    fn battery_request() -> CommandFrame {
        packet::encode(CMD_BATTERY, &[]).unwrap()
    }

    #[tokio::test]
    async fn test_open_and_close() {
        let mut transport = MockTransport::new();
        let log = transport.log_handle();

        let mut session = Session::open(&mut transport, &address(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        drop(session);

        let log = log.lock().unwrap();
        assert_eq!(log.connects, 1);
        assert_eq!(log.disconnects, 1);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure_is_mapped_and_released() {
        let mut transport = MockTransport::new().fail_connect(TransportError::AlreadyConnected);
        let log = transport.log_handle();

        let result = Session::open(&mut transport, &address(), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ConnectError::AlreadyConnectedElsewhere)));
        assert_eq!(log.lock().unwrap().disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let mut transport = MockTransport::new().hang_on_connect();
        let log = transport.log_handle();

        let start = Instant::now();
        let result = Session::open_with_attempts(&mut transport, &address(), Duration::from_secs(7), 3).await;
        assert!(matches!(result, Err(ConnectError::TimedOut)));
        assert_eq!(start.elapsed(), Duration::from_secs(7));
        let log = log.lock().unwrap();
        assert_eq!(log.connects, 1);
        assert_eq!(log.disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_counts_against_connect_timeout() {
        let mut transport = MockTransport::new().hang_on_subscribe();
        let log = transport.log_handle();

        let start = Instant::now();
        let result = Session::open(&mut transport, &address(), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ConnectError::TimedOut)));
        drop(result);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(log.lock().unwrap().disconnects, 1);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_failed_attempt_is_released_and_retried() {
        let mut transport =
            MockTransport::new().fail_connect_times(1, TransportError::DeviceNotFound("AA:BB:CC:DD:EE:FF".into()));
        let log = transport.log_handle();

        let mut session =
            Session::open_with_attempts(&mut transport, &address(), Duration::from_secs(5), 3).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        {
            let log = log.lock().unwrap();
            assert_eq!(log.connects, 2);
            assert_eq!(log.disconnects, 1);
            assert_eq!(log.subscriptions, 1);
        }

        session.close().await;
        assert_eq!(log.lock().unwrap().disconnects, 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_all_attempts() {
        let mut transport = MockTransport::new().fail_connect(TransportError::AdapterRejected("busy".into()));
        let log = transport.log_handle();

        let result = Session::open_with_attempts(&mut transport, &address(), Duration::from_secs(5), 3).await;
        assert!(matches!(result, Err(ConnectError::AdapterRejected(_))));
        let log = log.lock().unwrap();
        assert_eq!(log.connects, 3);
        assert_eq!(log.disconnects, 3);
    }

    #[tokio::test]
    async fn test_subscribe_failure_releases_link() {
        let mut transport =
            MockTransport::new().fail_subscribe(TransportError::AdapterRejected("notify refused".into()));
        let log = transport.log_handle();

        let result = Session::open(&mut transport, &address(), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ConnectError::AdapterRejected(_))));
        drop(result);
        assert!(!transport.is_connected());
        assert_eq!(log.lock().unwrap().disconnects, 1);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let mut transport = MockTransport::new();
        let mut session = Session::open(&mut transport, &address(), Duration::from_secs(5)).await.unwrap();
        session.close().await;

        let frame = packet::encode(CMD_BATTERY, &[]).unwrap();
        let result = session.send(&frame, Duration::from_secs(1), &mut Shutdown::never()).await;
        assert_eq!(result, Err(WriteError::NotConnected));
    }

    #[tokio::test]
    async fn test_notifications_arrive_in_order() {
        let mut transport = MockTransport::new().with_responder(|_| {
            (1..=3).map(|level| MockReply::Notify(packet(CMD_BATTERY, &[level, 0]))).collect()
        });
        let mut shutdown = Shutdown::never();
        let mut session = Session::open(&mut transport, &address(), Duration::from_secs(5)).await.unwrap();

        session.send(&battery_request(), Duration::from_secs(1), &mut shutdown).await.unwrap();
        for level in 1..=3 {
            let frame = session.next_notification(Duration::from_secs(1), &mut shutdown).await.unwrap();
            assert_eq!(frame.payload()[0], level);
        }
        session.close().await;
    }

    #[tokio::test]
    async fn test_corrupt_notification_is_decode_error() {
        let mut corrupt = packet(CMD_BATTERY, &[50, 0]);
        corrupt[15] ^= 0x01;
        let mut transport = MockTransport::new().with_unsolicited(vec![corrupt]);
        let mut shutdown = Shutdown::never();
        let mut session = Session::open(&mut transport, &address(), Duration::from_secs(5)).await.unwrap();

        let err = session.next_notification(Duration::from_secs(1), &mut shutdown).await.unwrap_err();
        assert!(matches!(err, RecvError::Decode(e) if e.reason == DecodeErrorReason::ChecksumMismatch));
        assert_eq!(session.state(), SessionState::Connected);
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_and_drop() {
        let mut transport = MockTransport::new().with_responder(|_| vec![MockReply::DropLink]);
        let log = transport.log_handle();
        let mut shutdown = Shutdown::never();
        let mut session = Session::open(&mut transport, &address(), Duration::from_secs(5)).await.unwrap();

        let err = session.next_notification(Duration::from_secs(2), &mut shutdown).await.unwrap_err();
        assert_eq!(err, RecvError::Timeout);

        session.send(&battery_request(), Duration::from_secs(1), &mut shutdown).await.unwrap();
        let err = session.next_notification(Duration::from_secs(2), &mut shutdown).await.unwrap_err();
        assert_eq!(err, RecvError::ConnectionDropped);
        assert_eq!(session.state(), SessionState::Disconnected);

        // the transport still gets told, so it can be reused
        session.close().await;
        drop(session);
        assert_eq!(log.lock().unwrap().disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_wait() {
        let mut transport = MockTransport::new();
        let (trigger, mut shutdown) = crate::shutdown::channel();
        let mut session = Session::open(&mut transport, &address(), Duration::from_secs(5)).await.unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.trigger();
        });

        let start = Instant::now();
        let err = session.next_notification(Duration::from_secs(60), &mut shutdown).await.unwrap_err();
        assert_eq!(err, RecvError::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(60));
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_write_times_out() {
        let mut transport = MockTransport::new().hang_on_write(CMD_BATTERY);
        let mut shutdown = Shutdown::never();
        let mut session = Session::open(&mut transport, &address(), Duration::from_secs(5)).await.unwrap();

        let start = Instant::now();
        let result = session.send(&battery_request(), Duration::from_secs(3), &mut shutdown).await;
        assert_eq!(result, Err(WriteError::TimedOut(Duration::from_secs(3))));
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_write() {
        let mut transport = MockTransport::new().hang_on_write(CMD_BATTERY);
        let (trigger, mut shutdown) = crate::shutdown::channel();
        let mut session = Session::open(&mut transport, &address(), Duration::from_secs(5)).await.unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.trigger();
        });

        let start = Instant::now();
        let result = session.send(&battery_request(), Duration::from_secs(60), &mut shutdown).await;
        assert_eq!(result, Err(WriteError::Cancelled));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        session.close().await;
    }
}
