//! Frame demultiplexing.
//!
//! The printer's protocol has no correlation IDs: a reply is recognised only
//! by its shape. Every frame is therefore offered to every interested party:
//!
//! 1. each active [`Subscription`] (which keeps receiving until cancelled),
//! 2. then each [`PendingRequest`]; every request whose decoder matches is
//!    resolved and removed.
//!
//! Frames nobody matches are dropped. Two pending requests expecting the same
//! reply shape are both resolved by the first such frame.
//!
//! Two tasks run per connection: a socket pump feeding received bytes into a
//! channel, and a frame scanner draining it, extracting frames and
//! dispatching them in arrival order.

use crate::bridge::Bridge;
use crate::connection::Connection;
use crate::error::ClientError;
use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use printlink_protocol::{FrameScanner, Record};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Received chunks buffered between the socket pump and the frame scanner.
const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// What the socket pump hands to the frame scanner.
enum Chunk {
    Data(Bytes),
    /// The socket was replaced; bytes of a frame begun on the old one are stale.
    Reset,
}

/// A party interested in incoming frames.
pub(crate) trait Route: Send {
    /// Offers a frame body. Returns whether it matched.
    fn offer(&self, body: &str) -> bool;

    /// Returns whether the route should be dropped before the next offer.
    fn is_closed(&self) -> bool {
        false
    }

    /// Called once when a closed route is removed.
    fn close(&self) {}
}

struct RequestRoute<R> {
    bridge: Arc<Bridge<R>>,
}

impl<R: Record> Route for RequestRoute<R> {
    fn offer(&self, body: &str) -> bool {
        match R::try_decode(body) {
            Some(record) => {
                self.bridge.push(record);
                true
            }
            None => false,
        }
    }
}

struct StreamRoute<R> {
    bridge: Arc<Bridge<R>>,
    token: CancellationToken,
}

impl<R: Record> Route for StreamRoute<R> {
    fn offer(&self, body: &str) -> bool {
        match R::try_decode(body) {
            Some(record) => self.bridge.push(record),
            None => false,
        }
    }

    fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.bridge.is_cancelled()
    }

    fn close(&self) {
        self.bridge.cancel();
    }
}

type RouteTable = Mutex<Vec<(u64, Box<dyn Route>)>>;

/// Routes frame bodies to subscriptions and pending requests.
pub struct Dispatcher {
    next_id: AtomicU64,
    streams: RouteTable,
    pending: RouteTable,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            streams: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Registers a one-shot request for the next frame decoding as `R`.
    ///
    /// Register before writing the command, or a fast reply may be missed.
    /// Dropping the returned handle withdraws the request.
    pub fn register_request<R: Record>(self: &Arc<Self>) -> PendingRequest<R> {
        let bridge = Arc::new(Bridge::once());
        let id = self.add_request(Box::new(RequestRoute {
            bridge: bridge.clone(),
        }));
        tracing::debug!("Registered pending request id={} kind={}", id, R::TAG);
        PendingRequest {
            id,
            bridge,
            dispatcher: Arc::downgrade(self),
        }
    }

    /// Removes a pending request without resolving it.
    ///
    /// Returns whether it was still pending.
    pub fn withdraw(&self, id: u64) -> bool {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|(route_id, _)| *route_id != id);
        pending.len() != before
    }

    /// Subscribes to every frame decoding as `R` until `token` is cancelled
    /// or the subscription is dropped.
    pub fn subscribe<R: Record>(self: &Arc<Self>, token: &CancellationToken) -> Subscription<R> {
        self.prune_streams();
        let bridge = Arc::new(Bridge::unbounded());
        let token = token.child_token();
        let id = self.add_stream(Box::new(StreamRoute {
            bridge: bridge.clone(),
            token: token.clone(),
        }));
        tracing::debug!("Opened subscription id={} kind={}", id, R::TAG);
        Subscription {
            id,
            bridge,
            token,
            dispatcher: Arc::downgrade(self),
        }
    }

    /// Removes a subscription, closing its route.
    fn unsubscribe(&self, id: u64) {
        let mut streams = self.streams.lock();
        if let Some(index) = streams.iter().position(|(route_id, _)| *route_id == id) {
            let (_, route) = streams.remove(index);
            route.close();
            tracing::debug!("Closed subscription id={}", id);
        }
    }

    /// Drops subscriptions cancelled through their parent token.
    fn prune_streams(&self) {
        self.streams.lock().retain(|(id, route)| {
            if route.is_closed() {
                tracing::debug!("Closing cancelled subscription id={}", id);
                route.close();
                return false;
            }
            true
        });
    }

    /// Offers one frame body to every subscription, then to every pending
    /// request. Returns the number of routes that matched.
    pub fn dispatch(&self, body: &[u8]) -> usize {
        let Ok(text) = std::str::from_utf8(body) else {
            tracing::debug!("Dropping non-UTF-8 frame ({} bytes)", body.len());
            return 0;
        };

        let mut matched = 0;
        self.prune_streams();
        {
            let streams = self.streams.lock();
            for (_, route) in streams.iter() {
                if route.offer(text) {
                    matched += 1;
                }
            }
        }
        {
            let mut pending = self.pending.lock();
            pending.retain(|(id, route)| {
                if route.offer(text) {
                    tracing::debug!("Resolved pending request id={}", id);
                    matched += 1;
                    return false;
                }
                true
            });
        }

        if matched == 0 {
            tracing::trace!("Unmatched frame dropped: {}", text);
        }
        matched
    }

    /// Drops every pending request and subscription without resolving them.
    pub fn abandon_all(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        let streams = std::mem::take(&mut *self.streams.lock());
        tracing::debug!(
            "Abandoning {} pending requests and {} subscriptions",
            pending.len(),
            streams.len()
        );
    }

    /// Returns the number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns the number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.streams
            .lock()
            .iter()
            .filter(|(_, route)| !route.is_closed())
            .count()
    }

    pub(crate) fn add_request(&self, route: Box<dyn Route>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().push((id, route));
        id
    }

    pub(crate) fn add_stream(&self, route: Box<dyn Route>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.streams.lock().push((id, route));
        id
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.pending_count())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

/// An outstanding one-shot request.
#[derive(Debug)]
pub struct PendingRequest<R> {
    id: u64,
    bridge: Arc<Bridge<R>>,
    dispatcher: Weak<Dispatcher>,
}

impl<R> PendingRequest<R> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the matching frame.
    ///
    /// Never resolves if the connection goes away first; apply a timeout.
    pub async fn wait(&self) -> Result<R, ClientError> {
        Ok(self.bridge.recv().await?)
    }

    /// Takes the reply if it already arrived.
    pub fn try_take(&self) -> Option<R> {
        self.bridge.try_recv()
    }
}

impl<R> Drop for PendingRequest<R> {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.withdraw(self.id);
        }
    }
}

/// A long-lived registration receiving every matching frame.
#[derive(Debug)]
pub struct Subscription<R> {
    id: u64,
    bridge: Arc<Bridge<R>>,
    token: CancellationToken,
    dispatcher: Weak<Dispatcher>,
}

impl<R: Send + 'static> Subscription<R> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next record.
    ///
    /// Fails with [`ClientError::Cancelled`] once the subscription's token
    /// fires; records still buffered at that point are discarded.
    pub async fn recv(&mut self) -> Result<R, ClientError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                self.bridge.cancel();
                Err(ClientError::Cancelled)
            }
            record = self.bridge.recv() => Ok(record?),
        }
    }

    /// Cancels this subscription only.
    pub fn cancel(&self) {
        self.token.cancel();
        self.bridge.cancel();
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.unsubscribe(self.id);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.bridge.is_cancelled()
    }

    /// Converts the subscription into a stream that ends on cancellation.
    pub fn into_stream(self) -> impl Stream<Item = R> {
        futures::stream::unfold(self, |mut subscription| async move {
            let record = subscription.recv().await.ok()?;
            Some((record, subscription))
        })
    }
}

impl<R> Drop for Subscription<R> {
    fn drop(&mut self) {
        self.token.cancel();
        self.bridge.cancel();
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.unsubscribe(self.id);
        }
    }
}

/// Runs the socket pump and frame scanner for one connection.
pub struct Demultiplexer {
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    pump: Mutex<Option<JoinHandle<Result<(), ClientError>>>>,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

impl Demultiplexer {
    /// Spawns the pump and scanner tasks over `conn`, dispatching frames
    /// through `dispatcher`.
    pub fn start(conn: Arc<Connection>, dispatcher: Arc<Dispatcher>) -> Self {
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);

        let pump = tokio::spawn(pump_loop(conn, tx, shutdown.clone()));
        let scanner = tokio::spawn(scan_loop(rx, dispatcher.clone(), shutdown.clone()));

        Self {
            dispatcher,
            shutdown,
            pump: Mutex::new(Some(pump)),
            scanner: Mutex::new(Some(scanner)),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Returns whether the socket pump is still running.
    pub fn is_running(&self) -> bool {
        self.pump
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops both tasks and abandons every pending request and subscription.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.dispatcher.abandon_all();
    }

    /// Waits for the socket pump to end and reports why it ended.
    ///
    /// `Ok` means the printer closed the connection or shutdown was
    /// requested. Returns `Ok` immediately if already joined.
    pub async fn join(&self) -> Result<(), ClientError> {
        let pump = self.pump.lock().take();
        let result = match pump {
            Some(handle) => handle
                .await
                .unwrap_or_else(|e| Err(ClientError::Io(io::Error::other(e)))),
            None => Ok(()),
        };

        let scanner = self.scanner.lock().take();
        if let Some(handle) = scanner {
            let _ = handle.await;
        }
        result
    }
}

impl Drop for Demultiplexer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn pump_loop(
    conn: Arc<Connection>,
    tx: mpsc::Sender<Chunk>,
    shutdown: CancellationToken,
) -> Result<(), ClientError> {
    tracing::debug!("Socket pump started");
    let mut buf = vec![0u8; conn.config().read_buffer_size];
    let mut socket = None;

    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Socket pump cancelled");
                return Ok(());
            }
            result = conn.receive_tagged(&mut buf) => result,
        };

        match result {
            Ok((0, _)) => {
                tracing::debug!("Printer closed the connection");
                return Ok(());
            }
            Ok((n, generation)) => {
                tracing::trace!("Received {} bytes", n);
                if socket.is_some_and(|previous| previous != generation) {
                    tracing::debug!("Socket replaced, discarding partial frame");
                    if tx.send(Chunk::Reset).await.is_err() {
                        return Ok(());
                    }
                }
                socket = Some(generation);
                let data = Chunk::Data(Bytes::copy_from_slice(&buf[..n]));
                if tx.send(data).await.is_err() {
                    return Ok(());
                }
            }
            Err(ClientError::ConnectionClosed) => return Ok(()),
            Err(e) => {
                tracing::warn!("Socket pump stopped: {}", e);
                return Err(e);
            }
        }
    }
}

async fn scan_loop(
    mut rx: mpsc::Receiver<Chunk>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) {
    tracing::debug!("Frame scanner started");
    let mut scanner = FrameScanner::new();

    loop {
        let chunk = tokio::select! {
            _ = shutdown.cancelled() => break,
            chunk = rx.recv() => chunk,
        };
        match chunk {
            Some(Chunk::Data(data)) => {
                scanner.extend(&data);
                while let Some(frame) = scanner.next_frame() {
                    dispatcher.dispatch(&frame);
                }
            }
            Some(Chunk::Reset) => scanner.clear(),
            None => break,
        }
    }
    tracing::debug!("Frame scanner stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use futures::StreamExt;
    use printlink_protocol::{FilePercentRecord, StateRecord, UploadRecord, ZOffsetRecord};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const STATE: &str = "state;0.00;0.00;23;25;0;10;1;0;0;0";

    /// Records every body it is offered, matching nothing.
    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Route for Recorder {
        fn offer(&self, body: &str) -> bool {
            self.log.lock().push(format!("{}:{}", self.label, body));
            false
        }
    }

    fn recorder(label: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Box<dyn Route> {
        Box::new(Recorder {
            label,
            log: log.clone(),
        })
    }

    #[test]
    fn test_frames_dispatched_in_arrival_order() {
        let dispatcher = Arc::new(Dispatcher::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.add_stream(recorder("s", &log));

        let mut scanner = FrameScanner::new();
        scanner.extend(b"@#fend;#@@#filepercent:5#@");
        while let Some(frame) = scanner.next_frame() {
            dispatcher.dispatch(&frame);
        }

        assert_eq!(*log.lock(), vec!["s:fend;", "s:filepercent:5"]);
    }

    #[test]
    fn test_streams_offered_before_requests() {
        let dispatcher = Arc::new(Dispatcher::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.add_request(recorder("request", &log));
        dispatcher.add_stream(recorder("stream", &log));

        dispatcher.dispatch(b"stopped;");
        assert_eq!(*log.lock(), vec!["stream:stopped;", "request:stopped;"]);
    }

    #[tokio::test]
    async fn test_pending_request_resolves_once() {
        let dispatcher = Arc::new(Dispatcher::new());
        let request = dispatcher.register_request::<ZOffsetRecord>();
        assert_eq!(dispatcher.pending_count(), 1);

        assert_eq!(dispatcher.dispatch(b"ZOffsetValue:1.00"), 1);
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(dispatcher.dispatch(b"ZOffsetValue:2.00"), 0);

        let record = request.wait().await.unwrap();
        assert!(record.success);
        assert_eq!(record.z_offset, 1.0);
    }

    #[test]
    fn test_unmatched_frame_leaves_request_pending() {
        let dispatcher = Arc::new(Dispatcher::new());
        let _request = dispatcher.register_request::<UploadRecord>();

        assert_eq!(dispatcher.dispatch(STATE.as_bytes()), 0);
        assert_eq!(dispatcher.pending_count(), 1);
        assert_eq!(dispatcher.dispatch(b"fend;"), 1);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_shape_requests_share_a_reply() {
        let dispatcher = Arc::new(Dispatcher::new());
        let first = dispatcher.register_request::<ZOffsetRecord>();
        let second = dispatcher.register_request::<ZOffsetRecord>();

        assert_eq!(dispatcher.dispatch(b"ZOffsetValue:0.50"), 2);
        assert_eq!(first.wait().await.unwrap().z_offset, 0.5);
        assert_eq!(second.wait().await.unwrap().z_offset, 0.5);
    }

    #[test]
    fn test_withdraw() {
        let dispatcher = Arc::new(Dispatcher::new());
        let request = dispatcher.register_request::<UploadRecord>();
        assert!(dispatcher.withdraw(request.id()));
        assert!(!dispatcher.withdraw(request.id()));
        assert_eq!(dispatcher.dispatch(b"fend;"), 0);
    }

    #[tokio::test]
    async fn test_subscription_until_cancelled() {
        let dispatcher = Arc::new(Dispatcher::new());
        let token = CancellationToken::new();
        let mut states = dispatcher.subscribe::<StateRecord>(&token);

        assert_eq!(dispatcher.dispatch(STATE.as_bytes()), 1);
        assert_eq!(dispatcher.dispatch(STATE.as_bytes()), 1);
        assert_eq!(states.recv().await.unwrap().bed_temp, 23);
        assert_eq!(states.recv().await.unwrap().nozzle_temp, 25);

        token.cancel();
        assert_eq!(dispatcher.dispatch(STATE.as_bytes()), 0);
        assert_eq!(dispatcher.subscription_count(), 0);
        assert!(matches!(states.recv().await, Err(ClientError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_one_subscription_only() {
        let dispatcher = Arc::new(Dispatcher::new());
        let first_token = CancellationToken::new();
        let second_token = CancellationToken::new();
        let mut first = dispatcher.subscribe::<FilePercentRecord>(&first_token);
        let mut second = dispatcher.subscribe::<FilePercentRecord>(&second_token);
        let request = dispatcher.register_request::<FilePercentRecord>();

        first_token.cancel();
        assert_eq!(dispatcher.dispatch(b"filepercent:40"), 2);

        assert!(matches!(first.recv().await, Err(ClientError::Cancelled)));
        assert_eq!(second.recv().await.unwrap().percent, 40);
        assert_eq!(request.wait().await.unwrap().percent, 40);
    }

    #[tokio::test]
    async fn test_cancel_wakes_blocked_subscriber() {
        let dispatcher = Arc::new(Dispatcher::new());
        let token = CancellationToken::new();
        let mut states = dispatcher.subscribe::<StateRecord>(&token);

        let waiter = tokio::spawn(async move { states.recv().await });
        tokio::task::yield_now().await;
        token.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ClientError::Cancelled)));
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let dispatcher = Arc::new(Dispatcher::new());
        let token = CancellationToken::new();
        let states = dispatcher.subscribe::<StateRecord>(&token);
        drop(states);

        assert_eq!(dispatcher.dispatch(STATE.as_bytes()), 0);
        assert_eq!(dispatcher.subscription_count(), 0);
        // The caller's token is untouched.
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_subscription_stream_ends_on_cancel() {
        let dispatcher = Arc::new(Dispatcher::new());
        let token = CancellationToken::new();
        let stream = dispatcher.subscribe::<FilePercentRecord>(&token).into_stream();

        dispatcher.dispatch(b"filepercent:1");
        dispatcher.dispatch(b"filepercent:2");

        let mut stream = Box::pin(stream);
        assert_eq!(stream.next().await.unwrap().percent, 1);
        assert_eq!(stream.next().await.unwrap().percent, 2);

        token.cancel();
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_non_utf8_frame_dropped() {
        let dispatcher = Arc::new(Dispatcher::new());
        let _request = dispatcher.register_request::<UploadRecord>();
        assert_eq!(dispatcher.dispatch(&[0xff, 0xfe, b';']), 0);
        assert_eq!(dispatcher.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_abandon_leaves_requests_unresolved() {
        let dispatcher = Arc::new(Dispatcher::new());
        let request = dispatcher.register_request::<UploadRecord>();
        dispatcher.abandon_all();

        assert_eq!(dispatcher.pending_count(), 0);
        let waited = tokio::time::timeout(Duration::from_millis(50), request.wait()).await;
        assert!(waited.is_err());
    }

    /// Drops `stream` with an RST instead of an orderly FIN.
    #[allow(deprecated)]
    fn reset(stream: tokio::net::TcpStream) {
        stream.set_linger(Some(Duration::ZERO)).unwrap();
        drop(stream);
    }

    #[tokio::test]
    async fn test_abandoned_wait_withdraws_request() {
        let dispatcher = Arc::new(Dispatcher::new());
        for _ in 0..100 {
            let request = dispatcher.register_request::<ZOffsetRecord>();
            let waited = tokio::time::timeout(Duration::from_millis(1), request.wait()).await;
            assert!(waited.is_err());
        }
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn test_cancelled_subscriptions_leave_without_traffic() {
        let dispatcher = Arc::new(Dispatcher::new());
        let token = CancellationToken::new();
        let first = dispatcher.subscribe::<StateRecord>(&token);
        let _second = dispatcher.subscribe::<StateRecord>(&token);
        assert_eq!(dispatcher.subscription_count(), 2);

        first.cancel();
        assert_eq!(dispatcher.subscription_count(), 1);

        token.cancel();
        assert_eq!(dispatcher.subscription_count(), 0);
    }

    async fn connected_pair() -> (Arc<Connection>, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let conn = Arc::new(Connection::new(ConnectionConfig::new(
            listener.local_addr().unwrap(),
        )));
        conn.connect().await.unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        (conn, peer)
    }

    #[tokio::test]
    async fn test_fragmented_frame_over_socket() {
        let (conn, mut peer) = connected_pair().await;
        let demux = Demultiplexer::start(conn, Arc::new(Dispatcher::new()));
        let request = demux.dispatcher().register_request::<StateRecord>();

        let frame = format!("@#{STATE}#@");
        let (head, tail) = frame.as_bytes().split_at(13);
        peer.write_all(head).await.unwrap();
        peer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.write_all(tail).await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(5), request.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.bed_temp, 23);
        assert_eq!(record.nozzle_temp, 25);
    }

    #[tokio::test]
    async fn test_partial_frame_discarded_on_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ConnectionConfig::new(listener.local_addr().unwrap())
            .with_reconnect_backoff(Duration::from_millis(10));
        let conn = Arc::new(Connection::new(config));
        conn.connect().await.unwrap();
        let (mut first, _) = listener.accept().await.unwrap();

        let demux = Demultiplexer::start(conn, Arc::new(Dispatcher::new()));
        let request = demux.dispatcher().register_request::<ZOffsetRecord>();

        first.write_all(b"@#state;0.0").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        reset(first);

        let (mut second, _) = listener.accept().await.unwrap();
        second.write_all(b"@#ZOffsetValue:1.00#@").await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(2), request.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(record.success);
        assert_eq!(record.z_offset, 1.0);
    }

    #[tokio::test]
    async fn test_pump_ends_when_printer_closes() {
        let (conn, peer) = connected_pair().await;
        let demux = Demultiplexer::start(conn, Arc::new(Dispatcher::new()));
        drop(peer);

        let result = tokio::time::timeout(Duration::from_secs(5), demux.join())
            .await
            .unwrap();
        assert!(result.is_ok());
        assert!(!demux.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_stops_tasks() {
        let (conn, _peer) = connected_pair().await;
        let demux = Demultiplexer::start(conn, Arc::new(Dispatcher::new()));
        let _request = demux.dispatcher().register_request::<UploadRecord>();

        demux.shutdown();
        assert_eq!(demux.dispatcher().pending_count(), 0);
        let result = tokio::time::timeout(Duration::from_secs(5), demux.join())
            .await
            .unwrap();
        assert!(result.is_ok());
    }
}
