//! Local stream transport
//!
//! Two endpoint pairs, both carrying length-prefixed messages over loopback TCP:
//! - samples: `SampleSender` (producer, listens) -> `SampleReceiver` (coordinator, dials)
//! - commands: `CommandRequester` (coordinator, dials) -> `CommandResponder` (producer, listens)
//!
//! Listeners take the first free port in the configured range and report it so
//! the remote side can dial it.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::protocol::{CommandReply, CommandRequest, ProtocolError, ERROR_REPLY};

use super::error::NetworkError;
use super::framing::{read_message, write_message};
use super::message::MessageBuffer;
use super::runtime::TransportRuntime;

/// Backlog for listening sockets
const LISTEN_BACKLOG: i32 = 16;

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Loopback address endpoints bind and dial on
    pub bind_host: String,
    /// First port a listener tries (must be >= 1)
    pub port_range_start: u16,
    /// Last port a listener tries
    pub port_range_end: u16,
    /// How long a sample poll waits for a block before reporting "not ready"
    pub receive_timeout_ms: u64,
    /// Blocks queued on the producer side before sends fail
    pub send_queue_depth: usize,
    /// Blocks buffered on the coordinator side before the socket backs up
    pub receive_queue_depth: usize,
    /// Largest accepted message body in bytes
    pub max_message_size: usize,
    /// Dial timeout
    pub connect_timeout_ms: u64,
    /// Upper bound on a single command round trip
    pub command_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port_range_start: 49152,
            port_range_end: 65535,
            receive_timeout_ms: 100,
            send_queue_depth: 1000,
            receive_queue_depth: 1000,
            max_message_size: 64 * 1024 * 1024,
            connect_timeout_ms: 2000,
            command_timeout_ms: 5000,
        }
    }
}

impl TransportConfig {
    /// Validate and normalize the configuration
    ///
    /// - port range starts at 1 or above and is not inverted
    /// - queue depths are at least 1
    /// - timeouts are at least 1 ms
    pub fn validated(self) -> Self {
        let port_range_start = self.port_range_start.max(1);
        let port_range_end = self.port_range_end.max(port_range_start);

        Self {
            port_range_start,
            port_range_end,
            receive_timeout_ms: self.receive_timeout_ms.max(1),
            send_queue_depth: self.send_queue_depth.max(1),
            receive_queue_depth: self.receive_queue_depth.max(1),
            max_message_size: self.max_message_size.max(1),
            connect_timeout_ms: self.connect_timeout_ms.max(1),
            command_timeout_ms: self.command_timeout_ms.max(1),
            ..self
        }
    }

    pub fn host(&self) -> Result<IpAddr, NetworkError> {
        Ok(self.bind_host.parse()?)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Bind a listening socket on the first free port in the configured range
fn listen_first_free(
    runtime: &TransportRuntime,
    config: &TransportConfig,
) -> Result<(TcpListener, u16), NetworkError> {
    let host = config.host()?;

    for port in config.port_range_start..=config.port_range_end {
        match bind_listener(SocketAddr::new(host, port)) {
            Ok(listener) => {
                let _guard = runtime.handle().enter();
                return Ok((TcpListener::from_std(listener)?, port));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(NetworkError::NoFreePort {
        start: config.port_range_start,
        end: config.port_range_end,
    })
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    // Allow quick re-listen after a producer closes. Windows SO_REUSEADDR would
    // also let two live listeners share a port, which breaks port scanning.
    #[cfg(unix)]
    socket.set_reuse_address(true)?;

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Dial a listener on `port`
fn dial(
    runtime: &TransportRuntime,
    config: &TransportConfig,
    port: u16,
) -> Result<TcpStream, NetworkError> {
    let addr = SocketAddr::new(config.host()?, port);
    let wait = config.connect_timeout();
    // Timers need the runtime context, so every timeout is built inside the future
    let stream = runtime
        .block_on(async { timeout(wait, TcpStream::connect(addr)).await })
        .map_err(|_| NetworkError::ConnectionTimeout)??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Producer side of the sample pair
///
/// Sends never block: a block is queued for the writer task or rejected.
pub struct SampleSender {
    runtime: Arc<TransportRuntime>,
    port: u16,
    queue: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    peer_connected: watch::Receiver<bool>,
    blocks_sent: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SampleSender {
    /// Open and listen on the first free port
    pub fn listen(config: &TransportConfig) -> Result<Self, NetworkError> {
        let runtime = TransportRuntime::acquire()?;
        let (listener, port) = listen_first_free(&runtime, config)?;

        let (queue_tx, queue_rx) = mpsc::channel(config.send_queue_depth);
        let (connected_tx, connected_rx) = watch::channel(false);
        let blocks_sent = Arc::new(AtomicU64::new(0));

        let task = runtime.spawn(serve_samples(
            listener,
            port,
            queue_rx,
            connected_tx,
            blocks_sent.clone(),
        ));

        info!("Samples endpoint listening on port {}", port);

        Ok(Self {
            runtime,
            port,
            queue: Mutex::new(Some(queue_tx)),
            peer_connected: connected_rx,
            blocks_sent,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_open(&self) -> bool {
        self.queue.lock().is_some()
    }

    pub fn is_peer_connected(&self) -> bool {
        *self.peer_connected.borrow()
    }

    /// Block the calling thread until a receiver has connected
    pub fn wait_for_peer(&self, wait: Duration) -> bool {
        let mut connected = self.peer_connected.clone();
        self.runtime.block_on(async {
            timeout(wait, connected.wait_for(|c| *c))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false)
        })
    }

    /// Number of blocks written to the socket so far
    pub fn blocks_sent(&self) -> u64 {
        self.blocks_sent.load(Ordering::Relaxed)
    }

    /// Queue one block for delivery without blocking
    pub fn send_block(&self, body: Vec<u8>) -> Result<(), NetworkError> {
        if !self.is_peer_connected() {
            return Err(NetworkError::NotConnected);
        }

        let queue = self.queue.lock();
        let queue = queue.as_ref().ok_or(NetworkError::NotConnected)?;
        queue.try_send(body).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::SendBufferFull,
            mpsc::error::TrySendError::Closed(_) => NetworkError::NotConnected,
        })
    }

    /// Stop listening and drop the peer. Idempotent.
    pub fn close(&self) {
        let queue = self.queue.lock().take();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        if queue.is_some() {
            info!("Samples endpoint on port {} closed", self.port);
        }
    }
}

impl Drop for SampleSender {
    fn drop(&mut self) {
        self.close();
    }
}

async fn serve_samples(
    listener: TcpListener,
    port: u16,
    mut queue: mpsc::Receiver<Vec<u8>>,
    connected: watch::Sender<bool>,
    blocks_sent: Arc<AtomicU64>,
) {
    let mut peer: Option<TcpStream> = None;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                    }
                    if peer.replace(stream).is_some() {
                        debug!("Samples peer on port {} replaced by {}", port, addr);
                    }
                    connected.send_replace(true);
                    info!("Samples peer {} connected on port {}", addr, port);
                }
                Err(e) => {
                    error!("Accept error on samples port {}: {}", port, e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
            body = queue.recv() => {
                let Some(body) = body else {
                    debug!("Samples queue closed, stopping writer for port {}", port);
                    break;
                };
                if let Some(stream) = peer.as_mut() {
                    match write_message(stream, &body).await {
                        Ok(()) => {
                            blocks_sent.fetch_add(1, Ordering::Relaxed);
                            trace!("Sent {} byte block on port {}", body.len(), port);
                        }
                        Err(e) => {
                            warn!("Samples peer on port {} lost: {}", port, e);
                            peer = None;
                            connected.send_replace(false);
                        }
                    }
                }
            }
        }
    }
}

/// Coordinator side of the sample pair
pub struct SampleReceiver {
    runtime: Arc<TransportRuntime>,
    port: u16,
    queue: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SampleReceiver {
    /// Open and dial the producer's samples port
    pub fn dial(port: u16, config: &TransportConfig) -> Result<Self, NetworkError> {
        let runtime = TransportRuntime::acquire()?;
        let stream = dial(&runtime, config, port)?;

        let (queue_tx, queue_rx) = mpsc::channel(config.receive_queue_depth);
        let task = runtime.spawn(receive_samples(
            stream,
            port,
            config.max_message_size,
            queue_tx,
        ));

        info!("Samples endpoint dialled port {}", port);

        Ok(Self {
            runtime,
            port,
            queue: Mutex::new(Some(queue_rx)),
            task: Mutex::new(Some(task)),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_open(&self) -> bool {
        self.queue.lock().is_some()
    }

    /// Take the next block, waiting at most `wait`
    ///
    /// `Ok(None)` means nothing arrived in time. Once the producer has gone and
    /// every buffered block has been taken, returns `Disconnected`.
    pub fn receive_block(&self, wait: Duration) -> Result<Option<MessageBuffer>, NetworkError> {
        let mut queue = self.queue.lock();
        let queue = queue.as_mut().ok_or(NetworkError::NotConnected)?;

        match queue.try_recv() {
            Ok(body) => return Ok(Some(MessageBuffer::from(body))),
            Err(mpsc::error::TryRecvError::Disconnected) => return Err(NetworkError::Disconnected),
            Err(mpsc::error::TryRecvError::Empty) if wait.is_zero() => return Ok(None),
            Err(mpsc::error::TryRecvError::Empty) => {}
        }

        match self.runtime.block_on(async { timeout(wait, queue.recv()).await }) {
            Ok(Some(body)) => Ok(Some(MessageBuffer::from(body))),
            Ok(None) => Err(NetworkError::Disconnected),
            Err(_) => Ok(None),
        }
    }

    /// Release the connection. Idempotent.
    pub fn close(&self) {
        let queue = self.queue.lock().take();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        if queue.is_some() {
            info!("Samples endpoint for port {} closed", self.port);
        }
    }
}

impl Drop for SampleReceiver {
    fn drop(&mut self) {
        self.close();
    }
}

async fn receive_samples(
    mut stream: TcpStream,
    port: u16,
    max_message_size: usize,
    queue: mpsc::Sender<Vec<u8>>,
) {
    loop {
        match read_message(&mut stream, max_message_size).await {
            Ok(Some(body)) => {
                trace!("Received {} byte block from port {}", body.len(), port);
                if queue.send(body).await.is_err() {
                    debug!("Samples queue closed, stopping reader for port {}", port);
                    break;
                }
            }
            Ok(None) => {
                info!("Samples producer on port {} closed the connection", port);
                break;
            }
            Err(e) => {
                error!("Receive error on samples port {}: {}", port, e);
                break;
            }
        }
    }
}

/// Coordinator side of the command pair
///
/// Requests are strictly one at a time; each blocks until its reply arrives.
pub struct CommandRequester {
    runtime: Arc<TransportRuntime>,
    port: u16,
    stream: Mutex<Option<TcpStream>>,
    max_message_size: usize,
    command_timeout: Duration,
}

impl CommandRequester {
    /// Open and dial the producer's command port
    pub fn dial(port: u16, config: &TransportConfig) -> Result<Self, NetworkError> {
        let runtime = TransportRuntime::acquire()?;
        let stream = dial(&runtime, config, port)?;

        info!("Command endpoint dialled port {}", port);

        Ok(Self {
            runtime,
            port,
            stream: Mutex::new(Some(stream)),
            max_message_size: config.max_message_size,
            command_timeout: config.command_timeout(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_open(&self) -> bool {
        self.stream.lock().is_some()
    }

    /// Send a raw request and wait for the raw reply
    pub fn request(&self, body: &[u8]) -> Result<MessageBuffer, NetworkError> {
        let mut guard = self.stream.lock();
        let stream = guard.as_mut().ok_or(NetworkError::NotConnected)?;
        let max = self.max_message_size;

        let result = self.runtime.block_on(async {
            timeout(self.command_timeout, async {
                write_message(stream, body).await?;
                read_message(stream, max)
                    .await?
                    .ok_or(NetworkError::Disconnected)
            })
            .await
            .map_err(|_| NetworkError::CommandTimeout)?
        });

        match result {
            Ok(reply) => Ok(MessageBuffer::from(reply)),
            Err(e) => {
                // A late reply would be read as the answer to the next request
                warn!("Command connection to port {} dropped: {}", self.port, e);
                *guard = None;
                Err(e)
            }
        }
    }

    /// Issue a command and decode its reply
    pub fn do_command(&self, request: &CommandRequest) -> Result<CommandReply, NetworkError> {
        let command = request.command();
        debug!("Sending {:?} to command port {}", command, self.port);

        let reply = self.request(&request.to_bytes())?;
        Ok(CommandReply::decode(command, reply.as_slice())?)
    }

    /// Release the connection. Idempotent.
    pub fn close(&self) {
        if self.stream.lock().take().is_some() {
            info!("Command endpoint for port {} closed", self.port);
        }
    }
}

impl Drop for CommandRequester {
    fn drop(&mut self) {
        self.close();
    }
}

/// Computes replies on the producer side
///
/// Runs on a blocking worker thread, never on the audio thread.
pub trait CommandHandler: Send + Sync + 'static {
    fn handle(&self, request: CommandRequest) -> Result<CommandReply, ProtocolError>;
}

/// Producer side of the command pair
pub struct CommandResponder {
    _runtime: Arc<TransportRuntime>,
    port: u16,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CommandResponder {
    /// Open, listen on the first free port and start answering requests
    pub fn listen(
        handler: Arc<dyn CommandHandler>,
        config: &TransportConfig,
    ) -> Result<Self, NetworkError> {
        let runtime = TransportRuntime::acquire()?;
        let (listener, port) = listen_first_free(&runtime, config)?;

        let task = runtime.spawn(serve_commands(
            listener,
            port,
            handler,
            config.max_message_size,
        ));

        info!("Command endpoint listening on port {}", port);

        Ok(Self {
            _runtime: runtime,
            port,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_open(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Stop listening and drop every requester connection. Idempotent.
    pub fn close(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!("Command endpoint on port {} closed", self.port);
        }
    }
}

impl Drop for CommandResponder {
    fn drop(&mut self) {
        self.close();
    }
}

async fn serve_commands(
    listener: TcpListener,
    port: u16,
    handler: Arc<dyn CommandHandler>,
    max_message_size: usize,
) {
    // Dropped with this task, which aborts every connection
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Command requester {} connected on port {}", addr, port);
                    connections.spawn(respond(stream, handler.clone(), max_message_size));
                }
                Err(e) => {
                    error!("Accept error on command port {}: {}", port, e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

/// Responder loop states
enum ResponderState {
    Receive,
    Handle(Vec<u8>),
    Send(Vec<u8>),
    Closed,
}

async fn respond(mut stream: TcpStream, handler: Arc<dyn CommandHandler>, max_message_size: usize) {
    let mut state = ResponderState::Receive;

    loop {
        state = match state {
            ResponderState::Receive => match read_message(&mut stream, max_message_size).await {
                Ok(Some(request)) => ResponderState::Handle(request),
                Ok(None) => ResponderState::Closed,
                Err(e) => {
                    warn!("Command receive failed: {}", e);
                    ResponderState::Closed
                }
            },
            ResponderState::Handle(request) => {
                let handler = handler.clone();
                let reply = tokio::task::spawn_blocking(move || answer(handler.as_ref(), &request))
                    .await
                    .unwrap_or_else(|e| {
                        error!("Command handler panicked: {}", e);
                        vec![ERROR_REPLY]
                    });
                ResponderState::Send(reply)
            }
            ResponderState::Send(reply) => match write_message(&mut stream, &reply).await {
                Ok(()) => ResponderState::Receive,
                Err(e) => {
                    warn!("Command reply failed: {}", e);
                    ResponderState::Closed
                }
            },
            ResponderState::Closed => break,
        };
    }
}

/// Every request gets a reply, even if only the error byte
fn answer(handler: &dyn CommandHandler, request: &[u8]) -> Vec<u8> {
    let request = match CommandRequest::from_bytes(request) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejecting malformed command: {}", e);
            return vec![ERROR_REPLY];
        }
    };

    let command = request.command();
    match handler.handle(request) {
        Ok(reply) => {
            debug!("Answered {:?}", command);
            reply.to_bytes()
        }
        Err(e) => {
            warn!("Handler rejected {:?}: {}", command, e);
            vec![ERROR_REPLY]
        }
    }
}
