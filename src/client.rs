//! Client engine: one connection, many concurrent calls.
//!
//! A [`Client`] owns one connection. Calls are multiplexed over it and
//! correlated with their responses by sequence number:
//! 1. Register the call in the pending table and take the next sequence
//! 2. Write the request frame while holding the send lock
//! 3. A background receive task matches each response to its call and
//!    delivers the outcome on the call's completion queue
//!
//! If the connection fails, every pending call is failed with the cause and
//! the client stops accepting new calls.
//!
//! # Example
//!
//! ```no_run
//! use serde::Serialize;
//! use trpc::{Client, Options};
//!
//! #[derive(Serialize)]
//! struct Args {
//!     num1: i64,
//!     num2: i64,
//! }
//!
//! # async fn run() -> trpc::Result<()> {
//! let client = Client::dial("127.0.0.1:9999", Options::default()).await?;
//! let sum: i64 = client.call("Foo.Sum", &Args { num1: 2, num2: 3 }).await?;
//! assert_eq!(sum, 5);
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::CodecType;
use crate::error::{Result, RpcError};
use crate::http::{connect_tunnel, DEFAULT_RPC_PATH};
use crate::protocol::{write_options, FrameReader, FrameWriter, Header, Options, OutboundFrame};

/// Capacity of the completion queue created when `go` is given none.
pub const DEFAULT_COMPLETION_CAPACITY: usize = 10;

/// Outcome of one call, delivered on its completion queue.
#[derive(Debug)]
pub struct Call<R> {
    /// Sequence number assigned at registration (0 if never registered).
    pub seq: u64,
    /// Target in `Service.Method` form.
    pub service_method: String,
    /// Decoded reply, set on success.
    pub reply: Option<R>,
    /// Failure cause, set on error.
    pub error: Option<RpcError>,
}

impl<R> Call<R> {
    /// Convert into the reply or the error.
    pub fn into_result(self) -> Result<R> {
        match (self.error, self.reply) {
            (Some(e), _) => Err(e),
            (None, Some(reply)) => Ok(reply),
            (None, None) => Err(RpcError::ReadingBody("missing reply".to_string())),
        }
    }
}

/// Create a completion queue for [`Client::go`].
///
/// A queue without buffering would let an unread completion stall the
/// receive task, so zero capacity is refused.
pub fn completion_queue<R>(capacity: usize) -> Result<(mpsc::Sender<Call<R>>, mpsc::Receiver<Call<R>>)> {
    if capacity == 0 {
        return Err(RpcError::UnbufferedCompletion);
    }
    Ok(mpsc::channel(capacity))
}

/// Handle to a call issued with [`Client::go`].
#[derive(Debug)]
pub struct AsyncCall<R> {
    seq: u64,
    service_method: String,
    done: Option<mpsc::Receiver<Call<R>>>,
}

impl<R> AsyncCall<R> {
    /// Sequence number of the call (0 if it failed before registration).
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Target in `Service.Method` form.
    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Wait for the outcome.
    ///
    /// Only available when `go` created the completion queue; returns `None`
    /// when the caller supplied its own.
    pub async fn done(&mut self) -> Option<Call<R>> {
        self.done.as_mut()?.recv().await
    }
}

/// A registered call waiting for its response, with its reply type erased.
trait PendingCall: Send {
    /// Decode the response body into the reply and deliver it.
    fn complete(self: Box<Self>, codec: CodecType, body: &[u8]);

    /// Deliver a failure.
    fn fail(self: Box<Self>, error: RpcError);
}

struct TypedCall<R> {
    seq: u64,
    service_method: String,
    done: mpsc::Sender<Call<R>>,
}

impl<R: Send + 'static> TypedCall<R> {
    fn deliver(self, reply: Option<R>, error: Option<RpcError>) {
        let call = Call {
            seq: self.seq,
            service_method: self.service_method,
            reply,
            error,
        };
        // The receive task never waits on a slow consumer; a completion that
        // finds the queue full waits on its own task until there is room.
        if let Err(mpsc::error::TrySendError::Full(call)) = self.done.try_send(call) {
            tracing::trace!("rpc client: completion queue full, deferring seq {}", call.seq);
            let done = self.done;
            tokio::spawn(async move {
                let _ = done.send(call).await;
            });
        }
    }
}

impl<R: DeserializeOwned + Send + 'static> PendingCall for TypedCall<R> {
    fn complete(self: Box<Self>, codec: CodecType, body: &[u8]) {
        match codec.decode::<R>(body) {
            Ok(reply) => (*self).deliver(Some(reply), None),
            Err(e) => (*self).deliver(None, Some(RpcError::ReadingBody(e.to_string()))),
        }
    }

    fn fail(self: Box<Self>, error: RpcError) {
        (*self).deliver(None, Some(error));
    }
}

/// Pending-call table and lifecycle flags, guarded by one lock.
struct State {
    seq: u64,
    pending: HashMap<u64, Box<dyn PendingCall>>,
    closing: bool,
    shutdown: bool,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Inner {
    codec: CodecType,
    /// Send lock; held from registration through the end of the write.
    sending: tokio::sync::Mutex<FrameWriter<BoxedWriter>>,
    state: Mutex<State>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a call and assign it the next sequence number.
    ///
    /// Returns `None` without building the call if the client no longer
    /// accepts calls.
    fn register_call(&self, call: impl FnOnce(u64) -> Box<dyn PendingCall>) -> Option<u64> {
        let mut state = self.state();
        if state.closing || state.shutdown {
            return None;
        }

        let seq = state.seq;
        state.pending.insert(seq, call(seq));
        state.seq += 1;
        Some(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<Box<dyn PendingCall>> {
        self.state().pending.remove(&seq)
    }

    /// Mark the client shut down and fail every pending call.
    fn terminate_calls(&self, cause: &RpcError) {
        let (closing, pending) = {
            let mut state = self.state();
            state.shutdown = true;
            (state.closing, std::mem::take(&mut state.pending))
        };

        if !closing && !pending.is_empty() {
            tracing::debug!("rpc client: failing {} pending calls: {}", pending.len(), cause);
        }
        for (_, call) in pending {
            let error = if closing {
                RpcError::Shutdown
            } else if matches!(cause, RpcError::ConnectionClosed) {
                RpcError::ConnectionClosed
            } else {
                RpcError::ConnectionLost(cause.to_string())
            };
            call.fail(error);
        }
    }
}

/// An RPC client bound to one connection.
///
/// Safe to share between tasks (`Arc<Client>`); calls from different tasks
/// are multiplexed over the same connection.
pub struct Client {
    inner: Arc<Inner>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Start a client over an already-open connection.
    ///
    /// Sends the option handshake, then starts the receive task.
    pub async fn new<S>(stream: S, options: Options) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        if let Err(e) = write_options(&mut write_half, &options).await {
            tracing::error!("rpc client: options error: {}", e);
            return Err(e);
        }

        let codec = options.codec_type;
        let writer: BoxedWriter = Box::new(write_half);
        let inner = Arc::new(Inner {
            codec,
            sending: tokio::sync::Mutex::new(FrameWriter::new(writer, codec)),
            state: Mutex::new(State {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });

        let reader = FrameReader::new(read_half, codec);
        let receiver = tokio::spawn(receive(inner.clone(), reader));

        Ok(Self {
            inner,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Dial a TCP address.
    ///
    /// Connecting plus handshake is bounded by `options.connect_timeout`.
    pub async fn dial<A: ToSocketAddrs>(addr: A, options: Options) -> Result<Self> {
        let timeout = options.connect_timeout;
        with_connect_timeout(timeout, async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Self::new(stream, options).await
        })
        .await
    }

    /// Dial a Unix domain socket.
    #[cfg(unix)]
    pub async fn dial_unix<P: AsRef<std::path::Path>>(path: P, options: Options) -> Result<Self> {
        let timeout = options.connect_timeout;
        with_connect_timeout(timeout, async move {
            let stream = tokio::net::UnixStream::connect(path).await?;
            Self::new(stream, options).await
        })
        .await
    }

    /// Dial a server's HTTP endpoint and tunnel through `CONNECT`.
    pub async fn dial_http<A: ToSocketAddrs>(addr: A, options: Options) -> Result<Self> {
        let timeout = options.connect_timeout;
        with_connect_timeout(timeout, async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            let mut stream = BufReader::new(stream);
            connect_tunnel(&mut stream, DEFAULT_RPC_PATH).await?;
            Self::new(stream, options).await
        })
        .await
    }

    /// Dial an address of the form `protocol@address`.
    ///
    /// Supported protocols are `tcp`, `http` and (on Unix) `unix`.
    pub async fn xdial(rpc_addr: &str, options: Options) -> Result<Self> {
        let (protocol, addr) = rpc_addr
            .split_once('@')
            .ok_or_else(|| RpcError::InvalidAddress(rpc_addr.to_string()))?;

        match protocol {
            "tcp" => Self::dial(addr, options).await,
            "http" => Self::dial_http(addr, options).await,
            #[cfg(unix)]
            "unix" => Self::dial_unix(addr, options).await,
            _ => Err(RpcError::InvalidAddress(rpc_addr.to_string())),
        }
    }

    /// Codec negotiated for this connection.
    pub fn codec(&self) -> CodecType {
        self.inner.codec
    }

    /// Whether the client still accepts calls.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state();
        !state.closing && !state.shutdown
    }

    /// Issue a call without waiting for it.
    ///
    /// The outcome is delivered on `done`, or on a queue of
    /// [`DEFAULT_COMPLETION_CAPACITY`] created here when `done` is `None`.
    /// Failures before the request reaches the wire (client shut down,
    /// argument not encodable, write error) are delivered the same way.
    pub async fn go<A, R>(&self, service_method: &str, args: &A, done: Option<mpsc::Sender<Call<R>>>) -> AsyncCall<R>
    where
        A: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let (done, own) = match done {
            Some(done) => (done, None),
            None => {
                let (tx, rx) = mpsc::channel(DEFAULT_COMPLETION_CAPACITY);
                (tx, Some(rx))
            }
        };

        let seq = self.send(service_method, args, done).await;
        AsyncCall {
            seq,
            service_method: service_method.to_string(),
            done: own,
        }
    }

    /// Issue a call and wait for its reply.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let (tx, mut rx) = completion_queue(1)?;
        let seq = self.send(service_method, args, tx).await;

        match rx.recv().await {
            Some(call) => call.into_result(),
            None => {
                tracing::debug!("rpc client: call {} (seq {}) dropped", service_method, seq);
                Err(RpcError::Shutdown)
            }
        }
    }

    /// Like [`call`](Self::call), but give up after `deadline`.
    ///
    /// On expiry the call is removed from the pending table, so a late
    /// response is discarded.
    pub async fn call_timeout<A, R>(&self, service_method: &str, args: &A, deadline: Duration) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let (tx, mut rx) = completion_queue(1)?;
        let seq = self.send(service_method, args, tx).await;

        match tokio::time::timeout(deadline, rx.recv()).await {
            Ok(Some(call)) => call.into_result(),
            Ok(None) => Err(RpcError::Shutdown),
            Err(_) => {
                self.inner.remove_call(seq);
                Err(RpcError::CallTimeout(deadline))
            }
        }
    }

    /// Close the connection.
    ///
    /// Pending calls fail with [`RpcError::Shutdown`]. A second close
    /// returns [`RpcError::Shutdown`].
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state();
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }

        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(receiver) = receiver {
            receiver.abort();
        }

        let result = self.inner.sending.lock().await.shutdown().await;
        self.inner.terminate_calls(&RpcError::Shutdown);
        result
    }

    /// Register the call and write its request under the send lock.
    ///
    /// Returns the assigned sequence number (0 if registration failed).
    async fn send<A, R>(&self, service_method: &str, args: &A, done: mpsc::Sender<Call<R>>) -> u64
    where
        A: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let mut writer = self.inner.sending.lock().await;

        let mut rejected = Some(done.clone());
        let registered = self.inner.register_call(|seq| {
            rejected = None;
            let call: Box<dyn PendingCall> = Box::new(TypedCall {
                seq,
                service_method: service_method.to_string(),
                done,
            });
            call
        });

        let seq = match registered {
            Some(seq) => seq,
            None => {
                if let Some(done) = rejected {
                    let call = TypedCall {
                        seq: 0,
                        service_method: service_method.to_string(),
                        done,
                    };
                    call.deliver(None, Some(RpcError::Shutdown));
                }
                return 0;
            }
        };

        let header = Header::request(service_method, seq);
        let frame = match OutboundFrame::encode(self.inner.codec, &header, args) {
            Ok(frame) => frame,
            Err(e) => {
                // Nothing reached the wire; only this call fails.
                if let Some(call) = self.inner.remove_call(seq) {
                    call.fail(e);
                }
                return seq;
            }
        };

        if let Err(e) = writer.write_frame(&frame).await {
            tracing::error!("rpc client: write of {} (seq {}) failed: {}", service_method, seq, e);
            // A partial frame may be on the wire: the connection is done.
            // The receive task may already have failed the call.
            let call = self.inner.remove_call(seq);
            self.inner.terminate_calls(&e);
            if let Some(call) = call {
                call.fail(e);
            }
        }
        seq
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(receiver) = self
            .receiver
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            receiver.abort();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("Client")
            .field("codec", &self.inner.codec)
            .field("next_seq", &state.seq)
            .field("pending", &state.pending.len())
            .field("closing", &state.closing)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

/// Receive loop: route each response to its pending call.
async fn receive<R>(inner: Arc<Inner>, mut reader: FrameReader<R>)
where
    R: AsyncRead + Unpin,
{
    let codec = reader.codec();
    let cause = loop {
        let header = match reader.read_header().await {
            Ok(Some(header)) => header,
            Ok(None) => break RpcError::ConnectionClosed,
            Err(e) => break e,
        };

        let result = match inner.remove_call(header.seq) {
            // Abandoned or already failed locally.
            None => reader.discard_body().await,
            Some(call) if header.is_error() => {
                call.fail(RpcError::Remote(header.error));
                reader.discard_body().await
            }
            Some(call) => match reader.read_body().await {
                Ok(body) => {
                    call.complete(codec, &body);
                    Ok(())
                }
                Err(e) => {
                    call.fail(RpcError::ReadingBody(e.to_string()));
                    Err(e)
                }
            },
        };

        if let Err(e) = result {
            break e;
        }
    };

    if !matches!(cause, RpcError::ConnectionClosed) {
        tracing::debug!("rpc client: receive loop ended: {}", cause);
    }
    inner.terminate_calls(&cause);
}

async fn with_connect_timeout<F, T>(timeout: Duration, connect: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if timeout.is_zero() {
        return connect.await;
    }
    tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| RpcError::ConnectTimeout(timeout))?
}
