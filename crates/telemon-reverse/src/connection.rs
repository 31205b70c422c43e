//! One live broker channel.
//!
//! A `Connection` owns the TLS socket for a single broker, performs the
//! CONNECT introduction, then services broker commands until the broker
//! closes the channel, the context is cancelled, or a failure is classified
//! as something the supervisor has to act on. Transient failures are
//! retried here, behind the connection's own backoff; only `Fatal` and
//! `RefreshCheck` outcomes escape to the supervisor.

use crate::backoff::Backoff;
use crate::codec::{self, CodecError, Command, Frame};
use crate::dispatcher::Dispatcher;
use crate::error::OpError;
use rustls::pki_types::ServerName;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use telemon_check::BrokerConfig;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(5);
/// Outbound queue depth; the reader stops reading when it fills.
pub const QUEUE_DEPTH: usize = 16;
/// The reader resumes once this many queue slots are free again.
const QUEUE_RESUME: usize = QUEUE_DEPTH / 2;
/// Frames buffered per in-flight request between dispatcher and writer.
const REQUEST_PIPELINE: usize = 4;
/// Serving this long resets the backoff to its base delay.
const SERVING_RESET_AFTER: Duration = Duration::from_secs(60);
/// Consecutive synthetic gateway responses before the broker set is
/// presumed stale.
const MAX_DISPATCH_FAILURES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Dialing,
    Introducing,
    Serving,
    Draining,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Dialing => "dialing",
            ConnectionState::Introducing => "introducing",
            ConnectionState::Serving => "serving",
            ConnectionState::Draining => "draining",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOpts {
    pub dispatch_timeout: Duration,
    pub max_backoff: Duration,
}

impl Default for ConnectionOpts {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Serialize)]
struct ConnectHello<'a> {
    name: &'a str,
    version: &'a str,
}

#[derive(Deserialize)]
struct RefusalDoc {
    error: String,
}

/// How a session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// Broker-initiated CLOSE with an empty payload.
    Closed,
    /// Context cancellation.
    Cancelled,
}

/// Sequence ids whose pending responses a RESET discarded. Shared between
/// the reader (inserts) and the writer (skips and prunes).
type ResetSet = Arc<Mutex<HashSet<u32>>>;

/// One entry per inbound REQUEST, in read order. The writer drains each
/// entry's frames before moving to the next, which keeps responses ordered
/// even though dispatches run concurrently.
struct Outbound {
    seq: u32,
    frames: mpsc::Receiver<Frame>,
}

pub struct Connection {
    config: BrokerConfig,
    check_uuid: String,
    agent_version: String,
    dispatcher: Arc<Dispatcher>,
    backoff: Backoff,
    state: ConnectionState,
    serving_since: Option<Instant>,
}

impl Connection {
    pub fn new(
        config: BrokerConfig,
        check_uuid: impl Into<String>,
        agent_address: impl Into<String>,
        opts: ConnectionOpts,
    ) -> Result<Self, OpError> {
        let dispatcher = Dispatcher::new(agent_address.into(), opts.dispatch_timeout)
            .map_err(|e| OpError::Fatal(format!("building local http client: {e}")))?;
        Ok(Self {
            config,
            check_uuid: check_uuid.into(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            dispatcher: Arc::new(dispatcher),
            backoff: Backoff::new(opts.max_backoff),
            state: ConnectionState::Dialing,
            serving_since: None,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            tracing::debug!(cn = %self.config.cn, from = %self.state, to = %next, "connection state");
            self.state = next;
        }
    }

    /// Run the channel until the broker closes it cleanly or the context is
    /// cancelled (`Ok`), or until a failure needs the supervisor
    /// (`Fatal` / `RefreshCheck`). Transient errors redial here after this
    /// connection's backoff.
    pub async fn start(&mut self, token: CancellationToken) -> Result<(), OpError> {
        let mut first_attempt = true;
        loop {
            if token.is_cancelled() {
                self.set_state(ConnectionState::Closed);
                return Ok(());
            }

            if !first_attempt {
                if let Some(since) = self.serving_since.take() {
                    if since.elapsed() >= SERVING_RESET_AFTER {
                        self.backoff.reset();
                    }
                }
                let delay = self.backoff.next_delay();
                tracing::debug!(
                    cn = %self.config.cn,
                    attempt = self.backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "backing off before redial"
                );
                tokio::select! {
                    _ = token.cancelled() => {
                        self.set_state(ConnectionState::Closed);
                        return Ok(());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            first_attempt = false;

            self.set_state(ConnectionState::Dialing);
            let dialed = tokio::select! {
                _ = token.cancelled() => {
                    self.set_state(ConnectionState::Closed);
                    return Ok(());
                }
                res = self.dial() => res,
            };
            let stream = match dialed {
                Ok(stream) => stream,
                Err(OpError::Retry(msg)) => {
                    tracing::warn!(cn = %self.config.cn, error = %msg, "dial failed");
                    continue;
                }
                Err(e) => {
                    self.set_state(ConnectionState::Closed);
                    return Err(e);
                }
            };

            match self.run_session(stream, &token).await {
                Ok(SessionEnd::Closed) | Ok(SessionEnd::Cancelled) => {
                    self.set_state(ConnectionState::Closed);
                    return Ok(());
                }
                Err(OpError::Retry(msg)) => {
                    tracing::warn!(cn = %self.config.cn, error = %msg, "reverse connection interrupted");
                    continue;
                }
                Err(e) => {
                    self.set_state(ConnectionState::Closed);
                    return Err(e);
                }
            }
        }
    }

    async fn dial(&self) -> Result<tokio_rustls::client::TlsStream<TcpStream>, OpError> {
        tracing::debug!(address = %self.config.address, cn = %self.config.cn, "dialing broker");
        let tcp = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            TcpStream::connect(&self.config.address),
        )
        .await
        .map_err(|_| OpError::Retry(format!("dial {} timed out", self.config.address)))?
        .map_err(|e| OpError::Retry(format!("dial {}: {e}", self.config.address)))?;
        let _ = tcp.set_nodelay(true);

        let server_name = ServerName::try_from(self.config.cn.clone())
            .map_err(|e| OpError::Fatal(format!("invalid broker CN '{}': {e}", self.config.cn)))?;
        let connector = TlsConnector::from(self.config.tls.clone());
        let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| OpError::Retry("tls handshake timed out".to_string()))?
            .map_err(|e| classify_tls_error(e, &self.config.cn))?;
        Ok(stream)
    }

    /// Introduce, then serve frames until the session ends. Generic over
    /// the stream so tests can drive it over an in-memory duplex.
    pub(crate) async fn run_session<S>(
        &mut self,
        stream: S,
        token: &CancellationToken,
    ) -> Result<SessionEnd, OpError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut stream = stream;
        self.set_state(ConnectionState::Introducing);
        let introduced = tokio::select! {
            _ = token.cancelled() => {
                self.set_state(ConnectionState::Closed);
                return Ok(SessionEnd::Cancelled);
            }
            res = self.introduce(&mut stream) => res,
        };
        if let Err(e) = introduced {
            self.set_state(ConnectionState::Closed);
            return Err(e);
        }
        self.set_state(ConnectionState::Serving);
        self.serving_since = Some(Instant::now());
        tracing::info!(cn = %self.config.cn, "reverse channel established");

        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let resets: ResetSet = Arc::new(Mutex::new(HashSet::new()));
        let (queue_tx, queue_rx) = mpsc::channel::<Outbound>(QUEUE_DEPTH);
        let mut writer_task = tokio::spawn(write_loop(writer, queue_rx, resets.clone()));
        let dispatch_failures = Arc::new(AtomicU32::new(0));

        let end = loop {
            if dispatch_failures.load(Ordering::Relaxed) >= MAX_DISPATCH_FAILURES {
                break Err(OpError::RefreshCheck(format!(
                    "{MAX_DISPATCH_FAILURES} consecutive local dispatch failures"
                )));
            }

            // Backpressure: with the queue full, resume reading only after
            // half of it has drained.
            if queue_tx.capacity() == 0 {
                tokio::select! {
                    _ = token.cancelled() => break Ok(SessionEnd::Cancelled),
                    permits = queue_tx.reserve_many(QUEUE_RESUME) => match permits {
                        Ok(permits) => drop(permits),
                        Err(_) => break Err(OpError::Retry("response writer terminated".to_string())),
                    }
                }
            }

            let frame = tokio::select! {
                _ = token.cancelled() => break Ok(SessionEnd::Cancelled),
                res = codec::read_frame(&mut reader) => match res {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break Err(OpError::Retry("broker closed the stream".to_string())),
                    Err(CodecError::Io(e)) => {
                        break Err(OpError::Retry(format!("reading frame: {e}")))
                    }
                    Err(e) => break Err(OpError::Retry(format!("protocol error: {e}"))),
                },
            };

            match frame.command {
                Command::Connect => {
                    break Err(OpError::Retry(
                        "protocol error: CONNECT from broker mid-session".to_string(),
                    ));
                }
                Command::Request => {
                    let (frame_tx, frame_rx) = mpsc::channel::<Frame>(REQUEST_PIPELINE);
                    let entry = Outbound {
                        seq: frame.seq,
                        frames: frame_rx,
                    };
                    if queue_tx.send(entry).await.is_err() {
                        break Err(OpError::Retry("response writer terminated".to_string()));
                    }
                    let dispatcher = self.dispatcher.clone();
                    let failures = dispatch_failures.clone();
                    let dispatch_token = token.child_token();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = dispatch_token.cancelled() => {}
                            ok = dispatcher.dispatch(frame.seq, &frame.payload, &frame_tx) => {
                                if ok {
                                    failures.store(0, Ordering::Relaxed);
                                } else {
                                    failures.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                    });
                }
                Command::Reset => {
                    tracing::debug!(seq = frame.seq, "reset, dropping pending responses");
                    resets
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(frame.seq);
                }
                Command::Close => {
                    if frame.payload.is_empty() {
                        tracing::debug!(cn = %self.config.cn, "broker closed the channel");
                        break Ok(SessionEnd::Closed);
                    }
                    let msg = refusal_message(&frame.payload);
                    if is_ownership_error(&msg) {
                        break Err(OpError::RefreshCheck(format!("broker close: {msg}")));
                    }
                    break Err(OpError::Retry(format!("broker close: {msg}")));
                }
            }
        };

        self.set_state(ConnectionState::Draining);
        drop(queue_tx);
        match tokio::time::timeout(DRAIN_DEADLINE, &mut writer_task).await {
            Ok(Ok(Err(e))) => tracing::debug!(error = %e, "write error while draining"),
            Ok(_) => {}
            Err(_) => {
                tracing::debug!("drain deadline exceeded, aborting writer");
                writer_task.abort();
            }
        }
        // Every session exit lands on Closed; a redial starts over at Dialing.
        self.set_state(ConnectionState::Closed);
        end
    }

    async fn introduce<S>(&self, stream: &mut S) -> Result<(), OpError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let hello = serde_json::to_vec(&ConnectHello {
            name: &self.check_uuid,
            version: &self.agent_version,
        })
        .map_err(|e| OpError::Fatal(format!("encoding introduction: {e}")))?;

        let res = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            codec::write_frame(stream, &Frame::new(0, Command::Connect, hello))
                .await
                .map_err(|e| OpError::Retry(format!("sending introduction: {e}")))?;
            stream
                .flush()
                .await
                .map_err(|e| OpError::Retry(format!("sending introduction: {e}")))?;

            let ack = codec::read_frame(stream).await.map_err(|e| match e {
                CodecError::Io(e) => OpError::Retry(format!("reading introduction ack: {e}")),
                e => OpError::Fatal(format!("malformed introduction ack: {e}")),
            })?;
            match ack {
                None => Err(OpError::Retry("broker closed during introduction".to_string())),
                Some(f) if f.command == Command::Connect && f.payload.is_empty() => Ok(()),
                Some(f) if f.command == Command::Connect => Err(OpError::Fatal(
                    "malformed introduction ack (non-empty)".to_string(),
                )),
                Some(f) if f.command == Command::Close => {
                    let msg = refusal_message(&f.payload);
                    if is_ownership_error(&msg) {
                        Err(OpError::RefreshCheck(format!("introduction refused: {msg}")))
                    } else {
                        Err(OpError::Fatal(format!("introduction refused: {msg}")))
                    }
                }
                Some(f) => Err(OpError::Fatal(format!(
                    "unexpected {} frame as introduction ack",
                    f.command
                ))),
            }
        })
        .await;

        match res {
            Ok(inner) => inner,
            Err(_) => Err(OpError::Retry("introduction timed out".to_string())),
        }
    }
}

/// Single writer: drains one outbound entry at a time, skipping entries a
/// RESET cancelled. Frames already written are never retracted.
async fn write_loop<W>(
    mut writer: W,
    mut queue: mpsc::Receiver<Outbound>,
    resets: ResetSet,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut out) = queue.recv().await {
        let mut wrote = false;
        while let Some(frame) = out.frames.recv().await {
            let cancelled = resets
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&out.seq);
            if cancelled {
                break;
            }
            writer.write_all(&codec::encode(&frame)).await?;
            wrote = true;
        }
        if wrote {
            writer.flush().await?;
        }
        // Sequence ids only grow, so completed ones can be pruned.
        resets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|&seq| seq > out.seq);
    }
    let _ = writer.shutdown().await;
    Ok(())
}

fn refusal_message(payload: &[u8]) -> String {
    match serde_json::from_slice::<RefusalDoc>(payload) {
        Ok(doc) => doc.error,
        Err(_) => String::from_utf8_lossy(payload).into_owned(),
    }
}

fn is_ownership_error(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["unknown check", "not the owner", "no such check"]
        .iter()
        .any(|marker| message.contains(marker))
}

fn classify_tls_error(e: std::io::Error, cn: &str) -> OpError {
    let is_cert = e
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .map(|re| matches!(re, rustls::Error::InvalidCertificate(_)))
        .unwrap_or_else(|| e.to_string().to_ascii_lowercase().contains("certificate"));
    if is_cert {
        OpError::Fatal(format!("tls verification against CN '{cn}' failed: {e}"))
    } else {
        OpError::Retry(format!("tls handshake: {e}"))
    }
}
