use std::collections::VecDeque;
use std::net::SocketAddr;
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use std::{fmt, future, io, mem};

use backoff::backoff::Backoff as _;
use backoff::ExponentialBackoff;
use futures::future::BoxFuture;
use futures::{FutureExt as _, SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use url::Url;

use weft_logging::err_with_src;
use weft_model::OverlayId;

use crate::session::SessionConfig;
use crate::wire::{
    DirectedMessage, Empty, MessageKind, PeerAddress, Presence, PresenceStatus, WireMessage,
};

pub use tokio_tungstenite::tungstenite::http::StatusCode;

// If the session is up these never build up; when it is down we would rather
// probe again than replay a backlog.
const MAX_BUFFERED_MESSAGES: usize = 32;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// One overlay's client session with the presence/message service.
///
/// Sans-IO-ish: [`poll`](PresenceChannel::poll) drives connecting, sending,
/// receiving and heartbeats; sends are buffered until the socket is writable.
/// All state lives on the overlay's transport task.
pub struct PresenceChannel {
    state: State,
    waker: Option<Waker>,
    pending_messages: VecDeque<String>,

    heartbeat: tokio::time::Interval,

    overlay_id: OverlayId,
    self_addr: PeerAddress,
    url: Url,
    tls: std::sync::Arc<rustls::ClientConfig>,
    resolved_addresses: Vec<SocketAddr>,

    make_reconnect_backoff: Box<dyn Fn() -> ExponentialBackoff + Send>,
    reconnect_backoff: Option<ExponentialBackoff>,
}

enum State {
    Connected(WebSocketStream<MaybeTlsStream<TcpStream>>),
    Connecting(
        BoxFuture<'static, Result<WebSocketStream<MaybeTlsStream<TcpStream>>, InternalError>>,
    ),
    Closing(WebSocketStream<MaybeTlsStream<TcpStream>>),
    Closed,
}

#[derive(Debug)]
pub enum Event {
    /// The websocket is up; the caller should assert its presence.
    SessionEstablished,
    /// A foreign presence stanza.
    PresenceReceived {
        from: PeerAddress,
        status: PresenceStatus,
    },
    /// A directed message addressed to us.
    MessageReceived {
        from: PeerAddress,
        kind: MessageKind,
        body: String,
    },
    HeartbeatSent,
    /// A transient failure; the channel reconnects on its own.
    Hiccup {
        backoff: Duration,
        error: anyhow::Error,
    },
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Presence service rejected the session: {0}")]
    Client(StatusCode),
    #[error("Lost the presence session and hit the max-retry limit. Last error: {final_error}")]
    MaxRetriesReached { final_error: String },
}

impl Error {
    pub fn is_authentication_error(&self) -> bool {
        match self {
            Error::Client(s) => s == &StatusCode::UNAUTHORIZED || s == &StatusCode::FORBIDDEN,
            Error::MaxRetriesReached { .. } => false,
        }
    }
}

#[derive(Debug)]
enum InternalError {
    WebSocket(tokio_tungstenite::tungstenite::Error),
    Serde(serde_json::Error),
    StreamClosed,
    SocketConnection(Vec<(SocketAddr, io::Error)>),
    Timeout { duration: Duration },
}

impl fmt::Display for InternalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InternalError::WebSocket(tokio_tungstenite::tungstenite::Error::Http(http)) => {
                let status = http.status();
                let body = http
                    .body()
                    .as_deref()
                    .map(String::from_utf8_lossy)
                    .unwrap_or_default();

                write!(f, "http error: {status} - {body}")
            }
            InternalError::WebSocket(_) => write!(f, "websocket connection failed"),
            InternalError::Serde(_) => write!(f, "failed to deserialize message"),
            InternalError::StreamClosed => write!(f, "websocket stream was closed"),
            InternalError::SocketConnection(errors) => {
                write!(f, "failed to connect socket: [")?;
                for (i, (addr, e)) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{addr}: {e}")?;
                }
                write!(f, "]")
            }
            InternalError::Timeout { duration } => {
                write!(f, "operation timed out after {duration:?}")
            }
        }
    }
}

impl std::error::Error for InternalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InternalError::WebSocket(tokio_tungstenite::tungstenite::Error::Http(_)) => None,
            InternalError::WebSocket(e) => Some(e),
            InternalError::Serde(e) => Some(e),
            InternalError::StreamClosed => None,
            InternalError::SocketConnection(_) => None,
            InternalError::Timeout { .. } => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Cannot close the channel while it is connecting")]
pub struct Connecting;

impl PresenceChannel {
    /// Creates the channel in the `Closed` state; call
    /// [`connect`](Self::connect) to bring the session up.
    pub fn disconnected(
        config: &SessionConfig,
        resolved_addresses: Vec<SocketAddr>,
        make_reconnect_backoff: impl Fn() -> ExponentialBackoff + Send + 'static,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            state: State::Closed,
            waker: None,
            pending_messages: VecDeque::with_capacity(MAX_BUFFERED_MESSAGES),
            heartbeat: tokio::time::interval(HEARTBEAT_INTERVAL),
            overlay_id: config.overlay_id.clone(),
            self_addr: PeerAddress::new(&config.node_id, &config.host),
            url: config.login_url(),
            tls: config.tls_config()?,
            resolved_addresses,
            make_reconnect_backoff: Box::new(make_reconnect_backoff),
            reconnect_backoff: None,
        })
    }

    pub fn self_addr(&self) -> &PeerAddress {
        &self.self_addr
    }

    /// Establishes a new connection, dropping the current one if any exists.
    pub fn connect(&mut self) {
        if matches!(self.state, State::Connecting(_)) {
            tracing::debug!("We are already connecting");
            return;
        }

        self.reconnect_backoff = None;
        self.state = State::Connecting(
            connect_websocket(
                self.url.clone(),
                self.resolved_addresses.clone(),
                self.tls.clone(),
            )
            .boxed(),
        );

        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    /// Queues a presence stanza; `to` narrows it to one node (`uid?` probes).
    pub fn send_presence(&mut self, status: PresenceStatus, to: Option<PeerAddress>) {
        self.send(WireMessage::Presence(Presence {
            from: self.self_addr.clone(),
            to,
            status: status.to_string(),
        }));
    }

    /// Queues a directed message.
    pub fn send_message(&mut self, to: PeerAddress, kind: MessageKind, body: String) {
        self.send(WireMessage::Message(DirectedMessage {
            from: self.self_addr.clone(),
            to,
            kind,
            body,
        }));
    }

    fn send(&mut self, message: WireMessage) {
        if self.pending_messages.len() > MAX_BUFFERED_MESSAGES {
            self.pending_messages.clear();

            tracing::warn!(
                overlay = %self.overlay_id.brief(),
                "Dropping pending messages: exceeded the maximum of {MAX_BUFFERED_MESSAGES}"
            );
        }

        match serde_json::to_string(&message) {
            Ok(json) => {
                self.pending_messages.push_back(json);
                if let Some(waker) = self.waker.take() {
                    waker.wake();
                }
            }
            Err(e) => {
                tracing::warn!("Failed to serialize outbound message: {}", err_with_src(&e));
            }
        }
    }

    /// Initiates a graceful close of the session.
    pub fn close(&mut self) -> Result<(), Connecting> {
        tracing::info!(overlay = %self.overlay_id.brief(), "Closing presence session");

        match mem::replace(&mut self.state, State::Closed) {
            State::Connecting(_) => return Err(Connecting),
            State::Closing(stream) | State::Connected(stream) => {
                self.state = State::Closing(stream);
            }
            State::Closed => {}
        }

        Ok(())
    }

    pub fn poll(&mut self, cx: &mut Context) -> Poll<Result<Event, Error>> {
        loop {
            let stream = match &mut self.state {
                State::Closed => return Poll::Ready(Ok(Event::Closed)),
                State::Closing(stream) => match stream.poll_close_unpin(cx) {
                    Poll::Ready(Ok(())) => {
                        self.state = State::Closed;

                        return Poll::Ready(Ok(Event::Closed));
                    }
                    Poll::Ready(Err(e)) => {
                        tracing::warn!("Error while closing websocket: {}", err_with_src(&e));

                        return Poll::Ready(Ok(Event::Closed));
                    }
                    Poll::Pending => return Poll::Pending,
                },
                State::Connected(stream) => stream,
                State::Connecting(future) => match future.poll_unpin(cx) {
                    Poll::Ready(Ok(stream)) => {
                        self.reconnect_backoff = None;
                        self.heartbeat.reset();
                        self.state = State::Connected(stream);

                        tracing::info!(
                            overlay = %self.overlay_id.brief(),
                            addr = %self.self_addr,
                            "Presence session established"
                        );

                        return Poll::Ready(Ok(Event::SessionEstablished));
                    }
                    Poll::Ready(Err(InternalError::WebSocket(
                        tokio_tungstenite::tungstenite::Error::Http(r),
                    ))) if r.status().is_client_error() => {
                        return Poll::Ready(Err(Error::Client(r.status())));
                    }
                    Poll::Ready(Err(e)) => {
                        let backoff = match self.reconnect_backoff.as_mut() {
                            Some(backoff) => {
                                backoff
                                    .next_backoff()
                                    .ok_or_else(|| Error::MaxRetriesReached {
                                        final_error: err_with_src(&e).to_string(),
                                    })?
                            }
                            None => {
                                self.reconnect_backoff = Some((self.make_reconnect_backoff)());

                                Duration::ZERO
                            }
                        };

                        let url = self.url.clone();
                        let addresses = self.resolved_addresses.clone();
                        let tls = self.tls.clone();
                        self.state = State::Connecting(Box::pin(async move {
                            tokio::time::sleep(backoff).await;
                            connect_websocket(url, addresses, tls).await
                        }));

                        return Poll::Ready(Ok(Event::Hiccup {
                            backoff,
                            error: anyhow::Error::new(e)
                                .context("Reconnecting to presence service on transient error"),
                        }));
                    }
                    Poll::Pending => {
                        self.waker = Some(cx.waker().clone());
                        return Poll::Pending;
                    }
                },
            };

            // Priority 1: Keep local buffers small and send pending messages.
            match stream.poll_ready_unpin(cx) {
                Poll::Ready(Ok(())) => {
                    if let Some(message) = self.pending_messages.pop_front() {
                        match stream.start_send_unpin(Message::text(message.clone())) {
                            Ok(()) => {
                                tracing::trace!(target: "wire::signal::send", %message);

                                // Anything we send proves liveness, so the
                                // heartbeat can wait another interval.
                                self.heartbeat.reset();

                                match stream.poll_flush_unpin(cx) {
                                    Poll::Ready(Ok(())) => {}
                                    Poll::Ready(Err(e)) => {
                                        self.reconnect_on_transient_error(
                                            InternalError::WebSocket(e),
                                        );
                                        continue;
                                    }
                                    Poll::Pending => {}
                                }
                            }
                            Err(e) => {
                                self.pending_messages.push_front(message);
                                self.reconnect_on_transient_error(InternalError::WebSocket(e));
                            }
                        }
                        continue;
                    }
                }
                Poll::Ready(Err(e)) => {
                    self.reconnect_on_transient_error(InternalError::WebSocket(e));
                    continue;
                }
                Poll::Pending => {}
            }

            // Priority 2: Handle incoming messages.
            match stream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(message))) => {
                    let Ok(message) = message.into_text() else {
                        tracing::warn!("Received non-text message from presence service");
                        continue;
                    };

                    tracing::trace!(target: "wire::signal::recv", %message);

                    let message = match serde_json::from_str::<WireMessage>(&message) {
                        Ok(m) => m,
                        Err(e) if e.is_io() || e.is_eof() => {
                            self.reconnect_on_transient_error(InternalError::Serde(e));
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!("Failed to deserialize message: {}", err_with_src(&e));
                            continue;
                        }
                    };

                    match message {
                        WireMessage::Presence(presence) => {
                            if presence.from == self.self_addr {
                                tracing::trace!("Discarding self-presence");
                                continue;
                            }
                            let status = match presence.status.parse::<PresenceStatus>() {
                                Ok(status) => status,
                                Err(_) => {
                                    tracing::warn!(
                                        status = %presence.status,
                                        overlay = %self.overlay_id.brief(),
                                        "Unrecognized presence status"
                                    );
                                    continue;
                                }
                            };

                            return Poll::Ready(Ok(Event::PresenceReceived {
                                from: presence.from,
                                status,
                            }));
                        }
                        WireMessage::Message(message) => {
                            // The service fans a message out to every session
                            // of the bare address; discard what is not ours.
                            if message.from == self.self_addr || message.to != self.self_addr {
                                continue;
                            }

                            return Poll::Ready(Ok(Event::MessageReceived {
                                from: message.from,
                                kind: message.kind,
                                body: message.body,
                            }));
                        }
                        WireMessage::Heartbeat(_) => continue,
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.reconnect_on_transient_error(InternalError::WebSocket(e));
                    continue;
                }
                Poll::Ready(None) => {
                    self.reconnect_on_transient_error(InternalError::StreamClosed);
                    continue;
                }
                Poll::Pending => {}
            }

            // Priority 3: Handle heartbeats.
            match self.heartbeat.poll_tick(cx) {
                Poll::Ready(_) => {
                    self.send(WireMessage::Heartbeat(Empty::default()));

                    return Poll::Ready(Ok(Event::HeartbeatSent));
                }
                Poll::Pending => {}
            }

            return Poll::Pending;
        }
    }

    /// Parks the channel in `Connecting` with the given error; `poll` decides
    /// whether and when to retry.
    fn reconnect_on_transient_error(&mut self, e: InternalError) {
        self.state = State::Connecting(future::ready(Err(e)).boxed());
    }
}

async fn connect_websocket(
    url: Url,
    addresses: Vec<SocketAddr>,
    tls: std::sync::Arc<rustls::ClientConfig>,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, InternalError> {
    tracing::debug!(host = %url.host_str().unwrap_or_default(), ?addresses, "Connecting to presence service");

    let socket = tokio::time::timeout(CONNECT_TIMEOUT, connect_socket(addresses))
        .await
        .map_err(|_| InternalError::Timeout {
            duration: CONNECT_TIMEOUT,
        })??;

    let request = url
        .as_str()
        .into_client_request()
        .map_err(InternalError::WebSocket)?;

    let (stream, _) =
        client_async_tls_with_config(request, socket, None, Some(Connector::Rustls(tls)))
            .await
            .map_err(InternalError::WebSocket)?;

    Ok(stream)
}

async fn connect_socket(addresses: Vec<SocketAddr>) -> Result<TcpStream, InternalError> {
    let mut errors = Vec::with_capacity(addresses.len());

    for addr in addresses {
        match TcpStream::connect(addr).await {
            Ok(socket) => return Ok(socket),
            Err(e) => errors.push((addr, e)),
        }
    }

    Err(InternalError::SocketConnection(errors))
}
