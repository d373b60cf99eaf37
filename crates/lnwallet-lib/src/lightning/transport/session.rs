use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{watch, Mutex},
};
use tracing::{debug, info, trace, warn};

use super::{
    keepalive::PingTracker,
    noise::{
        CipherState, HandshakeState, TransportKeys, ACT_ONE_SIZE, ACT_THREE_SIZE, ACT_TWO_SIZE,
        LENGTH_HEADER_SIZE,
    },
    TransportError,
};
use crate::{
    lightning::{
        types::{Privkey, Pubkey},
        wire::{self, LightningMessage, Ping, Pong, MAX_MESSAGE_SIZE},
    },
    tasks::TaskTrackerWithCancellation,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Established,
    Error,
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct ReceiveHalf {
    stream: BoxedReader,
    cipher: CipherState,
}

struct SendHalf {
    stream: BoxedWriter,
    cipher: CipherState,
}

fn map_read_error(err: std::io::Error) -> TransportError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::ConnectionClosed
    } else {
        TransportError::Io(err)
    }
}

/// An encrypted connection to one peer.
///
/// The two directions are guarded by separate locks: all sends are serialized with each
/// other, and so are all receives, which keeps both nonce sequences strictly increasing.
/// Cipher states only live inside the halves and are dropped whenever the session leaves
/// `Established`, so a reconnect always runs a fresh handshake.
pub struct TransportSession {
    local_key: Privkey,
    remote_pubkey: Pubkey,
    receiver: Mutex<Option<ReceiveHalf>>,
    sender: Mutex<Option<SendHalf>>,
    state: watch::Sender<ConnectionState>,
    pings: Mutex<PingTracker>,
    max_missed_pings: u32,
}

impl TransportSession {
    pub fn new(local_key: Privkey, remote_pubkey: Pubkey, max_missed_pings: u32) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            local_key,
            remote_pubkey,
            receiver: Mutex::new(None),
            sender: Mutex::new(None),
            state,
            pings: Mutex::new(PingTracker::new(max_missed_pings)),
            max_missed_pings,
        }
    }

    pub fn remote_pubkey(&self) -> Pubkey {
        self.remote_pubkey
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        let old = self.state.send_replace(state);
        if old != state {
            debug!(
                "Transport to {:?} changed state {:?} -> {:?}",
                self.remote_pubkey, old, state
            );
        }
    }

    /// Open a TCP connection to `addr` (`host:port`) and run the initiator handshake.
    /// The timeout covers both the TCP connect and the handshake.
    pub async fn connect(&self, addr: &str, timeout: Duration) -> Result<(), TransportError> {
        self.set_state(ConnectionState::Connecting);
        let attempt = async {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|err| TransportError::ConnectionRefused(err.to_string()))?;
            let _ = stream.set_nodelay(true);
            self.handshake_outbound(stream).await
        };
        self.finish_attempt(tokio::time::timeout(timeout, attempt).await)
            .await
    }

    /// Run the initiator handshake over an already open stream.
    pub async fn connect_stream<S>(&self, stream: S, timeout: Duration) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.set_state(ConnectionState::Connecting);
        self.finish_attempt(tokio::time::timeout(timeout, self.handshake_outbound(stream)).await)
            .await
    }

    async fn finish_attempt(
        &self,
        result: Result<Result<(), TransportError>, tokio::time::error::Elapsed>,
    ) -> Result<(), TransportError> {
        let err = match result {
            Ok(Ok(())) => {
                info!("Transport session established with {:?}", self.remote_pubkey);
                return Ok(());
            }
            Ok(Err(err)) => err,
            Err(_) => TransportError::HandshakeTimeout,
        };
        warn!(
            "Failed to establish transport with {:?}: {}",
            self.remote_pubkey, err
        );
        self.teardown(ConnectionState::Error).await;
        Err(err)
    }

    async fn handshake_outbound<S>(&self, mut stream: S) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.set_state(ConnectionState::Handshaking);
        let mut handshake =
            HandshakeState::new_initiator(&self.local_key, &self.remote_pubkey, Privkey::generate());
        stream.write_all(&handshake.act_one()?).await?;
        let mut act_two = [0u8; ACT_TWO_SIZE];
        stream.read_exact(&mut act_two).await.map_err(map_read_error)?;
        let (act_three, keys) = handshake.process_act_two(&act_two)?;
        stream.write_all(&act_three).await?;
        stream.flush().await?;
        self.install(stream, keys).await;
        Ok(())
    }

    /// Run the responder handshake on an inbound stream. The remote identity is learned
    /// from act three.
    pub async fn accept<S>(
        mut stream: S,
        local_key: Privkey,
        timeout: Duration,
        max_missed_pings: u32,
    ) -> Result<TransportSession, TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let handshake = async {
            let mut handshake = HandshakeState::new_responder(&local_key, Privkey::generate());
            let mut act_one = [0u8; ACT_ONE_SIZE];
            stream.read_exact(&mut act_one).await.map_err(map_read_error)?;
            let act_two = handshake.process_act_one(&act_one)?;
            stream.write_all(&act_two).await?;
            let mut act_three = [0u8; ACT_THREE_SIZE];
            stream
                .read_exact(&mut act_three)
                .await
                .map_err(map_read_error)?;
            handshake.process_act_three(&act_three)
        };
        let keys = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| TransportError::HandshakeTimeout)??;
        let session = TransportSession::new(local_key, keys.remote_static, max_missed_pings);
        session.install(stream, keys).await;
        info!(
            "Accepted transport session from {:?}",
            session.remote_pubkey
        );
        Ok(session)
    }

    async fn install<S>(&self, stream: S, keys: TransportKeys)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        *self.receiver.lock().await = Some(ReceiveHalf {
            stream: Box::new(reader),
            cipher: keys.receiving,
        });
        *self.sender.lock().await = Some(SendHalf {
            stream: Box::new(writer),
            cipher: keys.sending,
        });
        *self.pings.lock().await = PingTracker::new(self.max_missed_pings);
        self.set_state(ConnectionState::Established);
    }

    /// Move to `state` and drop both halves together with their keys.
    async fn teardown(&self, state: ConnectionState) {
        // Publish first so that a receive blocked on the socket releases its lock.
        self.set_state(state);
        if let Some(mut half) = self.sender.lock().await.take() {
            let _ = half.stream.shutdown().await;
        }
        self.receiver.lock().await.take();
    }

    pub async fn close(&self) {
        if self.state() != ConnectionState::Disconnected {
            info!("Closing transport session with {:?}", self.remote_pubkey);
        }
        self.teardown(ConnectionState::Disconnected).await;
    }

    pub async fn send(&self, message: &LightningMessage) -> Result<(), TransportError> {
        let bytes = wire::encode(message);
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::MessageTooLarge(bytes.len()));
        }
        let mut guard = self.sender.lock().await;
        let half = match guard.as_mut() {
            Some(half) if self.state() == ConnectionState::Established => half,
            _ => return Err(TransportError::NotConnected),
        };
        trace!(
            "Sending message type {} to {:?}",
            message.msg_type(),
            self.remote_pubkey
        );
        let frame = half.cipher.encrypt_message(&bytes)?;
        let written = async {
            half.stream.write_all(&frame).await?;
            half.stream.flush().await
        }
        .await;
        if let Err(err) = written {
            guard.take();
            drop(guard);
            self.teardown(ConnectionState::Error).await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Await the next message from the peer. Pings are answered and pongs are consumed
    /// here, so callers only ever see other messages.
    pub async fn receive(&self) -> Result<LightningMessage, TransportError> {
        loop {
            match self.receive_raw().await? {
                LightningMessage::Ping(ping) => match Pong::answering(&ping) {
                    Some(pong) => {
                        trace!("Answering ping from {:?}", self.remote_pubkey);
                        self.send(&LightningMessage::Pong(pong)).await?;
                    }
                    None => debug!(
                        "Ignoring ping from {:?} asking for {} pong bytes",
                        self.remote_pubkey, ping.num_pong_bytes
                    ),
                },
                LightningMessage::Pong(_) => {
                    self.pings.lock().await.pong_received();
                }
                message => return Ok(message),
            }
        }
    }

    async fn receive_raw(&self) -> Result<LightningMessage, TransportError> {
        let mut state_rx = self.state.subscribe();
        let mut guard = self.receiver.lock().await;
        let half = match guard.as_mut() {
            Some(half) if self.state() == ConnectionState::Established => half,
            _ => return Err(TransportError::NotConnected),
        };
        let frame = tokio::select! {
            frame = Self::read_frame(half) => frame,
            _ = state_rx.wait_for(|state| *state != ConnectionState::Established) => {
                return Err(TransportError::NotConnected);
            }
        };
        let result = frame.and_then(|bytes| wire::decode(&bytes).map_err(Into::into));
        match result {
            Ok(message) => Ok(message),
            Err(err) => {
                guard.take();
                drop(guard);
                let state = match err {
                    TransportError::ConnectionClosed => ConnectionState::Disconnected,
                    _ => ConnectionState::Error,
                };
                warn!(
                    "Receiving from {:?} failed, session is now {:?}: {}",
                    self.remote_pubkey, state, err
                );
                self.teardown(state).await;
                Err(err)
            }
        }
    }

    async fn read_frame(half: &mut ReceiveHalf) -> Result<Vec<u8>, TransportError> {
        let mut header = [0u8; LENGTH_HEADER_SIZE];
        half.stream
            .read_exact(&mut header)
            .await
            .map_err(map_read_error)?;
        let body_len = half.cipher.decrypt_length(&header)?;
        let mut body = vec![0u8; body_len];
        half.stream
            .read_exact(&mut body)
            .await
            .map_err(map_read_error)?;
        half.cipher.decrypt(&body)
    }

    /// Ping the peer every `interval`, dropping the connection once too many pongs in a
    /// row did not arrive within `pong_timeout`.
    pub fn spawn_keepalive(
        self: &Arc<Self>,
        interval: Duration,
        pong_timeout: Duration,
        tasks: &TaskTrackerWithCancellation,
    ) {
        let session = Arc::clone(self);
        tasks.spawn(async move { session.keepalive_loop(interval, pong_timeout).await });
    }

    async fn keepalive_loop(&self, interval: Duration, pong_timeout: Duration) {
        let mut state_rx = self.subscribe();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = state_rx.wait_for(|state| *state != ConnectionState::Established) => return,
            }
            if let Err(err) = self.send(&LightningMessage::Ping(Ping::new(0))).await {
                debug!("Keepalive for {:?} stopped: {}", self.remote_pubkey, err);
                return;
            }
            self.pings.lock().await.ping_sent();
            tokio::select! {
                _ = tokio::time::sleep(pong_timeout) => {}
                _ = state_rx.wait_for(|state| *state != ConnectionState::Established) => return,
            }
            let mut pings = self.pings.lock().await;
            if pings.deadline_passed() {
                warn!(
                    "Peer {:?} missed {} pongs in a row, disconnecting",
                    self.remote_pubkey,
                    pings.missed()
                );
                drop(pings);
                self.teardown(ConnectionState::Disconnected).await;
                return;
            }
        }
    }
}
