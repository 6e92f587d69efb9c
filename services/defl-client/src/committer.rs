//! Connection lifecycle and request/response demux to the replica.
//!
//! Owns two persistent outbound connections (consensus, observer) and two
//! ephemeral inbound listeners (active, passive). The active listener's
//! delayed `Response`s are demultiplexed by request id through
//! [`PendingSlot`]; the passive listener's unsolicited `WeightsResponse`
//! pushes land in an [`ObservationQueue`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use defl_codec::{FrameCodec, FrameError};
use defl_wire::{ClientRequest, ObsidoRequest, RegisterInfo, Response, WeightsResponse, ACK};
use prost::Message;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use uuid::Uuid;

const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);
const PASSIVE_ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

type ResponseMap = Arc<StdMutex<HashMap<Uuid, oneshot::Sender<Response>>>>;

#[derive(Clone, Copy, Debug)]
enum StreamKind {
    Consensus,
    Observer,
}

/// One request's rendezvous slot in the response map. Removing itself on
/// `Drop` is what makes cancellation safe: if the future awaiting the
/// response is dropped before delivery (task cancellation, a `select!`
/// losing a race, an outer timeout), the map never retains a stale entry.
struct PendingSlot {
    map: ResponseMap,
    id: Uuid,
    rx: oneshot::Receiver<Response>,
}

impl PendingSlot {
    fn new(map: ResponseMap, id: Uuid) -> (Self, oneshot::Sender<Response>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                map,
                id,
                rx,
            },
            tx,
        )
    }

    async fn await_response(mut self) -> Option<Response> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.map.lock().unwrap().remove(&self.id);
    }
}

/// Multi-producer single-consumer channel of `WeightsResponse` events with
/// latest-wins drain semantics.
pub struct ObservationQueue {
    rx: mpsc::UnboundedReceiver<WeightsResponse>,
}

impl ObservationQueue {
    /// Block for at least one buffered response, then drain everything
    /// else currently queued, keeping the one with the greatest
    /// `r_last_epoch_id`. Ties keep the earliest arrival.
    pub async fn drain_latest(&mut self) -> Option<WeightsResponse> {
        let mut latest = self.rx.recv().await?;
        while let Ok(next) = self.rx.try_recv() {
            if next.r_last_epoch_id > latest.r_last_epoch_id {
                latest = next;
            }
        }
        Some(latest)
    }
}

/// Retries `ConnectionRefused` forever with a fixed backoff, matching the
/// original prototype's `connect_to_server` loop. Any other I/O error is
/// surfaced — used as-is at bootstrap (a bad host/port is a configuration
/// error), wrapped in an outer retry loop everywhere else (see
/// `reconnect_stream`).
async fn connect_with_retry(host: &str, port: u16) -> Result<TcpStream, CommitError> {
    loop {
        match TcpStream::connect((host, port)).await {
            Ok(stream) => return Ok(stream),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                tracing::warn!(host, port, "connection refused, retrying");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
            Err(e) => return Err(CommitError::Io(e)),
        }
    }
}

/// Owns the committer's network surface: two outbound streams to the
/// replica and two inbound listeners the replica connects back to.
pub struct Committer {
    client_name: String,
    codec: FrameCodec,
    server_host: String,
    consensus_port: u16,
    observer_port: u16,
    consensus_stream: AsyncMutex<TcpStream>,
    observer_stream: AsyncMutex<TcpStream>,
    active_addr: SocketAddr,
    passive_addr: SocketAddr,
    response_map: ResponseMap,
}

impl Committer {
    /// Bind both ephemeral listeners, connect both outbound streams, spawn
    /// the active/passive handler loops, then send the initial
    /// `ClientRegister`. Listener sockets must be bound before the
    /// register message is sent so their ports can be published inside
    /// it — the replica only opens its reverse connections once
    /// `ClientRegister` completes.
    pub async fn bootstrap(
        client_name: impl Into<String>,
        server_host: impl Into<String>,
        consensus_port: u16,
        observer_port: u16,
    ) -> Result<(Self, ObservationQueue), CommitError> {
        let client_name = client_name.into();
        let server_host = server_host.into();
        let codec = FrameCodec::committer();

        let active_listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let passive_listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let active_addr = active_listener.local_addr()?;
        let passive_addr = passive_listener.local_addr()?;

        let (consensus_stream, observer_stream) = tokio::try_join!(
            connect_with_retry(&server_host, consensus_port),
            connect_with_retry(&server_host, observer_port),
        )?;
        tracing::info!(%server_host, consensus_port, observer_port, "connected to replica");

        let response_map: ResponseMap = Arc::new(StdMutex::new(HashMap::new()));
        let (obs_tx, obs_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_active_handler(active_listener, codec, response_map.clone()));
        tokio::spawn(run_passive_handler(passive_listener, codec, obs_tx));

        let committer = Self {
            client_name,
            codec,
            server_host,
            consensus_port,
            observer_port,
            consensus_stream: AsyncMutex::new(consensus_stream),
            observer_stream: AsyncMutex::new(observer_stream),
            active_addr,
            passive_addr,
            response_map,
        };
        committer.register().await;

        Ok((committer, ObservationQueue { rx: obs_rx }))
    }

    /// Send `ClientRegister` with both listener endpoints. Ack-only — no
    /// active response is expected.
    pub async fn register(&self) -> bool {
        let info = RegisterInfo {
            host: "127.0.0.1".to_string(),
            port: u32::from(self.active_addr.port()),
            pasv_host: "127.0.0.1".to_string(),
            pasv_port: u32::from(self.passive_addr.port()),
        };
        let req = ObsidoRequest::client_register(self.client_name.clone(), info);
        self.transmit(StreamKind::Observer, &req).await
    }

    /// Trigger an asynchronous `WeightsResponse` push on the passive
    /// listener. Ack-only; the reply itself arrives via
    /// [`ObservationQueue`], not as a return value.
    pub async fn fetch_w_last(&self) -> bool {
        let req = ObsidoRequest::fetch_w_last(self.client_name.clone());
        self.transmit(StreamKind::Observer, &req).await
    }

    /// Submit this round's trained weights for `target_epoch_id`. Awaits
    /// the demultiplexed `Response` on the active listener.
    pub async fn update_weights(&self, target_epoch_id: u64, weights: Vec<u8>) -> Option<Response> {
        let req = ClientRequest::update_weights(self.client_name.clone(), target_epoch_id, weights);
        self.request_with_response(StreamKind::Consensus, req).await
    }

    /// Vote to advance to `target_epoch_id`. Awaits the demultiplexed
    /// `Response` on the active listener.
    pub async fn new_epoch_vote(&self, target_epoch_id: u64) -> Option<Response> {
        let req = ClientRequest::new_epoch_vote(self.client_name.clone(), target_epoch_id);
        self.request_with_response(StreamKind::Consensus, req).await
    }

    /// The active listener's bound address, published inside the initial
    /// `ClientRegister` so the replica can push delayed `Response`s back.
    pub fn active_addr(&self) -> SocketAddr {
        self.active_addr
    }

    /// The passive listener's bound address, published inside the initial
    /// `ClientRegister` so the replica can push `WeightsResponse` bundles.
    pub fn passive_addr(&self) -> SocketAddr {
        self.passive_addr
    }

    /// Idempotent recovery: reconnect both outbound streams and cancel
    /// every pending awaiter. Listeners are untouched so the replica does
    /// not need to re-handshake port numbers.
    pub async fn clear_session(&self) {
        tracing::warn!("clear_session: reconnecting outbound streams");
        self.reconnect_stream(StreamKind::Consensus).await;
        self.reconnect_stream(StreamKind::Observer).await;
        let drained: Vec<_> = self.response_map.lock().unwrap().drain().collect();
        // Dropping each oneshot::Sender here cancels its awaiter with a
        // RecvError, which callers observe as `None` — "retry next
        // iteration", never a fatal error.
        drop(drained);
    }

    fn stream_for(&self, kind: StreamKind) -> (&AsyncMutex<TcpStream>, u16) {
        match kind {
            StreamKind::Consensus => (&self.consensus_stream, self.consensus_port),
            StreamKind::Observer => (&self.observer_stream, self.observer_port),
        }
    }

    async fn reconnect_stream(&self, kind: StreamKind) {
        let (mutex, port) = self.stream_for(kind);
        let mut guard = mutex.lock().await;
        loop {
            match connect_with_retry(&self.server_host, port).await {
                Ok(stream) => {
                    *guard = stream;
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, ?kind, "reconnect failed, retrying");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    }

    /// Serialize, insert the response-map slot (if `req` expects one is the
    /// caller's job via `request_with_response`), send the length-prefixed
    /// frame, and read back the immediate ack. A transport failure closes
    /// and reopens the affected stream; an ack that isn't the literal
    /// `Ack` frame is a protocol error — logged and dropped, the stream is
    /// left open.
    async fn transmit<T: Message>(&self, kind: StreamKind, req: &T) -> bool {
        let payload = req.encode_to_vec();
        let (mutex, _) = self.stream_for(kind);
        let mut guard = mutex.lock().await;
        let outcome = async {
            self.codec.send(&mut *guard, &payload).await?;
            self.codec.recv(&mut *guard).await
        }
        .await;
        drop(guard);

        match outcome {
            Ok(ack) if ack == ACK => true,
            Ok(ack) => {
                tracing::warn!(?kind, ack = ?ack, "unexpected ack frame, treating as transmit failure");
                false
            }
            Err(e) => {
                tracing::warn!(?kind, error = %e, "transport failure sending request, reconnecting");
                self.reconnect_stream(kind).await;
                false
            }
        }
    }

    async fn request_with_response(&self, kind: StreamKind, req: ClientRequest) -> Option<Response> {
        let request_uuid = Uuid::parse_str(&req.request_uuid)
            .expect("request_uuid is always a freshly generated v4 uuid");
        let (slot, tx) = PendingSlot::new(self.response_map.clone(), request_uuid);
        self.response_map.lock().unwrap().insert(request_uuid, tx);

        if !self.transmit(kind, &req).await {
            return None;
        }
        slot.await_response().await
    }
}

async fn run_active_handler(listener: TcpListener, codec: FrameCodec, response_map: ResponseMap) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "active listener accept failed");
                continue;
            }
        };
        tracing::info!(%peer, "active listener accepted connection");
        loop {
            match codec.recv(&mut stream).await {
                Ok(bytes) => dispatch_response(&bytes, &response_map),
                Err(FrameError::ShortRead) => {
                    tracing::info!("active stream closed by peer, awaiting reconnect");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "active listener read error");
                    break;
                }
            }
        }
    }
}

fn dispatch_response(bytes: &[u8], response_map: &ResponseMap) {
    let response = match Response::decode(bytes) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "failed to decode Response frame");
            return;
        }
    };
    let request_uuid = match Uuid::parse_str(&response.request_uuid) {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(error = %e, "malformed request_uuid on Response");
            return;
        }
    };
    let sender = response_map.lock().unwrap().remove(&request_uuid);
    match sender {
        Some(tx) => {
            // A dropped send (awaiter already gone, e.g. cancelled) must
            // never stall this loop.
            let _ = tx.send(response);
        }
        None => tracing::warn!(%request_uuid, "received response for unknown request"),
    }
}

async fn run_passive_handler(
    listener: TcpListener,
    codec: FrameCodec,
    tx: mpsc::UnboundedSender<WeightsResponse>,
) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "passive listener accept failed");
                continue;
            }
        };
        tracing::info!(%peer, "passive listener accepted connection");
        loop {
            match codec.recv(&mut stream).await {
                Ok(bytes) => match WeightsResponse::decode(bytes.as_slice()) {
                    Ok(wr) => {
                        if tx.send(wr).is_err() {
                            tracing::warn!("observation queue consumer gone, stopping passive handler");
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to decode WeightsResponse frame"),
                },
                Err(FrameError::ShortRead) => {
                    tracing::info!("passive stream closed by peer, awaiting reconnect");
                    tokio::time::sleep(PASSIVE_ACCEPT_BACKOFF).await;
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "passive listener read error");
                    break;
                }
            }
        }
    }
}
