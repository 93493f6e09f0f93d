//! WebSocket accept loop and relay configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::WebSocketStream;

use crate::compaction::{CompactionEngine, CompactionSettings};
use crate::hub::BroadcastHub;
use crate::session;
use crate::store::{StoreError, UpdateStore};

/// Upgrade endpoint; anything else is rejected at the handshake.
const SYNC_PATH: &str = "/sync";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("bind failed: {0}")]
    Bind(std::io::Error),

    #[error("accept failed: {0}")]
    Accept(std::io::Error),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// Broadcast buffer per document channel.
    pub channel_capacity: usize,
    pub compaction: CompactionSettings,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 3030,
            db_path: PathBuf::from("./syncline.db"),
            channel_capacity: 256,
            compaction: CompactionSettings::default(),
        }
    }
}

/// Shared relay state handed to every session.
#[derive(Clone)]
pub struct RelayState {
    pub store: UpdateStore,
    pub hub: Arc<BroadcastHub>,
    /// Live forwarder-task gauge; observable so leak regressions are testable.
    pub forwarders: Arc<AtomicUsize>,
    pub banner: String,
}

impl RelayState {
    pub fn forwarder_count(&self) -> usize {
        self.forwarders.load(Ordering::SeqCst)
    }
}

pub struct RelayServer {
    config: RelayConfig,
    state: RelayState,
}

impl RelayServer {
    /// Open the store and assemble the relay. Fails if the database is
    /// unusable — the process should exit non-zero in that case.
    pub fn open(config: RelayConfig) -> Result<Self, RelayError> {
        let store = UpdateStore::open(&config.db_path)?;
        let state = RelayState {
            store,
            hub: Arc::new(BroadcastHub::new(config.channel_capacity)),
            forwarders: Arc::new(AtomicUsize::new(0)),
            banner: format!("syncline-relay/{}", env!("CARGO_PKG_VERSION")),
        };
        Ok(Self { config, state })
    }

    pub fn state(&self) -> RelayState {
        self.state.clone()
    }

    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        let addr: SocketAddr = ([127, 0, 0, 1], self.config.port).into();
        let listener = TcpListener::bind(addr).await.map_err(RelayError::Bind)?;
        Ok(listener)
    }

    /// Bind and serve forever.
    pub async fn run(self) -> Result<(), RelayError> {
        let listener = self.bind().await?;
        if let Ok(addr) = listener.local_addr() {
            log::info!("relay listening on {addr}");
        }
        self.serve(listener).await
    }

    /// Serve on an already-bound listener (tests bind to port 0 first).
    pub async fn serve(self, listener: TcpListener) -> Result<(), RelayError> {
        let compactor = CompactionEngine::new(
            self.state.store.clone(),
            self.config.compaction.clone(),
        );
        let compaction_task = tokio::spawn(compactor.run());

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => break Err(RelayError::Accept(e)),
            };
            log::debug!("connection from {addr}");
            let state = self.state.clone();
            tokio::spawn(async move {
                match accept_sync(stream).await {
                    Ok(ws) => session::run_session(ws, state).await,
                    Err(e) => log::debug!("handshake from {addr} rejected: {e}"),
                }
            });
        };

        compaction_task.abort();
        result
    }
}

/// WebSocket upgrade restricted to the `/sync` endpoint.
async fn accept_sync(
    stream: TcpStream,
) -> Result<WebSocketStream<TcpStream>, tokio_tungstenite::tungstenite::Error> {
    let check_path = |req: &Request, response: Response| {
        if req.uri().path() == SYNC_PATH {
            Ok(response)
        } else {
            let mut reject = ErrorResponse::new(None);
            *reject.status_mut() = StatusCode::NOT_FOUND;
            Err(reject)
        }
    };
    tokio_tungstenite::accept_hdr_async(stream, check_path).await
}
