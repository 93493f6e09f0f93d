//! WebSocket connection plumbing and reconnect backoff.

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::time::Duration;
use syncline_proto::{Frame, FrameError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Capped exponential backoff with jitter for the reconnect loop.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Next delay: `base * 2^attempt`, capped, with ±25% jitter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let capped = exp.min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        capped.mul_f64(jitter)
    }

    /// Call after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Connect to the relay and split the socket into frame channels.
///
/// Returns `(outbound, inbound)`. Frames sent to `outbound` are encoded and
/// written by a background task; decoded inbound frames arrive on `inbound`.
/// Disconnection shows up as `inbound` yielding `None`.
pub async fn connect(
    url: &str,
) -> Result<(mpsc::UnboundedSender<Frame>, mpsc::UnboundedReceiver<Frame>), NetError> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await?;
    log::info!("connected to {url}");
    let (mut sink, mut stream) = ws.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

    // Writer: encodes and ships outbound frames until the channel closes or
    // the socket dies.
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let bytes = match frame.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("dropping unencodable frame: {e}");
                    continue;
                }
            };
            if sink.send(Message::Binary(bytes)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Reader: decodes inbound frames; dropping `in_tx` at the end is the
    // disconnect signal for the agent loop.
    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Binary(data)) => match Frame::decode(&data) {
                    Ok(frame) => {
                        if in_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::error!("malformed frame from server: {e}");
                        break;
                    }
                },
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        log::info!("server connection closed");
    });

    Ok((out_tx, in_rx))
}
