//! # Agent Connect Loop
//!
//! `run` dials the gateway forever, reconnecting after a fixed delay on
//! any failure (§4.5, §7 reconnect policy: no backoff, no jitter).

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};
use tunnel_protocol::frame::Frame;

use crate::backend::handle_exchange;
use crate::error::AgentError;
use crate::rules::Rules;

/// Runs forever: connect, register, process frames until the tunnel
/// drops, sleep, repeat. Never returns under normal operation.
pub async fn run(gateway_addr: &str, rules: Arc<Rules>, reconnect_delay: Duration) {
    loop {
        info!(addr = %gateway_addr, "dialing gateway");
        match connect(gateway_addr, &rules).await {
            Ok(()) => info!("tunnel closed cleanly, reconnecting"),
            Err(e) => warn!(error = %e, "tunnel dropped, reconnecting"),
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}

async fn connect(gateway_addr: &str, rules: &Arc<Rules>) -> Result<(), AgentError> {
    let url = format!("{}/_rehook/client", gateway_addr.trim_end_matches('/'));
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| AgentError::Connect(e.to_string()))?;

    let (mut sink, mut stream) = ws.split();

    let register = Frame::Register { keys: rules.keys() };
    let text = serde_json::to_string(&register).map_err(tunnel_protocol::ProtocolError::from)?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|_| AgentError::TunnelWrite)?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let mut writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let result = read_loop(&mut stream, rules, tx).await;
    writer.abort();
    result
}

async fn read_loop(
    stream: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    rules: &Arc<Rules>,
    tx: mpsc::UnboundedSender<Message>,
) -> Result<(), AgentError> {
    loop {
        let next = stream
            .next()
            .await
            .ok_or_else(|| AgentError::TunnelRead("connection closed".into()))?
            .map_err(|e| AgentError::TunnelRead(e.to_string()))?;

        match next {
            Message::Text(text) => {
                let frame: Frame = serde_json::from_str(&text)
                    .map_err(tunnel_protocol::ProtocolError::from)?;
                match frame {
                    Frame::Retransmit { key, id, body } => {
                        let rules = rules.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let response = handle_exchange(&rules, key, id, body).await;
                            if let Ok(text) = serde_json::to_string(&response) {
                                if tx.send(Message::Text(text.into())).is_err() {
                                    error!("failed to queue response, tunnel writer gone");
                                }
                            }
                        });
                    }
                    Frame::Register { .. } => {
                        warn!("gateway sent an unexpected register frame, ignoring");
                    }
                }
            }
            Message::Close(_) => return Ok(()),
            _ => {}
        }
    }
}
