use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tandem_proto::{Frame, RpcPeer};
use tokio::sync::oneshot;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use url::Url;

use crate::agent::ClientAgent;
use crate::player::Player;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(12);

/// Where the server streams the loaded media, derived from its websocket URL
pub fn media_url(server_url: &str) -> Result<String> {
    let mut url = Url::parse(server_url).context("Invalid server URL")?;
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => bail!("unsupported scheme {other:?}"),
    };
    if url.set_scheme(scheme).is_err() {
        bail!("cannot derive media URL from {server_url}");
    }
    url.set_path("/media");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

/// Connect to the sync server. Returns the agent serving the connection and a
/// receiver that resolves when the socket closes.
pub async fn connect<P: Player>(
    server_url: &str,
    player: Arc<P>,
) -> Result<(Arc<ClientAgent<P>>, oneshot::Receiver<()>)> {
    let media = media_url(server_url)?;
    let (ws_stream, _) = connect_async(server_url)
        .await
        .context("Failed to connect to server")?;
    tracing::info!("Connected to {}", server_url);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (peer, mut outbound) = RpcPeer::channel();
    let peer = Arc::new(peer);
    let agent = Arc::new(ClientAgent::new(Arc::clone(&peer), player, media));

    let (disconnect_tx, disconnect_rx) = oneshot::channel();
    let disconnect_signal = Arc::new(Mutex::new(Some(disconnect_tx)));

    // Sender task, also keeps the socket alive with pings
    let send_peer = Arc::clone(&peer);
    let send_signal = Arc::clone(&disconnect_signal);
    tokio::spawn(async move {
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await;
        loop {
            let msg = tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => match frame.encode() {
                        Ok(json) => WsMessage::Text(json.into()),
                        Err(e) => {
                            tracing::error!("Failed to serialize {}: {}", frame.message.name(), e);
                            continue;
                        }
                    },
                    None => break,
                },
                _ = keepalive.tick() => WsMessage::Ping(Vec::new().into()),
            };
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
        send_peer.close();
        if let Some(tx) = send_signal.lock().take() {
            let _ = tx.send(());
        }
    });

    let recv_peer = Arc::clone(&peer);
    let recv_agent = Arc::clone(&agent);
    let recv_signal = Arc::clone(&disconnect_signal);
    tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => match Frame::decode(text.as_str()) {
                    Ok(frame) => {
                        if let Some(inbound) = recv_peer.accept(frame) {
                            let peer = Arc::clone(&recv_peer);
                            let agent = Arc::clone(&recv_agent);
                            tokio::spawn(async move { peer.serve(inbound, agent.as_ref()).await });
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Malformed frame from server: {}", e);
                        let _ = recv_peer.reject(&e);
                        recv_peer.fail_reply(&e);
                    }
                },
                Ok(WsMessage::Close(_)) => break,
                Err(e) => {
                    tracing::error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
        recv_peer.close();
        if let Some(tx) = recv_signal.lock().take() {
            let _ = tx.send(());
        }
    });

    Ok((agent, disconnect_rx))
}
