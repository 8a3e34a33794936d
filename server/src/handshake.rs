//! FileReady/FileParsed then ServerReady/ClientReady, fanned out to every
//! session at once. Sessions that fail a step are left out of the next one and
//! reported back so the coordinator can disconnect them.

use futures_util::future::join_all;
use std::sync::Arc;
use tandem_proto::{Message, RpcError};

use crate::config::SyncConfig;
use crate::registry::{ClientSession, LOG_TAG};

pub struct Onboarding {
    pub ready: Vec<Arc<ClientSession>>,
    pub failed: Vec<(Arc<ClientSession>, RpcError)>,
}

pub async fn onboard(sessions: Vec<Arc<ClientSession>>, config: &SyncConfig) -> Onboarding {
    let mut failed = Vec::new();

    let file_ready = Message::FileReady {
        close_enough_value: config.close_enough_ms,
    };
    let parsed = step(sessions, file_ready, "FileParsed", config.handshake_timeout).await;
    let parsed = partition(parsed, &mut failed);

    let acked = step(parsed, Message::ServerReady, "ClientReady", config.ready_timeout).await;
    let ready = partition(acked, &mut failed);

    Onboarding { ready, failed }
}

async fn step(
    sessions: Vec<Arc<ClientSession>>,
    request: Message,
    expected: &'static str,
    timeout: std::time::Duration,
) -> Vec<(Arc<ClientSession>, Result<Message, RpcError>)> {
    let calls = sessions.into_iter().map(|session| {
        let request = request.clone();
        async move {
            let result = session
                .peer()
                .call_expecting(request, expected, timeout)
                .await;
            (session, result)
        }
    });
    join_all(calls).await
}

fn partition(
    results: Vec<(Arc<ClientSession>, Result<Message, RpcError>)>,
    failed: &mut Vec<(Arc<ClientSession>, RpcError)>,
) -> Vec<Arc<ClientSession>> {
    let mut ok = Vec::with_capacity(results.len());
    for (session, result) in results {
        match result {
            Ok(_) => ok.push(session),
            Err(err) => {
                tracing::warn!("{LOG_TAG} Client {} failed the handshake: {}", session.id, err);
                failed.push((session, err));
            }
        }
    }
    ok
}
