//! HTTP transport between InfoService nodes
//!
//! The server only enqueues the raw request body on the node's queue; the
//! dispatcher does all decoding. Outbound traffic goes through one task
//! per peer so a slow peer never holds up the others.

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agreement::codec::MAX_MESSAGE_BYTES;
use crate::agreement::queue::Ingress;
use crate::agreement::registry::SeedHandle;
use crate::agreement::traits::PeerDirectory;
use crate::agreement::types::NodeId;
use crate::config::PeerConfig;
use crate::error::{AgreementError, Result};
use crate::logger;
use crate::store::AgreementStore;

/// Header naming the sending node; checked against the signed sender.
pub const NODE_HEADER: &str = "X-InfoService-Id";

const MAX_ATTEMPTS: u32 = 3;

/// Shared state of the HTTP endpoints.
#[derive(Clone)]
pub struct ServerState {
    pub node_id: NodeId,
    pub ingress: Ingress,
    pub seed: SeedHandle,
    pub store: AgreementStore,
}

/// `POST /agreement`: queue a compressed message for the dispatcher.
async fn receive_message(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<ServerState>,
) -> impl Responder {
    let Some(from) = req.headers().get(NODE_HEADER).and_then(|v| v.to_str().ok()) else {
        return HttpResponse::BadRequest().json(json!({"status": "missing sender"}));
    };
    match state.ingress.enqueue(NodeId::from(from), body.to_vec()) {
        Ok(()) => HttpResponse::Accepted().json(json!({"status": "queued"})),
        Err(e) => HttpResponse::ServiceUnavailable().json(json!({"status": e.to_string()})),
    }
}

async fn health(state: web::Data<ServerState>) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "node": state.node_id,
        "hostname": logger::get_hostname(),
        "memory": logger::memory_usage(),
    }))
}

/// `GET /agreement/status`: current common random and recent history.
async fn status(state: web::Data<ServerState>) -> impl Responder {
    let history = state.store.count().and_then(|count| Ok((count, state.store.recent(5)?)));
    match history {
        Ok((count, recent)) => HttpResponse::Ok().json(json!({
            "node": state.node_id,
            "common_random": state.seed.current(),
            "agreements": count,
            "recent": recent,
        })),
        Err(e) => HttpResponse::InternalServerError().json(json!({"status": e.to_string()})),
    }
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(MAX_MESSAGE_BYTES))
        .route("/agreement", web::post().to(receive_message))
        .route("/agreement/status", web::get().to(status))
        .route("/health", web::get().to(health));
}

pub async fn start_server(port: u16, state: ServerState) -> std::io::Result<()> {
    let data = web::Data::new(state);
    info!(port, "Network: starting HTTP server");

    HttpServer::new(move || App::new().app_data(data.clone()).configure(routes))
        .bind(("0.0.0.0", port))?
        .run()
        .await
}

/// Delivery of encoded messages to a peer address.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn deliver(&self, address: &str, from: &NodeId, payload: Vec<u8>) -> Result<()>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("infoservice-agreement/0.1.0")
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AgreementError::Transport(e.to_string()))?;
        Ok(HttpTransport { client })
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn deliver(&self, address: &str, from: &NodeId, payload: Vec<u8>) -> Result<()> {
        let response = self
            .client
            .post(format!("http://{}/agreement", address))
            .header(NODE_HEADER, from.as_str())
            .header("Content-Type", "application/octet-stream")
            .body(payload)
            .send()
            .await
            .map_err(|e| AgreementError::Transport(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AgreementError::Transport(format!("HTTP status: {}", response.status())))
        }
    }
}

/// Static membership from configuration with one outbound task per peer.
pub struct HttpPeerDirectory {
    local: NodeId,
    participants: Vec<NodeId>,
    outboxes: HashMap<NodeId, mpsc::UnboundedSender<Vec<u8>>>,
}

impl HttpPeerDirectory {
    /// Spawn the outbound tasks. Must be called inside a tokio runtime.
    pub fn spawn(local: NodeId, peers: &[PeerConfig], transport: Arc<dyn PeerTransport>) -> Self {
        let mut participants: Vec<NodeId> = peers.iter().map(|p| p.id.clone()).collect();
        if !participants.contains(&local) {
            participants.push(local.clone());
        }
        participants.sort();
        participants.dedup();

        let mut outboxes = HashMap::new();
        for peer in peers.iter().filter(|p| p.id != local) {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_outbox(
                local.clone(),
                peer.clone(),
                transport.clone(),
                rx,
            ));
            outboxes.insert(peer.id.clone(), tx);
        }

        HttpPeerDirectory {
            local,
            participants,
            outboxes,
        }
    }
}

async fn run_outbox(
    local: NodeId,
    peer: PeerConfig,
    transport: Arc<dyn PeerTransport>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(payload) = rx.recv().await {
        for attempt in 1..=MAX_ATTEMPTS {
            match transport.deliver(&peer.address, &local, payload.clone()).await {
                Ok(()) => {
                    debug!(peer = %peer.id, bytes = payload.len(), "Network: delivered");
                    break;
                }
                Err(e) if attempt < MAX_ATTEMPTS => {
                    debug!(peer = %peer.id, attempt, error = %e, "Network: delivery failed, retrying");
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                }
                Err(e) => {
                    warn!(peer = %peer.id, error = %e, "Network: dropping message after {} attempts", MAX_ATTEMPTS);
                }
            }
        }
    }
}

impl PeerDirectory for HttpPeerDirectory {
    fn local_id(&self) -> &NodeId {
        &self.local
    }

    fn participants(&self) -> Vec<NodeId> {
        self.participants.clone()
    }

    fn send_to(&self, peer: &NodeId, payload: Vec<u8>) -> Result<()> {
        let outbox = self
            .outboxes
            .get(peer)
            .ok_or_else(|| AgreementError::Transport(format!("no route to {}", peer)))?;
        outbox.send(payload).map_err(|_| AgreementError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agreement::queue::{channel, Event};
    use actix_web::test;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Captured {
        deliveries: Mutex<Vec<(String, NodeId, Vec<u8>)>>,
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl PeerTransport for Captured {
        async fn deliver(&self, address: &str, from: &NodeId, payload: Vec<u8>) -> Result<()> {
            {
                let mut left = self.failures_left.lock();
                if *left > 0 {
                    *left -= 1;
                    return Err(AgreementError::Transport("refused".into()));
                }
            }
            self.deliveries
                .lock()
                .push((address.to_string(), from.clone(), payload));
            Ok(())
        }
    }

    fn peers() -> Vec<PeerConfig> {
        ["is-3@10.0.0.3:8003", "is-1@10.0.0.1:8001", "is-2@10.0.0.2:8002"]
            .iter()
            .map(|p| p.parse().unwrap())
            .collect()
    }

    async fn wait_for(transport: &Captured, n: usize) {
        for _ in 0..200 {
            if transport.deliveries.lock().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_directory_routes_to_peers_only() {
        let transport = Arc::new(Captured::default());
        let directory = HttpPeerDirectory::spawn(NodeId::from("is-1"), &peers(), transport.clone());
        assert_eq!(
            directory.participants(),
            vec![NodeId::from("is-1"), NodeId::from("is-2"), NodeId::from("is-3")]
        );

        directory.multicast(b"hello".to_vec());
        wait_for(&transport, 2).await;

        let mut addresses: Vec<String> = transport
            .deliveries
            .lock()
            .iter()
            .map(|(a, from, _)| {
                assert_eq!(from, &NodeId::from("is-1"));
                a.clone()
            })
            .collect();
        addresses.sort();
        assert_eq!(addresses, vec!["10.0.0.2:8002", "10.0.0.3:8003"]);
        assert!(directory.send_to(&NodeId::from("is-9"), Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_outbox_retries_failed_delivery() {
        let transport = Arc::new(Captured::default());
        *transport.failures_left.lock() = 1;
        let directory = HttpPeerDirectory::spawn(NodeId::from("is-1"), &peers(), transport.clone());

        directory.send_to(&NodeId::from("is-2"), b"x".to_vec()).unwrap();
        wait_for(&transport, 1).await;
        assert_eq!(transport.deliveries.lock().len(), 1);
    }

    #[actix_web::test]
    async fn test_post_agreement_enqueues_raw_bytes() {
        let (ingress, mut inbox) = channel();
        let store = AgreementStore::open_in_memory().unwrap();
        store.init().unwrap();
        let state = ServerState {
            node_id: NodeId::from("is-1"),
            ingress,
            seed: SeedHandle::new("R6"),
            store,
        };
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/agreement")
            .insert_header((NODE_HEADER, "is-2"))
            .set_payload(b"payload".to_vec())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 202);
        match inbox.try_recv() {
            Some(Event::Inbound { from, payload }) => {
                assert_eq!(from, NodeId::from("is-2"));
                assert_eq!(payload, b"payload".to_vec());
            }
            other => panic!("Expected inbound event, got {:?}", other),
        }

        let req = test::TestRequest::post().uri("/agreement").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 400);

        let req = test::TestRequest::post()
            .uri("/agreement")
            .insert_header((NODE_HEADER, "is-2"))
            .set_payload(vec![0u8; MAX_MESSAGE_BYTES + 1])
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 413);
        assert!(inbox.try_recv().is_none());

        let req = test::TestRequest::get().uri("/agreement/status").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["common_random"], "R6");
        assert_eq!(body["agreements"], 0);
    }
}
