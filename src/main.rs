use infoservice_agreement::agreement::codec::Ed25519Keyring;
use infoservice_agreement::agreement::queue::{channel, Dispatcher, Ingress};
use infoservice_agreement::agreement::timer::TokioTimers;
use infoservice_agreement::network::{start_server, HttpPeerDirectory, HttpTransport, ServerState};
use infoservice_agreement::{logger, AgreementConfig, AgreementStore, HistoryListener, Node, SeedHandle};
use std::env;
use std::error::Error;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

fn init_logging() {
    match env::var("LOG_FORMAT").as_deref() {
        #[cfg(feature = "json")]
        Ok("json") => logger::init_logger_json(),
        Ok("compact") => logger::init_logger(),
        _ => logger::init_logger_detailed(),
    }
}

/// Contribute to a commit-reveal epoch every `interval` once the passive phase is over.
async fn run_scheduler(ingress: Ingress, passive_phase: Duration, interval: Duration) {
    info!(passive_secs = passive_phase.as_secs(), "Scheduler: passive phase");
    tokio::time::sleep(passive_phase).await;

    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    loop {
        ticker.tick().await;
        let value = hex::encode(rand::random::<[u8; 8]>());
        if ingress.propose(value, true).is_err() {
            info!("Scheduler: dispatcher closed, stopping");
            return;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_logging();

    let args: Vec<String> = env::args().skip(1).collect();
    let config = AgreementConfig::from_env()?.with_args(&args)?;
    info!(
        node = %config.node_id,
        port = config.port,
        variant = ?config.variant,
        participants = config.participant_ids().len(),
        "InfoService agreement starting"
    );

    let store = AgreementStore::open(&config.db_path)?;
    store.init()?;
    let restored = store.latest_common_random()?;
    if let Some(seed) = &restored {
        info!(common_random = %seed, "Restored common random from history");
    }
    let seed = SeedHandle::new(restored.unwrap_or_else(|| config.initial_random.clone()));

    let mut keyring = match &config.signing_key {
        Some(key) => Ed25519Keyring::from_hex(key)?,
        None => {
            warn!("No signing key configured, generated an ephemeral one");
            Ed25519Keyring::generate()
        }
    };
    info!(public_key = %keyring.public_key_hex(), "Signing key loaded");
    keyring.add_peer(config.node_id.clone(), keyring.verifying_key());
    for peer in config.peers.iter().filter(|p| p.id != config.node_id) {
        match &peer.public_key {
            Some(key) => keyring.add_peer_hex(peer.id.clone(), key)?,
            None => warn!(peer = %peer.id, "No public key for peer, its messages will be rejected"),
        }
    }

    let (ingress, inbox) = channel();
    let transport = Arc::new(HttpTransport::new()?);
    let directory = HttpPeerDirectory::spawn(config.node_id.clone(), &config.peers, transport);
    let timers = TokioTimers::new(ingress.clone());
    let listener = Arc::new(HistoryListener::new(store.clone(), config.initial_random.clone()));
    let node = Node::new(&config, Arc::new(keyring), directory, timers, listener, seed.clone());
    let dispatcher = tokio::spawn(Dispatcher::new(node, inbox).run());

    let state = ServerState {
        node_id: config.node_id.clone(),
        ingress: ingress.clone(),
        seed,
        store,
    };
    let port = config.port;
    thread::spawn(move || {
        actix_rt::System::new().block_on(async move {
            if let Err(e) = start_server(port, state).await {
                error!(error = %e, "HTTP server stopped");
            }
        });
    });

    let scheduler = tokio::spawn(run_scheduler(
        ingress.clone(),
        config.timing.passive_phase,
        config.interval,
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    scheduler.abort();
    ingress.shutdown()?;
    let node = dispatcher.await?;
    info!(common_random = %node.common_random(), "Stopped");
    Ok(())
}
