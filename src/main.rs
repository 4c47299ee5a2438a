mod abuse;
mod config;
mod connections;
mod coordinator;
mod error;
mod geo;
mod matchmaking;
mod messages;
mod room;
mod room_manager;
mod server;
mod session;
mod store;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use warp::Filter;

use abuse::classifier::{ContentClassifier, GeminiClassifier};
use abuse::AbuseDetector;
use config::ServerConfig;
use coordinator::Coordinator;
use server::Server;
use store::durable::RedbBackend;
use store::Store;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Parse the certificate chain and key up front so a bad pair falls back to
/// plain HTTP instead of failing inside warp.
fn tls_files_usable(cert_path: &Path, key_path: &Path) -> bool {
    let cert_file = match File::open(cert_path) {
        Ok(file) => file,
        Err(e) => {
            warn!("Failed to open certificate file: {e}");
            return false;
        }
    };
    match rustls_pemfile::certs(&mut BufReader::new(cert_file)).collect::<Result<Vec<_>, _>>() {
        Ok(certs) if !certs.is_empty() => {}
        Ok(_) => {
            warn!("No certificates found in {}", cert_path.display());
            return false;
        }
        Err(e) => {
            warn!("Failed to parse certificate: {e}");
            return false;
        }
    }

    let key_file = match File::open(key_path) {
        Ok(file) => file,
        Err(e) => {
            warn!("Failed to open private key file: {e}");
            return false;
        }
    };
    match rustls_pemfile::private_key(&mut BufReader::new(key_file)) {
        Ok(Some(_)) => true,
        Ok(None) => {
            warn!("No private key found in {}", key_path.display());
            false
        }
        Err(e) => {
            warn!("Failed to parse private key: {e}");
            false
        }
    }
}

fn open_store(config: &ServerConfig) -> Store {
    let Some(path) = &config.store_path else {
        info!("Using in-memory store");
        return Store::in_memory();
    };
    match RedbBackend::open(path) {
        Ok(backend) => {
            info!("Using redb store at {}", path.display());
            Store::with_primary(Arc::new(backend))
        }
        Err(e) => {
            warn!(
                "Could not open redb store at {} ({e}), using in-memory store",
                path.display()
            );
            Store::in_memory()
        }
    }
}

fn content_classifier(config: &ServerConfig) -> Option<Arc<dyn ContentClassifier>> {
    let api_key = config.gemini_api_key.clone()?;
    match GeminiClassifier::new(api_key, &config.gemini_model) {
        Ok(classifier) => {
            info!("Content classifier enabled ({})", config.gemini_model);
            Some(Arc::new(classifier))
        }
        Err(e) => {
            warn!("Content classifier disabled: {e}");
            None
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    let store = Arc::new(open_store(&config));
    store.spawn_sweeper(SWEEP_INTERVAL);

    let abuse = Arc::new(AbuseDetector::new(
        store.clone(),
        content_classifier(&config),
        config.abuse_salt.clone(),
    ));
    let coordinator = Coordinator::new(&config, store.clone(), abuse.clone());
    let app = Arc::new(Server::new(coordinator, store, abuse));

    let routes = server::routes(app).with(
        warp::cors()
            .allow_any_origin()
            .allow_methods(vec!["GET", "OPTIONS"]),
    );

    match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert), Some(key)) if tls_files_usable(cert, key) => {
            info!("Starting secure server (HTTPS/WSS) on {}", config.bind_addr);
            warp::serve(routes)
                .tls()
                .cert_path(cert)
                .key_path(key)
                .run(config.bind_addr)
                .await;
        }
        (Some(_), Some(_)) => {
            warn!(
                "Failed to load TLS config, falling back to HTTP/WS on {}",
                config.bind_addr
            );
            warp::serve(routes).run(config.bind_addr).await;
        }
        _ => {
            info!("Server starting on {}", config.bind_addr);
            warp::serve(routes).run(config.bind_addr).await;
        }
    }
}
