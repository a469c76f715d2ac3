pub mod api;

use std::sync::Arc;
use std::time::Duration;
use log::{ info, warn };

use crate::config::{ RelayConfig, TlsPaths };
use crate::error::BoxError;
use crate::llm::chat::ChatClient;
use self::api::{ router, AppState };

pub struct Server {
    config: RelayConfig,
    chat_client: Arc<dyn ChatClient>,
}

impl Server {
    pub fn new(config: RelayConfig, chat_client: Arc<dyn ChatClient>) -> Self {
        Self { config, chat_client }
    }

    pub async fn run(&self) -> Result<(), BoxError> {
        let state = AppState::new(self.chat_client.clone(), &self.config);
        let app = router(state);

        match &self.config.tls {
            Some(tls) => self.serve_tls(app, tls).await,
            None => {
                let listener = tokio::net::TcpListener::bind(self.config.addr).await.map_err(|e|
                    format!("Failed to bind HTTP server to {}: {}. Try a different port.", self.config.addr, e)
                )?;
                info!("HTTP relay listening on: http://{}", self.config.addr);
                axum::serve(listener, app.into_make_service())
                    .with_graceful_shutdown(shutdown_signal())
                    .await?;
                Ok(())
            }
        }
    }

    async fn serve_tls(&self, app: axum::Router, tls: &TlsPaths) -> Result<(), BoxError> {
        if rustls::crypto::ring::default_provider().install_default().is_err() {
            warn!("A rustls crypto provider was already installed; keeping it.");
        }

        info!(
            "TLS enabled. Loading certificate from '{}' and key from '{}'",
            tls.cert_path,
            tls.key_path
        );
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &tls.cert_path,
            &tls.key_path
        ).await?;

        let handle = axum_server::Handle::new();
        let shutdown = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.graceful_shutdown(Some(Duration::from_secs(5)));
        });

        info!("HTTPS relay listening on: https://{}", self.config.addr);
        axum_server::bind_rustls(self.config.addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, draining connections.");
}
