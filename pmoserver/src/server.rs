//! # Module Server - API de haut niveau pour Axum
//!
//! Ce module cache la construction du router Axum et le cycle de vie du
//! serveur HTTP :
//!
//! - routes JSON simples avec `add_route()`
//! - handlers avec état (SSE, flux…) avec `add_handler_with_state()`
//! - sous-routers complets avec `add_router()`
//! - arrêt gracieux sur Ctrl+C ou via `shutdown()`

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{Json, Router, handler::Handler, routing::get};
use pmoconfig::get_config;
use serde::Serialize;
use tokio::{signal, sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::logs::{LogState, LoggingOptions, create_logs_router, init_logging};

/// Nom publié par le serveur configuré
const DEFAULT_SERVER_NAME: &str = "PMOBroadcast";

/// Info serveur sérialisable
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub base_url: String,
    pub http_port: u16,
}

/// Serveur principal
pub struct Server {
    name: String,
    base_url: String,
    http_port: u16,
    router: Arc<RwLock<Router>>,
    join_handle: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
    local_addr: Option<SocketAddr>,
    log_state: Option<LogState>,
}

impl Server {
    /// Crée une nouvelle instance de serveur
    ///
    /// # Arguments
    ///
    /// * `name` - Nom du serveur (pour les logs)
    /// * `base_url` - Hôte publié dans les logs (ex: "localhost")
    /// * `http_port` - Port HTTP à écouter (0 pour un port libre)
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, http_port: u16) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            http_port,
            router: Arc::new(RwLock::new(Router::new())),
            join_handle: None,
            shutdown: CancellationToken::new(),
            local_addr: None,
            log_state: None,
        }
    }

    /// Serveur construit depuis `host.*` dans pmoconfig
    pub fn new_configured() -> Self {
        let config = get_config();
        Self::new(
            DEFAULT_SERVER_NAME,
            config.get_base_url(),
            config.get_http_port(),
        )
    }

    /// Ajoute une route JSON dynamique
    ///
    /// La closure est appelée à chaque requête GET sur `path`.
    ///
    /// # Exemple
    ///
    /// ```rust,no_run
    /// # use pmoserver::Server;
    /// # #[tokio::main]
    /// # async fn main() {
    /// # let mut server = Server::new("Test", "localhost", 3000);
    /// server.add_route("/api/status", || async {
    ///     serde_json::json!({ "status": "online" })
    /// }).await;
    /// # }
    /// ```
    pub async fn add_route<F, Fut, T>(&mut self, path: &str, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let f = Arc::new(f);
        let handler = move || {
            let f = f.clone();
            async move { Json(f().await) }
        };

        self.add_router(path, Router::new().route("/", get(handler)))
            .await;
    }

    /// Ajoute un handler GET avec état
    pub async fn add_handler_with_state<H, T, S>(&mut self, path: &str, handler: H, state: S)
    where
        H: Handler<T, S> + Clone + 'static,
        T: 'static,
        S: Clone + Send + Sync + 'static,
    {
        let route = Router::new().route("/", get(handler)).with_state(state);
        self.add_router(path, route).await;
    }

    /// Ajoute un sous-router au serveur
    ///
    /// - Si `path` est "/", merge directement au router principal
    /// - Sinon, nest le router sous le chemin donné
    pub async fn add_router(&mut self, path: &str, sub_router: Router) {
        let mut r = self.router.write().await;

        *r = if path == "/" {
            std::mem::take(&mut *r).merge(sub_router)
        } else {
            let normalized = format!("/{}", path.trim_matches('/'));
            std::mem::take(&mut *r).nest(&normalized, sub_router)
        };
    }

    /// Copie du router courant
    pub async fn router(&self) -> Router {
        self.router.read().await.clone()
    }

    /// Démarre le serveur HTTP
    ///
    /// Le port est réservé avant le retour : une erreur de bind est remontée
    /// à l'appelant. Le serveur s'arrête proprement sur Ctrl+C ou sur
    /// [`Server::shutdown`]. Les routes ajoutées après `start()` ne sont pas
    /// servies.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.http_port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Unable to bind HTTP port {}", self.http_port))?;
        let local_addr = listener.local_addr()?;

        info!(
            "Server {} running at http://{}:{}",
            self.name,
            self.base_url,
            local_addr.port()
        );

        let router = self.router().await;
        let token = self.shutdown.clone();
        let server_task = tokio::spawn(async move {
            let graceful = token.cancelled_owned();
            if let Err(e) = axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }
        });

        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = signal::ctrl_c() => match result {
                    Ok(()) => info!("Ctrl+C received, shutting down"),
                    Err(e) => {
                        error!("Unable to listen for Ctrl+C: {}", e);
                        token.cancelled().await;
                    }
                },
                _ = token.cancelled() => {}
            }
            token.cancel();
        });

        self.join_handle = Some(server_task);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Demande l'arrêt gracieux du serveur
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Attend la fin du serveur (Ctrl+C ou `shutdown()`)
    pub async fn wait(&mut self) {
        if let Some(h) = self.join_handle.take() {
            let _ = h.await;
        }
    }

    /// Adresse effectivement écoutée, une fois démarré
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Récupère les infos du serveur
    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            name: self.name.clone(),
            base_url: self.base_url.clone(),
            http_port: self.local_addr.map(|a| a.port()).unwrap_or(self.http_port),
        }
    }

    pub fn log_state(&self) -> Option<&LogState> {
        self.log_state.as_ref()
    }

    /// Initialise le système de logging et enregistre les routes de logs
    ///
    /// Monte `/log-sse`, `/log-dump` et `/api/log_setup`.
    ///
    /// ```rust,no_run
    /// # use pmoserver::{ServerBuilder, logs::LoggingOptions};
    /// # #[tokio::main]
    /// # async fn main() {
    /// let mut server = ServerBuilder::new_configured().build();
    /// server.init_logging(LoggingOptions::from_config()).await;
    /// # }
    /// ```
    pub async fn init_logging(&mut self, options: LoggingOptions) -> LogState {
        let log_state = init_logging(options);
        self.add_router("/", create_logs_router(log_state.clone()))
            .await;
        self.log_state = Some(log_state.clone());
        log_state
    }
}

/// Builder pattern
pub struct ServerBuilder {
    name: String,
    base_url: String,
    http_port: u16,
}

impl ServerBuilder {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, http_port: u16) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            http_port,
        }
    }

    pub fn new_configured() -> Self {
        let config = get_config();
        Self {
            name: DEFAULT_SERVER_NAME.to_string(),
            base_url: config.get_base_url(),
            http_port: config.get_http_port(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    /// Construit le serveur
    pub fn build(self) -> Server {
        Server::new(self.name, self.base_url, self.http_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        extract::State,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    async fn get_body(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_add_route_serves_json() {
        let mut server = ServerBuilder::new("Test", "localhost", 0).build();
        server
            .add_route("/api/status", || async { serde_json::json!({ "status": "ok" }) })
            .await;

        let (status, body) = get_body(server.router().await, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_handler_with_state_and_merged_router() {
        async fn greet(State(name): State<String>) -> String {
            format!("hello {}", name)
        }

        let mut server = Server::new("Test", "localhost", 0);
        server
            .add_handler_with_state("/greet", greet, "radio".to_string())
            .await;
        server
            .add_router("/", Router::new().route("/ping", get(|| async { "pong" })))
            .await;

        let (_, body) = get_body(server.router().await, "/greet").await;
        assert_eq!(body, "hello radio");
        let (_, body) = get_body(server.router().await, "/ping").await;
        assert_eq!(body, "pong");
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut server = Server::new("Test", "localhost", 0);
        server
            .add_route("/api/status", || async { "ok" })
            .await;

        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.info().http_port, addr.port());

        server.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), server.wait())
            .await
            .expect("server stopped");
    }
}
