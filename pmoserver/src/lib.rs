//! # pmoserver - Serveur web haut niveau basé sur Axum
//!
//! Cette crate fournit une abstraction simple pour créer le serveur HTTP de
//! PMOBroadcast et brancher les routes des autres crates.
//!
//! ## Fonctionnalités
//!
//! - **API de haut niveau** : routes JSON, handlers avec état, sous-routers
//! - **Server-Sent Events** : logs en temps réel via `/log-sse`
//! - **Arrêt gracieux** : Ctrl+C ou `Server::shutdown()`
//!
//! ## Architecture
//!
//! - [`server`] : serveur principal et builder
//! - [`logs`] : capture des logs `tracing` et routes associées
//!
//! ## Exemple d'utilisation
//!
//! ```rust,no_run
//! use pmoserver::{ServerBuilder, logs::LoggingOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut server = ServerBuilder::new("MyServer", "localhost", 8080).build();
//!     server.init_logging(LoggingOptions::default()).await;
//!
//!     server.add_route("/api/status", || async {
//!         serde_json::json!({"status": "ok"})
//!     }).await;
//!
//!     server.start().await?;
//!     server.wait().await;
//!     Ok(())
//! }
//! ```
//!
//! Les crates qui exposent des routes le font via un trait d'extension
//! implémenté pour [`Server`] (voir `pmobroadcast::BroadcastServerExt`).

pub mod logs;
pub mod server;

pub use logs::{LogState, LoggingOptions, SseLayer, log_dump, log_sse};
pub use server::{Server, ServerBuilder, ServerInfo};
