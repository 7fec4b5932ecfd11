//! Extension pmoserver pour la diffusion
//!
//! Ce module fournit le trait [`BroadcastServerExt`] qui monte sur un
//! `pmoserver::Server` les routes HTTP de la diffusion :
//!
//! - `GET /` : redirection vers `/home`
//! - `GET /home`, `GET /controller` : pages de l'auditeur et du contrôleur
//! - `GET /stream` : flux audio d'un nouvel auditeur
//! - `POST /controller` : commande JSON `{"command": "..."}`
//! - `GET /{*file}` : fichiers statiques du répertoire public

use std::{path::PathBuf, sync::Arc};

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

use crate::{
    controller::{CommandRequest, Controller},
    files::{open_public, CONTROLLER_PAGE, HOME_PAGE},
};

/// État partagé par les handlers HTTP
#[derive(Clone)]
pub struct BroadcastHttpState {
    controller: Controller,
    public_dir: Arc<PathBuf>,
}

impl BroadcastHttpState {
    pub fn new(controller: Controller, public_dir: impl Into<PathBuf>) -> Self {
        Self {
            controller,
            public_dir: Arc::new(public_dir.into()),
        }
    }
}

/// Crée le router de la diffusion
pub fn broadcast_router(state: BroadcastHttpState) -> Router {
    Router::new()
        .route("/", get(redirect_home))
        .route("/home", get(home_page))
        .route("/controller", get(controller_page).post(handle_command))
        .route("/stream", get(listener_stream))
        .route("/{*file}", get(public_file))
        .with_state(state)
}

async fn redirect_home() -> Response {
    (StatusCode::FOUND, [(header::LOCATION, "/home")]).into_response()
}

async fn home_page(State(state): State<BroadcastHttpState>) -> Response {
    serve_public(&state, HOME_PAGE).await
}

async fn controller_page(State(state): State<BroadcastHttpState>) -> Response {
    serve_public(&state, CONTROLLER_PAGE).await
}

async fn public_file(State(state): State<BroadcastHttpState>, Path(file): Path<String>) -> Response {
    serve_public(&state, &file).await
}

async fn listener_stream(State(state): State<BroadcastHttpState>) -> Response {
    let (id, stream) = state.controller.session().register_listener();
    info!(listener = %id, "Listener connected to /stream");

    (
        [
            (header::CONTENT_TYPE, "audio/mpeg"),
            (header::ACCEPT_RANGES, "bytes"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn handle_command(State(state): State<BroadcastHttpState>, body: Bytes) -> Response {
    let request: CommandRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("Malformed command body: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("Malformed command: {}", e) })),
            )
                .into_response();
        }
    };

    match state.controller.handle_command(&request.command).await {
        Ok(result) => Json(result).into_response(),
        Err(e) if e.is_not_found() => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
        Err(e) => {
            error!("Command '{}' failed: {}", request.command, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn serve_public(state: &BroadcastHttpState, request: &str) -> Response {
    match open_public(&state.public_dir, request).await {
        Ok((file, content_type)) => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            if let Some(content_type) = content_type {
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
            }
            response
        }
        Err(e) if e.is_not_found() => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!("Failed to serve {}: {}", request, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Trait d'extension pour monter la diffusion sur un serveur pmoserver
pub trait BroadcastServerExt {
    /// Enregistre les routes de la diffusion
    ///
    /// # Exemple
    ///
    /// ```rust,ignore
    /// use pmobroadcast::{BroadcastServerExt, Controller};
    ///
    /// let mut server = ServerBuilder::new_configured().build();
    /// server.init_broadcast(controller, "public".into()).await?;
    /// server.start().await?;
    /// ```
    async fn init_broadcast(
        &mut self,
        controller: Controller,
        public_dir: PathBuf,
    ) -> anyhow::Result<BroadcastHttpState>;
}

impl BroadcastServerExt for pmoserver::Server {
    async fn init_broadcast(
        &mut self,
        controller: Controller,
        public_dir: PathBuf,
    ) -> anyhow::Result<BroadcastHttpState> {
        if !public_dir.is_dir() {
            warn!("Public directory {} does not exist", public_dir.display());
        }

        let state = BroadcastHttpState::new(controller, public_dir);
        self.add_router("/", broadcast_router(state.clone())).await;
        info!("Broadcast routes registered");
        Ok(state)
    }
}
