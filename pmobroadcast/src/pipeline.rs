//! Suivi de fin d'une diffusion
//!
//! Chaque appel à `start()` crée une paire [`RunMonitor`] / [`PipelineHandle`].
//! Le moniteur est partagé par tous les étages de pacing du même run
//! (y compris ceux créés par une injection) ; le premier qui signale une fin
//! l'emporte.

use std::{fmt, sync::Arc};

use tokio::sync::watch;

/// Raison de la fin d'un run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEnd {
    /// La source a été lue jusqu'au bout
    Exhausted,
    /// Arrêt explicite (stop, redémarrage ou session relâchée)
    Stopped,
    /// Erreur de lecture ou sink fermé
    Failed(String),
}

impl fmt::Display for PipelineEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineEnd::Exhausted => write!(f, "source exhausted"),
            PipelineEnd::Stopped => write!(f, "stopped"),
            PipelineEnd::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Côté émetteur, détenu par les étages d'un run
#[derive(Clone)]
pub struct RunMonitor {
    tx: Arc<watch::Sender<Option<PipelineEnd>>>,
}

impl RunMonitor {
    pub fn new() -> (Self, PipelineHandle) {
        let (tx, rx) = watch::channel(None);
        (Self { tx: Arc::new(tx) }, PipelineHandle { rx })
    }

    /// Signale la fin du run. Retourne `false` si une fin était déjà connue.
    pub fn finish(&self, end: PipelineEnd) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(end);
                true
            }
        })
    }

    pub fn is_finished(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

/// Handle retourné par `start()`, résolu à la fin du run
#[derive(Clone)]
pub struct PipelineHandle {
    rx: watch::Receiver<Option<PipelineEnd>>,
}

impl PipelineHandle {
    /// Attend la fin du run
    ///
    /// Si tous les moniteurs ont disparu sans signaler de fin, le run est
    /// considéré comme arrêté.
    pub async fn wait(mut self) -> PipelineEnd {
        let seen = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map(|end| (*end).clone());

        match seen {
            Ok(Some(end)) => end,
            _ => self.rx.borrow().clone().unwrap_or(PipelineEnd::Stopped),
        }
    }

    /// Fin du run si elle est déjà connue
    pub fn end(&self) -> Option<PipelineEnd> {
        self.rx.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.rx.borrow().is_some()
    }
}
