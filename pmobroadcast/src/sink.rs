//! BroadcastSink - duplication du flux vers tous les auditeurs
//!
//! Le sink est une tâche tokio qui consomme un canal d'entrée unique. Les
//! producteurs (étages de pacing) s'y attachent via [`BroadcastSink::attach`]
//! et s'en détachent en relâchant leur [`SinkInput`].
//!
//! # Fan-out
//!
//! Pour chaque chunk reçu :
//! 1. Les canaux fermés (auditeur parti) sont retirés du registre
//! 2. Le chunk est envoyé à tous les autres en parallèle (`join_all`)
//! 3. Le chunk suivant n'est lu qu'une fois tous les envois acceptés
//!
//! Un auditeur lent ralentit donc toute la diffusion, mais aucun auditeur
//! ne reçoit le chunk k+1 avant le chunk k.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::registry::{ClientSinkRegistry, ListenerId};

/// Capacité du canal d'événements d'instrumentation
const EVENT_CAPACITY: usize = 256;

/// Événements publiés par le sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkEvent {
    /// Un producteur s'est attaché, `producers` est le nouveau total
    ProducerAttached { producers: usize },
    /// Un producteur s'est détaché, `producers` est le nouveau total
    ProducerDetached { producers: usize },
    /// Un auditeur a été retiré suite à un échec d'écriture
    ListenerPruned { id: ListenerId },
}

struct SinkShared {
    producers: AtomicUsize,
    forwarded: AtomicU64,
    events: broadcast::Sender<SinkEvent>,
}

impl SinkShared {
    fn emit(&self, event: SinkEvent) {
        // Aucun abonné : l'événement est simplement perdu
        let _ = self.events.send(event);
    }
}

/// Consommateur qui duplique chaque chunk vers tous les auditeurs
pub struct BroadcastSink {
    tx: mpsc::Sender<Bytes>,
    registry: ClientSinkRegistry,
    shared: Arc<SinkShared>,
    cancel: CancellationToken,
}

impl BroadcastSink {
    /// Démarre la tâche de fan-out sur `registry`
    ///
    /// `buffer` est la capacité du canal d'entrée (en chunks).
    pub fn spawn(registry: ClientSinkRegistry, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(SinkShared {
            producers: AtomicUsize::new(0),
            forwarded: AtomicU64::new(0),
            events,
        });
        let cancel = CancellationToken::new();

        tokio::spawn(run_fanout(
            rx,
            registry.clone(),
            shared.clone(),
            cancel.clone(),
        ));

        Self {
            tx,
            registry,
            shared,
            cancel,
        }
    }

    /// Attache un nouveau producteur
    pub fn attach(&self) -> SinkInput {
        let producers = self.shared.producers.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(producers, "Producer attached to broadcast sink");
        self.shared.emit(SinkEvent::ProducerAttached { producers });

        SinkInput {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Nombre de producteurs actuellement attachés
    pub fn producer_count(&self) -> usize {
        self.shared.producers.load(Ordering::SeqCst)
    }

    /// Nombre de chunks diffusés depuis le démarrage
    pub fn chunks_forwarded(&self) -> u64 {
        self.shared.forwarded.load(Ordering::Relaxed)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SinkEvent> {
        self.shared.events.subscribe()
    }

    pub fn registry(&self) -> &ClientSinkRegistry {
        &self.registry
    }
}

impl Drop for BroadcastSink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Entrée d'un producteur dans le sink
///
/// Le producteur est compté comme attaché tant que cette valeur existe.
pub struct SinkInput {
    tx: mpsc::Sender<Bytes>,
    shared: Arc<SinkShared>,
}

impl SinkInput {
    /// Envoie un chunk au sink. Retourne le chunk si le sink est arrêté.
    pub async fn send(&self, chunk: Bytes) -> Result<(), Bytes> {
        self.tx.send(chunk).await.map_err(|e| e.0)
    }
}

impl Drop for SinkInput {
    fn drop(&mut self) {
        let producers = self
            .shared
            .producers
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        trace!(producers, "Producer detached from broadcast sink");
        self.shared.emit(SinkEvent::ProducerDetached { producers });
    }
}

async fn run_fanout(
    mut rx: mpsc::Receiver<Bytes>,
    registry: ClientSinkRegistry,
    shared: Arc<SinkShared>,
    cancel: CancellationToken,
) {
    debug!("Broadcast sink started");

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = rx.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        let mut dead = Vec::new();
        let mut live = Vec::new();
        for (id, tx) in registry.snapshot() {
            if tx.is_closed() {
                dead.push(id);
            } else {
                live.push((id, tx));
            }
        }

        let sends = join_all(live.iter().map(|(id, tx)| {
            let chunk = chunk.clone();
            async move { (*id, tx.send(chunk).await.is_ok()) }
        }));

        let results = tokio::select! {
            _ = cancel.cancelled() => break,
            results = sends => results,
        };

        dead.extend(results.into_iter().filter(|(_, ok)| !ok).map(|(id, _)| id));
        if !dead.is_empty() {
            registry.prune(&dead);
            for id in dead {
                shared.emit(SinkEvent::ListenerPruned { id });
            }
        }

        shared.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    debug!("Broadcast sink stopped");
}
