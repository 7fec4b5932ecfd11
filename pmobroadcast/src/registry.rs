//! Registre des auditeurs connectés
//!
//! Chaque auditeur possède un canal borné dont le [`BroadcastSink`](crate::BroadcastSink)
//! détient l'extrémité émettrice. L'extrémité réceptrice est exposée sous la
//! forme d'un [`ListenerStream`], utilisable directement comme corps de
//! réponse HTTP. Relâcher le stream désinscrit l'auditeur.

use std::{
    collections::HashMap,
    fmt,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Identifiant opaque d'un auditeur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct RegistryInner {
    sinks: Mutex<HashMap<ListenerId, mpsc::Sender<Bytes>>>,
    buffer: usize,
}

impl RegistryInner {
    fn sinks(&self) -> MutexGuard<'_, HashMap<ListenerId, mpsc::Sender<Bytes>>> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: ListenerId) -> bool {
        let removed = self.sinks().remove(&id).is_some();
        if removed {
            info!(listener = %id, "Listener unregistered");
        }
        removed
    }
}

/// Table concurrente `ListenerId → canal de sortie`
#[derive(Clone)]
pub struct ClientSinkRegistry {
    inner: Arc<RegistryInner>,
}

impl ClientSinkRegistry {
    /// Crée un registre dont chaque canal peut retenir `buffer` chunks
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sinks: Mutex::new(HashMap::new()),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Enregistre un nouvel auditeur et retourne son flux de sortie
    pub fn register(&self) -> (ListenerId, ListenerStream) {
        let id = ListenerId::new();
        let (tx, rx) = mpsc::channel(self.inner.buffer);

        let count = {
            let mut sinks = self.inner.sinks();
            sinks.insert(id, tx);
            sinks.len()
        };
        info!(listener = %id, listeners = count, "Listener registered");

        let stream = ListenerStream {
            id,
            rx,
            registry: Arc::downgrade(&self.inner),
        };
        (id, stream)
    }

    /// Retire un auditeur. Sans effet si l'id est inconnu.
    pub fn unregister(&self, id: ListenerId) -> bool {
        self.inner.remove(id)
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.inner.sinks().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.sinks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copie des canaux vivants, prise sous verrou
    pub(crate) fn snapshot(&self) -> Vec<(ListenerId, mpsc::Sender<Bytes>)> {
        self.inner
            .sinks()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect()
    }

    /// Retire les auditeurs dont l'écriture a échoué
    pub(crate) fn prune(&self, ids: &[ListenerId]) {
        if ids.is_empty() {
            return;
        }
        let mut sinks = self.inner.sinks();
        for id in ids {
            if sinks.remove(id).is_some() {
                debug!(listener = %id, "Pruned dead listener");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, tx: mpsc::Sender<Bytes>) -> ListenerId {
        let id = ListenerId::new();
        self.inner.sinks().insert(id, tx);
        id
    }
}

impl fmt::Debug for ClientSinkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSinkRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Flux d'octets reçu par un auditeur
///
/// Se termine quand l'auditeur est retiré du registre. Le `Drop` le
/// désinscrit (fermeture de connexion).
pub struct ListenerStream {
    id: ListenerId,
    rx: mpsc::Receiver<Bytes>,
    registry: Weak<RegistryInner>,
}

impl ListenerStream {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Attend le prochain chunk
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Stream for ListenerStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}

impl Drop for ListenerStream {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}
