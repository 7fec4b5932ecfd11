//! PacingStage - émission au rythme de la lecture
//!
//! Un étage de pacing est une tâche tokio qui lit une source d'octets et
//! la pousse vers le [`BroadcastSink`](crate::BroadcastSink) sans dépasser
//! `rate` octets par seconde. Sans lui, le fichier entier serait envoyé en
//! rafale aux auditeurs.
//!
//! # Commandes
//!
//! L'étage est piloté par messages :
//! - `connect` : branche (ou remplace) la source amont et remet l'horloge à zéro
//! - `detach` : suspend la lecture, se détache du sink et rend la source
//!   amont, précédée du chunk lu mais pas encore émis
//! - `stop` : termine l'étage (idempotent)
//!
//! Un étage sans source attend simplement une commande : c'est l'état de
//! l'étage `next` pendant une injection.

use std::{
    fmt,
    io::Cursor,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::AsyncReadExt,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, trace, warn};

use crate::{
    pipeline::{PipelineEnd, RunMonitor},
    processor::ByteSource,
    sink::SinkInput,
};

/// Taille minimale d'un chunk émis
const MIN_CHUNK: usize = 256;

/// Taille maximale d'un chunk émis
const MAX_CHUNK: usize = 64 * 1024;

static NEXT_STAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifiant unique d'un étage de pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(u64);

impl StageId {
    /// Alloue un nouvel identifiant
    pub fn next() -> Self {
        Self(NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage-{}", self.0)
    }
}

/// Raison de la fin d'un étage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageExit {
    /// La source amont est épuisée
    Exhausted,
    /// Arrêt explicite
    Stopped,
    /// Détaché du sink, la source amont a été rendue
    Detached,
    /// Le sink n'accepte plus de données
    SinkClosed,
    /// Erreur de lecture de la source
    Failed(String),
}

impl StageExit {
    /// Fin de run correspondante. Un détachement ne termine pas le run.
    fn pipeline_end(&self) -> Option<PipelineEnd> {
        match self {
            StageExit::Exhausted => Some(PipelineEnd::Exhausted),
            StageExit::Stopped => Some(PipelineEnd::Stopped),
            StageExit::SinkClosed => Some(PipelineEnd::Failed("broadcast sink closed".into())),
            StageExit::Failed(reason) => Some(PipelineEnd::Failed(reason.clone())),
            StageExit::Detached => None,
        }
    }
}

enum StageCommand {
    Connect(ByteSource),
    Detach(oneshot::Sender<Option<ByteSource>>),
    Stop,
}

/// Taille des chunks pour un rythme donné (environ 100 ms de lecture)
pub fn chunk_size_for(rate: u64) -> usize {
    ((rate / 10) as usize).clamp(MIN_CHUNK, MAX_CHUNK)
}

/// Étage de pacing attaché au sink
pub struct PacingStage {
    id: StageId,
    rate: u64,
    commands: mpsc::UnboundedSender<StageCommand>,
    task: JoinHandle<StageExit>,
}

impl PacingStage {
    /// Démarre un étage à `rate` octets/s, attaché au sink via `output`
    ///
    /// L'étage n'a pas encore de source : voir [`PacingStage::connect`].
    pub fn attach(id: StageId, rate: u64, output: SinkInput, monitor: RunMonitor) -> Self {
        let rate = rate.max(1);
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_stage(id, rate, output, monitor, rx));

        debug!(stage = %id, rate, "Pacing stage attached");
        Self {
            id,
            rate,
            commands,
            task,
        }
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Branche une source amont. Retourne `false` si l'étage est terminé.
    pub fn connect(&self, upstream: ByteSource) -> bool {
        self.commands.send(StageCommand::Connect(upstream)).is_ok()
    }

    /// Suspend l'étage, le détache du sink et récupère sa source amont
    pub async fn detach(&self) -> Option<ByteSource> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(StageCommand::Detach(tx)).is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Termine l'étage. Sans effet s'il est déjà terminé.
    pub fn stop(&self) {
        let _ = self.commands.send(StageCommand::Stop);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Attend la fin de la tâche
    pub async fn join(self) -> StageExit {
        let id = self.id;
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(stage = %id, "Pacing task aborted: {}", e);
                StageExit::Failed(e.to_string())
            }
        }
    }
}

impl fmt::Debug for PacingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacingStage")
            .field("id", &self.id)
            .field("rate", &self.rate)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Horloge de libération des octets
///
/// Le chunk suivant est libéré quand la durée écoulée depuis `started`
/// couvre la lecture des octets déjà émis. Après un blocage du sink,
/// l'horloge ne garde pas plus d'un chunk de retard : le temps perdu n'est
/// pas rattrapé en rafale.
struct PacingClock {
    rate: u64,
    slack: Duration,
    started: Instant,
    released: u64,
}

impl PacingClock {
    fn new(rate: u64) -> Self {
        Self {
            rate,
            slack: Duration::from_secs_f64(chunk_size_for(rate) as f64 / rate as f64),
            started: Instant::now(),
            released: 0,
        }
    }

    fn reset(&mut self) {
        self.started = Instant::now();
        self.released = 0;
    }

    fn next_release(&self) -> Instant {
        self.started + Duration::from_secs_f64(self.released as f64 / self.rate as f64)
    }

    fn record(&mut self, bytes: usize) {
        self.released += bytes as u64;

        let now = Instant::now();
        let next = self.next_release();
        if next + self.slack < now {
            self.started += now - (next + self.slack);
        }
    }
}

enum Wake {
    Command(Option<StageCommand>),
    Read(std::io::Result<usize>),
    Sent(Result<(), Bytes>),
}

async fn read_chunk(upstream: Option<&mut ByteSource>, buf: &mut [u8]) -> std::io::Result<usize> {
    match upstream {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn release_at(output: &SinkInput, chunk: Bytes, at: Instant) -> Result<(), Bytes> {
    sleep_until(at).await;
    output.send(chunk).await
}

/// Remet le chunk en attente devant la source amont
fn reclaim(upstream: Option<ByteSource>, pending: Option<Bytes>) -> Option<ByteSource> {
    match (upstream, pending) {
        (Some(upstream), Some(chunk)) => Some(Box::new(Cursor::new(chunk).chain(upstream))),
        (Some(upstream), None) => Some(upstream),
        (None, Some(chunk)) => Some(Box::new(Cursor::new(chunk))),
        (None, None) => None,
    }
}

async fn run_stage(
    id: StageId,
    rate: u64,
    output: SinkInput,
    monitor: RunMonitor,
    mut commands: mpsc::UnboundedReceiver<StageCommand>,
) -> StageExit {
    let mut buf = vec![0u8; chunk_size_for(rate)];
    let mut upstream: Option<ByteSource> = None;
    let mut pending: Option<Bytes> = None;
    let mut clock = PacingClock::new(rate);

    let exit = loop {
        let wake = tokio::select! {
            biased;

            command = commands.recv() => Wake::Command(command),

            read = read_chunk(upstream.as_mut(), &mut buf), if pending.is_none() && upstream.is_some() => {
                Wake::Read(read)
            }

            sent = release_at(&output, pending.clone().unwrap_or_default(), clock.next_release()), if pending.is_some() => {
                Wake::Sent(sent)
            }
        };

        match wake {
            Wake::Command(Some(StageCommand::Connect(source))) => {
                trace!(stage = %id, "Upstream connected");
                upstream = Some(source);
                pending = None;
                clock.reset();
            }
            Wake::Command(Some(StageCommand::Detach(reply))) => {
                // Le sink doit voir le détachement avant que la source ne change de main
                drop(output);
                let _ = reply.send(reclaim(upstream.take(), pending.take()));
                debug!(stage = %id, "Pacing stage detached");
                return StageExit::Detached;
            }
            Wake::Command(Some(StageCommand::Stop)) | Wake::Command(None) => {
                break StageExit::Stopped;
            }
            Wake::Read(Ok(0)) => break StageExit::Exhausted,
            Wake::Read(Ok(n)) => {
                pending = Some(Bytes::copy_from_slice(&buf[..n]));
            }
            Wake::Read(Err(e)) => {
                warn!(stage = %id, "Upstream read failed: {}", e);
                break StageExit::Failed(e.to_string());
            }
            Wake::Sent(Ok(())) => {
                if let Some(chunk) = pending.take() {
                    clock.record(chunk.len());
                }
            }
            Wake::Sent(Err(_)) => break StageExit::SinkClosed,
        }
    };

    if let Some(end) = exit.pipeline_end() {
        monitor.finish(end);
    }

    debug!(stage = %id, released = clock.released, "Pacing stage ended: {:?}", exit);
    exit
}
