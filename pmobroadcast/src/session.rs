//! BroadcastSession - propriétaire du pipeline de diffusion
//!
//! La session possède la source courante, son débit, les étages de pacing
//! vivants et le [`BroadcastSink`]. Toutes les opérations qui modifient
//! l'état (`start`, `stop`, `inject_effect`) passent par un même mutex et par
//! la [`SpliceMachine`] : la machine décide, la session exécute.
//!
//! ```text
//! source ──▶ PacingStage ──▶ BroadcastSink ──▶ { ListenerStream₁ … ListenerStreamₙ }
//! ```
//!
//! La session n'est pas un singleton : elle est construite explicitement
//! et partagée par clonage (le clone partage le même état).

use std::{collections::HashMap, fmt, path::PathBuf, sync::Arc};

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use crate::{
    error::{Error, Result},
    injector::EffectInjector,
    pacing::{PacingStage, StageId},
    pipeline::{PipelineHandle, RunMonitor},
    probe::BitrateProbe,
    processor::{AudioProcessor, ByteSource},
    registry::{ClientSinkRegistry, ListenerId, ListenerStream},
    settings::BroadcastSettings,
    sink::BroadcastSink,
    splice::{Action, Event, Phase, SpliceMachine},
};

/// État mutable de la session, protégé par le mutex
pub(crate) struct SessionState {
    pub(crate) machine: SpliceMachine,
    source: PathBuf,
    bitrate: Option<u64>,
    rate: u64,
    stages: HashMap<StageId, PacingStage>,
    monitor: Option<RunMonitor>,
}

pub(crate) struct SessionInner {
    settings: BroadcastSettings,
    probe: BitrateProbe,
    injector: EffectInjector,
    registry: ClientSinkRegistry,
    sink: BroadcastSink,
    state: Mutex<SessionState>,
}

/// Session de diffusion
#[derive(Clone)]
pub struct BroadcastSession {
    inner: Arc<SessionInner>,
}

impl BroadcastSession {
    /// Crée une session arrêtée sur `settings.default_source`
    ///
    /// Doit être appelé dans un runtime tokio (la tâche du sink démarre
    /// immédiatement).
    pub fn new(settings: BroadcastSettings, processor: Arc<dyn AudioProcessor>) -> Self {
        let registry = ClientSinkRegistry::new(settings.listener_buffer);
        let sink = BroadcastSink::spawn(registry.clone(), settings.sink_buffer);
        let probe = BitrateProbe::new(processor.clone(), settings.fallback_bitrate);
        let injector = EffectInjector::new(processor, settings.mixer_timeout);

        let state = SessionState {
            machine: SpliceMachine::new(),
            source: settings.default_source.clone(),
            bitrate: None,
            rate: settings.pacing_rate(settings.fallback_bitrate),
            stages: HashMap::new(),
            monitor: None,
        };

        Self {
            inner: Arc::new(SessionInner {
                settings,
                probe,
                injector,
                registry,
                sink,
                state: Mutex::new(state),
            }),
        }
    }

    /// Connecte un nouvel auditeur
    pub fn register_listener(&self) -> (ListenerId, ListenerStream) {
        self.inner.registry.register()
    }

    /// Déconnecte un auditeur. Sans effet si l'id est inconnu.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.inner.registry.unregister(id)
    }

    /// Démarre (ou redémarre depuis le début) la diffusion de la source courante
    ///
    /// Retourne un [`PipelineHandle`] résolu quand le run se termine. Si la
    /// source ne peut pas être ouverte, l'état de la session est inchangé.
    pub async fn start(&self) -> Result<PipelineHandle> {
        let path = self.inner.lock().await.source.clone();

        let bitrate = self.inner.probe.probe(&path).await;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|source| Error::SourceUnreadable {
                path: path.clone(),
                source,
            })?;

        let mut state = self.inner.lock().await;
        self.inner.reap(&mut state).await;

        let stage = StageId::next();
        let actions = state.machine.apply(Event::Start { stage })?;

        let (monitor, handle) = RunMonitor::new();
        state.bitrate = Some(bitrate);
        state.rate = self.inner.settings.pacing_rate(bitrate);
        state.monitor = Some(monitor);

        let mut upstream: Option<ByteSource> = Some(Box::new(file));
        self.inner.execute(&mut state, actions, &mut upstream).await;

        info!(
            source = %path.display(),
            bitrate,
            rate = state.rate,
            %stage,
            "Broadcast started"
        );
        Ok(handle)
    }

    /// Arrête la diffusion. Sans effet si rien n'est en cours.
    ///
    /// Les auditeurs restent connectés et reprendront au prochain `start()`.
    pub async fn stop(&self) {
        let mut state = self.inner.lock().await;
        self.inner.reap(&mut state).await;

        let actions = match state.machine.apply(Event::Stop) {
            Ok(actions) => actions,
            Err(rejection) => {
                trace!("Stop rejected: {}", rejection);
                Vec::new()
            }
        };
        if actions.is_empty() {
            debug!("Stop requested while idle");
            return;
        }

        self.inner.execute(&mut state, actions, &mut None).await;
        state.monitor = None;
        info!("Broadcast stopped");
    }

    /// Mixe `effect` dans la diffusion en cours sans interrompre les auditeurs
    ///
    /// L'étage courant est remplacé par un étage alimenté par le mixeur ;
    /// le sink garde au moins un producteur pendant toute la bascule.
    ///
    /// # Errors
    ///
    /// - [`Error::EffectNotFound`] si le fichier n'existe pas
    /// - [`Error::NotPlaying`] si rien n'est diffusé, ou si la session a été
    ///   arrêtée pendant l'injection
    /// - [`Error::SpliceInProgress`] si une autre injection est en cours
    /// - [`Error::MergeFailed`] si le mixeur n'a pas démarré ou s'est fermé
    ///   sans rien produire (la source d'origine a repris)
    pub async fn inject_effect(&self, effect: impl Into<PathBuf>) -> Result<()> {
        let effect = effect.into();
        self.inner.injector.inject(&self.inner, &effect).await
    }

    /// Change la source utilisée par le prochain `start()`
    pub async fn set_source(&self, source: impl Into<PathBuf>) {
        self.inner.lock().await.source = source.into();
    }

    pub async fn source(&self) -> PathBuf {
        self.inner.lock().await.source.clone()
    }

    /// Débit sondé lors du dernier `start()`
    pub async fn bitrate(&self) -> Option<u64> {
        self.inner.lock().await.bitrate
    }

    /// Phase courante (après prise en compte des étages terminés)
    pub async fn phase(&self) -> Phase {
        let mut state = self.inner.lock().await;
        self.inner.reap(&mut state).await;
        state.machine.phase().clone()
    }

    pub async fn is_playing(&self) -> bool {
        self.phase().await.is_live()
    }

    pub fn settings(&self) -> &BroadcastSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &ClientSinkRegistry {
        &self.inner.registry
    }

    pub fn sink(&self) -> &BroadcastSink {
        &self.inner.sink
    }
}

impl fmt::Debug for BroadcastSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastSession")
            .field("listeners", &self.inner.registry.len())
            .field("producers", &self.inner.sink.producer_count())
            .finish()
    }
}

impl SessionInner {
    pub(crate) async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    /// Retire les étages terminés d'eux-mêmes et met la machine à jour
    pub(crate) async fn reap(&self, state: &mut SessionState) {
        let finished: Vec<StageId> = state
            .stages
            .iter()
            .filter(|(_, stage)| stage.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for id in finished {
            if let Some(stage) = state.stages.remove(&id) {
                let exit = stage.join().await;
                debug!(stage = %id, "Reaped pacing stage: {:?}", exit);
                if let Err(rejection) = state.machine.apply(Event::Exhausted { stage: id }) {
                    trace!(stage = %id, "Ignored stage exit: {}", rejection);
                }
            }
        }

        if !state.machine.phase().is_live() {
            state.monitor = None;
        }
    }

    /// Exécute les actions décidées par la machine
    ///
    /// `upstream` contient la source à connecter (`Launch`, `ConnectMerged`,
    /// `RestorePrimary`) ou reçoit la source détachée (`DetachRetiring`).
    pub(crate) async fn execute(
        &self,
        state: &mut SessionState,
        actions: Vec<Action>,
        upstream: &mut Option<ByteSource>,
    ) {
        for action in actions {
            trace!("Executing {:?}", action);
            match action {
                Action::Launch { stage } => {
                    let pacing = self.attach_stage(state, stage);
                    Self::connect(pacing, upstream.take());
                }
                Action::AttachNext { stage } => {
                    self.attach_stage(state, stage);
                }
                Action::DetachRetiring { stage } => {
                    if let Some(pacing) = state.stages.remove(&stage) {
                        *upstream = pacing.detach().await;
                        let exit = pacing.join().await;
                        debug!(%stage, "Retired pacing stage: {:?}", exit);
                    }
                }
                Action::ConnectMerged { stage } | Action::RestorePrimary { stage } => {
                    match state.stages.get(&stage) {
                        Some(pacing) => Self::connect(pacing, upstream.take()),
                        None => warn!(%stage, "Pacing stage vanished before connection"),
                    }
                }
                Action::End { stage } => {
                    if let Some(pacing) = state.stages.remove(&stage) {
                        pacing.stop();
                        let exit = pacing.join().await;
                        debug!(%stage, "Ended pacing stage: {:?}", exit);
                    }
                }
            }
        }
    }

    fn attach_stage<'a>(&self, state: &'a mut SessionState, id: StageId) -> &'a PacingStage {
        let monitor = state
            .monitor
            .get_or_insert_with(|| RunMonitor::new().0)
            .clone();
        let stage = PacingStage::attach(id, state.rate, self.sink.attach(), monitor);
        state.stages.entry(id).or_insert(stage)
    }

    fn connect(stage: &PacingStage, upstream: Option<ByteSource>) {
        match upstream {
            Some(upstream) => {
                if !stage.connect(upstream) {
                    warn!(stage = %stage.id(), "Pacing stage ended before its upstream was connected");
                }
            }
            None => warn!(stage = %stage.id(), "No upstream available for pacing stage"),
        }
    }
}
