//! EffectInjector - mixage d'un effet dans la diffusion en cours
//!
//! L'injection se déroule en trois temps :
//!
//! 1. **Sous verrou** : la machine passe en `Splicing`. Un nouvel étage
//!    `next` est attaché au sink *avant* que l'étage courant ne soit
//!    détaché, le sink a donc toujours au moins un producteur. L'étage
//!    courant est ensuite suspendu et rend sa source amont (le flux en cours
//!    de lecture, pas une nouvelle copie).
//! 2. **Hors verrou** : le mixeur externe est lancé ; une tâche recopie la
//!    source amont vers son entrée, puis on attend le premier chunk mixé.
//!    Les auditeurs ne sont pas bloqués pendant ce temps, `next` est
//!    simplement vide.
//! 3. **Sous verrou** : si la machine est toujours dans la même injection,
//!    la sortie du mixeur est connectée à `next`. Si le mixeur n'a pas
//!    démarré ou s'est fermé sans rien produire, c'est le reste de la source
//!    d'origine qui est reconnecté. Si la session a été arrêtée ou
//!    redémarrée entre-temps, le mixeur est abandonné.
//!
//! Un mixeur qui meurt plus tard, avant d'avoir consommé toute la source,
//! est détecté par [`MergedStream`] : l'étage reprend alors la source
//! d'origine là où la recopie s'était arrêtée. Les octets déjà confiés au
//! mixeur mais pas encore restitués sont perdus.

use std::{
    future::Future,
    io::Cursor,
    path::Path,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    pacing::StageId,
    processor::{AudioProcessor, ByteSink, ByteSource},
    session::SessionInner,
    splice::{Event, Rejection},
};

/// Taille des lectures de la recopie vers le mixeur
const PUMP_CHUNK: usize = 8 * 1024;

/// Taille de la première lecture sur la sortie du mixeur
const FIRST_READ: usize = 4 * 1024;

/// Exécute les injections d'effets pour une session
pub(crate) struct EffectInjector {
    processor: Arc<dyn AudioProcessor>,
    startup_timeout: Duration,
}

impl EffectInjector {
    /// `startup_timeout` borne l'attente du premier chunk mixé
    pub(crate) fn new(processor: Arc<dyn AudioProcessor>, startup_timeout: Duration) -> Self {
        Self {
            processor,
            startup_timeout,
        }
    }

    pub(crate) async fn inject(&self, session: &SessionInner, effect: &Path) -> Result<()> {
        if !tokio::fs::try_exists(effect).await.unwrap_or(false) {
            return Err(Error::EffectNotFound(effect.display().to_string()));
        }

        // 1. Bascule vers `next`
        let next = StageId::next();
        let primary = {
            let mut state = session.lock().await;
            session.reap(&mut state).await;

            let actions = state.machine.apply(Event::Inject {
                effect: effect.to_path_buf(),
                next,
            })?;

            let mut detached = None;
            session.execute(&mut state, actions, &mut detached).await;
            detached
        };
        debug!(stage = %next, effect = %effect.display(), "Splice started");

        // 2. Lancement du mixeur
        let primary: ByteSource = match primary {
            Some(primary) => primary,
            None => {
                warn!("Retired stage had no upstream, mixing the effect alone");
                Box::new(tokio::io::empty())
            }
        };
        let (event, mut upstream, failure) = match self.processor.spawn_mixer(effect).await {
            Ok(mixer) => {
                let (input, output) = mixer.split();
                let cancel = CancellationToken::new();
                let pump = tokio::spawn(pump(primary, input, cancel.clone(), next));

                match first_output(output, self.startup_timeout).await {
                    Ok(output) => {
                        let merged: ByteSource =
                            Box::new(MergedStream::new(next, output, pump, cancel));
                        (Event::MergeReady { next }, Some(merged), None)
                    }
                    Err(reason) => {
                        warn!(effect = %effect.display(), "Mixer {}, resuming source", reason);
                        cancel.cancel();
                        let rest = reclaim(pump, next).await;
                        (Event::MergeFailed { next }, Some(rest), Some(reason))
                    }
                }
            }
            Err(e) => {
                warn!(effect = %effect.display(), "Mixer failed to start, resuming source: {}", e);
                (Event::MergeFailed { next }, Some(primary), Some(e.to_string()))
            }
        };

        // 3. Validation
        let mut state = session.lock().await;
        match state.machine.apply(event) {
            Ok(actions) => {
                session.execute(&mut state, actions, &mut upstream).await;
            }
            Err(Rejection::Stale) => {
                info!(stage = %next, "Splice abandoned, the broadcast was stopped meanwhile");
                return Err(Error::NotPlaying);
            }
            Err(rejection) => return Err(rejection.into()),
        }

        match failure {
            Some(reason) => Err(Error::MergeFailed(reason)),
            None => {
                info!(stage = %next, effect = %effect.display(), "Sound effect injected");
                Ok(())
            }
        }
    }
}

/// Attend le premier chunk mixé et le remet devant la sortie du mixeur
async fn first_output(
    mut output: ByteSource,
    timeout: Duration,
) -> std::result::Result<ByteSource, String> {
    let mut first = vec![0u8; FIRST_READ];
    match tokio::time::timeout(timeout, output.read(&mut first)).await {
        Ok(Ok(0)) => Err("closed its output before producing audio".into()),
        Ok(Ok(n)) => {
            first.truncate(n);
            Ok(Box::new(Cursor::new(first).chain(output)))
        }
        Ok(Err(e)) => Err(format!("output failed: {}", e)),
        Err(_) => Err(format!("produced no audio within {:?}", timeout)),
    }
}

/// Récupère ce que la recopie n'a pas confié au mixeur
async fn reclaim(pump: JoinHandle<Option<ByteSource>>, stage: StageId) -> ByteSource {
    match pump.await {
        Ok(Some(rest)) => rest,
        Ok(None) => Box::new(tokio::io::empty()),
        Err(e) => {
            warn!(%stage, "Mixer feed task failed: {}", e);
            Box::new(tokio::io::empty())
        }
    }
}

enum Feed {
    Cancelled,
    Read(std::io::Result<usize>),
    Written(std::io::Result<usize>),
}

/// Recopie la source d'origine vers l'entrée du mixeur
///
/// Retourne `None` si la source a été entièrement confiée au mixeur, sinon
/// le reste de la source (précédé des octets lus mais pas encore écrits).
async fn pump(
    mut primary: ByteSource,
    mut input: ByteSink,
    cancel: CancellationToken,
    stage: StageId,
) -> Option<ByteSource> {
    let mut buf = vec![0u8; PUMP_CHUNK];
    let mut copied = 0u64;

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => Feed::Cancelled,
            read = primary.read(&mut buf) => Feed::Read(read),
        };
        let n = match read {
            Feed::Read(Ok(0)) => break,
            Feed::Read(Ok(n)) => n,
            Feed::Read(Err(e)) => {
                warn!(%stage, "Primary source read failed: {}", e);
                break;
            }
            Feed::Cancelled | Feed::Written(_) => return Some(primary),
        };

        let mut written = 0;
        while written < n {
            let wrote = tokio::select! {
                biased;
                _ = cancel.cancelled() => Feed::Cancelled,
                wrote = input.write(&buf[written..n]) => Feed::Written(wrote),
            };
            match wrote {
                Feed::Written(Ok(k)) if k > 0 => written += k,
                other => {
                    if let Feed::Written(Err(e)) = other {
                        debug!(%stage, copied, "Mixer input closed: {}", e);
                    }
                    let unsent = Bytes::copy_from_slice(&buf[written..n]);
                    return Some(Box::new(Cursor::new(unsent).chain(primary)));
                }
            }
        }
        copied += n as u64;
    }

    debug!(%stage, copied, "Primary source fully fed to the mixer");
    if let Err(e) = input.shutdown().await {
        debug!(%stage, "Failed to close mixer input: {}", e);
    }
    None
}

enum MergeState {
    Mixing {
        output: ByteSource,
        pump: JoinHandle<Option<ByteSource>>,
    },
    Recovering {
        pump: JoinHandle<Option<ByteSource>>,
    },
    Resumed(ByteSource),
    Finished,
}

/// Sortie du mixeur surveillée
///
/// Si le mixeur se ferme (ou échoue) alors que la source d'origine n'a pas
/// été entièrement recopiée, la lecture continue sur le reste de la source.
struct MergedStream {
    stage: StageId,
    state: MergeState,
    cancel: CancellationToken,
}

impl MergedStream {
    fn new(
        stage: StageId,
        output: ByteSource,
        pump: JoinHandle<Option<ByteSource>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stage,
            state: MergeState::Mixing { output, pump },
            cancel,
        }
    }
}

impl AsyncRead for MergedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            match std::mem::replace(&mut this.state, MergeState::Finished) {
                MergeState::Mixing { mut output, pump } => {
                    let before = buf.filled().len();
                    match Pin::new(&mut output).poll_read(cx, buf) {
                        Poll::Pending => {
                            this.state = MergeState::Mixing { output, pump };
                            return Poll::Pending;
                        }
                        Poll::Ready(Ok(())) if buf.filled().len() > before => {
                            this.state = MergeState::Mixing { output, pump };
                            return Poll::Ready(Ok(()));
                        }
                        Poll::Ready(result) => {
                            if let Err(e) = result {
                                warn!(stage = %this.stage, "Mixer output failed: {}", e);
                            }
                            // La sortie est relâchée ici, ce qui tue le processus
                            this.cancel.cancel();
                            this.state = MergeState::Recovering { pump };
                        }
                    }
                }
                MergeState::Recovering { mut pump } => match Pin::new(&mut pump).poll(cx) {
                    Poll::Pending => {
                        this.state = MergeState::Recovering { pump };
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(Some(rest))) => {
                        warn!(stage = %this.stage, "Mixer ended early, resuming source");
                        this.state = MergeState::Resumed(rest);
                    }
                    Poll::Ready(Ok(None)) => {
                        debug!(stage = %this.stage, "Merged stream finished");
                    }
                    Poll::Ready(Err(e)) => {
                        return Poll::Ready(Err(std::io::Error::other(e)));
                    }
                },
                MergeState::Resumed(mut rest) => {
                    let result = Pin::new(&mut rest).poll_read(cx, buf);
                    this.state = MergeState::Resumed(rest);
                    return result;
                }
                MergeState::Finished => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl Drop for MergedStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
