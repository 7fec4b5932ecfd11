//! Adaptateur vers le processeur audio externe
//!
//! Le cœur ne décode ni ne mixe aucun échantillon : le sondage du débit et
//! le mixage d'un effet sont délégués à un processus externe (`sox`), vu
//! comme un transducteur opaque de flux d'octets.
//!
//! Le trait [`AudioProcessor`] permet de substituer un faux processeur dans
//! les tests.

use std::{
    path::{Path, PathBuf},
    pin::Pin,
    process::Stdio,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, ReadBuf},
    process::{Child, Command},
};
use tracing::{debug, trace, warn};

use crate::{
    error::{Error, Result},
    settings::BroadcastSettings,
};

/// Flux d'octets en lecture (source, sortie de mixeur, ...)
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// Flux d'octets en écriture (entrée du mixeur)
pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Sorties texte du processeur en mode « info »
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Un processus de mixage en cours
///
/// `input` reçoit la source principale, l'effet est lu par le processus
/// depuis son chemin, `output` produit le flux mixé. Le processus est tué
/// quand `output` est relâché.
pub struct MixerProcess {
    input: ByteSink,
    output: ByteSource,
    child: Option<Child>,
}

impl MixerProcess {
    pub fn new(input: ByteSink, output: ByteSource) -> Self {
        Self {
            input,
            output,
            child: None,
        }
    }

    /// Rattache le processus enfant, qui vivra aussi longtemps que la sortie
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    /// Sépare l'entrée et la sortie du mixeur
    pub fn split(self) -> (ByteSink, ByteSource) {
        let output: ByteSource = match self.child {
            Some(child) => Box::new(MixerOutput {
                inner: self.output,
                _child: child,
            }),
            None => self.output,
        };
        (self.input, output)
    }
}

/// Sortie du mixeur qui garde le processus en vie
struct MixerOutput {
    inner: ByteSource,
    _child: Child,
}

impl AsyncRead for MixerOutput {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Processeur audio externe
#[async_trait]
pub trait AudioProcessor: Send + Sync {
    /// Lance le processeur en mode « info » sur `path`
    async fn probe(&self, path: &Path) -> Result<ProbeOutput>;

    /// Lance un mixage de l'entrée standard avec l'effet `effect`
    async fn spawn_mixer(&self, effect: &Path) -> Result<MixerProcess>;
}

/// Implémentation de [`AudioProcessor`] basée sur `sox`
#[derive(Debug, Clone)]
pub struct SoxProcessor {
    program: PathBuf,
    media_type: String,
    song_volume: f32,
    fx_volume: f32,
    probe_timeout: Duration,
}

impl SoxProcessor {
    pub fn new(settings: &BroadcastSettings) -> Self {
        Self {
            program: PathBuf::from(&settings.processor_program),
            media_type: settings.media_type.clone(),
            song_volume: settings.song_volume,
            fx_volume: settings.fx_volume,
            probe_timeout: settings.probe_timeout,
        }
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Arguments de la commande de mixage
    ///
    /// `-t <type> -v <vol> -m - -t <type> -v <vol> <effet> -t <type> -`
    pub fn merge_args(&self, effect: &Path) -> Vec<String> {
        vec![
            "-t".to_string(),
            self.media_type.clone(),
            "-v".to_string(),
            self.song_volume.to_string(),
            "-m".to_string(),
            "-".to_string(),
            "-t".to_string(),
            self.media_type.clone(),
            "-v".to_string(),
            self.fx_volume.to_string(),
            effect.display().to_string(),
            "-t".to_string(),
            self.media_type.clone(),
            "-".to_string(),
        ]
    }

    fn spawn_error(&self, source: std::io::Error) -> Error {
        Error::ProcessorSpawn {
            program: self.program_name(),
            source,
        }
    }
}

#[async_trait]
impl AudioProcessor for SoxProcessor {
    async fn probe(&self, path: &Path) -> Result<ProbeOutput> {
        trace!("Probing bitrate of {} with {}", path.display(), self.program_name());

        let child = Command::new(&self.program)
            .arg("--i")
            .arg("-B")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let output = tokio::time::timeout(self.probe_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::Probe(format!(
                    "{} did not answer within {:?}",
                    self.program_name(),
                    self.probe_timeout
                ))
            })??;

        Ok(ProbeOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn spawn_mixer(&self, effect: &Path) -> Result<MixerProcess> {
        debug!(
            effect = %effect.display(),
            "Spawning {} mixer", self.program_name()
        );

        let mut child = Command::new(&self.program)
            .args(self.merge_args(effect))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::MergeFailed("mixer stdin was not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::MergeFailed("mixer stdout was not captured".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let program = self.program_name();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => warn!("{}: {}", program, line),
                        Ok(None) => break,
                        Err(e) => {
                            trace!("{} stderr closed: {}", program, e);
                            break;
                        }
                    }
                }
            });
        }

        Ok(MixerProcess::new(Box::new(stdin), Box::new(stdout)).with_child(child))
    }
}
