//! Outils partagés par les tests d'intégration

#![allow(dead_code)]

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use pmobroadcast::{
    AudioProcessor, BroadcastSession, BroadcastSettings, Error, ListenerStream, MixerProcess,
    ProbeOutput, Result,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    task::JoinHandle,
};

/// Comportement du faux mixeur
#[derive(Debug, Clone, Copy)]
enum MixerMode {
    /// Recopie l'entrée vers la sortie
    PassThrough,
    /// Refuse de démarrer
    Fails,
    /// Démarre avec des flux déjà fermés
    DiesAtOnce,
    /// Relaie `n` octets puis se ferme
    DiesAfter(usize),
}

/// Processeur de test : sonde scriptée et mixeur « passe-plat »
///
/// Le mixeur recopie son entrée telle quelle vers sa sortie, ce qui permet
/// de vérifier la continuité exacte des octets à travers une injection.
pub struct FakeProcessor {
    probe: ProbeOutput,
    mixer_delay: Duration,
    mixer_mode: MixerMode,
    pub mixed: Mutex<Vec<PathBuf>>,
}

impl FakeProcessor {
    pub fn with_bitrate(bitrate: &str) -> Self {
        Self {
            probe: ProbeOutput {
                stdout: format!("{}\n", bitrate),
                stderr: String::new(),
            },
            mixer_delay: Duration::ZERO,
            mixer_mode: MixerMode::PassThrough,
            mixed: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_probe(stderr: &str) -> Self {
        Self {
            probe: ProbeOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
            ..Self::with_bitrate("")
        }
    }

    pub fn mixer_delay(mut self, delay: Duration) -> Self {
        self.mixer_delay = delay;
        self
    }

    pub fn mixer_fails(mut self) -> Self {
        self.mixer_mode = MixerMode::Fails;
        self
    }

    pub fn mixer_dies_at_once(mut self) -> Self {
        self.mixer_mode = MixerMode::DiesAtOnce;
        self
    }

    pub fn mixer_dies_after(mut self, bytes: usize) -> Self {
        self.mixer_mode = MixerMode::DiesAfter(bytes);
        self
    }

    pub fn mixed_count(&self) -> usize {
        self.mixed.lock().unwrap().len()
    }
}

#[async_trait]
impl AudioProcessor for FakeProcessor {
    async fn probe(&self, _path: &Path) -> Result<ProbeOutput> {
        Ok(self.probe.clone())
    }

    async fn spawn_mixer(&self, effect: &Path) -> Result<MixerProcess> {
        if !self.mixer_delay.is_zero() {
            tokio::time::sleep(self.mixer_delay).await;
        }
        if let MixerMode::Fails = self.mixer_mode {
            return Err(Error::MergeFailed("mixer unavailable".into()));
        }
        self.mixed.lock().unwrap().push(effect.to_path_buf());

        match self.mixer_mode {
            MixerMode::DiesAtOnce => {
                let (input, _) = tokio::io::duplex(64);
                let (_, output) = tokio::io::duplex(64);
                Ok(MixerProcess::new(Box::new(input), Box::new(output)))
            }
            MixerMode::DiesAfter(limit) => {
                let (input, mut relay_in) = tokio::io::duplex(512);
                let (mut relay_out, output) = tokio::io::duplex(64 * 1024);
                tokio::spawn(async move {
                    let mut relayed = vec![0u8; limit];
                    if relay_in.read_exact(&mut relayed).await.is_ok() {
                        let _ = relay_out.write_all(&relayed).await;
                    }
                });
                Ok(MixerProcess::new(Box::new(input), Box::new(output)))
            }
            _ => {
                let (input, output) = tokio::io::duplex(64 * 1024);
                Ok(MixerProcess::new(Box::new(input), Box::new(output)))
            }
        }
    }
}

/// Motif d'octets de période 251, qui ne s'aligne pas sur les chunks
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Fichier source temporaire rempli avec [`pattern`]
pub fn source_file(len: usize) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&pattern(len)).unwrap();
    file.flush().unwrap();
    file
}

/// Fichier d'effet temporaire (son contenu n'est pas lu par le faux mixeur)
pub fn effect_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"fx").unwrap();
    file
}

/// Logs des tests, filtrés par `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn session_with(source: &Path, processor: Arc<FakeProcessor>) -> BroadcastSession {
    init_tracing();
    let settings = BroadcastSettings::default()
        .with_source(source)
        .with_listener_buffer(64);
    BroadcastSession::new(settings, processor)
}

/// Nombre de ruptures du motif dans `bytes`
pub fn discontinuities(bytes: &[u8]) -> usize {
    bytes
        .windows(2)
        .filter(|w| w[1] != ((w[0] as usize + 1) % 251) as u8)
        .count()
}

/// Ce qu'un auditeur a reçu
#[derive(Debug, Default)]
pub struct Received {
    pub bytes: Vec<u8>,
    pub arrivals: Vec<Instant>,
}

impl Received {
    /// Plus long intervalle entre deux chunks consécutifs
    pub fn longest_gap(&self) -> Duration {
        self.arrivals
            .windows(2)
            .map(|w| w[1] - w[0])
            .max()
            .unwrap_or_default()
    }
}

/// Lit un auditeur en tâche de fond pendant `duration`
pub fn collect_for(mut stream: ListenerStream, duration: Duration) -> JoinHandle<Received> {
    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + duration;
        let mut received = Received::default();
        while let Ok(Some(chunk)) = tokio::time::timeout_at(deadline, stream.recv()).await {
            received.arrivals.push(Instant::now());
            received.bytes.extend_from_slice(&chunk);
        }
        received
    })
}
