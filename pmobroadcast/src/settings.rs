//! Réglages de la session de diffusion
//!
//! Ces valeurs sont passées par valeur à [`BroadcastSession`](crate::BroadcastSession) :
//! le cœur ne lit jamais la configuration globale. Le trait
//! [`BroadcastConfigExt`](crate::BroadcastConfigExt) (feature `pmoconfig`)
//! construit un [`BroadcastSettings`] depuis `pmoconfig`.

use std::{path::PathBuf, time::Duration};

/// Programme externe utilisé par défaut pour sonder et mixer
pub const DEFAULT_PROCESSOR: &str = "sox";

/// Débit utilisé quand la sonde échoue (bits/s)
pub const DEFAULT_FALLBACK_BITRATE: u64 = 128_000;

/// Diviseur bits → octets appliqué au débit sondé pour le pacing
pub const DEFAULT_BITRATE_DIVISOR: u64 = 8;

/// Taille (en chunks) du canal de chaque auditeur
pub const DEFAULT_LISTENER_BUFFER: usize = 32;

/// Taille (en chunks) du canal d'entrée du BroadcastSink
pub const DEFAULT_SINK_BUFFER: usize = 1;

/// Configuration d'une session de diffusion.
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    /// Exécutable du processeur audio externe (`sox`)
    pub processor_program: String,
    /// Durée maximale accordée à la sonde de débit
    pub probe_timeout: Duration,
    /// Attente maximale du premier chunk produit par le mixeur
    pub mixer_timeout: Duration,
    /// Débit de repli (bits/s) si la sonde échoue
    pub fallback_bitrate: u64,
    /// Diviseur appliqué au débit sondé pour obtenir un rythme en octets/s
    pub bitrate_divisor: u64,
    /// Type de média passé au mixeur (`-t mp3`)
    pub media_type: String,
    /// Volume de la source principale pendant un mixage
    pub song_volume: f32,
    /// Volume de l'effet pendant un mixage
    pub fx_volume: f32,
    /// Source diffusée au démarrage
    pub default_source: PathBuf,
    /// Répertoire des pages et fichiers statiques
    pub public_dir: PathBuf,
    /// Répertoire des effets sonores
    pub fx_dir: PathBuf,
    /// Capacité (en chunks) du canal de chaque auditeur
    pub listener_buffer: usize,
    /// Capacité (en chunks) du canal d'entrée du sink
    pub sink_buffer: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            processor_program: DEFAULT_PROCESSOR.to_string(),
            probe_timeout: Duration::from_millis(2000),
            mixer_timeout: Duration::from_millis(2000),
            fallback_bitrate: DEFAULT_FALLBACK_BITRATE,
            bitrate_divisor: DEFAULT_BITRATE_DIVISOR,
            media_type: "mp3".to_string(),
            song_volume: 0.99,
            fx_volume: 0.1,
            default_source: PathBuf::from("audio/songs/conversation.mp3"),
            public_dir: PathBuf::from("public"),
            fx_dir: PathBuf::from("audio/fx"),
            listener_buffer: DEFAULT_LISTENER_BUFFER,
            sink_buffer: DEFAULT_SINK_BUFFER,
        }
    }
}

impl BroadcastSettings {
    /// Convertit un débit sondé (bits/s) en rythme de pacing (octets/s).
    ///
    /// Le résultat n'est jamais nul : un rythme nul bloquerait l'étage.
    pub fn pacing_rate(&self, bitrate: u64) -> u64 {
        (bitrate / self.bitrate_divisor.max(1)).max(1)
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.default_source = source.into();
        self
    }

    pub fn with_fallback_bitrate(mut self, bitrate: u64) -> Self {
        self.fallback_bitrate = bitrate;
        self
    }

    pub fn with_processor(mut self, program: impl Into<String>) -> Self {
        self.processor_program = program.into();
        self
    }

    pub fn with_listener_buffer(mut self, chunks: usize) -> Self {
        self.listener_buffer = chunks.max(1);
        self
    }
}
