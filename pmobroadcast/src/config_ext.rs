//! Extension pour intégrer la diffusion dans pmoconfig
//!
//! Ce module fournit le trait [`BroadcastConfigExt`] qui ajoute à
//! `pmoconfig::Config` la lecture des réglages `broadcast.*`.
//!
//! # Exemple
//!
//! ```rust,ignore
//! use pmoconfig::get_config;
//! use pmobroadcast::BroadcastConfigExt;
//!
//! let config = get_config();
//! let settings = config.get_broadcast_settings()?;
//! ```

use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use pmoconfig::Config;
use serde_yaml::{Number, Value};

use crate::settings::BroadcastSettings;

/// Trait d'extension pour la configuration de la diffusion
///
/// Les clés absentes ou mal typées retombent sur les valeurs de
/// [`BroadcastSettings::default`].
pub trait BroadcastConfigExt {
    /// Construit les réglages complets de la session
    fn get_broadcast_settings(&self) -> Result<BroadcastSettings>;

    /// Exécutable du processeur audio (`broadcast.processor.program`)
    fn get_broadcast_processor(&self) -> Result<String>;
    fn set_broadcast_processor(&self, program: String) -> Result<()>;

    /// Débit de repli en bits/s (`broadcast.fallback_bitrate`)
    fn get_broadcast_fallback_bitrate(&self) -> Result<u64>;
    fn set_broadcast_fallback_bitrate(&self, bitrate: u64) -> Result<()>;

    /// Source diffusée au démarrage (`broadcast.default_source`)
    fn get_broadcast_source(&self) -> Result<PathBuf>;
    fn set_broadcast_source(&self, path: String) -> Result<()>;

    /// Répertoire des effets sonores (`broadcast.fx_dir`)
    fn get_broadcast_fx_dir(&self) -> Result<PathBuf>;

    /// Répertoire des fichiers statiques (`broadcast.public_dir`)
    fn get_broadcast_public_dir(&self) -> Result<PathBuf>;
}

impl BroadcastConfigExt for Config {
    fn get_broadcast_settings(&self) -> Result<BroadcastSettings> {
        let defaults = BroadcastSettings::default();

        Ok(BroadcastSettings {
            processor_program: self.get_broadcast_processor()?,
            probe_timeout: read_u64(self, &["broadcast", "processor", "probe_timeout_ms"])
                .map(Duration::from_millis)
                .unwrap_or(defaults.probe_timeout),
            mixer_timeout: read_u64(self, &["broadcast", "processor", "mixer_timeout_ms"])
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.mixer_timeout),
            fallback_bitrate: self.get_broadcast_fallback_bitrate()?,
            bitrate_divisor: read_u64(self, &["broadcast", "bitrate_divisor"])
                .filter(|d| *d > 0)
                .unwrap_or(defaults.bitrate_divisor),
            media_type: read_string(self, &["broadcast", "media_type"])
                .unwrap_or(defaults.media_type),
            song_volume: read_f32(self, &["broadcast", "song_volume"])
                .unwrap_or(defaults.song_volume),
            fx_volume: read_f32(self, &["broadcast", "fx_volume"]).unwrap_or(defaults.fx_volume),
            default_source: self.get_broadcast_source()?,
            public_dir: self.get_broadcast_public_dir()?,
            fx_dir: self.get_broadcast_fx_dir()?,
            listener_buffer: read_u64(self, &["broadcast", "listener_buffer"])
                .map(|n| (n as usize).max(1))
                .unwrap_or(defaults.listener_buffer),
            sink_buffer: read_u64(self, &["broadcast", "sink_buffer"])
                .map(|n| (n as usize).max(1))
                .unwrap_or(defaults.sink_buffer),
        })
    }

    fn get_broadcast_processor(&self) -> Result<String> {
        Ok(read_string(self, &["broadcast", "processor", "program"])
            .unwrap_or_else(|| BroadcastSettings::default().processor_program))
    }

    fn set_broadcast_processor(&self, program: String) -> Result<()> {
        self.set_value(&["broadcast", "processor", "program"], Value::String(program))
    }

    fn get_broadcast_fallback_bitrate(&self) -> Result<u64> {
        Ok(read_u64(self, &["broadcast", "fallback_bitrate"])
            .filter(|b| *b > 0)
            .unwrap_or(BroadcastSettings::default().fallback_bitrate))
    }

    fn set_broadcast_fallback_bitrate(&self, bitrate: u64) -> Result<()> {
        self.set_value(
            &["broadcast", "fallback_bitrate"],
            Value::Number(Number::from(bitrate)),
        )
    }

    fn get_broadcast_source(&self) -> Result<PathBuf> {
        Ok(read_string(self, &["broadcast", "default_source"])
            .map(PathBuf::from)
            .unwrap_or_else(|| BroadcastSettings::default().default_source))
    }

    fn set_broadcast_source(&self, path: String) -> Result<()> {
        self.set_value(&["broadcast", "default_source"], Value::String(path))
    }

    fn get_broadcast_fx_dir(&self) -> Result<PathBuf> {
        Ok(read_string(self, &["broadcast", "fx_dir"])
            .map(PathBuf::from)
            .unwrap_or_else(|| BroadcastSettings::default().fx_dir))
    }

    fn get_broadcast_public_dir(&self) -> Result<PathBuf> {
        Ok(read_string(self, &["broadcast", "public_dir"])
            .map(PathBuf::from)
            .unwrap_or_else(|| BroadcastSettings::default().public_dir))
    }
}

fn read_string(config: &Config, path: &[&str]) -> Option<String> {
    match config.get_value(path) {
        Ok(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    }
}

fn read_u64(config: &Config, path: &[&str]) -> Option<u64> {
    match config.get_value(path) {
        Ok(Value::Number(n)) => n.as_u64(),
        Ok(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn read_f32(config: &Config, path: &[&str]) -> Option<f32> {
    match config.get_value(path) {
        Ok(Value::Number(n)) => n.as_f64().map(|v| v as f32),
        _ => None,
    }
}
