//! Sonde de débit
//!
//! [`BitrateProbe::probe`] ne retourne jamais d'erreur : tout échec du
//! processeur externe est remplacé par le débit de repli configuré.

use std::{path::Path, sync::Arc};

use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    processor::AudioProcessor,
};

/// Estime le débit (bits/s) d'une source via le processeur externe
#[derive(Clone)]
pub struct BitrateProbe {
    processor: Arc<dyn AudioProcessor>,
    fallback: u64,
}

impl BitrateProbe {
    pub fn new(processor: Arc<dyn AudioProcessor>, fallback: u64) -> Self {
        Self {
            processor,
            fallback,
        }
    }

    pub fn fallback(&self) -> u64 {
        self.fallback
    }

    /// Sonde `path` et retourne son débit, ou le débit de repli
    pub async fn probe(&self, path: &Path) -> u64 {
        match self.try_probe(path).await {
            Ok(bitrate) => {
                debug!(bitrate, source = %path.display(), "Bitrate probed");
                bitrate
            }
            Err(e) => {
                warn!(
                    fallback = self.fallback,
                    source = %path.display(),
                    "Unable to probe bitrate, using fallback: {}", e
                );
                self.fallback
            }
        }
    }

    async fn try_probe(&self, path: &Path) -> Result<u64> {
        let output = self.processor.probe(path).await?;

        // Toute donnée sur la sortie d'erreur invalide la sonde
        if !output.stderr.is_empty() {
            return Err(Error::Probe(output.stderr.trim().to_string()));
        }

        parse_bitrate(&output.stdout)
    }
}

/// Analyse un débit textuel tel que `"128k"`, `"1.4M"` ou `"64000"`
pub fn parse_bitrate(text: &str) -> Result<u64> {
    let token = text.trim();
    if token.is_empty() {
        return Err(Error::Probe("empty bitrate".into()));
    }

    let (mantissa, multiplier) = match token.chars().last() {
        Some('k') | Some('K') => (&token[..token.len() - 1], 1_000.0),
        Some('M') => (&token[..token.len() - 1], 1_000_000.0),
        _ => (token, 1.0),
    };

    let value: f64 = mantissa
        .trim()
        .parse()
        .map_err(|_| Error::Probe(format!("invalid bitrate '{}'", token)))?;

    if !value.is_finite() || value <= 0.0 {
        return Err(Error::Probe(format!("invalid bitrate '{}'", token)));
    }

    Ok((value * multiplier).round() as u64)
}
