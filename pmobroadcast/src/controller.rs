//! Interprétation des commandes de l'opérateur
//!
//! Une commande est un texte libre : s'il contient `start` la diffusion
//! démarre, s'il contient `stop` elle s'arrête, sinon il désigne un effet
//! sonore par une partie de son nom de fichier.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    session::BroadcastSession,
};

/// Corps JSON d'une commande : `{"command": "..."}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub command: String,
}

/// Réponse JSON d'une commande : `{"result": "..."}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub result: String,
}

impl CommandResult {
    fn new(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
        }
    }
}

/// Traduit les commandes texte en opérations de session
#[derive(Debug, Clone)]
pub struct Controller {
    session: BroadcastSession,
    fx_dir: PathBuf,
}

impl Controller {
    pub fn new(session: BroadcastSession, fx_dir: impl Into<PathBuf>) -> Self {
        Self {
            session,
            fx_dir: fx_dir.into(),
        }
    }

    pub fn session(&self) -> &BroadcastSession {
        &self.session
    }

    pub fn fx_dir(&self) -> &Path {
        &self.fx_dir
    }

    /// Exécute une commande
    ///
    /// `start` rend la main dès que le pipeline est établi ; la fin du run
    /// est journalisée par une tâche de fond.
    pub async fn handle_command(&self, command: &str) -> Result<CommandResult> {
        info!("Command received: {}", command);
        let cmd = command.trim().to_lowercase();

        if cmd.is_empty() {
            return Ok(CommandResult::default());
        }

        if cmd.contains("start") {
            let handle = self.session.start().await?;
            tokio::spawn(async move {
                let end = handle.wait().await;
                info!("Broadcast run ended: {}", end);
            });
            return Ok(CommandResult::new("Streaming started"));
        }

        if cmd.contains("stop") {
            self.session.stop().await;
            return Ok(CommandResult::new("Streaming stopped"));
        }

        let effect = self.find_effect(&cmd).await?;
        info!("Added sound effect to the broadcast: {}", effect.display());
        self.session.inject_effect(&effect).await?;
        Ok(CommandResult::new(format!("Sound effect: {}", effect.display())))
    }

    /// Cherche le premier effet (par ordre alphabétique) dont le nom contient `name`
    pub async fn find_effect(&self, name: &str) -> Result<PathBuf> {
        let needle = name.to_lowercase();
        let mut entries = tokio::fs::read_dir(&self.fx_dir).await.map_err(|e| {
            warn!("Unable to read effects directory {}: {}", self.fx_dir.display(), e);
            Error::EffectNotFound(name.to_string())
        })?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(file_name) = entry.file_name().to_str() {
                names.push(file_name.to_string());
            }
        }
        names.sort();

        names
            .into_iter()
            .find(|file_name| file_name.to_lowercase().contains(&needle))
            .map(|file_name| self.fx_dir.join(file_name))
            .ok_or_else(|| Error::EffectNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        processor::{AudioProcessor, MixerProcess, ProbeOutput},
        settings::BroadcastSettings,
    };
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NoProcessor;

    #[async_trait]
    impl AudioProcessor for NoProcessor {
        async fn probe(&self, _path: &Path) -> Result<ProbeOutput> {
            Ok(ProbeOutput {
                stdout: "128k".into(),
                stderr: String::new(),
            })
        }

        async fn spawn_mixer(&self, _effect: &Path) -> Result<MixerProcess> {
            Err(Error::MergeFailed("no mixer".into()))
        }
    }

    fn controller(fx_dir: &Path) -> Controller {
        let session = BroadcastSession::new(BroadcastSettings::default(), Arc::new(NoProcessor));
        Controller::new(session, fx_dir)
    }

    fn fx_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in ["Applause Sound Effect.mp3", "Boo! Sound Effect.mp3", "Fart.mp3"] {
            std::fs::write(dir.path().join(name), b"fx").unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_find_effect_is_case_insensitive() {
        let dir = fx_dir();
        let controller = controller(dir.path());

        let found = controller.find_effect("applause").await.unwrap();
        assert_eq!(found, dir.path().join("Applause Sound Effect.mp3"));

        let found = controller.find_effect("BOO").await.unwrap();
        assert_eq!(found, dir.path().join("Boo! Sound Effect.mp3"));
    }

    #[tokio::test]
    async fn test_find_effect_takes_first_match_in_name_order() {
        let dir = fx_dir();
        let controller = controller(dir.path());

        let found = controller.find_effect("sound effect").await.unwrap();
        assert_eq!(found, dir.path().join("Applause Sound Effect.mp3"));
    }

    #[tokio::test]
    async fn test_unknown_effect_is_not_found() {
        let dir = fx_dir();
        let controller = controller(dir.path());

        let result = controller.handle_command("laugh").await;
        assert!(matches!(result, Err(Error::EffectNotFound(name)) if name == "laugh"));
    }

    #[tokio::test]
    async fn test_stop_command_when_idle() {
        let dir = fx_dir();
        let controller = controller(dir.path());

        let result = controller.handle_command("Please STOP").await.unwrap();
        assert_eq!(result.result, "Streaming stopped");
    }

    #[tokio::test]
    async fn test_empty_command_does_nothing() {
        let dir = fx_dir();
        let controller = controller(dir.path());

        let result = controller.handle_command("   ").await.unwrap();
        assert_eq!(result, CommandResult::default());
    }

    #[tokio::test]
    async fn test_effect_while_stopped_is_rejected() {
        let dir = fx_dir();
        let controller = controller(dir.path());

        let result = controller.handle_command("fart").await;
        assert!(matches!(result, Err(Error::NotPlaying)));
    }
}
