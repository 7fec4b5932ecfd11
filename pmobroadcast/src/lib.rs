//! # pmobroadcast - diffusion audio en direct
//!
//! `pmobroadcast` diffuse un fichier audio à un nombre quelconque
//! d'auditeurs HTTP, au rythme réel du débit du fichier, et permet de
//! mixer à la volée des effets sonores dans le flux sans interruption.
//!
//! ## Pipeline
//!
//! ```text
//! fichier ──► PacingStage ──► BroadcastSink ──► ClientSinkRegistry ──► auditeurs
//!                  ▲
//!                  │ (injection)
//!    source ──► mixeur sox ◄── effet
//! ```
//!
//! - [`BitrateProbe`] interroge `sox --i -B` pour fixer le rythme de l'étage
//! - [`PacingStage`] ne libère pas plus de `rate` octets par seconde
//! - [`BroadcastSink`] recopie chaque chunk vers tous les auditeurs
//! - l'injecteur d'effets remplace l'étage courant par un étage alimenté par
//!   le mixeur, le sink gardant toujours au moins un producteur
//!
//! ## Utilisation
//!
//! ```no_run
//! use std::sync::Arc;
//! use pmobroadcast::{BroadcastSession, BroadcastSettings, SoxProcessor};
//!
//! # async fn run() -> pmobroadcast::Result<()> {
//! let settings = BroadcastSettings::default().with_source("audio/songs/show.mp3");
//! let processor = Arc::new(SoxProcessor::new(&settings));
//! let session = BroadcastSession::new(settings, processor);
//!
//! let (_id, _listener) = session.register_listener();
//! let handle = session.start().await?;
//! session.inject_effect("audio/fx/applause.mp3").await?;
//!
//! let end = handle.wait().await;
//! println!("Broadcast ended: {}", end);
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `pmoconfig` : [`BroadcastConfigExt`] lit les réglages `broadcast.*`
//! - `pmoserver` : [`BroadcastServerExt`] monte les routes HTTP

pub mod controller;
pub mod error;
pub mod files;
mod injector;
pub mod pacing;
pub mod pipeline;
pub mod probe;
pub mod processor;
pub mod registry;
pub mod session;
pub mod settings;
pub mod sink;
pub mod splice;

#[cfg(feature = "pmoconfig")]
pub mod config_ext;

#[cfg(feature = "pmoserver")]
pub mod pmoserver_ext;

pub use controller::{CommandRequest, CommandResult, Controller};
pub use error::{Error, Result};
pub use pacing::{PacingStage, StageExit, StageId};
pub use pipeline::{PipelineEnd, PipelineHandle, RunMonitor};
pub use probe::{parse_bitrate, BitrateProbe};
pub use processor::{AudioProcessor, ByteSink, ByteSource, MixerProcess, ProbeOutput, SoxProcessor};
pub use registry::{ClientSinkRegistry, ListenerId, ListenerStream};
pub use session::BroadcastSession;
pub use settings::BroadcastSettings;
pub use sink::{BroadcastSink, SinkEvent, SinkInput};
pub use splice::{Action, Event, Phase, Rejection, SpliceMachine};

#[cfg(feature = "pmoconfig")]
pub use config_ext::BroadcastConfigExt;

#[cfg(feature = "pmoserver")]
pub use pmoserver_ext::{broadcast_router, BroadcastHttpState, BroadcastServerExt};
