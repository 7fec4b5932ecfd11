//! Machine à états de la session de diffusion
//!
//! Toutes les transitions de [`BroadcastSession`](crate::BroadcastSession)
//! (démarrage, arrêt, injection d'un effet) sont exprimées ici comme des
//! données : un [`Phase`] courant, un [`Event`] appliqué, et la liste
//! d'[`Action`]s que l'exécuteur doit réaliser sur les vrais flux.
//!
//! Le module ne manipule aucun flux ni aucune tâche, ce qui permet de tester
//! chaque transition sans construire de pipeline.
//!
//! ```text
//!            Start                  Inject
//! Stopped ─────────▶ Playing ─────────────────▶ Splicing
//!    ▲                 │  ▲                        │
//!    │ Stop/Exhausted  │  └── MergeReady ──────────┤
//!    └─────────────────┘      MergeFailed ─────────┘
//! ```

use std::path::PathBuf;

use crate::pacing::StageId;

/// État courant de la session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Aucun étage actif
    Stopped,
    /// Un seul étage alimente le sink
    Playing { active: StageId },
    /// Une injection est en cours : `retiring` est en cours de détachement,
    /// `next` est déjà attaché au sink et attend le flux mixé
    Splicing {
        retiring: StageId,
        next: StageId,
        effect: PathBuf,
    },
}

impl Phase {
    /// Indique si un étage alimente (ou va alimenter) le sink
    pub fn is_live(&self) -> bool {
        !matches!(self, Phase::Stopped)
    }

    /// Étage qui sera actif une fois la transition terminée
    pub fn current_stage(&self) -> Option<StageId> {
        match self {
            Phase::Stopped => None,
            Phase::Playing { active } => Some(*active),
            Phase::Splicing { next, .. } => Some(*next),
        }
    }
}

/// Événements appliqués à la machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Démarrage (ou redémarrage) sur un nouvel étage
    Start { stage: StageId },
    /// Demande d'injection d'un effet, `next` est l'étage pré-alloué
    Inject { effect: PathBuf, next: StageId },
    /// Le mixeur a démarré, son flux peut alimenter `next`
    MergeReady { next: StageId },
    /// Le mixeur n'a pas pu démarrer, la source d'origine doit reprendre
    MergeFailed { next: StageId },
    /// Arrêt explicite
    Stop,
    /// Un étage a terminé de lui-même (source épuisée ou erreur)
    Exhausted { stage: StageId },
}

/// Actions que l'exécuteur doit réaliser, dans l'ordre
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Crée l'étage, le connecte à la source ouverte et l'attache au sink
    Launch { stage: StageId },
    /// Termine l'étage (idempotent)
    End { stage: StageId },
    /// Attache l'étage au sink sans source amont
    AttachNext { stage: StageId },
    /// Suspend l'étage, le détache du sink et récupère sa source amont
    DetachRetiring { stage: StageId },
    /// Connecte la sortie du mixeur à l'étage
    ConnectMerged { stage: StageId },
    /// Reconnecte la source d'origine à l'étage (échec du mixeur)
    RestorePrimary { stage: StageId },
}

/// Refus d'une transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("no broadcast is playing")]
    NotPlaying,
    #[error("a splice is already in progress")]
    SpliceInProgress,
    #[error("the event refers to a splice that no longer exists")]
    Stale,
}

/// Machine à états pure de la session
#[derive(Debug, Clone)]
pub struct SpliceMachine {
    phase: Phase,
}

impl Default for SpliceMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SpliceMachine {
    pub fn new() -> Self {
        Self {
            phase: Phase::Stopped,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Applique un événement et retourne les actions à exécuter.
    ///
    /// En cas de refus, la phase n'est pas modifiée.
    pub fn apply(&mut self, event: Event) -> Result<Vec<Action>, Rejection> {
        let (next_phase, actions) = match (&self.phase, event) {
            (phase, Event::Start { stage }) => {
                let mut actions = Self::end_all(phase);
                actions.push(Action::Launch { stage });
                (Phase::Playing { active: stage }, actions)
            }

            (Phase::Playing { active }, Event::Inject { effect, next }) => (
                Phase::Splicing {
                    retiring: *active,
                    next,
                    effect,
                },
                vec![
                    Action::AttachNext { stage: next },
                    Action::DetachRetiring { stage: *active },
                ],
            ),
            (Phase::Stopped, Event::Inject { .. }) => return Err(Rejection::NotPlaying),
            (Phase::Splicing { .. }, Event::Inject { .. }) => {
                return Err(Rejection::SpliceInProgress)
            }

            (Phase::Splicing { next, .. }, Event::MergeReady { next: stage }) if *next == stage => (
                Phase::Playing { active: stage },
                vec![Action::ConnectMerged { stage }],
            ),
            (Phase::Splicing { next, .. }, Event::MergeFailed { next: stage }) if *next == stage => (
                Phase::Playing { active: stage },
                vec![Action::RestorePrimary { stage }],
            ),
            (_, Event::MergeReady { .. } | Event::MergeFailed { .. }) => {
                return Err(Rejection::Stale)
            }

            (phase, Event::Stop) => (Phase::Stopped, Self::end_all(phase)),

            (Phase::Playing { active }, Event::Exhausted { stage }) if *active == stage => {
                (Phase::Stopped, Vec::new())
            }
            (_, Event::Exhausted { .. }) => return Ok(Vec::new()),
        };

        self.phase = next_phase;
        Ok(actions)
    }

    fn end_all(phase: &Phase) -> Vec<Action> {
        match phase {
            Phase::Stopped => Vec::new(),
            Phase::Playing { active } => vec![Action::End { stage: *active }],
            Phase::Splicing { retiring, next, .. } => vec![
                Action::End { stage: *retiring },
                Action::End { stage: *next },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (StageId, StageId, StageId) {
        (StageId::next(), StageId::next(), StageId::next())
    }

    fn playing(stage: StageId) -> SpliceMachine {
        let mut machine = SpliceMachine::new();
        machine.apply(Event::Start { stage }).unwrap();
        machine
    }

    #[test]
    fn test_start_from_stopped_launches() {
        let (a, _, _) = ids();
        let mut machine = SpliceMachine::new();
        let actions = machine.apply(Event::Start { stage: a }).unwrap();

        assert_eq!(actions, vec![Action::Launch { stage: a }]);
        assert_eq!(machine.phase(), &Phase::Playing { active: a });
    }

    #[test]
    fn test_restart_ends_previous_stage_first() {
        let (a, b, _) = ids();
        let mut machine = playing(a);
        let actions = machine.apply(Event::Start { stage: b }).unwrap();

        assert_eq!(
            actions,
            vec![Action::End { stage: a }, Action::Launch { stage: b }]
        );
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let mut machine = SpliceMachine::new();
        assert_eq!(machine.apply(Event::Stop).unwrap(), Vec::new());
        assert_eq!(machine.apply(Event::Stop).unwrap(), Vec::new());
        assert_eq!(machine.phase(), &Phase::Stopped);
    }

    #[test]
    fn test_inject_attaches_next_before_detaching() {
        let (a, b, _) = ids();
        let mut machine = playing(a);
        let actions = machine
            .apply(Event::Inject {
                effect: PathBuf::from("fx/horn.mp3"),
                next: b,
            })
            .unwrap();

        assert_eq!(
            actions,
            vec![
                Action::AttachNext { stage: b },
                Action::DetachRetiring { stage: a }
            ]
        );
        assert!(matches!(machine.phase(), Phase::Splicing { retiring, next, .. } if *retiring == a && *next == b));
        assert_eq!(machine.phase().current_stage(), Some(b));
    }

    #[test]
    fn test_inject_rejected_when_stopped() {
        let (_, b, _) = ids();
        let mut machine = SpliceMachine::new();
        let result = machine.apply(Event::Inject {
            effect: PathBuf::from("fx.mp3"),
            next: b,
        });
        assert_eq!(result, Err(Rejection::NotPlaying));
        assert_eq!(machine.phase(), &Phase::Stopped);
    }

    #[test]
    fn test_second_inject_rejected_while_splicing() {
        let (a, b, c) = ids();
        let mut machine = playing(a);
        machine
            .apply(Event::Inject {
                effect: PathBuf::from("one.mp3"),
                next: b,
            })
            .unwrap();
        let before = machine.phase().clone();

        let result = machine.apply(Event::Inject {
            effect: PathBuf::from("two.mp3"),
            next: c,
        });

        assert_eq!(result, Err(Rejection::SpliceInProgress));
        assert_eq!(machine.phase(), &before);
    }

    #[test]
    fn test_merge_ready_commits_next() {
        let (a, b, _) = ids();
        let mut machine = playing(a);
        machine
            .apply(Event::Inject {
                effect: PathBuf::from("fx.mp3"),
                next: b,
            })
            .unwrap();

        let actions = machine.apply(Event::MergeReady { next: b }).unwrap();
        assert_eq!(actions, vec![Action::ConnectMerged { stage: b }]);
        assert_eq!(machine.phase(), &Phase::Playing { active: b });
    }

    #[test]
    fn test_merge_failure_restores_primary() {
        let (a, b, _) = ids();
        let mut machine = playing(a);
        machine
            .apply(Event::Inject {
                effect: PathBuf::from("fx.mp3"),
                next: b,
            })
            .unwrap();

        let actions = machine.apply(Event::MergeFailed { next: b }).unwrap();
        assert_eq!(actions, vec![Action::RestorePrimary { stage: b }]);
        assert_eq!(machine.phase(), &Phase::Playing { active: b });
    }

    #[test]
    fn test_stop_during_splice_ends_both_and_makes_commit_stale() {
        let (a, b, _) = ids();
        let mut machine = playing(a);
        machine
            .apply(Event::Inject {
                effect: PathBuf::from("fx.mp3"),
                next: b,
            })
            .unwrap();

        let actions = machine.apply(Event::Stop).unwrap();
        assert_eq!(
            actions,
            vec![Action::End { stage: a }, Action::End { stage: b }]
        );

        assert_eq!(
            machine.apply(Event::MergeReady { next: b }),
            Err(Rejection::Stale)
        );
        assert_eq!(machine.phase(), &Phase::Stopped);
    }

    #[test]
    fn test_commit_after_restart_is_stale() {
        let (a, b, c) = ids();
        let mut machine = playing(a);
        machine
            .apply(Event::Inject {
                effect: PathBuf::from("fx.mp3"),
                next: b,
            })
            .unwrap();
        machine.apply(Event::Start { stage: c }).unwrap();

        assert_eq!(
            machine.apply(Event::MergeFailed { next: b }),
            Err(Rejection::Stale)
        );
        assert_eq!(machine.phase(), &Phase::Playing { active: c });
    }

    #[test]
    fn test_exhaustion_of_active_stage_stops() {
        let (a, b, _) = ids();
        let mut machine = playing(a);

        assert_eq!(
            machine.apply(Event::Exhausted { stage: b }).unwrap(),
            Vec::new()
        );
        assert_eq!(machine.phase(), &Phase::Playing { active: a });

        machine.apply(Event::Exhausted { stage: a }).unwrap();
        assert_eq!(machine.phase(), &Phase::Stopped);
    }
}
