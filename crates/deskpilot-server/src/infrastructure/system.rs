//! Configured system actions (lock, suspend, media keys, ...).
//!
//! Each action maps to an ordered list of candidate command lines; hosts
//! differ in which tool is installed, so the runner tries candidates in
//! order and stops at the first one that exits successfully.

use std::collections::BTreeMap;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::domain::config::SystemSection;
use crate::infrastructure::capture::program_on_path;

#[derive(Debug, Error)]
pub enum SystemActionError {
    #[error("unknown system action '{0}'")]
    UnknownAction(String),
    #[error("no candidate command for '{action}' succeeded")]
    AllCandidatesFailed { action: String },
}

pub struct SystemActions {
    actions: BTreeMap<String, Vec<Vec<String>>>,
}

impl SystemActions {
    pub fn new(cfg: SystemSection) -> Self {
        SystemActions {
            actions: cfg.actions,
        }
    }

    /// Action names exposed by this host's configuration, sorted.
    pub fn available(&self) -> Vec<&str> {
        self.actions.keys().map(String::as_str).collect()
    }

    /// Runs `action`, trying candidates in configured order until one exits
    /// with status zero.
    pub async fn run(&self, action: &str) -> Result<(), SystemActionError> {
        let candidates = self
            .actions
            .get(action)
            .ok_or_else(|| SystemActionError::UnknownAction(action.to_string()))?;

        for candidate in candidates {
            let Some((program, args)) = candidate.split_first() else {
                continue;
            };
            if !program_on_path(program) {
                debug!(action, program, "candidate program not on PATH");
                continue;
            }

            match Command::new(program).args(args).status().await {
                Ok(status) if status.success() => {
                    info!(action, program, "system action completed");
                    return Ok(());
                }
                Ok(status) => {
                    debug!(action, program, ?status, "candidate exited non-zero");
                }
                Err(e) => {
                    debug!(action, program, error = %e, "candidate failed to spawn");
                }
            }
        }

        Err(SystemActionError::AllCandidatesFailed {
            action: action.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actions(entries: &[(&str, Vec<Vec<&str>>)]) -> SystemActions {
        let actions = entries
            .iter()
            .map(|(name, cmds)| {
                let cmds = cmds
                    .iter()
                    .map(|c| c.iter().map(|s| s.to_string()).collect())
                    .collect();
                (name.to_string(), cmds)
            })
            .collect();
        SystemActions::new(SystemSection { actions })
    }

    #[tokio::test]
    async fn test_unknown_action_is_rejected() {
        // Arrange
        let runner = actions(&[]);

        // Act
        let err = runner.run("lock").await.unwrap_err();

        // Assert
        assert!(matches!(err, SystemActionError::UnknownAction(name) if name == "lock"));
    }

    #[tokio::test]
    async fn test_first_successful_candidate_wins() {
        // Arrange: the first candidate exits non-zero, the second succeeds.
        let runner = actions(&[(
            "lock",
            vec![vec!["sh", "-c", "exit 1"], vec!["sh", "-c", "exit 0"]],
        )]);

        // Act / Assert
        assert!(runner.run("lock").await.is_ok());
    }

    #[tokio::test]
    async fn test_all_failing_candidates_report_failure() {
        // Arrange
        let runner = actions(&[(
            "suspend",
            vec![
                vec!["definitely-not-a-real-program-9d1c"],
                vec!["sh", "-c", "exit 3"],
            ],
        )]);

        // Act
        let err = runner.run("suspend").await.unwrap_err();

        // Assert
        assert!(matches!(
            err,
            SystemActionError::AllCandidatesFailed { action } if action == "suspend"
        ));
    }

    #[tokio::test]
    async fn test_available_lists_configured_actions_sorted() {
        // Arrange
        let runner = actions(&[
            ("suspend", vec![vec!["sh", "-c", "exit 0"]]),
            ("lock", vec![vec!["sh", "-c", "exit 0"]]),
        ]);

        // Act / Assert
        assert_eq!(runner.available(), vec!["lock", "suspend"]);
    }
}
