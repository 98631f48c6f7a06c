//! Bot creation wizard.
//!
//! The flow is a single enum carrying only the data valid in each step.
//! Generation and refinement are asynchronous: starting one hands out a
//! [`Ticket`], and the outcome is applied only if that ticket is still the
//! current one. Starting another request or resetting the wizard makes
//! every earlier ticket stale.

use std::fmt;

use crate::models::{BotFile, GeneratedProject};
use crate::types::DeploymentKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployTarget {
    /// Hosted chat endpoint under a slug.
    Hosted { slug: String },
    /// Repository pushed by an external collaborator.
    GitHub { repo: String },
}

impl DeployTarget {
    /// How the deployment is recorded in the browser's registry.
    pub fn kind(&self) -> DeploymentKind {
        match self {
            Self::Hosted { .. } => DeploymentKind::Webai,
            Self::GitHub { .. } => DeploymentKind::Github,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WizardState {
    Describing {
        description: String,
    },
    Generating {
        ticket: Ticket,
        /// Where an error sends the wizard back to.
        previous: Box<WizardState>,
    },
    Editing {
        project: GeneratedProject,
    },
    Refining {
        ticket: Ticket,
        instruction: String,
        project: GeneratedProject,
    },
    Deploying {
        target: DeployTarget,
        project: GeneratedProject,
    },
    Published {
        url: String,
        project: GeneratedProject,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Describing,
    Generating,
    Editing,
    Refining,
    Deploying,
    Published,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Describing => "describing",
            Self::Generating => "generating",
            Self::Editing => "editing",
            Self::Refining => "refining",
            Self::Deploying => "deploying",
            Self::Published => "published",
        };
        f.write_str(s)
    }
}

impl WizardState {
    pub fn mode(&self) -> Mode {
        match self {
            Self::Describing { .. } => Mode::Describing,
            Self::Generating { .. } => Mode::Generating,
            Self::Editing { .. } => Mode::Editing,
            Self::Refining { .. } => Mode::Refining,
            Self::Deploying { .. } => Mode::Deploying,
            Self::Published { .. } => Mode::Published,
        }
    }

    pub fn project(&self) -> Option<&GeneratedProject> {
        match self {
            Self::Describing { .. } => None,
            Self::Generating { previous, .. } => previous.project(),
            Self::Editing { project }
            | Self::Refining { project, .. }
            | Self::Deploying { project, .. }
            | Self::Published { project, .. } => Some(project),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WizardError {
    #[error("cannot {action} while {mode}")]
    IllegalTransition { action: &'static str, mode: Mode },
}

/// What happened to an asynchronous outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Yes,
    /// The ticket was superseded; nothing changed.
    Stale,
}

#[derive(Debug)]
pub struct Wizard {
    state: WizardState,
    epoch: u64,
    last_error: Option<String>,
}

impl Default for Wizard {
    fn default() -> Self {
        Self::new()
    }
}

impl Wizard {
    pub fn new() -> Self {
        Self {
            state: WizardState::Describing {
                description: String::new(),
            },
            epoch: 0,
            last_error: None,
        }
    }

    pub fn state(&self) -> &WizardState {
        &self.state
    }

    pub fn mode(&self) -> Mode {
        self.state.mode()
    }

    /// Working file set, if a project exists.
    pub fn files(&self) -> Option<&[BotFile]> {
        self.state.project().map(|p| p.files.as_slice())
    }

    /// Message of the most recent failed request or deploy.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn illegal(&self, action: &'static str) -> WizardError {
        WizardError::IllegalTransition {
            action,
            mode: self.mode(),
        }
    }

    fn issue_ticket(&mut self) -> Ticket {
        self.epoch += 1;
        Ticket(self.epoch)
    }

    fn is_current(&self, ticket: Ticket) -> bool {
        ticket.0 == self.epoch
    }

    pub fn describe(&mut self, text: impl Into<String>) -> Result<(), WizardError> {
        match &mut self.state {
            WizardState::Describing { description } => {
                *description = text.into();
                Ok(())
            }
            _ => Err(self.illegal("edit the description")),
        }
    }

    /// Starting again while a generation is in flight supersedes it: the old
    /// ticket goes stale and the original pre-generation state is kept.
    pub fn start_generation(&mut self) -> Result<Ticket, WizardError> {
        match self.mode() {
            Mode::Describing | Mode::Editing | Mode::Published | Mode::Generating => {}
            _ => return Err(self.illegal("start a generation")),
        }
        let ticket = self.issue_ticket();
        let previous = match std::mem::replace(
            &mut self.state,
            WizardState::Describing {
                description: String::new(),
            },
        ) {
            WizardState::Generating { previous, .. } => *previous,
            other => other,
        };
        self.state = WizardState::Generating {
            ticket,
            previous: Box::new(previous),
        };
        self.last_error = None;
        Ok(ticket)
    }

    /// Applies a generation outcome: success replaces the file set and
    /// enters editing, failure restores the pre-generation state.
    pub fn finish_generation(
        &mut self,
        ticket: Ticket,
        outcome: Result<GeneratedProject, String>,
    ) -> Applied {
        let current = matches!(&self.state, WizardState::Generating { ticket: t, .. } if *t == ticket);
        if !current || !self.is_current(ticket) {
            log::debug!("Discarding stale generation outcome {:?}", ticket);
            return Applied::Stale;
        }

        let placeholder = WizardState::Describing {
            description: String::new(),
        };
        let WizardState::Generating { previous, .. } = std::mem::replace(&mut self.state, placeholder)
        else {
            return Applied::Stale;
        };

        self.state = match outcome {
            Ok(project) => WizardState::Editing { project },
            Err(message) => {
                self.last_error = Some(message);
                *previous
            }
        };
        self.issue_ticket();
        Applied::Yes
    }

    pub fn start_refinement(&mut self, instruction: impl Into<String>) -> Result<Ticket, WizardError> {
        if self.mode() != Mode::Editing {
            return Err(self.illegal("start a refinement"));
        }
        let ticket = self.issue_ticket();
        let placeholder = WizardState::Describing {
            description: String::new(),
        };
        if let WizardState::Editing { project } = std::mem::replace(&mut self.state, placeholder) {
            self.state = WizardState::Refining {
                ticket,
                instruction: instruction.into(),
                project,
            };
        }
        self.last_error = None;
        Ok(ticket)
    }

    /// Back to editing either way; on failure the project is unchanged.
    pub fn finish_refinement(
        &mut self,
        ticket: Ticket,
        outcome: Result<GeneratedProject, String>,
    ) -> Applied {
        let current = matches!(&self.state, WizardState::Refining { ticket: t, .. } if *t == ticket);
        if !current || !self.is_current(ticket) {
            log::debug!("Discarding stale refinement outcome {:?}", ticket);
            return Applied::Stale;
        }

        let placeholder = WizardState::Describing {
            description: String::new(),
        };
        let WizardState::Refining { project, .. } = std::mem::replace(&mut self.state, placeholder)
        else {
            return Applied::Stale;
        };

        let project = match outcome {
            Ok(refined) => refined,
            Err(message) => {
                self.last_error = Some(message);
                project
            }
        };
        self.state = WizardState::Editing { project };
        self.issue_ticket();
        Applied::Yes
    }

    pub fn start_deploy(&mut self, target: DeployTarget) -> Result<(), WizardError> {
        if self.mode() != Mode::Editing {
            return Err(self.illegal("deploy"));
        }
        let placeholder = WizardState::Describing {
            description: String::new(),
        };
        if let WizardState::Editing { project } = std::mem::replace(&mut self.state, placeholder) {
            self.state = WizardState::Deploying { target, project };
        }
        self.last_error = None;
        Ok(())
    }

    /// `Ok(url)` publishes, `Err(message)` returns to editing.
    pub fn finish_deploy(&mut self, outcome: Result<String, String>) -> Result<(), WizardError> {
        if self.mode() != Mode::Deploying {
            return Err(self.illegal("finish a deploy"));
        }
        let placeholder = WizardState::Describing {
            description: String::new(),
        };
        if let WizardState::Deploying { project, .. } = std::mem::replace(&mut self.state, placeholder) {
            self.state = match outcome {
                Ok(url) => WizardState::Published { url, project },
                Err(message) => {
                    self.last_error = Some(message);
                    WizardState::Editing { project }
                }
            };
        }
        Ok(())
    }

    /// Published back to editing.
    pub fn edit(&mut self) -> Result<(), WizardError> {
        if self.mode() != Mode::Published {
            return Err(self.illegal("return to editing"));
        }
        let placeholder = WizardState::Describing {
            description: String::new(),
        };
        if let WizardState::Published { project, .. } = std::mem::replace(&mut self.state, placeholder) {
            self.state = WizardState::Editing { project };
        }
        Ok(())
    }

    /// Back to an empty description from anywhere; in-flight outcomes
    /// become stale.
    pub fn reset(&mut self) {
        self.issue_ticket();
        self.state = WizardState::Describing {
            description: String::new(),
        };
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(paths: &[&str]) -> GeneratedProject {
        GeneratedProject {
            name: "Quiz".to_string(),
            description: String::new(),
            system_prompt: String::new(),
            suggested_slug: "quiz".to_string(),
            change_summary: None,
            files: paths.iter().map(|p| BotFile::new(*p, "")).collect(),
        }
    }

    fn editing(paths: &[&str]) -> Wizard {
        let mut wizard = Wizard::new();
        let ticket = wizard.start_generation().unwrap();
        assert_eq!(wizard.finish_generation(ticket, Ok(project(paths))), Applied::Yes);
        wizard
    }

    #[test]
    fn test_generation_success_enters_editing() {
        let wizard = editing(&["app.py", "README.md"]);
        assert_eq!(wizard.mode(), Mode::Editing);
        let paths: Vec<&str> = wizard.files().unwrap().iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["app.py", "README.md"]);
    }

    #[test]
    fn test_generation_error_restores_previous_state() {
        let mut wizard = Wizard::new();
        wizard.describe("a quiz bot").unwrap();
        let ticket = wizard.start_generation().unwrap();
        assert_eq!(wizard.mode(), Mode::Generating);

        wizard.finish_generation(ticket, Err("Failed to parse AI response".to_string()));
        assert_eq!(
            wizard.state(),
            &WizardState::Describing {
                description: "a quiz bot".to_string()
            }
        );
        assert_eq!(wizard.last_error(), Some("Failed to parse AI response"));
    }

    #[test]
    fn test_regeneration_error_keeps_old_files() {
        let mut wizard = editing(&["app.py"]);
        let ticket = wizard.start_generation().unwrap();
        wizard.finish_generation(ticket, Err("Stream error".to_string()));
        assert_eq!(wizard.mode(), Mode::Editing);
        assert_eq!(wizard.files().unwrap()[0].path, "app.py");
    }

    #[test]
    fn test_stale_ticket_is_discarded() {
        let mut wizard = Wizard::new();
        let first = wizard.start_generation().unwrap();
        wizard.reset();
        let second = wizard.start_generation().unwrap();

        assert_eq!(wizard.finish_generation(first, Ok(project(&["old.py"]))), Applied::Stale);
        assert_eq!(wizard.mode(), Mode::Generating);

        assert_eq!(wizard.finish_generation(second, Ok(project(&["new.py"]))), Applied::Yes);
        assert_eq!(wizard.files().unwrap()[0].path, "new.py");
    }

    #[test]
    fn test_replayed_outcome_is_stale() {
        let mut wizard = Wizard::new();
        let ticket = wizard.start_generation().unwrap();
        let done = project(&["a.py", "b.py"]);
        assert_eq!(wizard.finish_generation(ticket, Ok(done.clone())), Applied::Yes);
        assert_eq!(wizard.finish_generation(ticket, Ok(done.clone())), Applied::Stale);
        assert_eq!(wizard.files().unwrap(), done.files.as_slice());
    }

    #[test]
    fn test_reset_discards_in_flight_generation() {
        let mut wizard = Wizard::new();
        let ticket = wizard.start_generation().unwrap();
        wizard.reset();
        assert_eq!(wizard.finish_generation(ticket, Ok(project(&["a.py"]))), Applied::Stale);
        assert_eq!(wizard.mode(), Mode::Describing);
    }

    #[test]
    fn test_refinement_paths() {
        let mut wizard = editing(&["app.py"]);
        let ticket = wizard.start_refinement("add hints").unwrap();
        assert_eq!(wizard.mode(), Mode::Refining);
        wizard.finish_refinement(ticket, Err("Stream error".to_string()));
        assert_eq!(wizard.mode(), Mode::Editing);
        assert_eq!(wizard.files().unwrap()[0].path, "app.py");

        let ticket = wizard.start_refinement("add hints").unwrap();
        wizard.finish_refinement(ticket, Ok(project(&["app.py", "hints.py"])));
        assert_eq!(wizard.files().unwrap().len(), 2);
    }

    #[test]
    fn test_deploy_and_publish() {
        let mut wizard = editing(&["app.py"]);
        wizard
            .start_deploy(DeployTarget::Hosted {
                slug: "quiz".to_string(),
            })
            .unwrap();
        wizard.finish_deploy(Ok("/b/quiz".to_string())).unwrap();
        assert_eq!(wizard.mode(), Mode::Published);

        wizard.edit().unwrap();
        wizard
            .start_deploy(DeployTarget::GitHub {
                repo: "quiz-bot".to_string(),
            })
            .unwrap();
        wizard.finish_deploy(Err("repo exists".to_string())).unwrap();
        assert_eq!(wizard.mode(), Mode::Editing);
        assert_eq!(wizard.last_error(), Some("repo exists"));
    }

    #[test]
    fn test_illegal_transitions_leave_state_unchanged() {
        let mut wizard = Wizard::new();
        let err = wizard.start_refinement("x").unwrap_err();
        assert_eq!(
            err,
            WizardError::IllegalTransition {
                action: "start a refinement",
                mode: Mode::Describing
            }
        );
        assert!(wizard.start_deploy(DeployTarget::GitHub { repo: "r".to_string() }).is_err());
        assert!(wizard.finish_deploy(Ok("/x".to_string())).is_err());
        assert!(wizard.edit().is_err());

        wizard.start_generation().unwrap();
        assert!(wizard.describe("late").is_err());
        assert!(wizard.start_refinement("x").is_err());
        assert_eq!(wizard.mode(), Mode::Generating);
        assert_eq!(err.to_string(), "cannot start a refinement while describing");
    }

    #[test]
    fn test_restarting_generation_supersedes_in_flight_ticket() {
        let mut wizard = Wizard::new();
        wizard.describe("a chef bot").unwrap();
        let first = wizard.start_generation().unwrap();
        let second = wizard.start_generation().unwrap();
        assert_ne!(first, second);
        assert_eq!(wizard.mode(), Mode::Generating);

        assert_eq!(
            wizard.finish_generation(first, Ok(project(&["stale.py"]))),
            Applied::Stale
        );
        assert_eq!(wizard.mode(), Mode::Generating);

        assert_eq!(
            wizard.finish_generation(second, Err("upstream down".to_string())),
            Applied::Yes
        );
        assert_eq!(
            wizard.state(),
            &WizardState::Describing {
                description: "a chef bot".to_string()
            }
        );
        assert_eq!(wizard.last_error(), Some("upstream down"));
    }

    #[test]
    fn test_deploy_target_kind() {
        let hosted = DeployTarget::Hosted {
            slug: "quiz".to_string(),
        };
        let repo = DeployTarget::GitHub {
            repo: "me/quiz".to_string(),
        };
        assert_eq!(hosted.kind(), DeploymentKind::Webai);
        assert_eq!(repo.kind(), DeploymentKind::Github);
    }
}
