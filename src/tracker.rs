//! Client-side step indicator.
//!
//! Folds the progress stream into the three steps a contributor sees
//! (validation, upload, build) and remembers the final URL once the
//! workflow completes.

use chrono::{DateTime, Utc};

use crate::progress::{EventKind, ProgressEvent, Step};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepStatus {
    Pending,
    Progress,
    Success,
    Error,
}

#[derive(Clone, Debug)]
pub struct StepState {
    pub step: Step,
    pub status: StepStatus,
    pub message: String,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct StepTracker {
    steps: Vec<StepState>,
    current: Option<Step>,
    can_close: bool,
    final_url: Option<String>,
    completed: bool,
    failed: bool,
}

impl Default for StepTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StepTracker {
    pub fn new() -> Self {
        let initial = [
            (Step::Validation, "Validating files"),
            (Step::Upload, "Publishing files"),
            (Step::Build, "Triggering and tracking the deployment"),
        ];
        Self {
            steps: initial
                .iter()
                .map(|(step, message)| StepState {
                    step: *step,
                    status: StepStatus::Pending,
                    message: message.to_string(),
                    updated_at: None,
                })
                .collect(),
            current: None,
            can_close: false,
            final_url: None,
            completed: false,
            failed: false,
        }
    }

    pub fn steps(&self) -> &[StepState] {
        &self.steps
    }

    pub fn status(&self, step: Step) -> Option<StepStatus> {
        self.steps.iter().find(|s| s.step == step).map(|s| s.status)
    }

    pub fn current(&self) -> Option<Step> {
        self.current
    }

    pub fn can_close(&self) -> bool {
        self.can_close
    }

    pub fn final_url(&self) -> Option<&str> {
        self.final_url.as_deref()
    }

    /// A complete event arrived and no error was seen.
    pub fn succeeded(&self) -> bool {
        self.completed && !self.failed
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    fn update(&mut self, step: Step, status: StepStatus, message: &str) {
        if let Some(state) = self.steps.iter_mut().find(|s| s.step == step) {
            state.status = status;
            state.message = message.to_string();
            state.updated_at = Some(Utc::now());
        }
    }

    pub fn apply(&mut self, event: &ProgressEvent) {
        match (event.step, event.kind) {
            (Step::Complete, EventKind::Success) => {
                self.update(Step::Build, StepStatus::Success, &event.message);
                self.completed = true;
                self.can_close = true;
                self.current = None;
                self.final_url = event.url.clone();
            }
            (Step::Complete | Step::Error, _) => {
                // Failure outside a step: blame whatever was running.
                if event.kind == EventKind::Error {
                    if let Some(step) = self.current {
                        self.update(step, StepStatus::Error, &event.message);
                    }
                    self.fail();
                }
            }
            (step, EventKind::Info | EventKind::Warning) => {
                self.update(step, StepStatus::Progress, &event.message);
                self.current = Some(step);
            }
            (step, EventKind::Success) => {
                self.update(step, StepStatus::Success, &event.message);
            }
            (step, EventKind::Error) => {
                self.update(step, StepStatus::Error, &event.message);
                self.fail();
            }
        }
    }

    fn fail(&mut self) {
        self.failed = true;
        self.can_close = true;
        self.current = None;
    }
}
