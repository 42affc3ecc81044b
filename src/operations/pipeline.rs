//! Per-kind ordered stage pipelines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::apperrors::{AppError, ErrComponent, ErrReason};
use crate::model::{OperationKind, OperationStage};

use super::Stage;

/// Errors from pipeline construction and lookups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("no pipeline registered for operation kind {0}")]
    UnknownKind(OperationKind),

    #[error("stage {stage} is not part of the {kind} pipeline")]
    UnknownStage {
        kind: OperationKind,
        stage: OperationStage,
    },

    #[error("transition from {from} to {to} regresses the {kind} pipeline")]
    Regression {
        kind: OperationKind,
        from: OperationStage,
        to: OperationStage,
    },

    #[error("invalid pipeline: {0}")]
    Invalid(String),
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let reason = match err {
            PipelineError::Regression { .. } => ErrReason::StageRegression,
            _ => ErrReason::UnknownStage,
        };
        AppError::internal(err.to_string())
            .with_component(ErrComponent::Internal)
            .with_reason(reason)
    }
}

/// Result of looking up an operation's current stage.
pub enum Resolved {
    Step(Arc<dyn Stage>),
    /// The operation has reached the end of its pipeline.
    Terminal,
}

struct KindPipeline {
    stages: Vec<Arc<dyn Stage>>,
    terminal: OperationStage,
}

impl KindPipeline {
    /// Index of `stage`; the terminal stage sorts after every step.
    fn position(&self, stage: &OperationStage) -> Option<usize> {
        if *stage == self.terminal {
            return Some(self.stages.len());
        }
        self.stages.iter().position(|s| s.name() == *stage)
    }
}

/// Ordered stage lists keyed by operation kind.
pub struct StagePipeline {
    kinds: HashMap<OperationKind, KindPipeline>,
}

impl StagePipeline {
    pub fn builder() -> StagePipelineBuilder {
        StagePipelineBuilder::default()
    }

    fn pipeline(&self, kind: OperationKind) -> Result<&KindPipeline, PipelineError> {
        self.kinds.get(&kind).ok_or(PipelineError::UnknownKind(kind))
    }

    /// Find the implementation for `stage`.
    pub fn resolve(
        &self,
        kind: OperationKind,
        stage: &OperationStage,
    ) -> Result<Resolved, PipelineError> {
        let pipeline = self.pipeline(kind)?;
        if *stage == pipeline.terminal {
            return Ok(Resolved::Terminal);
        }
        pipeline
            .stages
            .iter()
            .find(|s| s.name() == *stage)
            .cloned()
            .map(Resolved::Step)
            .ok_or_else(|| PipelineError::UnknownStage {
                kind,
                stage: stage.clone(),
            })
    }

    /// First stage a new operation of `kind` starts in.
    pub fn initial_stage(&self, kind: OperationKind) -> Result<OperationStage, PipelineError> {
        let pipeline = self.pipeline(kind)?;
        Ok(pipeline
            .stages
            .first()
            .map(|s| s.name())
            .unwrap_or_else(|| pipeline.terminal.clone()))
    }

    pub fn is_terminal(&self, kind: OperationKind, stage: &OperationStage) -> bool {
        self.kinds
            .get(&kind)
            .is_some_and(|p| p.terminal == *stage)
    }

    /// Allow staying on `from` or moving forward; reject everything else.
    pub fn check_transition(
        &self,
        kind: OperationKind,
        from: &OperationStage,
        to: &OperationStage,
    ) -> Result<(), PipelineError> {
        let pipeline = self.pipeline(kind)?;
        let Some(target) = pipeline.position(to) else {
            return Err(PipelineError::UnknownStage {
                kind,
                stage: to.clone(),
            });
        };
        let current = pipeline
            .position(from)
            .ok_or_else(|| PipelineError::UnknownStage {
                kind,
                stage: from.clone(),
            })?;
        if target < current {
            return Err(PipelineError::Regression {
                kind,
                from: from.clone(),
                to: to.clone(),
            });
        }
        Ok(())
    }

    /// Largest per-stage time budget across every pipeline.
    pub fn max_time_limit(&self) -> Duration {
        self.kinds
            .values()
            .flat_map(|p| p.stages.iter())
            .map(|s| s.time_limit())
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Builder for [`StagePipeline`].
///
/// ```ignore
/// let pipeline = StagePipeline::builder()
///     .kind(OperationKind::Deprovision)
///     .stage(Arc::new(wait_for_deletion))
///     .terminal(OperationStage::FINISHED)
///     .build()?;
/// ```
#[derive(Default)]
pub struct StagePipelineBuilder {
    kinds: Vec<(OperationKind, Vec<Arc<dyn Stage>>, Option<OperationStage>)>,
    errors: Vec<String>,
}

impl StagePipelineBuilder {
    /// Start the stage list for `kind`.
    pub fn kind(mut self, kind: OperationKind) -> Self {
        self.kinds.push((kind, Vec::new(), None));
        self
    }

    /// Append a stage to the current kind.
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        match self.kinds.last_mut() {
            Some((_, stages, _)) => stages.push(stage),
            None => self
                .errors
                .push(format!("stage {} added before any kind", stage.name())),
        }
        self
    }

    /// Name the terminal stage of the current kind.
    pub fn terminal(mut self, stage: OperationStage) -> Self {
        match self.kinds.last_mut() {
            Some((_, _, terminal)) => *terminal = Some(stage),
            None => self
                .errors
                .push(format!("terminal {stage} set before any kind")),
        }
        self
    }

    pub fn build(self) -> Result<StagePipeline, PipelineError> {
        if let Some(first) = self.errors.into_iter().next() {
            return Err(PipelineError::Invalid(first));
        }

        let mut kinds = HashMap::new();
        for (kind, stages, terminal) in self.kinds {
            let terminal = terminal
                .ok_or_else(|| PipelineError::Invalid(format!("{kind} has no terminal stage")))?;

            let mut seen = Vec::with_capacity(stages.len());
            for stage in &stages {
                let name = stage.name();
                if name == terminal || seen.contains(&name) {
                    return Err(PipelineError::Invalid(format!(
                        "stage {name} appears more than once in {kind}"
                    )));
                }
                seen.push(name);
            }

            if kinds
                .insert(kind, KindPipeline { stages, terminal })
                .is_some()
            {
                return Err(PipelineError::Invalid(format!("{kind} registered twice")));
            }
        }

        Ok(StagePipeline { kinds })
    }
}
