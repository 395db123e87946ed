//! # Pipeline Stages
//!
//! State machine over the steps of one audit run.

use super::events::PipelineStep;

/// The pipeline state machine
#[derive(Debug, Clone)]
pub struct StageMachine {
    pub step: PipelineStep,
    /// Network retries spent in the crawl stage
    pub crawl_retries: u32,
}

impl Default for StageMachine {
    fn default() -> Self {
        Self {
            step: PipelineStep::Initializing,
            crawl_retries: 0,
        }
    }
}

impl StageMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance along the canonical path; terminal steps stay put
    pub fn advance(&mut self) -> PipelineStep {
        self.step = match self.step {
            PipelineStep::Initializing => PipelineStep::Crawling,
            PipelineStep::Crawling => PipelineStep::Analyzing,
            PipelineStep::Analyzing => PipelineStep::Reporting,
            PipelineStep::Reporting => PipelineStep::Completed,
            terminal => terminal,
        };
        self.step
    }

    /// End the run on a non-canonical step
    pub fn end(&mut self, step: PipelineStep) {
        if !self.is_complete() {
            self.step = step;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.step.is_terminal()
    }

    pub fn is_success(&self) -> bool {
        self.step == PipelineStep::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_advance() {
        let mut machine = StageMachine::new();
        assert_eq!(machine.step, PipelineStep::Initializing);
        assert_eq!(machine.advance(), PipelineStep::Crawling);
        assert_eq!(machine.advance(), PipelineStep::Analyzing);
        assert_eq!(machine.advance(), PipelineStep::Reporting);
        assert_eq!(machine.advance(), PipelineStep::Completed);
        assert_eq!(machine.advance(), PipelineStep::Completed);
        assert!(machine.is_success());
    }

    #[test]
    fn test_terminal_step_is_sticky() {
        let mut machine = StageMachine::new();
        machine.advance();
        machine.end(PipelineStep::Cancelled);
        assert!(machine.is_complete());
        assert!(!machine.is_success());

        machine.end(PipelineStep::Failed);
        machine.advance();
        assert_eq!(machine.step, PipelineStep::Cancelled);
    }
}
