//! Per-run progress snapshot kept by the executor while an audit is dispatched.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::events::PipelineStep;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionProgress {
    pub audit_id: String,
    pub step: PipelineStep,
    /// Overall progress, 0..=100
    pub overall: u8,
    /// Agent name -> 0 (pending), 50 (running) or 100 (finished)
    pub agents: HashMap<String, u8>,
    pub completed: Vec<String>,
    pub running: Vec<String>,
    pub pending: Vec<String>,
    pub failed: Vec<String>,
}

impl ExecutionProgress {
    pub fn new(audit_id: &str) -> Self {
        Self {
            audit_id: audit_id.to_string(),
            step: PipelineStep::Initializing,
            overall: PipelineStep::Initializing.canonical_progress().unwrap_or(0),
            agents: HashMap::new(),
            completed: Vec::new(),
            running: Vec::new(),
            pending: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Move to `step`; non-canonical steps keep the current overall value
    pub fn set_step(&mut self, step: PipelineStep) {
        self.step = step;
        if let Some(overall) = step.canonical_progress() {
            self.overall = overall;
        }
    }

    pub fn plan(&mut self, agents: &[String]) {
        for name in agents {
            self.agents.insert(name.clone(), 0);
        }
        self.pending = agents.to_vec();
    }

    pub fn dispatch_all(&mut self) {
        for name in self.pending.drain(..) {
            self.agents.insert(name.clone(), 50);
            self.running.push(name);
        }
    }

    pub fn finish_agent(&mut self, name: &str, succeeded: bool) {
        self.running.retain(|n| n != name);
        self.pending.retain(|n| n != name);
        self.agents.insert(name.to_string(), 100);
        if succeeded {
            self.completed.push(name.to_string());
        } else {
            self.failed.push(name.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_lifecycle() {
        let mut progress = ExecutionProgress::new("a1");
        assert_eq!(progress.overall, 5);

        progress.set_step(PipelineStep::Analyzing);
        progress.plan(&["keywords".to_string(), "technical".to_string()]);
        assert_eq!(progress.pending.len(), 2);

        progress.dispatch_all();
        assert!(progress.pending.is_empty());
        assert_eq!(progress.agents["keywords"], 50);

        progress.finish_agent("keywords", true);
        progress.finish_agent("technical", false);
        assert_eq!(progress.completed, vec!["keywords"]);
        assert_eq!(progress.failed, vec!["technical"]);
        assert!(progress.running.is_empty());
        assert_eq!(progress.overall, 70);

        progress.set_step(PipelineStep::TimedOut);
        assert_eq!(progress.overall, 70);
    }
}
