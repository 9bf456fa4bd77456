use std::sync::Mutex;

use weft_core::traits::StepTracker;
use weft_core::types::StepStatus;

use crate::plan::AgentNode;

/// Done/todo state of an agent's top-level steps. The plan stays
/// immutable; progress lives here for the length of one loop.
#[derive(Debug)]
pub struct StepBoard {
    steps: Mutex<Vec<(String, StepStatus)>>,
}

impl StepBoard {
    pub fn for_node(node: &AgentNode) -> Self {
        Self {
            steps: Mutex::new(
                node.steps
                    .iter()
                    .map(|item| (item.summary(), StepStatus::Todo))
                    .collect(),
            ),
        }
    }

    pub fn status(&self, index: usize) -> StepStatus {
        self.steps
            .lock()
            .ok()
            .and_then(|steps| steps.get(index).map(|(_, s)| *s))
            .unwrap_or_default()
    }

    pub fn is_done(&self, index: usize) -> bool {
        self.status(index) == StepStatus::Done
    }
}

impl StepTracker for StepBoard {
    fn steps(&self) -> Vec<(usize, String, StepStatus)> {
        match self.steps.lock() {
            Ok(steps) => steps
                .iter()
                .enumerate()
                .map(|(i, (summary, status))| (i, summary.clone(), *status))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn mark(&self, indices: &[usize], status: StepStatus) -> Vec<usize> {
        let Ok(mut steps) = self.steps.lock() else {
            return Vec::new();
        };
        indices
            .iter()
            .copied()
            .filter(|i| match steps.get_mut(*i) {
                Some((_, slot)) => {
                    *slot = status;
                    true
                }
                None => false,
            })
            .collect()
    }
}
