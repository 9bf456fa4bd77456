use std::collections::VecDeque;

use weft_core::config::AgentConfig;
use weft_core::types::ToolRole;

/// Keeps an agent from scrolling blind: once enough recent tool calls were
/// scrolls and none of them pulled page content, the next scroll is
/// answered with the page content as well.
#[derive(Debug, Clone)]
pub struct ExtractionPolicy {
    window: usize,
    min_scrolls: usize,
    recent: VecDeque<ToolRole>,
}

impl ExtractionPolicy {
    pub fn new(window: usize, min_scrolls: usize) -> Self {
        Self {
            window: window.max(1),
            min_scrolls,
            recent: VecDeque::with_capacity(window),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.extraction_window, config.extraction_min_scrolls)
    }

    /// Record one tool invocation. Returns true when this call is a plain
    /// scroll that must be followed by a forced extraction. The window
    /// includes the call being recorded. Nothing counts as extracted until
    /// [`mark_extracted`](Self::mark_extracted) is called.
    pub fn record(&mut self, role: ToolRole) -> bool {
        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(role);

        if role != ToolRole::Scroll {
            return false;
        }
        let scrolls = self.recent.iter().filter(|r| r.is_scroll()).count();
        let extracted = self.recent.iter().any(|r| r.extracts_content());
        scrolls >= self.min_scrolls && !extracted
    }

    /// The forced extraction for the latest scroll succeeded.
    pub fn mark_extracted(&mut self) {
        if let Some(last) = self.recent.back_mut() {
            if *last == ToolRole::Scroll {
                *last = ToolRole::ScrollExtract;
            }
        }
    }

    pub fn recent(&self) -> impl Iterator<Item = ToolRole> + '_ {
        self.recent.iter().copied()
    }
}
