//! History bounding for long-running agent conversations.
//!
//! Applied at one point only: after each environment refresh. Snapshot
//! turns older than the recency window lose volatile element attributes and
//! their images; stale images become a placeholder and runs of identical
//! placeholders collapse. Then the whole history is pruned to the token
//! budget, oldest unprotected turns first.

use std::sync::OnceLock;

use regex::Regex;
use tiktoken_rs::CoreBPE;
use tracing::debug;

use weft_core::types::{ChatMessage, ContentBlock, MessageMetadata};

/// Bumped whenever the stripping rules change; messages remember the
/// version applied to them so a policy runs at most once per message.
pub const POLICY_VERSION: u32 = 1;

pub const IMAGE_PLACEHOLDER: &str = "[image]";

/// Attributes with no semantic value for the oracle.
const VOLATILE_ATTRS: &[&str] = &["class", "style", "src", "srcset", "href"];

fn tokenizer() -> Option<&'static CoreBPE> {
    static TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    TOKENIZER
        .get_or_init(|| tiktoken_rs::cl100k_base().ok())
        .as_ref()
}

/// BPE token count (cl100k_base), or a chars/4 estimate when the
/// tokenizer is unavailable.
pub fn estimate_tokens(text: &str) -> usize {
    match tokenizer() {
        Some(bpe) => bpe.encode_ordinary(text).len(),
        None => text.len().div_ceil(4),
    }
}

pub fn estimate_message_tokens(msg: &ChatMessage) -> usize {
    let content = serde_json::to_string(&msg.content).unwrap_or_default();
    estimate_tokens(&content) + 4
}

fn element_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[\d+\]:<[A-Za-z][\w-]*").expect("static regex"))
}

fn volatile_attr() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let names = VOLATILE_ATTRS.join("|");
        Regex::new(&format!(
            r#"\s+(?i:{})\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#,
            names
        ))
        .expect("static regex")
    })
}

/// Strip volatile attributes from the opening tag of every `[i]:<tag …>`
/// line. The index prefix, tag name and element text are kept.
pub fn strip_volatile_attributes(elements: &str) -> String {
    elements
        .lines()
        .map(|line| {
            let Some(head) = element_line().find(line) else {
                return line.to_string();
            };
            let tag_end = line[head.end()..]
                .find('>')
                .map(|i| head.end() + i)
                .unwrap_or(line.len());
            let attrs = volatile_attr().replace_all(&line[head.end()..tag_end], "");
            format!("{}{}{}", &line[..head.end()], attrs, &line[tag_end..])
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Apply the snapshot policy to every snapshot turn except the newest
/// `window`. Returns how many messages changed.
pub fn compact_snapshots(messages: &mut [ChatMessage], window: usize) -> usize {
    let snapshot_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_snapshot())
        .map(|(i, _)| i)
        .collect();
    let stale = snapshot_indices.len().saturating_sub(window);

    let mut changed = 0;
    for &idx in &snapshot_indices[..stale] {
        let msg = &mut messages[idx];
        let applied = msg.metadata.as_ref().map(|m| m.compaction).unwrap_or(0);
        if applied >= POLICY_VERSION {
            continue;
        }
        compact_message(msg);
        let metadata = msg.metadata.get_or_insert_with(MessageMetadata::default);
        metadata.compaction = POLICY_VERSION;
        changed += 1;
    }
    if changed > 0 {
        debug!(changed, window, "Compacted stale snapshots");
    }
    changed
}

fn compact_message(msg: &mut ChatMessage) {
    let blocks = std::mem::take(&mut msg.content);
    let mut out: Vec<ContentBlock> = Vec::with_capacity(blocks.len());
    for block in blocks {
        let block = match block {
            ContentBlock::Image { .. } => ContentBlock::text(IMAGE_PLACEHOLDER),
            ContentBlock::Text { text } => ContentBlock::Text {
                text: strip_volatile_attributes(&text),
            },
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => ContentBlock::ToolResult {
                tool_use_id,
                content: strip_volatile_attributes(&content),
                is_error,
            },
            other => other,
        };
        let duplicate_placeholder = matches!(
            (&block, out.last()),
            (ContentBlock::Text { text }, Some(ContentBlock::Text { text: prev }))
                if text == IMAGE_PLACEHOLDER && prev == IMAGE_PLACEHOLDER
        );
        if !duplicate_placeholder {
            out.push(block);
        }
    }
    msg.content = out;
}

/// Remove the oldest unprotected messages after the system prompt until the
/// history fits `budget` tokens. The last `min_tail` messages stay. An
/// assistant turn and the tool results answering it are removed together or
/// not at all; pruning stops at a pair that reaches into the tail.
/// Returns the number of messages removed.
pub fn prune_to_budget(messages: &mut Vec<ChatMessage>, budget: usize, min_tail: usize) -> usize {
    let mut removed = 0;

    loop {
        let total: usize = messages.iter().map(estimate_message_tokens).sum();
        if total <= budget {
            break;
        }

        let len = messages.len();
        if len <= 1 + min_tail {
            break;
        }
        let tail_start = len - min_tail;

        let Some((idx, count)) = next_prunable(messages, tail_start) else {
            break;
        };
        messages.drain(idx..idx + count);
        removed += count;
    }

    if removed > 0 {
        debug!(removed, budget, "Pruned history to token budget");
    }
    removed
}

/// Start and length of the oldest removable unit before `tail_start`.
fn next_prunable(messages: &[ChatMessage], tail_start: usize) -> Option<(usize, usize)> {
    for idx in 1..tail_start {
        let msg = &messages[idx];
        // Results go with their call; a result whose call is kept stays too.
        if msg.is_protected() || carries_tool_results(msg) {
            continue;
        }
        if msg.tool_uses().is_empty() {
            return Some((idx, 1));
        }
        let answered = messages.get(idx + 1).is_some_and(carries_tool_results);
        if !answered {
            return Some((idx, 1));
        }
        if idx + 1 >= tail_start {
            return None;
        }
        return Some((idx, 2));
    }
    None
}

fn carries_tool_results(msg: &ChatMessage) -> bool {
    msg.content
        .iter()
        .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
}

/// Truncate tool output to roughly `max_tokens * 4` characters, preferring a
/// newline boundary.
pub fn compact_tool_output(content: &str, max_tokens: usize) -> String {
    let max_chars = max_tokens * 4;
    if content.len() <= max_chars {
        return content.to_string();
    }
    let mut cut = max_chars;
    while !content.is_char_boundary(cut) {
        cut -= 1;
    }
    let truncated = &content[..cut];
    match truncated.rfind('\n') {
        Some(nl) => format!("{}\n[truncated]", &content[..nl]),
        None => format!("{}\n[truncated]", truncated),
    }
}
