use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use serde_json::Value;

use weft_core::config::ModelConfig;
use weft_core::error::{Result, WeftError};
use weft_core::traits::LlmClient;
use weft_core::types::*;

/// One scripted oracle answer.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Final answer with no tool calls.
    Text(String),
    /// Optional text followed by tool invocations `(name, input)`.
    Tools {
        text: String,
        calls: Vec<(String, Value)>,
    },
    /// Raw deltas, for malformed-call tests.
    Deltas(Vec<StreamDelta>),
    /// Request-level failure (`WeftError::LlmRequest`).
    Error(String),
    /// Never answers.
    Hang,
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn tool(name: impl Into<String>, input: Value) -> Self {
        Self::Tools {
            text: String::new(),
            calls: vec![(name.into(), input)],
        }
    }

    pub fn tools(calls: Vec<(&str, Value)>) -> Self {
        Self::Tools {
            text: String::new(),
            calls: calls
                .into_iter()
                .map(|(name, input)| (name.to_string(), input))
                .collect(),
        }
    }

    fn into_deltas(self, seq: usize) -> Vec<StreamDelta> {
        match self {
            Self::Text(text) => vec![
                StreamDelta::TextDelta(text),
                StreamDelta::Stop(StopReason::EndTurn),
            ],
            Self::Tools { text, calls } => {
                let mut deltas = Vec::new();
                if !text.is_empty() {
                    deltas.push(StreamDelta::TextDelta(text));
                }
                for (index, (name, input)) in calls.into_iter().enumerate() {
                    deltas.push(StreamDelta::ToolUseStart {
                        index,
                        id: format!("call_{}_{}", seq, index),
                        name,
                    });
                    deltas.push(StreamDelta::ToolInputDelta {
                        index,
                        delta: input.to_string(),
                    });
                }
                deltas.push(StreamDelta::Stop(StopReason::ToolUse));
                deltas
            }
            Self::Deltas(deltas) => deltas,
            Self::Error(_) | Self::Hang => Vec::new(),
        }
    }
}

/// What the oracle was asked.
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<String>,
}

impl MockRequest {
    pub fn system_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(ChatMessage::text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Text of the most recent user message that carries text.
    pub fn last_user_text(&self) -> String {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::User)
            .map(ChatMessage::text)
            .find(|t| !t.is_empty())
            .unwrap_or_default()
    }

    /// `(content, is_error)` of every tool result in the latest message.
    pub fn last_tool_results(&self) -> Vec<(String, bool)> {
        self.messages
            .last()
            .map(|m| {
                m.content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolResult {
                            content, is_error, ..
                        } => Some((content.clone(), *is_error)),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All text in the conversation, every role.
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        for message in &self.messages {
            for block in &message.content {
                match block {
                    ContentBlock::Text { text } => out.push_str(text),
                    ContentBlock::ToolResult { content, .. } => out.push_str(content),
                    _ => {}
                }
                out.push('\n');
            }
        }
        out
    }
}

type Router = Box<dyn Fn(&MockRequest) -> MockReply + Send + Sync>;

/// Scripted oracle. Replies come from a queue or a routing closure; every
/// request is recorded.
pub struct MockLlm {
    script: Mutex<VecDeque<MockReply>>,
    router: Option<Router>,
    requests: Mutex<Vec<MockRequest>>,
    seq: AtomicUsize,
}

impl MockLlm {
    pub fn with_replies(replies: Vec<MockReply>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            router: None,
            requests: Mutex::new(Vec::new()),
            seq: AtomicUsize::new(0),
        }
    }

    pub fn from_fn<F>(route: F) -> Self
    where
        F: Fn(&MockRequest) -> MockReply + Send + Sync + 'static,
    {
        Self {
            script: Mutex::new(VecDeque::new()),
            router: Some(Box::new(route)),
            requests: Mutex::new(Vec::new()),
            seq: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, reply: MockReply) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl LlmClient for MockLlm {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let request = MockRequest {
            messages,
            tools: tools.iter().map(|t| t.name.clone()).collect(),
        };

        Box::pin(async move {
            let reply = match &self.router {
                Some(route) => route(&request),
                None => self
                    .script
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| MockReply::Error("mock script exhausted".into())),
            };
            self.requests.lock().unwrap().push(request);
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);

            match reply {
                MockReply::Error(msg) => Err(WeftError::LlmRequest(msg)),
                MockReply::Hang => futures::future::pending().await,
                other => {
                    let deltas = other.into_deltas(seq);
                    let stream: BoxStream<'_, Result<StreamDelta>> =
                        Box::pin(stream::iter(deltas.into_iter().map(Ok)));
                    Ok(stream)
                }
            }
        })
    }
}
