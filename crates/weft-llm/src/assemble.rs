use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;

use weft_core::error::Result;
use weft_core::event::{AgentEvent, EventBus, EventKind};
use weft_core::types::*;

/// A well-formed tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// A tool invocation whose arguments did not parse.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedCall {
    pub id: String,
    pub name: String,
    pub raw: String,
    pub error: String,
}

/// The stream-complete oracle turn.
#[derive(Debug, Clone, Default)]
pub struct AssembledTurn {
    pub text: String,
    pub thinking: String,
    pub tool_calls: Vec<ToolCall>,
    pub malformed: Vec<MalformedCall>,
    pub stop_reason: Option<StopReason>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl AssembledTurn {
    /// No tool invocations at all: the text is the final answer.
    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty() && self.malformed.is_empty()
    }

    /// The assistant message appended to history.
    pub fn to_message(&self) -> ChatMessage {
        let mut content = Vec::new();
        if !self.thinking.is_empty() {
            content.push(ContentBlock::Thinking {
                thinking: self.thinking.clone(),
            });
        }
        if !self.text.is_empty() {
            content.push(ContentBlock::text(self.text.clone()));
        }
        for call in &self.tool_calls {
            content.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
            });
        }
        for bad in &self.malformed {
            content.push(ContentBlock::ToolUse {
                id: bad.id.clone(),
                name: bad.name.clone(),
                input: Value::String(bad.raw.clone()),
            });
        }
        ChatMessage {
            role: Role::Assistant,
            content,
            timestamp: Some(chrono::Utc::now()),
            metadata: None,
        }
    }
}

#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    input_json: String,
}

struct EventSink {
    bus: Arc<EventBus>,
    run_id: RunId,
    agent: Option<AgentId>,
}

impl EventSink {
    fn emit(&self, done: bool, kind: EventKind) {
        let event = if done {
            AgentEvent::new(self.run_id.clone(), self.agent, kind)
        } else {
            AgentEvent::partial(self.run_id.clone(), self.agent, kind)
        };
        self.bus.publish(event);
    }
}

/// Folds [`StreamDelta`]s into an [`AssembledTurn`], publishing partial
/// events as it goes. Only the result of [`StreamAssembler::finish`] belongs
/// in history.
#[derive(Default)]
pub struct StreamAssembler {
    sink: Option<EventSink>,
    text: String,
    thinking: String,
    /// Keyed by the stream's content index, which need not be dense.
    calls: BTreeMap<usize, ToolCallAccumulator>,
    stop_reason: Option<StopReason>,
    input_tokens: u64,
    output_tokens: u64,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(bus: Arc<EventBus>, run_id: RunId, agent: Option<AgentId>) -> Self {
        Self {
            sink: Some(EventSink { bus, run_id, agent }),
            ..Self::default()
        }
    }

    pub fn push(&mut self, delta: StreamDelta) {
        match delta {
            StreamDelta::TextDelta(text) => {
                self.text.push_str(&text);
                if let Some(sink) = &self.sink {
                    sink.emit(
                        false,
                        EventKind::Text {
                            text: self.text.clone(),
                        },
                    );
                }
            }
            StreamDelta::ThinkingDelta(text) => {
                self.thinking.push_str(&text);
                if let Some(sink) = &self.sink {
                    sink.emit(
                        false,
                        EventKind::Thinking {
                            text: self.thinking.clone(),
                        },
                    );
                }
            }
            StreamDelta::ToolUseStart { index, id, name } => {
                let call = self.calls.entry(index).or_default();
                call.id = id;
                call.name = name;
            }
            StreamDelta::ToolInputDelta { index, delta } => {
                if let Some(call) = self.calls.get_mut(&index) {
                    call.input_json.push_str(&delta);
                    if let Some(sink) = &self.sink {
                        sink.emit(
                            false,
                            EventKind::ToolStreaming {
                                tool_use_id: call.id.clone(),
                                name: call.name.clone(),
                                partial_input: call.input_json.clone(),
                            },
                        );
                    }
                }
            }
            StreamDelta::Stop(reason) => self.stop_reason = Some(reason),
            StreamDelta::Usage {
                input_tokens,
                output_tokens,
            } => {
                self.input_tokens += input_tokens;
                self.output_tokens += output_tokens;
            }
        }
    }

    pub fn finish(self) -> AssembledTurn {
        let mut tool_calls = Vec::new();
        let mut malformed = Vec::new();
        for call in self.calls.into_values() {
            if call.name.is_empty() && call.id.is_empty() && call.input_json.is_empty() {
                continue;
            }
            if call.name.is_empty() {
                malformed.push(MalformedCall {
                    id: call.id,
                    name: call.name,
                    raw: call.input_json,
                    error: "tool call has no name".to_string(),
                });
                continue;
            }
            let raw = call.input_json.trim();
            let parsed = if raw.is_empty() {
                Ok(Value::Object(Default::default()))
            } else {
                serde_json::from_str::<Value>(raw)
            };
            match parsed {
                Ok(input) if input.is_object() => tool_calls.push(ToolCall {
                    id: call.id,
                    name: call.name,
                    input,
                }),
                Ok(_) => malformed.push(MalformedCall {
                    id: call.id,
                    name: call.name,
                    raw: call.input_json,
                    error: "tool arguments must be a JSON object".to_string(),
                }),
                Err(e) => malformed.push(MalformedCall {
                    id: call.id,
                    name: call.name,
                    raw: call.input_json,
                    error: e.to_string(),
                }),
            }
        }

        if let Some(sink) = &self.sink {
            if !self.thinking.is_empty() {
                sink.emit(
                    true,
                    EventKind::Thinking {
                        text: self.thinking.clone(),
                    },
                );
            }
            if !self.text.is_empty() {
                sink.emit(
                    true,
                    EventKind::Text {
                        text: self.text.clone(),
                    },
                );
            }
        }

        AssembledTurn {
            text: self.text,
            thinking: self.thinking,
            tool_calls,
            malformed,
            stop_reason: self.stop_reason,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        }
    }
}

/// Drain a delta stream into one assembled turn. A stream error aborts the turn.
pub async fn collect_turn(
    mut stream: BoxStream<'_, Result<StreamDelta>>,
    mut assembler: StreamAssembler,
) -> Result<AssembledTurn> {
    while let Some(delta) = stream.next().await {
        assembler.push(delta?);
    }
    Ok(assembler.finish())
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use serde_json::json;

    use weft_core::error::WeftError;

    use super::*;

    fn deltas(items: Vec<StreamDelta>) -> BoxStream<'static, Result<StreamDelta>> {
        Box::pin(stream::iter(items.into_iter().map(Ok)))
    }

    #[tokio::test]
    async fn assembles_text_and_tool_calls() {
        let turn = collect_turn(
            deltas(vec![
                StreamDelta::TextDelta("Let me ".into()),
                StreamDelta::TextDelta("click.".into()),
                StreamDelta::ToolUseStart {
                    index: 0,
                    id: "t1".into(),
                    name: "click_element".into(),
                },
                StreamDelta::ToolInputDelta {
                    index: 0,
                    delta: "{\"index\":".into(),
                },
                StreamDelta::ToolInputDelta {
                    index: 0,
                    delta: " 4}".into(),
                },
                StreamDelta::Stop(StopReason::ToolUse),
            ]),
            StreamAssembler::new(),
        )
        .await
        .unwrap();

        assert_eq!(turn.text, "Let me click.");
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].input, json!({"index": 4}));
        assert!(!turn.is_final());
        assert_eq!(turn.to_message().tool_uses().len(), 1);
    }

    #[tokio::test]
    async fn malformed_arguments_are_kept_apart() {
        let turn = collect_turn(
            deltas(vec![
                StreamDelta::ToolUseStart {
                    index: 0,
                    id: "t1".into(),
                    name: "navigate_to".into(),
                },
                StreamDelta::ToolInputDelta {
                    index: 0,
                    delta: "{\"url\": ".into(),
                },
                StreamDelta::ToolUseStart {
                    index: 1,
                    id: "t2".into(),
                    name: "current_page".into(),
                },
            ]),
            StreamAssembler::new(),
        )
        .await
        .unwrap();

        assert_eq!(turn.malformed.len(), 1);
        assert_eq!(turn.malformed[0].id, "t1");
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].input, json!({}));
    }

    #[test]
    fn sparse_tool_indices_stay_small() {
        let far = usize::MAX / 2;
        let mut assembler = StreamAssembler::new();
        assembler.push(StreamDelta::ToolUseStart {
            index: far,
            id: "t9".into(),
            name: "go_back".into(),
        });
        assembler.push(StreamDelta::ToolUseStart {
            index: 3,
            id: "t3".into(),
            name: "current_page".into(),
        });
        assert_eq!(assembler.calls.len(), 2);

        let turn = assembler.finish();
        let ids: Vec<&str> = turn.tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["t3", "t9"]);
    }

    #[tokio::test]
    async fn only_final_events_are_stream_done() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let turn = collect_turn(
            deltas(vec![
                StreamDelta::TextDelta("Do".into()),
                StreamDelta::TextDelta("ne".into()),
            ]),
            StreamAssembler::with_events(bus.clone(), RunId::new(), Some(0)),
        )
        .await
        .unwrap();
        assert!(turn.is_final());

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 3);
        assert!(seen[..2].iter().all(|e| !e.stream_done));
        assert!(seen[2].stream_done);
        match &seen[2].kind {
            EventKind::Text { text } => assert_eq!(text, "Done"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn stream_error_aborts() {
        let stream: BoxStream<'static, Result<StreamDelta>> = Box::pin(stream::iter(vec![
            Ok(StreamDelta::TextDelta("x".into())),
            Err(WeftError::LlmStream("reset".into())),
        ]));
        let err = collect_turn(stream, StreamAssembler::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::LlmStream(_)));
    }
}
