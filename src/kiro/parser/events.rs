//! 事件流帧 → 结构化事件
//!
//! 载荷是 UTF-8 JSON；事件种类由 `:event-type` 头决定。
//! 未知事件类型不报错，由调用方直接忽略。

use serde::Deserialize;
use serde_json::Value;

use super::decoder::Frame;
use crate::error::{Error, Result};

/// 上游事件
#[derive(Debug, Clone)]
pub enum Event {
    /// 正文文本增量
    AssistantResponse { content: String },
    /// 思考文本增量
    ReasoningContent { text: String },
    /// 工具调用片段
    ToolUse(ToolUseEvent),
    /// token 用量（messageMetadataEvent / metadataEvent）
    Metadata { token_usage: Option<TokenUsage> },
    /// 计费事件
    Metering { usage: f64 },
    /// 其他事件（忽略）
    Other { event_type: String },
}

/// toolUseEvent 载荷
///
/// `input` 可能是字符串片段（累加）或完整对象（整体替换）。
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseEvent {
    #[serde(default)]
    pub tool_use_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub stop: bool,
}

/// tokenUsage 载荷
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub uncached_input_tokens: i64,
    #[serde(default)]
    pub cache_read_input_tokens: i64,
    #[serde(default)]
    pub cache_write_input_tokens: i64,
}

impl TokenUsage {
    /// 输入 token 总和（未缓存 + 缓存读 + 缓存写）
    pub fn input_tokens(&self) -> i64 {
        self.uncached_input_tokens + self.cache_read_input_tokens + self.cache_write_input_tokens
    }
}

#[derive(Debug, Deserialize)]
struct AssistantResponsePayload {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ReasoningContentPayload {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataPayload {
    #[serde(default)]
    token_usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct MeteringPayload {
    #[serde(default)]
    usage: f64,
}

impl Event {
    /// 从一帧解析事件
    ///
    /// 载荷为空或 JSON 不可解析时返回错误，调用方跳过该帧，流继续。
    pub fn from_frame(frame: &Frame) -> Result<Event> {
        if frame.payload.is_empty() {
            return Err(Error::Decode("事件载荷为空".to_string()));
        }

        let event_type = frame.event_type().unwrap_or_default();

        let parse = |e: serde_json::Error| Error::Decode(format!("{}: {}", event_type, e));

        match event_type {
            "assistantResponseEvent" => {
                let p: AssistantResponsePayload =
                    serde_json::from_slice(&frame.payload).map_err(parse)?;
                Ok(Event::AssistantResponse { content: p.content })
            }
            "reasoningContentEvent" => {
                let p: ReasoningContentPayload =
                    serde_json::from_slice(&frame.payload).map_err(parse)?;
                Ok(Event::ReasoningContent { text: p.text })
            }
            "toolUseEvent" => {
                let p: ToolUseEvent = serde_json::from_slice(&frame.payload).map_err(parse)?;
                Ok(Event::ToolUse(p))
            }
            "messageMetadataEvent" | "metadataEvent" => {
                let p: MetadataPayload = serde_json::from_slice(&frame.payload).map_err(parse)?;
                Ok(Event::Metadata {
                    token_usage: p.token_usage,
                })
            }
            "meteringEvent" => {
                let p: MeteringPayload = serde_json::from_slice(&frame.payload).map_err(parse)?;
                Ok(Event::Metering { usage: p.usage })
            }
            other => Ok(Event::Other {
                event_type: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kiro::parser::decoder::{encode_message, EventStreamDecoder};

    fn decode_one(event_type: &str, payload: &str) -> Event {
        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&encode_message(event_type, payload));
        let frame = match decoder.decode_iter().next() {
            Some(Ok(f)) => f,
            other => panic!("期望一帧，得到 {:?}", other.map(|r| r.map(|_| ()))),
        };
        match Event::from_frame(&frame) {
            Ok(e) => e,
            Err(e) => panic!("{:?}", e),
        }
    }

    #[test]
    fn test_assistant_response_event() {
        match decode_one("assistantResponseEvent", r#"{"content":"hi"}"#) {
            Event::AssistantResponse { content } => assert_eq!(content, "hi"),
            other => panic!("期望 AssistantResponse，得到 {:?}", other),
        }
    }

    #[test]
    fn test_metadata_event_token_usage_sum() {
        let ev = decode_one(
            "metadataEvent",
            r#"{"tokenUsage":{"outputTokens":5,"uncachedInputTokens":7,"cacheReadInputTokens":3,"cacheWriteInputTokens":0}}"#,
        );
        match ev {
            Event::Metadata {
                token_usage: Some(u),
            } => {
                assert_eq!(u.output_tokens, 5);
                assert_eq!(u.input_tokens(), 10);
            }
            other => panic!("期望 Metadata，得到 {:?}", other),
        }
    }

    #[test]
    fn test_metadata_event_without_token_usage() {
        match decode_one("messageMetadataEvent", r#"{"foo":1}"#) {
            Event::Metadata { token_usage: None } => {}
            other => panic!("期望空 tokenUsage，得到 {:?}", other),
        }
    }

    #[test]
    fn test_tool_use_event_string_input() {
        match decode_one(
            "toolUseEvent",
            r#"{"toolUseId":"t1","name":"foo","input":"{\"a\":"}"#,
        ) {
            Event::ToolUse(ev) => {
                assert_eq!(ev.tool_use_id, "t1");
                assert_eq!(ev.name, "foo");
                assert!(!ev.stop);
                assert_eq!(ev.input, Some(serde_json::json!("{\"a\":")));
            }
            other => panic!("期望 ToolUse，得到 {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_type() {
        match decode_one("somethingNewEvent", r#"{"x":1}"#) {
            Event::Other { event_type } => assert_eq!(event_type, "somethingNewEvent"),
            other => panic!("期望 Other，得到 {:?}", other),
        }
    }

    #[test]
    fn test_bad_json_payload_is_error() {
        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&encode_message("assistantResponseEvent", "not json"));
        let frame = match decoder.decode_iter().next() {
            Some(Ok(f)) => f,
            _ => panic!("期望一帧"),
        };
        assert!(Event::from_frame(&frame).is_err());
    }
}
