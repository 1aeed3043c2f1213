//! 事件流回调分发
//!
//! 把解码出的事件按到达顺序转成回调：文本增量、工具调用、积分与
//! 完成通知。工具调用片段在这里拼装；token 用量在流结束时做兜底估算。

use futures::StreamExt;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::kiro::parser::{Event, EventStreamDecoder, ToolUseEvent};

/// 流式响应回调
///
/// 同一次调用内按帧到达顺序依次触发；`on_complete` 在流结束时触发一次。
pub trait StreamCallbacks: Send {
    /// 文本增量（`thinking` 为 true 表示思考内容）
    fn on_text(&mut self, text: &str, thinking: bool);

    /// 一次完整的工具调用
    fn on_tool_use(&mut self, tool_use: ToolUse);

    /// 本次调用累计消耗的积分（credits > 0 时在完成前触发一次）
    fn on_credits(&mut self, credits: f64);

    /// 流结束（输入 / 输出 token 数，含估算兜底）
    fn on_complete(&mut self, input_tokens: i64, output_tokens: i64);
}

/// 拼装完成的工具调用
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub tool_use_id: String,
    pub name: String,
    pub input: Map<String, Value>,
}

/// 工具调用拼装器
///
/// 任一时刻至多一个"打开中"的工具调用；新 id 到来时先结算旧的。
#[derive(Debug, Default)]
struct ToolUseAccumulator {
    current: Option<OpenToolUse>,
}

#[derive(Debug)]
struct OpenToolUse {
    id: String,
    name: String,
    input_buf: String,
}

impl ToolUseAccumulator {
    fn handle(&mut self, ev: ToolUseEvent, callbacks: &mut dyn StreamCallbacks) {
        if !ev.tool_use_id.is_empty() && !ev.name.is_empty() {
            match &self.current {
                None => {
                    self.current = Some(OpenToolUse {
                        id: ev.tool_use_id.clone(),
                        name: ev.name.clone(),
                        input_buf: String::new(),
                    });
                }
                Some(open) if open.id != ev.tool_use_id => {
                    self.finish(callbacks);
                    self.current = Some(OpenToolUse {
                        id: ev.tool_use_id.clone(),
                        name: ev.name.clone(),
                        input_buf: String::new(),
                    });
                }
                Some(_) => {}
            }
        }

        if let Some(open) = &mut self.current {
            match ev.input {
                // 字符串片段：追加（部分 JSON）
                Some(Value::String(s)) => open.input_buf.push_str(&s),
                // 完整对象：整体替换缓冲区
                Some(Value::Object(obj)) => {
                    open.input_buf = Value::Object(obj).to_string();
                }
                _ => {}
            }
        }

        // stop 且无打开状态时是 no-op
        if ev.stop {
            self.finish(callbacks);
        }
    }

    /// 结算当前工具调用：缓冲区按 JSON 解析，失败则给空对象
    fn finish(&mut self, callbacks: &mut dyn StreamCallbacks) {
        let Some(open) = self.current.take() else {
            return;
        };

        let input = serde_json::from_str::<Map<String, Value>>(&open.input_buf)
            .unwrap_or_default();

        callbacks.on_tool_use(ToolUse {
            tool_use_id: open.id,
            name: open.name,
            input,
        });
    }
}

/// 事件流处理器
///
/// 把解码、事件分发与用量累计合在一起；`feed` 喂入响应字节，
/// `finish` 在流结束后做估算并触发完成回调。
pub struct StreamProcessor {
    decoder: EventStreamDecoder,
    tool_use: ToolUseAccumulator,
    estimated_input_tokens: i64,
    input_tokens: i64,
    output_tokens: i64,
    total_output_chars: usize,
    total_credits: f64,
}

impl StreamProcessor {
    /// `estimated_input_tokens`：上游没返回 inputTokens 时的兜底值
    pub fn new(estimated_input_tokens: i64) -> Self {
        Self {
            decoder: EventStreamDecoder::new(),
            tool_use: ToolUseAccumulator::default(),
            estimated_input_tokens,
            input_tokens: 0,
            output_tokens: 0,
            total_output_chars: 0,
            total_credits: 0.0,
        }
    }

    /// 喂入一块响应数据，分发其中所有完整帧
    pub fn feed(&mut self, chunk: &[u8], callbacks: &mut dyn StreamCallbacks) -> Result<()> {
        self.decoder.feed(chunk);

        loop {
            let frame = match self.decoder.decode_iter().next() {
                Some(Ok(f)) => f,
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            };

            let event = match Event::from_frame(&frame) {
                Ok(ev) => ev,
                Err(e) => {
                    // 单条坏消息跳过，流继续
                    tracing::debug!("跳过无法解析的事件: {}", e);
                    continue;
                }
            };

            match event {
                Event::AssistantResponse { content } => {
                    if !content.is_empty() {
                        self.total_output_chars += content.len();
                        callbacks.on_text(&content, false);
                    }
                }
                Event::ReasoningContent { text } => {
                    if !text.is_empty() {
                        self.total_output_chars += text.len();
                        callbacks.on_text(&text, true);
                    }
                }
                Event::ToolUse(ev) => self.tool_use.handle(ev, callbacks),
                Event::Metadata { token_usage } => {
                    if let Some(usage) = token_usage {
                        self.output_tokens = usage.output_tokens;
                        self.input_tokens = usage.input_tokens();
                    }
                }
                Event::Metering { usage } => self.total_credits += usage,
                Event::Other { .. } => {}
            }
        }
    }

    /// 流结束：校验是否中途截断，做 token 估算并触发收尾回调
    pub fn finish(mut self, callbacks: &mut dyn StreamCallbacks) -> Result<()> {
        if self.decoder.is_mid_message() {
            return Err(Error::Protocol("事件流在消息中途截断".to_string()));
        }

        // 上游没给 outputTokens 时按 3 字符 ≈ 1 token 估算
        if self.output_tokens == 0 && self.total_output_chars > 0 {
            self.output_tokens = (self.total_output_chars as i64 / 3).max(1);
        }
        if self.input_tokens == 0 {
            self.input_tokens = self.estimated_input_tokens;
        }

        if self.total_credits > 0.0 {
            callbacks.on_credits(self.total_credits);
        }
        callbacks.on_complete(self.input_tokens, self.output_tokens);
        Ok(())
    }
}

/// 读取整个流式响应体并驱动回调
pub async fn process_event_stream(
    response: reqwest::Response,
    callbacks: &mut dyn StreamCallbacks,
    estimated_input_tokens: i64,
) -> Result<()> {
    let mut processor = StreamProcessor::new(estimated_input_tokens);
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(Error::network)?;
        processor.feed(&chunk, callbacks)?;
    }

    processor.finish(callbacks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kiro::parser::decoder::encode_message;

    /// 记录所有回调的测试桩
    #[derive(Debug, Default)]
    struct Recorder {
        texts: Vec<(String, bool)>,
        tool_uses: Vec<ToolUse>,
        credits: Vec<f64>,
        completions: Vec<(i64, i64)>,
    }

    impl StreamCallbacks for Recorder {
        fn on_text(&mut self, text: &str, thinking: bool) {
            self.texts.push((text.to_string(), thinking));
        }
        fn on_tool_use(&mut self, tool_use: ToolUse) {
            self.tool_uses.push(tool_use);
        }
        fn on_credits(&mut self, credits: f64) {
            self.credits.push(credits);
        }
        fn on_complete(&mut self, input_tokens: i64, output_tokens: i64) {
            self.completions.push((input_tokens, output_tokens));
        }
    }

    fn run(messages: &[(&str, &str)], estimated_input: i64) -> Recorder {
        let mut rec = Recorder::default();
        let mut processor = StreamProcessor::new(estimated_input);
        for (event_type, payload) in messages {
            let res = processor.feed(&encode_message(event_type, payload), &mut rec);
            if let Err(e) = res {
                panic!("{:?}", e);
            }
        }
        if let Err(e) = processor.finish(&mut rec) {
            panic!("{:?}", e);
        }
        rec
    }

    #[test]
    fn test_text_and_metadata_stream() {
        let rec = run(
            &[
                ("assistantResponseEvent", r#"{"content":"hi"}"#),
                (
                    "metadataEvent",
                    r#"{"tokenUsage":{"outputTokens":5,"uncachedInputTokens":7,"cacheReadInputTokens":3,"cacheWriteInputTokens":0}}"#,
                ),
            ],
            999,
        );

        assert_eq!(rec.texts, vec![("hi".to_string(), false)]);
        assert!(rec.credits.is_empty());
        assert_eq!(rec.completions, vec![(10, 5)]);
    }

    #[test]
    fn test_reasoning_is_thinking() {
        let rec = run(&[("reasoningContentEvent", r#"{"text":"嗯"}"#)], 1);
        assert_eq!(rec.texts.len(), 1);
        assert!(rec.texts[0].1);
    }

    #[test]
    fn test_tool_use_fragments_assembled() {
        let rec = run(
            &[
                (
                    "toolUseEvent",
                    r#"{"toolUseId":"t1","name":"foo","input":"{\"a\":"}"#,
                ),
                (
                    "toolUseEvent",
                    r#"{"toolUseId":"t1","input":"1}","stop":true}"#,
                ),
            ],
            1,
        );

        assert_eq!(rec.tool_uses.len(), 1);
        let tu = &rec.tool_uses[0];
        assert_eq!(tu.tool_use_id, "t1");
        assert_eq!(tu.name, "foo");
        assert_eq!(tu.input.get("a"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn test_tool_use_object_input_replaces_buffer() {
        let rec = run(
            &[
                (
                    "toolUseEvent",
                    r#"{"toolUseId":"t1","name":"foo","input":"garbage"}"#,
                ),
                (
                    "toolUseEvent",
                    r#"{"toolUseId":"t1","input":{"b":2},"stop":true}"#,
                ),
            ],
            1,
        );

        assert_eq!(rec.tool_uses.len(), 1);
        assert_eq!(rec.tool_uses[0].input.get("b"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn test_new_tool_use_id_finalizes_previous() {
        let rec = run(
            &[
                (
                    "toolUseEvent",
                    r#"{"toolUseId":"t1","name":"foo","input":"{}"}"#,
                ),
                (
                    "toolUseEvent",
                    r#"{"toolUseId":"t2","name":"bar","input":{"x":1},"stop":true}"#,
                ),
            ],
            1,
        );

        assert_eq!(rec.tool_uses.len(), 2);
        assert_eq!(rec.tool_uses[0].tool_use_id, "t1");
        assert_eq!(rec.tool_uses[1].tool_use_id, "t2");
    }

    #[test]
    fn test_stop_without_open_state_is_noop() {
        let rec = run(&[("toolUseEvent", r#"{"stop":true}"#)], 1);
        assert!(rec.tool_uses.is_empty());
        assert_eq!(rec.completions.len(), 1);
    }

    #[test]
    fn test_unparsable_input_buffer_yields_empty_object() {
        let rec = run(
            &[(
                "toolUseEvent",
                r#"{"toolUseId":"t1","name":"foo","input":"{broken","stop":true}"#,
            )],
            1,
        );

        assert_eq!(rec.tool_uses.len(), 1);
        assert!(rec.tool_uses[0].input.is_empty());
    }

    #[test]
    fn test_output_tokens_estimated_from_chars() {
        // 9 字节文本且无 metadata：输出按 9/3 = 3 估算，输入回退到估算值
        let rec = run(&[("assistantResponseEvent", r#"{"content":"abcdefghi"}"#)], 42);
        assert_eq!(rec.completions, vec![(42, 3)]);
    }

    #[test]
    fn test_output_estimate_has_floor_of_one() {
        let rec = run(&[("assistantResponseEvent", r#"{"content":"a"}"#)], 1);
        assert_eq!(rec.completions, vec![(1, 1)]);
    }

    #[test]
    fn test_metering_accumulates_credits() {
        let rec = run(
            &[
                ("meteringEvent", r#"{"usage":1.5}"#),
                ("meteringEvent", r#"{"usage":0.5}"#),
            ],
            1,
        );
        assert_eq!(rec.credits, vec![2.0]);
    }

    #[test]
    fn test_no_credits_callback_when_zero() {
        let rec = run(&[("assistantResponseEvent", r#"{"content":"x"}"#)], 1);
        assert!(rec.credits.is_empty());
    }

    #[test]
    fn test_malformed_message_is_skipped() {
        let rec = run(
            &[
                ("assistantResponseEvent", "not json at all"),
                ("assistantResponseEvent", r#"{"content":"ok"}"#),
            ],
            1,
        );
        assert_eq!(rec.texts, vec![("ok".to_string(), false)]);
    }

    #[test]
    fn test_truncated_stream_is_fatal() {
        let mut rec = Recorder::default();
        let mut processor = StreamProcessor::new(1);

        let msg = encode_message("assistantResponseEvent", r#"{"content":"hi"}"#);
        let res = processor.feed(&msg[..msg.len() - 5], &mut rec);
        if let Err(e) = res {
            panic!("{:?}", e);
        }

        match processor.finish(&mut rec) {
            Err(Error::Protocol(_)) => {}
            other => panic!("期望 Protocol 错误，得到 {:?}", other),
        }
        assert!(rec.completions.is_empty());
    }

    #[test]
    fn test_callbacks_preserve_frame_order() {
        let rec = run(
            &[
                ("assistantResponseEvent", r#"{"content":"1"}"#),
                ("reasoningContentEvent", r#"{"text":"2"}"#),
                ("assistantResponseEvent", r#"{"content":"3"}"#),
            ],
            1,
        );
        let seq: Vec<&str> = rec.texts.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(seq, vec!["1", "2", "3"]);
    }
}
