//! 事件流解析
//!
//! `decoder` 负责二进制帧，`events` 负责帧内 JSON 载荷。

pub mod decoder;
pub mod events;

pub use decoder::{EventStreamDecoder, Frame, Header, HeaderValue};
pub use events::{Event, TokenUsage, ToolUseEvent};
