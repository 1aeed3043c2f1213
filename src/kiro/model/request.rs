//! 上游请求数据模型
//!
//! generateAssistantResponse 请求体；origin 字段在发送前由
//! 调用方按端点改写。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 请求体顶层
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroPayload {
    pub conversation_state: ConversationState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference_config: Option<InferenceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub chat_trigger_type: String,
    pub conversation_id: String,
    pub current_message: CurrentMessage,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistoryMessage>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentMessage {
    pub user_input_message: UserInputMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessage {
    pub content: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,

    /// 端点 origin 标记（AI_EDITOR / CLI），发送前改写
    pub origin: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<KiroImage>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_input_message_context: Option<UserInputMessageContext>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessageContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<KiroToolWrapper>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<KiroToolResult>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroToolWrapper {
    pub tool_specification: ToolSpecification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSchema {
    pub json: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroToolResult {
    pub tool_use_id: String,
    pub content: Vec<KiroResultContent>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KiroResultContent {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KiroImage {
    pub format: String,
    pub source: ImageSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    pub bytes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_input_message: Option<UserInputMessage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_response_message: Option<AssistantResponseMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponseMessage {
    pub content: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_uses: Option<Vec<KiroToolUse>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroToolUse {
    pub tool_use_id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

impl KiroPayload {
    /// 构造最小请求体（单条用户消息）
    pub fn new(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            conversation_state: ConversationState {
                chat_trigger_type: "MANUAL".to_string(),
                conversation_id: conversation_id.into(),
                current_message: CurrentMessage {
                    user_input_message: UserInputMessage {
                        content: content.into(),
                        model_id: None,
                        origin: "AI_EDITOR".to_string(),
                        images: None,
                        user_input_message_context: None,
                    },
                },
                history: None,
            },
            profile_arn: None,
            inference_config: None,
        }
    }

    /// 改写当前消息的 origin 标记
    pub fn set_origin(&mut self, origin: &str) {
        self.conversation_state
            .current_message
            .user_input_message
            .origin = origin.to_string();
    }
}
