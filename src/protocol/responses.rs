use crate::protocol::chat::{ChatMessage, MessageContent, Usage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const OUTPUT_TYPE_MESSAGE: &str = "message";
pub const CONTENT_TYPE_OUTPUT_TEXT: &str = "output_text";
/// 输出项ID中UUID前缀的长度
pub const OUTPUT_ID_PREFIX_LEN: usize = 8;

/// 客户端侧的Responses API请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsesRequest {
    #[serde(default)]
    pub model: String,
    /// 非结构化输入：可能是字符串、数组，由parse_input在边界处归一化
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

impl ResponsesRequest {
    /// 将input字段归一化为消息列表
    ///
    /// 优先级：
    /// 1. messages非空时原样返回，忽略input
    /// 2. input缺失返回空列表
    /// 3. input为字符串时包装为单条user消息
    /// 4. input为数组时逐个收集字符串元素，非字符串元素静默跳过
    /// 5. 其他形状返回空列表
    pub fn parse_input(&self) -> Vec<ChatMessage> {
        if !self.messages.is_empty() {
            return self.messages.clone();
        }

        let Some(input) = &self.input else {
            return Vec::new();
        };

        match input {
            Value::String(text) => vec![ChatMessage {
                role: "user".to_string(),
                content: MessageContent::Text(text.clone()),
            }],
            Value::Array(items) => items
                .iter()
                .filter_map(|item| item.as_str())
                .map(|text| ChatMessage {
                    role: "user".to_string(),
                    content: MessageContent::Text(text.to_string()),
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// 输出项中的一段内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesOutputContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
}

/// 响应中的一个输出项（消息）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesOutputItem {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: String,
    pub role: String,
    pub content: Vec<ResponsesOutputContent>,
}

/// 客户端侧的Responses API非流式响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesResponse {
    pub id: String,
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    pub output: Vec<ResponsesOutputItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// 流式输出项中的一段增量内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesStreamOutputContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// 流式响应中的一个输出项
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesStreamOutputItem {
    pub index: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ResponsesStreamOutputContent>,
}

/// 客户端侧的流式事件（每个转换后的SSE data行一条）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesStreamEvent {
    pub id: String,
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<ResponsesStreamOutputItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn input_as_string() {
        let req = ResponsesRequest {
            model: "gpt-3.5-turbo".to_string(),
            input: Some(json!("Hello, world!")),
            ..Default::default()
        };

        let messages = req.parse_input();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].content.text_content(), "Hello, world!");
    }

    #[test]
    fn input_as_array_skips_non_strings() {
        let req = ResponsesRequest {
            model: "gpt-3.5-turbo".to_string(),
            input: Some(json!(["Hello", 5, "world"])),
            ..Default::default()
        };

        let messages = req.parse_input();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content.text_content(), "Hello");
        assert_eq!(messages[1].content.text_content(), "world");
    }

    #[test]
    fn messages_take_precedence_over_input() {
        let req = ResponsesRequest {
            model: "gpt-3.5-turbo".to_string(),
            input: Some(json!("ignored")),
            messages: vec![ChatMessage {
                role: "system".to_string(),
                content: MessageContent::Text("Test message".to_string()),
            }],
            ..Default::default()
        };

        let messages = req.parse_input();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content.text_content(), "Test message");
    }

    #[test]
    fn empty_input_yields_empty_list() {
        let req = ResponsesRequest {
            model: "gpt-3.5-turbo".to_string(),
            ..Default::default()
        };

        assert!(req.parse_input().is_empty());
    }

    #[test]
    fn null_input_yields_empty_list() {
        let req: ResponsesRequest =
            serde_json::from_str(r#"{"model":"gpt-3.5-turbo","input":null}"#).unwrap();
        assert!(req.parse_input().is_empty());
    }

    #[test]
    fn object_input_yields_empty_list() {
        let req = ResponsesRequest {
            model: "gpt-3.5-turbo".to_string(),
            input: Some(json!({"unexpected": "shape"})),
            ..Default::default()
        };

        assert!(req.parse_input().is_empty());
    }

    #[test]
    fn stream_flag_deserializes() {
        let req: ResponsesRequest =
            serde_json::from_str(r#"{"model":"gpt-3.5-turbo","input":"Hello","stream":true}"#)
                .unwrap();
        assert!(req.stream);
    }
}
