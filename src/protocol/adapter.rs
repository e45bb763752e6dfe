use crate::error::{Error, Result};
use crate::protocol::chat::{ChatRequest, ChatResponse, ChatStreamChunk};
use crate::protocol::responses::{
    ResponsesOutputContent, ResponsesOutputItem, ResponsesRequest, ResponsesResponse,
    ResponsesStreamEvent, ResponsesStreamOutputContent, ResponsesStreamOutputItem,
    CONTENT_TYPE_OUTPUT_TEXT, OUTPUT_ID_PREFIX_LEN, OUTPUT_TYPE_MESSAGE,
};
use uuid::Uuid;

/// 将Responses请求翻译为规范化的下游请求
///
/// 校验顺序与失败语义：
/// - model缺失或为空 -> InvalidRequest
/// - 归一化后消息列表为空 -> InvalidRequest
/// - stream标志和采样参数原样带过
pub fn translate_request(req: &ResponsesRequest) -> Result<ChatRequest> {
    if req.model.is_empty() {
        return Err(Error::InvalidRequest("model is required".to_string()));
    }

    let messages = req.parse_input();
    if messages.is_empty() {
        return Err(Error::InvalidRequest(
            "either input or messages must be provided".to_string(),
        ));
    }

    Ok(ChatRequest {
        model: req.model.clone(),
        messages,
        stream: req.stream,
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
    })
}

/// 生成新的输出项ID，形如 "msg_1a2b3c4d"
/// 每次转换都生成新ID，不跨输出项或跨请求复用
fn new_output_id() -> String {
    format!("msg_{}", &Uuid::new_v4().to_string()[..OUTPUT_ID_PREFIX_LEN])
}

/// 将下游非流式响应整体转换为Responses格式
pub fn chat_to_responses(chat_resp: &ChatResponse) -> ResponsesResponse {
    let output = chat_resp
        .choices
        .iter()
        .map(|choice| ResponsesOutputItem {
            id: new_output_id(),
            item_type: OUTPUT_TYPE_MESSAGE.to_string(),
            role: choice.message.role.clone(),
            content: vec![ResponsesOutputContent {
                content_type: CONTENT_TYPE_OUTPUT_TEXT.to_string(),
                text: choice.message.content.text_content(),
            }],
        })
        .collect();

    ResponsesResponse {
        id: chat_resp.id.clone(),
        object: "response".to_string(),
        created: chat_resp.created,
        model: chat_resp.model.clone(),
        output,
        usage: chat_resp.usage.clone(),
    }
}

/// 将下游流式事件转换为Responses流式事件
pub fn chat_stream_to_responses_stream(chunk: &ChatStreamChunk) -> ResponsesStreamEvent {
    let output = chunk
        .choices
        .iter()
        .map(|choice| {
            let mut content = Vec::new();

            // 本次没有文本增量的choice不产生内容项，而不是产生空字符串项
            let delta_text = choice.delta.text_content();
            if !delta_text.is_empty() {
                content.push(ResponsesStreamOutputContent {
                    content_type: CONTENT_TYPE_OUTPUT_TEXT.to_string(),
                    delta: Some(delta_text),
                    text: None,
                });
            }

            // role只在下游增量携带时出现
            let role = if choice.delta.role.is_empty() {
                None
            } else {
                Some(choice.delta.role.clone())
            };

            ResponsesStreamOutputItem {
                index: choice.index,
                id: None,
                item_type: OUTPUT_TYPE_MESSAGE.to_string(),
                role,
                content,
            }
        })
        .collect();

    ResponsesStreamEvent {
        id: chunk.id.clone(),
        object: "response.delta".to_string(),
        created: chunk.created,
        model: chunk.model.clone(),
        output,
        usage: chunk.usage.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::chat::{
        ChatChoice, ChatDelta, ChatMessage, ChatStreamChoice, MessageContent, Usage,
    };
    use serde_json::json;

    fn chat_response_with_one_choice() -> ChatResponse {
        ChatResponse {
            id: "chatcmpl-123".to_string(),
            object: "chat.completion".to_string(),
            created: 1234567890,
            model: "gpt-3.5-turbo".to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content: MessageContent::Text("Hi".to_string()),
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 8,
                total_tokens: 18,
            }),
        }
    }

    #[test]
    fn translate_fails_without_model() {
        let req = ResponsesRequest {
            input: Some(json!("Hello")),
            ..Default::default()
        };

        match translate_request(&req) {
            Err(Error::InvalidRequest(msg)) => assert!(msg.contains("model")),
            other => panic!("expected InvalidRequest, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn translate_fails_without_input_or_messages() {
        let req = ResponsesRequest {
            model: "gpt-3.5-turbo".to_string(),
            ..Default::default()
        };

        match translate_request(&req) {
            Err(Error::InvalidRequest(msg)) => {
                assert!(msg.contains("either input or messages"))
            }
            other => panic!("expected InvalidRequest, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn translate_copies_sampling_parameters() {
        let req = ResponsesRequest {
            model: "gpt-3.5-turbo".to_string(),
            input: Some(json!("Hello")),
            stream: true,
            max_tokens: Some(256),
            temperature: Some(0.7),
            top_p: Some(0.9),
            ..Default::default()
        };

        let chat_req = translate_request(&req).unwrap();
        assert_eq!(chat_req.model, "gpt-3.5-turbo");
        assert_eq!(chat_req.messages.len(), 1);
        assert!(chat_req.stream);
        assert_eq!(chat_req.max_tokens, Some(256));
        assert_eq!(chat_req.temperature, Some(0.7));
        assert_eq!(chat_req.top_p, Some(0.9));
    }

    #[test]
    fn converts_single_choice_response() {
        let resp = chat_to_responses(&chat_response_with_one_choice());

        assert_eq!(resp.id, "chatcmpl-123");
        assert_eq!(resp.object, "response");
        assert_eq!(resp.created, 1234567890);
        assert_eq!(resp.model, "gpt-3.5-turbo");

        let usage = resp.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 8);
        assert_eq!(usage.total_tokens, 18);

        assert_eq!(resp.output.len(), 1);
        let item = &resp.output[0];
        assert_eq!(item.item_type, "message");
        assert_eq!(item.role, "assistant");
        assert!(item.id.starts_with("msg_"));
        assert_eq!(item.content.len(), 1);
        assert_eq!(item.content[0].content_type, "output_text");
        assert_eq!(item.content[0].text, "Hi");
    }

    #[test]
    fn output_ids_are_fresh_per_item() {
        let mut resp = chat_response_with_one_choice();
        resp.choices.push(resp.choices[0].clone());

        let converted = chat_to_responses(&resp);
        assert_eq!(converted.output.len(), 2);
        assert_ne!(converted.output[0].id, converted.output[1].id);
    }

    #[test]
    fn stream_delta_with_text_produces_one_content_part() {
        let chunk = ChatStreamChunk {
            id: "chatcmpl-123".to_string(),
            object: "chat.completion.chunk".to_string(),
            created: 1234567890,
            model: "gpt-3.5-turbo".to_string(),
            choices: vec![ChatStreamChoice {
                index: 0,
                delta: ChatDelta {
                    role: String::new(),
                    content: Some(MessageContent::Text("Hel".to_string())),
                },
                finish_reason: None,
            }],
            usage: None,
        };

        let event = chat_stream_to_responses_stream(&chunk);
        assert_eq!(event.object, "response.delta");
        assert_eq!(event.output.len(), 1);
        assert!(event.output[0].role.is_none());
        assert_eq!(event.output[0].content.len(), 1);
        assert_eq!(event.output[0].content[0].content_type, "output_text");
        assert_eq!(event.output[0].content[0].delta.as_deref(), Some("Hel"));
    }

    #[test]
    fn stream_delta_without_text_produces_no_content_parts() {
        let chunk = ChatStreamChunk {
            id: "chatcmpl-123".to_string(),
            object: "chat.completion.chunk".to_string(),
            created: 1234567890,
            model: "gpt-3.5-turbo".to_string(),
            choices: vec![ChatStreamChoice {
                index: 0,
                delta: ChatDelta {
                    role: "assistant".to_string(),
                    content: Some(MessageContent::Text(String::new())),
                },
                finish_reason: None,
            }],
            usage: None,
        };

        let event = chat_stream_to_responses_stream(&chunk);
        assert_eq!(event.output.len(), 1);
        assert_eq!(event.output[0].role.as_deref(), Some("assistant"));
        assert!(event.output[0].content.is_empty());
    }
}
