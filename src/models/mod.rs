use serde::{Deserialize, Serialize};

/// 上游路由配置
/// 包含将请求转发到上游Chat Completions服务所需的完整配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamRoute {
    /// 供应商的API令牌/密钥
    pub token: String,
    /// 上游模型名称（如"gpt-4", "gpt-3.5-turbo"）
    pub model: String,
    /// 上游API端点URL
    #[serde(rename = "api")]
    pub api_endpoint: String,
}

/// 路由解析请求
/// 向控制面请求路由信息时的请求结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    /// 请求的模型名称
    pub model: String,
}

/// 路由解析响应
/// 控制面返回的路由信息响应结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResponse {
    /// 响应状态码（0表示成功）
    pub code: i32,
    /// 请求是否成功
    pub success: bool,
    /// 响应消息（错误时包含错误信息）
    pub message: String,
    /// 路由配置列表（可能包含多个备选路由）
    pub data: Vec<UpstreamRoute>,
}

/// 错误事件
/// 用于记录和上报转发请求的错误信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// 使用的模型名称
    pub model: String,
    /// 调用的API端点
    pub api: String,
    /// 错误描述
    pub msg: String,
}

/// Usage记录
/// 用于记录和上报单次请求的Token使用情况
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    /// 请求ID（用于去重）
    pub request_id: String,
    /// 请求的模型名称
    pub model: String,
    /// 调用的API端点
    pub api: String,
    /// 输入Token数
    pub input_tokens: i32,
    /// 输出Token数
    pub output_tokens: i32,
    /// 记录时间
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// 上报事件
/// 批量上报队列中的一条事件，Usage和错误共用同一条通道
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TelemetryEvent {
    /// Token使用记录
    Usage(UsageRecord),
    /// 错误事件
    Error(ErrorEvent),
}

/// 客户端可见的错误信息
/// 序列化为 {"error": {...}} 信封中的内层对象
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// 错误描述
    pub message: String,
    /// 错误类型（如 "invalid_request_error", "upstream_error"）
    #[serde(rename = "type")]
    pub error_type: String,
    /// 可选的错误代码（如 "empty_response"）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// 错误信封
/// 客户端错误响应的顶层结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorEnvelope {
    pub error: ApiError,
}

impl ApiErrorEnvelope {
    pub fn new(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            error: ApiError {
                message: message.into(),
                error_type: error_type.into(),
                code: None,
            },
        }
    }

    pub fn with_code(
        message: impl Into<String>,
        error_type: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            error: ApiError {
                message: message.into(),
                error_type: error_type.into(),
                code: Some(code.into()),
            },
        }
    }
}
