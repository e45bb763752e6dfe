use crate::error::{Error, Result};
use crate::models::ApiErrorEnvelope;
use crate::protocol::adapter;
use crate::protocol::chat::{ChatResponse, ChatStreamChunk};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{error, warn};

const SSE_DATA_PREFIX: &str = "data: ";
const SSE_DONE_MARKER: &str = "[DONE]";

/// 响应写入端的能力集合
/// 转发管线只通过这个trait向客户端写出字节
#[async_trait]
pub trait ResponseSink: Send {
    /// 写出一段字节
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// 设置响应状态码
    fn write_status(&mut self, status: u16);

    /// 将已写出的字节立即推送给客户端
    async fn flush(&mut self) -> Result<()>;
}

/// 缓冲写入端
/// 非流式路径的真实落点：积累完整响应体，由endpoint一次性构建HTTP响应
#[derive(Default)]
pub struct BufferSink {
    buffer: Vec<u8>,
    status: Option<u16>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取出捕获的状态码和响应体
    pub fn into_parts(self) -> (Option<u16>, Vec<u8>) {
        (self.status, self.buffer)
    }
}

#[async_trait]
impl ResponseSink for BufferSink {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    fn write_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// 通道写入端
/// 流式路径的真实落点：每次写出即推入响应体通道，由axum侧转成body流
pub struct ChannelSink {
    tx: mpsc::Sender<Result<Bytes>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Result<Bytes>>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ResponseSink for ChannelSink {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.tx
            .send(Ok(Bytes::copy_from_slice(data)))
            .await
            .map_err(|_| Error::Relay("client disconnected".to_string()))
    }

    fn write_status(&mut self, _status: u16) {
        // 流式响应的状态码在响应建立时已经确定
    }

    async fn flush(&mut self) -> Result<()> {
        // 通道投递即推送，无额外缓冲
        Ok(())
    }
}

/// 响应改写器
///
/// 包装真实写入端，把下游Chat Completions输出改写为Responses格式。
/// 模式在构造时固定：单次HTTP交互要么整体转换，要么逐事件转换，
/// 绝不中途切换。
pub struct ResponseRewriter<S: ResponseSink> {
    inner: S,
    is_stream: bool,
    buffer: Vec<u8>,
    status: Option<u16>,
}

impl<S: ResponseSink> ResponseRewriter<S> {
    /// 非流式模式：缓冲全部写入，finalize时整体转换
    pub fn buffered(inner: S) -> Self {
        Self {
            inner,
            is_stream: false,
            buffer: Vec::with_capacity(4096),
            status: None,
        }
    }

    /// 流式模式：逐chunk按行转换并立即转发
    pub fn streaming(inner: S) -> Self {
        Self {
            inner,
            is_stream: true,
            buffer: Vec::new(),
            status: None,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// 非流式收尾：解析缓冲的完整下游响应并整体改写
    ///
    /// 失败策略：
    /// - 解析失败 -> 原样透传（保留错误响应体和非JSON响应体）
    /// - 零choices -> 上游故障，写出502错误信封
    /// - 转换后序列化失败 -> 原样透传
    /// 流式改写器上调用是空操作。
    pub async fn finalize(&mut self) -> Result<()> {
        if self.is_stream || self.buffer.is_empty() {
            return Ok(());
        }

        let chat_resp: ChatResponse = match serde_json::from_slice(&self.buffer) {
            Ok(resp) => resp,
            Err(e) => {
                warn!(
                    "failed to parse chat response for conversion, passing through: {}",
                    e
                );
                return self.passthrough().await;
            }
        };

        // 零choices按上游故障处理，绝不转发为空的成功响应
        if chat_resp.choices.is_empty() {
            warn!("chat response has no choices, returning upstream error");
            let envelope = ApiErrorEnvelope::with_code(
                "upstream provider returned empty response",
                "upstream_error",
                "empty_response",
            );
            self.inner.write_status(502);
            let data = serde_json::to_vec(&envelope)?;
            self.inner.write(&data).await?;
            return self.inner.flush().await;
        }

        let converted = adapter::chat_to_responses(&chat_resp);
        let data = match serde_json::to_vec(&converted) {
            Ok(data) => data,
            Err(e) => {
                error!("failed to marshal converted response: {}", e);
                return self.passthrough().await;
            }
        };

        if let Some(status) = self.status {
            self.inner.write_status(status);
        }
        self.inner.write(&data).await?;
        self.inner.flush().await
    }

    /// 原样转发缓冲的下游字节，保留捕获的状态码
    async fn passthrough(&mut self) -> Result<()> {
        if let Some(status) = self.status {
            self.inner.write_status(status);
        }
        let data = std::mem::take(&mut self.buffer);
        self.inner.write(&data).await?;
        self.inner.flush().await
    }

    /// 按行转换一个SSE chunk
    ///
    /// 每行独立处理：
    /// - 非data行（保活、空行分隔符、注释）原样保留
    /// - [DONE]结束标记原样保留，客户端靠它关闭流
    /// - 可解析的事件载荷转换为Responses流式事件
    /// - 解析或序列化失败的行原样保留，单行失败不中止整个流
    fn convert_stream_chunk(data: &[u8]) -> Vec<u8> {
        let text = String::from_utf8_lossy(data);
        let mut converted_lines: Vec<String> = Vec::new();

        for line in text.split('\n') {
            if let Some(payload) = line.strip_prefix(SSE_DATA_PREFIX) {
                let payload = payload.trim();

                if payload == SSE_DONE_MARKER {
                    converted_lines.push(format!("{}{}", SSE_DATA_PREFIX, SSE_DONE_MARKER));
                    continue;
                }

                let chunk: ChatStreamChunk = match serde_json::from_str(payload) {
                    Ok(chunk) => chunk,
                    Err(_) => {
                        converted_lines.push(line.to_string());
                        continue;
                    }
                };

                let event = adapter::chat_stream_to_responses_stream(&chunk);
                match serde_json::to_string(&event) {
                    Ok(json) => converted_lines.push(format!("{}{}", SSE_DATA_PREFIX, json)),
                    Err(_) => converted_lines.push(line.to_string()),
                }
            } else {
                converted_lines.push(line.to_string());
            }
        }

        converted_lines.join("\n").into_bytes()
    }
}

#[async_trait]
impl<S: ResponseSink> ResponseSink for ResponseRewriter<S> {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.is_stream {
            // 非流式：全部缓冲，等待finalize统一转换，不触碰真实写入端
            self.buffer.extend_from_slice(data);
            return Ok(());
        }

        // 流式：整chunk转换后作为一次写出转发，保持chunk级的推送节奏
        let converted = Self::convert_stream_chunk(data);
        self.inner.write(&converted).await
    }

    fn write_status(&mut self, status: u16) {
        self.status = Some(status);
        // 非流式在finalize之前不向真实写入端写状态码
        if self.is_stream {
            self.inner.write_status(status);
        }
    }

    async fn flush(&mut self) -> Result<()> {
        // 流式正确性依赖立即推送，刷新信号必须传递
        self.inner.flush().await
    }
}
