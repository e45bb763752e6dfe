use crate::error::Result;
use crate::models::{UpstreamRoute, UsageRecord};
use crate::telemetry::TelemetryModule;
use bytes::Bytes;
use futures::Stream;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// 流式响应的Usage收集器
///
/// 包装转换前的原始下游字节流，从SSE事件中提取token用量。
/// 与改写器不同，这里不能假设chunk边界与事件边界对齐，
/// 所以维护跨chunk的缓冲区按 \n\n 重组完整事件。
pub struct StreamUsageCollector {
    request_id: String,
    requested_model: String,
    route: UpstreamRoute,
    input_tokens: Mutex<Option<i32>>,
    output_tokens: Mutex<Option<i32>>,
    reported: AtomicBool,
    telemetry: Arc<TelemetryModule>,
    // 缓冲区用于累积跨多个chunk的SSE事件
    buffer: Mutex<String>,
}

impl StreamUsageCollector {
    pub fn new(
        request_id: String,
        requested_model: String,
        route: UpstreamRoute,
        telemetry: Arc<TelemetryModule>,
    ) -> Self {
        Self {
            request_id,
            requested_model,
            route,
            input_tokens: Mutex::new(None),
            output_tokens: Mutex::new(None),
            reported: AtomicBool::new(false),
            telemetry,
            buffer: Mutex::new(String::new()),
        }
    }

    /// 处理一个下游chunk，提取其中完整SSE事件的usage信息
    pub fn process_chunk(&self, chunk: &[u8]) {
        let chunk_str = match std::str::from_utf8(chunk) {
            Ok(s) => s,
            Err(e) => {
                debug!("usage collector: invalid UTF-8 in chunk: {}", e);
                return;
            }
        };

        let mut buffer = self.buffer.lock().unwrap();
        buffer.push_str(chunk_str);

        // 处理缓冲区中所有完整的SSE事件（以\n\n分隔）
        while let Some(event_end) = buffer.find("\n\n") {
            let event = buffer[..event_end].to_string();
            *buffer = buffer[event_end + 2..].to_string();

            self.parse_sse_event(&event);
        }

        // 缓冲区超过1MB时清空，防止畸形流撑爆内存
        if buffer.len() > 1024 * 1024 {
            debug!("usage collector: buffer too large, clearing");
            buffer.clear();
        }
    }

    /// 解析一个完整的SSE事件并提取usage
    fn parse_sse_event(&self, event: &str) {
        let mut data_lines: Vec<&str> = Vec::new();

        for line in event.lines() {
            if let Some(stripped) = line
                .strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
            {
                data_lines.push(stripped);
            }
        }

        if data_lines.is_empty() {
            return;
        }

        // SSE规范允许多行data，合并后解析
        let data = data_lines.join("\n");

        if data.trim() == "[DONE]" {
            return;
        }

        match serde_json::from_str::<serde_json::Value>(&data) {
            Ok(json) => self.extract_usage(&json),
            Err(e) => debug!("usage collector: failed to parse event JSON: {}", e),
        }
    }

    /// 从事件JSON中提取token计数
    /// 下游是规范化的chat completions流，usage通常出现在最后一个chunk
    fn extract_usage(&self, json: &serde_json::Value) {
        let Some(usage) = json.get("usage") else {
            return;
        };
        if usage.is_null() {
            return;
        }

        // 兼容两种字段名: prompt_tokens/completion_tokens 和 input_tokens/output_tokens
        if let Some(input) = usage
            .get("prompt_tokens")
            .or_else(|| usage.get("input_tokens"))
            .and_then(|v| v.as_i64())
        {
            *self.input_tokens.lock().unwrap() = Some(input as i32);
        }

        if let Some(output) = usage
            .get("completion_tokens")
            .or_else(|| usage.get("output_tokens"))
            .and_then(|v| v.as_i64())
        {
            *self.output_tokens.lock().unwrap() = Some(output as i32);
            // usage chunk意味着流接近结束，尽早上报
            self.report();
        }
    }

    /// 上报usage，输入输出都收集到才发送，且只发送一次
    pub fn report(&self) {
        let input = *self.input_tokens.lock().unwrap();
        let output = *self.output_tokens.lock().unwrap();

        let (Some(input_tokens), Some(output_tokens)) = (input, output) else {
            debug!(
                "usage collector: cannot report yet (input={:?}, output={:?})",
                input, output
            );
            return;
        };

        if self.reported.swap(true, Ordering::SeqCst) {
            return;
        }

        self.telemetry.report_usage(UsageRecord {
            request_id: self.request_id.clone(),
            model: self.requested_model.clone(),
            api: self.route.api_endpoint.clone(),
            input_tokens,
            output_tokens,
            recorded_at: chrono::Utc::now(),
        });
    }

    /// 包装字节流，在每个chunk上收集usage信息
    /// chunk本身原样向下游传递，收集器只旁路观察
    pub async fn wrap_stream<S>(
        self: Arc<Self>,
        mut stream: S,
    ) -> impl Stream<Item = Result<Bytes>>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        async_stream::stream! {
            while let Some(chunk_result) = stream.next().await {
                match chunk_result {
                    Ok(chunk) => {
                        self.process_chunk(&chunk);
                        yield Ok(chunk);
                    }
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }

            // 流结束，确保上报usage（如果还没上报的话）
            self.report();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryConfig;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn route() -> UpstreamRoute {
        UpstreamRoute {
            token: "sk-up".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            api_endpoint: "https://up.example".to_string(),
        }
    }

    #[tokio::test]
    async fn collects_usage_from_event_split_across_chunks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/telemetry/batch"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let telemetry = Arc::new(
            TelemetryModule::new(
                server.uri(),
                TelemetryConfig {
                    queue_size: 16,
                    batch_size: 100,
                    flush_interval: Duration::from_secs(3600),
                },
            )
            .unwrap(),
        );

        let collector = Arc::new(StreamUsageCollector::new(
            "req-1".to_string(),
            "gpt-3.5-turbo".to_string(),
            route(),
            telemetry.clone(),
        ));

        // usage事件被拆在两个chunk里，必须靠缓冲区重组
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(
                b"data: {\"id\":\"c1\",\"choices\":[],\"usage\":{\"prompt_tokens\":10,",
            )),
            Ok(Bytes::from_static(
                b"\"completion_tokens\":8,\"total_tokens\":18}}\n\ndata: [DONE]\n\n",
            )),
        ];

        let wrapped = collector
            .wrap_stream(futures::stream::iter(chunks))
            .await;
        let forwarded: Vec<_> = wrapped.collect().await;

        // chunk原样透出
        assert_eq!(forwarded.len(), 2);
        assert!(forwarded.iter().all(|c| c.is_ok()));

        // 关停排空队列，wiremock在drop时校验恰好一次批量上报
        telemetry.shutdown().await;
    }

    #[tokio::test]
    async fn incomplete_usage_is_not_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/telemetry/batch"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let telemetry = Arc::new(
            TelemetryModule::new(
                server.uri(),
                TelemetryConfig {
                    queue_size: 16,
                    batch_size: 100,
                    flush_interval: Duration::from_secs(3600),
                },
            )
            .unwrap(),
        );

        let collector = Arc::new(StreamUsageCollector::new(
            "req-2".to_string(),
            "gpt-3.5-turbo".to_string(),
            route(),
            telemetry.clone(),
        ));

        let chunks: Vec<Result<Bytes>> = vec![Ok(Bytes::from_static(
            b"data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n",
        ))];

        let wrapped = collector
            .wrap_stream(futures::stream::iter(chunks))
            .await;
        let _: Vec<_> = wrapped.collect().await;

        telemetry.shutdown().await;
    }
}
