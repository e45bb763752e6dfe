use crate::config::UpstreamConfig;
use crate::error::{Error, Result};
use crate::models::UpstreamRoute;
use crate::rewriter::ResponseSink;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, Response,
};
use std::pin::Pin;
use tracing::{error, info};

/// 上游Chat Completions转发器
///
/// 唯一与上游对话的组件，向给定的写入端驱动零次或多次写出/刷新，
/// 与直接写真实HTTP响应的行为一致。
pub struct UpstreamRelay {
    client: Client,
    // Dedicated client for streaming (no global timeout)
    streaming_client: Client,
}

impl UpstreamRelay {
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        // Standard client: obeys configured request timeout
        let client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_connections)
            .pool_idle_timeout(std::time::Duration::from_secs(60))
            .tcp_keepalive(if config.keep_alive {
                Some(std::time::Duration::from_secs(30))
            } else {
                None
            })
            .build()
            .map_err(Error::Http)?;

        // Streaming client: no global request timeout to allow long-lived SSE
        let streaming_client = Client::builder()
            .pool_max_idle_per_host(config.max_connections)
            .pool_idle_timeout(std::time::Duration::from_secs(60))
            .tcp_keepalive(if config.keep_alive {
                Some(std::time::Duration::from_secs(30))
            } else {
                None
            })
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            client,
            streaming_client,
        })
    }

    /// 拼接chat completions路径，处理endpoint自带 /v1 前缀的情况
    fn chat_completions_url(route: &UpstreamRoute) -> String {
        let base_url = route.api_endpoint.trim_end_matches('/');
        let api_path = if base_url.ends_with("/v1") {
            "/chat/completions"
        } else {
            "/v1/chat/completions"
        };
        format!("{}{}", base_url, api_path)
    }

    fn build_headers(route: &UpstreamRoute) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        headers.insert(
            HeaderName::from_static("authorization"),
            HeaderValue::from_str(&format!("Bearer {}", route.token))
                .map_err(|_| Error::Relay("Invalid token format".into()))?,
        );
        headers.insert(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("application/json"),
        );

        Ok(headers)
    }

    async fn send_request(
        &self,
        client: &Client,
        route: &UpstreamRoute,
        request_body: Bytes,
    ) -> Result<Response> {
        let url = Self::chat_completions_url(route);
        let headers = Self::build_headers(route)?;

        let response = client
            .post(&url)
            .headers(headers)
            .body(request_body)
            .send()
            .await
            .map_err(|e| {
                error!("HTTP client connection failed: {:?}", e);
                Error::Http(e)
            })?;

        Ok(response)
    }

    /// 非流式转发：返回上游状态码和完整响应体
    ///
    /// 上游的错误状态不在这里拦截：响应体原样交给改写器，
    /// 由它的透传策略决定客户端看到什么。只有传输层失败
    /// （此时尚无任何响应字节）才返回错误，调用方可安全故障转移。
    pub async fn forward(
        &self,
        route: &UpstreamRoute,
        request_body: Bytes,
    ) -> Result<(u16, Bytes)> {
        info!("forward: start -> {}", route.api_endpoint);

        let response = self.send_request(&self.client, route, request_body).await?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(Error::Http)?;

        info!("forward: upstream responded (status {})", status);
        Ok((status, body))
    }

    /// 流式转发：建立SSE连接并返回纯粹的字节流
    ///
    /// 建立阶段的失败（包括非2xx状态）返回错误。此时还没有
    /// 任何字节写向客户端，调用方可以安全地尝试下一条路由。
    pub async fn open_stream(
        &self,
        route: &UpstreamRoute,
        request_body: Bytes,
    ) -> Result<(u16, Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>)> {
        info!("open_stream: start -> {}", route.api_endpoint);

        let response = self
            .send_request(&self.streaming_client, route, request_body)
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .bytes()
                .await
                .unwrap_or_else(|_| Bytes::from("Failed to read error response"));

            error!(
                "Upstream stream error response (status {}): {}",
                status,
                String::from_utf8_lossy(&body)
            );

            return Err(Error::Relay(format!(
                "Upstream returned error status {}: {}",
                status,
                String::from_utf8_lossy(&body)
            )));
        }

        info!("open_stream: established (status {})", status);
        let stream = response.bytes_stream().map(|chunk| chunk.map_err(Error::Http));
        Ok((status.as_u16(), Box::pin(stream)))
    }

    /// 把上游字节流逐chunk写入给定的写入端
    /// 每个chunk写出后立即刷新，保证增量推送节奏
    pub async fn copy_to_sink<St>(
        &self,
        mut stream: St,
        sink: &mut (dyn ResponseSink + Send),
    ) -> Result<()>
    where
        St: Stream<Item = Result<Bytes>> + Unpin,
    {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            sink.write(&chunk).await?;
            sink.flush().await?;
        }
        Ok(())
    }

    pub fn is_client_error(&self, error: &Error) -> bool {
        match error {
            Error::Relay(msg) => {
                // 4xx错误，客户端错误，不应故障转移到其他路由
                msg.contains("400")
                    || msg.contains("401")
                    || msg.contains("403")
                    || msg.contains("404")
                    || msg.contains("422")
                    || msg.contains("429")
            }
            _ => false,
        }
    }
}
