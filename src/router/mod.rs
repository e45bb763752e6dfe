use crate::cache::RouteCache;
use crate::config::ControlPlaneConfig;
use crate::error::{Error, Result};
use crate::models::{RouteRequest, RouteResponse, UpstreamRoute};
use reqwest::Client;
use std::sync::Arc;
use tracing::error;

/// 路由解析器
/// 模型名到上游路由列表的映射，控制面API为数据源，本地缓存兜底
pub struct Router {
    cache: Arc<RouteCache>,
    client: Client,
    control_plane: ControlPlaneConfig,
}

impl Router {
    pub fn new(cache: Arc<RouteCache>, control_plane: ControlPlaneConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(control_plane.timeout)
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            cache,
            client,
            control_plane,
        })
    }

    pub async fn resolve_route(&self, requested_model: &str) -> Result<Vec<UpstreamRoute>> {
        // 1. 先查缓存
        if let Some(routes) = self.cache.get(requested_model).await {
            if !routes.is_empty() {
                return Ok(routes);
            }
        }

        // 2. 缓存未命中，调用控制面API
        let routes = self.fetch_from_control_plane(requested_model).await?;

        // 3. 更新缓存
        if !routes.is_empty() {
            self.cache.set(requested_model, routes.clone()).await;
        }

        Ok(routes)
    }

    async fn fetch_from_control_plane(&self, requested_model: &str) -> Result<Vec<UpstreamRoute>> {
        let url = format!("{}/v1/route/resolve", self.control_plane.base_url);

        let request = RouteRequest {
            model: requested_model.to_string(),
        };

        let mut retry_count = 0;
        let max_retries = self.control_plane.retry_attempts;

        loop {
            let response = self.client.post(&url).json(&request).send().await;

            match response {
                Ok(resp) => {
                    if resp.status().is_success() {
                        let route_response: RouteResponse =
                            resp.json().await.map_err(Error::Http)?;

                        if route_response.success {
                            return Ok(route_response.data);
                        } else {
                            return Err(Error::Routing(format!(
                                "Control plane returned error: {}",
                                route_response.message
                            )));
                        }
                    } else if resp.status().is_server_error() && retry_count < max_retries {
                        retry_count += 1;
                        tokio::time::sleep(tokio::time::Duration::from_millis(
                            100 * retry_count as u64,
                        ))
                        .await;
                        continue;
                    } else {
                        return Err(Error::Routing(format!(
                            "Control plane returned status: {}",
                            resp.status()
                        )));
                    }
                }
                Err(e) if retry_count < max_retries => {
                    retry_count += 1;
                    error!(
                        "Error calling control plane: {}. Retrying {}/{}",
                        e, retry_count, max_retries
                    );
                    tokio::time::sleep(tokio::time::Duration::from_millis(
                        100 * retry_count as u64,
                    ))
                    .await;
                    continue;
                }
                Err(e) => {
                    return Err(Error::Http(e));
                }
            }
        }
    }

    pub async fn remove_failed_route(&self, requested_model: &str, failed_route: &UpstreamRoute) {
        self.cache.remove_route(requested_model, failed_route).await;
    }
}
