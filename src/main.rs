use responses_gateway_engine::{
    cache::RouteCache,
    config::Config,
    error::Error,
    models::{ApiErrorEnvelope, ErrorEvent, UpstreamRoute},
    protocol::adapter,
    protocol::responses::ResponsesRequest,
    relay::UpstreamRelay,
    rewriter::{BufferSink, ChannelSink, ResponseRewriter, ResponseSink},
    router::Router,
    telemetry::TelemetryModule,
    usage_collector::StreamUsageCollector,
    Result,
};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{Request, Response, StatusCode},
    routing::{get, post},
    Router as AxumRouter,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    router: Arc<Router>,
    relay: Arc<UpstreamRelay>,
    telemetry: Arc<TelemetryModule>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志，支持通过环境变量配置，默认info级别
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Responses Gateway Engine...");

    // 加载配置
    let config = Config::from_file("config.yaml").unwrap_or_else(|_| {
        info!("Failed to load config.yaml, using default config");
        Config::default()
    });

    // 初始化各模块
    let cache = Arc::new(RouteCache::new(config.cache.ttl, config.cache.max_lifetime));
    let router = Arc::new(Router::new(cache.clone(), config.control_plane.clone())?);
    let relay = Arc::new(UpstreamRelay::new(config.upstream.clone())?);
    let telemetry = Arc::new(TelemetryModule::new(
        config.control_plane.base_url.clone(),
        config.telemetry.clone(),
    )?);

    let state = AppState {
        router,
        relay,
        telemetry: telemetry.clone(),
    };

    // 创建路由
    let app = AxumRouter::new()
        .route("/health", get(health))
        .route("/v1/responses", post(handle_responses))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                // 过滤掉健康检查的日志
                if request.uri().path() == "/health" {
                    tracing::trace_span!("health_check")
                } else {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                        version = ?request.version(),
                    )
                }
            }),
        )
        .with_state(state);

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    // 服务器停止接受连接后排空遥测队列
    telemetry.shutdown().await;
    info!("Telemetry drained, bye");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received, draining...");
}

async fn health() -> Response<Body> {
    let body = serde_json::json!({
        "status": "healthy"
    })
    .to_string();
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

async fn handle_responses(State(state): State<AppState>, req: Request<Body>) -> Response<Body> {
    // 读取请求体
    let body_bytes = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to read request body: {}", e);
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "Invalid request body",
            );
        }
    };

    // 解析客户端的Responses请求
    let responses_req: ResponsesRequest = match serde_json::from_slice(&body_bytes) {
        Ok(req) => req,
        Err(e) => {
            error!("Failed to parse responses request: {}", e);
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                &format!("failed to parse request: {}", e),
            );
        }
    };

    info!(
        "Responses request - model: {}, stream: {}, has_input: {}, has_messages: {}",
        responses_req.model,
        responses_req.stream,
        responses_req.input.is_some(),
        !responses_req.messages.is_empty()
    );

    // 翻译为规范化的下游请求
    let chat_req = match adapter::translate_request(&responses_req) {
        Ok(req) => req,
        Err(Error::InvalidRequest(msg)) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request_error", &msg);
        }
        Err(e) => {
            error!("Failed to translate request: {}", e);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "failed to translate request",
            );
        }
    };

    // 序列化canonical请求体替换原始载荷，下游管线只认chat completions格式
    let canonical_body = match serde_json::to_vec(&chat_req) {
        Ok(body) => Bytes::from(body),
        Err(e) => {
            error!("Failed to marshal chat request: {}", e);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "failed to build canonical request",
            );
        }
    };

    debug!("Canonical request body length: {} bytes", canonical_body.len());

    // 获取路由配置
    let routes = match state.router.resolve_route(&chat_req.model).await {
        Ok(routes) if !routes.is_empty() => routes,
        Ok(_) => {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "gateway_error",
                "No available routes",
            );
        }
        Err(e) => {
            error!("Failed to resolve route: {}", e);
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "gateway_error",
                "No available routes",
            );
        }
    };

    // 生成请求ID用于去重
    let request_id = Uuid::new_v4().to_string();

    info!(
        "Request routing - stream: {}, model: {}, routes: {}",
        chat_req.stream,
        chat_req.model,
        routes.len()
    );

    if chat_req.stream {
        handle_stream(state, routes, canonical_body, chat_req.model, request_id).await
    } else {
        handle_non_stream(state, routes, canonical_body, chat_req.model, request_id).await
    }
}

// 处理非流式请求
// 非流式路径会等待上游请求完整完成：
// 1) 转发请求 -> 2) 改写器缓冲完整响应体 -> 3) finalize整体转换 -> 4) 一次性返回给客户端。
async fn handle_non_stream(
    state: AppState,
    routes: Vec<UpstreamRoute>,
    canonical_body: Bytes,
    requested_model: String,
    request_id: String,
) -> Response<Body> {
    for route in routes {
        match state.relay.forward(&route, canonical_body.clone()).await {
            Ok((status, response_body)) => {
                // 立即提取并上报usage信息（无论后续转换是否成功）
                if let Some((input_tokens, output_tokens)) =
                    extract_usage_from_response(&response_body)
                {
                    state.telemetry.report_usage(
                        responses_gateway_engine::models::UsageRecord {
                            request_id: request_id.clone(),
                            model: requested_model.clone(),
                            api: route.api_endpoint.clone(),
                            input_tokens,
                            output_tokens,
                            recorded_at: chrono::Utc::now(),
                        },
                    );
                }

                // 空响应体按上游故障处理，不产生空的成功响应
                if response_body.is_empty() {
                    error!(
                        "Empty response body from upstream: endpoint={}, model={}",
                        route.api_endpoint, route.model
                    );
                    return bad_gateway_empty_response();
                }

                // 改写器替换真实写入端：先缓冲，finalize时整体转换
                let mut rewriter = ResponseRewriter::buffered(BufferSink::new());
                rewriter.write_status(status);
                if rewriter.write(&response_body).await.is_err() {
                    return error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal_error",
                        "failed to buffer upstream response",
                    );
                }
                if let Err(e) = rewriter.finalize().await {
                    error!("Failed to finalize non-stream response: {}", e);
                    return error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal_error",
                        "failed to finalize response",
                    );
                }

                let (final_status, final_body) = rewriter.into_inner().into_parts();
                let status = StatusCode::from_u16(final_status.unwrap_or(200))
                    .unwrap_or(StatusCode::OK);

                return Response::builder()
                    .status(status)
                    .header("content-type", "application/json")
                    .body(Body::from(final_body))
                    .unwrap();
            }
            Err(e) => {
                error!("Request failed for {}: {}", route.api_endpoint, e);

                state.telemetry.report_error(ErrorEvent {
                    model: route.model.clone(),
                    api: route.api_endpoint.clone(),
                    msg: e.to_string(),
                });

                // 传输层失败，从缓存移除失败路由后尝试下一条
                state
                    .router
                    .remove_failed_route(&requested_model, &route)
                    .await;
                continue;
            }
        }
    }

    // 所有路由都失败
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "gateway_error",
        "All routes failed",
    )
}

// 处理流式请求
// 建立上游SSE连接成功后立即返回响应；此后由独立任务把上游字节
// 经改写器逐chunk转换推入响应体通道。
async fn handle_stream(
    state: AppState,
    routes: Vec<UpstreamRoute>,
    canonical_body: Bytes,
    requested_model: String,
    request_id: String,
) -> Response<Body> {
    for route in routes {
        match state.relay.open_stream(&route, canonical_body.clone()).await {
            Ok((status, upstream_stream)) => {
                // Usage收集器挂在协议转换之前的原始流上
                let collector = Arc::new(StreamUsageCollector::new(
                    request_id.clone(),
                    requested_model.clone(),
                    route.clone(),
                    state.telemetry.clone(),
                ));
                let wrapped = collector.wrap_stream(upstream_stream).await;

                let (tx, rx) = tokio::sync::mpsc::channel(32);
                let mut rewriter = ResponseRewriter::streaming(ChannelSink::new(tx));
                rewriter.write_status(status);

                let relay = state.relay.clone();
                tokio::spawn(async move {
                    let wrapped = Box::pin(wrapped);
                    if let Err(e) = relay.copy_to_sink(wrapped, &mut rewriter).await {
                        debug!("Stream relay ended: {}", e);
                    }
                });

                let body_stream = async_stream::stream! {
                    let mut rx = rx;
                    while let Some(item) = rx.recv().await {
                        yield item;
                    }
                };

                // 设置 SSE 必要的响应头
                return Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "text/event-stream")
                    .header("cache-control", "no-cache")
                    .header("connection", "keep-alive")
                    .header("x-accel-buffering", "no") // 禁用 nginx 缓冲
                    .body(Body::from_stream(body_stream))
                    .unwrap();
            }
            Err(e) => {
                error!("Stream request failed for {}: {}", route.api_endpoint, e);

                state.telemetry.report_error(ErrorEvent {
                    model: route.model.clone(),
                    api: route.api_endpoint.clone(),
                    msg: e.to_string(),
                });

                // 客户端错误（4xx）直接返回，不再尝试其他路由
                if state.relay.is_client_error(&e) {
                    return create_error_response(&e);
                }

                state
                    .router
                    .remove_failed_route(&requested_model, &route)
                    .await;
                continue;
            }
        }
    }

    // 所有路由都失败
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "gateway_error",
        "All stream routes failed",
    )
}

// 从转换前的下游响应体中提取usage信息
fn extract_usage_from_response(body: &[u8]) -> Option<(i32, i32)> {
    let v: serde_json::Value = serde_json::from_slice(body).ok()?;
    let usage = v.get("usage")?;

    let input = usage.get("prompt_tokens")?.as_i64()? as i32;
    let output = usage.get("completion_tokens")?.as_i64()? as i32;
    Some((input, output))
}

fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response<Body> {
    let envelope = ApiErrorEnvelope::new(message, error_type);

    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::to_string(&envelope).unwrap_or_default(),
        ))
        .unwrap()
}

fn bad_gateway_empty_response() -> Response<Body> {
    let envelope = ApiErrorEnvelope::with_code(
        "upstream provider returned empty response",
        "upstream_error",
        "empty_response",
    );

    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::to_string(&envelope).unwrap_or_default(),
        ))
        .unwrap()
}

fn create_error_response(error: &Error) -> Response<Body> {
    match error {
        Error::Relay(msg) => {
            // 解析上游错误信息
            if msg.contains("400") {
                // 提取上游的错误响应体原样返回
                if let Some(start) = msg.find(": ") {
                    let upstream_error = &msg[start + 2..];
                    return Response::builder()
                        .status(StatusCode::BAD_REQUEST)
                        .header("content-type", "application/json")
                        .body(Body::from(upstream_error.to_string()))
                        .unwrap();
                }
                error_response(StatusCode::BAD_REQUEST, "upstream_error", msg)
            } else if msg.contains("401") {
                error_response(StatusCode::UNAUTHORIZED, "upstream_error", "Unauthorized")
            } else if msg.contains("403") {
                error_response(StatusCode::FORBIDDEN, "upstream_error", "Forbidden")
            } else if msg.contains("404") {
                error_response(StatusCode::NOT_FOUND, "upstream_error", "Not Found")
            } else if msg.contains("422") {
                error_response(StatusCode::UNPROCESSABLE_ENTITY, "upstream_error", msg)
            } else if msg.contains("429") {
                error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "upstream_error",
                    "Too Many Requests",
                )
            } else {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "gateway_error", msg)
            }
        }
        _ => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "gateway_error",
            &error.to_string(),
        ),
    }
}
