use crate::config::TelemetryConfig;
use crate::error::{Error, Result};
use crate::models::{ErrorEvent, TelemetryEvent, UsageRecord};
use reqwest::Client;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, warn};

/// 遥测模块
///
/// 批量上报Usage记录和错误事件，避免流式请求产生的高频
/// 单条上报压垮控制面：
/// - 事件先进有界队列，后台任务按批次大小或定时间隔刷写
/// - 队列满时退化为立即单条上报，尽力不丢事件
/// - 关停时排空队列并刷写剩余事件
pub struct TelemetryModule {
    tx: Mutex<Option<mpsc::Sender<TelemetryEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    client: Client,
    batch_url: String,
}

impl TelemetryModule {
    pub fn new(base_url: String, config: TelemetryConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(Error::Http)?;

        let batch_url = format!("{}/v1/telemetry/batch", base_url);
        let (tx, rx) = mpsc::channel(config.queue_size);

        let worker = tokio::spawn(flush_loop(
            rx,
            client.clone(),
            batch_url.clone(),
            config.batch_size,
            config.flush_interval,
        ));

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            client,
            batch_url,
        })
    }

    /// 尽力入队；队列满时退化为立即单条上报
    fn record(&self, event: TelemetryEvent) {
        let sender = match self.tx.lock() {
            Ok(guard) => guard.as_ref().cloned(),
            Err(_) => None,
        };

        let Some(sender) = sender else {
            // 已经关停，丢弃事件
            return;
        };

        match sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("telemetry queue full, falling back to immediate send");
                let client = self.client.clone();
                let url = self.batch_url.clone();
                tokio::spawn(async move {
                    let _ = client.post(&url).json(&vec![event]).send().await;
                    // 忽略上报结果，避免影响主流程
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn report_usage(&self, record: UsageRecord) {
        self.record(TelemetryEvent::Usage(record));
    }

    pub fn report_error(&self, event: ErrorEvent) {
        self.record(TelemetryEvent::Error(event));
    }

    /// 关停：关闭队列并等待后台任务刷完剩余事件
    /// 服务器停止接受连接后调用
    pub async fn shutdown(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }

        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };

        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

async fn flush_loop(
    mut rx: mpsc::Receiver<TelemetryEvent>,
    client: Client,
    batch_url: String,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut batch: Vec<TelemetryEvent> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_event = rx.recv() => match maybe_event {
                Some(event) => {
                    batch.push(event);
                    if batch.len() >= batch_size {
                        flush_batch(&client, &batch_url, &mut batch).await;
                    }
                }
                None => {
                    // 所有发送端已释放：刷完剩余事件后退出
                    flush_batch(&client, &batch_url, &mut batch).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                flush_batch(&client, &batch_url, &mut batch).await;
            }
        }
    }
}

async fn flush_batch(client: &Client, batch_url: &str, batch: &mut Vec<TelemetryEvent>) {
    if batch.is_empty() {
        return;
    }

    let events = std::mem::take(batch);
    match client.post(batch_url).json(&events).send().await {
        Ok(_) => debug!("flushed {} telemetry events", events.len()),
        Err(e) => warn!("failed to flush telemetry batch: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn usage(request_id: &str) -> UsageRecord {
        UsageRecord {
            request_id: request_id.to_string(),
            model: "gpt-3.5-turbo".to_string(),
            api: "https://up.example".to_string(),
            input_tokens: 10,
            output_tokens: 8,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_events() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/telemetry/batch"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let module = TelemetryModule::new(
            server.uri(),
            TelemetryConfig {
                queue_size: 16,
                batch_size: 100,
                flush_interval: Duration::from_secs(3600),
            },
        )
        .unwrap();

        module.report_usage(usage("req-1"));
        module.report_error(ErrorEvent {
            model: "gpt-3.5-turbo".to_string(),
            api: "https://up.example".to_string(),
            msg: "boom".to_string(),
        });

        // 批次未满、定时器未到：只有关停排空才会触发这次刷写
        module.shutdown().await;
    }

    #[tokio::test]
    async fn full_batch_flushes_without_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/telemetry/batch"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1..)
            .mount(&server)
            .await;

        let module = TelemetryModule::new(
            server.uri(),
            TelemetryConfig {
                queue_size: 16,
                batch_size: 2,
                flush_interval: Duration::from_secs(3600),
            },
        )
        .unwrap();

        module.report_usage(usage("req-1"));
        module.report_usage(usage("req-2"));

        module.shutdown().await;
    }
}
