use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Responses网关引擎的主配置结构
/// 包含服务器、控制面、缓存、上游客户端和遥测等各个模块的配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// 服务器相关配置
    pub server: ServerConfig,
    /// 控制面API配置（路由解析与遥测上报的后端）
    pub control_plane: ControlPlaneConfig,
    /// 路由缓存配置
    pub cache: CacheConfig,
    /// 上游转发配置
    pub upstream: UpstreamConfig,
    /// 遥测批量上报配置
    pub telemetry: TelemetryConfig,
}

/// 服务器配置
/// 定义HTTP服务器的监听地址和端口
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// 服务器监听地址，例如 "0.0.0.0" 或 "127.0.0.1"
    pub host: String,
    /// 服务器监听端口，默认为8080
    pub port: u16,
}

/// 控制面API配置
/// 用于与路由/遥测后端通信的配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlPlaneConfig {
    /// 控制面API的基础URL，例如 "http://localhost:3000"
    pub base_url: String,
    /// API请求超时时间，使用humantime格式（如 "5s", "30s"）
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// 失败重试次数
    pub retry_attempts: u32,
}

/// 缓存配置
/// 路由信息的本地缓存策略
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// 缓存过期时间（TTL），使用humantime格式
    /// 滑动TTL：每次命中时刷新
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// 缓存最大生存时间（硬过期），使用humantime格式
    /// 无论访问频率，到达此时间后强制失效
    #[serde(with = "humantime_serde", default = "default_max_lifetime")]
    pub max_lifetime: Duration,
}

/// 默认的最大生存时间：24小时
fn default_max_lifetime() -> Duration {
    Duration::from_secs(24 * 3600)
}

/// 上游转发配置
/// 针对上游Chat Completions服务的HTTP客户端参数
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// 非流式请求超时时间
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// 最大并发连接数
    pub max_connections: usize,
    /// 是否启用HTTP Keep-Alive
    pub keep_alive: bool,
}

/// 遥测批量上报配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// 队列容量（事件条数）
    pub queue_size: usize,
    /// 单批次最大事件数，达到后立即刷写
    pub batch_size: usize,
    /// 定时刷写间隔，使用humantime格式
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Config {
    /// 从配置文件加载配置
    ///
    /// # 参数
    /// * `path` - 配置文件路径（支持YAML、TOML、JSON等格式）
    ///
    /// # 说明
    /// 1. 首先从指定文件加载配置
    /// 2. 然后从环境变量覆盖配置（前缀为GATEWAY，分隔符为__）
    ///    例如：GATEWAY__SERVER__PORT=8081 会覆盖 server.port
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("GATEWAY").separator("__"))
            .build()
            .map_err(|e| crate::error::Error::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| crate::error::Error::Config(e.to_string()))
    }

    /// 创建默认配置
    ///
    /// # 默认值
    /// - 服务器：监听 0.0.0.0:8080
    /// - 控制面：连接 http://localhost:3000，超时5秒，重试3次
    /// - 缓存：TTL 5分钟，硬过期24小时
    /// - 上游：超时30秒，最大500连接，启用Keep-Alive
    /// - 遥测：队列100条，单批50条，每5秒刷写
    pub fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            control_plane: ControlPlaneConfig {
                base_url: "http://localhost:3000".to_string(),
                timeout: Duration::from_secs(5),
                retry_attempts: 3,
            },
            cache: CacheConfig {
                ttl: Duration::from_secs(300),
                max_lifetime: Duration::from_secs(24 * 3600),
            },
            upstream: UpstreamConfig {
                timeout: Duration::from_secs(30),
                max_connections: 500,
                keep_alive: true,
            },
            telemetry: TelemetryConfig {
                queue_size: 100,
                batch_size: 50,
                flush_interval: Duration::from_secs(5),
            },
        }
    }
}
