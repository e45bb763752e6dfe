use crate::models::UpstreamRoute;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 缓存条目结构
///
/// 存储特定模型的上游路由列表及过期时间
#[derive(Clone)]
struct CacheEntry {
    /// 可用的上游路由列表
    /// 包含多个供应商的API端点，支持故障转移
    routes: Vec<UpstreamRoute>,

    /// 软过期时间点（滑动TTL）
    /// 每次命中时会刷新，但不超过硬过期时间
    expires_at: Instant,

    /// 硬过期时间点（最大生存时间）
    /// 无论访问频率如何，到达此时间后强制失效
    hard_expires_at: Instant,
}

/// 路由缓存管理器
///
/// 使用DashMap实现线程安全的并发缓存，
/// 支持自动过期清理和故障节点移除
///
/// 缓存策略：
/// - 滑动TTL：高频访问时自动续期
/// - 硬过期：最大生存时间到达后强制失效
#[derive(Clone)]
pub struct RouteCache {
    /// Key: 模型名称
    /// Value: 缓存条目(路由列表+过期时间)
    storage: Arc<DashMap<String, CacheEntry>>,

    /// 缓存生存时间(TTL) - 滑动过期
    ttl: Duration,

    /// 缓存最大生存时间 - 硬过期
    max_lifetime: Duration,
}

impl RouteCache {
    /// 创建新的缓存实例
    ///
    /// # 参数
    /// * `ttl` - 缓存条目的滑动生存时间（每次命中时刷新）
    /// * `max_lifetime` - 缓存条目的最大生存时间（硬过期）
    pub fn new(ttl: Duration, max_lifetime: Duration) -> Self {
        Self {
            storage: Arc::new(DashMap::new()),
            ttl,
            max_lifetime,
        }
    }

    /// 获取缓存的上游路由
    ///
    /// # 返回
    /// * `Some(Vec<UpstreamRoute>)` - 有效的缓存路由列表
    /// * `None` - 缓存未命中或已过期
    ///
    /// # 行为
    /// - 检查硬过期和软过期，任一过期则删除条目
    /// - 如果未过期，自动刷新软过期时间（滑动续期）
    /// - 返回的是路由列表的克隆，避免并发修改问题
    pub async fn get(&self, model: &str) -> Option<Vec<UpstreamRoute>> {
        let now = Instant::now();
        let mut need_remove = false;

        // 第一阶段：检查过期（只读锁）
        if let Some(entry) = self.storage.get(model) {
            if now >= entry.hard_expires_at || now >= entry.expires_at {
                need_remove = true;
            }
        }

        // 第二阶段：删除过期条目
        if need_remove {
            self.storage.remove(model);
            return None;
        }

        // 第三阶段：刷新软过期时间并返回（写锁）
        if let Some(mut entry) = self.storage.get_mut(model) {
            // 滑动续期：刷新软过期时间，但不超过硬过期时间
            entry.expires_at = (now + self.ttl).min(entry.hard_expires_at);

            let routes = entry.routes.clone();
            drop(entry);

            return Some(routes);
        }

        None
    }

    /// 设置缓存的上游路由
    ///
    /// # 行为
    /// - 如果键已存在，会覆盖原有值
    /// - 软过期时间 = min(now + ttl, now + max_lifetime)
    /// - 硬过期时间 = now + max_lifetime
    pub async fn set(&self, model: &str, routes: Vec<UpstreamRoute>) {
        let now = Instant::now();

        let entry = CacheEntry {
            routes,
            hard_expires_at: now + self.max_lifetime,
            expires_at: (now + self.ttl).min(now + self.max_lifetime),
        };

        self.storage.insert(model.to_string(), entry);
    }

    /// 从缓存中移除失败的上游路由
    ///
    /// 当某个路由请求失败时，将其从缓存中移除，
    /// 避免后续请求继续使用失败的端点
    ///
    /// # 行为
    /// - 只移除匹配的特定路由(token和api_endpoint都相同)
    /// - 如果移除后路由列表为空，则删除整个缓存条目
    pub async fn remove_route(&self, model: &str, failed_route: &UpstreamRoute) {
        let mut should_remove_entry = false;

        if let Some(mut entry) = self.storage.get_mut(model) {
            entry.routes.retain(|r| {
                r.token != failed_route.token || r.api_endpoint != failed_route.api_endpoint
            });

            // DashMap 的 RefMut 在作用域结束前会持有写锁。
            // 记录需要删除的状态，先释放锁再执行 remove，避免死锁。
            if entry.routes.is_empty() {
                should_remove_entry = true;
            }
        }

        if should_remove_entry {
            self.storage.remove(model);
        }
    }

    /// 清空所有缓存
    pub async fn clear(&self) {
        self.storage.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(token: &str, api: &str) -> UpstreamRoute {
        UpstreamRoute {
            token: token.to_string(),
            model: "gpt-3.5-turbo".to_string(),
            api_endpoint: api.to_string(),
        }
    }

    #[tokio::test]
    async fn get_returns_cached_routes_before_expiry() {
        let cache = RouteCache::new(Duration::from_secs(60), Duration::from_secs(3600));
        cache.set("gpt-4", vec![route("sk-1", "https://a.example")]).await;

        let routes = cache.get("gpt-4").await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].api_endpoint, "https://a.example");
    }

    #[tokio::test]
    async fn expired_entry_is_removed() {
        let cache = RouteCache::new(Duration::from_millis(10), Duration::from_secs(3600));
        cache.set("gpt-4", vec![route("sk-1", "https://a.example")]).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("gpt-4").await.is_none());
    }

    #[tokio::test]
    async fn remove_route_drops_entry_when_empty() {
        let cache = RouteCache::new(Duration::from_secs(60), Duration::from_secs(3600));
        let r = route("sk-1", "https://a.example");
        cache.set("gpt-4", vec![r.clone()]).await;

        cache.remove_route("gpt-4", &r).await;
        assert!(cache.get("gpt-4").await.is_none());
    }

    #[tokio::test]
    async fn remove_route_keeps_remaining_routes() {
        let cache = RouteCache::new(Duration::from_secs(60), Duration::from_secs(3600));
        let failed = route("sk-1", "https://a.example");
        let healthy = route("sk-2", "https://b.example");
        cache.set("gpt-4", vec![failed.clone(), healthy]).await;

        cache.remove_route("gpt-4", &failed).await;
        let routes = cache.get("gpt-4").await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].api_endpoint, "https://b.example");
    }
}
