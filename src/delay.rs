use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::{extract::Path, Json};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Semaphore};

use crate::app::{app_state, current_timestamp};
use crate::config::{DelayTestConfig, DelayThresholds};
use crate::engine::{EngineApi, ProxyGroup, ProxyNode};
use crate::{ApiResponse, AppEvent, RefreshReason};

/// 某个 (节点, 组) 键位的延迟记录。
/// 缓存中没有记录时读取结果是 Unset，永远不是错误。
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DelayValue {
    Unset,
    InProgress,
    Timeout,
    Measured { ms: u32 },
}

/// 延迟颜色分档，阈值来自配置。
#[derive(Serialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum DelayBucket {
    Unset,
    Low,
    Medium,
    High,
    Timeout,
}

pub fn classify(thresholds: &DelayThresholds, value: DelayValue) -> DelayBucket {
    match value {
        DelayValue::Unset | DelayValue::InProgress => DelayBucket::Unset,
        DelayValue::Timeout => DelayBucket::Timeout,
        DelayValue::Measured { ms } => {
            if ms < thresholds.favorable_ms {
                DelayBucket::Low
            } else if ms <= thresholds.acceptable_ms {
                DelayBucket::Medium
            } else {
                DelayBucket::High
            }
        }
    }
}

pub fn format_delay(value: DelayValue) -> String {
    match value {
        DelayValue::Unset => String::new(),
        DelayValue::InProgress => "...".to_string(),
        DelayValue::Timeout => "Timeout".to_string(),
        DelayValue::Measured { ms } => format!("{ms}ms"),
    }
}

pub type WatchCallback = Box<dyn Fn(DelayValue) + Send + Sync>;

struct WatchEntry {
    token: u64,
    callback: WatchCallback,
}

/// watch() 返回的订阅句柄。持有者在对应展示单元卸载时必须调用 dispose，
/// 否则探测完成后会通知到一个已经不存在的观察者。
pub struct WatchHandle {
    proxy: String,
    group: String,
    token: u64,
}

/// 单次测速的参数覆盖；None 回落到配置默认值。
#[derive(Default, Clone)]
pub struct CheckOptions {
    pub url: Option<String>,
    pub timeout_ms: Option<u32>,
    pub concurrency: Option<usize>,
    /// 仅测试该列表中的节点。
    pub nodes: Option<Vec<String>>,
}

/// 延迟测试编排器：
/// - 按 (节点, 组) 键位缓存测速结果，进程生命周期内常驻、复测时覆盖；
/// - 同键位至多保留一个观察者回调，后订阅者替换先订阅者；
/// - 批量测速对逐节点探测施加并发上限，对提供者节点按提供者整体下发健康检查。
pub struct DelayManager {
    engine: Arc<dyn EngineApi>,
    events_tx: broadcast::Sender<AppEvent>,
    defaults: DelayTestConfig,
    cache: Mutex<HashMap<(String, String), DelayValue>>,
    watchers: Mutex<HashMap<(String, String), WatchEntry>>,
    /// 组级测试 URL 覆盖（例如流媒体分组使用专属探测地址）。
    group_urls: Mutex<HashMap<String, String>>,
    next_token: AtomicU64,
}

impl DelayManager {
    pub fn new(
        engine: Arc<dyn EngineApi>,
        events_tx: broadcast::Sender<AppEvent>,
        defaults: DelayTestConfig,
    ) -> Self {
        DelayManager {
            engine,
            events_tx,
            defaults,
            cache: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            group_urls: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn get(&self, proxy: &str, group: &str) -> DelayValue {
        let cache = self.cache.lock().expect("delay cache mutex poisoned");
        cache
            .get(&(proxy.to_string(), group.to_string()))
            .copied()
            .unwrap_or(DelayValue::Unset)
    }

    /// 写入缓存并通知该键位的观察者（如果有）。
    pub fn set(&self, proxy: &str, group: &str, value: DelayValue) {
        {
            let mut cache = self.cache.lock().expect("delay cache mutex poisoned");
            cache.insert((proxy.to_string(), group.to_string()), value);
        }
        self.notify(proxy, group, value);
    }

    /// 缓存优先的展示值：缓存缺失时回落到引擎侧的历史测速记录。
    pub fn effective_delay(&self, node: &ProxyNode, group: &str) -> DelayValue {
        match self.get(&node.name, group) {
            DelayValue::Unset => match node.delay {
                Some(0) => DelayValue::Timeout,
                Some(ms) => DelayValue::Measured { ms },
                None => DelayValue::Unset,
            },
            value => value,
        }
    }

    pub fn watch(&self, proxy: &str, group: &str, callback: WatchCallback) -> WatchHandle {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut watchers = self.watchers.lock().expect("watchers mutex poisoned");
        watchers.insert(
            (proxy.to_string(), group.to_string()),
            WatchEntry { token, callback },
        );
        WatchHandle {
            proxy: proxy.to_string(),
            group: group.to_string(),
            token,
        }
    }

    /// 仅当该键位仍由此句柄持有时移除订阅。
    /// 被替换的旧句柄晚到的 dispose 不会误删后来者的订阅。
    pub fn dispose(&self, handle: WatchHandle) {
        let mut watchers = self.watchers.lock().expect("watchers mutex poisoned");
        let key = (handle.proxy, handle.group);
        if let Some(entry) = watchers.get(&key) {
            if entry.token == handle.token {
                watchers.remove(&key);
            }
        }
    }

    pub fn unwatch(&self, proxy: &str, group: &str) {
        let mut watchers = self.watchers.lock().expect("watchers mutex poisoned");
        watchers.remove(&(proxy.to_string(), group.to_string()));
    }

    fn notify(&self, proxy: &str, group: &str, value: DelayValue) {
        let watchers = self.watchers.lock().expect("watchers mutex poisoned");
        if let Some(entry) = watchers.get(&(proxy.to_string(), group.to_string())) {
            (entry.callback)(value);
        }
    }

    pub fn set_group_url(&self, group: &str, url: &str) {
        let mut urls = self.group_urls.lock().expect("group urls mutex poisoned");
        urls.insert(group.to_string(), url.to_string());
    }

    pub fn group_url(&self, group: &str) -> String {
        let urls = self.group_urls.lock().expect("group urls mutex poisoned");
        urls.get(group)
            .cloned()
            .unwrap_or_else(|| self.defaults.url.clone())
    }

    /// 单节点测速：先写 InProgress，探测结束后写入最终值并返回。
    /// 探测失败（超时、传输错误、引擎上报 0）一律落为 Timeout，不向上抛错。
    pub async fn check_one(
        &self,
        proxy: &str,
        group: &str,
        url: &str,
        timeout_ms: u32,
    ) -> DelayValue {
        self.set(proxy, group, DelayValue::InProgress);

        let value = match self.engine.probe_delay(proxy, url, timeout_ms).await {
            Ok(0) => DelayValue::Timeout,
            Ok(ms) => DelayValue::Measured { ms },
            Err(err) => {
                tracing::warn!("delay probe for '{proxy}' in group '{group}' failed: {err}");
                DelayValue::Timeout
            }
        };

        self.set(proxy, group, value);
        value
    }

    /// 批量测速一个组：
    /// - 提供者节点按提供者去重，整体各下发一次健康检查；
    /// - 其余节点逐个探测，受并发上限约束，已在途的键位不重复下发；
    /// - 所有子任务结束（无论成败）后广播一次组状态刷新。
    pub async fn check_group(&self, group: &ProxyGroup, opts: &CheckOptions) {
        let url = opts
            .url
            .clone()
            .unwrap_or_else(|| self.group_url(&group.name));
        let timeout_ms = opts.timeout_ms.unwrap_or(self.defaults.timeout_ms);
        let cap = opts
            .concurrency
            .unwrap_or(self.defaults.concurrency)
            .clamp(1, 64);

        let filter: Option<HashSet<&str>> = opts
            .nodes
            .as_ref()
            .map(|ns| ns.iter().map(String::as_str).collect());

        let mut providers: Vec<String> = Vec::new();
        let mut seen_providers: HashSet<String> = HashSet::new();
        let mut plain: Vec<&str> = Vec::new();

        for member in &group.members {
            if let Some(filter) = filter.as_ref() {
                if !filter.contains(member.name.as_str()) {
                    continue;
                }
            }

            match member.provider.as_deref() {
                Some(provider) => {
                    if seen_providers.insert(provider.to_string()) {
                        providers.push(provider.to_string());
                    }
                }
                None => {
                    // 已经在途的探测不重复下发
                    if matches!(self.get(&member.name, &group.name), DelayValue::InProgress) {
                        continue;
                    }
                    plain.push(member.name.as_str());
                }
            }
        }

        let semaphore = Semaphore::new(cap);

        let provider_futs: Vec<_> = providers
            .iter()
            .map(|provider| self.run_provider_check(provider))
            .collect();
        let plain_futs: Vec<_> = plain
            .iter()
            .map(|name| self.run_bounded_check(&semaphore, name, &group.name, &url, timeout_ms))
            .collect();

        // all-settled：子任务各自消化失败，这里只等待全部结束。
        let _ = tokio::join!(join_all(provider_futs), join_all(plain_futs));

        self.broadcast_refresh(RefreshReason::GroupCheckFinished);
    }

    async fn run_provider_check(&self, provider: &str) {
        if let Err(err) = self.engine.provider_health_check(provider).await {
            tracing::warn!("provider health check for '{provider}' failed: {err}");
        }
    }

    async fn run_bounded_check(
        &self,
        semaphore: &Semaphore,
        proxy: &str,
        group: &str,
        url: &str,
        timeout_ms: u32,
    ) {
        let Ok(_permit) = semaphore.acquire().await else {
            return;
        };
        self.check_one(proxy, group, url, timeout_ms).await;
    }

    fn broadcast_refresh(&self, reason: RefreshReason) {
        let event = AppEvent::ProxiesChanged {
            reason,
            timestamp: current_timestamp(),
        };
        if let Err(err) = self.events_tx.send(event) {
            // 没有任何订阅者时 send 会失败，这属于正常情况。
            tracing::debug!("failed to broadcast AppEvent::ProxiesChanged: {err}");
        }
    }
}

#[derive(Deserialize)]
pub struct NodeDelayRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u32>,
}

#[derive(Deserialize)]
pub struct GroupDelayRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u32>,
    /// 如指定则仅测试该列表中的节点。
    #[serde(default)]
    pub nodes: Option<Vec<String>>,
}

#[derive(Serialize)]
pub struct NodeDelayResponseDto {
    pub group: String,
    pub node: String,
    pub url: String,
    pub timeout_ms: u32,
    pub delay: DelayValue,
}

#[derive(Serialize)]
pub struct GroupDelayResultDto {
    pub node: String,
    pub delay: DelayValue,
}

#[derive(Serialize)]
pub struct GroupDelayResponseDto {
    pub group: String,
    pub url: String,
    pub timeout_ms: u32,
    pub providers_checked: Vec<String>,
    pub results: Vec<GroupDelayResultDto>,
}

pub async fn test_node_delay(
    Path((group, node)): Path<(String, String)>,
    Json(body): Json<NodeDelayRequest>,
) -> Json<ApiResponse<NodeDelayResponseDto>> {
    let state = app_state();

    let snapshot = match state.engine.fetch_snapshot().await {
        Ok(s) => s,
        Err(err) => {
            tracing::error!("failed to fetch proxies before node delay test: {err}");
            return Json(ApiResponse {
                code: "engine_proxies_failed".to_string(),
                message: err,
                data: None,
            });
        }
    };

    let Some(group_view) = snapshot.group(&group) else {
        return Json(ApiResponse {
            code: "engine_group_not_found".to_string(),
            message: format!("proxy group '{group}' not found"),
            data: None,
        });
    };

    let Some(member) = group_view.members.iter().find(|m| m.name == node) else {
        return Json(ApiResponse {
            code: "engine_node_not_found".to_string(),
            message: format!("proxy '{node}' not found in group '{group}'"),
            data: None,
        });
    };

    // 提供者节点由提供者统一健康检查，不接受单独探测。
    if let Some(provider) = member.provider.as_deref() {
        return Json(ApiResponse {
            code: "delay_provider_node".to_string(),
            message: format!(
                "proxy '{node}' belongs to provider '{provider}'; use the provider health check"
            ),
            data: None,
        });
    }

    let config = state.config.snapshot();
    let url = body
        .url
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| state.delay.group_url(&group));
    let timeout_ms = body.timeout_ms.unwrap_or(config.delay_test.timeout_ms);

    let delay = state.delay.check_one(&node, &group, &url, timeout_ms).await;

    tracing::info!(
        "delay test for proxy '{}' in group '{}' finished: {}, url={}, timeout_ms={}",
        node,
        group,
        format_delay(delay),
        url,
        timeout_ms
    );

    Json(ApiResponse {
        code: "ok".to_string(),
        message: "success".to_string(),
        data: Some(NodeDelayResponseDto {
            group,
            node,
            url,
            timeout_ms,
            delay,
        }),
    })
}

pub async fn test_group_delay(
    Path(group): Path<String>,
    Json(body): Json<GroupDelayRequest>,
) -> Json<ApiResponse<GroupDelayResponseDto>> {
    let state = app_state();

    let snapshot = match state.engine.fetch_snapshot().await {
        Ok(s) => s,
        Err(err) => {
            tracing::error!("failed to fetch proxies before group delay test: {err}");
            return Json(ApiResponse {
                code: "engine_proxies_failed".to_string(),
                message: err,
                data: None,
            });
        }
    };

    let Some(group_view) = snapshot.group(&group) else {
        return Json(ApiResponse {
            code: "engine_group_not_found".to_string(),
            message: format!("proxy group '{group}' not found"),
            data: None,
        });
    };

    let config = state.config.snapshot();

    // 指定了组级 URL 时记住它，后续对该组的单节点测速沿用。
    if let Some(url) = body
        .url
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        state.delay.set_group_url(&group, url);
    }

    let opts = CheckOptions {
        url: None,
        timeout_ms: body.timeout_ms.or(Some(config.delay_test.timeout_ms)),
        concurrency: Some(config.delay_test.concurrency),
        nodes: body.nodes.clone(),
    };

    state.delay.check_group(group_view, &opts).await;

    let url = state.delay.group_url(&group);
    let timeout_ms = opts.timeout_ms.unwrap_or(config.delay_test.timeout_ms);

    let filter: Option<HashSet<&str>> = body
        .nodes
        .as_ref()
        .map(|ns| ns.iter().map(String::as_str).collect());

    let mut results = Vec::new();
    for member in &group_view.members {
        if member.provider.is_some() {
            continue;
        }
        if let Some(filter) = filter.as_ref() {
            if !filter.contains(member.name.as_str()) {
                continue;
            }
        }
        results.push(GroupDelayResultDto {
            node: member.name.clone(),
            delay: state.delay.get(&member.name, &group),
        });
    }

    let providers_checked = crate::engine::distinct_providers(group_view);

    tracing::info!(
        "delay test for group '{}' finished: {} nodes, {} providers, url={}, timeout_ms={}",
        group,
        results.len(),
        providers_checked.len(),
        url,
        timeout_ms
    );

    Json(ApiResponse {
        code: "ok".to_string(),
        message: "success".to_string(),
        data: Some(GroupDelayResponseDto {
            group,
            url,
            timeout_ms,
            providers_checked,
            results,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::{classify, format_delay, CheckOptions, DelayBucket, DelayManager, DelayValue};
    use crate::config::{DelayTestConfig, DelayThresholds};
    use crate::engine::{
        Connection, EngineApi, GroupType, ProxyGroup, ProxyNode, ProxySnapshot,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::sync::broadcast;

    #[derive(Default)]
    struct MockEngine {
        delays: Mutex<HashMap<String, Result<u32, String>>>,
        probe_log: Mutex<Vec<String>>,
        health_log: Mutex<Vec<String>>,
    }

    impl MockEngine {
        fn set_delay(&self, proxy: &str, outcome: Result<u32, String>) {
            self.delays
                .lock()
                .unwrap()
                .insert(proxy.to_string(), outcome);
        }

        fn probed(&self) -> Vec<String> {
            self.probe_log.lock().unwrap().clone()
        }

        fn health_checked(&self) -> Vec<String> {
            self.health_log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EngineApi for MockEngine {
        async fn fetch_snapshot(&self) -> Result<ProxySnapshot, String> {
            Ok(ProxySnapshot::default())
        }

        async fn probe_delay(
            &self,
            proxy: &str,
            _url: &str,
            _timeout_ms: u32,
        ) -> Result<u32, String> {
            self.probe_log.lock().unwrap().push(proxy.to_string());
            self.delays
                .lock()
                .unwrap()
                .get(proxy)
                .cloned()
                .unwrap_or(Ok(1))
        }

        async fn provider_health_check(&self, provider: &str) -> Result<(), String> {
            self.health_log.lock().unwrap().push(provider.to_string());
            Ok(())
        }

        async fn select_in_group(&self, _group: &str, _node: &str) -> Result<(), String> {
            Ok(())
        }

        async fn connections(&self) -> Result<Vec<Connection>, String> {
            Ok(Vec::new())
        }

        async fn delete_connection(&self, _id: &str) -> Result<(), String> {
            Ok(())
        }

        async fn close_all_connections(&self) -> Result<(), String> {
            Ok(())
        }

        async fn current_mode(&self) -> Result<String, String> {
            Ok("rule".to_string())
        }

        async fn patch_mode(&self, _mode: &str) -> Result<(), String> {
            Ok(())
        }
    }

    fn node(name: &str, provider: Option<&str>) -> ProxyNode {
        ProxyNode {
            name: name.to_string(),
            node_type: "Shadowsocks".to_string(),
            udp: false,
            provider: provider.map(str::to_string),
            delay: None,
        }
    }

    fn group(name: &str, members: Vec<ProxyNode>) -> ProxyGroup {
        ProxyGroup {
            name: name.to_string(),
            group_type: GroupType::Selector,
            now: None,
            members,
        }
    }

    fn manager(engine: Arc<MockEngine>) -> (DelayManager, broadcast::Receiver<crate::AppEvent>) {
        let (tx, rx) = broadcast::channel(16);
        let manager = DelayManager::new(engine, tx, DelayTestConfig::default());
        (manager, rx)
    }

    #[tokio::test]
    async fn check_one_never_leaves_in_progress() {
        let engine = Arc::new(MockEngine::default());
        engine.set_delay("us-east", Ok(87));
        let (manager, _rx) = manager(engine);

        let value = manager.check_one("us-east", "PROXY", "http://t", 5000).await;

        assert_eq!(value, DelayValue::Measured { ms: 87 });
        assert_eq!(manager.get("us-east", "PROXY"), DelayValue::Measured { ms: 87 });
    }

    #[tokio::test]
    async fn sequential_checks_last_write_wins() {
        let engine = Arc::new(MockEngine::default());
        engine.set_delay("us-east", Ok(100));
        let (manager, _rx) = manager(engine.clone());

        manager.check_one("us-east", "PROXY", "http://t", 5000).await;
        engine.set_delay("us-east", Ok(50));
        manager.check_one("us-east", "PROXY", "http://t", 5000).await;

        assert_eq!(manager.get("us-east", "PROXY"), DelayValue::Measured { ms: 50 });
    }

    #[tokio::test]
    async fn probe_failure_becomes_timeout_not_error() {
        let engine = Arc::new(MockEngine::default());
        engine.set_delay("us-east", Err("connection refused".to_string()));
        let (manager, _rx) = manager(engine);

        let value = manager.check_one("us-east", "PROXY", "http://t", 5000).await;

        assert_eq!(value, DelayValue::Timeout);
        assert_eq!(manager.get("us-east", "PROXY"), DelayValue::Timeout);
        assert_eq!(
            classify(&DelayThresholds::default(), value),
            DelayBucket::Timeout
        );
        assert_eq!(format_delay(value), "Timeout");
    }

    #[tokio::test]
    async fn probe_zero_becomes_timeout() {
        let engine = Arc::new(MockEngine::default());
        engine.set_delay("us-east", Ok(0));
        let (manager, _rx) = manager(engine);

        let value = manager.check_one("us-east", "PROXY", "http://t", 5000).await;
        assert_eq!(value, DelayValue::Timeout);
    }

    #[tokio::test]
    async fn check_group_one_health_check_per_provider() {
        let engine = Arc::new(MockEngine::default());
        let (manager, _rx) = manager(engine.clone());

        // 同一个提供者背后有多个节点时，也只允许一次健康检查。
        let g = group(
            "PROXY",
            vec![
                node("sub-1", Some("airport")),
                node("sub-2", Some("airport")),
                node("sub-3", Some("airport")),
                node("backup-1", Some("backup")),
                node("us-east", None),
                node("jp-2", None),
            ],
        );

        manager.check_group(&g, &CheckOptions::default()).await;

        assert_eq!(engine.health_checked(), vec!["airport", "backup"]);

        let mut probed = engine.probed();
        probed.sort();
        assert_eq!(probed, vec!["jp-2", "us-east"]);
    }

    #[tokio::test]
    async fn check_group_skips_in_progress_keys() {
        let engine = Arc::new(MockEngine::default());
        let (manager, _rx) = manager(engine.clone());

        manager.set("us-east", "PROXY", DelayValue::InProgress);

        let g = group("PROXY", vec![node("us-east", None), node("jp-2", None)]);
        manager.check_group(&g, &CheckOptions::default()).await;

        assert_eq!(engine.probed(), vec!["jp-2"]);
    }

    #[tokio::test]
    async fn check_group_broadcasts_refresh_after_settle() {
        let engine = Arc::new(MockEngine::default());
        engine.set_delay("jp-2", Err("unreachable".to_string()));
        let (manager, mut rx) = manager(engine);

        // 部分失败不阻止最终刷新。
        let g = group("PROXY", vec![node("us-east", None), node("jp-2", None)]);
        manager.check_group(&g, &CheckOptions::default()).await;

        let event = rx.try_recv().expect("refresh event broadcast");
        assert!(matches!(event, crate::AppEvent::ProxiesChanged { .. }));
    }

    #[tokio::test]
    async fn check_group_honors_node_filter() {
        let engine = Arc::new(MockEngine::default());
        let (manager, _rx) = manager(engine.clone());

        let g = group("PROXY", vec![node("us-east", None), node("jp-2", None)]);
        let opts = CheckOptions {
            nodes: Some(vec!["jp-2".to_string()]),
            ..CheckOptions::default()
        };
        manager.check_group(&g, &opts).await;

        assert_eq!(engine.probed(), vec!["jp-2"]);
    }

    #[tokio::test]
    async fn watcher_sees_in_progress_then_final_value() {
        let engine = Arc::new(MockEngine::default());
        engine.set_delay("us-east", Ok(87));
        let (manager, _rx) = manager(engine);

        let seen: Arc<Mutex<Vec<DelayValue>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _handle = manager.watch(
            "us-east",
            "PROXY",
            Box::new(move |value| sink.lock().unwrap().push(value)),
        );

        manager.check_one("us-east", "PROXY", "http://t", 5000).await;

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![DelayValue::InProgress, DelayValue::Measured { ms: 87 }]
        );
    }

    #[tokio::test]
    async fn disposed_watcher_is_not_notified() {
        let engine = Arc::new(MockEngine::default());
        let (manager, _rx) = manager(engine);

        let seen: Arc<Mutex<Vec<DelayValue>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = manager.watch(
            "us-east",
            "PROXY",
            Box::new(move |value| sink.lock().unwrap().push(value)),
        );

        manager.dispose(handle);
        manager.set("us-east", "PROXY", DelayValue::Measured { ms: 42 });

        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_dispose_does_not_detach_successor() {
        let engine = Arc::new(MockEngine::default());
        let (manager, _rx) = manager(engine);

        let first: Arc<Mutex<Vec<DelayValue>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = first.clone();
        let stale = manager.watch(
            "us-east",
            "PROXY",
            Box::new(move |value| sink.lock().unwrap().push(value)),
        );

        // 同键位的新订阅替换旧订阅（一个键位同时只有一行可见）。
        let second: Arc<Mutex<Vec<DelayValue>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = second.clone();
        let _current = manager.watch(
            "us-east",
            "PROXY",
            Box::new(move |value| sink.lock().unwrap().push(value)),
        );

        // 旧句柄晚到的 dispose 不能移除新订阅。
        manager.dispose(stale);
        manager.set("us-east", "PROXY", DelayValue::Measured { ms: 42 });

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(
            *second.lock().unwrap(),
            vec![DelayValue::Measured { ms: 42 }]
        );
    }

    #[tokio::test]
    async fn unwatch_removes_unconditionally() {
        let engine = Arc::new(MockEngine::default());
        let (manager, _rx) = manager(engine);

        let seen: Arc<Mutex<Vec<DelayValue>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _handle = manager.watch(
            "us-east",
            "PROXY",
            Box::new(move |value| sink.lock().unwrap().push(value)),
        );

        manager.unwatch("us-east", "PROXY");
        manager.set("us-east", "PROXY", DelayValue::Measured { ms: 42 });

        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn absent_key_reads_as_unset() {
        let engine = Arc::new(MockEngine::default());
        let (tx, _rx) = broadcast::channel(4);
        let manager = DelayManager::new(engine, tx, DelayTestConfig::default());

        assert_eq!(manager.get("nope", "PROXY"), DelayValue::Unset);
    }

    #[test]
    fn effective_delay_falls_back_to_engine_history() {
        let engine = Arc::new(MockEngine::default());
        let (tx, _rx) = broadcast::channel(4);
        let manager = DelayManager::new(engine, tx, DelayTestConfig::default());

        let mut n = node("us-east", None);
        n.delay = Some(87);
        assert_eq!(
            manager.effective_delay(&n, "PROXY"),
            DelayValue::Measured { ms: 87 }
        );

        n.delay = Some(0);
        assert_eq!(manager.effective_delay(&n, "PROXY"), DelayValue::Timeout);

        // 缓存有记录时覆盖历史值。
        manager.set("us-east", "PROXY", DelayValue::Measured { ms: 33 });
        assert_eq!(
            manager.effective_delay(&n, "PROXY"),
            DelayValue::Measured { ms: 33 }
        );
    }

    #[test]
    fn classify_uses_configurable_thresholds() {
        let thresholds = DelayThresholds::default();

        assert_eq!(
            classify(&thresholds, DelayValue::Measured { ms: 99 }),
            DelayBucket::Low
        );
        assert_eq!(
            classify(&thresholds, DelayValue::Measured { ms: 100 }),
            DelayBucket::Medium
        );
        assert_eq!(
            classify(&thresholds, DelayValue::Measured { ms: 500 }),
            DelayBucket::Medium
        );
        assert_eq!(
            classify(&thresholds, DelayValue::Measured { ms: 501 }),
            DelayBucket::High
        );
        assert_eq!(classify(&thresholds, DelayValue::Unset), DelayBucket::Unset);
        assert_eq!(
            classify(&thresholds, DelayValue::InProgress),
            DelayBucket::Unset
        );

        let tight = DelayThresholds {
            favorable_ms: 50,
            acceptable_ms: 200,
        };
        assert_eq!(
            classify(&tight, DelayValue::Measured { ms: 99 }),
            DelayBucket::Medium
        );
    }

    #[test]
    fn format_covers_all_states() {
        assert_eq!(format_delay(DelayValue::Unset), "");
        assert_eq!(format_delay(DelayValue::InProgress), "...");
        assert_eq!(format_delay(DelayValue::Timeout), "Timeout");
        assert_eq!(format_delay(DelayValue::Measured { ms: 87 }), "87ms");
    }

    #[test]
    fn group_url_override_sticks() {
        let engine = Arc::new(MockEngine::default());
        let (tx, _rx) = broadcast::channel(4);
        let manager = DelayManager::new(engine, tx, DelayTestConfig::default());

        assert_eq!(manager.group_url("STREAM"), DelayTestConfig::default().url);

        manager.set_group_url("STREAM", "http://stream-probe/ping");
        assert_eq!(manager.group_url("STREAM"), "http://stream-probe/ping");
        assert_eq!(manager.group_url("PROXY"), DelayTestConfig::default().url);
    }
}
