use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::config::EngineConfig;

pub const GLOBAL_GROUP: &str = "GLOBAL";

/// 代理组类型。引擎上报的其它类型（如 Smart）统一归入 Unknown。
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum GroupType {
    Selector,
    #[serde(rename = "URLTest")]
    UrlTest,
    Fallback,
    LoadBalance,
    Relay,
    Direct,
    #[serde(other)]
    Unknown,
}

impl GroupType {
    pub fn parse(s: &str) -> GroupType {
        if s.eq_ignore_ascii_case("Selector") {
            GroupType::Selector
        } else if s.eq_ignore_ascii_case("URLTest") {
            GroupType::UrlTest
        } else if s.eq_ignore_ascii_case("Fallback") {
            GroupType::Fallback
        } else if s.eq_ignore_ascii_case("LoadBalance") {
            GroupType::LoadBalance
        } else if s.eq_ignore_ascii_case("Relay") {
            GroupType::Relay
        } else if s.eq_ignore_ascii_case("Direct") {
            GroupType::Direct
        } else {
            GroupType::Unknown
        }
    }

    /// 只有 Selector / Fallback 接受手动切换节点。
    pub fn selectable(self) -> bool {
        matches!(self, GroupType::Selector | GroupType::Fallback)
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct ProxyNode {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub udp: bool,
    /// 所属订阅提供者；None 表示配置中直接列出的节点。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// 引擎侧最近一次测速历史，作为缓存缺失时的回显值。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u32>,
}

#[derive(Serialize, Clone, Debug)]
pub struct ProxyGroup {
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: GroupType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub now: Option<String>,
    pub members: Vec<ProxyNode>,
}

#[derive(Serialize, Clone, Debug)]
pub struct ProviderView {
    pub name: String,
    pub vehicle: String,
    pub node_count: usize,
}

#[derive(Serialize, Clone, Debug, Default)]
pub struct ProxySnapshot {
    pub groups: Vec<ProxyGroup>,
    pub providers: Vec<ProviderView>,
}

impl ProxySnapshot {
    pub fn group(&self, name: &str) -> Option<&ProxyGroup> {
        self.groups.iter().find(|g| g.name == name)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Connection {
    pub id: String,
    #[serde(default)]
    pub chains: Vec<String>,
    #[serde(default)]
    pub rule: String,
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub upload: u64,
    #[serde(default)]
    pub download: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// 引擎控制接口的抽象。延迟与选择子系统只依赖这个 trait，
/// 测试中用内存实现替换真实的 Unix Socket 客户端。
#[async_trait]
pub trait EngineApi: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<ProxySnapshot, String>;

    /// 单节点测速。超时或非 2xx 由实现方统一映射为 Ok(0)，
    /// 只有传输层失败才返回 Err。
    async fn probe_delay(&self, proxy: &str, url: &str, timeout_ms: u32) -> Result<u32, String>;

    async fn provider_health_check(&self, provider: &str) -> Result<(), String>;

    async fn select_in_group(&self, group: &str, node: &str) -> Result<(), String>;

    async fn connections(&self) -> Result<Vec<Connection>, String>;

    async fn delete_connection(&self, id: &str) -> Result<(), String>;

    async fn close_all_connections(&self) -> Result<(), String>;

    async fn current_mode(&self) -> Result<String, String>;

    async fn patch_mode(&self, mode: &str) -> Result<(), String>;
}

#[derive(Deserialize)]
struct ProxiesRaw {
    proxies: HashMap<String, ProxyRaw>,
}

#[derive(Deserialize)]
struct ProxyRaw {
    name: String,
    #[serde(rename = "type")]
    proxy_type: Option<String>,
    #[serde(default)]
    udp: bool,
    #[serde(default)]
    all: Option<Vec<String>>,
    #[serde(default)]
    now: Option<String>,
    #[serde(default)]
    history: Vec<DelayEntry>,
}

#[derive(Deserialize)]
struct DelayEntry {
    #[serde(default)]
    delay: Option<u32>,
}

#[derive(Deserialize)]
struct ProvidersRaw {
    providers: HashMap<String, ProviderRaw>,
}

#[derive(Deserialize)]
struct ProviderRaw {
    name: String,
    #[serde(rename = "vehicleType", default)]
    vehicle_type: String,
    #[serde(default)]
    proxies: Vec<ProxyRaw>,
}

#[derive(Deserialize)]
struct ConnectionsRaw {
    #[serde(default)]
    connections: Option<Vec<Connection>>,
}

#[derive(Deserialize)]
struct ErrorResponseBody {
    #[serde(default)]
    message: Option<String>,
}

fn is_remote_vehicle(vehicle: &str) -> bool {
    vehicle.eq_ignore_ascii_case("HTTP") || vehicle.eq_ignore_ascii_case("File")
}

fn node_from_raw(
    name: &str,
    raw: Option<&ProxyRaw>,
    provider_of: &HashMap<String, String>,
) -> ProxyNode {
    match raw {
        Some(entry) => ProxyNode {
            name: entry.name.clone(),
            node_type: entry
                .proxy_type
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            udp: entry.udp,
            provider: provider_of.get(name).cloned(),
            delay: entry.history.last().and_then(|h| h.delay),
        },
        None => ProxyNode {
            name: name.to_string(),
            node_type: "unknown".to_string(),
            udp: false,
            provider: provider_of.get(name).cloned(),
            delay: None,
        },
    }
}

/// 将引擎的 /proxies 与 /providers/proxies 响应合并为一份快照。
///
/// 组顺序：优先按 GLOBAL.all 给出的顺序排列，未出现在其中的组按名称排序追加，
/// GLOBAL 自身始终放在最后（仅 global 模式渲染时使用）。
/// 同一引擎状态两次解析必然得到相同的组序与成员序。
pub fn parse_snapshot(
    proxies_body: &str,
    providers_body: Option<&str>,
) -> Result<ProxySnapshot, String> {
    let raw: ProxiesRaw = serde_json::from_str(proxies_body)
        .map_err(|err| format!("failed to parse engine /proxies response: {err}"))?;

    let mut provider_of: HashMap<String, String> = HashMap::new();
    let mut providers: Vec<ProviderView> = Vec::new();

    if let Some(body) = providers_body {
        let providers_raw: ProvidersRaw = serde_json::from_str(body)
            .map_err(|err| format!("failed to parse engine /providers/proxies response: {err}"))?;

        for provider in providers_raw.providers.values() {
            if !is_remote_vehicle(&provider.vehicle_type) {
                continue;
            }
            for proxy in &provider.proxies {
                provider_of.insert(proxy.name.clone(), provider.name.clone());
            }
            providers.push(ProviderView {
                name: provider.name.clone(),
                vehicle: provider.vehicle_type.clone(),
                node_count: provider.proxies.len(),
            });
        }
        providers.sort_by(|a, b| a.name.cmp(&b.name));
    }

    let mut groups_map: HashMap<String, ProxyGroup> = HashMap::new();

    for proxy in raw.proxies.values() {
        let Some(all_nodes) = proxy.all.as_ref() else {
            continue;
        };

        let members = all_nodes
            .iter()
            .map(|node_name| node_from_raw(node_name, raw.proxies.get(node_name), &provider_of))
            .collect();

        groups_map.insert(
            proxy.name.clone(),
            ProxyGroup {
                name: proxy.name.clone(),
                group_type: GroupType::parse(proxy.proxy_type.as_deref().unwrap_or("unknown")),
                now: proxy.now.clone(),
                members,
            },
        );
    }

    let mut groups: Vec<ProxyGroup> = Vec::new();

    // GLOBAL.all 定义了面板上代理组的展示顺序。
    if let Some(global) = raw.proxies.get(GLOBAL_GROUP) {
        if let Some(global_all) = global.all.as_ref() {
            for group_name in global_all {
                if group_name == GLOBAL_GROUP {
                    continue;
                }
                if let Some(group) = groups_map.remove(group_name) {
                    groups.push(group);
                }
            }
        }
    }

    let global = groups_map.remove(GLOBAL_GROUP);

    // 其余未在 GLOBAL.all 中出现的组按名称排序，保证快照稳定。
    let mut rest: Vec<ProxyGroup> = groups_map.into_values().collect();
    rest.sort_by(|a, b| a.name.cmp(&b.name));
    groups.extend(rest);

    if let Some(global) = global {
        groups.push(global);
    }

    Ok(ProxySnapshot { groups, providers })
}

pub fn encode_path_segment(input: &str) -> String {
    let mut out = String::new();
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn build_http_request(method: &str, path: &str, body: Option<&str>, secret: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };

    let mut req = String::new();
    req.push_str(&format!("{method} {path} HTTP/1.1\r\n"));
    req.push_str("Host: 127.0.0.1\r\n");
    req.push_str("Accept: application/json\r\n");
    req.push_str("Connection: close\r\n");
    if !secret.is_empty() {
        req.push_str(&format!("Authorization: Bearer {secret}\r\n"));
    }

    if let Some(body_str) = body {
        req.push_str("Content-Type: application/json\r\n");
        req.push_str(&format!("Content-Length: {}\r\n", body_str.len()));
        req.push_str("\r\n");
        req.push_str(body_str);
    } else {
        req.push_str("\r\n");
    }

    req
}

async fn read_header(reader: &mut BufReader<&mut UnixStream>) -> Result<String, String> {
    let mut header = String::new();
    loop {
        let mut line = String::new();
        let size = reader
            .read_line(&mut line)
            .await
            .map_err(|err| format!("failed to read response header: {err}"))?;
        if size == 0 {
            return Err("no response from engine".to_string());
        }
        header.push_str(&line);
        if line == "\r\n" {
            break;
        }
    }
    Ok(header)
}

async fn read_chunked_body(reader: &mut BufReader<&mut UnixStream>) -> Result<String, String> {
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        reader
            .read_line(&mut size_line)
            .await
            .map_err(|err| format!("failed to read chunk size: {err}"))?;
        let size_line = size_line.trim();
        if size_line.is_empty() {
            continue;
        }
        let chunk_size = usize::from_str_radix(size_line, 16)
            .map_err(|err| format!("failed to parse chunk size: {err}"))?;

        if chunk_size == 0 {
            let mut _end = String::new();
            reader
                .read_line(&mut _end)
                .await
                .map_err(|err| format!("failed to read chunk terminator: {err}"))?;
            break;
        }

        let mut chunk_data = vec![0u8; chunk_size];
        reader
            .read_exact(&mut chunk_data)
            .await
            .map_err(|err| format!("failed to read chunk data: {err}"))?;
        body.extend_from_slice(&chunk_data);

        let mut _crlf = String::new();
        reader
            .read_line(&mut _crlf)
            .await
            .map_err(|err| format!("failed to read chunk CRLF: {err}"))?;
    }

    String::from_utf8(body).map_err(|err| format!("failed to decode chunked body as utf-8: {err}"))
}

fn map_error_from_body(status: u16, body: &str) -> String {
    if body.is_empty() {
        return format!("engine returned {} with empty body", status);
    }
    match serde_json::from_str::<ErrorResponseBody>(body) {
        Ok(err_body) => err_body
            .message
            .unwrap_or_else(|| format!("engine returned status {status}")),
        Err(_) => format!("engine returned status {status}: {body}"),
    }
}

/// 通过 Unix Socket 访问 mihomo 兼容控制接口的客户端。
pub struct EngineClient {
    socket_path: PathBuf,
    secret: String,
}

impl EngineClient {
    pub fn new(config: &EngineConfig) -> Self {
        EngineClient {
            socket_path: PathBuf::from(&config.socket_path),
            secret: config.secret.clone(),
        }
    }

    async fn send_request(
        &self,
        method: &str,
        path: &str,
        body: Option<&str>,
    ) -> Result<(u16, String), String> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|err| {
            format!(
                "failed to connect to engine unix socket at {}: {err}",
                self.socket_path.display()
            )
        })?;

        let request = build_http_request(method, path, body, &self.secret);
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|err| format!("failed to write request to engine: {err}"))?;
        stream
            .flush()
            .await
            .map_err(|err| format!("failed to flush request to engine: {err}"))?;

        let mut reader = BufReader::new(&mut stream);

        let header = read_header(&mut reader).await?;

        let mut content_length: Option<usize> = None;
        let mut is_chunked = false;
        for line in header.lines() {
            let lower = line.to_ascii_lowercase();
            if let Some(v) = lower.strip_prefix("content-length: ") {
                if let Ok(len) = v.trim().parse::<usize>() {
                    content_length = Some(len);
                }
            }
            if lower.contains("transfer-encoding: chunked") {
                is_chunked = true;
            }
        }

        let body_str = if is_chunked {
            read_chunked_body(&mut reader).await?
        } else if let Some(len) = content_length {
            let mut buf = vec![0u8; len];
            reader
                .read_exact(&mut buf)
                .await
                .map_err(|err| format!("failed to read response body: {err}"))?;
            String::from_utf8(buf)
                .map_err(|err| format!("failed to decode response body as utf-8: {err}"))?
        } else {
            let mut buf = String::new();
            reader
                .read_to_string(&mut buf)
                .await
                .map_err(|err| format!("failed to read response body: {err}"))?;
            buf
        };

        let mut lines = header.lines();
        let status_line = lines
            .next()
            .ok_or_else(|| "invalid engine response: missing status line".to_string())?;
        let mut parts = status_line.split_whitespace();
        let _ = parts
            .next()
            .ok_or_else(|| "invalid engine response: missing http version".to_string())?;
        let code_str = parts
            .next()
            .ok_or_else(|| "invalid engine response: missing status code".to_string())?;
        let status_code: u16 = code_str
            .parse()
            .map_err(|err| format!("invalid engine status code: {err}"))?;

        Ok((status_code, body_str))
    }
}

#[async_trait]
impl EngineApi for EngineClient {
    async fn fetch_snapshot(&self) -> Result<ProxySnapshot, String> {
        let (status, proxies_body) = self.send_request("GET", "/proxies", None).await?;
        if !(200..300).contains(&status) {
            return Err(map_error_from_body(status, &proxies_body));
        }

        // 旧内核可能没有 providers 接口；失败时退化为“无提供者”视图。
        let providers_body = match self.send_request("GET", "/providers/proxies", None).await {
            Ok((status, body)) if (200..300).contains(&status) => Some(body),
            Ok((status, body)) => {
                tracing::debug!(
                    "engine /providers/proxies returned status {}: {}",
                    status,
                    map_error_from_body(status, &body)
                );
                None
            }
            Err(err) => {
                tracing::debug!("engine /providers/proxies request failed: {err}");
                None
            }
        };

        parse_snapshot(&proxies_body, providers_body.as_deref())
    }

    async fn probe_delay(&self, proxy: &str, url: &str, timeout_ms: u32) -> Result<u32, String> {
        let proxy_enc = encode_path_segment(proxy);
        let url_enc = encode_path_segment(url);
        let path = format!("/proxies/{proxy_enc}/delay?url={url_enc}&timeout={timeout_ms}");

        let (status, body) = self.send_request("GET", &path, None).await?;
        if (200..300).contains(&status) {
            #[derive(Deserialize)]
            struct DelayBody {
                delay: u32,
            }
            serde_json::from_str::<DelayBody>(&body)
                .map(|v| v.delay)
                .map_err(|err| format!("failed to parse delay response for {proxy}: {err}"))
        } else {
            // 超时时引擎返回错误体，统一映射为 delay=0。
            tracing::debug!(
                "delay probe for '{}' returned non-success status {}; treating as timeout",
                proxy,
                status
            );
            Ok(0)
        }
    }

    async fn provider_health_check(&self, provider: &str) -> Result<(), String> {
        let path = format!(
            "/providers/proxies/{}/healthcheck",
            encode_path_segment(provider)
        );

        let (status, body) = self.send_request("GET", &path, None).await?;
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(map_error_from_body(status, &body))
        }
    }

    async fn select_in_group(&self, group: &str, node: &str) -> Result<(), String> {
        let path = format!("/proxies/{}", encode_path_segment(group));
        let body = serde_json::json!({ "name": node });
        let body_str = serde_json::to_string(&body)
            .map_err(|err| format!("failed to serialize select request body: {err}"))?;

        let (status, resp_body) = self.send_request("PUT", &path, Some(&body_str)).await?;
        if !(200..300).contains(&status) {
            return Err(map_error_from_body(status, &resp_body));
        }

        Ok(())
    }

    async fn connections(&self) -> Result<Vec<Connection>, String> {
        let (status, body) = self.send_request("GET", "/connections", None).await?;
        if !(200..300).contains(&status) {
            return Err(map_error_from_body(status, &body));
        }

        let raw: ConnectionsRaw = serde_json::from_str(&body)
            .map_err(|err| format!("failed to parse engine /connections response: {err}"))?;
        Ok(raw.connections.unwrap_or_default())
    }

    async fn delete_connection(&self, id: &str) -> Result<(), String> {
        let path = format!("/connections/{}", encode_path_segment(id));
        let (status, body) = self.send_request("DELETE", &path, None).await?;
        if !(200..300).contains(&status) {
            return Err(map_error_from_body(status, &body));
        }
        Ok(())
    }

    async fn close_all_connections(&self) -> Result<(), String> {
        let (status, body) = self.send_request("DELETE", "/connections", None).await?;
        if !(200..300).contains(&status) {
            return Err(map_error_from_body(status, &body));
        }
        Ok(())
    }

    async fn current_mode(&self) -> Result<String, String> {
        let (status, body) = self.send_request("GET", "/configs", None).await?;
        if !(200..300).contains(&status) {
            return Err(map_error_from_body(status, &body));
        }

        #[derive(Deserialize)]
        struct ConfigsBody {
            #[serde(default)]
            mode: Option<String>,
        }
        let configs: ConfigsBody = serde_json::from_str(&body)
            .map_err(|err| format!("failed to parse engine /configs response: {err}"))?;
        Ok(configs.mode.unwrap_or_default().to_lowercase())
    }

    async fn patch_mode(&self, mode: &str) -> Result<(), String> {
        let body = serde_json::json!({ "mode": mode });
        let body_str = serde_json::to_string(&body)
            .map_err(|err| format!("failed to serialize mode patch body: {err}"))?;

        let (status, resp_body) = self.send_request("PATCH", "/configs", Some(&body_str)).await?;
        if !(200..300).contains(&status) {
            return Err(map_error_from_body(status, &resp_body));
        }
        Ok(())
    }
}

/// 组内成员去重后的提供者列表，保持首次出现的顺序。
pub fn distinct_providers(group: &ProxyGroup) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut providers = Vec::new();
    for member in &group.members {
        if let Some(provider) = member.provider.as_deref() {
            if seen.insert(provider) {
                providers.push(provider.to_string());
            }
        }
    }
    providers
}

#[cfg(test)]
mod tests {
    use super::{
        distinct_providers, encode_path_segment, parse_snapshot, GroupType, GLOBAL_GROUP,
    };

    const PROXIES_BODY: &str = r#"{
        "proxies": {
            "GLOBAL": {
                "name": "GLOBAL",
                "type": "Selector",
                "all": ["PROXY", "STREAM", "us-east"],
                "now": "PROXY"
            },
            "PROXY": {
                "name": "PROXY",
                "type": "Selector",
                "all": ["us-east", "jp-2", "sub-hk"],
                "now": "us-east"
            },
            "STREAM": {
                "name": "STREAM",
                "type": "URLTest",
                "all": ["sub-hk"],
                "now": "sub-hk"
            },
            "ZZZ-EXTRA": {
                "name": "ZZZ-EXTRA",
                "type": "Fallback",
                "all": [],
                "now": null
            },
            "us-east": {
                "name": "us-east",
                "type": "Shadowsocks",
                "udp": true,
                "history": [{"delay": 120}, {"delay": 87}]
            },
            "jp-2": {
                "name": "jp-2",
                "type": "Vmess",
                "history": []
            },
            "sub-hk": {
                "name": "sub-hk",
                "type": "Trojan",
                "history": [{"delay": 230}]
            }
        }
    }"#;

    const PROVIDERS_BODY: &str = r#"{
        "providers": {
            "airport": {
                "name": "airport",
                "vehicleType": "HTTP",
                "proxies": [{"name": "sub-hk"}]
            },
            "default": {
                "name": "default",
                "vehicleType": "Compatible",
                "proxies": [{"name": "us-east"}, {"name": "jp-2"}]
            }
        }
    }"#;

    #[test]
    fn snapshot_orders_groups_by_global_then_name() {
        let snapshot = parse_snapshot(PROXIES_BODY, Some(PROVIDERS_BODY)).expect("parse snapshot");

        let names: Vec<&str> = snapshot.groups.iter().map(|g| g.name.as_str()).collect();
        // PROXY/STREAM 来自 GLOBAL.all；ZZZ-EXTRA 未出现其中，按名称排序追加；GLOBAL 最后。
        assert_eq!(names, vec!["PROXY", "STREAM", "ZZZ-EXTRA", GLOBAL_GROUP]);
    }

    #[test]
    fn snapshot_is_deterministic() {
        let a = parse_snapshot(PROXIES_BODY, Some(PROVIDERS_BODY)).expect("parse snapshot");
        let b = parse_snapshot(PROXIES_BODY, Some(PROVIDERS_BODY)).expect("parse snapshot");

        let keys_a: Vec<String> = a
            .groups
            .iter()
            .flat_map(|g| g.members.iter().map(move |m| format!("{}/{}", g.name, m.name)))
            .collect();
        let keys_b: Vec<String> = b
            .groups
            .iter()
            .flat_map(|g| g.members.iter().map(move |m| format!("{}/{}", g.name, m.name)))
            .collect();
        assert_eq!(keys_a, keys_b);
    }

    #[test]
    fn provider_membership_only_from_remote_vehicles() {
        let snapshot = parse_snapshot(PROXIES_BODY, Some(PROVIDERS_BODY)).expect("parse snapshot");

        let proxy_group = snapshot.group("PROXY").expect("PROXY group");
        let by_name = |name: &str| {
            proxy_group
                .members
                .iter()
                .find(|m| m.name == name)
                .expect("member present")
        };

        // sub-hk 来自 HTTP 提供者；us-east / jp-2 属于 Compatible（内联），不算提供者节点。
        assert_eq!(by_name("sub-hk").provider.as_deref(), Some("airport"));
        assert!(by_name("us-east").provider.is_none());
        assert!(by_name("jp-2").provider.is_none());

        assert_eq!(snapshot.providers.len(), 1);
        assert_eq!(snapshot.providers[0].name, "airport");

        assert_eq!(distinct_providers(proxy_group), vec!["airport".to_string()]);
    }

    #[test]
    fn member_carries_last_history_delay_and_udp() {
        let snapshot = parse_snapshot(PROXIES_BODY, Some(PROVIDERS_BODY)).expect("parse snapshot");

        let proxy_group = snapshot.group("PROXY").expect("PROXY group");
        let us_east = proxy_group
            .members
            .iter()
            .find(|m| m.name == "us-east")
            .expect("us-east");

        assert_eq!(us_east.delay, Some(87));
        assert!(us_east.udp);
        assert_eq!(us_east.node_type, "Shadowsocks");

        let jp = proxy_group
            .members
            .iter()
            .find(|m| m.name == "jp-2")
            .expect("jp-2");
        assert_eq!(jp.delay, None);
    }

    #[test]
    fn empty_group_and_unknown_member_tolerated() {
        let snapshot = parse_snapshot(PROXIES_BODY, None).expect("parse snapshot");

        let empty = snapshot.group("ZZZ-EXTRA").expect("empty group");
        assert!(empty.members.is_empty());
        assert_eq!(empty.group_type, GroupType::Fallback);
    }

    #[test]
    fn group_type_parse_covers_engine_spellings() {
        assert_eq!(GroupType::parse("Selector"), GroupType::Selector);
        assert_eq!(GroupType::parse("URLTest"), GroupType::UrlTest);
        assert_eq!(GroupType::parse("urltest"), GroupType::UrlTest);
        assert_eq!(GroupType::parse("LoadBalance"), GroupType::LoadBalance);
        assert_eq!(GroupType::parse("Smart"), GroupType::Unknown);

        assert!(GroupType::Selector.selectable());
        assert!(GroupType::Fallback.selectable());
        assert!(!GroupType::UrlTest.selectable());
        assert!(!GroupType::LoadBalance.selectable());
    }

    #[test]
    fn path_segment_encoding() {
        assert_eq!(encode_path_segment("PROXY"), "PROXY");
        assert_eq!(encode_path_segment("香港 01"), "%E9%A6%99%E6%B8%AF%2001");
        assert_eq!(
            encode_path_segment("https://www.gstatic.com/generate_204"),
            "https%3A%2F%2Fwww.gstatic.com%2Fgenerate_204"
        );
    }
}
