use std::collections::{HashMap, HashSet};

use axum::{
    extract::{Path, Query},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::app::app_state;
use crate::delay::{classify, format_delay, DelayBucket, DelayValue};
use crate::engine::{GroupType, ProxyGroup, ProxyNode, ProxySnapshot, GLOBAL_GROUP};
use crate::ApiResponse;

/// 面板展示模式，对应引擎的运行模式。
#[derive(Serialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum PanelMode {
    Rule,
    Global,
    Direct,
}

impl PanelMode {
    pub fn parse(s: &str) -> Option<PanelMode> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("rule") {
            Some(PanelMode::Rule)
        } else if s.eq_ignore_ascii_case("global") {
            Some(PanelMode::Global)
        } else if s.eq_ignore_ascii_case("direct") {
            Some(PanelMode::Direct)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PanelMode::Rule => "rule",
            PanelMode::Global => "global",
            PanelMode::Direct => "direct",
        }
    }
}

/// 当前模式下应该展示的组：
/// - direct 模式不展示任何组；
/// - global 模式只展示 GLOBAL 组；
/// - rule 模式展示除 GLOBAL 以外的所有组。
pub fn groups_for_mode(snapshot: &ProxySnapshot, mode: PanelMode) -> Vec<&ProxyGroup> {
    match mode {
        PanelMode::Direct => Vec::new(),
        PanelMode::Global => snapshot
            .groups
            .iter()
            .filter(|g| g.name == GLOBAL_GROUP)
            .collect(),
        PanelMode::Rule => snapshot
            .groups
            .iter()
            .filter(|g| g.name != GLOBAL_GROUP)
            .collect(),
    }
}

/// 压平后的一行。key 在一次压平内唯一；只要组与成员的身份集合不变，
/// 同一键位跨多次压平保持不变，仅 now 或延迟值变化时行位置不会漂移。
#[derive(Serialize, Clone, PartialEq, Debug)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderRow {
    GroupHead {
        key: String,
        group: String,
        group_type: GroupType,
        now: Option<String>,
        member_count: usize,
    },
    Node {
        key: String,
        group: String,
        name: String,
        node_type: String,
        udp: bool,
    },
    ProviderCol {
        key: String,
        group: String,
        provider: String,
        nodes: Vec<String>,
    },
}

impl RenderRow {
    pub fn key(&self) -> &str {
        match self {
            RenderRow::GroupHead { key, .. }
            | RenderRow::Node { key, .. }
            | RenderRow::ProviderCol { key, .. } => key,
        }
    }
}

/// 将已按模式过滤的组序列压平为行序列。
///
/// 行序：每个组先输出一行表头；随后按成员列出顺序输出内联节点行；
/// 最后按首次出现顺序为每个提供者输出一行汇总列。提供者节点不在
/// 此层逐个展开，整个提供者作为一个可批量测速的单元呈现。
/// 相同的输入快照两次压平必然得到相同的行序与键。
pub fn flatten(groups: &[&ProxyGroup]) -> Vec<RenderRow> {
    let mut rows = Vec::new();

    for group in groups {
        rows.push(RenderRow::GroupHead {
            key: format!("head:{}", group.name),
            group: group.name.clone(),
            group_type: group.group_type,
            now: group.now.clone(),
            member_count: group.members.len(),
        });

        for member in &group.members {
            if member.provider.is_none() {
                rows.push(RenderRow::Node {
                    key: format!("node:{}:{}", group.name, member.name),
                    group: group.name.clone(),
                    name: member.name.clone(),
                    node_type: member.node_type.clone(),
                    udp: member.udp,
                });
            }
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for member in &group.members {
            let Some(provider) = member.provider.as_deref() else {
                continue;
            };
            if !seen.insert(provider) {
                continue;
            }

            let nodes: Vec<String> = group
                .members
                .iter()
                .filter(|m| m.provider.as_deref() == Some(provider))
                .map(|m| m.name.clone())
                .collect();

            rows.push(RenderRow::ProviderCol {
                key: format!("col:{}:{}", group.name, provider),
                group: group.name.clone(),
                provider: provider.to_string(),
                nodes,
            });
        }
    }

    rows
}

/// 组当前选中节点所在行的下标：内联节点行直接按名称匹配，
/// 提供者节点匹配到其所在的汇总列。引擎上报了过时的 now
/// （成员列表中已不存在）时返回 None，调用方按“什么都不做”处理。
pub fn locate_now(rows: &[RenderRow], group: &ProxyGroup) -> Option<usize> {
    let now = group.now.as_deref()?;

    rows.iter().position(|row| match row {
        RenderRow::Node {
            group: row_group,
            name,
            ..
        } => row_group == &group.name && name == now,
        RenderRow::ProviderCol {
            group: row_group,
            nodes,
            ..
        } => row_group == &group.name && nodes.iter().any(|n| n == now),
        RenderRow::GroupHead { .. } => false,
    })
}

#[derive(Deserialize)]
pub struct ProxiesQuery {
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Serialize)]
pub struct RowDto {
    #[serde(flatten)]
    pub row: RenderRow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<DelayValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_bucket: Option<DelayBucket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_text: Option<String>,
}

#[derive(Serialize)]
pub struct ProxiesViewDto {
    pub mode: String,
    pub rows: Vec<RowDto>,
}

#[derive(Serialize)]
pub struct LocateDto {
    pub group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub now: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// 查询参数里没有给模式时使用引擎当前模式；引擎不可达或上报了
/// 未知模式时回落到 rule 模式。
async fn resolve_mode(requested: Option<&str>) -> Result<PanelMode, String> {
    if let Some(raw) = requested {
        return PanelMode::parse(raw).ok_or_else(|| format!("unknown proxy mode '{raw}'"));
    }

    let state = app_state();
    match state.engine.current_mode().await {
        Ok(mode) => Ok(PanelMode::parse(&mode).unwrap_or(PanelMode::Rule)),
        Err(err) => {
            tracing::debug!("failed to read engine mode, falling back to rule: {err}");
            Ok(PanelMode::Rule)
        }
    }
}

pub async fn get_proxies(Query(query): Query<ProxiesQuery>) -> Json<ApiResponse<ProxiesViewDto>> {
    let state = app_state();

    let mode = match resolve_mode(query.mode.as_deref()).await {
        Ok(m) => m,
        Err(err) => {
            return Json(ApiResponse {
                code: "mode_invalid".to_string(),
                message: err,
                data: None,
            });
        }
    };

    let snapshot = match state.engine.fetch_snapshot().await {
        Ok(s) => s,
        Err(err) => {
            tracing::error!("failed to fetch proxies for render list: {err}");
            return Json(ApiResponse {
                code: "engine_proxies_failed".to_string(),
                message: err,
                data: None,
            });
        }
    };

    let groups = groups_for_mode(&snapshot, mode);
    let rows = flatten(&groups);
    let thresholds = state.config.snapshot().delay_thresholds;

    let mut members: HashMap<(&str, &str), &ProxyNode> = HashMap::new();
    for group in &groups {
        for member in &group.members {
            members.insert((group.name.as_str(), member.name.as_str()), member);
        }
    }

    let rows = rows
        .into_iter()
        .map(|row| {
            let delay = match &row {
                RenderRow::Node { group, name, .. } => members
                    .get(&(group.as_str(), name.as_str()))
                    .copied()
                    .map(|member| state.delay.effective_delay(member, group)),
                _ => None,
            };

            RowDto {
                delay_bucket: delay.map(|d| classify(&thresholds, d)),
                delay_text: delay.map(format_delay),
                delay,
                row,
            }
        })
        .collect();

    Json(ApiResponse {
        code: "ok".to_string(),
        message: "success".to_string(),
        data: Some(ProxiesViewDto {
            mode: mode.as_str().to_string(),
            rows,
        }),
    })
}

/// 当前模式的行序列中，组 group 选中节点所在的行下标，
/// 用于“滚动到当前选中项”。找不到匹配行时 index 为空，前端不滚动。
pub async fn locate_group_now(
    Path(group): Path<String>,
    Query(query): Query<ProxiesQuery>,
) -> Json<ApiResponse<LocateDto>> {
    let state = app_state();

    let mode = match resolve_mode(query.mode.as_deref()).await {
        Ok(m) => m,
        Err(err) => {
            return Json(ApiResponse {
                code: "mode_invalid".to_string(),
                message: err,
                data: None,
            });
        }
    };

    let snapshot = match state.engine.fetch_snapshot().await {
        Ok(s) => s,
        Err(err) => {
            tracing::error!("failed to fetch proxies for locate: {err}");
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

    let rows = flatten(&groups_for_mode(&snapshot, mode));
    let index = locate_now(&rows, group_view);

    Json(ApiResponse {
        code: "ok".to_string(),
        message: "success".to_string(),
        data: Some(LocateDto {
            group,
            now: group_view.now.clone(),
            key: index.map(|i| rows[i].key().to_string()),
            index,
        }),
    })
}
