use std::sync::Arc;

use axum::{extract::Path, Json};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::app::{app_state, current_timestamp};
use crate::config::ConfigStore;
use crate::engine::{Connection, EngineApi, GroupType};
use crate::{ApiResponse, AppEvent, RefreshReason};

pub const MODES: [&str; 3] = ["rule", "global", "direct"];

/// select_proxy 的结果。前三种在发起引擎调用之前就已确定，
/// 对应的请求不产生任何网络副作用。
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum SelectOutcome {
    Selected {
        previous: Option<String>,
        closed_connections: usize,
    },
    GroupNotFound,
    GroupNotSelectable { group_type: GroupType },
    NodeNotInGroup,
}

/// 代理组选择协调器：把“在组 G 中选中节点 X”作为一次多步事务执行，
/// 并承担模式切换与保存选择的恢复。引擎是 now 的唯一真相源，
/// 选择接口调用成功即视为切换已提交，其后的连接清理与历史落盘都是
/// 尽力而为的副作用。
pub struct SelectionCoordinator {
    engine: Arc<dyn EngineApi>,
    config: Arc<ConfigStore>,
    events_tx: broadcast::Sender<AppEvent>,
}

impl SelectionCoordinator {
    pub fn new(
        engine: Arc<dyn EngineApi>,
        config: Arc<ConfigStore>,
        events_tx: broadcast::Sender<AppEvent>,
    ) -> Self {
        SelectionCoordinator {
            engine,
            config,
            events_tx,
        }
    }

    /// 在组 group 中切换到节点 node：
    /// 1. 本地校验：组存在、组类型可手动选择、节点在成员列表中，
    ///    任何一条不满足都直接返回，不调用选择接口；
    /// 2. 调用引擎选择接口，失败时原样上抛且不修改任何本地状态；
    /// 3. 成功后广播一次组状态刷新；
    /// 4. 若开启了自动断开，在切换之后读取连接列表，逐个关闭链路中
    ///    含旧选中节点的连接；
    /// 5. 更新当前档案的选择历史，内存先行，落盘失败仅记录日志。
    pub async fn select_proxy(&self, group: &str, node: &str) -> Result<SelectOutcome, String> {
        let snapshot = self.engine.fetch_snapshot().await?;

        let Some(group_view) = snapshot.group(group) else {
            return Ok(SelectOutcome::GroupNotFound);
        };

        if !group_view.group_type.selectable() {
            tracing::debug!(
                "group '{}' (type {:?}) does not accept manual selection",
                group,
                group_view.group_type
            );
            return Ok(SelectOutcome::GroupNotSelectable {
                group_type: group_view.group_type,
            });
        }

        if !group_view.members.iter().any(|m| m.name == node) {
            return Ok(SelectOutcome::NodeNotInGroup);
        }

        // 切换前记住旧的选中节点，步骤 4 依赖它识别过时连接。
        let previous = group_view.now.clone();

        self.engine.select_in_group(group, node).await?;

        tracing::info!("selected proxy '{node}' in group '{group}'");
        self.broadcast_refresh(RefreshReason::SelectionChanged);

        let mut closed_connections = 0;
        if self.config.snapshot().auto_close_connection {
            if let Some(prev) = previous.as_deref() {
                if prev != node {
                    closed_connections = self.close_connections_through(prev).await;
                }
            }
        }

        if let Err(err) = self.config.update_selection(group, node) {
            // 内存中的历史已更新，仅落盘失败；以内存为准。
            tracing::error!("failed to persist proxy selection for group '{group}': {err}");
        }

        Ok(SelectOutcome::Selected {
            previous,
            closed_connections,
        })
    }

    /// 关闭所有链路中经过 proxy 的连接，返回成功关闭的数量。
    /// 连接列表在切换之后读取，旧路由下自然结束的连接不会被误删；
    /// 单个连接关闭失败只记日志，不中断批次。
    async fn close_connections_through(&self, proxy: &str) -> usize {
        let connections = match self.engine.connections().await {
            Ok(list) => list,
            Err(err) => {
                tracing::warn!(
                    "failed to list connections after switching away from '{proxy}': {err}"
                );
                return 0;
            }
        };

        let mut closed = 0;
        for conn in connections
            .iter()
            .filter(|c| c.chains.iter().any(|hop| hop == proxy))
        {
            match self.engine.delete_connection(&conn.id).await {
                Ok(()) => closed += 1,
                Err(err) => {
                    tracing::warn!(
                        "failed to close connection '{}' through '{proxy}': {err}",
                        conn.id
                    );
                }
            }
        }

        if closed > 0 {
            tracing::info!("closed {closed} stale connections that traversed '{proxy}'");
        }
        closed
    }

    /// 按当前活跃档案保存的选择历史，逐组恢复“已选节点”。
    ///
    /// 组已不存在、组类型不可选择、节点已不在组内、或已经选中目标节点的
    /// 记录都直接跳过；单条恢复失败记入错误列表但不中断其余记录。
    /// 返回实际执行了切换的记录数。
    pub async fn apply_saved_selections(&self) -> Result<usize, String> {
        let selections = self.config.selections_for_active_profile();
        if selections.is_empty() {
            tracing::debug!("no saved proxy selections for current profile; skip apply");
            return Ok(0);
        }

        let snapshot = self
            .engine
            .fetch_snapshot()
            .await
            .map_err(|err| format!("failed to fetch proxies when applying saved selections: {err}"))?;

        let mut errors: Vec<String> = Vec::new();
        let mut applied: usize = 0;

        for record in selections {
            let Some(group) = snapshot.group(&record.group) else {
                tracing::debug!(
                    "saved selection group '{}' not found in current snapshot; skip",
                    record.group
                );
                continue;
            };

            if !group.group_type.selectable() {
                tracing::debug!(
                    "group '{}' (type {:?}) is not selectable; skip saved selection",
                    group.name,
                    group.group_type
                );
                continue;
            }

            // 已经是目标节点则无需重复切换。
            if group.now.as_deref() == Some(record.node.as_str()) {
                continue;
            }

            if !group.members.iter().any(|m| m.name == record.node) {
                tracing::debug!(
                    "saved proxy '{}' not found in group '{}'; skip",
                    record.node,
                    group.name
                );
                continue;
            }

            match self.engine.select_in_group(&group.name, &record.node).await {
                Ok(()) => {
                    applied += 1;
                    tracing::info!(
                        "applied saved proxy selection: group='{}', node='{}'",
                        group.name,
                        record.node
                    );
                }
                Err(err) => {
                    let msg = format!(
                        "failed to apply saved selection for group '{}' -> '{}': {err}",
                        group.name, record.node
                    );
                    tracing::warn!("{msg}");
                    errors.push(msg);
                }
            }
        }

        if applied > 0 {
            tracing::info!("applied {applied} saved proxy selections for current profile");
        }

        if errors.is_empty() {
            Ok(applied)
        } else {
            Err(format!(
                "some saved proxy selections failed to apply: {}",
                errors.join("; ")
            ))
        }
    }

    /// 切换引擎运行模式。模式未变化时直接返回 false；
    /// 开启了自动断开时先整体关闭现有连接（尽力而为），再提交模式变更。
    pub async fn switch_mode(&self, mode: &str) -> Result<bool, String> {
        let mode = mode.trim().to_lowercase();
        if !MODES.contains(&mode.as_str()) {
            return Err(format!("unknown proxy mode '{mode}'"));
        }

        let current = self.engine.current_mode().await?;
        if current == mode {
            return Ok(false);
        }

        if self.config.snapshot().auto_close_connection {
            // 模式切换会整体改变路由决策，现有连接全部视为过时。
            if let Err(err) = self.engine.close_all_connections().await {
                tracing::warn!("failed to close connections before mode switch: {err}");
            }
        }

        self.engine.patch_mode(&mode).await?;

        tracing::info!("switched proxy mode from '{current}' to '{mode}'");
        let event = AppEvent::ModeChanged {
            mode,
            timestamp: current_timestamp(),
        };
        if let Err(err) = self.events_tx.send(event) {
            tracing::debug!("failed to broadcast AppEvent::ModeChanged: {err}");
        }

        Ok(true)
    }

    fn broadcast_refresh(&self, reason: RefreshReason) {
        let event = AppEvent::ProxiesChanged {
            reason,
            timestamp: current_timestamp(),
        };
        if let Err(err) = self.events_tx.send(event) {
            tracing::debug!("failed to broadcast AppEvent::ProxiesChanged: {err}");
        }
    }
}

#[derive(Deserialize)]
pub struct SelectProxyRequest {
    pub name: String,
}

#[derive(Serialize)]
pub struct SelectProxyResponseDto {
    pub group: String,
    pub node: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    pub closed_connections: usize,
}

pub async fn select_proxy(
    Path(group): Path<String>,
    Json(body): Json<SelectProxyRequest>,
) -> Json<ApiResponse<SelectProxyResponseDto>> {
    let state = app_state();

    let node = body.name.trim().to_string();
    if node.is_empty() {
        return Json(ApiResponse {
            code: "select_invalid_node".to_string(),
            message: "proxy name cannot be empty".to_string(),
            data: None,
        });
    }

    match state.selection.select_proxy(&group, &node).await {
        Ok(SelectOutcome::Selected {
            previous,
            closed_connections,
        }) => Json(ApiResponse {
            code: "ok".to_string(),
            message: "selected".to_string(),
            data: Some(SelectProxyResponseDto {
                group,
                node,
                previous,
                closed_connections,
            }),
        }),
        Ok(SelectOutcome::GroupNotFound) => Json(ApiResponse {
            code: "engine_group_not_found".to_string(),
            message: format!("proxy group '{group}' not found"),
            data: None,
        }),
        Ok(SelectOutcome::GroupNotSelectable { group_type }) => Json(ApiResponse {
            code: "select_group_not_selectable".to_string(),
            message: format!("group '{group}' (type {group_type:?}) does not accept manual selection"),
            data: None,
        }),
        Ok(SelectOutcome::NodeNotInGroup) => Json(ApiResponse {
            code: "select_node_not_in_group".to_string(),
            message: format!("proxy '{node}' not found in group '{group}'"),
            data: None,
        }),
        Err(err) => {
            tracing::error!("failed to select proxy for group '{group}': {err}");
            Json(ApiResponse {
                code: "engine_select_failed".to_string(),
                message: err,
                data: None,
            })
        }
    }
}

#[derive(Serialize)]
pub struct ModeDto {
    pub mode: String,
}

#[derive(Deserialize)]
pub struct UpdateModeRequest {
    pub mode: String,
}

pub async fn get_mode() -> Json<ApiResponse<ModeDto>> {
    let state = app_state();

    match state.engine.current_mode().await {
        Ok(mode) => Json(ApiResponse {
            code: "ok".to_string(),
            message: "success".to_string(),
            data: Some(ModeDto { mode }),
        }),
        Err(err) => {
            tracing::error!("failed to read engine mode: {err}");
            Json(ApiResponse {
                code: "engine_mode_failed".to_string(),
                message: err,
                data: None,
            })
        }
    }
}

pub async fn update_mode(Json(body): Json<UpdateModeRequest>) -> Json<ApiResponse<ModeDto>> {
    let state = app_state();

    let mode = body.mode.trim().to_lowercase();
    if !MODES.contains(&mode.as_str()) {
        return Json(ApiResponse {
            code: "mode_invalid".to_string(),
            message: format!("unknown proxy mode '{mode}'"),
            data: None,
        });
    }

    match state.selection.switch_mode(&mode).await {
        Ok(changed) => Json(ApiResponse {
            code: "ok".to_string(),
            message: if changed { "switched" } else { "unchanged" }.to_string(),
            data: Some(ModeDto { mode }),
        }),
        Err(err) => {
            tracing::error!("failed to switch proxy mode to '{mode}': {err}");
            Json(ApiResponse {
                code: "engine_mode_failed".to_string(),
                message: err,
                data: None,
            })
        }
    }
}

#[derive(Serialize)]
pub struct ConnectionsDto {
    pub total: usize,
    pub connections: Vec<Connection>,
}

pub async fn list_connections() -> Json<ApiResponse<ConnectionsDto>> {
    let state = app_state();

    match state.engine.connections().await {
        Ok(connections) => Json(ApiResponse {
            code: "ok".to_string(),
            message: "success".to_string(),
            data: Some(ConnectionsDto {
                total: connections.len(),
                connections,
            }),
        }),
        Err(err) => {
            tracing::error!("failed to list connections: {err}");
            Json(ApiResponse {
                code: "engine_connections_failed".to_string(),
                message: err,
                data: None,
            })
        }
    }
}

pub async fn close_connection(Path(id): Path<String>) -> Json<ApiResponse<serde_json::Value>> {
    let state = app_state();

    match state.engine.delete_connection(&id).await {
        Ok(()) => Json(ApiResponse {
            code: "ok".to_string(),
            message: "closed".to_string(),
            data: Some(serde_json::json!({})),
        }),
        Err(err) => {
            tracing::error!("failed to close connection '{id}': {err}");
            Json(ApiResponse {
                code: "engine_connections_failed".to_string(),
                message: err,
                data: None,
            })
        }
    }
}

pub async fn close_all_connections() -> Json<ApiResponse<serde_json::Value>> {
    let state = app_state();

    match state.engine.close_all_connections().await {
        Ok(()) => Json(ApiResponse {
            code: "ok".to_string(),
            message: "closed".to_string(),
            data: Some(serde_json::json!({})),
        }),
        Err(err) => {
            tracing::error!("failed to close all connections: {err}");
            Json(ApiResponse {
                code: "engine_connections_failed".to_string(),
                message: err,
                data: None,
            })
        }
    }
}
