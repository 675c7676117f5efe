use std::path::PathBuf;
use std::sync::RwLock;

use axum::{extract::Path, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app::app_state;
use crate::{ApiResponse, AppEvent, RefreshReason};

pub const DEFAULT_TEST_URL: &str = "https://www.gstatic.com/generate_204";
pub const DEFAULT_TEST_TIMEOUT_MS: u32 = 5000;
/// 批量测速时允许同时在途的探测数量上限（可配置）。
pub const DEFAULT_TEST_CONCURRENCY: usize = 10;

#[derive(Serialize, Deserialize, Clone)]
pub struct EngineConfig {
    /// 引擎控制接口的 Unix Socket 路径。
    #[serde(default = "default_engine_socket")]
    pub socket_path: String,
    /// 控制接口的 Bearer 密钥，空字符串表示无鉴权。
    #[serde(default)]
    pub secret: String,
}

fn default_engine_socket() -> String {
    "/tmp/mihomo/control.sock".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            socket_path: default_engine_socket(),
            secret: String::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone)]
pub struct DelayTestConfig {
    #[serde(default = "default_test_url")]
    pub url: String,
    #[serde(default = "default_test_timeout")]
    pub timeout_ms: u32,
    #[serde(default = "default_test_concurrency")]
    pub concurrency: usize,
}

fn default_test_url() -> String {
    DEFAULT_TEST_URL.to_string()
}

fn default_test_timeout() -> u32 {
    DEFAULT_TEST_TIMEOUT_MS
}

fn default_test_concurrency() -> usize {
    DEFAULT_TEST_CONCURRENCY
}

impl Default for DelayTestConfig {
    fn default() -> Self {
        DelayTestConfig {
            url: default_test_url(),
            timeout_ms: default_test_timeout(),
            concurrency: default_test_concurrency(),
        }
    }
}

/// 延迟颜色分档阈值：低于 favorable_ms 为优，低于等于 acceptable_ms 为可接受，
/// 其余为差。超时单独成档。
#[derive(Serialize, Deserialize, Clone, Copy)]
pub struct DelayThresholds {
    #[serde(default = "default_favorable_ms")]
    pub favorable_ms: u32,
    #[serde(default = "default_acceptable_ms")]
    pub acceptable_ms: u32,
}

fn default_favorable_ms() -> u32 {
    100
}

fn default_acceptable_ms() -> u32 {
    500
}

impl Default for DelayThresholds {
    fn default() -> Self {
        DelayThresholds {
            favorable_ms: default_favorable_ms(),
            acceptable_ms: default_acceptable_ms(),
        }
    }
}

/// 周期性全量测速任务的配置。
#[derive(Serialize, Deserialize, Clone, Default)]
pub struct AutoCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub interval_minutes: u64,
    #[serde(default)]
    pub last_run_time: Option<String>,
    #[serde(default)]
    pub last_run_status: Option<String>,
    #[serde(default)]
    pub last_run_message: Option<String>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct ProfileMeta {
    pub id: String,
    pub name: String,
}

/// 记录某个代理组当前选择的节点。
#[derive(Serialize, Deserialize, Clone, Default, Debug, PartialEq, Eq)]
pub struct SelectionRecord {
    pub group: String,
    pub node: String,
}

/// 某个配置档案下的代理选择快照；每个组至多保留一条记录。
#[derive(Serialize, Deserialize, Clone, Default)]
pub struct SelectionSet {
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub selections: Vec<SelectionRecord>,
}

#[derive(Serialize, Deserialize, Default, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub profiles: Vec<ProfileMeta>,
    #[serde(default)]
    pub active_profile_id: Option<String>,
    /// 切换节点 / 切换模式时，是否自动关闭经由旧节点的连接。
    #[serde(default)]
    pub auto_close_connection: bool,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub delay_test: DelayTestConfig,
    #[serde(default)]
    pub delay_thresholds: DelayThresholds,
    #[serde(default)]
    pub delay_auto_check: Option<AutoCheckConfig>,
    /// 针对不同配置档案保存的代理选择快照。
    #[serde(default)]
    pub proxy_selections: Vec<SelectionSet>,
}

fn apply_app_config_defaults(config: &mut AppConfig) {
    // 默认提供一个关闭状态的周期测速任务，便于前端直接展示开关。
    if config.delay_auto_check.is_none() {
        config.delay_auto_check = Some(AutoCheckConfig {
            enabled: false,
            interval_minutes: 30,
            last_run_time: None,
            last_run_status: None,
            last_run_message: None,
        });
    }
}

fn app_config_path(root: &PathBuf) -> PathBuf {
    let mut path = root.clone();
    path.push("config");
    path.push("app.json");
    path
}

/// 全局配置的内存持有者。启动时加载一次磁盘内容，之后内存为唯一真相源，
/// 每次修改后尝试写回磁盘；写盘失败时保留内存修改并返回错误，由调用方记录。
pub struct ConfigStore {
    data_root: PathBuf,
    config: RwLock<AppConfig>,
}

impl ConfigStore {
    pub fn load(root: &PathBuf) -> Result<Self, String> {
        use std::fs;
        use std::io::ErrorKind;

        let path = app_config_path(root);
        let config = match fs::read_to_string(&path) {
            Ok(content) => {
                let mut config: AppConfig = serde_json::from_str(&content).map_err(|err| {
                    format!("failed to parse app.json at {}: {err}", path.display())
                })?;
                apply_app_config_defaults(&mut config);
                config
            }
            Err(err) => {
                if err.kind() == ErrorKind::NotFound {
                    let mut config = AppConfig::default();
                    apply_app_config_defaults(&mut config);
                    config
                } else {
                    return Err(format!(
                        "failed to read app.json at {}: {err}",
                        path.display()
                    ));
                }
            }
        };

        Ok(ConfigStore {
            data_root: root.clone(),
            config: RwLock::new(config),
        })
    }

    pub fn data_root(&self) -> &PathBuf {
        &self.data_root
    }

    /// 读取当前配置的只读快照。
    pub fn snapshot(&self) -> AppConfig {
        let guard = self.config.read().expect("app config rwlock poisoned");
        guard.clone()
    }

    /// 对配置进行一次原子更新，并将结果持久化到磁盘。
    ///
    /// - `f` 在持有写锁的情况下被调用，可以对配置做任意修改。
    /// - 磁盘写入失败时，内存中的修改仍然保留（以内存为准），返回 Err。
    pub fn with_mut<F, R>(&self, f: F) -> Result<R, String>
    where
        F: FnOnce(&mut AppConfig) -> R,
    {
        let mut guard = self.config.write().expect("app config rwlock poisoned");

        let result = f(&mut guard);

        self.save(&guard)?;

        Ok(result)
    }

    fn save(&self, config: &AppConfig) -> Result<(), String> {
        use std::fs;

        let path = app_config_path(&self.data_root);
        let parent = path
            .parent()
            .ok_or_else(|| format!("invalid app.json path: {}", path.display()))?;

        if let Err(err) = fs::create_dir_all(parent) {
            return Err(format!(
                "failed to create config directory at {}: {err}",
                parent.display()
            ));
        }

        let content = serde_json::to_string_pretty(config)
            .map_err(|err| format!("failed to serialize app config: {err}"))?;

        fs::write(&path, content)
            .map_err(|err| format!("failed to write app.json at {}: {err}", path.display()))
    }

    /// 在当前活跃档案下更新指定代理组的已选节点并持久化。
    /// 同一个组已有记录时覆盖，否则追加（每组至多一条）。
    pub fn update_selection(&self, group: &str, node: &str) -> Result<(), String> {
        self.with_mut(|config| {
            let profile_id = config.active_profile_id.clone();

            let set = match config
                .proxy_selections
                .iter_mut()
                .position(|s| s.profile_id == profile_id)
            {
                Some(idx) => &mut config.proxy_selections[idx],
                None => {
                    config.proxy_selections.push(SelectionSet {
                        profile_id,
                        selections: Vec::new(),
                    });
                    config
                        .proxy_selections
                        .last_mut()
                        .expect("selection set just pushed must exist")
                }
            };

            if let Some(rec) = set.selections.iter_mut().find(|r| r.group == group) {
                rec.node = node.to_string();
            } else {
                set.selections.push(SelectionRecord {
                    group: group.to_string(),
                    node: node.to_string(),
                });
            }
        })
    }

    /// 读取当前活跃档案下保存的代理选择快照；没有记录时返回空列表。
    pub fn selections_for_active_profile(&self) -> Vec<SelectionRecord> {
        let cfg = self.snapshot();
        let profile_id = cfg.active_profile_id.clone();

        cfg.proxy_selections
            .into_iter()
            .find(|s| s.profile_id == profile_id)
            .map(|s| s.selections)
            .unwrap_or_default()
    }
}

#[derive(Serialize)]
pub struct SettingsDto {
    pub auto_close_connection: bool,
    pub delay_test: DelayTestConfig,
    pub delay_thresholds: DelayThresholds,
    pub delay_auto_check: Option<AutoCheckConfig>,
}

#[derive(Deserialize)]
pub struct UpdateSettingsRequest {
    #[serde(default)]
    pub auto_close_connection: Option<bool>,
    #[serde(default)]
    pub delay_test: Option<DelayTestConfig>,
    #[serde(default)]
    pub delay_thresholds: Option<DelayThresholds>,
    #[serde(default)]
    pub delay_auto_check: Option<AutoCheckConfig>,
}

pub async fn get_settings() -> Json<ApiResponse<SettingsDto>> {
    let config = app_state().config.snapshot();

    Json(ApiResponse {
        code: "ok".to_string(),
        message: "success".to_string(),
        data: Some(SettingsDto {
            auto_close_connection: config.auto_close_connection,
            delay_test: config.delay_test,
            delay_thresholds: config.delay_thresholds,
            delay_auto_check: config.delay_auto_check,
        }),
    })
}

pub async fn update_settings(
    Json(body): Json<UpdateSettingsRequest>,
) -> Json<ApiResponse<SettingsDto>> {
    let state = app_state();

    let result = state.config.with_mut(|config| {
        if let Some(auto_close) = body.auto_close_connection {
            config.auto_close_connection = auto_close;
        }
        if let Some(delay_test) = body.delay_test {
            config.delay_test = delay_test;
        }
        if let Some(thresholds) = body.delay_thresholds {
            config.delay_thresholds = thresholds;
        }
        if let Some(auto_check) = body.delay_auto_check {
            config.delay_auto_check = Some(auto_check);
        }
    });

    if let Err(err) = result {
        tracing::error!("failed to persist settings update: {err}");
        return Json(ApiResponse {
            code: "settings_save_failed".to_string(),
            message: err,
            data: None,
        });
    }

    let config = state.config.snapshot();
    Json(ApiResponse {
        code: "ok".to_string(),
        message: "updated".to_string(),
        data: Some(SettingsDto {
            auto_close_connection: config.auto_close_connection,
            delay_test: config.delay_test,
            delay_thresholds: config.delay_thresholds,
            delay_auto_check: config.delay_auto_check,
        }),
    })
}

#[derive(Serialize)]
pub struct ProfileDto {
    pub id: String,
    pub name: String,
    pub is_active: bool,
}

#[derive(Serialize)]
pub struct ProfileListResponse {
    pub profiles: Vec<ProfileDto>,
}

#[derive(Deserialize)]
pub struct CreateProfileRequest {
    pub name: String,
}

pub async fn list_profiles() -> Json<ApiResponse<ProfileListResponse>> {
    let config = app_state().config.snapshot();
    let active_id = config.active_profile_id.as_deref();

    let profiles = config
        .profiles
        .iter()
        .map(|p| ProfileDto {
            id: p.id.clone(),
            name: p.name.clone(),
            is_active: active_id == Some(p.id.as_str()),
        })
        .collect();

    Json(ApiResponse {
        code: "ok".to_string(),
        message: "success".to_string(),
        data: Some(ProfileListResponse { profiles }),
    })
}

pub async fn create_profile(
    Json(body): Json<CreateProfileRequest>,
) -> Json<ApiResponse<ProfileDto>> {
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Json(ApiResponse {
            code: "profile_invalid_name".to_string(),
            message: "profile name cannot be empty".to_string(),
            data: None,
        });
    }

    let id = Uuid::new_v4().to_string();
    let profile = ProfileMeta {
        id: id.clone(),
        name: name.clone(),
    };

    let result = app_state().config.with_mut(|config| {
        config.profiles.push(profile);
    });

    if let Err(err) = result {
        tracing::error!("failed to persist new profile '{name}': {err}");
        return Json(ApiResponse {
            code: "profile_save_failed".to_string(),
            message: err,
            data: None,
        });
    }

    Json(ApiResponse {
        code: "ok".to_string(),
        message: "created".to_string(),
        data: Some(ProfileDto {
            id,
            name,
            is_active: false,
        }),
    })
}

/// 切换活跃档案，并按该档案保存的选择快照恢复各代理组的已选节点。
pub async fn activate_profile(Path(id): Path<String>) -> Json<ApiResponse<serde_json::Value>> {
    let state = app_state();

    let exists = state
        .config
        .snapshot()
        .profiles
        .iter()
        .any(|p| p.id == id);
    if !exists {
        return Json(ApiResponse {
            code: "profile_not_found".to_string(),
            message: format!("profile '{id}' not found"),
            data: None,
        });
    }

    if let Err(err) = state.config.with_mut(|config| {
        config.active_profile_id = Some(id.clone());
    }) {
        tracing::error!("failed to persist active profile '{id}': {err}");
        return Json(ApiResponse {
            code: "profile_save_failed".to_string(),
            message: err,
            data: None,
        });
    }

    let applied = match state.selection.apply_saved_selections().await {
        Ok(count) => count,
        Err(err) => {
            tracing::warn!("failed to restore saved selections for profile '{id}': {err}");
            0
        }
    };

    let event = AppEvent::ProxiesChanged {
        reason: RefreshReason::SelectionsRestored,
        timestamp: crate::app::current_timestamp(),
    };
    if let Err(err) = state.events_tx.send(event) {
        tracing::debug!("failed to broadcast AppEvent::ProxiesChanged: {err}");
    }

    Json(ApiResponse {
        code: "ok".to_string(),
        message: "activated".to_string(),
        data: Some(serde_json::json!({ "applied_selections": applied })),
    })
}
