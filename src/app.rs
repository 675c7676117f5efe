use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use tokio::sync::broadcast;

use crate::config::ConfigStore;
use crate::delay::DelayManager;
use crate::engine::EngineApi;
use crate::selection::SelectionCoordinator;

/// Default data root for router environments.
pub const DEFAULT_DATA_ROOT: &str = "/jffs/switchboard";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3080;

pub struct AppState {
    pub data_root: PathBuf,
    /// 全局应用配置，进程内唯一真相源（SoT）。
    /// 启动时从磁盘加载一次，之后所有读写都通过内存进行，
    /// 磁盘上的 app.json 仅作为持久化备份。
    pub config: Arc<ConfigStore>,
    /// 代理引擎控制接口客户端（Unix Socket 上的 HTTP 控制 API）。
    pub engine: Arc<dyn EngineApi>,
    /// 延迟测试编排：缓存、订阅注册表、并发上限。
    pub delay: DelayManager,
    /// 代理组选择协调：切换节点、清理旧连接、记录选择历史。
    pub selection: SelectionCoordinator,
    /// 全局事件总线，用于向 WebSocket 客户端推送应用状态变更。
    pub events_tx: broadcast::Sender<crate::AppEvent>,
}

static APP_STATE: OnceLock<AppState> = OnceLock::new();

pub fn init_app_state(state: AppState) -> Result<(), AppState> {
    APP_STATE.set(state)
}

pub fn app_state() -> &'static AppState {
    APP_STATE
        .get()
        .expect("app state is initialized before the server starts")
}

pub fn data_root() -> PathBuf {
    use std::path::Path;

    if let Some(root) = std::env::var_os("SWITCHBOARD_DATA_ROOT") {
        return PathBuf::from(root);
    }

    let jffs_root = Path::new("/jffs");
    if jffs_root.is_dir() {
        return PathBuf::from(DEFAULT_DATA_ROOT);
    }

    if let Some(home) = std::env::var_os("HOME") {
        let mut base = PathBuf::from(home);
        base.push(".local");
        base.push("share");
        base.push("switchboard");
        return base;
    }

    PathBuf::from(DEFAULT_DATA_ROOT)
}

pub fn server_addr_from_env() -> SocketAddr {
    let host = std::env::var("SWITCHBOARD_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
    let port = std::env::var("SWITCHBOARD_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);

    format!("{host}:{port}")
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))
}

pub fn init_data_dirs(root: &PathBuf) -> std::io::Result<()> {
    std::fs::create_dir_all(root)?;
    for sub in &["config", "log", "tmp"] {
        std::fs::create_dir_all(root.join(sub))?;
    }
    Ok(())
}

pub fn current_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs().to_string()
}
