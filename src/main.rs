use axum::{
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use mime_guess::mime;
use rust_embed::RustEmbed;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

mod app;
mod config;
mod delay;
mod engine;
mod logs;
mod render_list;
mod scheduler;
mod selection;
mod ws;

use crate::app::AppState;
use crate::config::ConfigStore;
use crate::delay::DelayManager;
use crate::engine::{EngineApi, EngineClient};
use crate::selection::SelectionCoordinator;

#[derive(RustEmbed)]
#[folder = "web/dist"]
struct Assets;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
pub struct ApiResponse<T>
where
    T: Serialize,
{
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

/// 对应“是什么触发了组状态刷新”的高层原因，
/// 便于前端在日志或事件流中做区分。
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
#[serde(rename_all = "snake_case")]
pub enum RefreshReason {
    GroupCheckFinished,
    SelectionChanged,
    SelectionsRestored,
}

/// 后台向前端广播的应用级事件模型，经由 WebSocket 推送。
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    ProxiesChanged {
        reason: RefreshReason,
        timestamp: String,
    },
    ModeChanged {
        mode: String,
        timestamp: String,
    },
}

#[tokio::main]
async fn main() {
    let data_root = app::data_root();
    init_tracing(&data_root);

    // 启动时从磁盘加载 app.json，失败则直接退出进程。
    let config = match ConfigStore::load(&data_root) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!("{err}");
            std::process::exit(1);
        }
    };

    // 全局事件广播通道，WebSocket 客户端经由它收到状态变更。
    let (events_tx, _events_rx) = tokio::sync::broadcast::channel(128);

    let engine_config = config.snapshot().engine;
    let engine: Arc<dyn EngineApi> = Arc::new(EngineClient::new(&engine_config));

    let delay = DelayManager::new(
        engine.clone(),
        events_tx.clone(),
        config.snapshot().delay_test,
    );
    let selection = SelectionCoordinator::new(engine.clone(), config.clone(), events_tx.clone());

    let state = AppState {
        data_root: data_root.clone(),
        config,
        engine,
        delay,
        selection,
        events_tx,
    };

    if let Err(err) = app::init_data_dirs(&data_root) {
        tracing::error!(
            "failed to initialize data directories at {}: {err}",
            data_root.display()
        );
    } else {
        tracing::info!("data directories ready at {}", data_root.display());
    }

    if app::init_app_state(state).is_err() {
        tracing::error!("failed to set global application state");
        return;
    }

    // 启动后台周期性测速任务。
    scheduler::start_scheduler();

    // 按当前档案保存的选择历史恢复各代理组的已选节点。
    // 放到后台任务中执行，内部会在引擎尚未就绪时重试几次，
    // 避免在路由器刚开机、引擎还在启动时阻塞 Web 服务。
    tokio::spawn(restore_saved_selections());

    let app = build_router();

    let addr = app::server_addr_from_env();
    tracing::info!("starting switchboard server at http://{addr}");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!("failed to bind to {addr}: {err}");
            return;
        }
    };

    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!("server error: {err}");
    }
}

async fn restore_saved_selections() {
    let state = app::app_state();

    for attempt in 1..=6 {
        match state.selection.apply_saved_selections().await {
            Ok(applied) => {
                if applied > 0 {
                    let event = AppEvent::ProxiesChanged {
                        reason: RefreshReason::SelectionsRestored,
                        timestamp: app::current_timestamp(),
                    };
                    if let Err(err) = state.events_tx.send(event) {
                        tracing::debug!("failed to broadcast AppEvent::ProxiesChanged: {err}");
                    }
                }
                return;
            }
            Err(err) => {
                tracing::debug!(
                    "saved selection restore attempt {attempt} failed: {err}"
                );
                tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            }
        }
    }

    tracing::warn!("giving up restoring saved proxy selections; engine stayed unreachable");
}

fn init_tracing(data_root: &PathBuf) {
    use std::fs::{self, OpenOptions};
    use std::io::{Result as IoResult, Write};
    use tracing_subscriber::fmt::writer::MakeWriter;
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // <DATA_ROOT>/log/app.log
    let mut log_path = data_root.clone();
    log_path.push("log");
    log_path.push("app.log");

    struct FileWriter {
        path: PathBuf,
    }

    impl Write for FileWriter {
        fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }

            // 在写入前尝试进行简单日志轮转，防止单个日志文件过大。
            let _ = crate::logs::rotate_log_file(&self.path);

            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            file.write(buf)
        }

        fn flush(&mut self) -> IoResult<()> {
            Ok(())
        }
    }

    struct FileMakeWriter {
        path: PathBuf,
    }

    impl<'a> MakeWriter<'a> for FileMakeWriter {
        type Writer = FileWriter;

        fn make_writer(&'a self) -> Self::Writer {
            FileWriter {
                path: self.path.clone(),
            }
        }
    }

    fmt()
        .with_env_filter(env_filter)
        .with_writer(FileMakeWriter { path: log_path })
        .init();
}

fn build_router() -> Router {
    let api = Router::new()
        .route("/health", get(health_handler))
        .route("/proxies", get(render_list::get_proxies))
        .route(
            "/proxies/:group/locate",
            get(render_list::locate_group_now),
        )
        .route("/proxies/:group/select", post(selection::select_proxy))
        .route("/proxies/:group/delay", post(delay::test_group_delay))
        .route(
            "/proxies/:group/:node/delay",
            post(delay::test_node_delay),
        )
        .route(
            "/connections",
            get(selection::list_connections).delete(selection::close_all_connections),
        )
        .route("/connections/:id", delete(selection::close_connection))
        .route(
            "/mode",
            get(selection::get_mode).put(selection::update_mode),
        )
        .route(
            "/settings",
            get(config::get_settings).put(config::update_settings),
        )
        .route(
            "/profiles",
            get(config::list_profiles).post(config::create_profile),
        )
        .route("/profiles/:id/activate", post(config::activate_profile))
        .route("/events/ws", get(ws::events_ws));

    Router::new()
        .nest("/api", api)
        .route("/", get(static_handler))
        .route("/*path", get(static_handler))
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn static_handler(uri: Uri) -> impl IntoResponse {
    let path = uri.path().trim_start_matches('/');

    let candidate = if path.is_empty() { "index.html" } else { path };

    match asset_response(candidate) {
        Some(response) => response,
        None => {
            if !path.contains('.') {
                if let Some(response) = asset_response("index.html") {
                    return response;
                }
            }

            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .header(header::CONTENT_TYPE, mime::TEXT_PLAIN_UTF_8.as_ref())
                .body(axum::body::Body::from("404 not found"))
                .unwrap()
        }
    }
}

fn asset_response(path: &str) -> Option<Response> {
    let asset = Assets::get(path)?;

    let body = axum::body::Body::from(asset.data.into_owned());

    let mime = mime_guess::from_path(path).first_or_octet_stream();

    Some(
        Response::builder()
            .header(header::CONTENT_TYPE, mime.as_ref())
            .body(body)
            .unwrap(),
    )
}
