use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::app::{app_state, current_timestamp};
use crate::config::AutoCheckConfig;
use crate::delay::CheckOptions;
use crate::render_list::{groups_for_mode, PanelMode};

static AUTO_CHECK_RUNNING: AtomicBool = AtomicBool::new(false);

/// 防止同一任务的两次执行重叠的运行锁。
struct TaskLockGuard<'a> {
    flag: &'a AtomicBool,
    acquired: bool,
}

impl<'a> TaskLockGuard<'a> {
    fn lock(flag: &'a AtomicBool) -> Self {
        let acquired = flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        TaskLockGuard { flag, acquired }
    }

    fn is_acquired(&self) -> bool {
        self.acquired
    }
}

impl<'a> Drop for TaskLockGuard<'a> {
    fn drop(&mut self) {
        if self.acquired {
            self.flag.store(false, Ordering::Release);
        }
    }
}

enum TaskRunState {
    Success(String),
    Skipped(String),
    Failed(String),
}

/// 对规则模式下展示的每个组做一次批量测速。
/// 组与组之间串行执行，组内并发已由 DelayManager 的上限约束。
async fn execute_auto_check() -> TaskRunState {
    let guard = TaskLockGuard::lock(&AUTO_CHECK_RUNNING);
    if !guard.is_acquired() {
        return TaskRunState::Skipped("previous run still in progress".to_string());
    }

    let state = app_state();

    let snapshot = match state.engine.fetch_snapshot().await {
        Ok(s) => s,
        Err(err) => {
            return TaskRunState::Failed(format!("failed to fetch proxies: {err}"));
        }
    };

    let config = state.config.snapshot();
    let opts = CheckOptions {
        timeout_ms: Some(config.delay_test.timeout_ms),
        concurrency: Some(config.delay_test.concurrency),
        ..CheckOptions::default()
    };

    let groups = groups_for_mode(&snapshot, PanelMode::Rule);
    let total = groups.len();
    for group in groups {
        state.delay.check_group(group, &opts).await;
    }

    TaskRunState::Success(format!("checked {total} groups"))
}

fn record_run_state(run_state: &TaskRunState) {
    let state = app_state();

    let result = state.config.with_mut(|config| {
        let task = config
            .delay_auto_check
            .get_or_insert_with(AutoCheckConfig::default);
        task.last_run_time = Some(current_timestamp());

        match run_state {
            TaskRunState::Success(msg) => {
                task.last_run_status = Some("ok".to_string());
                task.last_run_message = Some(msg.clone());
            }
            TaskRunState::Skipped(msg) => {
                task.last_run_status = Some("skipped".to_string());
                task.last_run_message = Some(msg.clone());
            }
            TaskRunState::Failed(msg) => {
                task.last_run_status = Some("error".to_string());
                task.last_run_message = Some(msg.clone());
            }
        }
    });

    if let Err(err) = result {
        tracing::error!("auto check failed to save app config after run: {err}");
    }
}

async fn run_auto_check_loop() {
    loop {
        let task_cfg = app_state().config.snapshot().delay_auto_check;

        let Some(task_cfg) = task_cfg else {
            // 未配置任务：定期重试读取配置。
            tokio::time::sleep(Duration::from_secs(300)).await;
            continue;
        };

        if !task_cfg.enabled || task_cfg.interval_minutes == 0 {
            tokio::time::sleep(Duration::from_secs(300)).await;
            continue;
        }

        let interval = Duration::from_secs(task_cfg.interval_minutes * 60);
        tracing::debug!("auto delay check sleeping for {:?}", interval);
        tokio::time::sleep(interval).await;

        // 睡眠期间任务可能已被关闭，执行前再确认一次。
        let still_enabled = app_state()
            .config
            .snapshot()
            .delay_auto_check
            .map(|t| t.enabled)
            .unwrap_or(false);
        if !still_enabled {
            continue;
        }

        let run_state = execute_auto_check().await;
        match &run_state {
            TaskRunState::Success(msg) => {
                tracing::info!("auto delay check finished: {msg}");
            }
            TaskRunState::Skipped(msg) => {
                tracing::info!("auto delay check skipped: {msg}");
            }
            TaskRunState::Failed(msg) => {
                tracing::error!("auto delay check failed: {msg}");
            }
        }
        record_run_state(&run_state);
    }
}

/// 启动后台周期性测速任务循环。
pub fn start_scheduler() {
    tokio::spawn(run_auto_check_loop());
}
