use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::app::{app_state, current_timestamp};
use crate::delay::{DelayValue, WatchHandle};
use crate::AppEvent;

/// 客户端通过 WebSocket 下发的指令：订阅 / 退订某个 (节点, 组) 的延迟更新。
#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientCommand {
    Watch { proxy: String, group: String },
    Unwatch { proxy: String, group: String },
}

#[derive(Serialize)]
struct DelayUpdateMsg {
    #[serde(rename = "type")]
    kind: &'static str,
    proxy: String,
    group: String,
    delay: DelayValue,
}

pub async fn events_ws(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(handle_socket)
}

async fn handle_socket(mut socket: WebSocket) {
    let state = app_state();
    let mut rx = state.events_tx.subscribe();

    // 本连接订阅的延迟更新经由这条通道汇入发送循环。
    let (delay_tx, mut delay_rx) = mpsc::unbounded_channel::<DelayUpdateMsg>();

    // 订阅句柄按键位保存，连接关闭时统一 dispose。
    // 不及时清理的话，连接断开后完成的探测会通知到一个已经不存在的观察者。
    let mut watches: HashMap<(String, String), WatchHandle> = HashMap::new();

    // 1. 新连接先收到一次当前运行模式，便于前端初始化。
    if let Ok(mode) = state.engine.current_mode().await {
        let event = AppEvent::ModeChanged {
            mode,
            timestamp: current_timestamp(),
        };
        if send_event(&mut socket, &event).await.is_err() {
            return;
        }
    }

    // 2. 持续转发：后端广播的 AppEvent、已订阅键位的延迟更新、客户端指令。
    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_command(&text, &mut watches, &delay_tx);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // 其余消息类型仅作为 keep-alive/心跳
                    }
                    Some(Err(err)) => {
                        tracing::debug!("websocket receive error: {err}");
                        break;
                    }
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(ev) => {
                        if send_event(&mut socket, &ev).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!("websocket broadcast channel closed: {err}");
                        break;
                    }
                }
            }
            update = delay_rx.recv() => {
                // 发送端持有在本函数栈上，通道不会先于循环关闭。
                if let Some(update) = update {
                    if send_json(&mut socket, &update).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    for (_, handle) in watches.drain() {
        state.delay.dispose(handle);
    }
}

fn handle_client_command(
    text: &str,
    watches: &mut HashMap<(String, String), WatchHandle>,
    delay_tx: &mpsc::UnboundedSender<DelayUpdateMsg>,
) {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(c) => c,
        Err(err) => {
            tracing::debug!("ignoring malformed websocket command: {err}");
            return;
        }
    };

    let state = app_state();
    match command {
        ClientCommand::Watch { proxy, group } => {
            let tx = delay_tx.clone();
            let (cb_proxy, cb_group) = (proxy.clone(), group.clone());
            let handle = state.delay.watch(
                &proxy,
                &group,
                Box::new(move |value| {
                    let _ = tx.send(DelayUpdateMsg {
                        kind: "delay_update",
                        proxy: cb_proxy.clone(),
                        group: cb_group.clone(),
                        delay: value,
                    });
                }),
            );
            // 同键位重复 watch 时旧句柄已被注册表替换，直接丢弃即可。
            watches.insert((proxy, group), handle);
        }
        ClientCommand::Unwatch { proxy, group } => {
            if let Some(handle) = watches.remove(&(proxy, group)) {
                state.delay.dispose(handle);
            }
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &AppEvent) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(t) => t,
        Err(err) => {
            tracing::error!("failed to serialize AppEvent for websocket: {err}");
            return Ok(());
        }
    };

    if socket.send(Message::Text(text)).await.is_err() {
        return Err(());
    }

    Ok(())
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, payload: &T) -> Result<(), ()> {
    let text = match serde_json::to_string(payload) {
        Ok(t) => t,
        Err(err) => {
            tracing::error!("failed to serialize websocket payload: {err}");
            return Ok(());
        }
    };

    if socket.send(Message::Text(text)).await.is_err() {
        return Err(());
    }

    Ok(())
}
