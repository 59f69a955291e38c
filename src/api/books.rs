//! 图书生成 API 端点
//!
//! 提供图书生成任务的 REST API 和 WebSocket 接口

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info};

use crate::config::get_config;
use crate::error::AppError;
use crate::llm::{ChatOptions, LlmClient};
use crate::services::generation::{
    CheckpointStore, GenerationConfig, Orchestrator, Project, ProjectStatus, RetryPolicy, Session,
    SharedProject, WsGenMessage,
};
use crate::services::generation::types::{ComplexityLevel, ContentPreferences};
use crate::state::{AppState, BookTaskState};
use crate::utils::request_logger::RequestLogger;

/// 创建图书生成路由
pub fn books_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/books/generate", post(generate_book))
        .route("/api/books/cancel-all", post(cancel_all))
        .route("/api/books/:id", get(get_book))
        .route("/api/books/:id/pause", post(pause_book))
        .route("/api/books/:id/resume", post(resume_book))
        .route("/api/books/:id/cancel", post(cancel_book))
        .route("/api/books/:id/retry-failed", post(retry_failed))
        .route("/api/books/:id/assemble", post(assemble_book))
        .route("/ws/books/:id", get(ws_handler))
}

/// 生成图书请求
#[derive(Debug, Deserialize)]
pub struct GenerateBookRequest {
    /// 学习目标
    pub goal: String,
    /// 书名（默认用目标充当）
    pub title: Option<String>,
    /// 目标读者
    pub target_audience: Option<String>,
    /// 复杂度等级
    pub complexity_level: Option<ComplexityLevel>,
    /// 内容偏好
    pub preferences: Option<ContentPreferences>,
}

/// 生成图书响应
#[derive(Debug, Serialize)]
pub struct GenerateBookResponse {
    /// 项目 ID
    pub project_id: String,
}

/// 用当前配置组装一个编排器
fn build_orchestrator(checkpoints: Arc<CheckpointStore>) -> Result<Arc<Orchestrator>, AppError> {
    let config = get_config();

    if config.api_key.is_empty() {
        return Err(AppError::Config("API Key 未配置".to_string()));
    }

    let logger = Arc::new(RequestLogger::new(
        config.data_dir().join("llm_requests.jsonl"),
        1000,
    ));
    let client = LlmClient::new(&config.api_key, &config.base_url, &config.model)
        .map_err(|e| AppError::Config(e.to_string()))?
        .with_logger(logger);

    let chat_options = ChatOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    };

    Ok(Arc::new(Orchestrator::new(
        Arc::new(client),
        checkpoints,
        RetryPolicy::default(),
        GenerationConfig::default(),
        chat_options,
    )))
}

/// 后台驱动一次完整生成
///
/// 零失败跑完模块循环才自动进入汇编；暂停或存在失败模块时停下来，
/// 等用户通过 resume / retry-failed / assemble 决定下一步
async fn drive_generation(
    orchestrator: Arc<Orchestrator>,
    project: SharedProject,
    session: Session,
    include_roadmap: bool,
) {
    if include_roadmap
        && orchestrator
            .generate_roadmap(&session, &project)
            .await
            .is_err()
    {
        return;
    }

    if orchestrator
        .generate_all_modules_with_recovery(&project, &session)
        .await
        .is_err()
    {
        return;
    }

    let ready = project.read().await.status == ProjectStatus::RoadmapCompleted;
    if ready {
        if let Err(e) = orchestrator.assemble_final_book(&project, &session).await {
            error!("Assembly failed: {}", e);
        }
    }
}

/// 启动图书生成任务
async fn generate_book(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateBookRequest>,
) -> Result<Json<GenerateBookResponse>, AppError> {
    if req.goal.trim().is_empty() {
        return Err(AppError::BadRequest("学习目标不能为空".to_string()));
    }

    info!("Received book generation request: goal={}", req.goal);

    let session = Session {
        goal: req.goal.clone(),
        target_audience: req.target_audience.unwrap_or_default(),
        complexity_level: req.complexity_level.unwrap_or_default(),
        preferences: req.preferences.unwrap_or_default(),
    };

    let title = req.title.unwrap_or_else(|| req.goal.clone());
    let project = Project::new(title, req.goal);
    let project_id = project.id.clone();
    let shared: SharedProject = Arc::new(RwLock::new(project));

    let orchestrator = build_orchestrator(state.checkpoints.clone())?;

    // 创建广播通道（用于 WebSocket），保留一个接收器防止无人订阅时 send 失败
    let (tx, _keep_alive_rx) = broadcast::channel(256);
    let task_state = Arc::new(BookTaskState::new(
        shared.clone(),
        session.clone(),
        orchestrator.clone(),
        tx.clone(),
    ));
    state.tasks.insert(project_id.clone(), task_state.clone());

    // 进度转发任务：编排器通道 → WebSocket 通道，并记录重放快照
    let mut orch_rx = orchestrator.subscribe(&project_id);
    let task_id = project_id.clone();
    tokio::spawn(async move {
        let _rx_guard = _keep_alive_rx;
        loop {
            match orch_rx.recv().await {
                Ok(msg) => {
                    if let WsGenMessage::ModuleProgress { status } = &msg {
                        task_state.set_last_status(status.clone());
                    }
                    let _ = tx.send(msg.clone());
                    if matches!(msg, WsGenMessage::Completed { .. }) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("Task {} progress forwarding ended", task_id);
    });

    // 后台运行：路线图 → 模块循环 →（零失败时）汇编
    tokio::spawn(drive_generation(orchestrator, shared, session, true));

    Ok(Json(GenerateBookResponse { project_id }))
}

/// 获取项目快照
async fn get_book(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<Project>, AppError> {
    let task_state = state
        .tasks
        .get(&project_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("Project not found: {}", project_id)))?;

    let project = task_state.project.read().await.clone();
    Ok(Json(project))
}

/// 暂停生成
async fn pause_book(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let task_state = state
        .tasks
        .get(&project_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("Project not found: {}", project_id)))?;

    task_state.orchestrator.pause(&project_id).await;
    info!("Project paused: {}", project_id);

    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Generation paused"
    })))
}

/// 恢复生成：清除暂停标志并从断点继续
async fn resume_book(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let task_state = state
        .tasks
        .get(&project_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("Project not found: {}", project_id)))?;

    if task_state.orchestrator.has_active(&project_id) {
        return Err(AppError::BadRequest("任务仍在运行中".to_string()));
    }

    task_state.orchestrator.resume(&project_id).await;
    tokio::spawn(drive_generation(
        task_state.orchestrator.clone(),
        task_state.project.clone(),
        task_state.session.clone(),
        false,
    ));

    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Generation resumed"
    })))
}

/// 取消在途生成（进度保留，与暂停同语义）
async fn cancel_book(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let task_state = state
        .tasks
        .get(&project_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("Project not found: {}", project_id)))?;

    task_state.orchestrator.cancel_active(Some(&project_id));
    info!("Project cancelled: {}", project_id);

    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Generation cancelled"
    })))
}

/// 取消所有在途生成
async fn cancel_all(
    State(state): State<Arc<AppState>>,
) -> Json<serde_json::Value> {
    for entry in state.tasks.iter() {
        entry.value().orchestrator.cancel_active(Some(entry.key()));
    }

    Json(serde_json::json!({
        "success": true,
        "message": "All active generations cancelled"
    }))
}

/// 仅重试失败模块
async fn retry_failed(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let task_state = state
        .tasks
        .get(&project_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("Project not found: {}", project_id)))?;

    if task_state.orchestrator.has_active(&project_id) {
        return Err(AppError::BadRequest("任务仍在运行中".to_string()));
    }

    let orchestrator = task_state.orchestrator.clone();
    let project = task_state.project.clone();
    let session = task_state.session.clone();
    tokio::spawn(async move {
        if orchestrator
            .retry_failed_modules(&project, &session)
            .await
            .is_err()
        {
            return;
        }
        // 重试后全部成功则自动汇编
        let ready = project.read().await.status == ProjectStatus::RoadmapCompleted;
        if ready {
            if let Err(e) = orchestrator.assemble_final_book(&project, &session).await {
                error!("Assembly failed: {}", e);
            }
        }
    });

    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Retrying failed modules"
    })))
}

/// 手动触发汇编
async fn assemble_book(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let task_state = state
        .tasks
        .get(&project_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("Project not found: {}", project_id)))?;

    if task_state.orchestrator.has_active(&project_id) {
        return Err(AppError::BadRequest("任务仍在运行中".to_string()));
    }

    let orchestrator = task_state.orchestrator.clone();
    let project = task_state.project.clone();
    let session = task_state.session.clone();
    tokio::spawn(async move {
        if let Err(e) = orchestrator.assemble_final_book(&project, &session).await {
            error!("Assembly failed: {}", e);
        }
    });

    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Assembly started"
    })))
}

/// WebSocket 进度推送处理器
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, project_id))
}

/// 处理 WebSocket 连接
async fn handle_ws_connection(
    socket: axum::extract::ws::WebSocket,
    state: Arc<AppState>,
    project_id: String,
) {
    let (mut sender, mut receiver) = socket.split();

    let task_state = match state.tasks.get(&project_id) {
        Some(entry) => entry.value().clone(),
        None => {
            let msg = WsGenMessage::Error {
                message: format!("Project not found: {}", project_id),
            };
            if let Ok(json) = serde_json::to_string(&msg) {
                let _ = sender.send(axum::extract::ws::Message::Text(json)).await;
            }
            return;
        }
    };

    info!("WebSocket connection established: project_id={}", project_id);

    // 重放当前项目状态，让晚接入的前端拿到完整上下文
    {
        let project = task_state.project.read().await;
        let msg = WsGenMessage::ProjectUpdate {
            status: project.status,
            progress: project.progress,
            error: project.error.clone(),
        };
        if send_ws(&mut sender, &msg).await.is_err() {
            return;
        }
    }
    if let Some(status) = task_state.last_status() {
        if send_ws(&mut sender, &WsGenMessage::ModuleProgress { status })
            .await
            .is_err()
        {
            return;
        }
    }

    // 订阅广播通道以接收后续消息
    let mut rx = task_state.tx.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if send_ws(&mut sender, &msg).await.is_err() {
                            break;
                        }
                        // 整书完成后关闭连接；错误和暂停保持连接，等待后续操作
                        if matches!(msg, WsGenMessage::Completed { .. }) {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // 跳过延迟的消息
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }

            // 处理客户端消息（主要是 ping/pong）
            result = receiver.next() => {
                match result {
                    Some(Ok(axum::extract::ws::Message::Ping(data))) => {
                        let _ = sender.send(axum::extract::ws::Message::Pong(data)).await;
                    }
                    Some(Ok(axum::extract::ws::Message::Close(_))) | None => {
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket connection closed: project_id={}", project_id);
}

/// 序列化并发送一条 WebSocket 消息
async fn send_ws(
    sender: &mut (impl SinkExt<axum::extract::ws::Message> + Unpin),
    msg: &WsGenMessage,
) -> Result<(), ()> {
    let json = serde_json::to_string(msg).map_err(|_| ())?;
    sender
        .send(axum::extract::ws::Message::Text(json))
        .await
        .map_err(|_| ())
}
