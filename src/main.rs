//! AI Book Generator - Rust Backend
//!
//! 使用 axum 框架构建的后端服务，提供图书生成编排与进度推送。

use anyhow::Context;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod error;
mod llm;
mod services;
mod state;
mod utils;

use api::create_api_routes;
use config::get_config;
use services::generation::{default_checkpoint_root, CheckpointStore};
use state::create_shared_state;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bookgen_rs=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting AI Book Generator backend...");

    // 初始化断点存储
    let app_config = get_config();
    let checkpoints = Arc::new(CheckpointStore::new(default_checkpoint_root(
        &app_config.data_dir(),
    )));
    checkpoints
        .initialize()
        .await
        .context("初始化断点存储失败")?;

    // 创建共享状态
    let state = create_shared_state(checkpoints);

    // 配置 CORS（允许所有来源，前端本地开发用）
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // 构建路由
    let app = Router::new()
        .merge(create_api_routes(Arc::clone(&state)))
        .layer(cors);

    // 绑定地址
    let addr = SocketAddr::from(([127, 0, 0, 1], 8765));
    info!("Server listening on: {}", addr);

    // 启动服务器
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听地址失败")?;
    axum::serve(listener, app).await.context("服务器异常退出")?;

    Ok(())
}
