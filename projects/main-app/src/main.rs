mod app_state;
mod camera;
mod config;
mod core;
mod settings;
mod watcher;
mod web;

use std::sync::Arc;

use app_state::AppState;
use config::AppConfig;
use tracing::info;
use tracing_appender::rolling;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let config = AppConfig::from_env()?;

    tokio::fs::create_dir_all(&config.log_dir).await?;
    let file_appender = rolling::daily(&config.log_dir, "raspicam.log");
    let (non_blocking, _log_guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_max_level(tracing::Level::INFO)
        .init();

    tokio::fs::create_dir_all(&config.captures_dir).await?;

    let state = Arc::new(AppState::new(config.clone()));
    let app = web::routes::build_router(state.clone());

    {
        let ready_state = state.clone();
        tokio::spawn(async move {
            ready_state.control.wait_idle().await;
            let status = ready_state.control.status();
            info!(
                stream_running = status.stream_running,
                last_error = status.last_error.as_deref().unwrap_or(""),
                "initial stream start finished"
            );
        });
    }

    info!(
        "{} listening on {} (captures: {})",
        config.app_name,
        config.bind_addr,
        config.captures_dir.display()
    );
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
