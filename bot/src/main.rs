//! Entry point: wires config, both sqlite stores, the orchestrator, the bridge, discovery-backed
//! attachment, the registration API, and the Telegram dispatcher together (spec.md §2).

mod app_state;
mod binder;
mod config;
mod control;
mod handlers;
mod router;
mod surface;

use std::sync::Arc;
use std::time::Duration;

use bridge::StreamingBridge;
use orchestrator::{OrchestratorManager, SupervisorOptions};
use registrar::Registrar;
use store::{InstanceStore, TopicStore};
use teloxide::dispatching::Dispatcher;
use teloxide::{dptree, prelude::*};
use tracing::info;

use crate::app_state::AppState;
use crate::config::AppConfig;
use crate::surface::TelegramSurface;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ::config::load_and_apply("bot", None::<&std::path::Path>).ok();
    let _guard = ::config::init_tracing("bot");

    let app_config = AppConfig::from_env()?;
    info!(chat_id = app_config.chat_id, "starting");

    let instance_store = Arc::new(InstanceStore::new(&app_config.instance_db_path)?);
    let topic_store = Arc::new(TopicStore::new(&app_config.topic_db_path)?);

    let supervisor_opts = SupervisorOptions {
        agent_binary: app_config.agent_binary.clone(),
        startup_timeout: Duration::from_secs(30),
        health_check_interval: Duration::from_secs(5),
        idle_timeout: app_config.idle_timeout,
        restart_delay: app_config.restart_delay,
        max_restart_attempts: app_config.max_restart_attempts,
    };
    let orchestrator = OrchestratorManager::spawn(
        instance_store,
        app_config.orchestrator_start_port,
        app_config.orchestrator_pool_size,
        supervisor_opts,
    );
    let recovery = orchestrator.recover().await;
    info!(recovered = recovery.recovered, failed = recovery.failed, "instance recovery complete");

    let bot = Bot::new(app_config.telegram_token.clone());
    let surface = Arc::new(TelegramSurface::new(bot.clone()));
    let bridge = Arc::new(StreamingBridge::new(surface.clone()));
    let registrar = Arc::new(Registrar::new(
        topic_store.clone(),
        bridge.clone(),
        surface.clone(),
        app_config.chat_id,
        app_config.registration_api_key.clone(),
    ));

    let state = AppState::new(app_config.clone(), orchestrator, topic_store, bridge, surface, registrar.clone());
    binder::spawn(state.clone());

    let api_listener = tokio::net::TcpListener::bind(&app_config.registration_api_bind).await?;
    let api_router = registrar::router(registrar);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(api_listener, api_router).await {
            tracing::error!(error = %e, "registration API server stopped");
        }
    });

    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback_query))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    Ok(())
}
