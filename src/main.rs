// main.rs - Binary entry point: parse config, stand up the dispatcher and
// its workers, serve the HTTP surface, shut down cleanly on Ctrl-C.

use anyhow::Context;
use clap::Parser;
use render_dispatcher::config::resolve_render_devices;
use render_dispatcher::{http, AppConfig, CliArgs, Dispatcher, MockRuntimeAdapter, RuntimeAdapter};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level)).init();

    let config = AppConfig::from_args(args).context("invalid configuration")?;
    log::info!("starting render-dispatcher with config: {config:?}");

    let devices = resolve_render_devices(&config.render_devices).context("invalid render_devices")?;

    // Real device enumeration and model loading live behind ModelRuntime,
    // out of scope here; MockRuntimeAdapter keeps the binary runnable.
    let dispatcher = Dispatcher::new(
        Arc::new(|device: &str| Arc::new(MockRuntimeAdapter::new(device)) as Arc<dyn RuntimeAdapter>),
        config.dispatcher_config(),
    );

    dispatcher
        .update_workers(&devices)
        .await
        .context("failed to start render workers")?;
    log::info!("render workers online: {devices:?}");

    let routes = http::routes(dispatcher.clone(), config.clone());
    let bind_addr = config.bind_addr;

    let shutdown_dispatcher = dispatcher.clone();
    let (_addr, server) = warp::serve(routes).bind_with_graceful_shutdown(bind_addr, async move {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("shutdown signal received, draining in-flight tasks");
        shutdown_dispatcher.signal_shutdown();
    });

    log::info!("listening on {bind_addr}");
    server.await;

    log::info!("render-dispatcher stopped");
    Ok(())
}
