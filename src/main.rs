use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use coderun::config::CliArgs;
use coderun::web_server::build_server;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config().context("Failed to load configuration")?;

    let scratch_root = config.sandbox.scratch_root();
    std::fs::create_dir_all(&scratch_root).with_context(|| {
        format!(
            "Failed to create scratch directory {}",
            scratch_root.display()
        )
    })?;

    if config.sandbox.allow_exec {
        log::warn!(
            "Code execution ENABLED: snippets run as plain processes under {}, limited only by a {} ms timeout and a {} byte output cap",
            scratch_root.display(),
            config.sandbox.timeout_ms,
            config.sandbox.max_output_bytes
        );
    } else {
        log::info!("Code execution disabled, runs will return mock responses");
    }

    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let server =
        build_server(config, shutdown_token.clone()).context("Failed to build server")?;

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
    }

    // 1. Kill in-flight runs so their requests can finish
    shutdown_token.cancel();

    // 2. Shutdown actix-web server gracefully
    server_handle.stop(true).await;

    log::info!("Shutdown complete");
    Ok(())
}
