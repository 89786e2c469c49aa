use actix_web::{App, HttpServer, dev::Server, middleware, web};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::routes::{json_error_handler, run_code_handler};
use crate::sandbox::ProcessRunner;

/// Builds the HTTP server; `shutdown` is handed to every run so in-flight
/// children are killed when it is cancelled
pub fn build_server(config: Config, shutdown: CancellationToken) -> std::io::Result<Server> {
    let Config {
        server: server_config,
        sandbox: sandbox_config,
        auth: auth_config,
    } = config;

    if !auth_config.is_enabled() {
        log::warn!("No auth tokens configured, the code runner accepts anonymous requests");
    }

    let runner = web::Data::new(ProcessRunner::new(&sandbox_config));
    let settings = web::Data::new(sandbox_config);
    let auth = web::Data::new(auth_config);
    let shutdown = web::Data::new(shutdown);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(runner.clone())
            .app_data(settings.clone())
            .app_data(auth.clone())
            .app_data(shutdown.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .wrap(middleware::Logger::default())
            .service(run_code_handler)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(5000),
    ))?
    .run();

    Ok(server)
}
