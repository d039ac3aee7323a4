pub use controller::*;
use controller::config::Settings;
use tracing_subscriber::{EnvFilter, Registry, prelude::*};

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer, Responder, get, middleware,
    web::Data,
};

#[get("/metrics")]
async fn metrics(c: Data<Manager>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    HttpResponse::Ok()
        .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
        .body(metrics)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<Manager>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing layers
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| Error::Other(format!("invalid log filter: {e}")))?;
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f == "json");
    let collector = Registry::default()
        .with(tracing_opentelemetry::layer())
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .with(env_filter);

    // Initialize tracing
    tracing::subscriber::set_global_default(collector)
        .map_err(|e| Error::Other(format!("cannot install the tracing subscriber: {e}")))?;

    let settings = Settings::from_env()?;
    let listen_addr = settings.listen_addr.clone();
    // Start kubernetes controllers
    let (manager, controllers) = Manager::new(settings).await?;

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(manager.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&listen_addr)
    .map_err(|e| Error::Other(format!("can not bind to {listen_addr}: {e}")))?
    .shutdown_timeout(5);

    tokio::select! {
        _ = controllers => tracing::warn!("controllers exited"),
        _ = server.run() => tracing::info!("actix exited"),
    }
    Ok(())
}
