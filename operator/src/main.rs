pub use controller::*;
use clap::Parser;
use common::{
    Reason,
    context::{incluster_config, inferred_config},
};
use std::process;
use tracing_subscriber::{EnvFilter, Layer, Registry, prelude::*};

use actix_web::{App, HttpRequest, HttpResponse, HttpServer, Responder, get, middleware, web::Data};

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

/// Decides how to reach the apiserver, exits when it cannot
async fn load_config(params: &Parameters) -> kube::Config {
    match incluster_config() {
        Ok(config) => config,
        Err(e @ Error::EnvVarsMissing(_)) if params.allow_out_of_cluster => {
            tracing::warn!(reason = %Reason::EnvVarsMissing, "{e}, using the local configuration");
            match inferred_config().await {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!(reason = %Reason::InClusterConfigError, "{e}");
                    process::exit(1)
                }
            }
        }
        Err(e @ Error::EnvVarsMissing(_)) => {
            tracing::error!(
                reason = %Reason::EnvVarsMissing,
                "{e}. Ensure the container is running inside Kubernetes."
            );
            process::exit(1)
        }
        Err(e) => {
            tracing::error!(reason = %Reason::InClusterConfigError, "{e}");
            process::exit(1)
        }
    }
}

#[tokio::main]
async fn main() {
    let params = Parameters::parse();

    // Setup tracing layers
    let logger = if params.json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    let collector = Registry::default().with(logger).with(env_filter);

    // Initialize tracing
    tracing::subscriber::set_global_default(collector).unwrap();

    let config = load_config(&params).await;
    // Start kubernetes controller
    let (manager, controller) = match Manager::new(&params, config).await {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("Cannot watch PersistentVolumeClaims: {e}");
            process::exit(1)
        }
    };

    // Start web server
    let server = match HttpServer::new(move || {
        App::new()
            .app_data(Data::new(manager.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(params.listen.as_str())
    {
        Ok(s) => s.shutdown_timeout(5),
        Err(e) => {
            tracing::error!("Can not bind to {}: {e}", params.listen);
            process::exit(1)
        }
    };

    tokio::select! {
        _ = controller => tracing::warn!("PersistentVolumeClaim controller exited"),
        _ = server.run() => tracing::info!("actix exited"),
    }
}
