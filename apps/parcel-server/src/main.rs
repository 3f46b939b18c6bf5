use std::net::SocketAddr;
use std::time::Duration;

use parcel_core::ParcelConfig;
use tracing::{error, info, warn};

mod access_log;
mod api;
mod app_state;
mod assets;
mod bootstrap;
mod dispatch;
mod error;
mod leases;
mod notify;
mod responses;
mod router;
mod session;
#[cfg(test)]
mod test_support;

pub(crate) use app_state::AppState;

#[tokio::main]
async fn main() {
    parcel_otel::init();

    let config = match ParcelConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    let addr = match config.socket_addr() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };

    let bootstrap::BootstrapOutput {
        router,
        state,
        background_tasks,
    } = match bootstrap::build(&config).await {
        Ok(out) => out,
        Err(err) => {
            error!("startup failed: {err:#}");
            std::process::exit(1);
        }
    };

    let app = bootstrap::attach_global_layers(bootstrap::attach_http_layers(
        bootstrap::attach_state(router, state),
        config.server.max_concurrency,
    ));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {addr}: {err}");
            std::process::exit(1);
        }
    };
    info!(%addr, assets = %config.assets.dir.display(), "parcel-server listening");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(err) = server.await {
        error!("http server exited with error: {err}");
    }

    info!("waiting for in-flight settlements");
    background_tasks.close();
    if tokio::time::timeout(Duration::from_secs(5), background_tasks.wait())
        .await
        .is_err()
    {
        warn!("settlements still pending at exit; restart recovery will release them");
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}
