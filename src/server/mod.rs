//! Command-and-control endpoint.
//!
//! A small axum application on its own tokio runtime thread: GET returns the
//! current status string, POST accepts JSON commands, OPTIONS serves CORS
//! preflights. The IP allow list is enforced on every request. Worker
//! threads stay synchronous; only this endpoint is async.

pub mod commands;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{ConnectInfo, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};

use crate::workers::supervisor::Supervisor;

use self::commands::{CmdResponse, Handled, SharedSupervisor};

#[derive(Clone)]
struct AppState {
    supervisor: SharedSupervisor,
}

fn lock_supervisor(shared: &SharedSupervisor) -> std::sync::MutexGuard<'_, Supervisor> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn get_status(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let supervisor = lock_supervisor(&state.supervisor);
    if !supervisor.is_allowed(&addr.ip().to_string()) {
        return (StatusCode::FORBIDDEN, "Not allowed.").into_response();
    }
    supervisor.status().to_string().into_response()
}

async fn post_command(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: String,
) -> Response {
    let ip = addr.ip().to_string();
    {
        let supervisor = lock_supervisor(&state.supervisor);
        if !supervisor.is_allowed(&ip) {
            return (StatusCode::FORBIDDEN, "Not allowed.").into_response();
        }
    }

    let shared = Arc::clone(&state.supervisor);
    let handled =
        tokio::task::spawn_blocking(move || commands::handle(&shared, &ip, &body)).await;

    match handled {
        Ok(Handled::Done(response)) => Json(response).into_response(),
        Ok(Handled::Async(receiver)) => match receiver.await {
            Ok(response) => Json(response).into_response(),
            Err(_) => Json(CmdResponse::fail("Query test thread ended unexpectedly."))
                .into_response(),
        },
        Err(_) => Json(CmdResponse::fail("Command handler failed.")).into_response(),
    }
}

/// Run the endpoint until the shutdown signal flips. Blocks the calling
/// thread on a dedicated runtime.
pub fn run_blocking(
    supervisor: Arc<Mutex<Supervisor>>,
    port: u16,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE]);

        let app = Router::new()
            .route("/", get(get_status).post(post_command))
            .layer(cors)
            .with_state(AppState {
                supervisor: Arc::clone(&supervisor),
            });

        // OS termination signals route into the graceful shutdown path so
        // running workers get interrupted and marked as such
        let signal_supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            let interrupted = async {
                #[cfg(unix)]
                {
                    let mut sigterm = tokio::signal::unix::signal(
                        tokio::signal::unix::SignalKind::terminate(),
                    )?;
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sigterm.recv() => {}
                    }
                    Ok::<(), std::io::Error>(())
                }
                #[cfg(not(unix))]
                {
                    tokio::signal::ctrl_c().await?;
                    Ok::<(), std::io::Error>(())
                }
            };
            if interrupted.await.is_ok() {
                lock_supervisor(&signal_supervisor).kill();
            }
        });

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        tracing::info!(port, "control endpoint listening");
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
        Ok(())
    })
}
