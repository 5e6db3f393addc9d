//! The two HTTP listeners: health (probes + reload hook) and metrics.
//! Nothing here touches poll-loop locks; both read shared state only.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::context::ApplicationContext;
use crate::metrics::ExporterMetrics;
use crate::reload::ReloadError;

/// Bind the health listener. Returns the bound address so bind failures can
/// surface as a distinct exit code.
pub fn serve_health(
    ctx: Arc<ApplicationContext>,
    port: u16,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>), warp::Error> {
    let routes = health_routes(ctx);
    let (addr, fut) = warp::serve(routes).try_bind_with_graceful_shutdown(
        ([0, 0, 0, 0], port),
        async move { shutdown.cancelled().await },
    )?;
    Ok((addr, tokio::spawn(fut)))
}

/// Bind the metrics listener.
pub fn serve_metrics(
    metrics: Arc<ExporterMetrics>,
    port: u16,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>), warp::Error> {
    let routes = metrics_routes(metrics);
    let (addr, fut) = warp::serve(routes).try_bind_with_graceful_shutdown(
        ([0, 0, 0, 0], port),
        async move { shutdown.cancelled().await },
    )?;
    Ok((addr, tokio::spawn(fut)))
}

pub fn health_routes(
    ctx: Arc<ApplicationContext>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let root = warp::path!("health")
        .and(warp::get())
        .map(|| warp::reply::json(&serde_json::json!({ "status": "ok" })));

    let livez = warp::path!("health" / "livez")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .map(|ctx: Arc<ApplicationContext>| probe_reply(ctx.liveness()));

    let readyz = warp::path!("health" / "readyz")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .map(|ctx: Arc<ApplicationContext>| probe_reply(ctx.readiness()));

    let details = warp::path!("health" / "details")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .map(|ctx: Arc<ApplicationContext>| warp::reply::json(&ctx.health_details()));

    let reload = warp::path!("health" / "reload")
        .and(warp::post())
        .and(with_ctx(ctx))
        .and_then(handle_reload);

    root.or(livez).or(readyz).or(details).or(reload)
}

pub fn metrics_routes(
    metrics: Arc<ExporterMetrics>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("metrics").and(warp::get()).map(move || {
        warp::reply::with_header(
            metrics.gather().expect("failed to encode metrics"),
            "Content-Type",
            "text/plain; charset=utf-8",
        )
    })
}

fn with_ctx(
    ctx: Arc<ApplicationContext>,
) -> impl Filter<Extract = (Arc<ApplicationContext>,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

fn probe_reply(healthy: bool) -> impl Reply {
    if healthy {
        warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "status": "ok" })),
            StatusCode::OK,
        )
    } else {
        warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "status": "unavailable" })),
            StatusCode::SERVICE_UNAVAILABLE,
        )
    }
}

async fn handle_reload(ctx: Arc<ApplicationContext>) -> Result<impl Reply, Infallible> {
    // The reload completes (or is rejected) before the response goes out, so
    // a scrape issued after a 202 already sees the pruned series.
    Ok(match ctx.reload().await {
        Ok(summary) => warp::reply::with_status(
            warp::reply::json(&serde_json::json!({
                "status": "accepted",
                "added": summary.added,
                "removed": summary.removed,
                "replaced": summary.replaced,
            })),
            StatusCode::ACCEPTED,
        ),
        Err(ReloadError::InFlight) => warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "error": "reload already in flight" })),
            StatusCode::CONFLICT,
        ),
        Err(err @ ReloadError::Invalid(_)) => warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "error": err.to_string() })),
            StatusCode::BAD_REQUEST,
        ),
    })
}
