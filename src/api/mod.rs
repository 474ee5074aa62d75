//! Control-plane HTTP surface.
//!
//! Routes:
//!
//! - `/api/v1/applications`: CRUD plus `GET /{id}/logs` streaming.
//! - `/api/v1/teams`, `/api/v1/projects`, `/api/v1/environments`: CRUD.
//! - `/api/v1/pods`, `/api/v1/networks`: CRUD without update.
//! - `/healthz`: liveness. `/readyz`: database + engine checks.
//!
//! Mutations require JSON bodies. Reads of applications, pods and
//! networks are decorated with live engine state; when the engine is
//! unreachable the stored state is served with status `stopped`.
use std::convert::Infallible;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use uuid::Uuid;
use warp::{Filter, Rejection, Reply};

use crate::engine::ContainerEngine;
use crate::store::Store;

mod handlers;
mod infra;
mod orgs;

/// Shared state threaded into every handler.
#[derive(Clone)]
pub struct ApiContext {
    pub store: Store,
    pub engine: Arc<dyn ContainerEngine>,
}

/// The complete filter tree, rejection handling and response headers
/// included.
#[must_use]
pub fn routes(ctx: ApiContext) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    health(&ctx)
        .or(applications(&ctx))
        .or(orgs::routes(&ctx))
        .or(infra::routes(&ctx))
        .recover(handlers::handle_rejection)
        .with(warp::reply::with::header("x-content-type-options", "nosniff"))
        .with(warp::reply::with::header("x-frame-options", "DENY"))
        .with(warp::reply::with::header("x-xss-protection", "1; mode=block"))
        .with(warp::reply::with::header(
            "cache-control",
            "no-store, no-cache, must-revalidate",
        ))
}

fn health(ctx: &ApiContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let healthz = warp::get()
        .and(warp::path!("healthz"))
        .and(request_id())
        .and_then(handlers::healthz);
    let readyz = warp::get()
        .and(warp::path!("readyz"))
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(handlers::readyz);
    healthz.or(readyz)
}

fn applications(ctx: &ApiContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let list = warp::get()
        .and(warp::path!("api" / "v1" / "applications"))
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(handlers::list_applications);
    let create = warp::post()
        .and(warp::path!("api" / "v1" / "applications"))
        .and(with_ctx(ctx))
        .and(request_id())
        .and(json_body())
        .and_then(handlers::create_application);
    let logs = warp::get()
        .and(warp::path!("api" / "v1" / "applications" / String / "logs"))
        .and(warp::query::<handlers::LogsQuery>())
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(handlers::application_logs);
    let get = warp::get()
        .and(warp::path!("api" / "v1" / "applications" / String))
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(handlers::get_application);
    let update = warp::put()
        .and(warp::path!("api" / "v1" / "applications" / String))
        .and(with_ctx(ctx))
        .and(request_id())
        .and(json_body())
        .and_then(handlers::update_application);
    let delete = warp::delete()
        .and(warp::path!("api" / "v1" / "applications" / String))
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(handlers::delete_application);
    list.or(create).or(logs).or(get).or(update).or(delete)
}

fn with_ctx(ctx: &ApiContext) -> impl Filter<Extract = (ApiContext,), Error = Infallible> + Clone {
    let ctx = ctx.clone();
    warp::any().map(move || ctx.clone())
}

/// Correlation id attached to logs, error bodies and the
/// `x-request-id` header of every handler response.
fn request_id() -> impl Filter<Extract = (String,), Error = Infallible> + Clone {
    warp::any().map(|| Uuid::new_v4().to_string())
}

fn json_body<T: DeserializeOwned + Send>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
{
    warp::body::content_length_limit(1024 * 1024).and(warp::body::json())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use super::ApiContext;
    use crate::engine::fake::FakeEngine;
    use crate::store::Store;

    pub(crate) struct TestApi {
        pub _dir: tempfile::TempDir,
        pub ctx: ApiContext,
        pub engine: Arc<FakeEngine>,
    }

    pub(crate) fn api() -> TestApi {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("simplify.db")).unwrap();
        let engine = Arc::new(FakeEngine::new());
        let ctx = ApiContext {
            store,
            engine: engine.clone(),
        };
        TestApi {
            _dir: dir,
            ctx,
            engine,
        }
    }
}
