//! Pods and networks: desired records materialised lazily by the
//! reconciler; the engine stays authoritative for runtime status.
use std::collections::HashMap;
use std::convert::Infallible;

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use super::handlers::{error_response, json_response, no_content, warp_try};
use super::{json_body, request_id, with_ctx, ApiContext};
use crate::controller::names;
use crate::error::{Error, Result};
use crate::resource::{Network, Pod};
use crate::store;

const STATUS_STOPPED: &str = "stopped";
const STATUS_ACTIVE: &str = "active";

pub(super) fn routes(
    ctx: &ApiContext,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    pods(ctx).or(networks(ctx))
}

fn pods(ctx: &ApiContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let list = warp::get()
        .and(warp::path!("api" / "v1" / "pods"))
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(list_pods);
    let create = warp::post()
        .and(warp::path!("api" / "v1" / "pods"))
        .and(with_ctx(ctx))
        .and(request_id())
        .and(json_body())
        .and_then(create_pod);
    let get = warp::get()
        .and(warp::path!("api" / "v1" / "pods" / String))
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(get_pod);
    let delete = warp::delete()
        .and(warp::path!("api" / "v1" / "pods" / String))
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(delete_pod);
    list.or(create).or(get).or(delete)
}

fn networks(ctx: &ApiContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let list = warp::get()
        .and(warp::path!("api" / "v1" / "networks"))
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(list_networks);
    let create = warp::post()
        .and(warp::path!("api" / "v1" / "networks"))
        .and(with_ctx(ctx))
        .and(request_id())
        .and(json_body())
        .and_then(create_network);
    let get = warp::get()
        .and(warp::path!("api" / "v1" / "networks" / String))
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(get_network);
    let delete = warp::delete()
        .and(warp::path!("api" / "v1" / "networks" / String))
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(delete_network);
    list.or(create).or(get).or(delete)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct NamedInput {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
}

fn validate(input: &NamedInput) -> Result<()> {
    if input.name.trim().is_empty() {
        return Err(Error::invalid_field("name", "name is required"));
    }
    if names::sanitize(&input.name).is_empty() {
        return Err(Error::invalid_field(
            "name",
            "name must contain at least one alphanumeric character",
        ));
    }
    Ok(())
}

fn resolve_id(id: &str) -> String {
    if id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        id.to_owned()
    }
}

async fn create_pod(
    ctx: ApiContext,
    request_id: String,
    input: NamedInput,
) -> Result<impl Reply, Infallible> {
    warp_try!(validate(&input), &request_id);
    let now = Utc::now();
    let id = resolve_id(&input.id);
    let pod = Pod {
        id: id.clone(),
        name: input.name,
        status: String::new(),
        created_at: now,
        updated_at: now,
    };
    warp_try!(ctx.store.create_if_absent(store::PODS, &id, &pod), &request_id);
    Ok(json_response(&pod, StatusCode::CREATED, &request_id))
}

async fn list_pods(ctx: ApiContext, request_id: String) -> Result<impl Reply, Infallible> {
    let mut pods: Vec<Pod> = warp_try!(ctx.store.list(store::PODS), &request_id);
    decorate_pods(&ctx, &mut pods).await;
    Ok(json_response(&pods, StatusCode::OK, &request_id))
}

async fn get_pod(
    id: String,
    ctx: ApiContext,
    request_id: String,
) -> Result<impl Reply, Infallible> {
    let mut pods = vec![warp_try!(ctx.store.get::<Pod>(store::PODS, &id), &request_id)];
    decorate_pods(&ctx, &mut pods).await;
    let pod = pods.remove(0);
    Ok(json_response(&pod, StatusCode::OK, &request_id))
}

/// Remove the desired record and eagerly tear down its engine pod; an
/// engine failure is logged, the desired state is gone either way.
async fn delete_pod(
    id: String,
    ctx: ApiContext,
    request_id: String,
) -> Result<impl Reply, Infallible> {
    if let Ok(pod) = ctx.store.get::<Pod>(store::PODS, &id) {
        let name = names::sanitize(&pod.name);
        if let Err(error) = ctx.engine.remove_pod(&name).await {
            tracing::warn!(pod = %pod.name, %error, "failed to remove engine pod");
        }
    }
    warp_try!(ctx.store.delete(store::PODS, &id), &request_id);
    Ok(no_content(&request_id))
}

async fn create_network(
    ctx: ApiContext,
    request_id: String,
    input: NamedInput,
) -> Result<impl Reply, Infallible> {
    warp_try!(validate(&input), &request_id);
    let now = Utc::now();
    let id = resolve_id(&input.id);
    let network = Network {
        id: id.clone(),
        name: input.name,
        status: String::new(),
        created_at: now,
        updated_at: now,
    };
    warp_try!(
        ctx.store.create_if_absent(store::NETWORKS, &id, &network),
        &request_id
    );
    Ok(json_response(&network, StatusCode::CREATED, &request_id))
}

async fn list_networks(ctx: ApiContext, request_id: String) -> Result<impl Reply, Infallible> {
    let mut networks: Vec<Network> = warp_try!(ctx.store.list(store::NETWORKS), &request_id);
    decorate_networks(&ctx, &mut networks).await;
    Ok(json_response(&networks, StatusCode::OK, &request_id))
}

async fn get_network(
    id: String,
    ctx: ApiContext,
    request_id: String,
) -> Result<impl Reply, Infallible> {
    let mut networks = vec![warp_try!(
        ctx.store.get::<Network>(store::NETWORKS, &id),
        &request_id
    )];
    decorate_networks(&ctx, &mut networks).await;
    let network = networks.remove(0);
    Ok(json_response(&network, StatusCode::OK, &request_id))
}

async fn delete_network(
    id: String,
    ctx: ApiContext,
    request_id: String,
) -> Result<impl Reply, Infallible> {
    if let Ok(network) = ctx.store.get::<Network>(store::NETWORKS, &id) {
        let name = names::sanitize(&network.name);
        if let Err(error) = ctx.engine.remove_network(&name).await {
            tracing::warn!(network = %network.name, %error, "failed to remove engine network");
        }
    }
    warp_try!(ctx.store.delete(store::NETWORKS, &id), &request_id);
    Ok(no_content(&request_id))
}

async fn decorate_pods(ctx: &ApiContext, pods: &mut [Pod]) {
    let live = match ctx.engine.list_pods().await {
        Ok(live) => live,
        Err(error) => {
            tracing::warn!(%error, "engine unreachable, serving stored pods");
            for pod in pods {
                pod.status = STATUS_STOPPED.to_owned();
            }
            return;
        }
    };
    let by_name: HashMap<&str, &crate::engine::PodInfo> =
        live.iter().map(|pod| (pod.name.as_str(), pod)).collect();
    for pod in pods {
        pod.status = by_name
            .get(names::sanitize(&pod.name).as_str())
            .map_or_else(|| STATUS_STOPPED.to_owned(), |info| info.status.clone());
    }
}

async fn decorate_networks(ctx: &ApiContext, networks: &mut [Network]) {
    let live = match ctx.engine.list_networks().await {
        Ok(live) => live,
        Err(error) => {
            tracing::warn!(%error, "engine unreachable, serving stored networks");
            for network in networks {
                network.status = STATUS_STOPPED.to_owned();
            }
            return;
        }
    };
    let names_live: std::collections::BTreeSet<&str> =
        live.iter().map(|network| network.name.as_str()).collect();
    for network in networks {
        network.status = if names_live.contains(names::sanitize(&network.name).as_str()) {
            STATUS_ACTIVE.to_owned()
        } else {
            STATUS_STOPPED.to_owned()
        };
    }
}
