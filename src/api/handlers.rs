use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;
use warp::http::{HeaderValue, StatusCode};
use warp::{reply, Rejection, Reply};

use super::ApiContext;
use crate::controller::names;
use crate::engine::{ContainerInfo, LogStream};
use crate::error::{Error, ErrorKind, Result};
use crate::resource::{Application, ProxySettings, LABEL_APP_ID};
use crate::store;

const ENGINE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_STOPPED: &str = "stopped";

// Use this instead of `?` so every error becomes an envelope carrying
// the request id rather than a rejection.
macro_rules! warp_try {
    ($expr:expr, $request_id:expr) => {
        match $expr {
            Ok(val) => val,
            Err(err) => {
                return Ok(error_response(&err, $request_id));
            }
        }
    };
}
pub(super) use warp_try;

pub(super) fn json_response<T: serde::Serialize>(
    value: &T,
    status: StatusCode,
    request_id: &str,
) -> reply::Response {
    with_request_id(
        reply::with_status(reply::json(value), status).into_response(),
        request_id,
    )
}

pub(super) fn no_content(request_id: &str) -> reply::Response {
    with_request_id(
        reply::with_status(reply::reply(), StatusCode::NO_CONTENT).into_response(),
        request_id,
    )
}

pub(super) fn error_response(err: &Error, request_id: &str) -> reply::Response {
    tracing::debug!(request_id, code = err.code(), error = %err, "request failed");
    let mut body = serde_json::json!({
        "error": {
            "code": err.code(),
            "message": err.to_string(),
            "requestId": request_id,
        }
    });
    if let Some((resource, id)) = err.resource_id() {
        body["error"]["resource"] = resource.into();
        body["error"]["id"] = id.into();
    }
    if let Some(field) = err.field() {
        body["error"]["field"] = field.into();
    }
    with_request_id(
        reply::with_status(reply::json(&body), status_for(err)).into_response(),
        request_id,
    )
}

fn with_request_id(mut response: reply::Response, request_id: &str) -> reply::Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

fn status_for(err: &Error) -> StatusCode {
    match err.kind() {
        ErrorKind::NotFound { .. } => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists { .. } => StatusCode::CONFLICT,
        ErrorKind::InvalidInput { .. } => StatusCode::BAD_REQUEST,
        ErrorKind::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        ErrorKind::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Shape every rejection into the JSON error envelope. Unknown
/// rejections surface as Internal without any stack detail.
pub(super) async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let request_id = Uuid::new_v4().to_string();
    let (status, code, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "NOT_FOUND", "resource not found".to_owned())
    } else if let Some(err) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, "INVALID_INPUT", err.to_string())
    } else if rejection.find::<warp::reject::UnsupportedMediaType>().is_some() {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "INVALID_INPUT",
            "content type must be application/json".to_owned(),
        )
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            "INVALID_INPUT",
            "request body too large".to_owned(),
        )
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "INVALID_INPUT",
            "method not allowed".to_owned(),
        )
    } else if let Some(err) = rejection.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, "INVALID_INPUT", err.to_string())
    } else {
        tracing::error!(?rejection, "unhandled rejection");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            "internal server error".to_owned(),
        )
    };
    let body = serde_json::json!({
        "error": { "code": code, "message": message, "requestId": request_id }
    });
    Ok(with_request_id(
        reply::with_status(reply::json(&body), status).into_response(),
        &request_id,
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ApplicationInput {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    ports: BTreeMap<String, String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    replicas: Option<u32>,
    #[serde(default)]
    proxy: Option<ProxySettings>,
}

fn validate(input: &ApplicationInput) -> Result<()> {
    if input.name.trim().is_empty() {
        return Err(Error::invalid_field("name", "name is required"));
    }
    if input.image.trim().is_empty() {
        return Err(Error::invalid_field("image", "image is required"));
    }
    if let Some(replicas) = input.replicas {
        if replicas > 1 {
            return Err(Error::invalid_field("replicas", "replicas above 1 are not supported"));
        }
    }
    for (host, container) in &input.ports {
        if !is_port(host) {
            return Err(Error::invalid_field("ports", format!("invalid host port {host:?}")));
        }
        if !is_port(container) {
            return Err(Error::invalid_field(
                "ports",
                format!("invalid container port {container:?}"),
            ));
        }
    }
    Ok(())
}

fn is_port(value: &str) -> bool {
    value.parse::<u16>().map(|port| port != 0).unwrap_or(false)
}

fn build_application(input: ApplicationInput, id: String) -> Application {
    let now = Utc::now();
    Application {
        id,
        name: input.name,
        image: input.image,
        ports: input.ports,
        env: input.env,
        replicas: input.replicas.unwrap_or(1),
        proxy: input.proxy,
        container_id: String::new(),
        status: String::new(),
        port_bindings: BTreeMap::new(),
        ip_address: String::new(),
        networks: Vec::new(),
        created_at: now,
        updated_at: now,
    }
}

#[tracing::instrument(skip(ctx, input), level = "debug")]
pub(super) async fn create_application(
    ctx: ApiContext,
    request_id: String,
    input: ApplicationInput,
) -> Result<impl Reply, Infallible> {
    warp_try!(validate(&input), &request_id);

    // Sanitized names double as engine container names, so they must be
    // unique across the deployment.
    let sanitized = names::sanitize(&input.name);
    let existing: Vec<Application> = warp_try!(ctx.store.list(store::APPLICATIONS), &request_id);
    if !sanitized.is_empty()
        && existing.iter().any(|app| names::sanitize(&app.name) == sanitized)
    {
        return Ok(error_response(
            &Error::already_exists("application", &input.name),
            &request_id,
        ));
    }

    let id = if input.id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        input.id.clone()
    };
    let app = build_application(input, id.clone());
    warp_try!(
        ctx.store.create_if_absent(store::APPLICATIONS, &id, &app),
        &request_id
    );
    Ok(json_response(&app, StatusCode::CREATED, &request_id))
}

#[tracing::instrument(skip(ctx), level = "debug")]
pub(super) async fn list_applications(
    ctx: ApiContext,
    request_id: String,
) -> Result<impl Reply, Infallible> {
    let mut apps: Vec<Application> = warp_try!(ctx.store.list(store::APPLICATIONS), &request_id);
    decorate_applications(&ctx, &mut apps).await;
    Ok(json_response(&apps, StatusCode::OK, &request_id))
}

#[tracing::instrument(skip(ctx), level = "debug")]
pub(super) async fn get_application(
    id: String,
    ctx: ApiContext,
    request_id: String,
) -> Result<impl Reply, Infallible> {
    let mut apps = vec![warp_try!(
        ctx.store.get::<Application>(store::APPLICATIONS, &id),
        &request_id
    )];
    decorate_applications(&ctx, &mut apps).await;
    let app = apps.remove(0);
    Ok(json_response(&app, StatusCode::OK, &request_id))
}

#[tracing::instrument(skip(ctx, input), level = "debug")]
pub(super) async fn update_application(
    id: String,
    ctx: ApiContext,
    request_id: String,
    input: ApplicationInput,
) -> Result<impl Reply, Infallible> {
    warp_try!(validate(&input), &request_id);
    let existing: Application =
        warp_try!(ctx.store.get(store::APPLICATIONS, &id), &request_id);

    // The sanitized name is the engine container name and must stay put.
    if names::sanitize(&input.name) != names::sanitize(&existing.name) {
        return Ok(error_response(
            &Error::invalid_field("name", "name cannot change after creation"),
            &request_id,
        ));
    }

    let mut updated = build_application(input, existing.id.clone());
    updated.created_at = existing.created_at;
    warp_try!(ctx.store.update(store::APPLICATIONS, &id, &updated), &request_id);
    Ok(json_response(&updated, StatusCode::OK, &request_id))
}

#[tracing::instrument(skip(ctx), level = "debug")]
pub(super) async fn delete_application(
    id: String,
    ctx: ApiContext,
    request_id: String,
) -> Result<impl Reply, Infallible> {
    warp_try!(ctx.store.delete(store::APPLICATIONS, &id), &request_id);
    Ok(no_content(&request_id))
}

#[derive(Debug, Deserialize)]
pub(super) struct LogsQuery {
    #[serde(default)]
    follow: bool,
    tail: Option<u32>,
}

/// Stream container logs as chunked plain text. One producer task per
/// client; it stops as soon as the client goes away.
#[tracing::instrument(skip(ctx), level = "debug")]
pub(super) async fn application_logs(
    id: String,
    query: LogsQuery,
    ctx: ApiContext,
    request_id: String,
) -> Result<impl Reply, Infallible> {
    let app: Application = warp_try!(ctx.store.get(store::APPLICATIONS, &id), &request_id);
    let name = names::container_name(&app);
    let stream = warp_try!(
        ctx.engine.logs(&name, query.follow, query.tail).await,
        &request_id
    );

    let LogStream {
        mut stdout,
        mut stderr,
    } = stream;
    let (tx, rx) = mpsc::channel::<String>(64);
    tokio::spawn(async move {
        let mut stdout_open = true;
        let mut stderr_open = true;
        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout.recv(), if stdout_open => match line {
                    Some(line) => {
                        if tx.send(line).await.is_err() {
                            return;
                        }
                    }
                    None => stdout_open = false,
                },
                line = stderr.recv(), if stderr_open => match line {
                    Some(line) => {
                        if tx.send(line).await.is_err() {
                            return;
                        }
                    }
                    None => stderr_open = false,
                },
            }
        }
    });

    let body = hyper::Body::wrap_stream(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|line| (Ok::<_, Infallible>(line), rx))
    }));
    let mut response = reply::Response::new(body);
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("text/plain; charset=utf-8"));
    Ok(with_request_id(response, &request_id))
}

pub(super) async fn healthz(request_id: String) -> Result<impl Reply, Infallible> {
    Ok(json_response(
        &serde_json::json!({ "status": "ok" }),
        StatusCode::OK,
        &request_id,
    ))
}

pub(super) async fn readyz(ctx: ApiContext, request_id: String) -> Result<impl Reply, Infallible> {
    let database = match ctx.store.ping() {
        Ok(()) => "ok".to_owned(),
        Err(err) => err.to_string(),
    };
    let engine = match tokio::time::timeout(ENGINE_PROBE_TIMEOUT, ctx.engine.ping()).await {
        Ok(Ok(())) => "ok".to_owned(),
        Ok(Err(err)) => err.to_string(),
        Err(_) => "engine probe timed out".to_owned(),
    };
    let ready = database == "ok" && engine == "ok";
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if ready { "ok" } else { "unavailable" },
        "checks": { "database": database, "engine": engine },
    });
    Ok(json_response(&body, status, &request_id))
}

/// Attach live engine state. An unreachable engine degrades to stored
/// state with status `stopped`; the request itself never fails.
async fn decorate_applications(ctx: &ApiContext, apps: &mut [Application]) {
    let containers = match ctx.engine.list(true).await {
        Ok(containers) => containers,
        Err(error) => {
            tracing::warn!(%error, "engine unreachable, serving stored state");
            for app in apps {
                app.status = STATUS_STOPPED.to_owned();
            }
            return;
        }
    };
    let by_app_id: HashMap<&str, &ContainerInfo> = containers
        .iter()
        .filter_map(|container| container.label(LABEL_APP_ID).map(|id| (id, container)))
        .collect();
    for app in apps {
        match by_app_id.get(app.id.as_str()) {
            Some(container) => {
                app.container_id = container.id.clone();
                app.status = container.status.clone();
                app.port_bindings = container.ports.clone();
                app.ip_address = container.ip_address.clone();
                app.networks = container.networks.clone();
            }
            None => app.status = STATUS_STOPPED.to_owned(),
        }
    }
}
