//! Teams, projects and environments: organisational grouping. Plain
//! store CRUD, no engine involvement.
use std::collections::BTreeMap;
use std::convert::Infallible;

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use super::handlers::{error_response, json_response, no_content, warp_try};
use super::{json_body, request_id, with_ctx, ApiContext};
use crate::error::{Error, Result};
use crate::resource::{Environment, Project, Team};
use crate::store;

pub(super) fn routes(
    ctx: &ApiContext,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    teams(ctx).or(projects(ctx)).or(environments(ctx))
}

fn teams(ctx: &ApiContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let list = warp::get()
        .and(warp::path!("api" / "v1" / "teams"))
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(list_teams);
    let create = warp::post()
        .and(warp::path!("api" / "v1" / "teams"))
        .and(with_ctx(ctx))
        .and(request_id())
        .and(json_body())
        .and_then(create_team);
    let get = warp::get()
        .and(warp::path!("api" / "v1" / "teams" / String))
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(get_team);
    let update = warp::put()
        .and(warp::path!("api" / "v1" / "teams" / String))
        .and(with_ctx(ctx))
        .and(request_id())
        .and(json_body())
        .and_then(update_team);
    let delete = warp::delete()
        .and(warp::path!("api" / "v1" / "teams" / String))
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(delete_team);
    list.or(create).or(get).or(update).or(delete)
}

fn projects(ctx: &ApiContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let list = warp::get()
        .and(warp::path!("api" / "v1" / "projects"))
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(list_projects);
    let create = warp::post()
        .and(warp::path!("api" / "v1" / "projects"))
        .and(with_ctx(ctx))
        .and(request_id())
        .and(json_body())
        .and_then(create_project);
    let get = warp::get()
        .and(warp::path!("api" / "v1" / "projects" / String))
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(get_project);
    let update = warp::put()
        .and(warp::path!("api" / "v1" / "projects" / String))
        .and(with_ctx(ctx))
        .and(request_id())
        .and(json_body())
        .and_then(update_project);
    let delete = warp::delete()
        .and(warp::path!("api" / "v1" / "projects" / String))
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(delete_project);
    list.or(create).or(get).or(update).or(delete)
}

fn environments(ctx: &ApiContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let list = warp::get()
        .and(warp::path!("api" / "v1" / "environments"))
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(list_environments);
    let create = warp::post()
        .and(warp::path!("api" / "v1" / "environments"))
        .and(with_ctx(ctx))
        .and(request_id())
        .and(json_body())
        .and_then(create_environment);
    let get = warp::get()
        .and(warp::path!("api" / "v1" / "environments" / String))
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(get_environment);
    let update = warp::put()
        .and(warp::path!("api" / "v1" / "environments" / String))
        .and(with_ctx(ctx))
        .and(request_id())
        .and(json_body())
        .and_then(update_environment);
    let delete = warp::delete()
        .and(warp::path!("api" / "v1" / "environments" / String))
        .and(with_ctx(ctx))
        .and(request_id())
        .and_then(delete_environment);
    list.or(create).or(get).or(update).or(delete)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TeamInput {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    config: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ProjectInput {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    team_id: String,
    #[serde(default)]
    config: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct EnvironmentInput {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    project_id: String,
    #[serde(default)]
    config: BTreeMap<String, String>,
}

fn require_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::invalid_field("name", "name is required"));
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

async fn create_team(
    ctx: ApiContext,
    request_id: String,
    input: TeamInput,
) -> Result<impl Reply, Infallible> {
    warp_try!(require_name(&input.name), &request_id);
    let now = Utc::now();
    let id = resolve_id(&input.id);
    let team = Team {
        id: id.clone(),
        name: input.name,
        config: input.config,
        created_at: now,
        updated_at: now,
    };
    warp_try!(ctx.store.create_if_absent(store::TEAMS, &id, &team), &request_id);
    Ok(json_response(&team, StatusCode::CREATED, &request_id))
}

async fn list_teams(ctx: ApiContext, request_id: String) -> Result<impl Reply, Infallible> {
    let teams: Vec<Team> = warp_try!(ctx.store.list(store::TEAMS), &request_id);
    Ok(json_response(&teams, StatusCode::OK, &request_id))
}

async fn get_team(
    id: String,
    ctx: ApiContext,
    request_id: String,
) -> Result<impl Reply, Infallible> {
    let team: Team = warp_try!(ctx.store.get(store::TEAMS, &id), &request_id);
    Ok(json_response(&team, StatusCode::OK, &request_id))
}

async fn update_team(
    id: String,
    ctx: ApiContext,
    request_id: String,
    input: TeamInput,
) -> Result<impl Reply, Infallible> {
    warp_try!(require_name(&input.name), &request_id);
    let existing: Team = warp_try!(ctx.store.get(store::TEAMS, &id), &request_id);
    let team = Team {
        id: existing.id,
        name: input.name,
        config: input.config,
        created_at: existing.created_at,
        updated_at: Utc::now(),
    };
    warp_try!(ctx.store.update(store::TEAMS, &id, &team), &request_id);
    Ok(json_response(&team, StatusCode::OK, &request_id))
}

async fn delete_team(
    id: String,
    ctx: ApiContext,
    request_id: String,
) -> Result<impl Reply, Infallible> {
    warp_try!(ctx.store.delete(store::TEAMS, &id), &request_id);
    Ok(no_content(&request_id))
}

async fn create_project(
    ctx: ApiContext,
    request_id: String,
    input: ProjectInput,
) -> Result<impl Reply, Infallible> {
    warp_try!(require_name(&input.name), &request_id);
    if !input.team_id.is_empty() {
        let known = warp_try!(ctx.store.exists(store::TEAMS, &input.team_id), &request_id);
        if !known {
            return Ok(error_response(
                &Error::not_found("team", &input.team_id),
                &request_id,
            ));
        }
    }
    let now = Utc::now();
    let id = resolve_id(&input.id);
    let project = Project {
        id: id.clone(),
        name: input.name,
        team_id: input.team_id,
        config: input.config,
        created_at: now,
        updated_at: now,
    };
    warp_try!(
        ctx.store.create_if_absent(store::PROJECTS, &id, &project),
        &request_id
    );
    Ok(json_response(&project, StatusCode::CREATED, &request_id))
}

async fn list_projects(ctx: ApiContext, request_id: String) -> Result<impl Reply, Infallible> {
    let projects: Vec<Project> = warp_try!(ctx.store.list(store::PROJECTS), &request_id);
    Ok(json_response(&projects, StatusCode::OK, &request_id))
}

async fn get_project(
    id: String,
    ctx: ApiContext,
    request_id: String,
) -> Result<impl Reply, Infallible> {
    let project: Project = warp_try!(ctx.store.get(store::PROJECTS, &id), &request_id);
    Ok(json_response(&project, StatusCode::OK, &request_id))
}

async fn update_project(
    id: String,
    ctx: ApiContext,
    request_id: String,
    input: ProjectInput,
) -> Result<impl Reply, Infallible> {
    warp_try!(require_name(&input.name), &request_id);
    if !input.team_id.is_empty() {
        let known = warp_try!(ctx.store.exists(store::TEAMS, &input.team_id), &request_id);
        if !known {
            return Ok(error_response(
                &Error::not_found("team", &input.team_id),
                &request_id,
            ));
        }
    }
    let existing: Project = warp_try!(ctx.store.get(store::PROJECTS, &id), &request_id);
    let project = Project {
        id: existing.id,
        name: input.name,
        team_id: input.team_id,
        config: input.config,
        created_at: existing.created_at,
        updated_at: Utc::now(),
    };
    warp_try!(ctx.store.update(store::PROJECTS, &id, &project), &request_id);
    Ok(json_response(&project, StatusCode::OK, &request_id))
}

async fn delete_project(
    id: String,
    ctx: ApiContext,
    request_id: String,
) -> Result<impl Reply, Infallible> {
    warp_try!(ctx.store.delete(store::PROJECTS, &id), &request_id);
    Ok(no_content(&request_id))
}

async fn create_environment(
    ctx: ApiContext,
    request_id: String,
    input: EnvironmentInput,
) -> Result<impl Reply, Infallible> {
    warp_try!(require_name(&input.name), &request_id);
    if !input.project_id.is_empty() {
        let known = warp_try!(ctx.store.exists(store::PROJECTS, &input.project_id), &request_id);
        if !known {
            return Ok(error_response(
                &Error::not_found("project", &input.project_id),
                &request_id,
            ));
        }
    }
    let now = Utc::now();
    let id = resolve_id(&input.id);
    let environment = Environment {
        id: id.clone(),
        name: input.name,
        project_id: input.project_id,
        config: input.config,
        created_at: now,
        updated_at: now,
    };
    warp_try!(
        ctx.store.create_if_absent(store::ENVIRONMENTS, &id, &environment),
        &request_id
    );
    Ok(json_response(&environment, StatusCode::CREATED, &request_id))
}

async fn list_environments(ctx: ApiContext, request_id: String) -> Result<impl Reply, Infallible> {
    let environments: Vec<Environment> = warp_try!(ctx.store.list(store::ENVIRONMENTS), &request_id);
    Ok(json_response(&environments, StatusCode::OK, &request_id))
}

async fn get_environment(
    id: String,
    ctx: ApiContext,
    request_id: String,
) -> Result<impl Reply, Infallible> {
    let environment: Environment = warp_try!(ctx.store.get(store::ENVIRONMENTS, &id), &request_id);
    Ok(json_response(&environment, StatusCode::OK, &request_id))
}

async fn update_environment(
    id: String,
    ctx: ApiContext,
    request_id: String,
    input: EnvironmentInput,
) -> Result<impl Reply, Infallible> {
    warp_try!(require_name(&input.name), &request_id);
    if !input.project_id.is_empty() {
        let known = warp_try!(ctx.store.exists(store::PROJECTS, &input.project_id), &request_id);
        if !known {
            return Ok(error_response(
                &Error::not_found("project", &input.project_id),
                &request_id,
            ));
        }
    }
    let existing: Environment = warp_try!(ctx.store.get(store::ENVIRONMENTS, &id), &request_id);
    let environment = Environment {
        id: existing.id,
        name: input.name,
        project_id: input.project_id,
        config: input.config,
        created_at: existing.created_at,
        updated_at: Utc::now(),
    };
    warp_try!(
        ctx.store.update(store::ENVIRONMENTS, &id, &environment),
        &request_id
    );
    Ok(json_response(&environment, StatusCode::OK, &request_id))
}

async fn delete_environment(
    id: String,
    ctx: ApiContext,
    request_id: String,
) -> Result<impl Reply, Infallible> {
    warp_try!(ctx.store.delete(store::ENVIRONMENTS, &id), &request_id);
    Ok(no_content(&request_id))
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use warp::http::StatusCode;

    use super::super::test_support::api;

    fn body(response: &warp::http::Response<hyper::body::Bytes>) -> Value {
        serde_json::from_slice(response.body()).unwrap()
    }

    #[tokio::test]
    async fn team_project_environment_chain() {
        let t = api();
        let filter = super::super::routes(t.ctx.clone());

        let team = warp::test::request()
            .method("POST")
            .path("/api/v1/teams")
            .json(&json!({"name": "platform", "config": {"tier": "gold"}}))
            .reply(&filter)
            .await;
        assert_eq!(team.status(), StatusCode::CREATED);
        let team_id = body(&team)["id"].as_str().unwrap().to_owned();

        let project = warp::test::request()
            .method("POST")
            .path("/api/v1/projects")
            .json(&json!({"name": "storefront", "teamId": team_id}))
            .reply(&filter)
            .await;
        assert_eq!(project.status(), StatusCode::CREATED);
        let project_id = body(&project)["id"].as_str().unwrap().to_owned();

        let environment = warp::test::request()
            .method("POST")
            .path("/api/v1/environments")
            .json(&json!({"name": "staging", "projectId": project_id}))
            .reply(&filter)
            .await;
        assert_eq!(environment.status(), StatusCode::CREATED);
        assert_eq!(body(&environment)["projectId"], project_id.as_str());
    }

    #[tokio::test]
    async fn project_with_unknown_team_is_404() {
        let t = api();
        let filter = super::super::routes(t.ctx.clone());

        let response = warp::test::request()
            .method("POST")
            .path("/api/v1/projects")
            .json(&json!({"name": "storefront", "teamId": "ghost"}))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let err = body(&response);
        assert_eq!(err["error"]["resource"], "team");
        assert_eq!(err["error"]["id"], "ghost");
    }

    #[tokio::test]
    async fn team_update_and_delete_round_trip() {
        let t = api();
        let filter = super::super::routes(t.ctx.clone());

        let created = warp::test::request()
            .method("POST")
            .path("/api/v1/teams")
            .json(&json!({"name": "platform"}))
            .reply(&filter)
            .await;
        let created = body(&created);
        let id = created["id"].as_str().unwrap();

        let updated = warp::test::request()
            .method("PUT")
            .path(&format!("/api/v1/teams/{id}"))
            .json(&json!({"name": "core-platform"}))
            .reply(&filter)
            .await;
        assert_eq!(updated.status(), StatusCode::OK);
        let updated = body(&updated);
        assert_eq!(updated["name"], "core-platform");
        assert_eq!(updated["createdAt"], created["createdAt"]);

        let deleted = warp::test::request()
            .method("DELETE")
            .path(&format!("/api/v1/teams/{id}"))
            .reply(&filter)
            .await;
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let gone = warp::test::request()
            .method("GET")
            .path(&format!("/api/v1/teams/{id}"))
            .reply(&filter)
            .await;
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_with_client_supplied_id_conflicts_on_reuse() {
        let t = api();
        let filter = super::super::routes(t.ctx.clone());

        for (attempt, expected) in [(1, StatusCode::CREATED), (2, StatusCode::CONFLICT)] {
            let response = warp::test::request()
                .method("POST")
                .path("/api/v1/teams")
                .json(&json!({"id": "team-1", "name": format!("team {attempt}")}))
                .reply(&filter)
                .await;
            assert_eq!(response.status(), expected);
        }
    }
}
