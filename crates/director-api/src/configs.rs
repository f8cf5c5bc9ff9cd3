//! Config routes: versioned cloud, runtime and other named YAML configs.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use director_changeset::Changeset;
use director_core::manifest::parse_yaml;
use director_core::{codes, epoch_ms, CloudConfig, DirectorError, RuntimeConfig};
use director_jobs::{CLOUD_CONFIG, RUNTIME_CONFIG};
use director_state::ConfigRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::auth::Identity;
use crate::error::ApiResult;
use crate::ApiState;

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigView {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub content: String,
    pub team: Option<String>,
    pub created_at: u64,
}

impl From<ConfigRecord> for ConfigView {
    fn from(r: ConfigRecord) -> Self {
        Self {
            id: r.id,
            kind: r.kind,
            name: r.name,
            content: r.content,
            team: r.team,
            created_at: r.created_at,
        }
    }
}

fn config_not_found(what: String) -> DirectorError {
    DirectorError::not_found(codes::RESOURCE_NOT_FOUND, format!("Config {what} not found"))
}

/// Parse `content` the way its consumers will, so a broken config is
/// refused at upload rather than at the next deploy.
fn validate_content(kind: &str, content: &str) -> Result<Value, DirectorError> {
    match kind {
        CLOUD_CONFIG => {
            CloudConfig::from_yaml(content)?;
        }
        RUNTIME_CONFIG => {
            RuntimeConfig::from_yaml(content)?;
        }
        _ => {}
    }
    let parsed = parse_yaml(content)?;
    if !parsed.is_object() {
        return Err(DirectorError::validation(
            codes::VALIDATION_INVALID_TYPE,
            "Config must be a hash",
        ));
    }
    Ok(parsed)
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub latest: bool,
}

/// GET /configs
///
/// Newest first. With `latest=true` only the newest version of each
/// `(type, name)` is listed.
pub async fn list_configs(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<ConfigView>>> {
    let mut configs: Vec<ConfigRecord> = state
        .store
        .list_configs()?
        .into_iter()
        .filter(|c| params.kind.as_deref().is_none_or(|k| c.kind == k))
        .filter(|c| params.name.as_deref().is_none_or(|n| c.name == n))
        .collect();
    if params.latest {
        // Grouped by kind and name, oldest first within a group.
        let mut latest: Vec<ConfigRecord> = Vec::new();
        for config in configs {
            match latest.last_mut() {
                Some(last) if last.kind == config.kind && last.name == config.name => *last = config,
                _ => latest.push(config),
            }
        }
        configs = latest;
    }
    configs.sort_by(|a, b| b.id.cmp(&a.id));
    Ok(Json(configs.into_iter().map(ConfigView::from).collect()))
}

/// GET /configs/{id}
pub async fn get_config(State(state): State<ApiState>, Path(id): Path<u64>) -> ApiResult<Json<ConfigView>> {
    let config = state
        .store
        .get_config(id)?
        .ok_or_else(|| config_not_found(format!("id {id}")))?;
    Ok(Json(config.into()))
}

#[derive(Debug, Deserialize)]
pub struct CreateConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_name")]
    pub name: String,
    pub content: String,
}

fn default_name() -> String {
    "default".to_string()
}

/// POST /configs
///
/// `201 Created` for a new version, `200 OK` with the existing latest
/// version when the content is unchanged.
pub async fn create_config(
    State(state): State<ApiState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<CreateConfig>,
) -> ApiResult<(StatusCode, Json<ConfigView>)> {
    if req.kind.is_empty() || req.name.is_empty() {
        return Err(DirectorError::validation(
            codes::VALIDATION_MISSING_FIELD,
            "Config 'type' and 'name' must not be empty",
        )
        .into());
    }
    validate_content(&req.kind, &req.content)?;

    let team = identity.admin_teams().into_iter().next().filter(|_| !identity.is_admin());
    let (record, written) = state
        .store
        .create_config(&req.kind, &req.name, &req.content, team.as_deref(), epoch_ms())?;
    if written {
        info!(kind = %record.kind, name = %record.name, id = record.id, "config stored");
        Ok((StatusCode::CREATED, Json(record.into())))
    } else {
        Ok((StatusCode::OK, Json(record.into())))
    }
}

/// Either a stored version or new content for `(type, name)`.
#[derive(Debug, Deserialize)]
pub struct DiffRequest {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub name: Option<String>,
    pub content: Option<String>,
    pub from_id: Option<u64>,
    pub to_id: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct DiffResponse {
    pub from: Option<u64>,
    pub to: Option<u64>,
    pub diff: Changeset,
}

/// POST /configs/diff
///
/// `from_id` + `to_id` compares two stored versions. Otherwise `content`
/// is compared against the latest version of `(type, name)`, or against
/// nothing when there is none.
pub async fn diff_configs(State(state): State<ApiState>, Json(req): Json<DiffRequest>) -> ApiResult<Json<DiffResponse>> {
    let stored = |id: u64| -> ApiResult<ConfigRecord> {
        state
            .store
            .get_config(id)?
            .ok_or_else(|| config_not_found(format!("id {id}")).into())
    };

    let (from, old, to, new) = match (req.from_id, req.to_id, &req.content) {
        (Some(from_id), Some(to_id), _) => {
            let (from, to) = (stored(from_id)?, stored(to_id)?);
            (Some(from.id), parse_yaml(&from.content)?, Some(to.id), parse_yaml(&to.content)?)
        }
        (from_id, None, Some(content)) => {
            let kind = req.kind.as_deref().unwrap_or_default();
            let name = req.name.as_deref().unwrap_or("default");
            let new = validate_content(kind, content)?;
            let base = match from_id {
                Some(id) => Some(stored(id)?),
                None => state.store.latest_config(kind, name)?,
            };
            match base {
                Some(base) => (Some(base.id), parse_yaml(&base.content)?, None, new),
                None => (None, Value::Object(Default::default()), None, new),
            }
        }
        _ => {
            return Err(DirectorError::validation(
                codes::VALIDATION_MISSING_FIELD,
                "Provide either 'from_id' and 'to_id', or 'type', 'name' and 'content'",
            )
            .into());
        }
    };

    Ok(Json(DiffResponse {
        from,
        to,
        diff: Changeset::diff(&old, &new, false),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{body_json, request, TestDirector, ADMIN};

    fn post(uri: &str, scopes: &str, body: Value) -> axum::http::Request<axum::body::Body> {
        request("POST", uri, scopes)
            .header("content-type", "application/json")
            .body(body.to_string().into())
            .unwrap()
    }

    const CLOUD_V1: &str = "azs: [{name: z1}]\nvm_types: [{name: small}]\n";
    const CLOUD_V2: &str = "azs: [{name: z1}, {name: z2}]\nvm_types: [{name: small}]\n";

    #[tokio::test]
    async fn unchanged_content_is_not_versioned() {
        let director = TestDirector::new();
        let body = serde_json::json!({"type": "cloud", "name": "default", "content": CLOUD_V1});

        let resp = director.send(post("/configs", ADMIN, body.clone())).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let first = body_json(resp).await["id"].as_u64().unwrap();

        let resp = director.send(post("/configs", ADMIN, body)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["id"].as_u64().unwrap(), first);

        let body = serde_json::json!({"type": "cloud", "name": "default", "content": CLOUD_V2});
        let resp = director.send(post("/configs", ADMIN, body)).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = director
            .send(request("GET", "/configs?type=cloud&latest=true", ADMIN).body(Default::default()).unwrap())
            .await;
        let list = body_json(resp).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["content"], CLOUD_V2);

        let resp = director
            .send(request("GET", "/configs?type=cloud", ADMIN).body(Default::default()).unwrap())
            .await;
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn broken_cloud_config_is_refused() {
        let director = TestDirector::new();
        let body = serde_json::json!({"type": "cloud", "name": "default", "content": "azs: {{"});
        let resp = director.send(post("/configs", ADMIN, body)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(director.store.list_configs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn uploading_needs_admin() {
        let director = TestDirector::new();
        let body = serde_json::json!({"type": "cloud", "content": CLOUD_V1});
        let resp = director.send(post("/configs", "bosh.read", body)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn diff_against_latest() {
        let director = TestDirector::new();
        director.store.create_config("cloud", "default", CLOUD_V1, None, 0).unwrap();

        let body = serde_json::json!({"type": "cloud", "name": "default", "content": CLOUD_V2});
        let resp = director.send(post("/configs/diff", ADMIN, body)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let added: Vec<&str> = body["diff"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|pair| pair[1] == "added")
            .map(|pair| pair[0].as_str().unwrap())
            .collect();
        assert_eq!(added, vec!["- name: z2"]);
    }
}
