//! Route authorization.
//!
//! The external auth layer forwards the caller as `x-director-user` and
//! its token scopes as `x-director-scopes` (space or comma separated).
//! Each route declares a `Requirement`; `authorize` turns it into a
//! `Permission` and checks it against the caller's scopes and, for
//! deployment routes, the deployment's teams before the handler runs.

use axum::extract::{RawPathParams, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use axum::RequestExt;
use director_core::DirectorError;
use director_state::StateStore;
use tracing::debug;

use crate::error::{ApiError, ApiResult};
use crate::ApiState;

pub const USER_HEADER: &str = "x-director-user";
pub const SCOPES_HEADER: &str = "x-director-scopes";

pub const ADMIN_SCOPE: &str = "bosh.admin";
pub const READ_SCOPE: &str = "bosh.read";

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub scopes: Vec<String>,
}

impl Identity {
    pub fn new(username: impl Into<String>, scopes: &[&str]) -> Self {
        Self {
            username: username.into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let username = headers.get(USER_HEADER)?.to_str().ok()?.trim();
        if username.is_empty() {
            return None;
        }
        let scopes = headers
            .get(SCOPES_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .split([' ', ','])
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Some(Self {
            username: username.to_string(),
            scopes,
        })
    }

    pub fn is_admin(&self) -> bool {
        self.scopes.iter().any(|s| s == ADMIN_SCOPE)
    }

    /// Director-wide read access.
    pub fn can_read_all(&self) -> bool {
        self.is_admin() || self.scopes.iter().any(|s| s == READ_SCOPE)
    }

    /// Teams the caller administers.
    pub fn admin_teams(&self) -> Vec<String> {
        self.team_scopes("admin")
    }

    /// Teams the caller may read, admin teams included.
    pub fn read_teams(&self) -> Vec<String> {
        let mut teams = self.team_scopes("read");
        teams.extend(self.admin_teams());
        teams.sort();
        teams.dedup();
        teams
    }

    fn team_scopes(&self, level: &str) -> Vec<String> {
        self.scopes
            .iter()
            .filter_map(|s| {
                let (team, scope_level) = s.strip_prefix("bosh.teams.")?.rsplit_once('.')?;
                (scope_level == level && !team.is_empty()).then(|| team.to_string())
            })
            .collect()
    }

    /// Whether `permission` holds given the owning teams of the deployment
    /// it names (`None` when the deployment does not exist yet).
    pub fn has(&self, permission: &Permission, teams: Option<&[String]>) -> bool {
        match permission {
            Permission::Admin => self.is_admin(),
            Permission::Read => self.can_read_all(),
            Permission::DeploymentAdmin(_) => {
                self.is_admin()
                    || match teams {
                        Some(teams) => shares_team(teams, &self.admin_teams()),
                        None => !self.admin_teams().is_empty(),
                    }
            }
            Permission::DeploymentRead(_) => {
                self.can_read_all()
                    || match teams {
                        Some(teams) => shares_team(teams, &self.read_teams()),
                        None => !self.read_teams().is_empty(),
                    }
            }
        }
    }

    /// Whether the caller may see a task owned by `teams`.
    pub fn can_see_task(&self, teams: &[String]) -> bool {
        self.can_read_all() || shares_team(teams, &self.read_teams())
    }

    /// Whether the caller may cancel a task owned by `teams`.
    pub fn can_cancel_task(&self, teams: &[String]) -> bool {
        self.is_admin() || shares_team(teams, &self.admin_teams())
    }
}

fn shares_team(owners: &[String], teams: &[String]) -> bool {
    owners.iter().any(|t| teams.contains(t))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permission {
    Read,
    Admin,
    DeploymentRead(String),
    DeploymentAdmin(String),
}

/// What a route demands. Deployment requirements take the deployment
/// name from the `{deployment}` path parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Any identified caller; the handler narrows by team itself.
    Authenticated,
    Read,
    Admin,
    DeploymentRead,
    DeploymentAdmin,
}

/// Check `permission` for `identity`, looking up deployment teams in the store.
pub fn check(store: &StateStore, identity: &Identity, permission: &Permission) -> ApiResult<()> {
    let deployment = match permission {
        Permission::DeploymentRead(name) | Permission::DeploymentAdmin(name) => store.get_deployment(name)?,
        Permission::Read | Permission::Admin => None,
    };
    if identity.has(permission, deployment.as_ref().map(|d| d.teams.as_slice())) {
        Ok(())
    } else {
        debug!(user = %identity.username, ?permission, "permission denied");
        Err(DirectorError::Unauthorized(format!(
            "User '{}' is not authorized to perform this action",
            identity.username
        ))
        .into())
    }
}

/// Middleware: identify the caller, enforce the route's requirement and
/// hand the `Identity` to the handler as a request extension.
pub async fn authorize(
    State((state, requirement)): State<(ApiState, Requirement)>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = Identity::from_headers(request.headers())
        .ok_or_else(|| DirectorError::Unauthorized("Not authorized: missing user".to_string()))?;

    let permission = match requirement {
        Requirement::Authenticated => None,
        Requirement::Read => Some(Permission::Read),
        Requirement::Admin => Some(Permission::Admin),
        Requirement::DeploymentRead | Requirement::DeploymentAdmin => {
            let params = request
                .extract_parts::<RawPathParams>()
                .await
                .map_err(|e| DirectorError::Internal(e.to_string()))?;
            let name = params
                .iter()
                .find(|(key, _)| *key == "deployment")
                .map(|(_, value)| value.to_string())
                .ok_or_else(|| DirectorError::Internal("route has no deployment parameter".to_string()))?;
            Some(if requirement == Requirement::DeploymentRead {
                Permission::DeploymentRead(name)
            } else {
                Permission::DeploymentAdmin(name)
            })
        }
    };
    if let Some(permission) = permission {
        check(&state.store, &identity, &permission)?;
    }

    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}
