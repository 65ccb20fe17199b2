//! HTTP adapter over the tab ledger.
//!
//! Tabs only remember which session they last showed. `resume` turns that
//! memory into advice: attach if the session is still live, otherwise create
//! a fresh one in the tab's project.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, put},
    Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tether_db::{tabs as ledger, TabRecord};
use tether_pty::{SessionId, SessionRegistry};

use crate::server::{require_auth, ApiError};
use crate::state::AppState;
use crate::workspace::validate_project_id;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/projects/:project_id/tabs", get(list_tabs).post(open_tab))
        .route(
            "/api/projects/:project_id/tabs/:tab_id",
            get(get_tab).patch(rename_tab).delete(close_tab),
        )
        .route("/api/projects/:project_id/tabs/:tab_id/session", put(point_at_session))
        .route("/api/projects/:project_id/tabs/:tab_id/resume", get(resume_tab))
}

/// What a client should send to bring a tab back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ResumePlan {
    Attach {
        id: SessionId,
    },
    Create {
        #[serde(rename = "workspaceRef")]
        workspace_ref: String,
    },
}

pub fn plan_resume(tab: &TabRecord, registry: &SessionRegistry) -> ResumePlan {
    let live = tab
        .session_id
        .as_deref()
        .and_then(|id| Uuid::parse_str(id).ok())
        .and_then(|id| registry.lookup(&id))
        .filter(|session| !session.is_exited());
    match live {
        Some(session) => ResumePlan::Attach { id: session.id() },
        None => ResumePlan::Create {
            workspace_ref: tab.project_id.clone(),
        },
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenTab {
    name: String,
    tab_id: Option<String>,
    session_id: Option<SessionId>,
}

#[derive(Debug, Deserialize)]
struct RenameTab {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PointAtSession {
    session_id: Option<SessionId>,
}

fn check_project(project_id: &str) -> Result<(), ApiError> {
    validate_project_id(project_id).map_err(|e| ApiError::BadRequest(e.to_string()))
}

fn check_name(name: &str) -> Result<&str, ApiError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("tab name must not be empty".into()));
    }
    Ok(name)
}

fn tab_not_found(project_id: &str, tab_id: &str) -> ApiError {
    ApiError::NotFound(format!("tab {tab_id} not found in project {project_id}"))
}

/// GET /api/projects/:project_id/tabs
async fn list_tabs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<TabRecord>>, ApiError> {
    require_auth(&state, &headers)?;
    check_project(&project_id)?;
    let tabs = ledger::list_tabs(&state.ledger(), &project_id)?;
    Ok(Json(tabs))
}

/// POST /api/projects/:project_id/tabs
async fn open_tab(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(project_id): Path<String>,
    Json(body): Json<OpenTab>,
) -> Result<(StatusCode, Json<TabRecord>), ApiError> {
    require_auth(&state, &headers)?;
    check_project(&project_id)?;
    let name = check_name(&body.name)?;
    let tab_id = body.tab_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let session_id = body.session_id.map(|id| id.to_string());

    let conn = state.ledger();
    if ledger::get_tab(&conn, &project_id, &tab_id)?.is_some() {
        return Err(ApiError::Conflict(format!(
            "tab {tab_id} already exists in project {project_id}"
        )));
    }
    let tab = ledger::create_tab(&conn, &project_id, &tab_id, name, session_id.as_deref())?;
    log::info!("project {project_id}: opened tab {tab_id}");
    Ok((StatusCode::CREATED, Json(tab)))
}

/// GET /api/projects/:project_id/tabs/:tab_id
async fn get_tab(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((project_id, tab_id)): Path<(String, String)>,
) -> Result<Json<TabRecord>, ApiError> {
    require_auth(&state, &headers)?;
    check_project(&project_id)?;
    let tab = ledger::get_tab(&state.ledger(), &project_id, &tab_id)?
        .ok_or_else(|| tab_not_found(&project_id, &tab_id))?;
    Ok(Json(tab))
}

/// PATCH /api/projects/:project_id/tabs/:tab_id
async fn rename_tab(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((project_id, tab_id)): Path<(String, String)>,
    Json(body): Json<RenameTab>,
) -> Result<Json<TabRecord>, ApiError> {
    require_auth(&state, &headers)?;
    check_project(&project_id)?;
    let name = check_name(&body.name)?;
    let conn = state.ledger();
    if !ledger::rename_tab(&conn, &project_id, &tab_id, name)? {
        return Err(tab_not_found(&project_id, &tab_id));
    }
    let tab = ledger::get_tab(&conn, &project_id, &tab_id)?
        .ok_or_else(|| tab_not_found(&project_id, &tab_id))?;
    Ok(Json(tab))
}

/// PUT /api/projects/:project_id/tabs/:tab_id/session
async fn point_at_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((project_id, tab_id)): Path<(String, String)>,
    Json(body): Json<PointAtSession>,
) -> Result<Json<TabRecord>, ApiError> {
    require_auth(&state, &headers)?;
    check_project(&project_id)?;
    let session_id = body.session_id.map(|id| id.to_string());
    let conn = state.ledger();
    if !ledger::set_session(&conn, &project_id, &tab_id, session_id.as_deref())? {
        return Err(tab_not_found(&project_id, &tab_id));
    }
    let tab = ledger::get_tab(&conn, &project_id, &tab_id)?
        .ok_or_else(|| tab_not_found(&project_id, &tab_id))?;
    Ok(Json(tab))
}

/// DELETE /api/projects/:project_id/tabs/:tab_id
///
/// Forgets the tab. The session it pointed at keeps running.
async fn close_tab(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((project_id, tab_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    require_auth(&state, &headers)?;
    check_project(&project_id)?;
    if !ledger::close_tab(&state.ledger(), &project_id, &tab_id)? {
        return Err(tab_not_found(&project_id, &tab_id));
    }
    log::info!("project {project_id}: closed tab {tab_id}");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/projects/:project_id/tabs/:tab_id/resume
async fn resume_tab(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((project_id, tab_id)): Path<(String, String)>,
) -> Result<Json<ResumePlan>, ApiError> {
    require_auth(&state, &headers)?;
    check_project(&project_id)?;
    let tab = ledger::get_tab(&state.ledger(), &project_id, &tab_id)?
        .ok_or_else(|| tab_not_found(&project_id, &tab_id))?;
    Ok(Json(plan_resume(&tab, &state.registry)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::create_router;
    use crate::state::tests::{test_state, TEST_TOKEN};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {TEST_TOKEN}"));
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn tab(session_id: Option<String>) -> TabRecord {
        TabRecord {
            project_id: "proj-1".into(),
            tab_id: "t1".into(),
            name: "main".into(),
            session_id,
            position: 0,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_plan_resume_without_session_creates() {
        let registry = SessionRegistry::default();
        assert_eq!(
            plan_resume(&tab(None), &registry),
            ResumePlan::Create {
                workspace_ref: "proj-1".into()
            }
        );
        assert_eq!(
            plan_resume(&tab(Some("garbage".into())), &registry),
            ResumePlan::Create {
                workspace_ref: "proj-1".into()
            }
        );
        assert_eq!(
            plan_resume(&tab(Some(Uuid::new_v4().to_string())), &registry),
            ResumePlan::Create {
                workspace_ref: "proj-1".into()
            }
        );
    }

    #[test]
    fn test_plan_resume_attaches_to_live_session() {
        let root = tempfile::tempdir().unwrap();
        let state = test_state(root.path());
        let session = state.registry.create(root.path(), 80, 24).unwrap();

        let plan = plan_resume(&tab(Some(session.id().to_string())), &state.registry);
        assert_eq!(plan, ResumePlan::Attach { id: session.id() });

        state.registry.terminate(&session.id()).unwrap();
        let plan = plan_resume(&tab(Some(session.id().to_string())), &state.registry);
        assert!(matches!(plan, ResumePlan::Create { .. }));
    }

    #[tokio::test]
    async fn test_tab_lifecycle_over_http() {
        let root = tempfile::tempdir().unwrap();
        let state = test_state(root.path());
        let app = create_router(state.clone());
        let base = "/api/projects/proj-1/tabs";

        let (status, created) = call(
            &app,
            request("POST", base, Some(json!({"name": "build", "tabId": "t1"}))),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["tabId"], "t1");
        assert_eq!(created["sessionId"], Value::Null);

        let (status, _) = call(
            &app,
            request("POST", base, Some(json!({"name": "again", "tabId": "t1"}))),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, renamed) = call(
            &app,
            request("PATCH", &format!("{base}/t1"), Some(json!({"name": "logs"}))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(renamed["name"], "logs");

        let (status, plan) = call(&app, request("GET", &format!("{base}/t1/resume"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(plan, json!({"action": "create", "workspaceRef": "proj-1"}));

        let session = state.registry.create(root.path(), 80, 24).unwrap();
        let (status, pointed) = call(
            &app,
            request(
                "PUT",
                &format!("{base}/t1/session"),
                Some(json!({"sessionId": session.id()})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pointed["sessionId"], session.id().to_string());

        let (_, plan) = call(&app, request("GET", &format!("{base}/t1/resume"), None)).await;
        assert_eq!(plan, json!({"action": "attach", "id": session.id()}));

        let (_, listed) = call(&app, request("GET", base, None)).await;
        assert_eq!(listed.as_array().map(Vec::len), Some(1));

        let (status, _) = call(&app, request("DELETE", &format!("{base}/t1"), None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!state.registry.lookup(&session.id()).unwrap().is_exited());

        let (status, _) = call(&app, request("GET", &format!("{base}/t1"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        state.registry.terminate(&session.id()).unwrap();
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let root = tempfile::tempdir().unwrap();
        let app = create_router(test_state(root.path()));

        let (status, _) = call(
            &app,
            request("POST", "/api/projects/proj-1/tabs", Some(json!({"name": "  "}))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, request("GET", "/api/projects/bad%20id/tabs", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let unauthenticated = Request::builder()
            .uri("/api/projects/proj-1/tabs")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&app, unauthenticated).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_tab_routes_reject_bad_project_id() {
        let root = tempfile::tempdir().unwrap();
        let app = create_router(test_state(root.path()));
        let base = "/api/projects/bad%20id/tabs/t1";

        let requests = [
            request("GET", base, None),
            request("PATCH", base, Some(json!({"name": "renamed"}))),
            request("PUT", &format!("{base}/session"), Some(json!({"sessionId": null}))),
            request("DELETE", base, None),
            request("GET", &format!("{base}/resume"), None),
        ];
        for req in requests {
            let uri = req.uri().clone();
            let (status, _) = call(&app, req).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        }
    }
}
