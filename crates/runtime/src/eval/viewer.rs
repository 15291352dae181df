//! Read-only web viewer over the store.
//!
//! Serves campaigns, trials, tickets, and session replays as JSON plus
//! a minimal HTML index. No mutating routes; the viewer is just another
//! reader of the shared database.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::shutdown::ShutdownFlag;
use crate::store::Store;
use crate::types::{StoreError, TicketStatus};

/// Start the viewer and serve until shutdown.
pub async fn serve(
    store: Store,
    host: &str,
    port: u16,
    shutdown: ShutdownFlag,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    tracing::info!(host, port, "viewer listening");
    axum::serve(listener, router(store))
        .with_graceful_shutdown(async move {
            shutdown.wait().await;
        })
        .await
}

pub fn router(store: Store) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/campaigns", get(list_campaigns))
        .route("/api/campaigns/:id", get(campaign_detail))
        .route("/api/trials/:id", get(trial_detail))
        .route("/api/tickets", get(list_tickets))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", get(session_detail))
        .with_state(store)
}

struct AppError(StoreError);

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StoreError::TicketNotFound { .. }
            | StoreError::CampaignNotFound { .. }
            | StoreError::TrialNotFound { .. }
            | StoreError::UnknownSession(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({"error": self.0.to_string()}))).into_response()
    }
}

async fn index() -> Html<&'static str> {
    Html(
        "<!doctype html><html><head><title>operator viewer</title></head><body>\
         <h1>operator viewer</h1>\
         <ul>\
         <li><a href=\"/api/campaigns\">/api/campaigns</a></li>\
         <li>/api/campaigns/:id</li>\
         <li>/api/trials/:id</li>\
         <li><a href=\"/api/tickets\">/api/tickets</a></li>\
         <li><a href=\"/api/sessions\">/api/sessions</a></li>\
         <li>/api/sessions/:id</li>\
         </ul></body></html>",
    )
}

#[derive(Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<u32>,
}

async fn list_campaigns(
    State(store): State<Store>,
) -> Result<Json<serde_json::Value>, AppError> {
    let campaigns = store.list_campaigns(None)?;
    Ok(Json(serde_json::json!({ "campaigns": campaigns })))
}

async fn campaign_detail(
    State(store): State<Store>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let campaign = store.get_campaign(id)?;
    let trials = store.list_trials(id)?;
    Ok(Json(serde_json::json!({
        "campaign": campaign,
        "trials": trials,
    })))
}

async fn trial_detail(
    State(store): State<Store>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let trial = store.get_trial(id)?;
    Ok(Json(serde_json::json!({ "trial": trial })))
}

async fn list_tickets(
    State(store): State<Store>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            raw.parse::<TicketStatus>()
                .map_err(StoreError::Serialization)?,
        ),
        None => None,
    };
    let tickets = store.list_tickets(status, query.limit)?;
    Ok(Json(serde_json::json!({ "tickets": tickets })))
}

async fn list_sessions(
    State(store): State<Store>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let sessions = store.list_sessions(query.limit)?;
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

async fn session_detail(
    State(store): State<Store>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = store
        .get_session(&id)?
        .ok_or_else(|| StoreError::UnknownSession(id.clone()))?;
    let log = store.get_log(&id)?;
    Ok(Json(serde_json::json!({
        "session": session,
        "log": log,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;
    use crate::types::Severity;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_tickets_endpoint_filters_by_status() {
        let (_dir, store) = temp_store();
        let a = store
            .open_ticket(
                "inv",
                "tikv",
                "k1",
                Severity::Warning,
                &serde_json::json!({"violation_key": "k1"}),
            )
            .unwrap();
        store.resolve_ticket(a, "done").unwrap();
        store
            .open_ticket(
                "inv",
                "tikv",
                "k2",
                Severity::Warning,
                &serde_json::json!({"violation_key": "k2"}),
            )
            .unwrap();

        let app = router(store);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/tickets?status=open")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let tickets = body["tickets"].as_array().unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0]["violation_key"], "k2");
    }

    #[tokio::test]
    async fn test_missing_campaign_is_404() {
        let (_dir, store) = temp_store();
        let app = router(store);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/campaigns/42")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
