//! REST endpoints for intake status, captured records, and the transcript.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use crate::runner::SessionSnapshot;
use crate::store::ProgressStore;

/// Shared state for the intake routes.
#[derive(Clone)]
pub struct RouteState {
    pub snapshot: watch::Receiver<SessionSnapshot>,
    pub store: Arc<dyn ProgressStore>,
}

/// GET /api/intake/status
///
/// Current stage, completion map, and any stages left unresolved by a
/// fallback advance.
async fn get_status(State(state): State<RouteState>) -> impl IntoResponse {
    let snapshot = state.snapshot.borrow().clone();
    Json(snapshot)
}

/// GET /api/intake/records
async fn get_records(State(state): State<RouteState>) -> impl IntoResponse {
    let patient_id = state.snapshot.borrow().patient_id.clone();
    match state.store.load_all(&patient_id).await {
        Ok(records) => {
            let by_widget: serde_json::Map<String, serde_json::Value> = records
                .into_iter()
                .map(|(widget, record)| {
                    (
                        widget.as_str().to_string(),
                        serde_json::to_value(&record).unwrap_or_default(),
                    )
                })
                .collect();
            Json(serde_json::Value::Object(by_widget)).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// GET /api/intake/transcript
async fn get_transcript(State(state): State<RouteState>) -> impl IntoResponse {
    let patient_id = state.snapshot.borrow().patient_id.clone();
    match state.store.load_transcript(&patient_id).await {
        Ok(entries) => Json(serde_json::to_value(&entries).unwrap_or_default()).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

/// Build the intake REST routes.
pub fn intake_routes(state: RouteState) -> Router {
    Router::new()
        .route("/api/intake/status", get(get_status))
        .route("/api/intake/records", get(get_records))
        .route("/api/intake/transcript", get(get_transcript))
        .route("/healthz", get(healthz))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{TranscriptEntry, WidgetType};
    use crate::store::LibSqlStore;
    use crate::widgets::WidgetRegistry;
    use std::collections::BTreeMap;

    async fn serve(state: RouteState) -> String {
        let app = intake_routes(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}")
    }

    fn snapshot() -> SessionSnapshot {
        SessionSnapshot {
            patient_id: "p1".to_string(),
            current_stage: Some("vitals".to_string()),
            complete: false,
            completion: BTreeMap::new(),
            unresolved: vec![],
        }
    }

    #[tokio::test]
    async fn status_route_serves_the_snapshot() {
        let store: Arc<dyn ProgressStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let (_tx, rx) = watch::channel(snapshot());
        let base = serve(RouteState { snapshot: rx, store }).await;

        let body: serde_json::Value = reqwest::get(format!("{base}/api/intake/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["patient_id"], "p1");
        assert_eq!(body["current_stage"], "vitals");
        assert_eq!(body["complete"], false);
    }

    #[tokio::test]
    async fn records_route_returns_captured_records() {
        let store: Arc<dyn ProgressStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let record = WidgetRegistry::global()
            .get(WidgetType::Vitals)
            .validate(
                serde_json::json!({"weight_kg": 85, "age": 30, "sex": "Female"})
                    .as_object()
                    .unwrap()
                    .clone(),
            )
            .unwrap();
        store.save_record("p1", &record).await.unwrap();

        let (_tx, rx) = watch::channel(snapshot());
        let base = serve(RouteState { snapshot: rx, store }).await;

        let body: serde_json::Value = reqwest::get(format!("{base}/api/intake/records"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["vitals"]["fields"]["sex"], "Female");
    }

    #[tokio::test]
    async fn transcript_route_returns_entries() {
        let store: Arc<dyn ProgressStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        store
            .append_transcript("p1", &TranscriptEntry::synthetic("moving on"))
            .await
            .unwrap();

        let (_tx, rx) = watch::channel(snapshot());
        let base = serve(RouteState { snapshot: rx, store }).await;

        let body: serde_json::Value = reqwest::get(format!("{base}/api/intake/transcript"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["synthetic"], true);
    }

    #[tokio::test]
    async fn healthz_responds() {
        let store: Arc<dyn ProgressStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let (_tx, rx) = watch::channel(snapshot());
        let base = serve(RouteState { snapshot: rx, store }).await;

        let resp = reqwest::get(format!("{base}/healthz")).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "ok");
    }
}
