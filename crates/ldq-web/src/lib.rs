//! Axum JSON surface for the real-time duplicate check.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ldq_core::LeadDraft;
use ldq_engine::DuplicateDetector;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "ldq-web";

#[derive(Clone)]
pub struct AppState {
    pub detector: DuplicateDetector,
}

impl AppState {
    pub fn new(detector: DuplicateDetector) -> Self {
        Self { detector }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/leads/check-duplicates", post(check_duplicates_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(port: u16, state: AppState) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web surface listening");
    axum::serve(listener, app(state)).await
}

async fn check_duplicates_handler(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<LeadDraft>,
) -> Response {
    match state.detector.check(&draft).await {
        Ok(report) => Json(report).into_response(),
        // Callers get a decision object or a generic failure, nothing else.
        Err(err) => {
            error!(error = %err, "duplicate check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "duplicate check failed"})),
            )
                .into_response()
        }
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use ldq_core::DuplicateReport;
    use ldq_oracle::{OracleResponse, ScoredMatch, StaticOracle};
    use ldq_store::MemoryLeadStore;
    use std::time::Duration;
    use tower::util::ServiceExt;

    fn test_app(store: Arc<MemoryLeadStore>, oracle: Arc<StaticOracle>) -> Router {
        let detector = DuplicateDetector::new(store, oracle, Duration::from_secs(1));
        app(AppState::new(detector))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_answers() {
        let app = test_app(
            Arc::new(MemoryLeadStore::new()),
            Arc::new(StaticOracle::answering(OracleResponse::ScoredList(vec![]))),
        );
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn check_duplicates_returns_the_report_shape() {
        let store = Arc::new(MemoryLeadStore::new());
        let app = test_app(
            store,
            Arc::new(StaticOracle::answering(OracleResponse::ScoredList(vec![
                ScoredMatch {
                    lead_id: 1,
                    score: 90,
                    rationale: "same person".into(),
                },
            ]))),
        );

        let request = Request::post("/api/leads/check-duplicates")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"contactName": "Nobody Matches", "platform": "Upwork"}"#,
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        let report: DuplicateReport = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(report, DuplicateReport::none());
        assert_eq!(json["hasDuplicates"], serde_json::json!(false));
        assert_eq!(json["highestScore"], serde_json::json!(0));
    }

    #[tokio::test]
    async fn matches_are_rendered_camel_case() {
        let store = Arc::new(MemoryLeadStore::new());
        store.insert(ldq_core::LeadRecord {
            id: 1,
            contact_name: "Jane Doe".into(),
            company: Some("Acme".into()),
            platform: "Upwork".into(),
            deal_value: 2500.0,
            notes: None,
            owner_id: Some(3),
            stage: "new".into(),
            created_at: chrono_now(),
            deleted_at: None,
        });
        let app = test_app(
            store,
            Arc::new(StaticOracle::answering(OracleResponse::ScoredList(vec![
                ScoredMatch {
                    lead_id: 1,
                    score: 90,
                    rationale: "same person".into(),
                },
            ]))),
        );

        let request = Request::post("/api/leads/check-duplicates")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"contactName": "jane doe"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["hasDuplicates"], serde_json::json!(true));
        assert_eq!(json["highestScore"], serde_json::json!(90));
        assert_eq!(json["duplicates"][0]["candidateId"], serde_json::json!(1));
        assert_eq!(
            json["duplicates"][0]["contactName"],
            serde_json::json!("Jane Doe")
        );
    }

    fn chrono_now() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }
}
