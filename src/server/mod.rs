//! Manual trigger + read API consumed by the dashboard.

use crate::models::PriceRecord;
use crate::pipeline::{Pipeline, RunError, RunSummary};
use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

/// `{success, message | error}` envelope returned to manual callers.
#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
}

impl TriggerResponse {
    pub fn from_outcome(outcome: &Result<RunSummary, RunError>) -> (StatusCode, Self) {
        match outcome {
            Ok(summary) => (
                StatusCode::OK,
                Self {
                    success: true,
                    message: Some(summary.message()),
                    error: None,
                    summary: Some(summary.clone()),
                },
            ),
            Err(e) => {
                let status = match e {
                    RunError::AlreadyRunning => StatusCode::CONFLICT,
                    RunError::Scrape(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, Self { success: false, message: None, error: Some(e.to_string()), summary: None })
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

// ---------- Handlers ----------

async fn trigger_scrape(State(state): State<AppState>) -> (StatusCode, Json<TriggerResponse>) {
    info!("Manual scrape requested");
    let outcome = state.pipeline.run().await;
    let (status, body) = TriggerResponse::from_outcome(&outcome);
    (status, Json(body))
}

async fn list_prices(
    State(state): State<AppState>,
) -> Result<Json<Vec<PriceRecord>>, (StatusCode, Json<ErrorBody>)> {
    let tracked = state.pipeline.tracked_tickers();
    state
        .pipeline
        .repo()
        .latest_prices(&tracked)
        .map(Json)
        .map_err(internal)
}

async fn get_price(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
) -> Result<Json<PriceRecord>, (StatusCode, Json<ErrorBody>)> {
    match state.pipeline.repo().latest_price(&ticker).map_err(internal)? {
        Some(record) => Ok(Json(record)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorBody { error: format!("no price stored for {}", ticker.to_uppercase()) }),
        )),
    }
}

fn internal(e: anyhow::Error) -> (StatusCode, Json<ErrorBody>) {
    error!("Read API failed: {:#}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { error: e.to_string() }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/scrape", post(trigger_scrape))
        .route("/api/prices", get(list_prices))
        .route("/api/prices/{ticker}", get(get_price))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(state: AppState, bind_addr: &str) -> Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", bind_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Could not bind {}", addr))?;
    info!("Listening on http://{}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Price, Source};
    use crate::pipeline::testing::{fallback, pipeline};
    use crate::scraper::testing::{text, MockBrowser};

    fn state(browser: MockBrowser, tickers: &[&str]) -> AppState {
        let fb = fallback(&[("AAA", 10.0, 0.25), ("BBB", 20.0, 0.5)]);
        AppState { pipeline: Arc::new(pipeline(Arc::new(browser), fb, tickers)) }
    }

    #[tokio::test]
    async fn test_trigger_success_envelope() {
        let st = state(MockBrowser::new(&[("AAA", text("12.34"))]), &["AAA", "BBB"]);
        let (status, Json(body)) = trigger_scrape(State(st.clone())).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.success);
        assert!(body.error.is_none());
        let summary = body.summary.unwrap();
        assert_eq!(summary.primary, 1);
        assert_eq!(summary.fallback, 1);

        let json = serde_json::to_value(TriggerResponse::from_outcome(&Ok(summary)).1).unwrap();
        assert_eq!(json["success"], true);
        assert!(json.get("error").is_none());
        assert!(json["message"].as_str().unwrap().contains("1 live"));
    }

    #[tokio::test]
    async fn test_trigger_failure_envelope() {
        let st = state(MockBrowser::failing_launch(), &["AAA"]);
        let (status, Json(body)) = trigger_scrape(State(st)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.success);
        assert!(body.error.unwrap().contains("browser launch failed"));

        let (status, body) = TriggerResponse::from_outcome(&Err(RunError::AlreadyRunning));
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body.message.is_none());
    }

    #[tokio::test]
    async fn test_read_api() {
        let st = state(MockBrowser::new(&[("AAA", text("12.34"))]), &["AAA", "BBB"]);
        st.pipeline
            .repo()
            .upsert_distributions(&[("AAA".into(), 0.25)])
            .unwrap();

        // Nothing scraped yet: both tracked tickers are pending
        let Json(before) = list_prices(State(st.clone())).await.unwrap();
        assert!(before.iter().all(|r| r.price == Price::Pending));

        trigger_scrape(State(st.clone())).await;

        let Json(aaa) = get_price(State(st.clone()), Path("aaa".into())).await.unwrap();
        assert_eq!(aaa.price, Price::Known(12.34));
        assert_eq!(aaa.source, Some(Source::Primary));
        assert_eq!(aaa.distribution, Some(0.25));

        let Json(all) = list_prices(State(st.clone())).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].price, Price::Known(20.0));

        let (status, _) = get_price(State(st), Path("NOPE".into())).await.unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
