use crate::pipeline::{now_secs, Pipeline};
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ledger::{short_hex, ActionRecord};
use reputation::{ReputationState, ScoreEvent};
use sequencer_core::{Batch, SubmissionState};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

const HISTORY_LIMIT: usize = 50;

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(what: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: what.into(),
        }
    }

    fn bad_request(err: impl ToString) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: err.to_string(),
        }
    }

    fn internal(err: impl ToString) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordView {
    pub identity: String,
    pub action_type: String,
    pub timestamp: u64,
    pub sequence: u64,
    pub payload_hash: String,
    pub prev_hash: String,
    pub record_hash: String,
}

impl From<&ActionRecord> for RecordView {
    fn from(record: &ActionRecord) -> Self {
        Self {
            identity: record.identity.clone(),
            action_type: record.action_type.to_string(),
            timestamp: record.timestamp,
            sequence: record.sequence,
            payload_hash: hex::encode(record.payload_hash),
            prev_hash: hex::encode(record.prev_hash),
            record_hash: hex::encode(record.record_hash),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchView {
    pub batch_id: String,
    pub sequence: u64,
    pub attempt: u32,
    pub state: SubmissionState,
    pub merkle_root: String,
    pub leaves: usize,
    pub records: Vec<String>,
    pub submission_handle: Option<String>,
    pub confirmation_ref: Option<String>,
    pub sealed_at: i64,
}

impl From<&Batch> for BatchView {
    fn from(batch: &Batch) -> Self {
        Self {
            batch_id: batch.batch_id.clone(),
            sequence: batch.sequence,
            attempt: batch.attempt,
            state: batch.submission_state,
            merkle_root: batch.root_hex(),
            leaves: batch.ordered_leaves.len(),
            records: batch
                .ordered_leaves
                .iter()
                .map(|leaf| hex::encode(leaf.record_hash))
                .collect(),
            submission_handle: batch.submission_handle.clone(),
            confirmation_ref: batch.confirmation_ref.clone(),
            sealed_at: batch.sealed_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReputationView {
    pub identity: String,
    pub score: f64,
    pub grade: String,
    pub streak: u32,
    pub slash_count: u32,
    pub last_action_ts: Option<u64>,
}

impl From<&ReputationState> for ReputationView {
    fn from(state: &ReputationState) -> Self {
        Self {
            identity: state.identity.clone(),
            score: state.score,
            grade: state.grade.to_string(),
            streak: state.streak_count,
            slash_count: state.slash_count,
            last_action_ts: state.last_action_ts,
        }
    }
}

#[derive(Debug, Serialize)]
struct ReputationDetail {
    #[serde(flatten)]
    view: ReputationView,
    history: Vec<ScoreEvent>,
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    from: Option<u64>,
    to: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ActionRequest {
    identity: String,
    action_type: String,
    timestamp: Option<u64>,
    /// UTF-8 payload; ignored when `payload_hex` is present.
    #[serde(default)]
    payload: String,
    payload_hex: Option<String>,
}

#[derive(Debug, Serialize)]
struct ActionResponse {
    record: RecordView,
    proof_status: String,
    verification_key_id: String,
    sealed_batch: Option<String>,
}

async fn ledger_stats(pipeline: Pipeline) -> ApiResult<ledger::LedgerStatistics> {
    pipeline
        .ledger
        .statistics()
        .await
        .map(Json)
        .map_err(ApiError::internal)
}

async fn ledger_records(
    pipeline: Pipeline,
    did: String,
    range: RangeQuery,
) -> ApiResult<Vec<RecordView>> {
    let records = pipeline
        .ledger
        .records_in_range(&did, range.from.unwrap_or(0), range.to.unwrap_or(u64::MAX))
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(records.iter().map(RecordView::from).collect()))
}

async fn ledger_verify(pipeline: Pipeline, did: String) -> ApiResult<serde_json::Value> {
    let records = pipeline
        .ledger
        .records(&did)
        .await
        .map_err(ApiError::internal)?;
    let audit = pipeline.ledger.audit_chain(&did).await;
    Ok(Json(json!({
        "identity": did,
        "records": records.len(),
        "valid": audit.is_ok(),
        "error": audit.err().map(|e| e.to_string()),
        "halted": pipeline.ledger.is_halted(&did).await,
    })))
}

async fn batch_detail(pipeline: Pipeline, id: String) -> ApiResult<BatchView> {
    pipeline
        .aggregator
        .batch(&id)
        .await
        .map(|batch| Json(BatchView::from(&batch)))
        .ok_or_else(|| ApiError::not_found(format!("batch {id}")))
}

async fn reputation_detail(pipeline: Pipeline, did: String) -> ApiResult<ReputationDetail> {
    let state = pipeline
        .reputation
        .state(&did, now_secs())
        .await
        .map_err(|e| ApiError::not_found(e.to_string()))?;
    let history = pipeline
        .reputation
        .history(&did, HISTORY_LIMIT)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(ReputationDetail {
        view: ReputationView::from(&state),
        history,
    }))
}

async fn record_action(pipeline: Pipeline, req: ActionRequest) -> ApiResult<ActionResponse> {
    let payload = match &req.payload_hex {
        Some(encoded) => hex::decode(encoded).map_err(ApiError::bad_request)?,
        None => req.payload.clone().into_bytes(),
    };
    let timestamp = req.timestamp.unwrap_or_else(now_secs);
    let recorded = pipeline
        .record_action(&req.identity, &req.action_type, timestamp, &payload)
        .await
        .map_err(ApiError::bad_request)?;
    info!(
        identity = %req.identity,
        action_type = %req.action_type,
        record = %short_hex(&recorded.record.record_hash),
        "action recorded"
    );
    Ok(Json(ActionResponse {
        record: RecordView::from(&recorded.record),
        proof_status: format!("{:?}", recorded.proof.status),
        verification_key_id: recorded.proof.verification_key_id.clone(),
        sealed_batch: recorded.sealed_batch,
    }))
}

/// Read-only exports plus development ingestion.
pub fn router(pipeline: Pipeline) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/ledger/stats",
            get({
                let pipeline = pipeline.clone();
                move || ledger_stats(pipeline.clone())
            }),
        )
        .route(
            "/ledger/:did",
            get({
                let pipeline = pipeline.clone();
                move |Path(did): Path<String>, Query(range): Query<RangeQuery>| {
                    ledger_records(pipeline.clone(), did, range)
                }
            }),
        )
        .route(
            "/ledger/:did/verify",
            get({
                let pipeline = pipeline.clone();
                move |Path(did): Path<String>| ledger_verify(pipeline.clone(), did)
            }),
        )
        .route(
            "/proofs/stats",
            get({
                let pipeline = pipeline.clone();
                move || {
                    let pipeline = pipeline.clone();
                    async move { Json(pipeline.engine.statistics().await) }
                }
            }),
        )
        .route(
            "/batches",
            get({
                let pipeline = pipeline.clone();
                move || {
                    let pipeline = pipeline.clone();
                    async move {
                        let batches = pipeline.aggregator.batches().await;
                        Json(batches.iter().map(BatchView::from).collect::<Vec<_>>())
                    }
                }
            }),
        )
        .route(
            "/batches/:id",
            get({
                let pipeline = pipeline.clone();
                move |Path(id): Path<String>| batch_detail(pipeline.clone(), id)
            }),
        )
        .route(
            "/reputation",
            get({
                let pipeline = pipeline.clone();
                move || {
                    let pipeline = pipeline.clone();
                    async move {
                        let states = pipeline.reputation.snapshot().await;
                        Json(states.iter().map(ReputationView::from).collect::<Vec<_>>())
                    }
                }
            }),
        )
        .route(
            "/reputation/:did",
            get({
                let pipeline = pipeline.clone();
                move |Path(did): Path<String>| reputation_detail(pipeline.clone(), did)
            }),
        )
        .route(
            "/actions",
            post({
                let pipeline = pipeline.clone();
                move |Json(req): Json<ActionRequest>| record_action(pipeline.clone(), req)
            }),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DevIdentity, NodeConfig};
    use tokio::net::TcpListener;

    const DID: &str = "did:robo:scout-4";

    async fn serve() -> anyhow::Result<(String, Pipeline)> {
        let config = NodeConfig {
            identities: vec![DevIdentity {
                did: DID.into(),
                seed: "scout-4".into(),
            }],
            ..NodeConfig::default()
        };
        let pipeline = Pipeline::build(&config).await?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let base = format!("http://{}", listener.local_addr()?);
        let app = router(pipeline.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        Ok((base, pipeline))
    }

    #[tokio::test]
    async fn exports_reflect_recorded_actions() -> anyhow::Result<()> {
        let (base, _pipeline) = serve().await?;
        let client = reqwest::Client::new();

        let health = client.get(format!("{base}/health")).send().await?.text().await?;
        assert_eq!(health, "ok");

        let recorded: serde_json::Value = client
            .post(format!("{base}/actions"))
            .json(&json!({ "identity": DID, "action_type": "DELIV_DONE", "payload": "parcel" }))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(recorded["proof_status"], "Generated");

        let records: Vec<RecordView> = client
            .get(format!("{base}/ledger/{DID}"))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action_type, "DELIV_DONE");

        let verify: serde_json::Value = client
            .get(format!("{base}/ledger/{DID}/verify"))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(verify["valid"], true);

        let reputation: Vec<ReputationView> = client
            .get(format!("{base}/reputation"))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(reputation.len(), 1);
        assert_eq!(reputation[0].grade, "C");

        let missing = client.get(format!("{base}/batches/batch-99")).send().await?;
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_identity_is_a_bad_request() -> anyhow::Result<()> {
        let (base, _pipeline) = serve().await?;
        let response = reqwest::Client::new()
            .post(format!("{base}/actions"))
            .json(&json!({
                "identity": "did:robo:nobody",
                "action_type": "DELIV_DONE",
                "payload": "x"
            }))
            .send()
            .await?;
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        Ok(())
    }
}
