use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    middleware::from_fn,
    response::Json,
    routing::{get, post},
};
use guideline_rag::{
    ChatQuery, FastEmbedder, GenerationClient, GuidelineRetriever, InMemoryVectorIndex,
    PatientInput, PgVectorIndex, Pipeline, RetryingClient, Retriever, RigClient, VectorIndex,
    VertexClient, VertexConfig,
};
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

use crate::{
    config::{GenerationSettings, ServiceConfig, VectorIndexSource},
    error::ApiError,
    models::{AssessmentResponse, ChatResponse, PatientsAdded},
    patients::{PatientRecord, PatientRegistry},
    telemetry::correlation_id_middleware,
};

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub patients: PatientRegistry,
}

pub async fn create_app(config: &ServiceConfig) -> anyhow::Result<Router> {
    let app_state = create_app_state(config).await?;
    Ok(build_router(app_state))
}

/// Loads the embedding model, index, model client and registry, then warms
/// the pipeline. Warm-up failures are logged and do not stop start-up.
pub async fn create_app_state(config: &ServiceConfig) -> anyhow::Result<AppState> {
    let retriever = create_retriever(config).await?;
    let generator = create_generator(config)?;
    let pipeline = Arc::new(Pipeline::new(retriever, generator, config.pipeline.clone()));

    let report = pipeline.warmup(config.generation_timeout).await;
    info!(
        retrieval_ok = report.retrieval_ok,
        generation_ok = report.generation_ok,
        "pipeline warm-up finished"
    );

    let patients = PatientRegistry::load(&config.patients_path)
        .await
        .context("failed to load the patient registry")?;

    Ok(AppState { pipeline, patients })
}

async fn create_retriever(config: &ServiceConfig) -> anyhow::Result<Arc<dyn Retriever>> {
    let embedder = FastEmbedder::new()
        .await
        .context("failed to load the embedding model")?;

    let index: Arc<dyn VectorIndex> = match &config.vector_index {
        VectorIndexSource::Postgres(url) => {
            info!("Using pgvector guideline index");
            Arc::new(
                PgVectorIndex::connect(url)
                    .await
                    .context("failed to connect to the vector index")?,
            )
        }
        VectorIndexSource::JsonFile(path) => {
            info!(path = %path.display(), "Using in-memory guideline index (set VECTOR_INDEX_URL to use pgvector)");
            Arc::new(
                InMemoryVectorIndex::load(path)
                    .await
                    .context("failed to load the guideline index")?,
            )
        }
    };

    Ok(Arc::new(GuidelineRetriever::new(
        Arc::new(embedder),
        index,
        config.similarity_threshold,
    )))
}

fn create_generator(config: &ServiceConfig) -> anyhow::Result<Arc<dyn GenerationClient>> {
    let client: Arc<dyn GenerationClient> = match &config.generation {
        GenerationSettings::Vertex {
            project_id,
            location,
            access_token,
        } => Arc::new(
            VertexClient::new(VertexConfig {
                project_id: project_id.clone(),
                location: location.clone(),
                model: config.model.clone(),
                access_token: access_token.clone(),
                timeout: config.generation_timeout,
            })
            .context("failed to build the Vertex AI client")?,
        ),
        GenerationSettings::OpenRouter { api_key } => Arc::new(RigClient::openrouter(
            api_key,
            &config.model,
            config.generation_timeout,
        )),
    };
    info!(model = client.model(), "generation client ready");

    Ok(Arc::new(RetryingClient::new(client, config.retry.clone())))
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/assess", post(assess))
        .route("/assess/{patient_id}", get(assess_patient))
        .route("/chat", post(chat))
        .route("/patients", get(list_patients).post(add_patients))
        .route("/patients/{patient_id}", get(get_patient))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(from_fn(correlation_id_middleware))
        .with_state(app_state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "NG12 Referral Assistant",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Guideline-grounded suspected cancer referral assessment and Q&A over NICE NG12",
        "endpoints": {
            "POST /assess": "Assess a patient payload against NG12",
            "GET /assess/{patient_id}": "Assess a registered patient",
            "POST /chat": "Ask a question answered from NG12 with page citations",
            "GET /patients": "List registered patient ids",
            "GET /patients/{patient_id}": "Get a registered patient",
            "POST /patients": "Register new patients",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// serde's rejection text quotes the offending value, so only the kind of
/// failure is reported back.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload.map(|Json(body)| body).map_err(|rejection| {
        let message = match &rejection {
            JsonRejection::JsonDataError(_) => {
                "Request body does not have the expected fields and types"
            }
            JsonRejection::JsonSyntaxError(_) => "Request body is not valid JSON",
            JsonRejection::MissingJsonContentType(_) => {
                "Expected request with `Content-Type: application/json`"
            }
            _ => "Request body could not be read",
        };
        debug!(status = rejection.status().as_u16(), "rejected request body");
        ApiError::BadRequest(message)
    })
}

async fn assess(
    State(state): State<AppState>,
    payload: Result<Json<PatientInput>, JsonRejection>,
) -> ApiResult<AssessmentResponse> {
    let patient = json_body(payload)?;
    info!(symptoms = patient.symptoms.len(), "assessment requested");

    let outcome = state.pipeline.assess(&patient).await?;
    Ok(Json(AssessmentResponse::new(outcome, None)))
}

async fn assess_patient(
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
) -> ApiResult<AssessmentResponse> {
    info!(patient_id = %patient_id, "assessment requested for registered patient");

    let record = state
        .patients
        .get(&patient_id)
        .ok_or(ApiError::NotFound { what: "patient" })?;
    let outcome = state.pipeline.assess(&record.to_input()).await?;
    Ok(Json(AssessmentResponse::new(outcome, Some(patient_id))))
}

async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatQuery>, JsonRejection>,
) -> ApiResult<ChatResponse> {
    let query = json_body(payload)?;
    info!(history_turns = query.history.len(), top_k = ?query.top_k, "chat requested");

    let outcome = state.pipeline.chat(&query).await?;
    Ok(Json(outcome.into()))
}

async fn list_patients(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.patients.ids())
}

async fn get_patient(
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
) -> ApiResult<PatientRecord> {
    state
        .patients
        .get(&patient_id)
        .map(Json)
        .ok_or(ApiError::NotFound { what: "patient" })
}

async fn add_patients(
    State(state): State<AppState>,
    payload: Result<Json<Vec<PatientRecord>>, JsonRejection>,
) -> Result<(StatusCode, Json<PatientsAdded>), ApiError> {
    let records = json_body(payload)?;
    let submitted = records.len();
    let added = state.patients.add(records).await?;
    info!(submitted, added, "patients submitted");
    Ok((StatusCode::CREATED, Json(PatientsAdded::new(added))))
}
