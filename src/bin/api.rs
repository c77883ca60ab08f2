use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Datelike, Days, NaiveDate};
use clap::Parser;
use letterscope::buckets::{self, Bucket};
use letterscope::chunks;
use letterscope::concepts::{
    self, ConceptKey, ResolvedConcept, SERIES_SCOPE, TOPIC_SCOPE,
};
use letterscope::embedding::EmbeddingClient;
use letterscope::frequency::{self, LetterCountCache, ScoreStats};
use letterscope::llm::ExpansionClient;
use letterscope::scorer;
use letterscope::search::PgVectorSearch;
use letterscope::series::{self, SeriesPoint};
use letterscope::{ConceptExpansion, PgConceptCache, TableName};
use serde::{Deserialize, Serialize};
use tokio_postgres::NoTls;

#[derive(Parser, Debug)]
#[command(
    name = "letterscope-api",
    about = "HTTP API serving concept time series and topic frequency over the letter corpus"
)]
struct ApiCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "LETTERSCOPE_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Postgres connection string (postgres://...).
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Schema holding every letterscope table.
    #[arg(long, env = "LETTERSCOPE_SCHEMA", default_value = "public")]
    schema: String,

    /// Table storing ingested chunks.
    #[arg(long, env = "LETTERSCOPE_CHUNK_TABLE", default_value = "letter_chunks")]
    chunk_table: String,

    /// Table storing bucket mean embeddings.
    #[arg(
        long,
        env = "LETTERSCOPE_BUCKET_TABLE",
        default_value = "bucket_embeddings"
    )]
    bucket_table: String,

    /// Table backing the concept cache.
    #[arg(
        long,
        env = "LETTERSCOPE_CONCEPT_TABLE",
        default_value = "concept_cache"
    )]
    concept_table: String,

    /// API key used for chat and embedding calls.
    #[arg(long, env = "OPENAI_API_KEY")]
    openai_api_key: String,

    /// Base URL for OpenAI-compatible endpoints.
    #[arg(
        long,
        env = "LETTERSCOPE_OPENAI_BASE",
        default_value = "https://api.openai.com/v1"
    )]
    openai_base_url: String,

    /// Default chat model for concept expansion.
    #[arg(long, env = "LETTERSCOPE_CHAT_MODEL", default_value = concepts::DEFAULT_CHAT_MODEL)]
    chat_model: String,

    /// Default embedding model for concept embeddings.
    #[arg(
        long,
        env = "LETTERSCOPE_EMBEDDING_MODEL",
        default_value = concepts::DEFAULT_EMBEDDING_MODEL
    )]
    embedding_model: String,

    /// Output dimensionality pinned for concept embeddings.
    #[arg(
        long,
        env = "LETTERSCOPE_EMBEDDING_DIMENSIONS",
        default_value_t = concepts::DEFAULT_EMBEDDING_DIMENSIONS
    )]
    dimensions: usize,

    /// Seconds before chat requests time out.
    #[arg(long, env = "LETTERSCOPE_CHAT_TIMEOUT_SECS", default_value_t = 60)]
    chat_timeout_secs: u64,

    /// Seconds before embedding requests time out.
    #[arg(long, env = "LETTERSCOPE_EMBED_TIMEOUT_SECS", default_value_t = 30)]
    embed_timeout_secs: u64,

    /// Sampling temperature for the expansion model.
    #[arg(long, default_value_t = 0.2)]
    chat_temperature: f32,

    /// Max completion tokens requested from the expansion model.
    #[arg(long, default_value_t = 600)]
    chat_max_tokens: usize,

    /// Maximum candidate pool size a topic-frequency request may ask for.
    #[arg(long, default_value_t = 2000)]
    max_sample_size: usize,

    /// Maximum number of series points a single request may enumerate.
    #[arg(long, default_value_t = 2000)]
    max_series_points: usize,

    /// Max sources kept in the letter-count cache.
    #[arg(long, default_value_t = 256)]
    count_cache_size: usize,

    /// Seconds a cached per-source letter count stays fresh.
    #[arg(long, default_value_t = 300)]
    count_cache_ttl_secs: u64,
}

struct ModelSettings {
    api_key: String,
    base_url: String,
    chat_model: String,
    embedding_model: String,
    dimensions: usize,
    chat_timeout: Duration,
    embed_timeout: Duration,
    chat_temperature: f32,
    chat_max_tokens: usize,
}

#[derive(Clone)]
struct AppState {
    db: Arc<tokio_postgres::Client>,
    chunk_table: TableName,
    bucket_table: TableName,
    concept_cache: Arc<PgConceptCache>,
    gateway: Arc<PgVectorSearch>,
    counts: Arc<LetterCountCache>,
    models: Arc<ModelSettings>,
    default_chat: Arc<ExpansionClient>,
    default_embedder: Arc<EmbeddingClient>,
    max_sample_size: usize,
    max_series_points: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeriesParams {
    term: Option<String>,
    bucket: Option<String>,
    from: Option<String>,
    to: Option<String>,
    smoothing_window: Option<String>,
    source: Option<String>,
    chat_model: Option<String>,
    embedding_model: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SeriesResponse {
    term: String,
    bucket: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<NaiveDate>,
    smoothing_window: usize,
    expansion: ConceptExpansion,
    series: Vec<SeriesPoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopicParams {
    topic: Option<String>,
    source: Option<String>,
    sample_size: Option<String>,
    min_score: Option<String>,
    debug: Option<String>,
    chat_model: Option<String>,
    embedding_model: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TopicResponse {
    query: String,
    matched_query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    definition: Option<String>,
    letter_count: u64,
    total_letters: u64,
    percent: u32,
    score_threshold: f64,
    sample_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    debug: Option<TopicDebug>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TopicDebug {
    source: String,
    candidate_count: usize,
    query_embedding_dims: usize,
    score_stats: ScoreStats,
    top: Vec<TopicDebugHit>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TopicDebugHit {
    score: f64,
    letter_id: i64,
    chunk_index: i64,
}

#[derive(Debug, Serialize)]
struct SourcesResponse {
    sources: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ApiCli::parse();
    let chunk_table = TableName::new(cli.schema.clone(), cli.chunk_table.clone())?;
    let bucket_table = TableName::new(cli.schema.clone(), cli.bucket_table.clone())?;
    let concept_table = TableName::new(cli.schema.clone(), cli.concept_table.clone())?;

    let models = Arc::new(ModelSettings {
        api_key: cli.openai_api_key.clone(),
        base_url: cli.openai_base_url.clone(),
        chat_model: cli.chat_model.clone(),
        embedding_model: cli.embedding_model.clone(),
        dimensions: cli.dimensions,
        chat_timeout: Duration::from_secs(cli.chat_timeout_secs.max(1)),
        embed_timeout: Duration::from_secs(cli.embed_timeout_secs.max(1)),
        chat_temperature: cli.chat_temperature,
        chat_max_tokens: cli.chat_max_tokens.max(1),
    });
    let default_chat = Arc::new(build_chat_client(&models, &models.chat_model)?);
    let default_embedder = Arc::new(build_embed_client(&models, &models.embedding_model)?);

    let (client, connection) = tokio_postgres::connect(&cli.database_url, NoTls)
        .await
        .with_context(|| format!("failed to connect to Postgres at {}", cli.database_url))?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            eprintln!("postgres connection error: {err}");
        }
    });
    let db = Arc::new(client);

    let concept_cache = Arc::new(PgConceptCache::new(Arc::clone(&db), concept_table));
    concept_cache.ensure_table().await?;

    let counts = Arc::new(LetterCountCache::new(
        NonZeroUsize::new(cli.count_cache_size.max(1)).context("count cache size must be positive")?,
        Duration::from_secs(cli.count_cache_ttl_secs.max(1)),
    ));
    let gateway = Arc::new(PgVectorSearch::new(Arc::clone(&db), chunk_table.clone()));

    let state = AppState {
        db,
        chunk_table,
        bucket_table,
        concept_cache,
        gateway,
        counts,
        models,
        default_chat,
        default_embedder,
        max_sample_size: cli.max_sample_size.max(1),
        max_series_points: cli.max_series_points.max(1),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/series", get(series_get).post(series_post))
        .route("/v1/topic-frequency", get(topic_frequency))
        .route("/v1/sources", get(sources))
        .with_state(state);

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    println!("letterscope-api listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .await
        .context("server shutdown")?;
    Ok(())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn series_get(
    State(state): State<AppState>,
    Query(params): Query<SeriesParams>,
) -> Result<Json<SeriesResponse>, ApiError> {
    run_series(state, params).await
}

/// POST bodies mirror the GET parameters; string, number, and boolean
/// values are all accepted and read as their string forms.
async fn series_post(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<SeriesResponse>, ApiError> {
    let field = |key: &str| body.get(key).and_then(json_param_to_string);
    let params = SeriesParams {
        term: field("term"),
        bucket: field("bucket"),
        from: field("from"),
        to: field("to"),
        smoothing_window: field("smoothingWindow"),
        source: field("source"),
        chat_model: field("chatModel"),
        embedding_model: field("embeddingModel"),
    };
    run_series(state, params).await
}

fn json_param_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

async fn run_series(
    state: AppState,
    params: SeriesParams,
) -> Result<Json<SeriesResponse>, ApiError> {
    let term = match params.term.as_deref().map(str::trim) {
        Some(term) if !term.is_empty() && term.len() <= 80 => term.to_string(),
        _ => return Err(bad_request("invalid `term` (1-80 characters required)")),
    };
    let bucket = match params.bucket.as_deref() {
        None => Bucket::Week,
        Some(raw) => {
            Bucket::parse(raw).ok_or_else(|| bad_request("invalid `bucket`; use week or month"))?
        }
    };
    let smoothing_window = match params.smoothing_window.as_deref() {
        None => 7,
        Some(raw) => match raw.parse::<usize>() {
            Ok(window) if window >= 1 => window,
            _ => return Err(bad_request("invalid `smoothingWindow`; use a positive integer")),
        },
    };
    let from = parse_date_param(params.from.as_deref(), "from")?;
    let to = parse_date_param(params.to.as_deref(), "to")?;
    let source = normalize_source(params.source);

    let bounds = buckets::fetch_corpus_bounds(
        &state.db,
        &state.bucket_table,
        bucket,
        source.as_deref(),
    )
    .await
    .map_err(internal_error)?;
    let (from, to) = clamp_range(from, to, bounds);
    if let (Some(from), Some(to)) = (from, to) {
        if boundary_count(bucket, from, to) > state.max_series_points {
            return Err(bad_request("requested date range is too large"));
        }
    }

    let resolved = resolve_concept(
        &state,
        &term,
        SERIES_SCOPE,
        params.chat_model.as_deref(),
        params.embedding_model.as_deref(),
    )
    .await?;

    let rows = buckets::fetch_bucket_rows(
        &state.db,
        &state.bucket_table,
        bucket,
        from,
        to,
        source.as_deref(),
    )
    .await
    .map_err(internal_error)?;

    let scored = scorer::score_buckets(&resolved.query_embedding, &rows);
    let series = series::assemble(bucket, &scored, from, to, smoothing_window);

    Ok(Json(SeriesResponse {
        term,
        bucket: bucket.as_str(),
        from,
        to,
        smoothing_window,
        expansion: resolved.expansion,
        series,
    }))
}

async fn topic_frequency(
    State(state): State<AppState>,
    Query(params): Query<TopicParams>,
) -> Result<Json<TopicResponse>, ApiError> {
    let topic = match params.topic.as_deref().map(str::trim) {
        Some(topic) if !topic.is_empty() && topic.len() <= 120 => topic.to_string(),
        _ => return Err(bad_request("invalid `topic` (1-120 characters required)")),
    };
    let source = normalize_source(params.source)
        .unwrap_or_else(|| letterscope::DEFAULT_SOURCE.to_string());
    let sample_size = match params.sample_size.as_deref() {
        None => frequency::DEFAULT_SAMPLE_SIZE,
        Some(raw) => match raw.parse::<usize>() {
            Ok(size) if size >= 1 => size.min(state.max_sample_size),
            _ => return Err(bad_request("invalid `sampleSize`; use a positive integer")),
        },
    };
    let threshold = match params.min_score.as_deref() {
        None => frequency::DEFAULT_SCORE_THRESHOLD,
        Some(raw) => match raw.parse::<f64>() {
            Ok(score) if score.is_finite() => score.clamp(0.0, 1.0),
            _ => return Err(bad_request("invalid `minScore`; use a number in [0,1]")),
        },
    };
    let debug = matches!(params.debug.as_deref(), Some("1") | Some("true"));

    let resolved = resolve_concept(
        &state,
        &topic,
        TOPIC_SCOPE,
        params.chat_model.as_deref(),
        params.embedding_model.as_deref(),
    )
    .await?;

    let total_letters = match state.counts.get(&source).await {
        Some(count) => count,
        None => {
            let count = chunks::distinct_letter_count(&state.db, &state.chunk_table, &source)
                .await
                .map_err(internal_error)?;
            state.counts.put(&source, count).await;
            count
        }
    };

    let outcome = frequency::classify(
        state.gateway.as_ref(),
        &resolved.query_embedding,
        &source,
        sample_size,
        threshold,
        total_letters,
    )
    .await
    .map_err(internal_error)?;

    let debug_payload = debug.then(|| TopicDebug {
        source: source.clone(),
        candidate_count: outcome.scores.len(),
        query_embedding_dims: resolved.query_embedding.len(),
        score_stats: frequency::score_stats(&outcome.scores),
        top: outcome
            .top
            .iter()
            .map(|hit| TopicDebugHit {
                score: hit.score,
                letter_id: hit.letter_id,
                chunk_index: hit.chunk_index,
            })
            .collect(),
    });

    let matched_query = if resolved.expansion.term.trim().is_empty() {
        topic.clone()
    } else {
        resolved.expansion.term.clone()
    };
    Ok(Json(TopicResponse {
        query: topic,
        matched_query,
        definition: Some(resolved.expansion.definition.clone())
            .filter(|d| !d.trim().is_empty()),
        letter_count: outcome.frequency.matched_letters,
        total_letters: outcome.frequency.total_letters,
        percent: outcome.frequency.percent,
        score_threshold: outcome.frequency.score_threshold,
        sample_size: outcome.frequency.sample_size,
        debug: debug_payload,
    }))
}

async fn sources(State(state): State<AppState>) -> Result<Json<SourcesResponse>, ApiError> {
    let sources = chunks::distinct_sources(&state.db, &state.chunk_table)
        .await
        .map_err(internal_error)?;
    Ok(Json(SourcesResponse { sources }))
}

/// Resolves a concept through the cache, honoring per-request model
/// overrides. On a miss this spends one chat call and one embedding call.
async fn resolve_concept(
    state: &AppState,
    term: &str,
    scope: &str,
    chat_override: Option<&str>,
    embed_override: Option<&str>,
) -> Result<ResolvedConcept, ApiError> {
    let chat_model = chat_override
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(&state.models.chat_model)
        .to_string();
    let embedding_model = embed_override
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(&state.models.embedding_model)
        .to_string();

    let chat = if chat_model == state.models.chat_model {
        Arc::clone(&state.default_chat)
    } else {
        Arc::new(build_chat_client(&state.models, &chat_model).map_err(internal_error)?)
    };
    let embedder = if embedding_model == state.models.embedding_model {
        Arc::clone(&state.default_embedder)
    } else {
        Arc::new(build_embed_client(&state.models, &embedding_model).map_err(internal_error)?)
    };

    let key = ConceptKey {
        term: term.to_string(),
        scope: scope.to_string(),
        chat_model,
        embedding_model,
        dimensions: state.models.dimensions as i32,
    };
    concepts::resolve(state.concept_cache.as_ref(), &chat, &embedder, &key)
        .await
        .map_err(internal_error)
}

fn build_chat_client(models: &ModelSettings, chat_model: &str) -> Result<ExpansionClient> {
    ExpansionClient::new(
        models.api_key.clone(),
        models.base_url.clone(),
        chat_model.to_string(),
        models.chat_temperature,
        models.chat_max_tokens,
        models.chat_timeout,
    )
}

fn build_embed_client(models: &ModelSettings, embedding_model: &str) -> Result<EmbeddingClient> {
    EmbeddingClient::new(
        models.api_key.clone(),
        models.base_url.clone(),
        embedding_model.to_string(),
        models.dimensions,
        models.embed_timeout,
        1,
    )
}

fn parse_date_param(value: Option<&str>, name: &str) -> Result<Option<NaiveDate>, ApiError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<NaiveDate>()
            .map(Some)
            .map_err(|_| bad_request(format!("invalid `{name}`; use an ISO date (YYYY-MM-DD)"))),
    }
}

fn normalize_source(source: Option<String>) -> Option<String> {
    source
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Clamps a requested range near the corpus's known bounds so a hostile
/// range cannot drive an unbounded backfill loop. A year of slack on each
/// side keeps modest out-of-corpus requests intact (they come back as
/// zero-filled series).
fn clamp_range(
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    bounds: Option<(NaiveDate, NaiveDate)>,
) -> (Option<NaiveDate>, Option<NaiveDate>) {
    let Some((lo, hi)) = bounds else {
        return (from, to);
    };
    let floor = lo.checked_sub_days(Days::new(366)).unwrap_or(lo);
    let ceil = hi.checked_add_days(Days::new(366)).unwrap_or(hi);
    (
        from.map(|d| d.clamp(floor, ceil)),
        to.map(|d| d.clamp(floor, ceil)),
    )
}

/// Inclusive count of bucket boundaries between two dates.
fn boundary_count(bucket: Bucket, from: NaiveDate, to: NaiveDate) -> usize {
    if from > to {
        return 0;
    }
    match bucket {
        Bucket::Week => ((to - from).num_days() / 7) as usize + 1,
        Bucket::Month => {
            let from_months = from.year() as i64 * 12 + from.month0() as i64;
            let to_months = to.year() as i64 * 12 + to.month0() as i64;
            (to_months - from_months).max(0) as usize + 1
        }
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

fn internal_error(err: anyhow::Error) -> ApiError {
    eprintln!("internal error: {err:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
}
