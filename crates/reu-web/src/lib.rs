//! Axum read path over the program store.
//!
//! Serves the synchronized records; ingestion failures never surface here
//! beyond stale or missing listings.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use reu_core::Program;
use reu_store::{ProgramStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "reu-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ProgramStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn ProgramStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ProgramsQuery {
    /// Optional subject-area tag filter, matched case-insensitively.
    field: Option<String>,
}

/// User-suggested listing; enters the same table as scraped programs.
#[derive(Debug, Clone, Deserialize)]
pub struct SuggestProgram {
    pub title: String,
    pub url: Option<String>,
    #[serde(default)]
    pub field: Vec<String>,
    pub deadline: Option<String>,
    pub description: Option<String>,
    pub institution: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/programs", get(list_programs_handler))
        .route("/programs/{id}", get(get_program_handler))
        .route("/programs/suggest", post(suggest_program_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn list_programs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProgramsQuery>,
) -> Response {
    match state.store.list().await {
        Ok(mut programs) => {
            if let Some(tag) = &query.field {
                programs.retain(|p| p.field.iter().any(|f| f.eq_ignore_ascii_case(tag)));
            }
            Json(programs).into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn get_program_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.store.get(id).await {
        Ok(Some(program)) => Json(program).into_response(),
        Ok(None) => not_found(),
        Err(err) => store_error(err),
    }
}

async fn suggest_program_handler(
    State(state): State<Arc<AppState>>,
    Json(suggestion): Json<SuggestProgram>,
) -> Response {
    let title = suggestion.title.trim().to_string();
    if title.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorBody {
                error: "title must not be empty".to_string(),
            }),
        )
            .into_response();
    }

    let url = suggestion
        .url
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string);
    if let Some(url) = &url {
        match state.store.find_by_url(url).await {
            Ok(Some(_)) => {
                return (
                    StatusCode::CONFLICT,
                    Json(ErrorBody {
                        error: format!("a program with url `{url}` already exists"),
                    }),
                )
                    .into_response();
            }
            Ok(None) => {}
            Err(err) => return store_error(err),
        }
    }

    let now = Utc::now();
    let program = Program {
        id: Uuid::new_v4(),
        title,
        url,
        field: suggestion.field,
        deadline: suggestion.deadline,
        description: suggestion.description,
        institution: suggestion.institution,
        created_at: now,
        updated_at: now,
    };

    match state.store.insert(&program).await {
        Ok(()) => (StatusCode::CREATED, Json(program)).into_response(),
        Err(StoreError::DuplicateUrl(url)) => (
            StatusCode::CONFLICT,
            Json(ErrorBody {
                error: format!("a program with url `{url}` already exists"),
            }),
        )
            .into_response(),
        Err(err) => store_error(err),
    }
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: "program not found".to_string(),
        }),
    )
        .into_response()
}

fn store_error(err: StoreError) -> Response {
    error!(target: "reu", "store error on read path: {err}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: "store unavailable".to_string(),
        }),
    )
        .into_response()
}
