use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{IndexError, Result};
use crate::git::GitCredentials;
use crate::service::{AddFileInfo, GitIndexOptions, IndexService, SingleFileOutcome, UpsertOutcome};
use crate::types::DocumentMeta;

/// Uniform response envelope: `code=200` on success, `-1` on failure.
/// Runtime errors never escape as transport errors.
#[derive(Debug, Serialize)]
pub struct ApiResult<T> {
    pub code: i32,
    pub message: String,
    pub data: Option<T>,
    pub success: bool,
}

impl<T> ApiResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: 200,
            message: "Success".to_string(),
            data: Some(data),
            success: true,
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            code: 200,
            message: "Success".to_string(),
            data: None,
            success: true,
        }
    }

    pub fn failed(message: String) -> Self {
        Self {
            code: -1,
            message,
            data: None,
            success: false,
        }
    }
}

fn respond<T>(result: Result<T>) -> Json<ApiResult<T>> {
    match result {
        Ok(data) => Json(ApiResult::ok(data)),
        Err(e) => {
            tracing::error!(error = %e, "request failed");
            Json(ApiResult::failed(e.to_string()))
        }
    }
}

fn respond_empty(result: Result<()>) -> Json<ApiResult<()>> {
    match result {
        Ok(()) => Json(ApiResult::ok_empty()),
        Err(e) => {
            tracing::error!(error = %e, "request failed");
            Json(ApiResult::failed(e.to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct AddIndexRequest {
    uid: String,
    repo_abs_path: String,
    file_infos: Vec<AddFileInfo>,
}

#[derive(Debug, Deserialize)]
struct DropIndexRequest {
    repo_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct DeleteIndexRequest {
    repo_id: Uuid,
    file_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
struct AllIndexRequest {
    repo_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct RetrievalRequest {
    repo_id: Uuid,
    #[serde(default)]
    file_ids: Option<Vec<Uuid>>,
    query: String,
}

#[derive(Debug, Deserialize)]
struct GitIndexRequest {
    #[serde(default)]
    uid: Option<String>,
    repo_url: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

pub fn router(service: IndexService) -> Router {
    Router::new()
        .route("/vector/upsert_index", post(upsert_index))
        .route("/vector/upsert_index_by_file", post(upsert_index_by_file))
        .route("/vector/drop_index", post(drop_index))
        .route("/vector/delete_index", post(delete_index))
        .route("/vector/all_index", post(all_index))
        .route("/vector/retrieval", post(retrieval))
        .route("/git/clone_and_index", post(clone_and_index))
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
        .with_state(service)
}

pub async fn serve(settings: &Settings, service: IndexService) -> Result<()> {
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| IndexError::Config(format!("cannot bind {addr}: {e}")))?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, router(service))
        .await
        .map_err(|e| IndexError::Internal(e.to_string()))
}

async fn upsert_index(
    State(service): State<IndexService>,
    Json(request): Json<AddIndexRequest>,
) -> Json<ApiResult<UpsertOutcome>> {
    respond(
        service
            .upsert_index(&request.uid, &request.repo_abs_path, request.file_infos)
            .await,
    )
}

async fn upsert_index_by_file(
    State(service): State<IndexService>,
    mut multipart: Multipart,
) -> Json<ApiResult<SingleFileOutcome>> {
    let mut uid = None;
    let mut repo_abs_path = None;
    let mut relative_path = None;
    let mut file = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Json(ApiResult::failed(format!("invalid multipart body: {e}"))),
        };
        let name = field.name().unwrap_or_default().to_string();
        let value = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return Json(ApiResult::failed(format!("invalid multipart field: {e}"))),
        };
        match name.as_str() {
            "uid" => uid = Some(String::from_utf8_lossy(&value).into_owned()),
            "repo_abs_path" => repo_abs_path = Some(String::from_utf8_lossy(&value).into_owned()),
            "relative_path" => relative_path = Some(String::from_utf8_lossy(&value).into_owned()),
            "file" => file = Some(value.to_vec()),
            _ => {}
        }
    }

    let (Some(uid), Some(repo_abs_path), Some(relative_path), Some(file)) =
        (uid, repo_abs_path, relative_path, file)
    else {
        return Json(ApiResult::failed(
            "uid, repo_abs_path, relative_path and file are required".to_string(),
        ));
    };

    respond(
        service
            .upsert_single_file(&uid, &repo_abs_path, &relative_path, file)
            .await,
    )
}

async fn drop_index(
    State(service): State<IndexService>,
    Json(request): Json<DropIndexRequest>,
) -> Json<ApiResult<()>> {
    respond_empty(service.drop_index(request.repo_id).await)
}

async fn delete_index(
    State(service): State<IndexService>,
    Json(request): Json<DeleteIndexRequest>,
) -> Json<ApiResult<()>> {
    respond_empty(service.delete_index(request.repo_id, &request.file_ids).await)
}

async fn all_index(
    State(service): State<IndexService>,
    Json(request): Json<AllIndexRequest>,
) -> Json<ApiResult<Vec<DocumentMeta>>> {
    respond(service.all_index(request.repo_id).await)
}

async fn retrieval(
    State(service): State<IndexService>,
    Json(request): Json<RetrievalRequest>,
) -> Json<ApiResult<Vec<DocumentMeta>>> {
    respond(
        service
            .retrieval(request.repo_id, request.file_ids, &request.query)
            .await,
    )
}

async fn clone_and_index(
    State(service): State<IndexService>,
    Json(request): Json<GitIndexRequest>,
) -> Json<ApiResult<UpsertOutcome>> {
    respond(
        service
            .clone_and_index(GitIndexOptions {
                uid: request.uid,
                repo_url: request.repo_url,
                credentials: GitCredentials {
                    username: request.username,
                    password: request.password,
                    access_token: request.access_token,
                },
            })
            .await,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serialization() {
        let ok = serde_json::to_value(ApiResult::ok(vec![1, 2])).unwrap();
        assert_eq!(ok["code"], 200);
        assert_eq!(ok["success"], true);
        assert_eq!(ok["data"], serde_json::json!([1, 2]));

        let failed = serde_json::to_value(ApiResult::<()>::failed("boom".into())).unwrap();
        assert_eq!(failed["code"], -1);
        assert_eq!(failed["success"], false);
        assert_eq!(failed["data"], serde_json::Value::Null);
    }

    #[test]
    fn retrieval_request_accepts_missing_file_ids() {
        let request: RetrievalRequest = serde_json::from_value(serde_json::json!({
            "repo_id": "1f4e75a0-1b2a-5f6e-8d3c-9a1b2c3d4e5f",
            "query": "where is the config loaded"
        }))
        .unwrap();
        assert!(request.file_ids.is_none());
        assert_eq!(request.query, "where is the config loaded");
    }
}
