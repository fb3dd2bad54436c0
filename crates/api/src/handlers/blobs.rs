use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, State},
    http::header,
    response::IntoResponse,
    Json,
};
use coordinator_core::models::is_valid_digest;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult},
    response::{created, empty},
    routes::AppState,
};

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub digest: String,
    pub size: usize,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub digest: String,
}

/// 上传内容；上传者持有一次引用，直到调用 `/blob/release`
pub async fn upload_blob(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let digest = state.services.blobs.put(&body).await?;
    Ok(created(UploadResponse {
        digest,
        size: body.len(),
    }))
}

pub async fn download_blob(
    State(state): State<AppState>,
    Path(digest): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if !is_valid_digest(&digest) {
        return Err(ApiError::BadRequest(format!("无效的摘要: {}", digest)));
    }
    let content = state.services.blobs.get(&digest).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        content,
    ))
}

/// 释放上传时取得的引用
pub async fn release_blob(
    State(state): State<AppState>,
    payload: Result<Json<ReleaseRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    if !is_valid_digest(&request.digest) {
        return Err(ApiError::BadRequest(format!("无效的摘要: {}", request.digest)));
    }
    state.services.blobs.release(&request.digest).await?;
    Ok(empty("引用已释放"))
}
