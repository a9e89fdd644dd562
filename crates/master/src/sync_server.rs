//! # 文件同步HTTP服务
//!
//! 工作节点执行任务前从这里拉取爬虫文件。批量字节走HTTP而不占用
//! RPC控制通道。鉴权复用主从共享密钥（Authorization头）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crawler_common::fs::{join_under, scan_directory};
use crawler_errors::{CrawlerError, CrawlerResult};

pub struct SyncState {
    pub workspace: PathBuf,
    pub auth_key: String,
}

pub fn sync_router(state: Arc<SyncState>) -> Router {
    Router::new()
        .route("/sync/:id/scan", get(handle_scan))
        .route("/sync/:id/download", get(handle_download))
        .with_state(state)
}

/// 启动HTTP服务
pub async fn serve(
    state: Arc<SyncState>,
    listener: tokio::net::TcpListener,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> CrawlerResult<()> {
    let addr = listener
        .local_addr()
        .map_err(|e| CrawlerError::network(e.to_string()))?;
    info!("文件同步服务监听: {}", addr);

    axum::serve(listener, sync_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .map_err(|e| CrawlerError::network(format!("文件同步服务异常退出: {e}")))
}

fn check_auth(headers: &HeaderMap, auth_key: &str) -> Result<(), StatusCode> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if token != auth_key {
        warn!("文件同步请求鉴权失败");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn handle_scan(
    State(state): State<Arc<SyncState>>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(status) = check_auth(&headers, &state.auth_key) {
        return status.into_response();
    }

    let sub_path = params.get("path").cloned().unwrap_or_default();
    let root = match join_under(&state.workspace, &id)
        .and_then(|dir| join_under(&dir, &sub_path))
    {
        Ok(root) => root,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    debug!("扫描目录: {}", root.display());
    match scan_directory(&root) {
        Ok(files) => Json(serde_json::json!({ "data": files })).into_response(),
        Err(e) => {
            warn!("扫描目录失败 {}: {}", root.display(), e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_download(
    State(state): State<Arc<SyncState>>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(status) = check_auth(&headers, &state.auth_key) {
        return status.into_response();
    }

    let rel = params.get("path").cloned().unwrap_or_default();
    let file_path = match join_under(&state.workspace, &id).and_then(|dir| join_under(&dir, &rel))
    {
        Ok(path) => path,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    match tokio::fs::read(&file_path).await {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/octet-stream")
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            StatusCode::NOT_FOUND.into_response()
        }
        Err(e) => {
            warn!("读取文件失败 {}: {}", file_path.display(), e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    fn make_state(dir: &std::path::Path) -> Arc<SyncState> {
        Arc::new(SyncState {
            workspace: dir.to_path_buf(),
            auth_key: "secret".to_string(),
        })
    }

    #[tokio::test]
    async fn test_scan_requires_auth() {
        let dir = tempfile::tempdir().unwrap();
        let router = sync_router(make_state(dir.path()));

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/sync/s1/scan")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_scan_and_download() {
        let dir = tempfile::tempdir().unwrap();
        let spider_dir = dir.path().join("s1");
        std::fs::create_dir_all(&spider_dir).unwrap();
        std::fs::write(spider_dir.join("main.py"), b"print('hi')").unwrap();

        let router = sync_router(make_state(dir.path()));

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/sync/s1/scan")
                    .header("authorization", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["data"]["main.py"]["hash"].as_str().unwrap().len() == 64);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/sync/s1/download?path=main.py")
                    .header("authorization", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"print('hi')");

        // 不存在的文件404
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/sync/s1/download?path=missing.py")
                    .header("authorization", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let router = sync_router(make_state(dir.path()));

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/sync/s1/download?path=../../etc/passwd")
                    .header("authorization", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
