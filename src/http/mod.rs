//! HTTP 服务器模块
//!
//! 对外提供上传与存在性查询两类端点，应用状态通过中间件注入。

mod checksums;
mod state;
pub mod upload;

pub use state::AppState;

use crate::error::{Result, SortError};
use bytes::Bytes;
use futures_util::StreamExt;
use http::StatusCode;
use silent::Server;
use silent::prelude::*;
use std::net::ToSocketAddrs;
use std::path::Path;
use tracing::{info, warn};
use walkdir::WalkDir;

/// 启动 HTTP 服务器
pub async fn start_http_server(addr: &str, app_state: AppState) -> Result<()> {
    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| SortError::Config(format!("无法解析监听地址 {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| SortError::Config(format!("监听地址无效: {}", addr)))?;

    let route = Route::new_root()
        .hook(state_injector(app_state))
        .append(
            Route::new("file")
                .post(upload::push_file)
                .get(checksums::check_file),
        )
        .append(Route::new("checksums").post(checksums::check_checksums))
        .append(Route::new("checksum100k").post(checksums::check_checksum100k))
        .append(Route::new("version").get(checksums::give_version));

    info!("HTTP 服务器启动: {}", addr);

    Server::new().bind(socket_addr).serve(route).await;

    Ok(())
}

/// 启动恢复：清理上次运行残留的 `.download` 临时文件
///
/// 先索引后发布保证了这些残留没有对应的索引记录，直接删除即可。
pub fn cleanup_temp_files(save_dir: &Path) -> usize {
    let mut count = 0usize;
    for entry in WalkDir::new(save_dir).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file()
            && entry.file_name().to_string_lossy().ends_with(".download")
        {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => count += 1,
                Err(e) => warn!("清理临时文件失败: {} - {}", entry.path().display(), e),
            }
        }
    }
    if count > 0 {
        info!("已清理 {} 个孤儿临时文件", count);
    }
    count
}

/// 把请求体转成 multipart 解析器可消费的字节流
pub(crate) fn body_stream(
    body: ReqBody,
) -> futures_util::stream::BoxStream<'static, std::io::Result<Bytes>> {
    match body {
        ReqBody::Incoming(incoming) => http_body_util::BodyStream::new(incoming)
            .filter_map(|frame| async move {
                match frame {
                    Ok(frame) => frame.into_data().ok().map(Ok),
                    Err(e) => Some(Err(std::io::Error::other(e.to_string()))),
                }
            })
            .boxed(),
        ReqBody::Once(bytes) => futures_util::stream::once(async move { Ok(bytes) }).boxed(),
        ReqBody::Empty => futures_util::stream::empty().boxed(),
        other => other.boxed(),
    }
}

/// 构造带状态码的 JSON 响应
pub(crate) fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    let mut resp = Response::empty();
    resp.set_status(status);
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    resp.set_body(full(Bytes::from(body.to_string())));
    resp
}

/// 中间件：注入应用状态到 Request configs
struct StateInjector {
    state: AppState,
}

#[async_trait::async_trait]
impl MiddleWareHandler for StateInjector {
    async fn handle(&self, mut req: Request, next: &Next) -> silent::Result<Response> {
        req.configs_mut().insert(self.state.clone());
        next.call(req).await
    }
}

fn state_injector(state: AppState) -> StateInjector {
    StateInjector { state }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::InsertBatcher;
    use crate::index::MediaIndex;
    use crate::path_alloc::PathAllocator;
    use crate::queue::{UploadContext, UploadQueue};
    use std::sync::Arc;
    use tempfile::TempDir;

    pub(crate) async fn create_test_app_state() -> (AppState, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let index = Arc::new(
            MediaIndex::open(&temp_dir.path().join("index.db"))
                .await
                .unwrap(),
        );
        let batcher = Arc::new(InsertBatcher::new(index.clone(), 100));
        let allocator = Arc::new(PathAllocator::new(temp_dir.path().to_path_buf()));
        let queue = Arc::new(UploadQueue::new(
            2,
            50,
            UploadContext {
                index: index.clone(),
                batcher,
                allocator,
            },
        ));
        let app_state = AppState {
            index,
            queue,
            save_dir: temp_dir.path().to_path_buf(),
        };
        (app_state, temp_dir)
    }

    #[tokio::test]
    async fn test_app_state_clone_shares_resources() {
        let (app_state, _temp_dir) = create_test_app_state().await;
        let cloned = app_state.clone();
        assert_eq!(Arc::as_ptr(&app_state.index), Arc::as_ptr(&cloned.index));
        assert_eq!(Arc::as_ptr(&app_state.queue), Arc::as_ptr(&cloned.queue));
    }

    #[test]
    fn test_cleanup_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("2020-01")).unwrap();
        std::fs::write(root.join("2020-01/a.jpg"), b"keep").unwrap();
        std::fs::write(root.join("2020-01/b.jpg.download"), b"orphan").unwrap();
        std::fs::write(root.join("c.mp4.3.download"), b"orphan too").unwrap();

        let removed = cleanup_temp_files(root);
        assert_eq!(removed, 2);
        assert!(root.join("2020-01/a.jpg").exists());
        assert!(!root.join("2020-01/b.jpg.download").exists());
        assert!(!root.join("c.mp4.3.download").exists());
    }

    #[test]
    fn test_cleanup_temp_files_empty_dir() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(cleanup_temp_files(temp_dir.path()), 0);
    }

    #[test]
    fn test_json_response_shape() {
        let resp = json_response(StatusCode::CONFLICT, serde_json::json!({"status": "exists"}));
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_body_stream_once() {
        let stream = body_stream(ReqBody::Once(Bytes::from_static(b"hello")));
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap(), &Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_body_stream_empty() {
        let stream = body_stream(ReqBody::Empty);
        let chunks: Vec<_> = stream.collect().await;
        assert!(chunks.is_empty());
    }
}
