//! HTTP 服务器共享状态

use crate::index::MediaIndex;
use crate::queue::UploadQueue;
use std::path::PathBuf;
use std::sync::Arc;

/// 应用共享状态，经中间件注入到每个请求
#[derive(Clone)]
pub struct AppState {
    pub index: Arc<MediaIndex>,
    pub queue: Arc<UploadQueue>,
    pub save_dir: PathBuf,
}
