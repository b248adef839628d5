//! 客户端摄取流水线
//!
//! 严格的三阶段：并行扫描与哈希 → 批量探测 → 并行流式上传。
//! 单个文件的失败只计数不中断，整棵目录树处理完才收尾。

pub mod api;

use crate::error::Result;
use crate::hash;
use crate::media::{self, MediaKind, MediaRecord};
use crate::metadata::MetadataProvider;
use crate::walker::{self, FileEntry};
use api::{ApiClient, UploadStatus};
use indicatif::ProgressBar;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 批量探测时每个请求携带的哈希数
const PROBE_BATCH_SIZE: usize = 100;

/// 进度条刷新间隔（2 Hz）
const PROGRESS_TICK: Duration = Duration::from_millis(500);

/// 流水线的最终统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineReport {
    pub total: u64,
    pub uploaded: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// 跨任务共享的计数器
#[derive(Default)]
struct Counters {
    total: AtomicU64,
    uploaded: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PipelineReport {
        PipelineReport {
            total: self.total.load(Ordering::SeqCst),
            uploaded: self.uploaded.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
        }
    }
}

/// 阶段 1 的产物：候选记录与其源文件路径
#[derive(Debug, Clone)]
struct Candidate {
    record: MediaRecord,
    path: PathBuf,
}

pub struct ClientPipeline {
    api: Arc<ApiClient>,
    provider: Arc<dyn MetadataProvider>,
    workers: usize,
    cancel: CancellationToken,
}

impl ClientPipeline {
    pub fn new(api: Arc<ApiClient>, provider: Arc<dyn MetadataProvider>, workers: usize) -> Self {
        Self {
            api,
            provider,
            workers: workers.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// 取消令牌，调用方可以在中断信号里触发
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 处理一棵目录树
    pub async fn run(&self, dir: &Path) -> Result<PipelineReport> {
        let counters = Arc::new(Counters::default());

        info!("开始扫描目录: {}", dir.display());
        let candidates = self.phase_collect(dir, &counters).await;
        if candidates.is_empty() {
            info!("没有可处理的媒体文件");
            return Ok(counters.snapshot());
        }

        let (exists_full, exists_prefix) = self.phase_probe(&candidates).await;

        self.phase_upload(candidates, &exists_full, &exists_prefix, &counters)
            .await;

        let report = counters.snapshot();
        info!("=== 处理完成 ===");
        info!("  总数:   {}", report.total);
        info!("  已上传: {}", report.uploaded);
        info!("  跳过:   {}", report.skipped);
        info!("  错误:   {}", report.errors);
        Ok(report)
    }

    /// 阶段 1：并行遍历目录并计算双哈希
    async fn phase_collect(&self, dir: &Path, counters: &Arc<Counters>) -> Vec<Candidate> {
        let pb = ProgressBar::new_spinner();
        pb.set_message("阶段 1/3: 扫描并计算哈希");
        pb.enable_steady_tick(PROGRESS_TICK);

        let (files_tx, files_rx) = mpsc::channel::<FileEntry>(self.workers * 2);
        let files_rx = Arc::new(Mutex::new(files_rx));
        let (cand_tx, mut cand_rx) = mpsc::channel::<Candidate>(self.workers * 2);

        let walker_handle = tokio::spawn(walker::walk(
            dir.to_path_buf(),
            files_tx,
            self.workers,
            self.cancel.clone(),
        ));

        let mut worker_handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let files_rx = files_rx.clone();
            let cand_tx = cand_tx.clone();
            let provider = self.provider.clone();
            let counters = counters.clone();
            let cancel = self.cancel.clone();
            worker_handles.push(tokio::spawn(async move {
                loop {
                    let entry = {
                        let mut rx = files_rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            entry = rx.recv() => match entry {
                                Some(entry) => entry,
                                None => break,
                            },
                        }
                    };
                    if let Some(candidate) = build_candidate(entry, &provider, &counters).await
                        && cand_tx.send(candidate).await.is_err()
                    {
                        break;
                    }
                }
            }));
        }
        drop(cand_tx);

        let mut candidates = Vec::new();
        while let Some(candidate) = cand_rx.recv().await {
            pb.inc(1);
            candidates.push(candidate);
        }
        for handle in worker_handles {
            let _ = handle.await;
        }
        let _ = walker_handle.await;

        pb.finish_with_message(format!("阶段 1 完成: {} 个候选文件", candidates.len()));
        candidates
    }

    /// 阶段 2：按 100 个一批探测两类哈希的存在性
    ///
    /// 某一批请求失败时按「不存在」处理并继续：真正的去重仲裁在服务端
    /// 写入路径上，这里多传几个文件没有害处。
    async fn phase_probe(
        &self,
        candidates: &[Candidate],
    ) -> (
        std::collections::HashMap<String, bool>,
        std::collections::HashMap<String, bool>,
    ) {
        let full_list: Vec<String> = candidates
            .iter()
            .map(|c| c.record.checksum.clone())
            .collect();
        let prefix_list: Vec<String> = candidates
            .iter()
            .map(|c| c.record.checksum100k.clone())
            .collect();

        let total_batches = full_list.len().div_ceil(PROBE_BATCH_SIZE)
            + prefix_list.len().div_ceil(PROBE_BATCH_SIZE);
        let pb = ProgressBar::new(total_batches as u64);
        pb.set_message("阶段 2/3: 批量探测");
        pb.enable_steady_tick(PROGRESS_TICK);

        let mut exists_full = std::collections::HashMap::new();
        for chunk in full_list.chunks(PROBE_BATCH_SIZE) {
            match self.api.check_batch(chunk, "/checksums").await {
                Ok(results) => exists_full.extend(results),
                Err(e) => {
                    warn!("批量探测失败，按不存在处理: {}", e);
                    exists_full.extend(chunk.iter().map(|c| (c.clone(), false)));
                }
            }
            pb.inc(1);
        }

        let mut exists_prefix = std::collections::HashMap::new();
        for chunk in prefix_list.chunks(PROBE_BATCH_SIZE) {
            match self.api.check_batch(chunk, "/checksum100k").await {
                Ok(results) => exists_prefix.extend(results),
                Err(e) => {
                    warn!("前缀哈希批量探测失败，按不存在处理: {}", e);
                    exists_prefix.extend(chunk.iter().map(|c| (c.clone(), false)));
                }
            }
            pb.inc(1);
        }

        pb.finish_with_message("阶段 2 完成");
        (exists_full, exists_prefix)
    }

    /// 阶段 3：并行上传非重复文件
    async fn phase_upload(
        &self,
        candidates: Vec<Candidate>,
        exists_full: &std::collections::HashMap<String, bool>,
        exists_prefix: &std::collections::HashMap<String, bool>,
        counters: &Arc<Counters>,
    ) {
        // 两个哈希都命中才视为重复
        let mut to_upload = Vec::new();
        for candidate in candidates {
            let full_hit = exists_full
                .get(&candidate.record.checksum)
                .copied()
                .unwrap_or(false);
            let prefix_hit = exists_prefix
                .get(&candidate.record.checksum100k)
                .copied()
                .unwrap_or(false);
            if full_hit && prefix_hit {
                counters.skipped.fetch_add(1, Ordering::SeqCst);
            } else {
                to_upload.push(candidate);
            }
        }
        if to_upload.is_empty() {
            info!("所有文件均已存在，无需上传");
            return;
        }

        let pb = ProgressBar::new(to_upload.len() as u64);
        pb.set_message("阶段 3/3: 上传");
        pb.enable_steady_tick(PROGRESS_TICK);

        let (up_tx, up_rx) = mpsc::channel::<Candidate>(self.workers * 2);
        let up_rx = Arc::new(Mutex::new(up_rx));

        let mut worker_handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let up_rx = up_rx.clone();
            let api = self.api.clone();
            let counters = counters.clone();
            let cancel = self.cancel.clone();
            let pb = pb.clone();
            worker_handles.push(tokio::spawn(async move {
                loop {
                    let candidate = {
                        let mut rx = up_rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            candidate = rx.recv() => match candidate {
                                Some(candidate) => candidate,
                                None => break,
                            },
                        }
                    };
                    match api.upload(&candidate.record, &candidate.path).await {
                        Ok(UploadStatus::Uploaded) => {
                            counters.uploaded.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(UploadStatus::Duplicate) => {
                            counters.skipped.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => {
                            warn!("上传失败: {} - {}", candidate.path.display(), e);
                            counters.errors.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    pb.inc(1);
                }
            }));
        }

        for candidate in to_upload {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                sent = up_tx.send(candidate) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        drop(up_tx);
        for handle in worker_handles {
            let _ = handle.await;
        }
        pb.finish_with_message("阶段 3 完成");
    }
}

/// 为单个文件构造候选记录
///
/// 不认识的扩展名直接跳过；哈希失败计入错误并继续。
async fn build_candidate(
    entry: FileEntry,
    provider: &Arc<dyn MetadataProvider>,
    counters: &Arc<Counters>,
) -> Option<Candidate> {
    let kind = MediaKind::from_path(&entry.path);
    if !kind.is_recognized() {
        debug!("跳过未识别文件: {}", entry.path.display());
        return None;
    }
    let ext = media::extension_of(&entry.path)?;

    let tags = match provider.read_tags(&entry.path) {
        Ok(tags) => tags,
        Err(e) => {
            warn!("读取元数据失败: {} - {}", entry.path.display(), e);
            Default::default()
        }
    };

    let (checksum, checksum100k) = match hash::digest_file(&entry.path).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!("计算哈希失败: {} - {}", entry.path.display(), e);
            counters.errors.fetch_add(1, Ordering::SeqCst);
            return None;
        }
    };

    let modified = entry
        .metadata
        .modified()
        .map(|t| chrono::DateTime::<chrono::Local>::from(t).naive_local())
        .unwrap_or_else(|_| chrono::Local::now().naive_local());
    let creation_time = media::derive_creation_time(kind, &tags, modified);

    counters.total.fetch_add(1, Ordering::SeqCst);
    Some(Candidate {
        record: MediaRecord {
            filename: entry.path.to_string_lossy().to_string(),
            checksum,
            checksum100k,
            size: entry.metadata.len(),
            creation_time,
            ext,
        },
        path: entry.path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::testing::FixedTagsProvider;
    use crate::metadata::{FsMetadataProvider, TagMap};
    use tempfile::TempDir;

    fn entry_for(path: &Path) -> FileEntry {
        FileEntry {
            path: path.to_path_buf(),
            metadata: std::fs::metadata(path).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_build_candidate_recognized_image() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("photo.jpg");
        std::fs::write(&path, b"image bytes").unwrap();

        let provider: Arc<dyn MetadataProvider> = Arc::new(FsMetadataProvider);
        let counters = Arc::new(Counters::default());
        let candidate = build_candidate(entry_for(&path), &provider, &counters)
            .await
            .unwrap();

        assert_eq!(candidate.record.ext, "jpg");
        assert_eq!(candidate.record.size, 11);
        assert_eq!(
            candidate.record.checksum,
            crate::hash::checksum_bytes(b"image bytes")
        );
        // 短文件：前缀哈希等于全量哈希
        assert_eq!(candidate.record.checksum, candidate.record.checksum100k);
        assert_eq!(counters.total.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_build_candidate_skips_unrecognized() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("notes.txt");
        std::fs::write(&path, b"not media").unwrap();

        let provider: Arc<dyn MetadataProvider> = Arc::new(FsMetadataProvider);
        let counters = Arc::new(Counters::default());
        let candidate = build_candidate(entry_for(&path), &provider, &counters).await;

        assert!(candidate.is_none());
        assert_eq!(counters.total.load(Ordering::SeqCst), 0);
        assert_eq!(counters.errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_build_candidate_uses_metadata_tags() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tagged.jpg");
        std::fs::write(&path, b"x").unwrap();

        let mut tags = TagMap::new();
        tags.insert(
            "DateTimeOriginal".to_string(),
            "2015:08:02 22:25:06".to_string(),
        );
        let provider: Arc<dyn MetadataProvider> = Arc::new(FixedTagsProvider { tags });
        let counters = Arc::new(Counters::default());

        let candidate = build_candidate(entry_for(&path), &provider, &counters)
            .await
            .unwrap();
        assert_eq!(
            candidate
                .record
                .creation_time
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            "2015-08-02 22:25:06"
        );
    }

    #[tokio::test]
    async fn test_run_with_unreachable_server_counts_errors() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["a.jpg", "b.png", "c.mp4"] {
            std::fs::write(temp_dir.path().join(name), name.as_bytes()).unwrap();
        }
        std::fs::write(temp_dir.path().join("ignored.txt"), b"x").unwrap();

        let api = Arc::new(ApiClient::new("127.0.0.1:1").unwrap());
        let provider: Arc<dyn MetadataProvider> = Arc::new(FsMetadataProvider);
        let pipeline = ClientPipeline::new(api, provider, 2);

        // 服务端不可达：探测按不存在处理，上传全部失败但流水线不中断
        let report = pipeline.run(temp_dir.path()).await.unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.uploaded, 0);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.errors, 3);
    }

    #[tokio::test]
    async fn test_run_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let api = Arc::new(ApiClient::new("127.0.0.1:1").unwrap());
        let provider: Arc<dyn MetadataProvider> = Arc::new(FsMetadataProvider);
        let pipeline = ClientPipeline::new(api, provider, 2);

        let report = pipeline.run(temp_dir.path()).await.unwrap();
        assert_eq!(report, PipelineReport::default());
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = Counters::default();
        counters.total.fetch_add(5, Ordering::SeqCst);
        counters.uploaded.fetch_add(3, Ordering::SeqCst);
        counters.skipped.fetch_add(1, Ordering::SeqCst);
        counters.errors.fetch_add(1, Ordering::SeqCst);

        let report = counters.snapshot();
        assert_eq!(
            report,
            PipelineReport {
                total: 5,
                uploaded: 3,
                skipped: 1,
                errors: 1
            }
        );
    }
}
