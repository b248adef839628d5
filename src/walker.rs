//! 并行目录遍历
//!
//! 多个扫描任务共享一个目录队列：子目录回灌队列，文件发往输出通道。
//! 已访问集合以解析后的绝对路径为键，软链接成环时不会重复进入。

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 目录读取失败的重试次数
const READ_RETRIES: u32 = 3;

/// 遍历产出：文件路径与其元数据
#[derive(Debug)]
pub struct FileEntry {
    pub path: PathBuf,
    pub metadata: std::fs::Metadata,
}

/// 并行遍历目录树，把文件发往 `files_tx`
///
/// 单个子树的错误只记录日志并跳过，遍历继续推进；取消令牌触发后
/// 各扫描任务在下一个阻塞点退出。
pub async fn walk(
    root: PathBuf,
    files_tx: mpsc::Sender<FileEntry>,
    workers: usize,
    cancel: CancellationToken,
) {
    let (dir_tx, dir_rx) = mpsc::unbounded_channel::<PathBuf>();
    let dir_rx = Arc::new(Mutex::new(dir_rx));
    let visited = Arc::new(std::sync::Mutex::new(HashSet::new()));
    // 在途目录计数归零即遍历完成
    let pending = Arc::new(AtomicUsize::new(1));
    let (done_tx, done_rx) = watch::channel(false);
    let done_tx = Arc::new(done_tx);

    if dir_tx.send(root).is_err() {
        return;
    }

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let dir_rx = dir_rx.clone();
        let dir_tx = dir_tx.clone();
        let files_tx = files_tx.clone();
        let visited = visited.clone();
        let pending = pending.clone();
        let done_tx = done_tx.clone();
        let mut done_rx = done_rx.clone();
        let cancel = cancel.clone();

        handles.push(tokio::spawn(async move {
            loop {
                let dir = {
                    let mut rx = dir_rx.lock().await;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = done_rx.changed() => break,
                        dir = rx.recv() => match dir {
                            Some(dir) => dir,
                            None => break,
                        },
                    }
                };
                scan_directory(dir, &files_tx, &dir_tx, &visited, &pending, &cancel).await;
                if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                    let _ = done_tx.send(true);
                }
            }
        }));
    }
    drop(dir_tx);

    for handle in handles {
        let _ = handle.await;
    }
}

/// 扫描单个目录
async fn scan_directory(
    dir: PathBuf,
    files_tx: &mpsc::Sender<FileEntry>,
    dir_tx: &mpsc::UnboundedSender<PathBuf>,
    visited: &std::sync::Mutex<HashSet<PathBuf>>,
    pending: &AtomicUsize,
    cancel: &CancellationToken,
) {
    // 解析真实路径作为去重键，软链接环在这里被掐断
    let canonical = match fs::canonicalize(&dir).await {
        Ok(p) => p,
        Err(e) => {
            warn!("解析目录失败: {} - {}", dir.display(), e);
            return;
        }
    };
    {
        let mut seen = visited.lock().expect("已访问集合锁中毒");
        if !seen.insert(canonical.clone()) {
            debug!("跳过已访问目录: {}", canonical.display());
            return;
        }
    }

    let Some(mut entries) = read_dir_with_retry(&canonical, cancel).await else {
        return;
    };

    loop {
        if cancel.is_cancelled() {
            return;
        }
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!("读取目录项失败: {} - {}", canonical.display(), e);
                break;
            }
        };
        let path = entry.path();
        // 统一用跟随软链接的元数据判断类型
        let metadata = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) => {
                warn!("读取元数据失败: {} - {}", path.display(), e);
                continue;
            }
        };
        if metadata.is_dir() {
            pending.fetch_add(1, Ordering::SeqCst);
            if dir_tx.send(path).is_err() {
                pending.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        } else {
            let entry = FileEntry { path, metadata };
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = files_tx.send(entry) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// 带退避的目录读取：失败后按 100/200/300ms 重试，仍失败则放弃该目录
async fn read_dir_with_retry(
    dir: &std::path::Path,
    cancel: &CancellationToken,
) -> Option<fs::ReadDir> {
    for attempt in 0..=READ_RETRIES {
        if cancel.is_cancelled() {
            return None;
        }
        match fs::read_dir(dir).await {
            Ok(entries) => return Some(entries),
            Err(e) => {
                if attempt < READ_RETRIES {
                    let delay = Duration::from_millis(100 * (attempt as u64 + 1));
                    debug!(
                        "打开目录失败（第 {} 次）: {} - {}，{}ms 后重试",
                        attempt + 1,
                        dir.display(),
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    warn!(
                        "打开目录失败（已重试 {} 次）: {} - {}",
                        READ_RETRIES,
                        dir.display(),
                        e
                    );
                }
            }
        }
    }
    None
}
