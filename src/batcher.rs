//! 批量插入缓冲
//!
//! 把待插入的记录攒到内存里，攒满一批或被显式触发时整批写入索引。
//! 上传路径在发布文件之前会强制冲刷，保证索引持久化先于磁盘可见。

use crate::error::Result;
use crate::index::MediaIndex;
use crate::media::MediaRecord;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// 冲刷结果汇总
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// 新插入的行数
    pub inserted: usize,
    /// 因已存在而跳过的行数
    pub skipped: usize,
}

/// 有界插入缓冲
pub struct InsertBatcher {
    index: Arc<MediaIndex>,
    pending: Mutex<Vec<MediaRecord>>,
    capacity: usize,
}

impl InsertBatcher {
    pub fn new(index: Arc<MediaIndex>, capacity: usize) -> Self {
        Self {
            index,
            pending: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// 追加一条记录，攒满一批时就地冲刷
    pub async fn add(&self, record: MediaRecord) -> Result<FlushReport> {
        let batch = {
            let mut pending = self.pending.lock().await;
            pending.push(record);
            if pending.len() >= self.capacity {
                std::mem::take(&mut *pending)
            } else {
                return Ok(FlushReport::default());
            }
        };
        self.flush_batch(batch).await
    }

    /// 追加一条记录并立即整批冲刷，返回该条是否为新插入
    ///
    /// 上传路径靠这个返回值识别并发竞争的输家：checksum 唯一索引让
    /// 同一内容的并发插入只有一方真正落库（其余 0 行生效）。
    pub async fn add_and_flush(&self, record: MediaRecord) -> Result<bool> {
        let batch = {
            let mut pending = self.pending.lock().await;
            pending.push(record);
            std::mem::take(&mut *pending)
        };
        // 本条记录永远在批尾
        let flags = self.index.insert_batch(&batch).await?;
        Ok(flags.last().copied().unwrap_or(false))
    }

    /// 冲刷当前缓冲的全部记录
    pub async fn flush(&self) -> Result<FlushReport> {
        // 先取走缓冲再放锁：数据库写入可能阻塞，不能拖住生产者
        let batch = {
            let mut pending = self.pending.lock().await;
            std::mem::take(&mut *pending)
        };
        self.flush_batch(batch).await
    }

    async fn flush_batch(&self, batch: Vec<MediaRecord>) -> Result<FlushReport> {
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }
        let flags = self.index.insert_batch(&batch).await?;
        let inserted = flags.iter().filter(|&&f| f).count();
        let report = FlushReport {
            inserted,
            skipped: flags.len() - inserted,
        };
        debug!(
            "批量插入完成: 新增 {} 条, 跳过 {} 条",
            report.inserted, report.skipped
        );
        Ok(report)
    }

    /// 当前缓冲中的记录数
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn record(checksum: &str) -> MediaRecord {
        MediaRecord {
            filename: format!("{}.jpg", checksum),
            checksum: checksum.to_string(),
            checksum100k: "prefix".to_string(),
            size: 10,
            creation_time: NaiveDate::from_ymd_opt(2020, 1, 2)
                .unwrap()
                .and_hms_opt(3, 4, 5)
                .unwrap(),
            ext: "jpg".to_string(),
        }
    }

    async fn setup(capacity: usize) -> (InsertBatcher, Arc<MediaIndex>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let index = Arc::new(
            MediaIndex::open(&temp_dir.path().join("test.db"))
                .await
                .unwrap(),
        );
        (InsertBatcher::new(index.clone(), capacity), index, temp_dir)
    }

    #[tokio::test]
    async fn test_add_buffers_until_capacity() {
        let (batcher, index, _tmp) = setup(3).await;

        batcher.add(record("a")).await.unwrap();
        batcher.add(record("b")).await.unwrap();
        assert_eq!(batcher.pending_len().await, 2);
        assert!(!index.exists_full("a").await);

        // 第三条到达容量，触发整批写入
        let report = batcher.add(record("c")).await.unwrap();
        assert_eq!(report.inserted, 3);
        assert_eq!(batcher.pending_len().await, 0);
        assert!(index.exists_full("a").await);
        assert!(index.exists_full("c").await);
    }

    #[tokio::test]
    async fn test_explicit_flush() {
        let (batcher, index, _tmp) = setup(100).await;

        batcher.add(record("x")).await.unwrap();
        let report = batcher.flush().await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped, 0);
        assert!(index.exists_full("x").await);
    }

    #[tokio::test]
    async fn test_flush_empty_is_noop() {
        let (batcher, _index, _tmp) = setup(100).await;
        let report = batcher.flush().await.unwrap();
        assert_eq!(report, FlushReport::default());
    }

    #[tokio::test]
    async fn test_add_and_flush_reports_race_loser() {
        let (batcher, index, _tmp) = setup(100).await;

        assert!(batcher.add_and_flush(record("race")).await.unwrap());
        assert!(index.exists_full("race").await);
        // 同一哈希再来一次：OR IGNORE 生效 0 行，识别为输家
        assert!(!batcher.add_and_flush(record("race")).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_and_flush_drains_pending() {
        let (batcher, index, _tmp) = setup(100).await;

        batcher.add(record("early")).await.unwrap();
        assert!(batcher.add_and_flush(record("late")).await.unwrap());
        // 缓冲里的旧记录随同一批落库
        assert_eq!(batcher.pending_len().await, 0);
        assert!(index.exists_full("early").await);
        assert!(index.exists_full("late").await);
    }

    #[tokio::test]
    async fn test_duplicate_rows_reported_as_skipped() {
        let (batcher, _index, _tmp) = setup(100).await;

        batcher.add(record("dup")).await.unwrap();
        batcher.flush().await.unwrap();

        batcher.add(record("dup")).await.unwrap();
        let report = batcher.flush().await.unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.skipped, 1);
    }
}
