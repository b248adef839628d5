//! 归档路径分配
//!
//! 按创建时间生成 `<root>/YYYY-MM/YYYY-MM-DD HH.MM.SS[.N].<ext>` 形式的
//! 规范路径：同一秒的不同文件用递增序号区分。分配器只负责挑选路径，
//! 发布（重命名）由上传处理器完成。

use crate::error::{Result, SortError};
use crate::hash;
use crate::media::MediaRecord;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 目录层的时间格式（YYYY-MM）
const DIR_FORMAT: &str = "%Y-%m";

/// 文件名主体的时间格式（YYYY-MM-DD HH.MM.SS）
const FILE_FORMAT: &str = "%Y-%m-%d %H.%M.%S";

pub struct PathAllocator {
    root: PathBuf,
}

impl PathAllocator {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 为一条记录分配尚未被占用的规范路径
    ///
    /// 若候选路径已存在，先核对既有文件的内容哈希：与记录相同说明索引
    /// 丢了行（上游本应在索引里命中），这是不变量被破坏，直接 panic；
    /// 不同则递增序号继续找。
    pub async fn allocate(&self, record: &MediaRecord) -> Result<PathBuf> {
        let dirname = self.root.join(record.creation_time.format(DIR_FORMAT).to_string());
        fs::create_dir_all(&dirname).await?;

        // 目录已存在，可以解析真实路径来拦截越界
        let canonical_root = fs::canonicalize(&self.root).await?;
        let canonical_dir = fs::canonicalize(&dirname).await?;
        if !canonical_dir.starts_with(&canonical_root) {
            return Err(SortError::PathTraversal(format!(
                "{} 不在归档根目录 {} 之内",
                canonical_dir.display(),
                canonical_root.display()
            )));
        }

        let base = record.creation_time.format(FILE_FORMAT).to_string();
        let mut num = 0u32;
        loop {
            let shortname = if num > 0 {
                format!("{}.{}.{}", base, num, record.ext)
            } else {
                format!("{}.{}", base, record.ext)
            };
            // 文件名必须是单一路径分量，否则扩展名里藏了分隔符
            if Path::new(&shortname).components().count() != 1 {
                return Err(SortError::PathTraversal(format!(
                    "非法文件名: {}",
                    shortname
                )));
            }
            let candidate = canonical_dir.join(&shortname);

            if fs::try_exists(&candidate).await? {
                let (existing, _) = hash::digest_file(&candidate).await?;
                if existing == record.checksum {
                    // 既有文件与记录内容一致却没有命中索引：索引丢行了
                    panic!(
                        "归档不变量被破坏: {} 的内容哈希 {} 不在索引中",
                        candidate.display(),
                        existing
                    );
                }
                num += 1;
                continue;
            }
            return Ok(candidate);
        }
    }
}
