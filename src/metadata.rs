//! 媒体元数据提供者边界
//!
//! 元数据抽取是外部协作组件：核心只消费「路径 → 标签映射」这一个能力。
//! 真正的抽取器进程开销大，由调用方创建一次并注入；测试里用固定标签替身。

use crate::error::Result;
use std::collections::HashMap;
use std::path::Path;

/// 标签映射：标签名 → 字符串值
pub type TagMap = HashMap<String, String>;

/// 元数据查询能力
pub trait MetadataProvider: Send + Sync {
    /// 读取一个文件的标签映射
    ///
    /// 读不出标签不算错误，返回空映射即可；创建时间的推导会回退到文件修改时间。
    fn read_tags(&self, path: &Path) -> Result<TagMap>;
}

/// 默认提供者：不做任何抽取
///
/// 所有文件的创建时间都回退到文件系统修改时间。
#[derive(Debug, Default)]
pub struct FsMetadataProvider;

impl MetadataProvider for FsMetadataProvider {
    fn read_tags(&self, _path: &Path) -> Result<TagMap> {
        Ok(TagMap::new())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// 测试替身：对所有路径返回同一份标签
    pub struct FixedTagsProvider {
        pub tags: TagMap,
    }

    impl MetadataProvider for FixedTagsProvider {
        fn read_tags(&self, _path: &Path) -> Result<TagMap> {
            Ok(self.tags.clone())
        }
    }
}
