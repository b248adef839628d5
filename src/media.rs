//! 媒体记录与识别规则
//!
//! `MediaRecord` 是索引的最小单位，也是上传请求里 `media` 字段的线上格式。

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// 识别为图片的扩展名
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "tif", "tiff", "bmp"];

/// 识别为视频的扩展名
pub const VIDEO_EXTENSIONS: &[&str] = &["mpg", "mp4", "mkv", "avi", "m4v", "mpeg", "mpeg4"];

/// 元数据标签里时间字段的格式（如 2020:01:02 03:04:05）
pub const TAG_TIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// 线上与索引使用的时间格式
pub const WIRE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 图片按标签取创建时间的优先顺序
const IMAGE_DATE_TAGS: &[&str] = &["DateTimeDigitized", "DateTimeOriginal", "DateTime"];

/// 视频按标签取创建时间的优先顺序
const VIDEO_DATE_TAGS: &[&str] = &[
    "CreateDate",
    "MediaCreateDate",
    "TrackCreateDate",
    "ModifyDate",
    "MediaModifyDate",
    "TrackModifyDate",
];

/// 媒体种类，仅用于选取创建时间的标签优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Unrecognized,
}

impl MediaKind {
    /// 按扩展名（不含点，大小写不敏感）判断种类
    pub fn from_ext(ext: &str) -> Self {
        if IMAGE_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)) {
            MediaKind::Image
        } else if VIDEO_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)) {
            MediaKind::Video
        } else {
            MediaKind::Unrecognized
        }
    }

    pub fn from_path(path: &Path) -> Self {
        match extension_of(path) {
            Some(ext) => Self::from_ext(&ext),
            None => MediaKind::Unrecognized,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, MediaKind::Unrecognized)
    }
}

/// 取路径的扩展名（不含点）
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_string())
}

/// 索引的最小单位
///
/// `checksum` 全局唯一；`checksum100k` 允许重复。记录创建后不再修改。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaRecord {
    /// 原始文件名，仅作信息记录
    pub filename: String,
    /// 全量哈希（小写十六进制）
    pub checksum: String,
    /// 前 100 KiB 哈希
    pub checksum100k: String,
    /// 文件大小（字节）
    pub size: u64,
    /// 创建时间，来自媒体元数据或文件修改时间
    #[serde(with = "wire_time")]
    pub creation_time: NaiveDateTime,
    /// 扩展名（不含点）
    pub ext: String,
}

/// 按标签优先级推导创建时间
///
/// 取优先级最高的存在标签；标签值解析失败或全部缺失时回退到文件修改时间。
pub fn derive_creation_time(
    kind: MediaKind,
    tags: &HashMap<String, String>,
    modified: NaiveDateTime,
) -> NaiveDateTime {
    let fields: &[&str] = match kind {
        MediaKind::Image => IMAGE_DATE_TAGS,
        MediaKind::Video => VIDEO_DATE_TAGS,
        MediaKind::Unrecognized => &[],
    };
    for field in fields {
        if let Some(value) = tags.get(*field) {
            return NaiveDateTime::parse_from_str(value, TAG_TIME_FORMAT).unwrap_or(modified);
        }
    }
    modified
}

/// creation_time 的线上格式（YYYY-MM-DD HH:MM:SS）
mod wire_time {
    use super::WIRE_TIME_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(
        dt: &NaiveDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&dt.format(WIRE_TIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<NaiveDateTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&s, WIRE_TIME_FORMAT).map_err(D::Error::custom)
    }
}
