use thiserror::Error;

#[derive(Error, Debug)]
pub enum SortError {
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("索引错误: {0}")]
    Index(String),

    #[error("索引已关闭")]
    IndexClosed,

    #[error("路径越界: {0}")]
    PathTraversal(String),

    #[error("哈希校验失败: 期望 {expected}, 实际 {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("HTTP 错误: {0}")]
    Http(String),

    #[error("{0}")]
    Other(String),
}

// 为 rusqlite::Error 实现 From trait
impl From<rusqlite::Error> for SortError {
    fn from(err: rusqlite::Error) -> Self {
        SortError::Index(format!("数据库错误: {}", err))
    }
}

// 为 reqwest::Error 实现 From trait
impl From<reqwest::Error> for SortError {
    fn from(err: reqwest::Error) -> Self {
        SortError::Http(format!("请求失败: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, SortError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = SortError::from(io_err);
        assert!(err.to_string().contains("IO 错误"));
    }

    #[test]
    fn test_serialization_error_conversion() {
        let json_err = serde_json::from_str::<i32>("invalid").unwrap_err();
        let err = SortError::from(json_err);
        assert!(err.to_string().contains("序列化错误"));
    }

    #[test]
    fn test_config_error() {
        let err = SortError::Config("配置无效".to_string());
        assert_eq!(err.to_string(), "配置错误: 配置无效");
    }

    #[test]
    fn test_checksum_mismatch_error() {
        let err = SortError::ChecksumMismatch {
            expected: "abc".to_string(),
            actual: "def".to_string(),
        };
        assert!(err.to_string().contains("abc"));
        assert!(err.to_string().contains("def"));
    }

    #[test]
    fn test_path_traversal_error() {
        let err = SortError::PathTraversal("/evil/../path".to_string());
        assert!(err.to_string().contains("路径越界"));
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sql_err = rusqlite::Error::InvalidQuery;
        let err = SortError::from(sql_err);
        assert!(err.to_string().contains("数据库错误"));
    }

    #[test]
    fn test_result_ok() {
        let result: Result<i32> = Ok(42);
        assert!(result.is_ok());
    }

    #[test]
    fn test_error_debug() {
        let err = SortError::IndexClosed;
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("IndexClosed"));
    }
}
