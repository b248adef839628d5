//! 存在性查询与版本端点

use super::state::AppState;
use http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use silent::SilentError;
use silent::extractor::{Configs as CfgExtractor, Query};
use silent::prelude::*;
use std::collections::HashMap;

/// GET /file 的查询参数
#[derive(Debug, Deserialize, Default)]
pub struct ChecksumQuery {
    #[serde(default)]
    pub checksum: String,
}

/// 批量探测请求体里的哈希清单
#[derive(Debug, Deserialize)]
struct ChecksumList {
    checksums: Vec<String>,
}

/// GET /version - 版本握手
pub async fn give_version(_req: Request) -> silent::Result<Value> {
    Ok(json!({"version": env!("CARGO_PKG_VERSION")}))
}

/// GET /file - 单个全量哈希探测
pub async fn check_file(
    (Query(query), CfgExtractor(state)): (Query<ChecksumQuery>, CfgExtractor<AppState>),
) -> silent::Result<Value> {
    let status = if state.index.exists_full(&query.checksum).await {
        "exists"
    } else {
        "not found"
    };
    Ok(json!({"status": status}))
}

/// POST /checksums - 批量全量哈希探测
pub async fn check_checksums(
    mut req: Request,
    CfgExtractor(state): CfgExtractor<AppState>,
) -> silent::Result<Value> {
    let checksums = read_checksum_list(&mut req).await?;
    let mut results = HashMap::with_capacity(checksums.len());
    for checksum in checksums {
        let exists = state.index.exists_full(&checksum).await;
        results.insert(checksum, exists);
    }
    Ok(json!({"results": results}))
}

/// POST /checksum100k - 批量前缀哈希探测
pub async fn check_checksum100k(
    mut req: Request,
    CfgExtractor(state): CfgExtractor<AppState>,
) -> silent::Result<Value> {
    let checksums = read_checksum_list(&mut req).await?;
    let mut results = HashMap::with_capacity(checksums.len());
    for checksum in checksums {
        let exists = state.index.exists_prefix(&checksum).await;
        results.insert(checksum, exists);
    }
    Ok(json!({"results": results}))
}

/// 从 multipart 表单里取出 `checksums` 字段的哈希清单
async fn read_checksum_list(req: &mut Request) -> silent::Result<Vec<String>> {
    let content_type = req
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let boundary = multer::parse_boundary(&content_type).map_err(|e| {
        SilentError::business_error(StatusCode::BAD_REQUEST, format!("不是 multipart 请求: {}", e))
    })?;

    let body = req.take_body();
    let mut multipart = multer::Multipart::new(super::body_stream(body), boundary);

    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| {
                SilentError::business_error(
                    StatusCode::BAD_REQUEST,
                    format!("解析表单失败: {}", e),
                )
            })?
            .ok_or_else(|| {
                SilentError::business_error(StatusCode::BAD_REQUEST, "缺少 checksums 字段")
            })?;
        if field.name() != Some("checksums") {
            continue;
        }
        let text = field.text().await.map_err(|e| {
            SilentError::business_error(
                StatusCode::BAD_REQUEST,
                format!("读取 checksums 字段失败: {}", e),
            )
        })?;
        let list: ChecksumList = serde_json::from_str(&text).map_err(|e| {
            SilentError::business_error(
                StatusCode::BAD_REQUEST,
                format!("checksums 字段不是合法 JSON: {}", e),
            )
        })?;
        return Ok(list.checksums);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::tests::create_test_app_state;
    use crate::media::MediaRecord;
    use chrono::NaiveDate;

    fn record(checksum: &str, prefix: &str) -> MediaRecord {
        MediaRecord {
            filename: "a.jpg".to_string(),
            checksum: checksum.to_string(),
            checksum100k: prefix.to_string(),
            size: 1,
            creation_time: NaiveDate::from_ymd_opt(2020, 1, 2)
                .unwrap()
                .and_hms_opt(3, 4, 5)
                .unwrap(),
            ext: "jpg".to_string(),
        }
    }

    #[tokio::test]
    async fn test_give_version() {
        let result = give_version(Request::empty()).await.unwrap();
        assert_eq!(result["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_check_file_exists_and_missing() {
        let (state, _tmp) = create_test_app_state().await;
        state.index.insert(&record("known", "p")).await.unwrap();

        let result = check_file((
            Query(ChecksumQuery {
                checksum: "known".to_string(),
            }),
            CfgExtractor(state.clone()),
        ))
        .await
        .unwrap();
        assert_eq!(result["status"], "exists");

        let result = check_file((
            Query(ChecksumQuery {
                checksum: "unknown".to_string(),
            }),
            CfgExtractor(state),
        ))
        .await
        .unwrap();
        assert_eq!(result["status"], "not found");
    }

    #[test]
    fn test_checksum_list_parsing() {
        let list: ChecksumList =
            serde_json::from_str(r#"{"checksums": ["aaa", "bbb"]}"#).unwrap();
        assert_eq!(list.checksums, vec!["aaa", "bbb"]);

        assert!(serde_json::from_str::<ChecksumList>(r#"{"sums": []}"#).is_err());
    }
}
