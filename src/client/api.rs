//! 服务端 API 客户端
//!
//! 整个客户端进程共用一个启用 keep-alive 的连接池；所有响应体都完整
//! 读完再丢弃，连接才能回到池里复用。

use crate::error::{Result, SortError};
use crate::media::MediaRecord;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// 单个请求的总超时（大文件上传需要富余）
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// 流式上传的管道缓冲大小
const STREAM_BUF_SIZE: usize = 32 * 1024;

/// 一次上传的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    /// 服务端已接收并归档
    Uploaded,
    /// 服务端判定为重复内容
    Duplicate,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Debug, Deserialize)]
struct ProbeResponse {
    results: HashMap<String, bool>,
}

pub struct ApiClient {
    http: reqwest::Client,
    host: String,
}

impl ApiClient {
    /// 创建客户端
    ///
    /// 连接池：总计最多 100 个空闲连接、单主机 10 个，空闲 90 秒回收。
    pub fn new(host: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            host: host.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.host, path)
    }

    /// 查询服务端版本
    pub async fn version(&self) -> Result<String> {
        let response = self.http.get(self.url("/version")).send().await?;
        let body: VersionResponse = response.json().await?;
        Ok(body.version)
    }

    /// 批量探测一组哈希是否已收录
    ///
    /// * `endpoint` - `/checksums`（全量）或 `/checksum100k`（前缀）
    pub async fn check_batch(
        &self,
        checksums: &[String],
        endpoint: &str,
    ) -> Result<HashMap<String, bool>> {
        if checksums.is_empty() {
            return Ok(HashMap::new());
        }
        let payload = serde_json::json!({"checksums": checksums}).to_string();
        let form = Form::new().text("checksums", payload);

        let response = self
            .http
            .post(self.url(endpoint))
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            // 读完响应体让连接回池
            let _ = response.bytes().await;
            return Err(SortError::Http(format!("批量探测失败: HTTP {}", status)));
        }
        let body: ProbeResponse = response.json().await?;
        Ok(body.results)
    }

    /// 流式上传一个文件
    ///
    /// 表单体随传输边产边发：file 字段直接包着文件读取流，整个过程
    /// 内存占用只有一个小缓冲，与文件大小无关。
    pub async fn upload(&self, record: &MediaRecord, path: &Path) -> Result<UploadStatus> {
        let file = tokio::fs::File::open(path).await?;
        let stream = ReaderStream::with_capacity(file, STREAM_BUF_SIZE);
        let file_part = Part::stream(reqwest::Body::wrap_stream(stream))
            .file_name(record.filename.clone());

        let form = Form::new()
            .text("media", serde_json::to_string(record)?)
            .part("file", file_part);

        let response = self
            .http
            .post(self.url("/file"))
            .multipart(form)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await.unwrap_or_default();

        match status {
            StatusCode::OK => {
                debug!("已上传: {}", path.display());
                Ok(UploadStatus::Uploaded)
            }
            StatusCode::CONFLICT => {
                debug!("服务端已存在: {}", path.display());
                Ok(UploadStatus::Duplicate)
            }
            _ => Err(SortError::Http(format!(
                "上传失败: HTTP {} - {}",
                status,
                String::from_utf8_lossy(&body)
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_construction() {
        let client = ApiClient::new("localhost:8080").unwrap();
        assert_eq!(client.url("/version"), "http://localhost:8080/version");
        assert_eq!(client.url("/file"), "http://localhost:8080/file");
    }

    #[tokio::test]
    async fn test_check_batch_empty_skips_request() {
        // 空清单不应触发网络请求，直接返回空映射
        let client = ApiClient::new("127.0.0.1:1").unwrap();
        let results = client.check_batch(&[], "/checksums").await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_version_unreachable_host() {
        let client = ApiClient::new("127.0.0.1:1").unwrap();
        assert!(client.version().await.is_err());
    }
}
