//! 文件上传端点与上传状态机
//!
//! 处理器负责解析与排队，真正的写盘在队列工作任务里完成。
//! 关键顺序是「先索引后发布」：记录落库之前，文件绝不会出现在规范路径上。

use super::state::AppState;
use crate::hash::HashingFileWriter;
use crate::media::MediaRecord;
use crate::queue::{UploadContext, UploadOutcome, UploadRequest};
use http::StatusCode;
use serde_json::json;
use silent::SilentError;
use silent::extractor::Configs as CfgExtractor;
use silent::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// 入队的最长等待时间
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(30);

/// 等待工作任务完成信号的上限
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(300);

/// 删除临时文件的重试次数
const REMOVE_RETRIES: u32 = 3;

/// 已接收计数，只用于日志
static UPLOAD_COUNT: AtomicU64 = AtomicU64::new(0);

/// 临时文件名序号，保证并发请求互不覆盖
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// POST /file - 接收一个媒体文件
///
/// 表单必须依次携带 `media`（JSON 记录）与 `file`（字节流）两个字段。
pub async fn push_file(
    mut req: Request,
    CfgExtractor(state): CfgExtractor<AppState>,
) -> silent::Result<Response> {
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

    let record = parse_media_field(&mut multipart).await?;

    // 预检：已收录的内容不必排队（非权威，权威探测在写入校验之后）
    if state.index.exists_full(&record.checksum).await {
        info!("内容已存在: {}", record.checksum);
        return Ok(super::json_response(
            StatusCode::CONFLICT,
            json!({"status": "exists"}),
        ));
    }

    let (done_tx, done_rx) = oneshot::channel();
    let request = UploadRequest {
        record,
        multipart,
        done: done_tx,
    };

    // 阻塞入队：给高峰期的请求一个等待工位的机会
    if !state.queue.enqueue(request, true, ENQUEUE_TIMEOUT).await {
        return Ok(super::json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"status": "queue_full", "reason": "服务端繁忙，请稍后再试"}),
        ));
    }

    // 等待工作任务的完成信号，响应由实际处理结果决定
    match tokio::time::timeout(COMPLETION_TIMEOUT, done_rx).await {
        Ok(Ok(outcome)) => Ok(outcome_response(outcome)),
        Ok(Err(_)) => Ok(super::json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"status": "failed", "reason": "工作任务中断"}),
        )),
        Err(_) => Ok(super::json_response(
            StatusCode::REQUEST_TIMEOUT,
            json!({"status": "timeout", "reason": "请求处理超时"}),
        )),
    }
}

/// 解析表单里的 media 字段（必须先于 file 字段）
async fn parse_media_field(
    multipart: &mut multer::Multipart<'static>,
) -> silent::Result<MediaRecord> {
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
                SilentError::business_error(StatusCode::BAD_REQUEST, "缺少 media 字段")
            })?;
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("media") => {
                let text = field.text().await.map_err(|e| {
                    SilentError::business_error(
                        StatusCode::BAD_REQUEST,
                        format!("读取 media 字段失败: {}", e),
                    )
                })?;
                return serde_json::from_str(&text).map_err(|e| {
                    SilentError::business_error(
                        StatusCode::BAD_REQUEST,
                        format!("media 字段不是合法的 JSON 记录: {}", e),
                    )
                });
            }
            Some("file") => {
                return Err(SilentError::business_error(
                    StatusCode::BAD_REQUEST,
                    "media 字段必须先于 file 字段",
                ));
            }
            // 其他字段忽略
            _ => continue,
        }
    }
}

/// 上传状态机：流式写盘 → 校验 → 权威去重 → 先索引后发布
///
/// 任何失败路径都会带走临时文件；唯一的例外是「索引已提交但重命名失败」，
/// 此时临时文件保留在原地等待人工恢复。
pub async fn process_upload(
    mut record: MediaRecord,
    mut multipart: multer::Multipart<'static>,
    ctx: &UploadContext,
) -> UploadOutcome {
    use crate::error::SortError;

    // 先验证路径可分配（扩展名里藏路径分隔符在这里被拦截）
    let planned_path = match ctx.allocator.allocate(&record).await {
        Ok(p) => p,
        Err(SortError::PathTraversal(msg)) => return UploadOutcome::BadRequest(msg),
        Err(e) => return UploadOutcome::Internal(format!("分配归档路径失败: {}", e)),
    };
    // 序号让同一秒的并发上传各写各的临时文件
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let temp_path = PathBuf::from(format!("{}.{}.download", planned_path.display(), seq));

    // 找到 file 字段
    let mut field = loop {
        match multipart.next_field().await {
            Ok(Some(f)) if f.name() == Some("file") => break f,
            Ok(Some(_)) => continue,
            Ok(None) => return UploadOutcome::BadRequest("缺少 file 字段".to_string()),
            Err(e) => return UploadOutcome::BadRequest(format!("解析表单失败: {}", e)),
        }
    };

    // 流式写盘，同一趟数据喂给文件和两个哈希状态
    let file = match fs::File::create(&temp_path).await {
        Ok(f) => f,
        Err(e) => return UploadOutcome::Internal(format!("创建临时文件失败: {}", e)),
    };
    let mut writer = HashingFileWriter::new(file);
    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                if let Err(e) = writer.write_chunk(&chunk).await {
                    remove_temp_file(&temp_path).await;
                    return UploadOutcome::Internal(format!("写入临时文件失败: {}", e));
                }
            }
            Ok(None) => break,
            Err(e) => {
                remove_temp_file(&temp_path).await;
                return UploadOutcome::Internal(format!("读取上传数据失败: {}", e));
            }
        }
    }
    let (written, actual_checksum, actual_checksum100k) = match writer.finish().await {
        Ok(v) => v,
        Err(e) => {
            remove_temp_file(&temp_path).await;
            return UploadOutcome::Internal(format!("关闭临时文件失败: {}", e));
        }
    };

    // 校验客户端声明的全量哈希
    if actual_checksum != record.checksum {
        remove_temp_file(&temp_path).await;
        warn!(
            "哈希不匹配: 客户端声明 {}, 实际 {}",
            record.checksum, actual_checksum
        );
        return UploadOutcome::BadRequest("哈希校验失败，文件可能已损坏".to_string());
    }
    // 前缀哈希以服务端计算值为准
    record.checksum100k = actual_checksum100k;

    // 权威去重探测，兜住预检之后才落库的并发上传
    if ctx.index.exists_full(&actual_checksum).await {
        remove_temp_file(&temp_path).await;
        info!("内容已存在（写入后探测命中）: {}", actual_checksum);
        return UploadOutcome::Duplicate;
    }

    // 先索引后发布。checksum 唯一索引是并发竞争的唯一仲裁：
    // 0 行生效说明本请求是输家，按重复处理。
    let inserted = match ctx.batcher.add_and_flush(record.clone()).await {
        Ok(flag) => flag,
        Err(e) => {
            remove_temp_file(&temp_path).await;
            return UploadOutcome::Internal(format!("索引写入失败: {}", e));
        }
    };
    if !inserted {
        remove_temp_file(&temp_path).await;
        info!("内容已存在（插入竞争落败）: {}", actual_checksum);
        return UploadOutcome::Duplicate;
    }

    // 发布：临时文件重命名到规范路径。重新分配一次，规避等待期间
    // 同名路径被其他记录占用。
    let final_path = match ctx.allocator.allocate(&record).await {
        Ok(p) => p,
        Err(e) => {
            error!(
                "严重不一致: 索引已提交但无法分配发布路径: {} ({})，临时文件保留待人工恢复: {}",
                record.checksum,
                e,
                temp_path.display()
            );
            return UploadOutcome::Internal("发布失败，记录待人工恢复".to_string());
        }
    };
    if let Err(e) = fs::rename(&temp_path, &final_path).await {
        error!(
            "严重不一致: 索引已提交但重命名失败: {} -> {} ({})，临时文件保留待人工恢复",
            temp_path.display(),
            final_path.display(),
            e
        );
        return UploadOutcome::Internal("发布失败，记录待人工恢复".to_string());
    }

    let count = UPLOAD_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    info!(
        "({:03}) 已归档: {} -> {} ({} 字节)",
        count,
        record.filename,
        final_path.display(),
        written
    );
    UploadOutcome::Stored {
        filename: relative_name(&final_path),
    }
}

/// 规范路径的展示形式：月目录/文件名
fn relative_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    match path.parent().and_then(|p| p.file_name()) {
        Some(dir) => format!("{}/{}", dir.to_string_lossy(), name),
        None => name,
    }
}

/// 带退避地删除临时文件（10/20/40ms），删不掉记录警告留给人工处理
async fn remove_temp_file(path: &Path) {
    let mut delay = Duration::from_millis(10);
    for attempt in 1..=REMOVE_RETRIES {
        match fs::remove_file(path).await {
            Ok(()) => return,
            Err(e) => {
                if attempt == REMOVE_RETRIES {
                    warn!(
                        "删除临时文件失败（已重试 {} 次）: {} - {}",
                        REMOVE_RETRIES,
                        path.display(),
                        e
                    );
                    return;
                }
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}

/// 终态到 HTTP 响应的映射
fn outcome_response(outcome: UploadOutcome) -> Response {
    match outcome {
        UploadOutcome::Stored { filename } => super::json_response(
            StatusCode::OK,
            json!({"status": "success", "filename": filename}),
        ),
        UploadOutcome::Duplicate => {
            super::json_response(StatusCode::CONFLICT, json!({"status": "exists"}))
        }
        UploadOutcome::RateLimited => super::json_response(
            StatusCode::TOO_MANY_REQUESTS,
            json!({"status": "rate_limited", "reason": "请求过于频繁，请稍后再试"}),
        ),
        UploadOutcome::BadRequest(reason) => super::json_response(
            StatusCode::BAD_REQUEST,
            json!({"status": "failed", "reason": reason}),
        ),
        UploadOutcome::Internal(reason) => super::json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"status": "failed", "reason": reason}),
        ),
    }
}
