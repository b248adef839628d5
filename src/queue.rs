//! 上传队列
//!
//! 有界请求队列加固定工作池。HTTP 处理器把解析好的请求投入队列后
//! 等待完成信号，响应内容由工作任务的处理结果决定。

use crate::batcher::InsertBatcher;
use crate::index::MediaIndex;
use crate::media::MediaRecord;
use crate::path_alloc::PathAllocator;
use crate::rate_limit::RateLimiter;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// 一次上传的终态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// 已落盘并收录，携带规范相对路径
    Stored { filename: String },
    /// 内容已存在
    Duplicate,
    /// 被限流拒绝
    RateLimited,
    /// 请求不合法（表单缺字段、哈希不匹配等）
    BadRequest(String),
    /// 服务端内部错误
    Internal(String),
}

/// 排队等待处理的上传请求
pub struct UploadRequest {
    /// 客户端声明的媒体记录
    pub record: MediaRecord,
    /// 尚未消费 file 字段的表单流
    pub multipart: multer::Multipart<'static>,
    /// 完成信号，处理器凭它拿到终态
    pub done: oneshot::Sender<UploadOutcome>,
}

/// 工作任务处理上传所需的共享资源
#[derive(Clone)]
pub struct UploadContext {
    pub index: Arc<MediaIndex>,
    pub batcher: Arc<InsertBatcher>,
    pub allocator: Arc<PathAllocator>,
}

pub struct UploadQueue {
    tx: std::sync::Mutex<Option<mpsc::Sender<UploadRequest>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    limiter: Arc<RateLimiter>,
    in_flight: Arc<AtomicUsize>,
}

impl UploadQueue {
    /// 创建队列并启动工作池
    ///
    /// 队列容量为工作数的 2 倍；限流桶容量为速率的 2 倍（允许短突发）。
    pub fn new(workers: usize, rate_limit: u32, ctx: UploadContext) -> Self {
        let (tx, rx) = mpsc::channel::<UploadRequest>(workers * 2);
        let rx = Arc::new(Mutex::new(rx));
        let limiter = Arc::new(RateLimiter::new(rate_limit, rate_limit as usize * 2));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let rx = rx.clone();
            let limiter = limiter.clone();
            let ctx = ctx.clone();
            let in_flight = in_flight.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(id, rx, limiter, ctx, in_flight).await;
            }));
        }
        info!("上传队列已就绪: {} 个工作任务, 限速 {} 次/秒", workers, rate_limit);

        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            limiter,
            in_flight,
        }
    }

    /// 入队
    ///
    /// 非阻塞模式下队列满立即返回 false；阻塞模式最多等待 `timeout`。
    pub async fn enqueue(&self, req: UploadRequest, blocking: bool, timeout: Duration) -> bool {
        let Some(tx) = self.tx.lock().expect("队列锁中毒").clone() else {
            return false;
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let sent = if blocking {
            matches!(
                tokio::time::timeout(timeout, tx.send(req)).await,
                Ok(Ok(()))
            )
        } else {
            tx.try_send(req).is_ok()
        };
        if !sent {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        sent
    }

    /// 队列里是否还有未完成的请求
    pub fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
    }

    /// 优雅停机：封住入口，等所有工作任务把队列排空，停掉限流器
    pub async fn shutdown(&self) {
        self.tx.lock().expect("队列锁中毒").take();
        let handles = {
            let mut workers = self.workers.lock().await;
            std::mem::take(&mut *workers)
        };
        for handle in handles {
            let _ = handle.await;
        }
        self.limiter.stop();
        info!("上传队列已停止");
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<UploadRequest>>>,
    limiter: Arc<RateLimiter>,
    ctx: UploadContext,
    in_flight: Arc<AtomicUsize>,
) {
    loop {
        // 共享接收端：锁只覆盖取请求这一步
        let req = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(UploadRequest {
            record,
            multipart,
            done,
        }) = req
        else {
            break;
        };

        let outcome = if !limiter.allow() {
            debug!("工作任务 {} 拒绝请求: 已达速率上限", id);
            UploadOutcome::RateLimited
        } else {
            crate::http::upload::process_upload(record, multipart, &ctx).await
        };

        // 处理器可能已超时放弃等待，发送失败可忽略
        let _ = done.send(outcome);
        in_flight.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("工作任务 {} 退出", id);
}

#[cfg(test)]
pub(crate) mod testing {
    use bytes::Bytes;
    use std::convert::Infallible;

    /// 构造只含 file 字段的表单流，供工作任务层的测试使用
    pub fn file_only_multipart(content: &[u8]) -> multer::Multipart<'static> {
        let boundary = "test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"file\"; filename=\"upload.bin\"\r\n\r\n",
        );
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        let stream = futures_util::stream::iter(vec![Ok::<_, Infallible>(Bytes::from(body))]);
        multer::Multipart::new(stream, boundary)
    }
}
