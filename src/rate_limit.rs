//! 令牌桶限流
//!
//! 以固定速率补充令牌，桶容量即突发上限。`allow` 非阻塞：
//! 拿不到令牌立即返回 false，由调用方决定如何拒绝请求。

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub struct RateLimiter {
    tokens: Arc<Semaphore>,
    capacity: usize,
    refill_task: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// 创建限流器
    ///
    /// * `rate` - 每秒补充的令牌数
    /// * `capacity` - 桶容量（突发上限），通常取 2 倍速率
    pub fn new(rate: u32, capacity: usize) -> Self {
        assert!(rate > 0, "速率必须大于 0");
        // 初始装满，允许启动后立即吸收一波突发
        let tokens = Arc::new(Semaphore::new(capacity));

        let refill_tokens = tokens.clone();
        let refill_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / rate as f64));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // 第一跳立即完成，先消费掉，补充从一个完整周期之后开始
            ticker.tick().await;
            loop {
                ticker.tick().await;
                // 桶满则丢弃本次令牌
                if refill_tokens.available_permits() < capacity {
                    refill_tokens.add_permits(1);
                }
            }
        });

        Self {
            tokens,
            capacity,
            refill_task: Mutex::new(Some(refill_task)),
        }
    }

    /// 消耗一枚令牌；拿不到立即返回 false
    pub fn allow(&self) -> bool {
        match self.tokens.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// 当前可用令牌数
    pub fn available(&self) -> usize {
        self.tokens.available_permits()
    }

    /// 桶容量
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 停止补充令牌
    pub fn stop(&self) {
        if let Ok(mut guard) = self.refill_task.lock()
            && let Some(task) = guard.take()
        {
            task.abort();
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.stop();
    }
}
