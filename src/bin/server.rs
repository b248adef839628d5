//! 媒体归档服务端入口

use clap::Parser;
use mediasort::batcher::InsertBatcher;
use mediasort::config::{Config, ConfigFlags, default_config_path};
use mediasort::http::{self, AppState};
use mediasort::index::{BATCH_SIZE, MediaIndex};
use mediasort::path_alloc::PathAllocator;
use mediasort::queue::{UploadContext, UploadQueue};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, error, info, warn};
use tracing_subscriber as logger;

#[derive(Parser, Debug)]
#[command(name = "mediasort-server", version, about = "内容寻址的媒体归档服务端")]
struct Args {
    /// 配置文件路径（默认 ~/.mediasort.toml）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 索引数据库路径（覆盖配置文件）
    #[arg(long = "database-file")]
    database_file: Option<String>,

    /// 归档根目录（覆盖配置文件）
    #[arg(long)]
    savedir: Option<String>,

    /// 监听地址（覆盖配置文件）
    #[arg(long)]
    ip: Option<String>,

    /// 监听端口（覆盖配置文件）
    #[arg(long)]
    port: Option<u16>,

    /// 上传工作任务数
    #[arg(long = "upload-workers", default_value_t = 10)]
    upload_workers: usize,

    /// 每秒允许的上传数
    #[arg(long = "rate-limit", default_value_t = 50)]
    rate_limit: u32,

    /// 写出默认配置文件后退出
    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() {
    logger::fmt().with_max_level(Level::INFO).init();
    let args = Args::parse();
    info!("mediasort 服务端 v{}", env!("CARGO_PKG_VERSION"));

    if args.init {
        let path = match args.config.clone().map(Ok).unwrap_or_else(default_config_path) {
            Ok(p) => p,
            Err(e) => {
                error!("{}", e);
                process::exit(1);
            }
        };
        if let Err(e) = Config::write_default(&path) {
            error!("创建配置文件失败: {}", e);
            process::exit(1);
        }
        info!("默认配置已写入: {}", path.display());
        process::exit(0);
    }

    let mut config = match Config::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("加载配置失败: {}", e);
            error!("可使用 --init 创建默认配置文件");
            process::exit(1);
        }
    };
    config.apply_flags(&ConfigFlags {
        database_file: args.database_file.clone(),
        savedir: args.savedir.clone(),
        ip: args.ip.clone(),
        port: args.port,
        host: None,
    });

    let save_dir = PathBuf::from(&config.server.savedir);
    if !save_dir.is_dir() {
        error!("归档目录不存在: {}", save_dir.display());
        process::exit(1);
    }

    // 索引打开失败是致命错误
    let index = match MediaIndex::open(Path::new(&config.server.database_file)).await {
        Ok(index) => Arc::new(index),
        Err(e) => {
            error!("打开索引失败: {}", e);
            process::exit(1);
        }
    };

    // 启动恢复：残留的 .download 临时文件没有索引记录，清掉
    http::cleanup_temp_files(&save_dir);

    let batcher = Arc::new(InsertBatcher::new(index.clone(), BATCH_SIZE));
    let allocator = Arc::new(PathAllocator::new(save_dir.clone()));
    let queue = Arc::new(UploadQueue::new(
        args.upload_workers,
        args.rate_limit,
        UploadContext {
            index: index.clone(),
            batcher: batcher.clone(),
            allocator,
        },
    ));

    let state = AppState {
        index: index.clone(),
        queue: queue.clone(),
        save_dir,
    };

    let addr = config.listen_addr();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = http::start_http_server(&addr, state).await {
            error!("HTTP 服务器错误: {}", e);
            process::exit(1);
        }
    });

    wait_for_shutdown().await;
    info!("收到退出信号，开始优雅停机...");

    // 给在途请求最多 30 秒排空
    let drained = tokio::time::timeout(Duration::from_secs(30), async {
        while !queue.is_idle() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("等待在途请求超时，强制停机");
    }

    // 停机顺序：停收请求 → 排空队列 → 冲刷批量缓冲 → 关闭索引
    server_handle.abort();
    queue.shutdown().await;
    if let Err(e) = batcher.flush().await {
        error!("停机冲刷批量缓冲失败: {}", e);
    }
    if let Err(e) = index.close().await {
        error!("关闭索引失败: {}", e);
    }
    info!("停机完成");
}

/// 等待 SIGINT/SIGTERM
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("注册 SIGTERM 失败");
        let mut sigint = signal(SignalKind::interrupt()).expect("注册 SIGINT 失败");
        tokio::select! {
            _ = sigterm.recv() => info!("收到 SIGTERM 信号"),
            _ = sigint.recv() => info!("收到 SIGINT 信号 (Ctrl+C)"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("监听 Ctrl+C 失败");
        info!("收到关闭信号");
    }
}
