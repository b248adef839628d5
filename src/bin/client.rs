//! 媒体归档客户端入口
//!
//! 扫描本地目录，把服务端尚未收录的文件流式上传过去。

use clap::Parser;
use mediasort::client::ClientPipeline;
use mediasort::client::api::ApiClient;
use mediasort::config::{Config, ConfigFlags, default_config_path};
use mediasort::metadata::FsMetadataProvider;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{Level, error, info, warn};
use tracing_subscriber as logger;

#[derive(Parser, Debug)]
#[command(name = "mediasort-client", version, about = "内容寻址的媒体归档客户端")]
struct Args {
    /// 配置文件路径（默认 ~/.mediasort.toml）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 服务端地址 host:port（覆盖配置文件）
    #[arg(long)]
    host: Option<String>,

    /// 并行工作任务数
    #[arg(long, default_value_t = 10)]
    workers: usize,

    /// 写出默认配置文件后退出
    #[arg(long)]
    init: bool,

    /// 待扫描的目录
    directory: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    logger::fmt().with_max_level(Level::INFO).init();
    let args = Args::parse();
    info!("mediasort 客户端 v{}", env!("CARGO_PKG_VERSION"));

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
        host: args.host.clone(),
        ..Default::default()
    });

    let Some(directory) = args.directory else {
        error!("用法: mediasort-client [选项] <目录>");
        process::exit(1);
    };
    if !directory.is_dir() {
        error!("目录不存在: {}", directory.display());
        process::exit(1);
    }

    let api = match ApiClient::new(&config.client.host) {
        Ok(api) => Arc::new(api),
        Err(e) => {
            error!("创建 HTTP 客户端失败: {}", e);
            process::exit(1);
        }
    };

    // 版本握手：与服务端不一致直接退出
    match api.version().await {
        Ok(server_version) => {
            let own = env!("CARGO_PKG_VERSION");
            if server_version != own {
                error!("版本不匹配: 客户端 {} != 服务端 {}", own, server_version);
                process::exit(1);
            }
            info!("版本握手通过: {}", own);
        }
        Err(e) => {
            error!("查询服务端版本失败: {}", e);
            process::exit(1);
        }
    }

    let provider = Arc::new(FsMetadataProvider);
    let pipeline = ClientPipeline::new(api, provider, args.workers);

    // Ctrl+C 触发取消：在途操作做完即收尾
    let cancel = pipeline.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在收尾...");
            cancel.cancel();
        }
    });

    if let Err(e) = pipeline.run(&directory).await {
        error!("处理目录失败: {}", e);
        process::exit(1);
    }
}
