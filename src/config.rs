use crate::error::{Result, SortError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 默认配置文件名（位于用户主目录下）
const DEFAULT_CONFIG_NAME: &str = ".mediasort.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 索引数据库文件路径，支持 %SAVEDIR% 占位符
    pub database_file: String,
    /// 归档根目录，支持 %HOME% 占位符
    pub savedir: String,
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 服务端地址（host:port）
    pub host: String,
}

/// 命令行参数覆盖项，逐字段覆盖配置文件
#[derive(Debug, Clone, Default)]
pub struct ConfigFlags {
    pub database_file: Option<String>,
    pub savedir: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub host: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                database_file: "%SAVEDIR%/mediasort.db".to_string(),
                savedir: "%HOME%/pictures".to_string(),
                ip: "localhost".to_string(),
                port: 8080,
            },
            client: ClientConfig {
                host: "localhost:8080".to_string(),
            },
        }
    }
}

/// 获取默认配置文件路径（~/.mediasort.toml）
pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| SortError::Config("无法确定用户主目录".to_string()))?;
    Ok(home.join(DEFAULT_CONFIG_NAME))
}

impl Config {
    /// 从指定路径加载配置并展开占位符
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SortError::Config(format!(
                "配置文件不存在: {}（可使用 --init 创建）",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| SortError::Config(format!("无法读取配置文件: {}", e)))?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| SortError::Config(format!("配置文件解析失败: {}", e)))?;
        config.expand_placeholders()?;
        Ok(config)
    }

    /// 加载配置：指定路径优先，否则取默认路径
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Self::from_file(&default_config_path()?),
        }
    }

    /// 在指定路径写出默认配置（占位符保持原样，留待加载时展开）
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SortError::Config(format!("无法创建配置目录: {}", e)))?;
        }
        let content = toml::to_string_pretty(&Config::default())
            .map_err(|e| SortError::Config(format!("配置序列化失败: {}", e)))?;
        std::fs::write(path, content)
            .map_err(|e| SortError::Config(format!("无法写入配置文件: {}", e)))?;
        Ok(())
    }

    /// 展开 %HOME% 与 %SAVEDIR% 占位符
    ///
    /// %SAVEDIR% 引用的是已展开后的归档根目录，所以必须先处理 savedir。
    fn expand_placeholders(&mut self) -> Result<()> {
        let home = dirs::home_dir().ok_or_else(|| SortError::Config("无法确定用户主目录".to_string()))?;
        let home = home.to_string_lossy().to_string();
        self.server.savedir = self.server.savedir.replacen("%HOME%", &home, 1);
        self.server.database_file = self
            .server
            .database_file
            .replacen("%SAVEDIR%", &self.server.savedir, 1);
        self.client.host = self.client.host.replacen("%HOME%", &home, 1);
        Ok(())
    }

    /// 应用命令行覆盖，覆盖值同样支持占位符
    pub fn apply_flags(&mut self, flags: &ConfigFlags) {
        if let Some(savedir) = &flags.savedir {
            let mut dir = savedir.clone();
            if let Some(home) = dirs::home_dir() {
                dir = dir.replacen("%HOME%", &home.to_string_lossy(), 1);
            }
            self.server.savedir = dir;
            // savedir 变化后，引用它的数据库路径需要重新展开
            if self.server.database_file.contains("%SAVEDIR%") {
                self.server.database_file = self
                    .server
                    .database_file
                    .replacen("%SAVEDIR%", &self.server.savedir, 1);
            }
        }
        if let Some(db) = &flags.database_file {
            self.server.database_file = db.replacen("%SAVEDIR%", &self.server.savedir, 1);
        }
        if let Some(ip) = &flags.ip {
            self.server.ip = ip.clone();
        }
        if let Some(port) = flags.port {
            self.server.port = port;
        }
        if let Some(host) = &flags.host {
            self.client.host = host.clone();
        }
    }

    /// 服务端监听地址
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.ip, self.server.port)
    }
}
