// 配置管理模块

use crate::uploader::error::UploadError;
use crate::uploader::retry::RetryPolicyConfig;
use crate::uploader::writer::DEFAULT_BUFFER_SIZE;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// HTTP 传输配置
    #[serde(default)]
    pub http: HttpStackConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 响应处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponsePolicy {
    /// 收到任何响应都视为上传完成（包括错误状态码）
    #[default]
    DeliverAll,
    /// 非 2xx 状态码视为失败，不重试
    FailOnErrorStatus,
    /// 非 2xx 状态码视为失败，按重试策略重试
    RetryOnErrorStatus,
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 响应处理策略
    #[serde(default)]
    pub response_policy: ResponsePolicy,
    /// 请求体写入分片大小（字节）
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// 默认是否使用定长流式模式
    #[serde(default = "default_fixed_length_streaming")]
    pub use_fixed_length_streaming_mode: bool,
    /// 重试策略
    #[serde(default)]
    pub retry_policy: RetryPolicyConfig,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_fixed_length_streaming() -> bool {
    true
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            response_policy: ResponsePolicy::default(),
            buffer_size: default_buffer_size(),
            use_fixed_length_streaming_mode: default_fixed_length_streaming(),
            retry_policy: RetryPolicyConfig::default(),
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> Result<(), UploadError> {
        self.retry_policy.validate()?;
        if self.buffer_size == 0 {
            return Err(UploadError::configuration("buffer_size 必须大于 0"));
        }
        Ok(())
    }
}

/// HTTP 传输配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpStackConfig {
    /// 连接超时（毫秒）
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// 读超时（毫秒）
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// 是否跟随重定向
    #[serde(default = "default_follow_redirects")]
    pub follow_redirects: bool,
    /// 是否允许使用缓存
    #[serde(default)]
    pub use_caches: bool,
}

fn default_connect_timeout_ms() -> u64 {
    15_000
}

fn default_read_timeout_ms() -> u64 {
    30_000
}

fn default_follow_redirects() -> bool {
    true
}

impl Default for HttpStackConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            follow_redirects: default_follow_redirects(),
            use_caches: false,
        }
    }
}

impl HttpStackConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), UploadError> {
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 {
            return Err(UploadError::configuration("超时时间必须大于 0"));
        }
        Ok(())
    }
}

impl AppConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        self.upload.validate().context("上传配置无效")?;
        self.http.validate().context("HTTP 配置无效")?;
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;

        let config: AppConfig =
            toml::from_str(&content).with_context(|| format!("解析配置文件失败: {:?}", path))?;
        config.validate()?;

        info!("配置文件加载成功: {:?}", path);
        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("创建配置目录失败: {:?}", parent))?;
            }
        }

        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", path))?;

        info!("配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载配置，失败时使用默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!("配置文件不存在，使用默认配置: {:?}", path);
            return Self::default();
        }

        match Self::load_from_file(path).await {
            Ok(config) => config,
            Err(e) => {
                warn!("加载配置文件失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}
