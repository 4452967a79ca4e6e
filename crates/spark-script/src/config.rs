//! 运行时配置。
//!
//! # 教案式说明
//! - **意图（Why）**：传输阈值、分块大小、截止时间与日志过滤器需要按部署调整，
//!   以 TOML 文件描述，避免重新编译。
//! - **契约（What）**：
//!   - 所有字段都有默认值，空文档即得到默认配置；
//!   - 未知键直接拒绝（`deny_unknown_fields`），防止拼写错误被静默忽略；
//!   - [`RuntimeConfig::validate`] 保证 `chunk_size > 0`、`deadline > 0`、`inline <= mapped`，
//!     且 SSE 待发上限非零。
//!
//! ```toml
//! [transfer]
//! inline_threshold_bytes = 65536
//! mapped_threshold_bytes = 16777216
//! chunk_size_bytes = 16384
//! deadline_ms = 60000
//!
//! [sse]
//! max_pending_bytes = 1048576
//!
//! [logging]
//! filter = "spark_script=debug"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::transfer::TransferLimits;

/// 配置加载失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{}`: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config document: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub transfer: TransferConfig,
    pub timers: TimerConfig,
    pub sse: SseConfig,
    pub logging: LoggingConfig,
}

/// 文件传输策略参数。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    /// 小于该值的文件整体读入并一次写出。
    pub inline_threshold_bytes: u64,
    /// 大于该值的文件通过内存映射流式发送。
    pub mapped_threshold_bytes: u64,
    pub chunk_size_bytes: usize,
    pub deadline_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            inline_threshold_bytes: DEFAULT_INLINE_THRESHOLD,
            mapped_threshold_bytes: DEFAULT_MAPPED_THRESHOLD,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            deadline_ms: DEFAULT_DEADLINE_MS,
        }
    }
}

impl TransferConfig {
    pub fn limits(&self) -> TransferLimits {
        TransferLimits {
            inline_threshold: self.inline_threshold_bytes,
            mapped_threshold: self.mapped_threshold_bytes,
            chunk_size: self.chunk_size_bytes,
            deadline: Duration::from_millis(self.deadline_ms),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TimerConfig {
    /// 每隔多少次循环迭代执行一次定时器回收；`1` 表示每次迭代都回收。
    pub sweep_every_iterations: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            sweep_every_iterations: 1,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SseConfig {
    /// 单个流在背压下最多积压的字节数；超出的事件被丢弃并返回 `Dropped`。
    pub max_pending_bytes: usize,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            max_pending_bytes: DEFAULT_SSE_MAX_PENDING,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` 语法；`RUST_LOG` 存在时优先。
    pub filter: String,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
            ansi: true,
        }
    }
}

impl RuntimeConfig {
    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let transfer = &self.transfer;
        if transfer.chunk_size_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "transfer.chunk_size_bytes",
                reason: "must be greater than zero",
            });
        }
        if transfer.deadline_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "transfer.deadline_ms",
                reason: "must be greater than zero",
            });
        }
        if transfer.inline_threshold_bytes > transfer.mapped_threshold_bytes {
            return Err(ConfigError::Invalid {
                field: "transfer.inline_threshold_bytes",
                reason: "must not exceed transfer.mapped_threshold_bytes",
            });
        }
        if self.sse.max_pending_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "sse.max_pending_bytes",
                reason: "must be greater than zero",
            });
        }
        if self.timers.sweep_every_iterations == 0 {
            return Err(ConfigError::Invalid {
                field: "timers.sweep_every_iterations",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

const DEFAULT_INLINE_THRESHOLD: u64 = 64 * 1024;
const DEFAULT_MAPPED_THRESHOLD: u64 = 16 * 1024 * 1024;
const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
const DEFAULT_DEADLINE_MS: u64 = 60_000;
const DEFAULT_SSE_MAX_PENDING: usize = 1024 * 1024;
