//! 日志安装入口。
//!
//! # 教案式说明
//! - **意图（Why）**：运行时各组件只通过 `tracing` 宏打点（target 形如 `spark_script::timer`），
//!   宿主进程需要一个一次性入口把这些事件输出到终端。
//! - **逻辑（How）**：`tracing_subscriber::registry()` 组合 `EnvFilter` 与 `fmt` Layer，
//!   设置为全局 Subscriber；`RUST_LOG` 存在时覆盖配置中的过滤器。
//! - **契约（What）**：重复安装返回 [`LoggingError::AlreadyInstalled`]；外部已设置 Subscriber
//!   时返回 [`LoggingError::SubscriberAlreadySet`]，不会覆盖宿主的选择。

use std::sync::OnceLock;

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

static INSTALLED: OnceLock<String> = OnceLock::new();

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("spark-script logging is already installed")]
    AlreadyInstalled,
    #[error("a global tracing subscriber is already set")]
    SubscriberAlreadySet,
    #[error("invalid log filter `{filter}`: {reason}")]
    InvalidFilter { filter: String, reason: String },
    #[error("failed to set global subscriber: {0}")]
    SetGlobal(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// 安装全局日志 Subscriber。
pub fn install_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    if INSTALLED.get().is_some() {
        return Err(LoggingError::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(LoggingError::SubscriberAlreadySet);
    }

    let filter = build_env_filter(&config.filter)?;
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(config.ansi));
    tracing::subscriber::set_global_default(subscriber)?;

    INSTALLED
        .set(config.filter.clone())
        .map_err(|_| LoggingError::AlreadyInstalled)
}

/// 已安装时返回生效的过滤器文本。
pub fn installed_filter() -> Option<&'static str> {
    INSTALLED.get().map(String::as_str)
}

fn build_env_filter(fallback: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(fallback).map_err(|err| LoggingError::InvalidFilter {
        filter: fallback.to_owned(),
        reason: err.to_string(),
    })
}
