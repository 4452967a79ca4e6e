//! 静态目录挂载与路径解析。
//!
//! # 教案式说明
//! - **意图（Why）**：`serve_static("/assets", "./public")` 把 `/assets/*` 映射到磁盘目录；
//!   解析阶段必须保证根目录之外的任何文件都不会被打开。
//! - **逻辑（How）**：
//!   1. 去掉挂载前缀后的后缀只要出现 `..`、反斜杠或 NUL，直接 403，不访问文件系统；
//!   2. 后缀的每个组件都必须是普通组件（拒绝根与盘符）；
//!   3. 目录回落到 `index.html`；
//!   4. 规范化后的目标必须仍在规范化根目录之下（符号链接逃逸同样 403）；
//!   5. 不存在或不是普通文件 → 404。
//! - **契约（What）**：解析只做 `stat`/`canonicalize`，不打开文件；打开发生在传输引擎中，
//!   失败时回复 500。

use std::path::{Component, Path, PathBuf};

use crate::error::{Result, RuntimeError};
use crate::response::ResponseHandle;
use crate::transfer::{TransferEngine, TransferStrategy};

const INDEX_FILE: &str = "index.html";

/// 解析被拒绝的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaticRejection {
    Forbidden,
    NotFound,
}

impl StaticRejection {
    pub const fn status(self) -> u16 {
        match self {
            StaticRejection::Forbidden => 403,
            StaticRejection::NotFound => 404,
        }
    }

    pub const fn body(self) -> &'static str {
        match self {
            StaticRejection::Forbidden => "Forbidden",
            StaticRejection::NotFound => "Not Found",
        }
    }
}

/// 一个静态目录挂载点。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticMount {
    prefix: String,
    root: PathBuf,
}

impl StaticMount {
    /// `dir` 必须是已存在的目录。
    pub fn new(prefix: &str, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(RuntimeError::StaticRoot {
                path: dir.to_path_buf(),
            });
        }
        let root = dir.canonicalize().map_err(|_| RuntimeError::StaticRoot {
            path: dir.to_path_buf(),
        })?;
        Ok(Self {
            prefix: normalize_prefix(prefix),
            root,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 路由模式：`<prefix>/*`。
    pub fn pattern(&self) -> String {
        format!("{}/*", self.prefix)
    }

    /// 把请求路径解析为根目录下的文件。
    pub fn resolve(&self, url: &str) -> core::result::Result<PathBuf, StaticRejection> {
        let suffix = url
            .strip_prefix(self.prefix.as_str())
            .ok_or(StaticRejection::NotFound)?;
        if suffix.contains("..") || suffix.contains('\\') || suffix.contains('\0') {
            return Err(StaticRejection::Forbidden);
        }
        let relative = Path::new(suffix.trim_start_matches('/'));
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(StaticRejection::Forbidden);
        }

        let mut candidate = self.root.join(relative);
        if candidate.is_dir() {
            candidate.push(INDEX_FILE);
        }
        let resolved = candidate
            .canonicalize()
            .map_err(|_| StaticRejection::NotFound)?;
        if !resolved.starts_with(&self.root) {
            return Err(StaticRejection::Forbidden);
        }
        if !resolved.is_file() {
            return Err(StaticRejection::NotFound);
        }
        Ok(resolved)
    }

    /// 解析并发送；返回选用的传输策略，被拒绝或失败时返回 `None`。
    pub(crate) fn serve(
        &self,
        url: &str,
        response: &ResponseHandle,
        transfers: &TransferEngine,
    ) -> Option<TransferStrategy> {
        let path = match self.resolve(url) {
            Ok(path) => path,
            Err(rejection) => {
                tracing::debug!(
                    target: "spark_script::transfer",
                    url,
                    status = rejection.status(),
                    "static request rejected"
                );
                response.respond_text(rejection.status(), rejection.body());
                return None;
            }
        };
        match transfers.start(response.clone(), &path) {
            Ok(strategy) => Some(strategy),
            Err(err) => {
                tracing::error!(
                    target: "spark_script::transfer",
                    path = %path.display(),
                    code = err.code(),
                    error = %err,
                    "failed to open static file"
                );
                response.respond_text(500, "Could not open file.");
                None
            }
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() || trimmed.starts_with('/') {
        trimmed.to_owned()
    } else {
        format!("/{trimmed}")
    }
}
