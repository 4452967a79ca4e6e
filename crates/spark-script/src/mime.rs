//! 扩展名到 `Content-Type` 的映射。

use std::path::Path;

const DEFAULT_MIME: &str = "application/octet-stream";

/// 根据文件扩展名（大小写不敏感）选择内容类型，未知扩展名回落为二进制流。
pub fn content_type_for(path: &Path) -> &'static str {
    let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
        return DEFAULT_MIME;
    };
    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "wasm" => "application/wasm",
        _ => DEFAULT_MIME,
    }
}
