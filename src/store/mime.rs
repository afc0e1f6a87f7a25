use crate::asset_path::AssetPath;

/// Fallback for game archives and anything unrecognised.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Content type derived from the asset's file extension.
pub fn content_type_for(path: &AssetPath) -> &'static str {
    let Some(ext) = path.extension() else {
        return OCTET_STREAM;
    };
    match ext.as_str() {
        "wasm" => "application/wasm",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "txt" => "text/plain; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        _ => OCTET_STREAM,
    }
}
