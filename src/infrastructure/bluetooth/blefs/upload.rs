//! Upload naming and payload preparation.
//!
//! The transfer protocol moves bytes only. Raster images have to be converted
//! into the watch's native format before they are handed to a write.

use std::path::Path;

const MAX_STEM_LEN: usize = 30;
const RASTER_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif"];

/// Converts a raster image into the watch's binary image format.
pub trait ImageConverter: Send + Sync {
    fn convert(&self, image: &[u8]) -> anyhow::Result<Vec<u8>>;
}

pub fn is_raster_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| RASTER_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Remote name for an uploaded local file inside `directory`.
///
/// Raster images become `<stem>.bin` with the stem cut to 30 characters and
/// whitespace runs replaced by `_`. Other files keep their name.
pub fn upload_path(directory: &str, local: &Path) -> String {
    let file_name = if is_raster_image(local) {
        let stem = local
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let truncated: String = stem.chars().take(MAX_STEM_LEN).collect();
        format!("{}.bin", collapse_whitespace(&truncated))
    } else {
        local
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    };

    let directory = directory.trim_end_matches('/');
    format!("{}/{}", directory, file_name)
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_run = false;
    for c in s.chars() {
        if c.is_whitespace() {
            if !in_run {
                out.push('_');
            }
            in_run = true;
        } else {
            out.push(c);
            in_run = false;
        }
    }
    out
}

/// Bytes to write for `local`, converting raster images first.
pub fn prepare_payload(
    local: &Path,
    contents: Vec<u8>,
    converter: Option<&dyn ImageConverter>,
) -> anyhow::Result<Vec<u8>> {
    if !is_raster_image(local) {
        return Ok(contents);
    }
    match converter {
        Some(converter) => converter.convert(&contents),
        None => anyhow::bail!(
            "{} is a raster image and no image converter is configured",
            local.display()
        ),
    }
}
