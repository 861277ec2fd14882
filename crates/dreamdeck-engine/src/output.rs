use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dreamdeck_contracts::GenerationError;
use image::ImageFormat;
use tracing::info;

/// Decodes a base64 image, tolerating a `data:` URL prefix and whitespace.
pub fn decode_base64_image(raw: &str) -> Option<Vec<u8>> {
    let trimmed = raw.trim();
    let payload = match trimmed.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => trimmed,
    };
    let compact = payload
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect::<String>();
    BASE64.decode(compact.as_bytes()).ok()
}

/// File extension for image bytes, or `None` when they are not an image we
/// know how to label.
pub fn sniff_extension(bytes: &[u8]) -> Option<&'static str> {
    match image::guess_format(bytes).ok()? {
        ImageFormat::Png => Some("png"),
        ImageFormat::WebP => Some("webp"),
        ImageFormat::Jpeg => Some("jpg"),
        _ => None,
    }
}

/// Writes one result image as `<dir>/<prefix><random>.<extension>`. Names are
/// unique, so concurrent requests sharing a prefix never collide.
pub fn write_output(
    dir: &Path,
    prefix: &str,
    extension: &str,
    bytes: &[u8],
) -> Result<PathBuf, GenerationError> {
    let failed = |err: &dyn std::fmt::Display| {
        GenerationError::generic(format!(
            "Couldn't save the generated image in {}: {err}",
            dir.display()
        ))
    };
    fs::create_dir_all(dir).map_err(|err| failed(&err))?;
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(&format!(".{extension}"))
        .tempfile_in(dir)
        .map_err(|err| failed(&err))?;
    file.write_all(bytes).map_err(|err| failed(&err))?;
    file.flush().map_err(|err| failed(&err))?;
    let (_, path) = file.keep().map_err(|err| failed(&err))?;
    info!(path = %path.display(), bytes = bytes.len(), "wrote generated image");
    Ok(path)
}

/// Reads the source image handed over by the host.
pub fn read_source_image(path: &Path) -> Result<Vec<u8>, GenerationError> {
    fs::read(path).map_err(|err| {
        GenerationError::generic(format!(
            "Couldn't read the source image {}: {err}",
            path.display()
        ))
    })
}
