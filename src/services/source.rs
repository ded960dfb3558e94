use crate::core::io::Storage;
use anyhow::{anyhow, Context, Result};
use epub::doc::EpubDoc;
use log::debug;
use std::path::Path;

const SKIPPED_EPUB_IDS: [&str; 3] = ["title", "colophon", "contents"];

pub fn is_source_file(path: &str) -> bool {
    matches!(extension(path).as_deref(), Some("txt") | Some("epub"))
}

fn extension(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
}

/// Reads a source or reference file as plain text. EPUB chapters are
/// converted from HTML and joined in spine order.
pub async fn load_text(storage: &dyn Storage, path: &str) -> Result<String> {
    if extension(path).as_deref() == Some("epub") {
        let owned = path.to_string();
        return tokio::task::spawn_blocking(move || epub_to_text(&owned))
            .await
            .context("EPUB conversion task panicked")?;
    }
    storage.read_text(path).await
}

pub fn epub_to_text(path: &str) -> Result<String> {
    let mut doc = EpubDoc::new(path).map_err(|e| anyhow!("Failed to open {}: {:?}", path, e))?;
    let mut chapters = Vec::new();

    loop {
        let id = doc.get_current_id();
        let skip = match id.as_deref() {
            Some(id) => SKIPPED_EPUB_IDS.contains(&id),
            None => true,
        };

        if !skip {
            let (content, mimetype) = doc.get_current_str().unwrap_or_default();
            match mimetype.as_str() {
                "application/xhtml+xml" | "text/html" => {
                    let text = html2text::from_read(content.as_bytes(), 500)
                        .map_err(|e| anyhow!("Failed to convert chapter {:?}: {:?}", id, e))?;
                    let text = text.trim();
                    if !text.is_empty() {
                        chapters.push(text.to_string());
                    }
                }
                _ => debug!("Skipping non-HTML chapter {:?} ({})", id, mimetype),
            }
        }

        if !doc.go_next() {
            break;
        }
    }

    Ok(chapters.join("\n\n"))
}
