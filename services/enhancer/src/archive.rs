use crate::image_store::ImageRecord;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, error, info, instrument};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Errors that abort archive assembly
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("An archive is already being built")]
    InProgress,

    #[error("Image {0} has no enhanced data")]
    MissingImage(String),

    #[error("Failed to write archive entry {entry}: {message}")]
    Write { entry: String, message: String },

    #[error("Archive task failed: {0}")]
    Task(String),
}

/// A finished archive ready for download
#[derive(Debug, Clone)]
pub struct Archive {
    /// Download file name
    pub file_name: String,
    /// Zip file content
    pub data: Bytes,
    /// Entry names in archive order
    pub entries: Vec<String>,
}

/// Assembler state exposed to clients
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveStatus {
    pub zipping: bool,
    pub last_error: Option<String>,
}

/// Packs all successfully enhanced images into one zip download.
pub struct ArchiveAssembler {
    file_name: String,
    zipping: AtomicBool,
    last_error: RwLock<Option<String>>,
}

/// Clears the zipping flag when dropped
struct ZippingGuard<'a>(&'a AtomicBool);

impl Drop for ZippingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ArchiveAssembler {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            zipping: AtomicBool::new(false),
            last_error: RwLock::new(None),
        }
    }

    pub fn is_zipping(&self) -> bool {
        self.zipping.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ArchiveStatus {
        ArchiveStatus {
            zipping: self.is_zipping(),
            last_error: self.last_error.read().clone(),
        }
    }

    /// Build an archive of every Success record.
    ///
    /// Returns `Ok(None)` when no record qualifies. Any failure aborts the
    /// whole archive; nothing partial is returned.
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn build(&self, records: Vec<ImageRecord>) -> Result<Option<Archive>, ArchiveError> {
        let qualifying: Vec<ImageRecord> = records
            .into_iter()
            .filter(|r| r.enhanced().is_some())
            .collect();

        if qualifying.is_empty() {
            debug!("No enhanced images to archive");
            return Ok(None);
        }

        if self
            .zipping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ArchiveError::InProgress);
        }
        let _guard = ZippingGuard(&self.zipping);

        let result = tokio::task::spawn_blocking(move || write_zip(&qualifying))
            .await
            .map_err(|e| ArchiveError::Task(e.to_string()))
            .and_then(|r| r);

        match result {
            Ok((data, entries)) => {
                *self.last_error.write() = None;
                metrics::counter!("enhancer_archives_total", "outcome" => "success").increment(1);
                info!(
                    entries = entries.len(),
                    size_bytes = data.len(),
                    file_name = %self.file_name,
                    "Archive built"
                );
                Ok(Some(Archive {
                    file_name: self.file_name.clone(),
                    data,
                    entries,
                }))
            }
            Err(e) => {
                error!(error = %e, "Archive assembly failed");
                metrics::counter!("enhancer_archives_total", "outcome" => "error").increment(1);
                *self.last_error.write() = Some(e.to_string());
                Err(e)
            }
        }
    }
}

/// Write all records into an in-memory zip, returning its bytes and entry names.
fn write_zip(records: &[ImageRecord]) -> Result<(Bytes, Vec<String>), ArchiveError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let mut used = HashSet::new();
    let mut entries = Vec::with_capacity(records.len());

    for record in records {
        let image = record
            .enhanced()
            .ok_or_else(|| ArchiveError::MissingImage(record.id.clone()))?;

        let entry = dedupe_entry_name(&mut used, entry_name(&record.name, &record.source.media_type));
        let write_err = |message: String| ArchiveError::Write {
            entry: entry.clone(),
            message,
        };

        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        writer
            .start_file(entry.clone(), options)
            .map_err(|e| write_err(e.to_string()))?;
        writer
            .write_all(&image.data)
            .map_err(|e| write_err(e.to_string()))?;

        entries.push(entry);
    }

    let cursor = writer.finish().map_err(|e| ArchiveError::Write {
        entry: "central directory".to_string(),
        message: e.to_string(),
    })?;

    Ok((Bytes::from(cursor.into_inner()), entries))
}

/// Download name for an enhanced image: `{base}-enhanced.{ext}`.
pub fn entry_name(original_name: &str, media_type: &str) -> String {
    format!("{}-enhanced.{}", base_name(original_name), extension_for(media_type))
}

/// File extension for a media type, with `jpeg` normalised to `jpg`
pub fn extension_for(media_type: &str) -> String {
    let subtype = media_type
        .split(';')
        .next()
        .and_then(|essence| essence.split('/').nth(1))
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "bin".to_string());

    if subtype == "jpeg" {
        "jpg".to_string()
    } else {
        subtype
    }
}

/// File name without its final extension
fn base_name(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}

/// Append `-2`, `-3`, ... before the extension until the name is unused.
fn dedupe_entry_name(used: &mut HashSet<String>, name: String) -> String {
    if used.insert(name.clone()) {
        return name;
    }

    let (stem, ext) = match name.rfind('.') {
        Some(idx) => (&name[..idx], &name[idx..]),
        None => (name.as_str(), ""),
    };

    let mut n = 2u32;
    loop {
        let candidate = format!("{}-{}{}", stem, n, ext);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}
