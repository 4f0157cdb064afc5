use crate::status::{EnhancedImage, ImageStatus, StatusKind, Transition, TransitionError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashSet;
use tracing::{debug, info, instrument, trace};

/// An uploaded file before it enters the store
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Original file name
    pub name: String,
    /// Declared media type, if the client sent one
    pub media_type: Option<String>,
    /// Raw file content
    pub data: Bytes,
}

/// Original image content, immutable after creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    pub data: Bytes,
    pub media_type: String,
}

/// One uploaded image and its enhancement state
#[derive(Debug, Clone)]
pub struct ImageRecord {
    /// Unique record ID, derived from name and creation time
    pub id: String,
    /// Original file name
    pub name: String,
    /// Original image content
    pub source: SourceImage,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// Enhancement status
    pub status: ImageStatus,
}

impl ImageRecord {
    pub fn enhanced(&self) -> Option<&EnhancedImage> {
        self.status.enhanced()
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.status.error_detail()
    }
}

#[derive(Default)]
struct Inner {
    records: Vec<ImageRecord>,
    issued_ids: HashSet<String>,
}

/// Append-only, ordered store of image records.
///
/// All status changes go through the write lock, so a transition is an
/// atomic compare-and-swap on the record's current state.
#[derive(Default)]
pub struct ImageStore {
    inner: RwLock<Inner>,
}

impl ImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one Idle record per image file, in input order.
    ///
    /// Files whose media type is not `image/*` are skipped.
    #[instrument(skip(self, files), fields(count = files.len()))]
    pub fn add(&self, files: Vec<UploadedFile>) -> Vec<ImageRecord> {
        let mut inner = self.inner.write();
        let mut added = Vec::with_capacity(files.len());

        for file in files {
            let Some(media_type) = resolve_media_type(&file) else {
                debug!(name = %file.name, "Skipping non-image upload");
                continue;
            };

            let created_at = Utc::now();
            let id = unique_id(&inner.issued_ids, &file.name, created_at);
            inner.issued_ids.insert(id.clone());

            let record = ImageRecord {
                id,
                name: file.name,
                source: SourceImage {
                    data: file.data,
                    media_type,
                },
                created_at,
                status: ImageStatus::Idle,
            };

            trace!(id = %record.id, media_type = %record.source.media_type, "Image added");
            inner.records.push(record.clone());
            added.push(record);
        }

        if !added.is_empty() {
            info!(added = added.len(), total = inner.records.len(), "Images added to store");
        }

        added
    }

    /// Replace the status of the matching record.
    ///
    /// Unknown ids are ignored.
    pub fn update_status(&self, id: &str, status: ImageStatus) -> Option<ImageRecord> {
        let mut inner = self.inner.write();
        let record = inner.records.iter_mut().find(|r| r.id == id)?;
        record.status = status;
        Some(record.clone())
    }

    /// Apply a state machine transition to the matching record.
    pub fn apply(&self, id: &str, transition: Transition) -> Result<ImageRecord, TransitionError> {
        let mut inner = self.inner.write();
        let record = inner
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| TransitionError::NotFound(id.to_string()))?;

        let name = transition.name();
        let next = record.status.apply(transition)?;
        trace!(id = %id, from = %record.status.kind(), to = %next.kind(), transition = name, "Status transition");
        record.status = next;

        Ok(record.clone())
    }

    /// Like [`apply`](Self::apply), but only when the record is currently in `expected` state.
    pub fn apply_if(
        &self,
        id: &str,
        expected: StatusKind,
        transition: Transition,
    ) -> Result<ImageRecord, TransitionError> {
        let mut inner = self.inner.write();
        let record = inner
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| TransitionError::NotFound(id.to_string()))?;

        if record.status.kind() != expected {
            return Err(TransitionError::Invalid {
                from: record.status.kind(),
                transition: transition.name(),
            });
        }

        record.status = record.status.apply(transition)?;
        Ok(record.clone())
    }

    pub fn get(&self, id: &str) -> Option<ImageRecord> {
        self.inner.read().records.iter().find(|r| r.id == id).cloned()
    }

    /// Snapshot of all records in upload order
    pub fn list(&self) -> Vec<ImageRecord> {
        self.inner.read().records.clone()
    }

    /// IDs of records currently Idle, in upload order
    pub fn idle_ids(&self) -> Vec<String> {
        self.inner
            .read()
            .records
            .iter()
            .filter(|r| r.status == ImageStatus::Idle)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Records that finished enhancement successfully, in upload order
    pub fn successful(&self) -> Vec<ImageRecord> {
        self.inner
            .read()
            .records
            .iter()
            .filter(|r| r.status.kind() == StatusKind::Success)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Declared media type if it is an image, otherwise sniff the content.
fn resolve_media_type(file: &UploadedFile) -> Option<String> {
    let declared = file
        .media_type
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty() && *m != "application/octet-stream");

    let media_type = match declared {
        Some(m) => m.to_ascii_lowercase(),
        None => infer::get(&file.data)?.mime_type().to_string(),
    };

    media_type.starts_with("image/").then_some(media_type)
}

/// Build `{name}-{millis}`, suffixed with `-N` if that id was already issued.
fn unique_id(issued: &HashSet<String>, name: &str, created_at: DateTime<Utc>) -> String {
    let base = format!("{}-{}", name, created_at.timestamp_millis());
    if !issued.contains(&base) {
        return base;
    }

    let mut n = 2u32;
    loop {
        let candidate = format!("{}-{}", base, n);
        if !issued.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Smallest valid PNG signature plus IHDR start, enough for sniffing
    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];

    fn image_file(name: &str, media_type: &str) -> UploadedFile {
        UploadedFile {
            name: name.to_string(),
            media_type: Some(media_type.to_string()),
            data: Bytes::from(format!("bytes of {}", name)),
        }
    }

    #[test]
    fn test_add_skips_non_images_and_keeps_order() {
        let store = ImageStore::new();
        let added = store.add(vec![
            image_file("a.png", "image/png"),
            image_file("notes.txt", "text/plain"),
            image_file("b.jpg", "image/jpeg"),
            image_file("doc.pdf", "application/pdf"),
            image_file("c.webp", "image/webp"),
        ]);

        let names: Vec<_> = added.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.jpg", "c.webp"]);

        let stored: Vec<_> = store.list().into_iter().map(|r| r.name).collect();
        assert_eq!(stored, vec!["a.png", "b.jpg", "c.webp"]);
        assert!(store.list().iter().all(|r| r.status == ImageStatus::Idle));
    }

    #[test]
    fn test_add_sniffs_missing_media_type() {
        let store = ImageStore::new();
        let added = store.add(vec![
            UploadedFile {
                name: "pasted".to_string(),
                media_type: None,
                data: Bytes::from_static(PNG_MAGIC),
            },
            UploadedFile {
                name: "blob".to_string(),
                media_type: Some("application/octet-stream".to_string()),
                data: Bytes::from_static(b"plain text, not an image"),
            },
        ]);

        assert_eq!(added.len(), 1);
        assert_eq!(added[0].source.media_type, "image/png");
    }

    #[test]
    fn test_ids_are_unique_for_same_name() {
        let store = ImageStore::new();
        let added = store.add(vec![
            image_file("same.png", "image/png"),
            image_file("same.png", "image/png"),
            image_file("same.png", "image/png"),
        ]);

        let ids: HashSet<_> = added.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids.len(), 3);
        assert!(added.iter().all(|r| r.id.starts_with("same.png-")));
    }

    #[test]
    fn test_unique_id_suffixes() {
        let now = Utc::now();
        let mut issued = HashSet::new();
        let first = unique_id(&issued, "x.png", now);
        issued.insert(first.clone());
        let second = unique_id(&issued, "x.png", now);
        assert_eq!(second, format!("{}-2", first));
    }

    #[test]
    fn test_update_status_only_touches_matching_record() {
        let store = ImageStore::new();
        let added = store.add(vec![image_file("a.png", "image/png"), image_file("b.png", "image/png")]);

        let updated = store
            .update_status(&added[0].id, ImageStatus::Error("bad".to_string()))
            .unwrap();
        assert_eq!(updated.error_detail(), Some("bad"));
        assert_eq!(store.get(&added[1].id).unwrap().status, ImageStatus::Idle);
    }

    #[test]
    fn test_update_status_unknown_id_is_noop() {
        let store = ImageStore::new();
        store.add(vec![image_file("a.png", "image/png")]);
        assert!(store.update_status("missing", ImageStatus::Enhancing).is_none());
        assert_eq!(store.list()[0].status, ImageStatus::Idle);
    }

    #[test]
    fn test_apply_transitions() {
        let store = ImageStore::new();
        let id = store.add(vec![image_file("a.png", "image/png")])[0].id.clone();

        store.apply(&id, Transition::Request).unwrap();
        assert!(store.apply(&id, Transition::Request).is_err());

        let record = store
            .apply(
                &id,
                Transition::Succeed(EnhancedImage {
                    data: Bytes::from_static(b"better"),
                    media_type: "image/png".to_string(),
                }),
            )
            .unwrap();
        assert_eq!(record.enhanced().unwrap().data, Bytes::from_static(b"better"));
        assert_eq!(store.successful().len(), 1);
        // Source bytes never change
        assert_eq!(record.source.data, Bytes::from("bytes of a.png"));
    }

    #[test]
    fn test_apply_unknown_id() {
        let store = ImageStore::new();
        assert_eq!(
            store.apply("nope", Transition::Request).unwrap_err(),
            TransitionError::NotFound("nope".to_string())
        );
    }

    #[test]
    fn test_apply_if_requires_expected_state() {
        let store = ImageStore::new();
        let id = store.add(vec![image_file("a.png", "image/png")])[0].id.clone();
        store.update_status(&id, ImageStatus::Error("old".to_string()));

        assert!(store
            .apply_if(&id, StatusKind::Idle, Transition::Request)
            .is_err());
        assert_eq!(store.get(&id).unwrap().error_detail(), Some("old"));
    }

    #[test]
    fn test_idle_ids_in_order() {
        let store = ImageStore::new();
        let added = store.add(vec![
            image_file("a.png", "image/png"),
            image_file("b.png", "image/png"),
            image_file("c.png", "image/png"),
        ]);
        store.apply(&added[1].id, Transition::Request).unwrap();

        assert_eq!(store.idle_ids(), vec![added[0].id.clone(), added[2].id.clone()]);
        assert_eq!(store.len(), 3);
        assert!(!store.is_empty());
    }
}
