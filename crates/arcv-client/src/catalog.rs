//! Forward-only walk over the archived media listing

use arcv_core::types::{ArchiveServiceCredential, MediaItemsPage, StoredMediaObject};
use arcv_core::{ArchiveError, ArchiveResult};
use arcv_crypto::BackupKey;

use crate::api::ArchiveApi;

/// Stateful page walker. The cursor can be saved with [`MediaPager::cursor`]
/// and handed to [`MediaPager::resume_from`] to continue later.
pub struct MediaPager<'a> {
    api: &'a dyn ArchiveApi,
    key: &'a BackupKey,
    credential: &'a ArchiveServiceCredential,
    limit: u32,
    cursor: Option<String>,
    done: bool,
}

impl<'a> MediaPager<'a> {
    pub fn new(
        api: &'a dyn ArchiveApi,
        key: &'a BackupKey,
        credential: &'a ArchiveServiceCredential,
        limit: u32,
    ) -> Self {
        Self {
            api,
            key,
            credential,
            limit,
            cursor: None,
            done: false,
        }
    }

    pub fn resume_from(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    /// Cursor the next call will send; `None` before the first page and after the last.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Fetch the next page, or `None` once the listing is exhausted.
    pub async fn next_page(&mut self) -> ArchiveResult<Option<MediaItemsPage>> {
        if self.done {
            return Ok(None);
        }
        let page = self
            .api
            .get_archive_media_items_page(
                self.key,
                self.credential,
                self.limit,
                self.cursor.as_deref(),
            )
            .await?;

        match &page.cursor {
            Some(next) if self.cursor.as_deref() == Some(next.as_str()) => {
                return Err(ArchiveError::Protocol(format!(
                    "media listing cursor {next:?} did not advance"
                )));
            }
            Some(next) => self.cursor = Some(next.clone()),
            None => {
                self.cursor = None;
                self.done = true;
            }
        }
        Ok(Some(page))
    }
}

/// Drain the whole listing into memory. Diagnostic use only.
pub async fn collect_all(
    api: &dyn ArchiveApi,
    key: &BackupKey,
    credential: &ArchiveServiceCredential,
    limit: u32,
) -> ArchiveResult<Vec<StoredMediaObject>> {
    let mut pager = MediaPager::new(api, key, credential, limit);
    let mut items = Vec::new();
    while let Some(page) = pager.next_page().await? {
        items.extend(page.stored_media_objects);
    }
    Ok(items)
}
