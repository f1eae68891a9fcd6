//! Reference metadata: read, conditional write, and explicit sync.
//!
//! Records are whole-document JSON blobs. A write may carry the hash of the
//! content it was derived from; if the stored content changed in between, the
//! write fails with [`WeaveError::Conflict`] instead of clobbering it. Writes
//! without an expected hash are last-write-wins.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::backoff::Backoff;
use crate::core::identity::from_canonical_name;
use crate::core::metadata::{MetadataRecord, Observed, content_hash};
use crate::error::WeaveError;
use crate::io::lock::lock_named;
use crate::io::stores::MetadataStore;

/// Metadata operations over a [`MetadataStore`].
pub struct Metadata<'a, S: MetadataStore + ?Sized> {
    store: &'a S,
    locks_dir: PathBuf,
    lock_backoff: Backoff,
    sync_backoff: Backoff,
}

impl<'a, S: MetadataStore + ?Sized> Metadata<'a, S> {
    pub fn new(
        store: &'a S,
        locks_dir: impl Into<PathBuf>,
        lock_backoff: Backoff,
        sync_backoff: Backoff,
    ) -> Self {
        Self {
            store,
            locks_dir: locks_dir.into(),
            lock_backoff,
            sync_backoff,
        }
    }

    /// Current record and its content hash, if any.
    pub fn get(&self, reference: &str) -> Result<Option<Observed>> {
        from_canonical_name(reference)?;
        let Some(raw) = self.store.read_metadata(reference)? else {
            return Ok(None);
        };
        let record = MetadataRecord::from_json(&raw)
            .with_context(|| format!("parse metadata for {reference}"))?;
        Ok(Some(Observed {
            hash: content_hash(&raw),
            record,
        }))
    }

    /// Replace the record. With `expected_hash`, fail on a concurrent change.
    /// Returns the hash of the new content.
    #[instrument(skip_all, fields(reference))]
    pub fn set(
        &self,
        reference: &str,
        record: &MetadataRecord,
        expected_hash: Option<&str>,
    ) -> Result<String> {
        from_canonical_name(reference)?;
        let raw = record.to_json().context("serialize metadata")?;
        let _guard = lock_named(&self.locks_dir, "notes", &self.lock_backoff)?;
        if let Some(expected) = expected_hash {
            let found = self
                .store
                .read_metadata(reference)?
                .map(|current| content_hash(&current))
                .unwrap_or_else(|| "none".to_string());
            if found != expected {
                warn!(reference, expected, found = %found, "metadata changed since read");
                return Err(WeaveError::Conflict {
                    reference: reference.to_string(),
                    expected: expected.to_string(),
                    found,
                }
                .into());
            }
        }
        self.store.write_metadata(reference, &raw)?;
        debug!(reference, status = %record.status, "metadata written");
        Ok(content_hash(&raw))
    }

    /// Read-modify-write under the notes lock. A missing or unreadable
    /// record starts from `seed`.
    pub fn update(
        &self,
        reference: &str,
        seed: impl FnOnce() -> MetadataRecord,
        apply: impl FnOnce(&mut MetadataRecord),
    ) -> Result<MetadataRecord> {
        from_canonical_name(reference)?;
        let _guard = lock_named(&self.locks_dir, "notes", &self.lock_backoff)?;
        let mut record = match self.store.read_metadata(reference)? {
            Some(raw) => match MetadataRecord::from_json(&raw) {
                Ok(record) => record,
                Err(err) => {
                    warn!(reference, err = %err, "unreadable metadata replaced");
                    seed()
                }
            },
            None => seed(),
        };
        apply(&mut record);
        let raw = record.to_json().context("serialize metadata")?;
        self.store.write_metadata(reference, &raw)?;
        Ok(record)
    }

    /// Publish the notes ref, retrying transient failures.
    pub fn push(&self, remote: &str) -> Result<()> {
        self.sync_backoff
            .run(
                |attempt| {
                    debug!(remote, attempt, "pushing metadata");
                    self.store.push_metadata(remote)
                },
                |_| true,
            )
            .with_context(|| format!("push metadata to {remote}"))?;
        info!(remote, "metadata pushed");
        Ok(())
    }

    /// Pull the notes ref, retrying transient failures.
    pub fn fetch(&self, remote: &str) -> Result<()> {
        self.sync_backoff
            .run(
                |attempt| {
                    debug!(remote, attempt, "fetching metadata");
                    self.store.fetch_metadata(remote)
                },
                |_| true,
            )
            .with_context(|| format!("fetch metadata from {remote}"))?;
        info!(remote, "metadata fetched");
        Ok(())
    }
}
