//! Paged, lazily-resolved result lists.
//!
//! A [`PagedList`] starts as a list of object identities and materializes
//! row snapshots one page at a time: accessing any element resolves its
//! whole page with a single multi-id fetch. The first page is resolved at
//! construction, so the common "show the first screen" case costs exactly
//! one round trip.

use parking_lot::Mutex;
use rowsync_core::error::IntegrityError;
use rowsync_core::{Error, ObjectId, Result, Snapshot, SnapshotFetcher};
use std::sync::Arc;
use tracing::trace;

/// Default rows per page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

enum Slot {
    Unresolved(ObjectId),
    Resolved(Snapshot),
}

/// A list of query results resolved page-by-page on demand.
///
/// Page faults are serialized through an internal mutex: concurrent readers
/// of an unresolved page trigger one fetch, not several.
pub struct PagedList {
    fetcher: Arc<dyn SnapshotFetcher>,
    page_size: usize,
    slots: Mutex<Vec<Slot>>,
}

impl PagedList {
    /// Build a list over the given identities, eagerly resolving page 0.
    pub fn new(
        ids: Vec<ObjectId>,
        page_size: usize,
        fetcher: Arc<dyn SnapshotFetcher>,
    ) -> Result<Self> {
        let list = Self {
            fetcher,
            page_size: page_size.max(1),
            slots: Mutex::new(ids.into_iter().map(Slot::Unresolved).collect()),
        };
        if !list.is_empty() {
            list.resolve_page(0)?;
        }
        Ok(list)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether the element at `index` is already materialized.
    pub fn is_resolved(&self, index: usize) -> bool {
        matches!(self.slots.lock().get(index), Some(Slot::Resolved(_)))
    }

    /// Number of materialized elements.
    pub fn resolved_count(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| matches!(s, Slot::Resolved(_)))
            .count()
    }

    /// Fetch the element at `index`, resolving its page if needed.
    pub fn get(&self, index: usize) -> Result<Snapshot> {
        if index >= self.len() {
            return Err(Error::Integrity(IntegrityError {
                message: format!(
                    "index {} out of bounds for list of {} elements",
                    index,
                    self.len()
                ),
            }));
        }
        if !self.is_resolved(index) {
            self.resolve_page(index / self.page_size)?;
        }
        match self.slots.lock().get(index) {
            Some(Slot::Resolved(snapshot)) => Ok(snapshot.clone()),
            _ => Err(Error::Integrity(IntegrityError {
                message: format!("element {} failed to resolve", index),
            })),
        }
    }

    /// Resolve every remaining page and return the full materialized list.
    pub fn to_vec(&self) -> Result<Vec<Snapshot>> {
        let pages = self.len().div_ceil(self.page_size);
        for page in 0..pages {
            self.resolve_page(page)?;
        }
        let slots = self.slots.lock();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots.iter() {
            match slot {
                Slot::Resolved(snapshot) => out.push(snapshot.clone()),
                Slot::Unresolved(id) => {
                    return Err(Error::Integrity(IntegrityError {
                        message: format!("element {} failed to resolve", id),
                    }));
                }
            }
        }
        Ok(out)
    }

    fn resolve_page(&self, page: usize) -> Result<()> {
        let mut slots = self.slots.lock();
        let start = page * self.page_size;
        let end = (start + self.page_size).min(slots.len());

        let missing: Vec<ObjectId> = slots[start..end]
            .iter()
            .filter_map(|s| match s {
                Slot::Unresolved(id) => Some(id.clone()),
                Slot::Resolved(_) => None,
            })
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        trace!(page, rows = missing.len(), "resolving list page");

        // One multi-id fetch per page; the mutex stays held so concurrent
        // readers of the same page wait instead of refetching.
        let fetched = self.fetcher.fetch_many(&missing)?;
        for slot in &mut slots[start..end] {
            if let Slot::Unresolved(id) = slot {
                match fetched.iter().find(|(fid, _)| fid == id) {
                    Some((_, snapshot)) => *slot = Slot::Resolved(snapshot.clone()),
                    None => {
                        return Err(Error::Integrity(IntegrityError {
                            message: format!("row for {} disappeared while paging", id),
                        }));
                    }
                }
            }
        }
        Ok(())
    }
}
