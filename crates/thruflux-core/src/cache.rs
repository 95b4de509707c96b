//! Pinned-LRU cache of open file handles.
//!
//! Caps simultaneous OS descriptors while amortizing `open()` across many
//! chunk operations. Entries carry a pin count: a pinned handle is in active
//! use by a stream and must never be closed behind its back. Eviction takes
//! the least-recently-used entry whose pin count is zero.
//!
//! Recency is tracked with an index-linked list over the entry vector, so
//! touch/evict are O(1) and ids map straight to slots.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::trace;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Entry {
    file: Option<Arc<File>>,
    writable: bool,
    pin_count: u32,
    prev: Option<u32>,
    next: Option<u32>,
}

/// LRU file-handle cache with pin counts.
#[derive(Debug)]
pub struct FileHandleCache {
    capacity: usize,
    paths: Vec<Option<PathBuf>>,
    entries: Vec<Entry>,
    head: Option<u32>,
    tail: Option<u32>,
    open_count: usize,
}

impl FileHandleCache {
    /// Create a cache that will keep at most `capacity` handles open.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            paths: Vec::new(),
            entries: Vec::new(),
            head: None,
            tail: None,
            open_count: 0,
        }
    }

    /// Record the path for `id`. Must precede any `acquire(id, ..)`.
    pub fn register(&mut self, id: u32, path: PathBuf) {
        let idx = id as usize;
        if idx >= self.paths.len() {
            self.paths.resize_with(idx + 1, || None);
            self.entries.resize_with(idx + 1, Entry::default);
        }
        self.paths[idx] = Some(path);
    }

    /// Number of currently open handles.
    pub fn open_count(&self) -> usize {
        self.open_count
    }

    /// Acquire a pinned handle for `id`, opening the file if necessary.
    ///
    /// Increments the entry's pin count; callers pair every acquire with a
    /// `release`. Fails with `CacheExhausted` when the cache is full of
    /// pinned entries.
    pub fn acquire(&mut self, id: u32, writable: bool) -> Result<Arc<File>> {
        let idx = id as usize;
        let path = self
            .paths
            .get(idx)
            .and_then(|p| p.clone())
            .ok_or_else(|| Error::Protocol {
                message: format!("file id {id} not registered with handle cache"),
            })?;

        // Reopen if cached with the wrong mode; only possible while unpinned.
        if self.entries[idx].file.is_some()
            && self.entries[idx].writable != writable
            && self.entries[idx].pin_count == 0
        {
            self.close_entry(id);
        }

        if self.entries[idx].file.is_none() {
            while self.open_count >= self.capacity {
                if !self.evict_one() {
                    return Err(Error::CacheExhausted {
                        capacity: self.capacity,
                    });
                }
            }

            let file = if writable {
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .open(&path)?
            } else {
                OpenOptions::new().read(true).open(&path)?
            };
            trace!(id, path = %path.display(), writable, "opened file handle");

            let entry = &mut self.entries[idx];
            entry.file = Some(Arc::new(file));
            entry.writable = writable;
            self.open_count += 1;
            self.push_front(id);
        } else {
            self.touch(id);
        }

        let entry = &mut self.entries[idx];
        entry.pin_count += 1;
        Ok(Arc::clone(entry.file.as_ref().expect("entry just opened")))
    }

    /// Drop one pin on `id`. Does not close the handle.
    pub fn release(&mut self, id: u32) {
        if let Some(entry) = self.entries.get_mut(id as usize) {
            entry.pin_count = entry.pin_count.saturating_sub(1);
        }
    }

    /// Close every handle regardless of pin counts. Shutdown only.
    pub fn close_all(&mut self) {
        for entry in &mut self.entries {
            entry.file = None;
            entry.pin_count = 0;
            entry.prev = None;
            entry.next = None;
        }
        self.head = None;
        self.tail = None;
        self.open_count = 0;
    }

    fn close_entry(&mut self, id: u32) {
        let idx = id as usize;
        if self.entries[idx].file.take().is_some() {
            self.unlink(id);
            self.open_count -= 1;
        }
    }

    /// Evict the least-recently-used unpinned entry. Returns false if every
    /// open entry is pinned.
    fn evict_one(&mut self) -> bool {
        let mut cursor = self.tail;
        while let Some(id) = cursor {
            let entry = &self.entries[id as usize];
            if entry.pin_count == 0 {
                trace!(id, "evicting file handle");
                self.close_entry(id);
                return true;
            }
            cursor = entry.prev;
        }
        false
    }

    fn unlink(&mut self, id: u32) {
        let idx = id as usize;
        let (prev, next) = (self.entries[idx].prev, self.entries[idx].next);

        match prev {
            Some(p) => self.entries[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entries[n as usize].prev = prev,
            None => self.tail = prev,
        }
        self.entries[idx].prev = None;
        self.entries[idx].next = None;
    }

    fn push_front(&mut self, id: u32) {
        let idx = id as usize;
        self.entries[idx].prev = None;
        self.entries[idx].next = self.head;
        if let Some(old) = self.head {
            self.entries[old as usize].prev = Some(id);
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }

    fn touch(&mut self, id: u32) {
        if self.head == Some(id) {
            return;
        }
        self.unlink(id);
        self.push_front(id);
    }
}

impl Drop for FileHandleCache {
    fn drop(&mut self) {
        self.close_all();
    }
}
