//! Page iterator over global transactions, newest first.

use dtx_kernel::{GlobalTransaction, ScanCursor, StoreResult, TransStore};

/// Drives [TransStore::scan_globals] until the cursor is exhausted.
///
/// Yields non-empty pages; a trailing empty page (when the row count is a
/// multiple of `page_size`) is swallowed. The first error ends iteration.
pub struct GlobalScanner<'a, S: TransStore + ?Sized> {
    store: &'a S,
    cursor: ScanCursor,
    page_size: usize,
    done: bool,
}

impl<'a, S: TransStore + ?Sized> GlobalScanner<'a, S> {
    pub fn new(store: &'a S, page_size: usize) -> Self {
        Self::resume(store, ScanCursor::start(), page_size)
    }

    /// Continues from a cursor handed out by an earlier listing.
    pub fn resume(store: &'a S, cursor: ScanCursor, page_size: usize) -> Self {
        Self {
            store,
            cursor,
            page_size,
            done: page_size == 0,
        }
    }

    pub fn cursor(&self) -> ScanCursor {
        self.cursor
    }
}

impl<S: TransStore + ?Sized> Iterator for GlobalScanner<'_, S> {
    type Item = StoreResult<Vec<GlobalTransaction>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.store.scan_globals(&mut self.cursor, self.page_size) {
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
            Ok(page) => {
                if self.cursor.is_exhausted() {
                    self.done = true;
                    if page.is_empty() {
                        return None;
                    }
                }
                Some(Ok(page))
            }
        }
    }
}
