use serde::{Deserialize, Serialize};

/// An opaque continuation token returned by a paged scan. Backends are free
/// to encode whatever they need into it; callers only ever round-trip it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken(pub String);

/// One page of a secondary-index scan (spec.md §4.2: "scans are paged; a
/// page carries an opaque continuation token when more rows remain").
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageToken>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next: Option<PageToken>) -> Self {
        Page { items, next }
    }

    pub fn empty() -> Self {
        Page { items: Vec::new(), next: None }
    }

    pub fn has_more(&self) -> bool {
        self.next.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// A scan request: which index, which hash key, an optional range-key
/// prefix filter, and pagination controls.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub index: &'static str,
    pub hash_value: String,
    pub range_prefix: Option<String>,
    pub limit: usize,
    pub start_after: Option<PageToken>,
}

impl ScanRequest {
    pub fn new(index: &'static str, hash_value: impl Into<String>) -> Self {
        ScanRequest {
            index,
            hash_value: hash_value.into(),
            range_prefix: None,
            limit: 100,
            start_after: None,
        }
    }

    pub fn with_range_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.range_prefix = Some(prefix.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_start_after(mut self, token: Option<PageToken>) -> Self {
        self.start_after = token;
        self
    }
}

/// A full-table scan request: every row in `index`'s table, regardless of
/// hash key (spec.md §4.2's `scanByIndex`, distinct from the hash-scoped
/// `queryByIndex`/[`ScanRequest`]). The deep-cleanup sweep (component C7)
/// is the one caller that genuinely needs "every held lock" rather than
/// "every lock held by monitor X".
#[derive(Debug, Clone)]
pub struct FullScanRequest {
    pub index: &'static str,
    pub limit: usize,
    pub start_after: Option<PageToken>,
}

impl FullScanRequest {
    pub fn new(index: &'static str) -> Self {
        FullScanRequest { index, limit: 100, start_after: None }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_start_after(mut self, token: Option<PageToken>) -> Self {
        self.start_after = token;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_reports_continuation() {
        let page = Page::new(vec![1, 2, 3], Some(PageToken("3".into())));
        assert!(page.has_more());
        assert_eq!(page.len(), 3);

        let last = Page::new(vec![4], None);
        assert!(!last.has_more());
    }
}
