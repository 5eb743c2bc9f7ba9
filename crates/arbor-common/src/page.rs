//! Page identifiers and page-level constants.

use serde::{Deserialize, Serialize};

/// Page size in bytes (4 KB).
pub const PAGE_SIZE: usize = 4 * 1024;

/// Unique identifier for a page within the data file.
///
/// Pages are addressed by a flat `u32`; the byte offset of a page in the
/// data file is `page_id * PAGE_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub u32);

/// Sentinel page id meaning "no page".
pub const INVALID_PAGE_ID: PageId = PageId(u32::MAX);

/// Page 0 holds the index directory (name -> root page id records).
pub const HEADER_PAGE_ID: PageId = PageId(0);

impl PageId {
    /// Creates a new PageId.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns true if this is not the invalid sentinel.
    pub fn is_valid(&self) -> bool {
        *self != INVALID_PAGE_ID
    }

    /// Returns the raw page number.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "page:{}", self.0)
        } else {
            write!(f, "page:invalid")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_constant() {
        assert_eq!(PAGE_SIZE, 4096);
    }

    #[test]
    fn test_page_id_validity() {
        assert!(PageId::new(0).is_valid());
        assert!(PageId::new(12345).is_valid());
        assert!(!INVALID_PAGE_ID.is_valid());
    }

    #[test]
    fn test_page_id_display() {
        assert_eq!(PageId::new(7).to_string(), "page:7");
        assert_eq!(INVALID_PAGE_ID.to_string(), "page:invalid");
    }

    #[test]
    fn test_page_id_ordering() {
        assert!(PageId::new(1) < PageId::new(2));
        assert!(PageId::new(2) < INVALID_PAGE_ID);
    }

    #[test]
    fn test_page_id_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(PageId::new(1));
        set.insert(PageId::new(2));
        set.insert(PageId::new(1));

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_page_id_serde_roundtrip() {
        let original = PageId::new(500);
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: PageId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }
}
