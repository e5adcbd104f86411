//! Common types used across storage operations.

use bytes::Bytes;

/// Key-value pair returned from range queries.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use corpdir_storage::KeyValue;
///
/// let kv = KeyValue::new(Bytes::from("replay/crm-x/n1"), Bytes::from("{}"));
/// assert_eq!(kv.key, Bytes::from("replay/crm-x/n1"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The key identifying this entry.
    pub key: Bytes,

    /// The value stored at this key.
    pub value: Bytes,
}

impl KeyValue {
    /// Creates a new key-value pair.
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }
}

/// Returns the exclusive upper bound for a prefix scan.
///
/// The bound is the prefix with its last non-`0xFF` byte incremented and
/// everything after it dropped. Returns `None` when the prefix is empty or
/// consists only of `0xFF` bytes, meaning the scan is unbounded above.
///
/// ```
/// use corpdir_storage::types::prefix_end;
///
/// assert_eq!(prefix_end(b"replay/"), Some(b"replay0".to_vec()));
/// assert_eq!(prefix_end(&[0x01, 0xFF]), Some(vec![0x02]));
/// assert_eq!(prefix_end(&[0xFF]), None);
/// ```
#[must_use]
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}
