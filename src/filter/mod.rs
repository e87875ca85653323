pub mod bloom;

/// A `FilterPolicy` builds compact summaries of key sets so negative
/// lookups can skip a disk read.
pub trait FilterPolicy: Sync + Send {
    /// Returns the name of this policy. Note that if the filter encoding
    /// changes in an incompatible way, the name returned by this method
    /// must be changed. Otherwise old, incompatible filters may be
    /// passed to methods of this type.
    fn name(&self) -> &str;

    /// Creates a filter summarizing `keys`.
    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8>;

    /// Returns true if `key` may be in the set `filter` was built from.
    /// False positives are allowed, false negatives are not.
    fn key_may_match(&self, filter: &[u8], key: &[u8]) -> bool;
}
