use std::sync::Arc;

use tracing::debug;

use crate::cache::{CacheHandle, ShardedLRUCache};
use crate::db::filename::{generate_filename, FileType};
use crate::opt::{Options, ReadOptions};
use crate::sstable::block::BlockIterator;
use crate::sstable::{new_table_iterator, Table, TableIterator};
use crate::storage::{File, Storage};
use crate::util::coding::put_fixed_64;
use crate::util::comparator::Comparator;
use crate::IResult;

/// A bounded cache of open sstables, keyed by file number. Each resident
/// entry keeps the table's file handle and its parsed index (and filter)
/// blocks alive; the cache charge is one per table so capacity bounds the
/// number of open files.
pub struct TableCache<S: Storage + Clone> {
    storage: S,
    db_name: String,
    options: Options,
    cache: Arc<ShardedLRUCache<Arc<Table<S::F>>>>,
}

fn cache_key(file_number: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(8);
    put_fixed_64(&mut key, file_number);
    key
}

impl<S: Storage + Clone> TableCache<S> {
    pub fn new(db_name: String, options: Options, size: usize, storage: S) -> Self {
        Self {
            storage,
            db_name,
            options,
            cache: Arc::new(ShardedLRUCache::new(size)),
        }
    }

    /// Returns a pinned handle to the open table for `file_number`,
    /// opening and caching it on a miss. Open errors are returned and
    /// never cached, so a transiently unreadable file can be retried.
    pub fn find_table(
        &self,
        file_number: u64,
        file_size: u64,
    ) -> IResult<CacheHandle<Arc<Table<S::F>>>> {
        let key = cache_key(file_number);
        if let Some(handle) = self.cache.lookup(&key) {
            return Ok(handle);
        }
        let filename = generate_filename(&self.db_name, FileType::Table, file_number);
        let file = match self.storage.open(&filename) {
            Ok(f) => f,
            Err(e) => {
                // Prior releases wrote tables with an .sst suffix; fall
                // back before giving up.
                let old = generate_filename(&self.db_name, FileType::OldTable, file_number);
                match self.storage.open(&old) {
                    Ok(f) => {
                        debug!(file_number, "opened sstable via legacy .sst name");
                        f
                    }
                    Err(_) => return Err(e),
                }
            }
        };
        let table = Arc::new(Table::open(file, file_number, file_size, &self.options)?);
        Ok(self.cache.insert(&key, table, 1))
    }

    /// Seeks to `key` in the given file. Returns a positioned block
    /// iterator, or `None` when the file cannot contain the key. The
    /// table is pinned only for the duration of the call; the returned
    /// iterator owns its block data.
    pub fn get<C: Comparator>(
        &self,
        cmp: C,
        options: ReadOptions,
        key: &[u8],
        file_number: u64,
        file_size: u64,
    ) -> IResult<Option<BlockIterator<C>>> {
        let handle = self.find_table(file_number, file_size)?;
        handle.value().internal_get(options, cmp, key)
    }

    /// Returns an iterator over the table identified by `file_number`
    /// (whose length must be exactly `file_size` bytes). The table stays
    /// pinned in the cache until the iterator is dropped.
    ///
    /// Entry format:
    ///     key: the key as written by the table builder
    ///     value: the stored value
    pub fn new_iter<C: Comparator>(
        &self,
        cmp: C,
        options: ReadOptions,
        file_number: u64,
        file_size: u64,
    ) -> IResult<PinnedTableIterator<C, S::F>> {
        let handle = self.find_table(file_number, file_size)?;
        let iter = new_table_iterator(cmp, handle.value().clone(), options);
        Ok(PinnedTableIterator::new(handle, iter))
    }

    /// Evicts any entry for the specified file number, e.g. after the
    /// file is deleted by a compaction.
    pub fn evict(&self, file_number: u64) {
        self.cache.erase(&cache_key(file_number));
    }
}

impl<S: Storage + Clone> Clone for TableCache<S> {
    fn clone(&self) -> Self {
        TableCache {
            storage: self.storage.clone(),
            db_name: self.db_name.clone(),
            options: self.options.clone(),
            cache: self.cache.clone(),
        }
    }
}

/// A table iterator bundled with the cache handle that pins its table.
/// Releasing happens on drop, so the open file cannot be evicted out
/// from under a live iterator.
pub struct PinnedTableIterator<C: Comparator, F: File> {
    _handle: CacheHandle<Arc<Table<F>>>,
    iter: TableIterator<C, F>,
}

impl<C: Comparator, F: File> PinnedTableIterator<C, F> {
    fn new(handle: CacheHandle<Arc<Table<F>>>, iter: TableIterator<C, F>) -> Self {
        PinnedTableIterator {
            _handle: handle,
            iter,
        }
    }
}

impl<C: Comparator, F: File> crate::iterator::Iter for PinnedTableIterator<C, F> {
    fn valid(&self) -> bool {
        self.iter.valid()
    }

    fn seek_to_first(&mut self) {
        self.iter.seek_to_first()
    }

    fn seek_to_last(&mut self) {
        self.iter.seek_to_last()
    }

    fn seek(&mut self, target: &[u8]) {
        self.iter.seek(target)
    }

    fn next(&mut self) {
        self.iter.next()
    }

    fn prev(&mut self) {
        self.iter.prev()
    }

    fn key(&self) -> &[u8] {
        self.iter.key()
    }

    fn value(&self) -> &[u8] {
        self.iter.value()
    }

    fn status(&mut self) -> IResult<()> {
        self.iter.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::Iter;
    use crate::sstable::TableBuilder;
    use crate::storage::mem::MemStorage;
    use crate::util::comparator::BytewiseComparator;

    fn build_table_file(
        storage: &MemStorage,
        db_name: &str,
        file_number: u64,
        entries: &[(&str, &str)],
        legacy: bool,
    ) -> u64 {
        let file_type = if legacy {
            FileType::OldTable
        } else {
            FileType::Table
        };
        let name = generate_filename(db_name, file_type, file_number);
        let file = storage.create(&name).unwrap();
        let mut builder = TableBuilder::new(file, BytewiseComparator::default(), Options::default());
        for (k, v) in entries {
            builder.add(k.as_bytes(), v.as_bytes()).unwrap();
        }
        builder.finish(false).unwrap();
        builder.file_size()
    }

    fn new_cache(storage: &MemStorage) -> TableCache<MemStorage> {
        TableCache::new("db".to_owned(), Options::default(), 100, storage.clone())
    }

    #[test]
    fn test_get_from_cached_table() {
        let storage = MemStorage::default();
        let size = build_table_file(&storage, "db", 1, &[("a", "va"), ("b", "vb")], false);
        let cache = new_cache(&storage);
        let cmp = BytewiseComparator::default();

        let found = cache
            .get(cmp, ReadOptions::default(), b"a", 1, size)
            .unwrap()
            .unwrap();
        assert_eq!(found.key(), b"a");
        assert_eq!(found.value(), b"va");

        // A missing key seeks past the end.
        assert!(cache
            .get(cmp, ReadOptions::default(), b"zz", 1, size)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_open_falls_back_to_legacy_suffix() {
        let storage = MemStorage::default();
        let size = build_table_file(&storage, "db", 3, &[("k", "v")], true);
        let cache = new_cache(&storage);
        let cmp = BytewiseComparator::default();
        let found = cache
            .get(cmp, ReadOptions::default(), b"k", 3, size)
            .unwrap()
            .unwrap();
        assert_eq!(found.value(), b"v");
    }

    #[test]
    fn test_missing_file_error_is_not_cached() {
        let storage = MemStorage::default();
        let cache = new_cache(&storage);
        assert!(cache.find_table(9, 100).is_err());
        // Create the file afterwards: the earlier failure must not stick.
        let size = build_table_file(&storage, "db", 9, &[("x", "y")], false);
        assert!(cache.find_table(9, size).is_ok());
    }

    #[test]
    fn test_iterator_pins_table_across_evict() {
        let storage = MemStorage::default();
        let entries = [("a", "1"), ("b", "2"), ("c", "3")];
        let size = build_table_file(&storage, "db", 5, &entries, false);
        let cache = new_cache(&storage);
        let cmp = BytewiseComparator::default();

        let mut iter = cache
            .new_iter(cmp, ReadOptions::default(), 5, size)
            .unwrap();
        iter.seek_to_first();
        // Evicting while the iterator lives must not tear the table down.
        cache.evict(5);
        let mut scanned = vec![];
        while iter.valid() {
            scanned.push((
                String::from_utf8(iter.key().to_vec()).unwrap(),
                String::from_utf8(iter.value().to_vec()).unwrap(),
            ));
            iter.next();
        }
        iter.status().unwrap();
        assert_eq!(
            scanned,
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_evict_forces_reopen() {
        let storage = MemStorage::default();
        let size = build_table_file(&storage, "db", 2, &[("a", "va")], false);
        let cache = new_cache(&storage);
        let cmp = BytewiseComparator::default();
        assert!(cache.find_table(2, size).is_ok());
        cache.evict(2);
        // Remove the backing file: a cached entry would still serve reads,
        // but after evict the open must fail.
        storage
            .remove(&generate_filename("db", FileType::Table, 2))
            .unwrap();
        assert!(cache
            .get(cmp, ReadOptions::default(), b"a", 2, size)
            .is_err());
    }
}
