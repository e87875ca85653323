use std::cmp::Ordering;
use std::sync::Arc;

use snap::raw::max_compress_len;

use crate::cache::ShardedLRUCache;
use crate::error::Error;
use crate::iterator::{ConcatenateIterator, DerivedIterFactory, Iter};
use crate::opt::{CompressionType, Options, ReadOptions};
use crate::sstable::block::{Block, BlockBuilder, BlockIterator};
use crate::sstable::filter_block::{FilterBlockBuilder, FilterBlockReader};
use crate::sstable::format::{read_block, BlockHandle, Footer, K_BLOCK_TRAILER_SIZE, K_ENCODED_LENGTH};
use crate::storage::File;
use crate::util::coding::{put_fixed_32, put_fixed_64};
use crate::util::comparator::{BytewiseComparator, Comparator};
use crate::util::crc32::{extend, hash, mask};
use crate::IResult;

pub mod block;
pub mod filter_block;
pub mod format;

/// An sstable is a sorted, immutable map from keys to values stored as a
/// sequence of blocks:
///
/// ```text
///     +--------------+-----+--------------+--------------+-----------------+-------------+--------+
///     | data block 1 | ... | data block n | filter block | metaindex block | index block | footer |
///     +--------------+-----+--------------+--------------+-----------------+-------------+--------+
/// ```
///
/// Every stored block is followed by a 5-byte trailer holding the
/// compression type and a masked crc32c of the payload plus the type byte. The footer
/// is fixed-size: two zero-padded block handles (meta-index and index)
/// plus the table magic, 48 bytes in all.
///
/// The index block holds one entry per data block whose key is a short
/// separator >= every key in that block and < every key in the next, and
/// whose value is the data block's encoded handle. The meta-index block
/// maps `"filter.<policy name>"` to the filter block's handle. All fixed
/// width integers are little-endian.
pub struct TableBuilder<F: File, C: Comparator> {
    c: C,
    options: Options,
    // Underlying sstable file.
    file: F,
    // Current file offset, which is also the size of the file so far.
    offset: u64,
    data_block: BlockBuilder<C>,
    index_block: BlockBuilder<C>,
    // The last key added, used for index separators and ordering checks.
    last_key: Vec<u8>,
    // The number of key/value pairs in the file.
    num_entries: usize,
    closed: bool,
    errored: bool,
    filter_block: Option<FilterBlockBuilder>,
    // Iff true, an index entry for the block just flushed is still owed.
    //
    // We do not emit the index entry for a block until we have seen the
    // first key of the next data block. This allows us to use shorter
    // keys in the index block.
    pending_index_entry: bool,
    pending_handle: BlockHandle,
}

/// The index block stores every key uncompressed so any entry can be
/// decoded without walking its neighbors.
fn index_block_options(options: &Options) -> Options {
    let mut index_options = options.clone();
    index_options.block_restart_interval = 1;
    index_options
}

impl<F: File, C: Comparator> TableBuilder<F, C> {
    pub fn new(file: F, c: C, options: Options) -> Self {
        let filter_block = options.filter_policy.clone().map(|policy| {
            let mut fb = FilterBlockBuilder::new(policy);
            fb.start_block(0);
            fb
        });

        Self {
            c: c.clone(),
            data_block: BlockBuilder::new(&options, c.clone()),
            index_block: BlockBuilder::new(&index_block_options(&options), c),
            options,
            file,
            offset: 0,
            last_key: vec![],
            num_entries: 0,
            closed: false,
            errored: false,
            filter_block,
            pending_index_entry: false,
            pending_handle: BlockHandle::new(0, 0),
        }
    }

    /// Replaces the building options. The comparator cannot change (it is
    /// part of the builder's type), and the block size is frozen once the
    /// first entry has been added: a mid-file change would produce blocks
    /// the index no longer describes honestly.
    pub fn change_options(&mut self, options: Options) -> IResult<()> {
        if self.num_entries > 0 && options.block_size != self.options.block_size {
            return Err(Error::InvalidArgument(format!(
                "cannot change block size from {} to {} mid-build",
                self.options.block_size, options.block_size
            )));
        }
        if self.num_entries == 0 {
            self.data_block = BlockBuilder::new(&options, self.c.clone());
            self.index_block = BlockBuilder::new(&index_block_options(&options), self.c.clone());
        }
        self.options = options;
        Ok(())
    }

    /// Adds a key/value pair to the table being constructed. If the data
    /// block reaches `block_size` it is flushed; if a block was just
    /// flushed, the owed index entry is emitted first.
    ///
    /// # Panics
    ///
    /// * `key` is not greater than every previously added key.
    /// * The builder is closed.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> IResult<()> {
        self.assert_not_closed();
        if self.errored {
            return Err(Error::InvalidArgument(
                "table builder recorded a prior error".to_owned(),
            ));
        }
        if self.num_entries > 0 {
            assert_eq!(
                self.c.compare(key, self.last_key.as_slice()),
                Ordering::Greater,
                "[table builder] the new key must sort after the last key in the sstable"
            );
        }

        // Emit the index entry owed for the previous data block.
        self.maybe_append_index_block(Some(key));
        if let Some(fb) = self.filter_block.as_mut() {
            fb.add_key(key);
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Flushes any buffered key/value pairs into a finished data block.
    /// Most clients never need to call this directly; it exists so two
    /// adjacent entries can be forced into separate blocks.
    ///
    /// # Panics
    ///
    /// * The builder is closed.
    pub fn flush(&mut self) -> IResult<()> {
        self.assert_not_closed();
        if self.errored {
            return Err(Error::InvalidArgument(
                "table builder recorded a prior error".to_owned(),
            ));
        }
        if self.data_block.empty() {
            return Ok(());
        }
        assert!(
            !self.pending_index_entry,
            "[table builder] the previous data block's index entry must be emitted before flushing the next"
        );
        let result = (|| {
            let data_block = self.data_block.finish();
            let (compressed, compression) = compress_block(data_block, self.options.compression)?;
            write_raw_block(
                &mut self.file,
                &compressed,
                compression,
                &mut self.pending_handle,
                &mut self.offset,
            )?;
            self.data_block.reset();
            self.pending_index_entry = true;
            self.file.flush()?;
            if let Some(fb) = self.filter_block.as_mut() {
                fb.start_block(self.offset);
            }
            Ok(())
        })();
        if result.is_err() {
            self.errored = true;
        }
        result
    }

    /// Finishes building the table: flushes the last data block, then
    /// writes the filter block, the meta-index block, the data-index
    /// block and the footer. If `sync` is true the file is synced and
    /// closed.
    ///
    /// # Panics
    ///
    /// * The builder is closed.
    pub fn finish(&mut self, sync: bool) -> IResult<()> {
        self.flush()?;
        self.assert_not_closed();
        self.closed = true;

        // Write the filter block, always uncompressed.
        let mut filter_block_handle = BlockHandle::new(0, 0);
        let mut has_filter_block = false;
        if let Some(fb) = self.filter_block.as_mut() {
            let data = fb.finish();
            write_raw_block(
                &mut self.file,
                data,
                CompressionType::KNoCompression,
                &mut filter_block_handle,
                &mut self.offset,
            )?;
            has_filter_block = true;
        }

        // Write the metaindex block.
        let mut meta_block_handle = BlockHandle::new(0, 0);
        let mut meta_block_builder =
            BlockBuilder::new(&self.options, BytewiseComparator::default());
        if has_filter_block {
            if let Some(fp) = &self.options.filter_policy {
                let filter_key = "filter.".to_owned() + fp.name();
                meta_block_builder.add(filter_key.as_bytes(), &filter_block_handle.encoded());
            }
        }
        let meta_block = meta_block_builder.finish();
        let (compressed, compression) = compress_block(meta_block, self.options.compression)?;
        write_raw_block(
            &mut self.file,
            &compressed,
            compression,
            &mut meta_block_handle,
            &mut self.offset,
        )?;

        // Write the index block, emitting the final owed index entry with
        // a short successor of the last key.
        self.maybe_append_index_block(None);
        let index_block = self.index_block.finish();
        let mut index_block_handle = BlockHandle::new(0, 0);
        let (compressed, compression) = compress_block(index_block, self.options.compression)?;
        write_raw_block(
            &mut self.file,
            &compressed,
            compression,
            &mut index_block_handle,
            &mut self.offset,
        )?;
        self.index_block.reset();

        // Write the footer.
        let footer = Footer::new(meta_block_handle, index_block_handle).encode();
        self.file.write(&footer)?;
        self.offset += footer.len() as u64;
        if sync {
            self.file.sync()?;
            self.file.close()?;
        }
        Ok(())
    }

    /// Marks this builder as closed without finishing the table; the
    /// partially written file should be deleted by the caller.
    #[inline]
    pub fn close(&mut self) {
        self.assert_not_closed();
        self.closed = true;
        let _ = self.file.close();
    }

    /// Returns the number of key/value pairs added so far.
    #[inline]
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// Returns the size of the file generated so far. After a successful
    /// `finish` call, returns the size of the final generated file.
    #[inline]
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    #[inline]
    fn assert_not_closed(&self) {
        assert!(
            !self.closed,
            "[table builder] attempt to use a closed TableBuilder"
        );
    }

    /// Appends the owed index entry for the last flushed data block, if
    /// any. With the next key in hand a short separator keeps index keys
    /// small; at the end of the table a short successor is used instead.
    fn maybe_append_index_block(&mut self, next_key: Option<&[u8]>) -> bool {
        if self.pending_index_entry {
            assert!(
                self.data_block.empty(),
                "[table builder] the data block must be flushed before its index entry is emitted"
            );
            let separator = match next_key {
                Some(key) => self.c.find_shortest_separator(&self.last_key, key),
                None => self.c.find_short_successor(&self.last_key),
            };
            let mut handle_encoding = vec![];
            self.pending_handle.encode_to(&mut handle_encoding);
            self.index_block.add(&separator, &handle_encoding);
            self.pending_index_entry = false;
            return true;
        }
        false
    }
}

/// Compresses the given raw block with the configured algorithm. Snappy
/// output is kept only when it saves at least 12.5% of the payload;
/// otherwise the block is stored raw.
fn compress_block(raw_block: &[u8], compression: CompressionType) -> IResult<(Vec<u8>, CompressionType)> {
    match compression {
        CompressionType::KSnappyCompression => {
            let mut enc = snap::raw::Encoder::new();
            let mut buffer = vec![0; max_compress_len(raw_block.len())];
            let compressed_len = enc.compress(raw_block, buffer.as_mut_slice())?;
            if compressed_len < raw_block.len() - raw_block.len() / 8 {
                buffer.truncate(compressed_len);
                Ok((buffer, CompressionType::KSnappyCompression))
            } else {
                Ok((raw_block.to_vec(), CompressionType::KNoCompression))
            }
        }
        CompressionType::KNoCompression | CompressionType::Unknown => {
            Ok((raw_block.to_vec(), CompressionType::KNoCompression))
        }
    }
}

/// Writes `data` followed by its compression-type/crc trailer, recording
/// the block's position into `handle` and advancing `offset`.
fn write_raw_block<F: File>(
    file: &mut F,
    data: &[u8],
    compression: CompressionType,
    handle: &mut BlockHandle,
    offset: &mut u64,
) -> IResult<()> {
    file.write(data)?;
    // The handle records the payload extent only, not the trailer.
    handle.set_offset(*offset);
    handle.set_size(data.len() as u64);

    let mut trailer = vec![compression as u8];
    let crc = mask(extend(hash(data), &[compression as u8]));
    put_fixed_32(&mut trailer, crc);
    assert_eq!(trailer.len(), K_BLOCK_TRAILER_SIZE);
    file.write(&trailer)?;
    *offset += (data.len() + K_BLOCK_TRAILER_SIZE) as u64;
    Ok(())
}

/// A `Table` is an immutable, persistent sorted map from keys to values.
/// A `Table` may be safely accessed from multiple threads without
/// external synchronization.
pub struct Table<F: File> {
    file: F,
    file_number: u64,
    filter_reader: Option<FilterBlockReader>,
    meta_block_handle: Option<BlockHandle>,
    index_block: Block,
    block_cache: Option<Arc<ShardedLRUCache<Arc<Block>>>>,
}

impl<F: File> Table<F> {
    /// Opens the table stored in bytes `[0..file_len)` of `file` and reads
    /// the metadata needed to retrieve data from it. Failure to load the
    /// filter block is not fatal; the table simply reads without it.
    pub fn open(file: F, file_number: u64, file_len: u64, options: &Options) -> IResult<Self> {
        if file_len < K_ENCODED_LENGTH as u64 {
            return Err(Error::Corruption("file is too short to be an sstable"));
        }
        // Read the footer.
        let mut footer_space = vec![0; K_ENCODED_LENGTH];
        file.read_exact_at(footer_space.as_mut_slice(), file_len - K_ENCODED_LENGTH as u64)?;
        let footer = Footer::decode_from(&footer_space)?;

        // Read the index block.
        let index_block_contents = read_block(&file, options.paranoid_checks, &footer.index_handle)?;
        let index_block = Block::new(index_block_contents)?;
        let mut t = Self {
            file,
            file_number,
            filter_reader: None,
            meta_block_handle: None,
            index_block,
            block_cache: options.block_cache.clone(),
        };

        // Read the metaindex block and, through it, the filter block.
        // Reading errors here are ignored since the filter is advisory.
        if footer.metaindex_handle.size > 0 && options.filter_policy.is_some() {
            if let Ok(meta_block_contents) =
                read_block(&t.file, options.paranoid_checks, &footer.metaindex_handle)
            {
                if let Ok(meta_block) = Block::new(meta_block_contents) {
                    t.meta_block_handle = Some(footer.metaindex_handle);
                    let policy = options.filter_policy.clone().unwrap();
                    let filter_key = "filter.".to_owned() + policy.name();
                    let mut iter = meta_block.iter(BytewiseComparator::default());
                    iter.seek(filter_key.as_bytes());
                    if iter.valid() && iter.key() == filter_key.as_bytes() {
                        if let Ok((filter_handle, _)) = BlockHandle::decode_from(iter.value()) {
                            if let Ok(filter_block) =
                                read_block(&t.file, options.paranoid_checks, &filter_handle)
                            {
                                t.filter_reader =
                                    Some(FilterBlockReader::new(policy, filter_block));
                            }
                        }
                    }
                }
            }
        }
        Ok(t)
    }

    /// Converts a `BlockHandle` into an iterator over the contents of the
    /// corresponding block, consulting the block cache when one is
    /// configured.
    fn block_reader<C: Comparator>(
        &self,
        c: C,
        data_block_handle: BlockHandle,
        options: ReadOptions,
    ) -> IResult<BlockIterator<C>> {
        let iter = if let Some(cache) = &self.block_cache {
            let mut cache_key = Vec::with_capacity(16);
            put_fixed_64(&mut cache_key, self.file_number);
            put_fixed_64(&mut cache_key, data_block_handle.offset);
            if let Some(handle) = cache.lookup(&cache_key) {
                handle.value().iter(c)
            } else {
                let data = read_block(&self.file, options.verify_checksums, &data_block_handle)?;
                let block = Arc::new(Block::new(data)?);
                let iter = block.iter(c);
                if options.fill_cache {
                    let charge = block.size();
                    cache.insert(&cache_key, block, charge);
                }
                iter
            }
        } else {
            let data = read_block(&self.file, options.verify_checksums, &data_block_handle)?;
            Block::new(data)?.iter(c)
        };
        Ok(iter)
    }

    /// Finds the first entry with a key >= `key` and returns a positioned
    /// block iterator, or `None` when the table cannot contain the key.
    /// The comparator must order the keys the table was built with.
    pub fn internal_get<C: Comparator>(
        &self,
        options: ReadOptions,
        c: C,
        key: &[u8],
    ) -> IResult<Option<BlockIterator<C>>> {
        let mut index_iter = self.index_block.iter(c.clone());
        // The index entry's key is >= every key in its data block.
        index_iter.seek(key);
        if index_iter.valid() {
            let handle_val = index_iter.value();
            // Consult the filter before touching the data block.
            let mut maybe_contained = true;
            if let Some(filter) = &self.filter_reader {
                if let Ok((handle, _)) = BlockHandle::decode_from(handle_val) {
                    if !filter.key_may_match(handle.offset, key) {
                        maybe_contained = false;
                    }
                }
            }
            if maybe_contained {
                let (data_block_handle, _) = BlockHandle::decode_from(handle_val)?;
                let mut block_iter = self.block_reader(c, data_block_handle, options)?;
                block_iter.seek(key);
                if block_iter.valid() {
                    return Ok(Some(block_iter));
                }
                block_iter.status()?;
            }
        }
        index_iter.status()?;
        Ok(None)
    }

    /// Given a key, returns an approximate byte offset in the file where
    /// data for that key begins (or would begin if the key were present).
    /// The result accounts for on-disk effects such as compression.
    pub fn approximate_offset_of<C: Comparator>(&self, c: C, key: &[u8]) -> u64 {
        let mut index_iter = self.index_block.iter(c);
        index_iter.seek(key);
        if index_iter.valid() {
            if let Ok((handle, _)) = BlockHandle::decode_from(index_iter.value()) {
                return handle.offset;
            }
        }
        // The key is past the last data block; approximate with the start
        // of the metadata section.
        if let Some(meta) = &self.meta_block_handle {
            return meta.offset;
        }
        0
    }
}

pub struct TableIterFactory<C: Comparator, F: File> {
    options: ReadOptions,
    table: Arc<Table<F>>,
    cmp: C,
}

impl<C: Comparator, F: File> DerivedIterFactory for TableIterFactory<C, F> {
    type Iter = BlockIterator<C>;

    fn derive(&self, value: &[u8]) -> IResult<Self::Iter> {
        BlockHandle::decode_from(value)
            .and_then(|(handle, _)| self.table.block_reader(self.cmp.clone(), handle, self.options))
    }
}

pub type TableIterator<C, F> = ConcatenateIterator<BlockIterator<C>, TableIterFactory<C, F>>;

/// Returns an iterator over all the key/value pairs in `table`, in the
/// order the comparator assigns.
///
/// Entry format:
///   key: the key as written by the builder
///   value: the stored value
pub fn new_table_iterator<C: Comparator, F: File>(
    cmp: C,
    table: Arc<Table<F>>,
    options: ReadOptions,
) -> TableIterator<C, F> {
    let index_iter = table.index_block.iter(cmp.clone());
    let factory = TableIterFactory {
        options,
        table,
        cmp,
    };
    ConcatenateIterator::new(index_iter, factory)
}
