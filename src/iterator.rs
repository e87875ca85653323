//! Iteration interfaces shared by the memtable, blocks and tables.

use crate::error::Error;
use crate::IResult;

/// The engine's internal iterator shape. Position-based: after any seek
/// the iterator either points at an entry (`valid()`) or is exhausted.
/// Corruption encountered mid-iteration makes `valid()` false and is
/// surfaced through `status()`.
pub trait Iter {
    fn valid(&self) -> bool;

    /// Positions at the first entry, if any.
    fn seek_to_first(&mut self);

    /// Positions at the last entry, if any.
    fn seek_to_last(&mut self);

    /// Positions at the first entry with a key >= `target`.
    fn seek(&mut self, target: &[u8]);

    /// Moves to the next entry.
    ///
    /// # Panics
    ///
    /// The iterator must be valid.
    fn next(&mut self);

    /// Moves to the previous entry.
    ///
    /// # Panics
    ///
    /// The iterator must be valid.
    fn prev(&mut self);

    /// The key at the current entry. Only valid while `valid()`.
    fn key(&self) -> &[u8];

    /// The value at the current entry. Only valid while `valid()`.
    fn value(&self) -> &[u8];

    /// Takes the sticky error, if iteration hit one.
    fn status(&mut self) -> IResult<()>;
}

/// Builds the second-level iterator from a first-level entry's value,
/// e.g. a data-block iterator from an encoded block handle.
pub trait DerivedIterFactory {
    type Iter: Iter;

    fn derive(&self, value: &[u8]) -> IResult<Self::Iter>;
}

/// Chains the entries of iterators produced by `factory`, driven by an
/// index iterator: for each index entry, a derived iterator yields the
/// actual entries. Used to walk a table's data blocks in index order.
pub struct ConcatenateIterator<I: Iter, F: DerivedIterFactory> {
    index_iter: I,
    factory: F,
    data_iter: Option<F::Iter>,
    err: Option<Error>,
}

impl<I: Iter, F: DerivedIterFactory> ConcatenateIterator<I, F> {
    pub fn new(index_iter: I, factory: F) -> Self {
        ConcatenateIterator {
            index_iter,
            factory,
            data_iter: None,
            err: None,
        }
    }

    fn corrupt(&mut self, e: Error) {
        if self.err.is_none() {
            self.err = Some(e);
        }
        self.data_iter = None;
    }

    /// Rebuilds the data iterator from the current index entry.
    fn init_data_iter(&mut self) {
        if !self.index_iter.valid() {
            self.data_iter = None;
            return;
        }
        match self.factory.derive(self.index_iter.value()) {
            Ok(iter) => self.data_iter = Some(iter),
            Err(e) => self.corrupt(e),
        }
    }

    /// Advances over exhausted data iterators until an entry is found or
    /// the index runs out.
    fn skip_forward(&mut self) {
        while self.data_iter.as_ref().map_or(true, |it| !it.valid()) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.next();
            self.init_data_iter();
            if let Some(it) = self.data_iter.as_mut() {
                it.seek_to_first();
            }
        }
    }

    fn skip_backward(&mut self) {
        while self.data_iter.as_ref().map_or(true, |it| !it.valid()) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.prev();
            self.init_data_iter();
            if let Some(it) = self.data_iter.as_mut() {
                it.seek_to_last();
            }
        }
    }
}

impl<I: Iter, F: DerivedIterFactory> Iter for ConcatenateIterator<I, F> {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().map_or(false, |it| it.valid())
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_iter();
        if let Some(it) = self.data_iter.as_mut() {
            it.seek_to_first();
        }
        self.skip_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_iter();
        if let Some(it) = self.data_iter.as_mut() {
            it.seek_to_last();
        }
        self.skip_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_iter();
        if let Some(it) = self.data_iter.as_mut() {
            it.seek(target);
        }
        self.skip_forward();
    }

    fn next(&mut self) {
        let it = self
            .data_iter
            .as_mut()
            .expect("[concatenate iterator] `next` on invalid iterator");
        it.next();
        self.skip_forward();
    }

    fn prev(&mut self) {
        let it = self
            .data_iter
            .as_mut()
            .expect("[concatenate iterator] `prev` on invalid iterator");
        it.prev();
        self.skip_backward();
    }

    fn key(&self) -> &[u8] {
        self.data_iter
            .as_ref()
            .expect("[concatenate iterator] `key` on invalid iterator")
            .key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter
            .as_ref()
            .expect("[concatenate iterator] `value` on invalid iterator")
            .value()
    }

    fn status(&mut self) -> IResult<()> {
        if let Some(e) = self.err.take() {
            return Err(e);
        }
        self.index_iter.status()?;
        if let Some(it) = self.data_iter.as_mut() {
            it.status()?;
        }
        Ok(())
    }
}
