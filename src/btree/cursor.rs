//! # Range Cursors
//!
//! Forward and backward iteration over the prefix B+-tree. Leaves are not
//! chained, so a cursor walks leaf-to-leaf through its descent stack: when a
//! leaf is exhausted it pops to the nearest ancestor with an unvisited
//! subtree on the traversal side and descends to that subtree's edge leaf.
//!
//! A cursor holds no locks and no pins between `next` calls: it buffers a
//! batch of entries under the index's shared lock, then re-descends from the
//! root using the last key it returned when the batch runs dry. Writers can
//! therefore restructure the tree freely between batches without
//! invalidating any cursor.

use std::collections::VecDeque;

use eyre::Result;

use crate::config::CURSOR_BATCH;

use super::bucket::{LeafValue, PrefixBucket, SearchResult};
use super::{PrefixTree, ROOT_PAGE};

/// One level of the descent stack: which child of `page` the walk is
/// currently inside. Child positions run `0..=entry_count`; position 0 is
/// the first entry's left child, position `j > 0` is entry `j - 1`'s right
/// child.
struct Frame {
    page: u32,
    child_pos: usize,
    child_count: usize,
}

pub struct TreeCursor<'t> {
    tree: &'t PrefixTree,
    ascending: bool,
    lower: Option<(String, bool)>,
    upper: Option<(String, bool)>,
    prefetch: usize,
    last_key: Option<String>,
    buffer: VecDeque<(String, Vec<u8>)>,
    exhausted: bool,
}

impl<'t> TreeCursor<'t> {
    pub(crate) fn new(
        tree: &'t PrefixTree,
        ascending: bool,
        lower: Option<(String, bool)>,
        upper: Option<(String, bool)>,
    ) -> Self {
        Self {
            tree,
            ascending,
            lower,
            upper,
            prefetch: CURSOR_BATCH,
            last_key: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub(crate) fn full(tree: &'t PrefixTree, ascending: bool) -> Self {
        Self::new(tree, ascending, None, None)
    }

    /// Hint for how many entries each descent should gather.
    pub fn prefetch_size(mut self, entries: usize) -> Self {
        self.prefetch = entries.max(1);
        self
    }

    /// Next entry in cursor order, or `None` at the end of the range.
    pub fn next(&mut self) -> Result<Option<(String, Vec<u8>)>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_batch()?;
        }
        Ok(self.buffer.pop_front())
    }

    fn fetch_batch(&mut self) -> Result<()> {
        // The start bound tightens as the cursor advances: resuming is
        // always exclusive of the last returned key.
        let start: Option<(String, bool)> = match (&self.last_key, self.ascending) {
            (Some(last), _) => Some((last.clone(), false)),
            (None, true) => self.lower.clone(),
            (None, false) => self.upper.clone(),
        };

        let raw = {
            let _guard = self.tree.read_lock();
            let _file = self
                .tree
                .engine()
                .file_locks()
                .shared(self.tree.file_id());
            self.collect(start.as_ref().map(|(k, i)| (k.as_str(), *i)))?
        };

        if raw.len() < self.prefetch {
            self.exhausted = true;
        }

        for (key, value) in raw {
            let decoded = self.tree.decode_value(&value)?;
            self.buffer.push_back((key, decoded));
            self.last_key = Some(self.buffer.back().unwrap().0.clone()); // INVARIANT: just pushed
        }
        Ok(())
    }

    /// Does `key` fall past the cursor's far bound?
    fn past_far_bound(&self, key: &str) -> bool {
        let bound = if self.ascending {
            &self.upper
        } else {
            &self.lower
        };
        match bound {
            None => false,
            Some((limit, inclusive)) => {
                let cmp = key.cmp(limit.as_str());
                if self.ascending {
                    cmp == std::cmp::Ordering::Greater
                        || (cmp == std::cmp::Ordering::Equal && !inclusive)
                } else {
                    cmp == std::cmp::Ordering::Less
                        || (cmp == std::cmp::Ordering::Equal && !inclusive)
                }
            }
        }
    }

    /// Gathers up to one prefetch batch of entries from the start bound in
    /// cursor order, pinning one page at a time.
    fn collect(&self, start: Option<(&str, bool)>) -> Result<Vec<(String, LeafValue)>> {
        let engine = self.tree.engine();
        let file_id = self.tree.file_id();

        let mut stack: Vec<Frame> = Vec::new();
        let mut leaf_page = {
            let mut page_index = ROOT_PAGE;
            loop {
                let view = engine.load_for_read(file_id, page_index)?;
                let bucket = PrefixBucket::new(&view);
                if bucket.is_leaf() {
                    break page_index;
                }

                let size = bucket.size();
                let pos = match start {
                    None => {
                        if self.ascending {
                            0
                        } else {
                            size
                        }
                    }
                    Some((key, _)) => match bucket.find(key) {
                        SearchResult::Found(index) => index + 1,
                        SearchResult::NotFound(index) => index,
                    },
                };

                let child = child_at(&bucket, pos);
                stack.push(Frame {
                    page: page_index,
                    child_pos: pos,
                    child_count: size,
                });
                page_index = child;
            }
        };

        let mut entries = Vec::new();
        let mut first_leaf = true;

        loop {
            // Extract the qualifying slice of this leaf under its pin.
            let (batch, leaf_done) = {
                let view = engine.load_for_read(file_id, leaf_page)?;
                let bucket = PrefixBucket::new(&view);
                let size = bucket.size();

                let mut index: isize = if self.ascending {
                    let mut from = 0isize;
                    if first_leaf {
                        if let Some((key, inclusive)) = start {
                            from = match bucket.find(key) {
                                SearchResult::Found(i) => {
                                    if inclusive {
                                        i as isize
                                    } else {
                                        i as isize + 1
                                    }
                                }
                                SearchResult::NotFound(i) => i as isize,
                            };
                        }
                    }
                    from
                } else {
                    let mut from = size as isize - 1;
                    if first_leaf {
                        if let Some((key, inclusive)) = start {
                            from = match bucket.find(key) {
                                SearchResult::Found(i) => {
                                    if inclusive {
                                        i as isize
                                    } else {
                                        i as isize - 1
                                    }
                                }
                                SearchResult::NotFound(i) => i as isize - 1,
                            };
                        }
                    }
                    from
                };

                let mut batch = Vec::new();
                let mut hit_far_bound = false;

                while index >= 0 && (index as usize) < size {
                    let key = bucket.key_at(index as usize);
                    if self.past_far_bound(&key) {
                        hit_far_bound = true;
                        break;
                    }
                    batch.push((key, bucket.value_at(index as usize)?));
                    if entries.len() + batch.len() >= self.prefetch {
                        break;
                    }
                    index += if self.ascending { 1 } else { -1 };
                }

                (batch, hit_far_bound)
            };

            entries.extend(batch);
            first_leaf = false;

            if leaf_done || entries.len() >= self.prefetch {
                return Ok(entries);
            }

            leaf_page = match self.advance_leaf(&mut stack)? {
                Some(page) => page,
                None => return Ok(entries),
            };
        }
    }

    /// Moves the descent stack to the next leaf in traversal order,
    /// descending the appropriate edge of the freshly entered subtree.
    fn advance_leaf(&self, stack: &mut Vec<Frame>) -> Result<Option<u32>> {
        let engine = self.tree.engine();
        let file_id = self.tree.file_id();

        loop {
            let frame = match stack.last_mut() {
                Some(frame) => frame,
                None => return Ok(None),
            };

            let can_move = if self.ascending {
                frame.child_pos < frame.child_count
            } else {
                frame.child_pos > 0
            };
            if !can_move {
                stack.pop();
                continue;
            }

            if self.ascending {
                frame.child_pos += 1;
            } else {
                frame.child_pos -= 1;
            }

            // Descend the near edge of the new subtree down to a leaf.
            let mut page_index = {
                let view = engine.load_for_read(file_id, frame.page)?;
                child_at(&PrefixBucket::new(&view), frame.child_pos)
            };

            loop {
                let view = engine.load_for_read(file_id, page_index)?;
                let bucket = PrefixBucket::new(&view);
                if bucket.is_leaf() {
                    return Ok(Some(page_index));
                }

                let size = bucket.size();
                let pos = if self.ascending { 0 } else { size };
                let child = child_at(&bucket, pos);
                stack.push(Frame {
                    page: page_index,
                    child_pos: pos,
                    child_count: size,
                });
                page_index = child;
            }
        }
    }
}

fn child_at(bucket: &PrefixBucket<'_, '_>, pos: usize) -> u32 {
    if pos == 0 {
        bucket.children_at(0).0
    } else {
        bucket.children_at(pos - 1).1
    }
}

/// Key-only view over a [`TreeCursor`].
pub struct KeyCursor<'t> {
    inner: TreeCursor<'t>,
}

impl<'t> KeyCursor<'t> {
    pub(crate) fn new(inner: TreeCursor<'t>) -> Self {
        Self { inner }
    }

    pub fn next(&mut self) -> Result<Option<String>> {
        Ok(self.inner.next()?.map(|(key, _)| key))
    }
}
