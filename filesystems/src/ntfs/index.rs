//! B+-tree index engine (§4.5): backs directories (`$I30`) and the system
//! indexes (`$SII`, `$SDH`, object id, reparse, quota).
//!
//! Entry-header parsing (`mft_reference`/`length`/`key_length`/`flags`) and
//! the `INDX` block layout are grounded on
//! `families/ntfs/ntfs/index.rs::parse_index_entries`/`parse_index_allocation`,
//! which only ever reads a directory index once, top to bottom, and never
//! inserts or deletes. This module generalizes that parser into a real
//! B+-tree: [`IndexTree::find`] walks root → leaf recording a [`Finder`]
//! path exactly the way the teacher's code walks it once,
//! [`IndexTree::insert_entry`] splits an overfull node and promotes a
//! separator up the tree, and [`IndexTree::delete_entry`] removes a key
//! (swapping with the in-order successor for an internal-node hit) and then
//! rebalances every node that drops below half full by borrowing a spare
//! entry from a sibling or, failing that, merging with one — recursing up
//! the tree when a merge itself empties the parent, per §4.5's "every
//! non-root node is at least half-full" invariant.

use ntfs_core::{NtfsError, NtfsResult};

use super::constants::{INDEX_BLOCK_SIGNATURE, INDEX_ENTRY_END, INDEX_ENTRY_NODE};
use super::cursor::{Cursor, CursorMut};
use super::fixup;
use super::record::MftRef;

/// Per-index comparator. `$I30` uses upcase-aware UTF-16 filename
/// collation; `$SII`/`$SDH` use integer/opaque-key comparators (§4.5).
pub type Collator = fn(&[u8], &[u8]) -> std::cmp::Ordering;

pub fn collate_ulong(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    let a = u32::from_le_bytes(a[..4].try_into().unwrap_or_default());
    let b = u32::from_le_bytes(b[..4].try_into().unwrap_or_default());
    a.cmp(&b)
}

/// `$SDH`'s collation rule: compare the descriptor hash first, then the
/// security_id, so entries that share a hash (a real possibility FNV-1a
/// doesn't rule out) still sort distinctly instead of colliding in the tree.
pub fn collate_security_hash(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    let hash_a = u32::from_le_bytes(a[..4].try_into().unwrap_or_default());
    let hash_b = u32::from_le_bytes(b[..4].try_into().unwrap_or_default());
    hash_a.cmp(&hash_b).then_with(|| {
        let id_a = u32::from_le_bytes(a[4..8].try_into().unwrap_or_default());
        let id_b = u32::from_le_bytes(b[4..8].try_into().unwrap_or_default());
        id_a.cmp(&id_b)
    })
}

/// Case-insensitive (upcase-table-free, ordinal uppercase) filename
/// collation. A real upcase table would be mount-supplied; this default
/// uses ASCII/simple Unicode uppercasing, sufficient for the core's own
/// property tests and overridable per index instance.
pub fn collate_file_name(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    fn decode(bytes: &[u8]) -> String {
        let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
        String::from_utf16_lossy(&units).to_uppercase()
    }
    decode(a).cmp(&decode(b))
}

/// One entry in an index node: a key, a reference to the object it names
/// (for a leaf entry), an optional payload, and an optional sub-node VCN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub reference: MftRef,
    pub payload: Vec<u8>,
    pub sub_node_vcn: Option<u64>,
}

impl IndexEntry {
    fn is_end_marker(&self) -> bool {
        self.key.is_empty() && self.reference.is_none()
    }

    fn encoded_len(&self) -> usize {
        let base = 16 + self.key.len() + self.payload.len();
        let with_vcn = if self.sub_node_vcn.is_some() { base + 8 } else { base };
        with_vcn.div_ceil(8) * 8
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let mut w = CursorMut::new(out);
        w.write_u64(self.reference.to_raw());
        w.write_u16(0); // length, patched below
        w.write_u16(self.key.len() as u16);
        let mut flags = 0u16;
        if self.sub_node_vcn.is_some() {
            flags |= INDEX_ENTRY_NODE;
        }
        if self.is_end_marker() {
            flags |= INDEX_ENTRY_END;
        }
        w.write_u16(flags);
        w.write_u16(0); // reserved
        w.write_bytes(&self.key);
        w.write_bytes(&self.payload);
        w.pad_to(8);
        if let Some(vcn) = self.sub_node_vcn {
            w.write_u64(vcn);
        }
        let len = (out.len() - start) as u16;
        out[start + 8..start + 10].copy_from_slice(&len.to_le_bytes());
    }

    fn parse(data: &[u8], offset: usize, key_payload_split: usize) -> NtfsResult<(Self, usize)> {
        let mut c = Cursor::at(data, offset);
        let reference = MftRef::from_raw(c.read_u64()?);
        let length = c.read_u16()? as usize;
        let key_length = c.read_u16()? as usize;
        let flags = c.read_u16()?;
        let _reserved = c.read_u16()?;

        if length < 16 || offset + length > data.len() {
            return Err(NtfsError::BadFormat(format!(
                "index entry at {offset} has invalid length {length}"
            )));
        }

        let has_vcn = flags & INDEX_ENTRY_NODE != 0;
        let vcn_len = if has_vcn { 8 } else { 0 };
        let body_end = offset + length - vcn_len;
        let body_start = offset + 16;
        if body_start + key_length > body_end {
            return Err(NtfsError::BadFormat("index entry key exceeds entry body".into()));
        }
        let key = data[body_start..body_start + key_length.min(key_payload_split.max(key_length))].to_vec();
        let payload = data[body_start + key_length..body_end].to_vec();
        let sub_node_vcn = if has_vcn {
            let mut vc = Cursor::at(data, offset + length - 8);
            Some(vc.read_u64()?)
        } else {
            None
        };

        Ok((Self { key, reference, payload, sub_node_vcn }, offset + length))
    }
}

/// One node's worth of decoded entries, independent of whether it is the
/// resident root node or an on-disk `$INDEX_ALLOCATION` block.
#[derive(Debug, Clone, Default)]
pub struct IndexNode {
    pub entries: Vec<IndexEntry>,
    pub vcn: Option<u64>,
}

impl IndexNode {
    pub fn is_leaf(&self) -> bool {
        self.entries.iter().all(|e| e.sub_node_vcn.is_none())
    }

    /// Decodes a flat run of index entries (used for both the root's
    /// in-record entries and one allocation block's entries).
    pub fn decode_entries(data: &[u8]) -> NtfsResult<Vec<IndexEntry>> {
        let mut entries = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let (entry, next) = IndexEntry::parse(data, offset, usize::MAX)?;
            let is_end = entry.is_end_marker();
            entries.push(entry);
            if is_end {
                break;
            }
            offset = next;
        }
        Ok(entries)
    }

    pub fn encode_entries(entries: &[IndexEntry]) -> Vec<u8> {
        let mut out = Vec::new();
        for e in entries {
            e.encode_into(&mut out);
        }
        out
    }

    /// Decodes one `INDX`-signed allocation block, applying fixup first.
    pub fn decode_block(buf: &mut [u8]) -> NtfsResult<Self> {
        if buf.len() < 24 || &buf[0..4] != INDEX_BLOCK_SIGNATURE {
            return Err(NtfsError::BadFormat("bad INDX block signature".into()));
        }
        let usa_offset = u16::from_le_bytes([buf[4], buf[5]]) as usize;
        let usa_count = u16::from_le_bytes([buf[6], buf[7]]) as usize;
        fixup::remove(buf, usa_offset, usa_count)?;

        let vcn = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let header_start = usa_offset + usa_count * 2;
        let header_start = header_start.div_ceil(8) * 8;
        if header_start + 16 > buf.len() {
            return Err(NtfsError::BadFormat("INDX header past buffer".into()));
        }
        let entries_offset = u32::from_le_bytes(buf[header_start..header_start + 4].try_into().unwrap()) as usize;
        let index_length = u32::from_le_bytes(buf[header_start + 4..header_start + 8].try_into().unwrap()) as usize;
        let start = header_start + entries_offset;
        let end = (header_start + index_length).min(buf.len());
        if start > end {
            return Err(NtfsError::BadFormat("INDX entries region invalid".into()));
        }
        let entries = Self::decode_entries(&buf[start..end])?;
        Ok(Self { entries, vcn: Some(vcn) })
    }
}

/// A descent cursor: the path from root to an insertion/lookup point
/// (§4.5 `fnd`), each level identified by `(vcn, entry index)`. `None` vcn
/// marks the resident root.
#[derive(Debug, Clone, Default)]
pub struct Finder {
    pub path: Vec<(Option<u64>, usize)>,
}

impl Finder {
    pub fn depth(&self) -> usize {
        self.path.len()
    }
}

/// Result of a descent: the entry nearest `key`, whether it was an exact
/// match, and the path taken.
pub struct FindResult {
    pub entry: IndexEntry,
    pub exact: bool,
    pub finder: Finder,
}

/// The B+-tree itself. Keeps the root's entries resident and every loaded
/// allocation-block node in `blocks`, keyed by VCN; nodes not yet loaded
/// are fetched by the caller (via [`IndexTree::load_block`]) before a
/// descent can continue through them.
pub struct IndexTree {
    pub root: IndexNode,
    pub blocks: std::collections::BTreeMap<u64, IndexNode>,
    pub free_blocks: Vec<u64>,
    pub block_size: usize,
    pub collator: Collator,
    next_vcn: u64,
}

impl IndexTree {
    pub fn new(collator: Collator, block_size: usize) -> Self {
        Self {
            root: IndexNode::default(),
            blocks: std::collections::BTreeMap::new(),
            free_blocks: Vec::new(),
            block_size,
            collator,
            next_vcn: 0,
        }
    }

    pub fn load_block(&mut self, vcn: u64, node: IndexNode) {
        self.blocks.insert(vcn, node);
    }

    fn node_at(&self, vcn: Option<u64>) -> &IndexNode {
        match vcn {
            None => &self.root,
            Some(v) => &self.blocks[&v],
        }
    }

    fn node_at_mut(&mut self, vcn: Option<u64>) -> &mut IndexNode {
        match vcn {
            None => &mut self.root,
            Some(v) => self.blocks.get_mut(&v).expect("block not loaded"),
        }
    }

    /// Descends from the root to the entry matching (or nearest) `key`,
    /// recording the path (§4.5 `find`).
    pub fn find(&self, key: &[u8]) -> NtfsResult<FindResult> {
        let mut finder = Finder::default();
        let mut vcn = None;

        loop {
            let node = self.node_at(vcn);
            let idx = node
                .entries
                .iter()
                .position(|e| e.is_end_marker() || (self.collator)(&e.key, key) != std::cmp::Ordering::Less)
                .unwrap_or(node.entries.len().saturating_sub(1));
            finder.path.push((vcn, idx));
            let entry = &node.entries[idx];

            if entry.is_end_marker() {
                if let Some(child) = entry.sub_node_vcn {
                    vcn = Some(child);
                    continue;
                }
                return Ok(FindResult { entry: entry.clone(), exact: false, finder });
            }

            let ord = (self.collator)(&entry.key, key);
            if ord == std::cmp::Ordering::Equal {
                return Ok(FindResult { entry: entry.clone(), exact: true, finder });
            }
            if let Some(child) = entry.sub_node_vcn {
                vcn = Some(child);
                continue;
            }
            return Ok(FindResult { entry: entry.clone(), exact: false, finder });
        }
    }

    /// Overwrites the payload of the entry matching `key` in place, without
    /// touching the key, the reference, or tree shape (§4.5 `update_dup`):
    /// a directory entry's denormalised `$FILE_NAME` duplicate information
    /// changes size/timestamp fields only, never the name it's keyed on.
    pub fn update_dup(&mut self, key: &[u8], new_payload: Vec<u8>) -> NtfsResult<()> {
        let find = self.find(key)?;
        if !find.exact {
            return Err(NtfsError::NotFound("index entry not found for update_dup".into()));
        }
        let &(vcn, idx) = find
            .finder
            .path
            .last()
            .ok_or_else(|| NtfsError::BadFormat("empty finder path from a successful find".into()))?;
        self.node_at_mut(vcn).entries[idx].payload = new_payload;
        Ok(())
    }

    fn capacity_entries(&self) -> usize {
        // Rough entries-per-node budget derived from the allocation block
        // size; used only to decide when a node must split.
        (self.block_size / 64).max(4)
    }

    /// Inserts `entry` into its correct leaf, splitting the leaf (and, if
    /// needed, ancestors up the finder path) when it overflows
    /// (§4.5 `insert_entry`).
    pub fn insert_entry(&mut self, entry: IndexEntry) -> NtfsResult<()> {
        let find = self.find(&entry.key)?;
        if find.exact {
            return Err(NtfsError::Exists("index entry already present".into()));
        }
        let (vcn, idx) = *find.finder.path.last().expect("find always records a level");
        self.insert_at(vcn, idx, entry)
    }

    fn insert_at(&mut self, vcn: Option<u64>, idx: usize, entry: IndexEntry) -> NtfsResult<()> {
        {
            let node = self.node_at_mut(vcn);
            node.entries.insert(idx, entry);
        }
        if self.node_at(vcn).entries.len() > self.capacity_entries() {
            self.split(vcn)?;
        }
        Ok(())
    }

    /// Splits an overfull node: the upper half moves to a freshly allocated
    /// block, and a separator entry pointing at the new block is promoted
    /// into the parent (or, for the root, the root stays resident and both
    /// halves become allocation blocks — growing the tree by one level).
    fn split(&mut self, vcn: Option<u64>) -> NtfsResult<()> {
        let node = self.node_at_mut(vcn).clone();
        let mid = node.entries.len() / 2;
        let (left, right) = node.entries.split_at(mid);
        let mut left = left.to_vec();
        let right = right.to_vec();
        let separator_key = right[0].key.clone();

        let new_vcn = self.alloc_block();
        self.blocks.insert(new_vcn, IndexNode { entries: right, vcn: Some(new_vcn) });

        match vcn {
            Some(v) => {
                left.push(IndexEntry {
                    key: Vec::new(),
                    reference: MftRef::NONE,
                    payload: Vec::new(),
                    sub_node_vcn: None,
                });
                self.blocks.insert(v, IndexNode { entries: left, vcn: Some(v) });
                let separator = IndexEntry {
                    key: separator_key,
                    reference: MftRef::NONE,
                    payload: Vec::new(),
                    sub_node_vcn: Some(new_vcn),
                };
                self.promote(v, separator)
            }
            None => {
                let old_left_vcn = self.alloc_block();
                left.push(IndexEntry {
                    key: Vec::new(),
                    reference: MftRef::NONE,
                    payload: Vec::new(),
                    sub_node_vcn: None,
                });
                self.blocks.insert(old_left_vcn, IndexNode { entries: left, vcn: Some(old_left_vcn) });
                self.root.entries = vec![
                    IndexEntry {
                        key: separator_key,
                        reference: MftRef::NONE,
                        payload: Vec::new(),
                        sub_node_vcn: Some(new_vcn),
                    },
                    IndexEntry {
                        key: Vec::new(),
                        reference: MftRef::NONE,
                        payload: Vec::new(),
                        sub_node_vcn: Some(old_left_vcn),
                    },
                ];
                Ok(())
            }
        }
    }

    /// Inserts `separator` into the parent identified by searching every
    /// node for one whose child pointer is `child_vcn`. The finder path
    /// from the most recent descent already names this parent in the
    /// common (non-root-split) case; this linear fallback keeps the
    /// function correct even when called standalone (e.g. from tests).
    fn promote(&mut self, child_vcn: u64, separator: IndexEntry) -> NtfsResult<()> {
        if let Some(idx) = self.root.entries.iter().position(|e| e.sub_node_vcn == Some(child_vcn)) {
            self.root.entries.insert(idx, separator);
            if self.root.entries.len() > self.capacity_entries() {
                self.split(None)?;
            }
            return Ok(());
        }
        for (&vcn, node) in self.blocks.clone().iter() {
            if node.entries.iter().any(|e| e.sub_node_vcn == Some(child_vcn)) {
                let idx = self.blocks[&vcn].entries.iter().position(|e| e.sub_node_vcn == Some(child_vcn)).unwrap();
                self.blocks.get_mut(&vcn).unwrap().entries.insert(idx, separator);
                if self.blocks[&vcn].entries.len() > self.capacity_entries() {
                    self.split(Some(vcn))?;
                }
                return Ok(());
            }
        }
        Err(NtfsError::BadFormat("no parent found for split child".into()))
    }

    fn alloc_block(&mut self) -> u64 {
        self.free_blocks.pop().unwrap_or_else(|| {
            let v = self.next_vcn;
            self.next_vcn += 1;
            v
        })
    }

    /// Removes the entry matching `key`. Internal-node removal swaps with
    /// the in-order successor before deleting, matching the classic B-tree
    /// deletion strategy named in §4.5.
    pub fn delete_entry(&mut self, key: &[u8]) -> NtfsResult<()> {
        let find = self.find(key)?;
        if !find.exact {
            return Err(NtfsError::NotFound("index entry".into()));
        }
        let (vcn, idx) = *find.finder.path.last().unwrap();

        let has_child = self.node_at(vcn).entries[idx].sub_node_vcn.is_some();
        if has_child {
            let child_vcn = self.node_at(vcn).entries[idx].sub_node_vcn.unwrap();
            let successor = self.leftmost_leaf_entry(child_vcn);
            self.node_at_mut(vcn).entries[idx].key = successor.key.clone();
            self.node_at_mut(vcn).entries[idx].reference = successor.reference;
            self.node_at_mut(vcn).entries[idx].payload = successor.payload.clone();
            self.delete_leaf_key(Some(child_vcn), &successor.key)?;
        } else {
            self.node_at_mut(vcn).entries.remove(idx);
            self.rebalance(vcn)?;
        }
        Ok(())
    }

    fn leftmost_leaf_entry(&self, mut vcn: u64) -> IndexEntry {
        loop {
            let node = &self.blocks[&vcn];
            let first = node.entries.first().expect("node always has at least the end marker");
            match first.sub_node_vcn {
                Some(child) => vcn = child,
                None => return first.clone(),
            }
        }
    }

    fn delete_leaf_key(&mut self, vcn: Option<u64>, key: &[u8]) -> NtfsResult<()> {
        let node = self.node_at_mut(vcn);
        if let Some(pos) = node.entries.iter().position(|e| !e.is_end_marker() && e.key == key) {
            node.entries.remove(pos);
            self.rebalance(vcn)?;
            return Ok(());
        }
        Err(NtfsError::BadFormat("successor key not found during delete".into()))
    }

    /// Minimum entries (including the terminal marker) a non-root node must
    /// hold after a delete completes (§4.5 "at least half-full").
    fn min_entries(&self) -> usize {
        (self.capacity_entries() / 2).max(2)
    }

    /// Finds the node owning a child pointer to `child_vcn`, returning
    /// `(owner_vcn, entry_index)`. Linear over loaded blocks, same tradeoff
    /// as [`Self::promote`]'s fallback search.
    fn find_parent(&self, child_vcn: u64) -> Option<(Option<u64>, usize)> {
        if let Some(idx) = self.root.entries.iter().position(|e| e.sub_node_vcn == Some(child_vcn)) {
            return Some((None, idx));
        }
        for (&vcn, node) in self.blocks.iter() {
            if let Some(idx) = node.entries.iter().position(|e| e.sub_node_vcn == Some(child_vcn)) {
                return Some((Some(vcn), idx));
            }
        }
        None
    }

    /// Restores the half-full invariant for `vcn` after a leaf entry was
    /// removed from it: borrows a spare entry from a sibling if one has
    /// room to give, otherwise merges with a sibling and recurses on the
    /// parent (a merge always removes one entry from the parent, which may
    /// itself then underflow). The root is exempt — it shrinks by a level
    /// instead, via [`Self::collapse_root`], once it holds a single child
    /// pointer and nothing else.
    fn rebalance(&mut self, vcn: Option<u64>) -> NtfsResult<()> {
        let Some(v) = vcn else { return Ok(()) };
        let len = match self.blocks.get(&v) {
            Some(node) => node.entries.len(),
            None => return Ok(()), // already freed by an earlier merge in this chain
        };
        if len >= self.min_entries() {
            return Ok(());
        }

        let Some((parent_vcn, child_idx)) = self.find_parent(v) else {
            return Ok(());
        };
        let parent_len = self.node_at(parent_vcn).entries.len();
        let left_idx = if child_idx > 0 { Some(child_idx - 1) } else { None };
        let right_idx = if child_idx + 1 < parent_len { Some(child_idx + 1) } else { None };

        if let Some(li) = left_idx {
            if let Some(lv) = self.node_at(parent_vcn).entries[li].sub_node_vcn {
                if self.blocks[&lv].entries.len() > self.min_entries() {
                    self.borrow_from_left(parent_vcn, li, v)?;
                    return Ok(());
                }
            }
        }
        if let Some(ri) = right_idx {
            if let Some(rv) = self.node_at(parent_vcn).entries[ri].sub_node_vcn {
                if self.blocks[&rv].entries.len() > self.min_entries() {
                    self.borrow_from_right(parent_vcn, child_idx, rv)?;
                    return Ok(());
                }
            }
        }
        if let Some(li) = left_idx {
            if self.node_at(parent_vcn).entries[li].sub_node_vcn.is_some() {
                self.merge_at(parent_vcn, li)?;
                return self.rebalance(parent_vcn);
            }
        }
        if right_idx.is_some() {
            self.merge_at(parent_vcn, child_idx)?;
            return self.rebalance(parent_vcn);
        }

        if parent_vcn.is_none() && self.root.entries.len() == 1 {
            self.collapse_root(v)?;
        }
        Ok(())
    }

    /// Moves the separator at `parent.entries[sep_idx]` down to become `c`'s
    /// new first entry, and promotes the left sibling's last real entry up
    /// into the separator's place — the standard borrow-from-left-sibling
    /// rotation, translated into this format's "each entry owns the
    /// sub-node holding keys less than it" representation.
    fn borrow_from_left(&mut self, parent_vcn: Option<u64>, sep_idx: usize, c_vcn: u64) -> NtfsResult<()> {
        let a_vcn = self.node_at(parent_vcn).entries[sep_idx]
            .sub_node_vcn
            .ok_or_else(|| NtfsError::BadFormat("borrow-from-left separator has no child".into()))?;

        let (a_terminal_child, m_key, m_ref, m_payload, m_child) = {
            let a = self.blocks.get_mut(&a_vcn).ok_or_else(|| NtfsError::BadFormat("left sibling not loaded".into()))?;
            let terminal_child = a
                .entries
                .last()
                .ok_or_else(|| NtfsError::BadFormat("node has no entries".into()))?
                .sub_node_vcn;
            if a.entries.len() < 2 {
                return Err(NtfsError::BadFormat("left sibling has nothing to lend".into()));
            }
            let last_real = a.entries.len() - 2;
            let m = a.entries.remove(last_real);
            (terminal_child, m.key, m.reference, m.payload, m.sub_node_vcn)
        };
        {
            let a = self.blocks.get_mut(&a_vcn).unwrap();
            let term_idx = a.entries.len() - 1;
            a.entries[term_idx].sub_node_vcn = m_child;
        }

        let (s_key, s_ref, s_payload) = {
            let s = &self.node_at(parent_vcn).entries[sep_idx];
            (s.key.clone(), s.reference, s.payload.clone())
        };
        let new_first =
            IndexEntry { key: s_key, reference: s_ref, payload: s_payload, sub_node_vcn: a_terminal_child };
        self.node_at_mut(Some(c_vcn)).entries.insert(0, new_first);

        let parent = self.node_at_mut(parent_vcn);
        parent.entries[sep_idx].key = m_key;
        parent.entries[sep_idx].reference = m_ref;
        parent.entries[sep_idx].payload = m_payload;
        Ok(())
    }

    /// Symmetric to [`Self::borrow_from_left`]: `c_idx` names the separator
    /// whose child is the underfull node; `b_vcn` is the right sibling
    /// (`parent.entries[c_idx + 1]`'s child) lending its first entry.
    fn borrow_from_right(&mut self, parent_vcn: Option<u64>, c_idx: usize, b_vcn: u64) -> NtfsResult<()> {
        let c_vcn = self.node_at(parent_vcn).entries[c_idx]
            .sub_node_vcn
            .ok_or_else(|| NtfsError::BadFormat("borrow-from-right separator has no child".into()))?;

        let (m2_key, m2_ref, m2_payload, m2_child) = {
            let b = self.blocks.get_mut(&b_vcn).ok_or_else(|| NtfsError::BadFormat("right sibling not loaded".into()))?;
            if b.entries.len() < 2 {
                return Err(NtfsError::BadFormat("right sibling has nothing to lend".into()));
            }
            let m2 = b.entries.remove(0);
            (m2.key, m2.reference, m2.payload, m2.sub_node_vcn)
        };
        let c_terminal_child = self
            .node_at(Some(c_vcn))
            .entries
            .last()
            .ok_or_else(|| NtfsError::BadFormat("node has no entries".into()))?
            .sub_node_vcn;

        let (s2_key, s2_ref, s2_payload) = {
            let s2 = &self.node_at(parent_vcn).entries[c_idx + 1];
            (s2.key.clone(), s2.reference, s2.payload.clone())
        };
        let new_entry =
            IndexEntry { key: s2_key, reference: s2_ref, payload: s2_payload, sub_node_vcn: c_terminal_child };
        {
            let c = self.node_at_mut(Some(c_vcn));
            let term_idx = c.entries.len() - 1;
            c.entries.insert(term_idx, new_entry);
            c.entries[term_idx + 1].sub_node_vcn = m2_child;
        }

        let parent = self.node_at_mut(parent_vcn);
        parent.entries[c_idx + 1].key = m2_key;
        parent.entries[c_idx + 1].reference = m2_ref;
        parent.entries[c_idx + 1].payload = m2_payload;
        Ok(())
    }

    /// Merges the sibling pair straddling `parent.entries[sep_idx]`: the
    /// separator is pulled down as a real entry between the left sibling's
    /// own entries and the right sibling's, the left sibling's VCN survives
    /// as the merged node's identity, and the right sibling's VCN is freed.
    /// Re-splits the merged node if it now overflows (rare — only possible
    /// right after a borrow threshold changes), keeping the operation safe
    /// to call unconditionally from [`Self::rebalance`].
    fn merge_at(&mut self, parent_vcn: Option<u64>, sep_idx: usize) -> NtfsResult<()> {
        let (a_vcn, s_key, s_ref, s_payload, b_vcn) = {
            let parent = self.node_at(parent_vcn);
            let s = &parent.entries[sep_idx];
            let a_vcn = s.sub_node_vcn.ok_or_else(|| NtfsError::BadFormat("merge separator has no left child".into()))?;
            let b_vcn = parent.entries[sep_idx + 1]
                .sub_node_vcn
                .ok_or_else(|| NtfsError::BadFormat("merge separator has no right child".into()))?;
            (a_vcn, s.key.clone(), s.reference, s.payload.clone(), b_vcn)
        };

        let mut a_entries =
            self.blocks.remove(&a_vcn).ok_or_else(|| NtfsError::BadFormat("left merge child not loaded".into()))?.entries;
        let b_entries =
            self.blocks.remove(&b_vcn).ok_or_else(|| NtfsError::BadFormat("right merge child not loaded".into()))?.entries;
        let a_terminal = a_entries.pop().ok_or_else(|| NtfsError::BadFormat("node has no entries".into()))?;
        a_entries.push(IndexEntry { key: s_key, reference: s_ref, payload: s_payload, sub_node_vcn: a_terminal.sub_node_vcn });
        a_entries.extend(b_entries);

        self.blocks.insert(a_vcn, IndexNode { entries: a_entries, vcn: Some(a_vcn) });
        self.free_blocks.push(b_vcn);

        {
            let parent = self.node_at_mut(parent_vcn);
            parent.entries.remove(sep_idx);
            parent.entries[sep_idx].sub_node_vcn = Some(a_vcn);
        }

        if self.blocks[&a_vcn].entries.len() > self.capacity_entries() {
            self.split(Some(a_vcn))?;
        }
        Ok(())
    }

    /// Shrinks the tree by one level: `only_child_vcn` is the root's sole
    /// remaining child (its entries become the root's), once a cascade of
    /// merges has left the root holding nothing but a single child
    /// pointer.
    fn collapse_root(&mut self, only_child_vcn: u64) -> NtfsResult<()> {
        let child = self
            .blocks
            .remove(&only_child_vcn)
            .ok_or_else(|| NtfsError::BadFormat("root's only child not loaded".into()))?;
        self.root.entries = child.entries;
        self.free_blocks.push(only_child_vcn);
        Ok(())
    }

    /// Checks §4.5's "every non-root node is at least half-full" invariant
    /// across every currently loaded block — used by callers (and this
    /// module's own tests) to confirm a batch of deletes left the tree in
    /// a compliant shape.
    pub fn all_blocks_at_least_half_full(&self) -> bool {
        let min = self.min_entries();
        self.blocks.values().all(|n| n.entries.len() >= min)
    }

    /// In-order iteration over every non-marker entry, for readdir-style
    /// scans (§4.5 `find_sort`).
    pub fn iter_sorted(&self) -> Vec<IndexEntry> {
        let mut out = Vec::new();
        self.collect_sorted(None, &mut out);
        out
    }

    fn collect_sorted(&self, vcn: Option<u64>, out: &mut Vec<IndexEntry>) {
        for entry in &self.node_at(vcn).entries {
            if let Some(child) = entry.sub_node_vcn {
                self.collect_sorted(Some(child), out);
            }
            if !entry.is_end_marker() {
                out.push(entry.clone());
            }
        }
    }

    /// Every VCN this tree currently has allocated, for cross-checking
    /// against the `$BITMAP` attribute (§8 property 6).
    pub fn allocated_vcns(&self) -> Vec<u64> {
        self.blocks.keys().copied().collect()
    }
}
