use log::trace;

use crate::error::DbError;
use crate::storage::Storage;
use crate::types::{DbResult, PageId};

/// Fragmented values start with a header octet:
/// - bit 0x01: an inline length field (and inline head bytes) follow
/// - bits 0x06: width of the total-length field, (code >> 1) * 2 + 2 bytes
/// - bit 0x08: the single pointer is indirect (to an i-node tree)
///
/// Direct form lists 6-byte page ids, one per full page of content after the
/// inline head. Indirect form holds one 6-byte pointer to the root i-node;
/// i-nodes are pages of 6-byte slots, each level multiplying fan-out by
/// page_size / 6. A pointer of 0 denotes an absent (all-zero) page.
const FLAG_INLINE_LEN: u8 = 0x01;
const FLAG_INDIRECT: u8 = 0x08;
const LEN_WIDTH_SHIFT: u8 = 1;

const PTR_LEN: usize = 6;

fn len_width(total: u64) -> usize {
    if total < (1 << 16) {
        2
    } else if total < (1 << 32) {
        4
    } else if total < (1 << 48) {
        6
    } else {
        8
    }
}

fn write_len(buf: &mut Vec<u8>, total: u64, width: usize) {
    let bytes = total.to_le_bytes();
    buf.extend_from_slice(&bytes[..width]);
}

fn read_len(buf: &[u8], width: usize) -> u64 {
    let mut tmp = [0u8; 8];
    tmp[..width].copy_from_slice(&buf[..width]);
    u64::from_le_bytes(tmp)
}

fn write_ptr(buf: &mut Vec<u8>, id: PageId) {
    buf.extend_from_slice(&id.to_le_bytes()[..PTR_LEN]);
}

fn read_ptr(buf: &[u8]) -> PageId {
    let mut tmp = [0u8; 8];
    tmp[..PTR_LEN].copy_from_slice(&buf[..PTR_LEN]);
    u64::from_le_bytes(tmp)
}

/// Decoded descriptor geometry.
pub struct FragmentShape {
    pub total_len: u64,
    pub inline_len: usize,
    pub indirect: bool,
    /// Byte offset of the inline content inside the descriptor.
    inline_off: usize,
    /// Byte offset of the pointer area.
    ptr_off: usize,
    /// Direct: number of pointers. Indirect: i-node tree levels.
    pub levels: usize,
    pub page_count: u64,
}

impl FragmentShape {
    pub fn parse(storage: &Storage, desc: &[u8]) -> Result<Self, DbError> {
        if desc.is_empty() {
            return Err(DbError::corrupt("empty fragment descriptor"));
        }
        let header = desc[0];
        let width = (((header >> LEN_WIDTH_SHIFT) & 0x3) as usize) * 2 + 2;
        if desc.len() < 1 + width {
            return Err(DbError::corrupt("fragment descriptor shorter than header"));
        }
        let total_len = read_len(&desc[1..], width);
        let mut off = 1 + width;
        let inline_len = if header & FLAG_INLINE_LEN != 0 {
            if desc.len() < off + 2 {
                return Err(DbError::corrupt("fragment descriptor missing inline length"));
            }
            let ilen = u16::from_le_bytes([desc[off], desc[off + 1]]) as usize;
            off += 2;
            ilen
        } else {
            0
        };
        let inline_off = off;
        let ptr_off = off + inline_len;
        let indirect = header & FLAG_INDIRECT != 0;
        let page_size = storage.page_size() as u64;
        if inline_len as u64 > total_len || desc.len() < ptr_off {
            return Err(DbError::corrupt("fragment inline length exceeds total"));
        }
        let remaining = total_len - inline_len as u64;
        let page_count = (remaining + page_size - 1) / page_size;
        let levels = if indirect {
            inode_levels(page_count, storage.page_size())
        } else {
            page_count as usize
        };
        if !indirect && desc.len() < ptr_off + page_count as usize * PTR_LEN {
            return Err(DbError::corrupt("fragment descriptor truncated pointer list"));
        }
        if indirect && desc.len() < ptr_off + PTR_LEN {
            return Err(DbError::corrupt("fragment descriptor missing root pointer"));
        }
        Ok(Self {
            total_len,
            inline_len,
            indirect,
            inline_off,
            ptr_off,
            levels,
            page_count,
        })
    }

    fn inline<'a>(&self, desc: &'a [u8]) -> &'a [u8] {
        &desc[self.inline_off..self.inline_off + self.inline_len]
    }

    fn direct_ptr(&self, desc: &[u8], idx: usize) -> PageId {
        read_ptr(&desc[self.ptr_off + idx * PTR_LEN..])
    }

    fn set_direct_ptr(&self, desc: &mut [u8], idx: usize, id: PageId) {
        let off = self.ptr_off + idx * PTR_LEN;
        desc[off..off + PTR_LEN].copy_from_slice(&id.to_le_bytes()[..PTR_LEN]);
    }

    fn root_ptr(&self, desc: &[u8]) -> PageId {
        read_ptr(&desc[self.ptr_off..])
    }
}

/// Number of i-node levels needed so each i-node has at most page_size / 6
/// children: ceil(log_{P/6}(pages)).
pub fn inode_levels(page_count: u64, page_size: usize) -> usize {
    let fan_out = (page_size / PTR_LEN) as u64;
    let mut levels = 1;
    let mut cap = fan_out;
    while cap < page_count {
        cap *= fan_out;
        levels += 1;
    }
    levels
}

fn subtree_capacity(level: usize, page_size: usize) -> u64 {
    let fan_out = (page_size / PTR_LEN) as u64;
    fan_out.pow(level as u32)
}

/// Split `value` into pages and produce a descriptor no longer than
/// `max_descriptor`. Shapes are tried in order: direct with an inline head,
/// direct, then indirect (which always fits).
pub fn fragment(storage: &Storage, value: &[u8], max_descriptor: usize) -> Result<Vec<u8>, DbError> {
    let page_size = storage.page_size();
    let total = value.len() as u64;
    let width = len_width(total);

    // Direct with the unaligned head inline.
    let inline_len = value.len() % page_size;
    let full_pages = value.len() / page_size;
    let with_inline = 1 + width + if inline_len > 0 { 2 + inline_len } else { 0 } + full_pages * PTR_LEN;
    if with_inline <= max_descriptor {
        let mut desc = Vec::with_capacity(with_inline);
        let mut header = ((width / 2 - 1) as u8) << LEN_WIDTH_SHIFT;
        if inline_len > 0 {
            header |= FLAG_INLINE_LEN;
        }
        desc.push(header);
        write_len(&mut desc, total, width);
        if inline_len > 0 {
            desc.extend_from_slice(&(inline_len as u16).to_le_bytes());
            desc.extend_from_slice(&value[..inline_len]);
        }
        for chunk in value[inline_len..].chunks(page_size) {
            write_ptr(&mut desc, write_data_page(storage, chunk)?);
        }
        return Ok(desc);
    }

    // Direct, everything out of line, last page zero-padded.
    let page_count = (value.len() + page_size - 1) / page_size;
    let plain = 1 + width + page_count * PTR_LEN;
    if plain <= max_descriptor {
        let mut desc = Vec::with_capacity(plain);
        desc.push(((width / 2 - 1) as u8) << LEN_WIDTH_SHIFT);
        write_len(&mut desc, total, width);
        for chunk in value.chunks(page_size) {
            write_ptr(&mut desc, write_data_page(storage, chunk)?);
        }
        return Ok(desc);
    }

    // Indirect: header, total length, one pointer to the i-node tree.
    let levels = inode_levels(page_count as u64, page_size);
    let mut ids: Vec<PageId> = Vec::with_capacity(page_count);
    for chunk in value.chunks(page_size) {
        ids.push(write_data_page(storage, chunk)?);
    }
    let root = build_inode_tree(storage, &ids, levels)?;
    let mut desc = Vec::with_capacity(1 + width + PTR_LEN);
    desc.push((((width / 2 - 1) as u8) << LEN_WIDTH_SHIFT) | FLAG_INDIRECT);
    write_len(&mut desc, total, width);
    write_ptr(&mut desc, root);
    trace!(
        "fragmented {} bytes into {} pages, {} i-node levels",
        total,
        page_count,
        levels
    );
    Ok(desc)
}

/// A descriptor of the same shapes as `fragment` but with every pointer
/// absent; reads see zeroes and sparse writes allocate on demand.
pub fn fragment_blank(storage: &Storage, total: u64, max_descriptor: usize) -> Result<Vec<u8>, DbError> {
    let page_size = storage.page_size() as u64;
    let width = len_width(total);
    let page_count = ((total + page_size - 1) / page_size) as usize;
    let plain = 1 + width + page_count * PTR_LEN;
    let mut desc;
    if plain <= max_descriptor {
        desc = Vec::with_capacity(plain);
        desc.push(((width / 2 - 1) as u8) << LEN_WIDTH_SHIFT);
        write_len(&mut desc, total, width);
        desc.resize(plain, 0);
    } else {
        desc = Vec::with_capacity(1 + width + PTR_LEN);
        desc.push((((width / 2 - 1) as u8) << LEN_WIDTH_SHIFT) | FLAG_INDIRECT);
        write_len(&mut desc, total, width);
        desc.resize(1 + width + PTR_LEN, 0);
    }
    Ok(desc)
}

fn write_data_page(storage: &Storage, chunk: &[u8]) -> Result<PageId, DbError> {
    let page_size = storage.page_size();
    let id = storage.alloc.alloc_page()?;
    if chunk.len() == page_size {
        storage.store.write_page(id, chunk)?;
    } else {
        let mut buf = vec![0u8; page_size];
        buf[..chunk.len()].copy_from_slice(chunk);
        storage.store.write_page(id, &buf)?;
    }
    Ok(id)
}

fn build_inode_tree(storage: &Storage, ids: &[PageId], levels: usize) -> Result<PageId, DbError> {
    let fan_out = storage.page_size() / PTR_LEN;
    let mut current: Vec<PageId> = ids.to_vec();
    for _ in 0..levels {
        let mut next = Vec::with_capacity((current.len() + fan_out - 1) / fan_out);
        for group in current.chunks(fan_out) {
            let mut buf = vec![0u8; storage.page_size()];
            for (i, id) in group.iter().enumerate() {
                buf[i * PTR_LEN..i * PTR_LEN + PTR_LEN]
                    .copy_from_slice(&id.to_le_bytes()[..PTR_LEN]);
            }
            let inode = storage.alloc.alloc_page()?;
            storage.store.write_page(inode, &buf)?;
            next.push(inode);
        }
        current = next;
    }
    debug_assert_eq!(current.len(), 1);
    Ok(current[0])
}

/// Rebuild the full value from a descriptor.
pub fn reconstruct(storage: &Storage, desc: &[u8]) -> Result<Vec<u8>, DbError> {
    let shape = FragmentShape::parse(storage, desc)?;
    let mut out = vec![0u8; shape.total_len as usize];
    read_range(storage, desc, 0, &mut out)?;
    Ok(out)
}

/// Random-access read of `buf.len()` bytes starting at `offset`.
pub fn read_range(storage: &Storage, desc: &[u8], offset: u64, buf: &mut [u8]) -> DbResult {
    let shape = FragmentShape::parse(storage, desc)?;
    if offset + buf.len() as u64 > shape.total_len {
        return Err(DbError::LargeValue {
            len: offset + buf.len() as u64,
        });
    }
    let page_size = storage.page_size() as u64;

    let mut pos = 0usize;
    // Inline head.
    if offset < shape.inline_len as u64 {
        let inline = shape.inline(desc);
        let start = offset as usize;
        let n = (inline.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&inline[start..start + n]);
        pos = n;
    }
    while pos < buf.len() {
        let abs = offset + pos as u64 - shape.inline_len as u64;
        let page_idx = abs / page_size;
        let in_page = (abs % page_size) as usize;
        let n = ((page_size as usize - in_page) as usize).min(buf.len() - pos);
        let page_id = locate_page(storage, desc, &shape, page_idx)?;
        if page_id == 0 {
            for b in &mut buf[pos..pos + n] {
                *b = 0;
            }
        } else {
            let mut page = vec![0u8; page_size as usize];
            storage.store.read_page(page_id, &mut page)?;
            buf[pos..pos + n].copy_from_slice(&page[in_page..in_page + n]);
        }
        pos += n;
    }
    Ok(())
}

fn locate_page(
    storage: &Storage,
    desc: &[u8],
    shape: &FragmentShape,
    page_idx: u64,
) -> Result<PageId, DbError> {
    if !shape.indirect {
        return Ok(shape.direct_ptr(desc, page_idx as usize));
    }
    let mut node = shape.root_ptr(desc);
    let mut level = shape.levels;
    let mut idx = page_idx;
    let page_size = storage.page_size();
    while level > 0 {
        if node == 0 {
            return Ok(0);
        }
        let cap = subtree_capacity(level - 1, page_size);
        let slot = (idx / cap) as usize;
        idx %= cap;
        let mut buf = vec![0u8; page_size];
        storage.store.read_page(node, &mut buf)?;
        node = read_ptr(&buf[slot * PTR_LEN..]);
        level -= 1;
    }
    Ok(node)
}

/// Random-access write. Affected pages are rewritten copy-on-write and the
/// descriptor's pointers updated in place; missing pages in sparse values are
/// allocated with zero-filled gaps. The value's length never changes here.
pub fn write_range(storage: &Storage, desc: &mut Vec<u8>, offset: u64, data: &[u8]) -> DbResult {
    let shape = FragmentShape::parse(storage, desc)?;
    if offset + data.len() as u64 > shape.total_len {
        return Err(DbError::Unsupported(
            "length-changing edits of fragmented values",
        ));
    }
    let page_size = storage.page_size() as u64;

    let mut pos = 0usize;
    if offset < shape.inline_len as u64 {
        let start = (shape.inline_off as u64 + offset) as usize;
        let n = (shape.inline_len - offset as usize).min(data.len());
        desc[start..start + n].copy_from_slice(&data[..n]);
        pos = n;
    }
    while pos < data.len() {
        let abs = offset + pos as u64 - shape.inline_len as u64;
        let page_idx = abs / page_size;
        let in_page = (abs % page_size) as usize;
        let n = (page_size as usize - in_page).min(data.len() - pos);

        if !shape.indirect {
            let old = shape.direct_ptr(desc, page_idx as usize);
            let new = rewrite_data_page(storage, old, in_page, &data[pos..pos + n])?;
            shape.set_direct_ptr(desc, page_idx as usize, new);
        } else {
            let root = shape.root_ptr(desc);
            let new_root = write_into_subtree(
                storage,
                root,
                shape.levels,
                page_idx,
                in_page,
                &data[pos..pos + n],
            )?;
            if new_root != root {
                let off = shape.ptr_off;
                desc[off..off + PTR_LEN].copy_from_slice(&new_root.to_le_bytes()[..PTR_LEN]);
            }
        }
        pos += n;
    }
    Ok(())
}

/// Copy-on-write update of a single data page; `old == 0` means the page was
/// absent and reads as zeroes.
fn rewrite_data_page(
    storage: &Storage,
    old: PageId,
    in_page: usize,
    data: &[u8],
) -> Result<PageId, DbError> {
    let page_size = storage.page_size();
    let mut buf = vec![0u8; page_size];
    if old != 0 {
        storage.store.read_page(old, &mut buf)?;
    }
    buf[in_page..in_page + data.len()].copy_from_slice(data);
    let new = storage.alloc.alloc_page()?;
    storage.store.write_page(new, &buf)?;
    if old != 0 {
        storage.alloc.delete_page(old);
    }
    Ok(new)
}

fn write_into_subtree(
    storage: &Storage,
    node: PageId,
    level: usize,
    page_idx: u64,
    in_page: usize,
    data: &[u8],
) -> Result<PageId, DbError> {
    if level == 0 {
        return rewrite_data_page(storage, node, in_page, data);
    }
    let page_size = storage.page_size();
    let cap = subtree_capacity(level - 1, page_size);
    let slot = (page_idx / cap) as usize;

    let mut buf = vec![0u8; page_size];
    if node != 0 {
        storage.store.read_page(node, &mut buf)?;
    }
    let child = read_ptr(&buf[slot * PTR_LEN..]);
    let new_child = write_into_subtree(storage, child, level - 1, page_idx % cap, in_page, data)?;
    buf[slot * PTR_LEN..slot * PTR_LEN + PTR_LEN]
        .copy_from_slice(&new_child.to_le_bytes()[..PTR_LEN]);
    let new = storage.alloc.alloc_page()?;
    storage.store.write_page(new, &buf)?;
    if node != 0 {
        storage.alloc.delete_page(node);
    }
    Ok(new)
}

/// Free every page a descriptor references. Pages never captured by a
/// checkpoint recycle immediately; the rest defer (the allocator decides).
pub fn delete_fragments(storage: &Storage, desc: &[u8]) -> DbResult {
    let shape = FragmentShape::parse(storage, desc)?;
    if !shape.indirect {
        for i in 0..shape.page_count as usize {
            let id = shape.direct_ptr(desc, i);
            if id != 0 {
                storage.alloc.delete_page(id);
            }
        }
        return Ok(());
    }
    delete_subtree(storage, shape.root_ptr(desc), shape.levels)
}

fn delete_subtree(storage: &Storage, node: PageId, level: usize) -> DbResult {
    if node == 0 {
        return Ok(());
    }
    if level > 0 {
        let page_size = storage.page_size();
        let mut buf = vec![0u8; page_size];
        storage.store.read_page(node, &mut buf)?;
        for slot in 0..page_size / PTR_LEN {
            let child = read_ptr(&buf[slot * PTR_LEN..]);
            if child != 0 {
                delete_subtree(storage, child, level - 1)?;
            }
        }
    }
    storage.alloc.delete_page(node);
    Ok(())
}

/// Collect every page id a descriptor references, for the reachability sweep.
pub fn referenced_pages(storage: &Storage, desc: &[u8], out: &mut Vec<PageId>) -> DbResult {
    let shape = FragmentShape::parse(storage, desc)?;
    if !shape.indirect {
        for i in 0..shape.page_count as usize {
            let id = shape.direct_ptr(desc, i);
            if id != 0 {
                out.push(id);
            }
        }
        return Ok(());
    }
    collect_subtree(storage, shape.root_ptr(desc), shape.levels, out)
}

fn collect_subtree(
    storage: &Storage,
    node: PageId,
    level: usize,
    out: &mut Vec<PageId>,
) -> DbResult {
    if node == 0 {
        return Ok(());
    }
    out.push(node);
    if level > 0 {
        let page_size = storage.page_size();
        let mut buf = vec![0u8; page_size];
        storage.store.read_page(node, &mut buf)?;
        for slot in 0..page_size / PTR_LEN {
            let child = read_ptr(&buf[slot * PTR_LEN..]);
            if child != 0 {
                collect_subtree(storage, child, level - 1, out)?;
            }
        }
    }
    Ok(())
}
