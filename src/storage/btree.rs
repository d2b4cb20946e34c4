//! B+-tree operations over pager-resident nodes.
//!
//! Every function here works in page ids and borrows buffers from the
//! pager one at a time, so the parent back-pointers stored in pages are
//! a lookup shortcut rather than an ownership edge. Mutation goes
//! through [`Pager::page_mut`], which marks the page dirty in the same
//! call; rebalancing paths that forget the mark were the classic way to
//! lose structural updates on close.
//!
//! Rebalancing keeps three promises between operations: every non-root
//! node stays at or above minimum fill, every internal separator equals
//! the max key reachable through the child to its left, and the leaves
//! stay chained in key order through `next_leaf`.

use crate::errors::Error;
use crate::storage::cursor::Cursor;
use crate::storage::node::{
    Node, NodeType, INTERNAL_MAX_KEYS, INTERNAL_MIN_KEYS, LEAF_LEFT_SPLIT_COUNT, LEAF_MAX_CELLS,
    LEAF_MIN_CELLS, LEAF_RIGHT_SPLIT_COUNT,
};
use crate::storage::pager::Pager;
use crate::storage::row::Row;
use std::collections::HashSet;
use tracing::debug;

/// Inserts a new row, failing on a duplicate key.
pub fn insert(pager: &mut Pager, row: &Row) -> Result<(), Error> {
    let cursor = Cursor::find(pager, row.id)?;
    let node = pager.page(cursor.page_num)?;
    let num_cells = node.leaf_num_cells()?;
    if cursor.cell_num < num_cells && node.leaf_key(cursor.cell_num as usize)? == row.id {
        return Err(Error::DuplicateKey(row.id));
    }
    if num_cells as usize >= LEAF_MAX_CELLS {
        debug!(page = cursor.page_num, key = row.id, "leaf full, splitting");
        return leaf_split_and_insert(pager, &cursor, row);
    }
    leaf_insert_at(pager, cursor.page_num, cursor.cell_num as usize, row)
}

/// Overwrites the row bytes for an existing key in place. Keys do not
/// change, so no restructuring can follow.
pub fn update(pager: &mut Pager, row: &Row) -> Result<(), Error> {
    let cursor = Cursor::find(pager, row.id)?;
    if !cursor.points_at(pager, row.id)? {
        return Err(Error::NotFound(row.id));
    }
    let node = pager.page_mut(cursor.page_num)?;
    row.serialize(node.leaf_value_mut(cursor.cell_num as usize)?)?;
    Ok(())
}

pub fn find(pager: &mut Pager, key: u32) -> Result<Option<Row>, Error> {
    let cursor = Cursor::find(pager, key)?;
    if cursor.points_at(pager, key)? {
        Ok(Some(cursor.read_row(pager)?))
    } else {
        Ok(None)
    }
}

/// Deletes a key, rebalancing if the leaf drops below minimum fill.
pub fn remove(pager: &mut Pager, key: u32) -> Result<(), Error> {
    let cursor = Cursor::find(pager, key)?;
    if !cursor.points_at(pager, key)? {
        return Err(Error::NotFound(key));
    }
    let remaining = {
        let node = pager.page_mut(cursor.page_num)?;
        let num_cells = node.leaf_num_cells()? as usize;
        for i in cursor.cell_num as usize..num_cells - 1 {
            let next = node.leaf_cell(i + 1)?.to_vec();
            node.leaf_cell_mut(i)?.copy_from_slice(&next);
        }
        node.set_leaf_num_cells(num_cells as u32 - 1)?;
        num_cells - 1
    };
    debug!(key, page = cursor.page_num, "deleted key");

    // Removing the last cell shrinks this leaf's max, so the separator
    // chain above it goes stale even when no underflow follows.
    if remaining > 0 && cursor.cell_num as usize == remaining {
        repair_max_upward(pager, cursor.page_num)?;
    }

    let node = pager.page(cursor.page_num)?;
    if !node.is_root() && (node.leaf_num_cells()? as usize) < LEAF_MIN_CELLS {
        leaf_underflow(pager, cursor.page_num)?;
    }
    Ok(())
}

/// Maximum key reachable from `page_num`: the last cell of a leaf, or
/// recursively the max of the rightmost subtree.
pub fn max_key(pager: &mut Pager, page_num: u32) -> Result<u32, Error> {
    let node = pager.page(page_num)?;
    match node.node_type()? {
        NodeType::Leaf => node.leaf_max_key(),
        NodeType::Internal => {
            let right = node.internal_right_child()?;
            max_key(pager, right)
        }
    }
}

fn leaf_insert_at(
    pager: &mut Pager,
    page_num: u32,
    cell_num: usize,
    row: &Row,
) -> Result<(), Error> {
    let node = pager.page_mut(page_num)?;
    let num_cells = node.leaf_num_cells()? as usize;
    for i in (cell_num + 1..=num_cells).rev() {
        let prev = node.leaf_cell(i - 1)?.to_vec();
        node.leaf_cell_mut(i)?.copy_from_slice(&prev);
    }
    node.set_leaf_key(cell_num, row.id)?;
    row.serialize(node.leaf_value_mut(cell_num)?)?;
    node.set_leaf_num_cells(num_cells as u32 + 1)?;
    Ok(())
}

/// Splits a full leaf around an insertion. The old leaf keeps the lower
/// half of the 14 effective cells, a freshly allocated right sibling
/// takes the upper half, and the sibling chain is rethreaded through it.
fn leaf_split_and_insert(pager: &mut Pager, cursor: &Cursor, row: &Row) -> Result<(), Error> {
    let new_page_num = pager.allocate_page()?;
    let old = pager.page(cursor.page_num)?.clone();
    let old_max = old.leaf_max_key()?;
    let parent_page = old.parent()?;

    {
        let new_node = pager.page_mut(new_page_num)?;
        new_node.init_leaf();
        new_node.set_parent(parent_page)?;
        // The old leaf's successor becomes the new leaf's successor,
        // and the new leaf slots in right after the old one.
        new_node.set_next_leaf(old.next_leaf()?)?;
    }

    // Divide existing cells plus the new one evenly, moving each to its
    // final slot starting from the right.
    for i in (0..=LEAF_MAX_CELLS).rev() {
        let dest_page = if i >= LEAF_LEFT_SPLIT_COUNT {
            new_page_num
        } else {
            cursor.page_num
        };
        let dest_cell = i % LEAF_LEFT_SPLIT_COUNT;
        let dest_node = pager.page_mut(dest_page)?;
        if i == cursor.cell_num as usize {
            dest_node.set_leaf_key(dest_cell, row.id)?;
            row.serialize(dest_node.leaf_value_mut(dest_cell)?)?;
        } else if i > cursor.cell_num as usize {
            dest_node
                .leaf_cell_mut(dest_cell)?
                .copy_from_slice(old.leaf_cell(i - 1)?);
        } else {
            dest_node
                .leaf_cell_mut(dest_cell)?
                .copy_from_slice(old.leaf_cell(i)?);
        }
    }
    {
        let old_node = pager.page_mut(cursor.page_num)?;
        old_node.set_leaf_num_cells(LEAF_LEFT_SPLIT_COUNT as u32)?;
        old_node.set_next_leaf(new_page_num)?;
    }
    pager
        .page_mut(new_page_num)?
        .set_leaf_num_cells(LEAF_RIGHT_SPLIT_COUNT as u32)?;
    debug!(
        left = cursor.page_num,
        right = new_page_num,
        "split leaf"
    );

    if pager.page(cursor.page_num)?.is_root() {
        create_new_root(pager, cursor.page_num, new_page_num)
    } else {
        let new_left_max = pager.page(cursor.page_num)?.leaf_max_key()?;
        update_internal_key(pager, parent_page, old_max, new_left_max)?;
        internal_insert(pager, parent_page, new_page_num)
    }
}

/// Installs a freshly allocated root above a split. The old root keeps
/// its page and becomes the left child; the file header follows the
/// root to its new page.
fn create_new_root(pager: &mut Pager, left_page: u32, right_page: u32) -> Result<(), Error> {
    let new_root_page = pager.allocate_page()?;
    let left_max = max_key(pager, left_page)?;
    {
        let root = pager.page_mut(new_root_page)?;
        root.init_internal();
        root.set_root(true);
        root.set_internal_num_keys(1)?;
        root.set_internal_child(0, left_page)?;
        root.set_internal_key(0, left_max)?;
        root.set_internal_right_child(right_page)?;
    }
    {
        let left = pager.page_mut(left_page)?;
        left.set_root(false);
        left.set_parent(new_root_page)?;
    }
    {
        let right = pager.page_mut(right_page)?;
        right.set_root(false);
        right.set_parent(new_root_page)?;
    }
    pager.set_root_page(new_root_page);
    debug!(
        root = new_root_page,
        left = left_page,
        right = right_page,
        "created new root"
    );
    Ok(())
}

/// Replaces the separator currently equal to `old_key` with `new_key`.
/// A max carried by the right child has no separator; that case is a
/// no-op here and handled by the caller's insert.
fn update_internal_key(
    pager: &mut Pager,
    page_num: u32,
    old_key: u32,
    new_key: u32,
) -> Result<(), Error> {
    let node = pager.page_mut(page_num)?;
    let index = node.internal_find_child(old_key)?;
    if index < node.internal_num_keys()? as usize {
        node.set_internal_key(index, new_key)?;
    }
    Ok(())
}

/// Adds `(child, max_key(child))` to a parent, splitting the parent if
/// it is already at capacity. A child whose max exceeds the current
/// right child's max becomes the new right child, and the previous
/// right child takes the last separator slot.
fn internal_insert(pager: &mut Pager, parent_page: u32, child_page: u32) -> Result<(), Error> {
    let child_max = max_key(pager, child_page)?;
    let num_keys = pager.page(parent_page)?.internal_num_keys()? as usize;
    if num_keys >= INTERNAL_MAX_KEYS {
        debug!(page = parent_page, "internal node full, splitting");
        return internal_split_and_insert(pager, parent_page, child_page);
    }
    let right_child_page = pager.page(parent_page)?.internal_right_child()?;
    let right_max = max_key(pager, right_child_page)?;
    if child_max > right_max {
        let parent = pager.page_mut(parent_page)?;
        parent.set_internal_child(num_keys, right_child_page)?;
        parent.set_internal_key(num_keys, right_max)?;
        parent.set_internal_right_child(child_page)?;
        parent.set_internal_num_keys(num_keys as u32 + 1)?;
    } else {
        let index = pager.page(parent_page)?.internal_find_child(child_max)?;
        let parent = pager.page_mut(parent_page)?;
        for i in (index + 1..=num_keys).rev() {
            let prev = parent.internal_cell(i - 1)?.to_vec();
            parent.internal_cell_mut(i)?.copy_from_slice(&prev);
        }
        parent.set_internal_child(index, child_page)?;
        parent.set_internal_key(index, child_max)?;
        parent.set_internal_num_keys(num_keys as u32 + 1)?;
    }
    pager.page_mut(child_page)?.set_parent(parent_page)?;
    Ok(())
}

/// Splits a full internal node: gather all 511 children plus the new
/// one in key order, keep the lower half in place, move the upper half
/// to a fresh right node, and promote the median separator to the
/// grandparent. Every moved child is reparented.
fn internal_split_and_insert(
    pager: &mut Pager,
    page_num: u32,
    child_page: u32,
) -> Result<(), Error> {
    let child_max = max_key(pager, child_page)?;
    let old_max = max_key(pager, page_num)?;
    let (splitting_root, parent_page) = {
        let node = pager.page(page_num)?;
        (node.is_root(), node.parent()?)
    };

    let mut entries: Vec<(u32, u32)> = Vec::with_capacity(INTERNAL_MAX_KEYS + 2);
    {
        let node = pager.page(page_num)?;
        let num_keys = node.internal_num_keys()? as usize;
        for i in 0..num_keys {
            entries.push((node.internal_child(i)?, node.internal_key(i)?));
        }
        entries.push((node.internal_right_child()?, old_max));
    }
    let pos = entries.partition_point(|&(_, key)| key < child_max);
    entries.insert(pos, (child_page, child_max));

    let split = entries.len() / 2;
    let (left_entries, right_entries) = entries.split_at(split);
    let new_left_max = left_entries[left_entries.len() - 1].1;

    {
        let node = pager.page_mut(page_num)?;
        let n_left = left_entries.len() - 1;
        node.set_internal_num_keys(n_left as u32)?;
        for (i, &(child, key)) in left_entries[..n_left].iter().enumerate() {
            node.set_internal_child(i, child)?;
            node.set_internal_key(i, key)?;
        }
        node.set_internal_right_child(left_entries[n_left].0)?;
    }
    let new_page_num = pager.allocate_page()?;
    {
        let node = pager.page_mut(new_page_num)?;
        node.init_internal();
        node.set_parent(parent_page)?;
        let n_right = right_entries.len() - 1;
        node.set_internal_num_keys(n_right as u32)?;
        for (i, &(child, key)) in right_entries[..n_right].iter().enumerate() {
            node.set_internal_child(i, child)?;
            node.set_internal_key(i, key)?;
        }
        node.set_internal_right_child(right_entries[n_right].0)?;
    }
    for &(child, _) in right_entries {
        pager.page_mut(child)?.set_parent(new_page_num)?;
    }
    debug!(
        left = page_num,
        right = new_page_num,
        promoted = new_left_max,
        "split internal node"
    );

    if splitting_root {
        create_new_root(pager, page_num, new_page_num)
    } else {
        update_internal_key(pager, parent_page, old_max, new_left_max)?;
        internal_insert(pager, parent_page, new_page_num)
    }
}

/// Index of `page_num` in its parent's child array; `num_keys` means
/// the right child.
fn find_child_index(parent: &Node, page_num: u32) -> Result<usize, Error> {
    let num_keys = parent.internal_num_keys()? as usize;
    for i in 0..=num_keys {
        if parent.internal_child(i)? == page_num {
            return Ok(i);
        }
    }
    Err(err!(Corrupt, "page {} not listed in its parent", page_num))
}

/// Walks the separator chain above `page_num` after its subtree max
/// shrank, rewriting each stale separator. Stops at the first node that
/// is not a right child, since separators further up are unaffected.
fn repair_max_upward(pager: &mut Pager, page_num: u32) -> Result<(), Error> {
    let mut current = page_num;
    loop {
        let node = pager.page(current)?;
        if node.is_root() {
            return Ok(());
        }
        let parent_page = node.parent()?;
        let current_max = max_key(pager, current)?;
        let parent = pager.page(parent_page)?;
        let index = find_child_index(parent, current)?;
        if index < parent.internal_num_keys()? as usize {
            pager
                .page_mut(parent_page)?
                .set_internal_key(index, current_max)?;
            return Ok(());
        }
        current = parent_page;
    }
}

/// Restores minimum fill on a leaf: borrow from a sibling with cells to
/// spare, else merge (the left node of the pair keeps its identity).
fn leaf_underflow(pager: &mut Pager, page_num: u32) -> Result<(), Error> {
    let parent_page = pager.page(page_num)?.parent()?;
    let (child_index, num_keys) = {
        let parent = pager.page(parent_page)?;
        (
            find_child_index(parent, page_num)?,
            parent.internal_num_keys()? as usize,
        )
    };
    let right_sibling = if child_index < num_keys {
        Some(pager.page(parent_page)?.internal_child(child_index + 1)?)
    } else {
        None
    };
    let left_sibling = if child_index > 0 {
        Some(pager.page(parent_page)?.internal_child(child_index - 1)?)
    } else {
        None
    };

    if let Some(right) = right_sibling {
        if pager.page(right)?.leaf_num_cells()? as usize > LEAF_MIN_CELLS {
            return leaf_borrow_from_right(pager, page_num, right, parent_page, child_index);
        }
    }
    if let Some(left) = left_sibling {
        if pager.page(left)?.leaf_num_cells()? as usize > LEAF_MIN_CELLS {
            return leaf_borrow_from_left(pager, page_num, left, parent_page, child_index);
        }
    }
    if let Some(left) = left_sibling {
        leaf_merge(pager, left, page_num, parent_page, child_index)
    } else if let Some(right) = right_sibling {
        leaf_merge(pager, page_num, right, parent_page, child_index + 1)
    } else {
        Err(err!(
            Corrupt,
            "leaf {} underflowed with no siblings under its parent",
            page_num
        ))
    }
}

/// Moves the right sibling's first cell to the end of the underflowing
/// leaf and points the leaf's separator at its new max.
fn leaf_borrow_from_right(
    pager: &mut Pager,
    page_num: u32,
    right_page: u32,
    parent_page: u32,
    child_index: usize,
) -> Result<(), Error> {
    let first = pager.page(right_page)?.leaf_cell(0)?.to_vec();
    {
        let node = pager.page_mut(page_num)?;
        let num_cells = node.leaf_num_cells()? as usize;
        node.leaf_cell_mut(num_cells)?.copy_from_slice(&first);
        node.set_leaf_num_cells(num_cells as u32 + 1)?;
    }
    {
        let right = pager.page_mut(right_page)?;
        let num_cells = right.leaf_num_cells()? as usize;
        for i in 0..num_cells - 1 {
            let next = right.leaf_cell(i + 1)?.to_vec();
            right.leaf_cell_mut(i)?.copy_from_slice(&next);
        }
        right.set_leaf_num_cells(num_cells as u32 - 1)?;
    }
    let new_max = pager.page(page_num)?.leaf_max_key()?;
    pager
        .page_mut(parent_page)?
        .set_internal_key(child_index, new_max)?;
    debug!(page = page_num, from = right_page, "borrowed cell from right sibling");
    Ok(())
}

/// Symmetric to [`leaf_borrow_from_right`]: prepends the left sibling's
/// last cell and points the left sibling's separator at its new max.
fn leaf_borrow_from_left(
    pager: &mut Pager,
    page_num: u32,
    left_page: u32,
    parent_page: u32,
    child_index: usize,
) -> Result<(), Error> {
    let last = {
        let left = pager.page(left_page)?;
        let num_cells = left.leaf_num_cells()? as usize;
        left.leaf_cell(num_cells - 1)?.to_vec()
    };
    {
        let left = pager.page_mut(left_page)?;
        let num_cells = left.leaf_num_cells()?;
        left.set_leaf_num_cells(num_cells - 1)?;
    }
    {
        let node = pager.page_mut(page_num)?;
        let num_cells = node.leaf_num_cells()? as usize;
        for i in (1..=num_cells).rev() {
            let prev = node.leaf_cell(i - 1)?.to_vec();
            node.leaf_cell_mut(i)?.copy_from_slice(&prev);
        }
        node.leaf_cell_mut(0)?.copy_from_slice(&last);
        node.set_leaf_num_cells(num_cells as u32 + 1)?;
    }
    let left_max = pager.page(left_page)?.leaf_max_key()?;
    pager
        .page_mut(parent_page)?
        .set_internal_key(child_index - 1, left_max)?;
    debug!(page = page_num, from = left_page, "borrowed cell from left sibling");
    Ok(())
}

/// Folds `right_page` into `left_page`, rethreads the sibling chain,
/// frees the absorbed page, and removes its entry from the parent.
/// Borrowing can leave the combined range non-monotonic at the
/// boundary, so the merged cells are re-sorted (O(n log n)).
fn leaf_merge(
    pager: &mut Pager,
    left_page: u32,
    right_page: u32,
    parent_page: u32,
    removed_index: usize,
) -> Result<(), Error> {
    let mut cells: Vec<(u32, Vec<u8>)> = Vec::new();
    {
        let left = pager.page(left_page)?;
        for i in 0..left.leaf_num_cells()? as usize {
            cells.push((left.leaf_key(i)?, left.leaf_cell(i)?.to_vec()));
        }
    }
    let right_next = {
        let right = pager.page(right_page)?;
        for i in 0..right.leaf_num_cells()? as usize {
            cells.push((right.leaf_key(i)?, right.leaf_cell(i)?.to_vec()));
        }
        right.next_leaf()?
    };
    if cells.len() > LEAF_MAX_CELLS {
        return Err(err!(
            Corrupt,
            "merging leaves {} and {} would overflow ({} cells)",
            left_page,
            right_page,
            cells.len()
        ));
    }
    cells.sort_unstable_by_key(|&(key, _)| key);
    {
        let left = pager.page_mut(left_page)?;
        for (i, (_, cell)) in cells.iter().enumerate() {
            left.leaf_cell_mut(i)?.copy_from_slice(cell);
        }
        left.set_leaf_num_cells(cells.len() as u32)?;
        left.set_next_leaf(right_next)?;
    }
    pager.free_page(right_page)?;
    debug!(left = left_page, freed = right_page, "merged leaves");
    internal_remove_child(pager, parent_page, removed_index)
}

/// Drops the child entry at `removed_index` from an internal node after
/// a merge, recomputes every surviving separator from its child's
/// actual max, and rebalances upward. Shifting separators blindly here
/// is how stale parent keys were historically introduced.
fn internal_remove_child(
    pager: &mut Pager,
    page_num: u32,
    removed_index: usize,
) -> Result<(), Error> {
    {
        let node = pager.page_mut(page_num)?;
        let num_keys = node.internal_num_keys()? as usize;
        if removed_index == num_keys {
            let new_right = node.internal_child(num_keys - 1)?;
            node.set_internal_right_child(new_right)?;
        } else {
            for i in removed_index..num_keys - 1 {
                let next = node.internal_cell(i + 1)?.to_vec();
                node.internal_cell_mut(i)?.copy_from_slice(&next);
            }
        }
        node.set_internal_num_keys(num_keys as u32 - 1)?;
    }
    repair_separators(pager, page_num)?;

    let (is_root, num_keys) = {
        let node = pager.page(page_num)?;
        (node.is_root(), node.internal_num_keys()? as usize)
    };
    if is_root {
        if num_keys == 0 {
            collapse_root(pager)?;
        }
        return Ok(());
    }
    if num_keys < INTERNAL_MIN_KEYS {
        internal_underflow(pager, page_num)?;
    }
    Ok(())
}

/// Rewrites every separator of `page_num` as the actual max key of the
/// child to its left.
fn repair_separators(pager: &mut Pager, page_num: u32) -> Result<(), Error> {
    let num_keys = pager.page(page_num)?.internal_num_keys()? as usize;
    for i in 0..num_keys {
        let child = pager.page(page_num)?.internal_child(i)?;
        let child_max = max_key(pager, child)?;
        pager.page_mut(page_num)?.set_internal_key(i, child_max)?;
    }
    Ok(())
}

/// Mirror of [`leaf_underflow`] over `(child, key)` pairs.
fn internal_underflow(pager: &mut Pager, page_num: u32) -> Result<(), Error> {
    let parent_page = pager.page(page_num)?.parent()?;
    let (child_index, num_keys) = {
        let parent = pager.page(parent_page)?;
        (
            find_child_index(parent, page_num)?,
            parent.internal_num_keys()? as usize,
        )
    };
    let right_sibling = if child_index < num_keys {
        Some(pager.page(parent_page)?.internal_child(child_index + 1)?)
    } else {
        None
    };
    let left_sibling = if child_index > 0 {
        Some(pager.page(parent_page)?.internal_child(child_index - 1)?)
    } else {
        None
    };

    if let Some(right) = right_sibling {
        if pager.page(right)?.internal_num_keys()? as usize > INTERNAL_MIN_KEYS {
            return internal_borrow_from_right(pager, page_num, right, parent_page, child_index);
        }
    }
    if let Some(left) = left_sibling {
        if pager.page(left)?.internal_num_keys()? as usize > INTERNAL_MIN_KEYS {
            return internal_borrow_from_left(pager, page_num, left, parent_page, child_index);
        }
    }
    if let Some(left) = left_sibling {
        internal_merge(pager, left, page_num, parent_page, child_index)
    } else if let Some(right) = right_sibling {
        internal_merge(pager, page_num, right, parent_page, child_index + 1)
    } else {
        Err(err!(
            Corrupt,
            "internal node {} underflowed with no siblings under its parent",
            page_num
        ))
    }
}

/// Rotation through the parent: the underflowing node gains its old
/// right child as a cell under the parent's separator, adopts the right
/// sibling's first child, and the separator advances to that child's
/// max.
fn internal_borrow_from_right(
    pager: &mut Pager,
    page_num: u32,
    right_page: u32,
    parent_page: u32,
    child_index: usize,
) -> Result<(), Error> {
    let separator = pager.page(parent_page)?.internal_key(child_index)?;
    let (moved_child, moved_key) = {
        let right = pager.page(right_page)?;
        (right.internal_child(0)?, right.internal_key(0)?)
    };
    {
        let node = pager.page_mut(page_num)?;
        let num_keys = node.internal_num_keys()? as usize;
        let old_right = node.internal_right_child()?;
        node.set_internal_child(num_keys, old_right)?;
        node.set_internal_key(num_keys, separator)?;
        node.set_internal_right_child(moved_child)?;
        node.set_internal_num_keys(num_keys as u32 + 1)?;
    }
    {
        let right = pager.page_mut(right_page)?;
        let num_keys = right.internal_num_keys()? as usize;
        for i in 0..num_keys - 1 {
            let next = right.internal_cell(i + 1)?.to_vec();
            right.internal_cell_mut(i)?.copy_from_slice(&next);
        }
        right.set_internal_num_keys(num_keys as u32 - 1)?;
    }
    pager.page_mut(moved_child)?.set_parent(page_num)?;
    pager
        .page_mut(parent_page)?
        .set_internal_key(child_index, moved_key)?;
    debug!(page = page_num, from = right_page, "borrowed child from right sibling");
    Ok(())
}

/// Symmetric rotation: adopts the left sibling's right child under the
/// parent's separator, and the separator falls back to the left
/// sibling's new max.
fn internal_borrow_from_left(
    pager: &mut Pager,
    page_num: u32,
    left_page: u32,
    parent_page: u32,
    child_index: usize,
) -> Result<(), Error> {
    let separator = pager.page(parent_page)?.internal_key(child_index - 1)?;
    let (moved_child, new_left_max) = {
        let left = pager.page(left_page)?;
        let num_keys = left.internal_num_keys()? as usize;
        (left.internal_right_child()?, left.internal_key(num_keys - 1)?)
    };
    {
        let left = pager.page_mut(left_page)?;
        let num_keys = left.internal_num_keys()? as usize;
        let new_right = left.internal_child(num_keys - 1)?;
        left.set_internal_right_child(new_right)?;
        left.set_internal_num_keys(num_keys as u32 - 1)?;
    }
    {
        let node = pager.page_mut(page_num)?;
        let num_keys = node.internal_num_keys()? as usize;
        for i in (1..=num_keys).rev() {
            let prev = node.internal_cell(i - 1)?.to_vec();
            node.internal_cell_mut(i)?.copy_from_slice(&prev);
        }
        node.set_internal_child(0, moved_child)?;
        node.set_internal_key(0, separator)?;
        node.set_internal_num_keys(num_keys as u32 + 1)?;
    }
    pager.page_mut(moved_child)?.set_parent(page_num)?;
    pager
        .page_mut(parent_page)?
        .set_internal_key(child_index - 1, new_left_max)?;
    debug!(page = page_num, from = left_page, "borrowed child from left sibling");
    Ok(())
}

/// Concatenates two internal siblings, folding in the parent separator
/// between them, reparenting every moved child, and freeing the right
/// node.
fn internal_merge(
    pager: &mut Pager,
    left_page: u32,
    right_page: u32,
    parent_page: u32,
    removed_index: usize,
) -> Result<(), Error> {
    let separator = pager.page(parent_page)?.internal_key(removed_index - 1)?;
    let mut entries: Vec<(u32, u32)> = Vec::new();
    {
        let left = pager.page(left_page)?;
        let num_keys = left.internal_num_keys()? as usize;
        for i in 0..num_keys {
            entries.push((left.internal_child(i)?, left.internal_key(i)?));
        }
        entries.push((left.internal_right_child()?, separator));
    }
    let mut moved: Vec<u32> = Vec::new();
    let right_right = {
        let right = pager.page(right_page)?;
        let num_keys = right.internal_num_keys()? as usize;
        for i in 0..num_keys {
            let child = right.internal_child(i)?;
            entries.push((child, right.internal_key(i)?));
            moved.push(child);
        }
        right.internal_right_child()?
    };
    moved.push(right_right);
    if entries.len() > INTERNAL_MAX_KEYS {
        return Err(err!(
            Corrupt,
            "merging internal nodes {} and {} would overflow ({} keys)",
            left_page,
            right_page,
            entries.len()
        ));
    }
    {
        let left = pager.page_mut(left_page)?;
        left.set_internal_num_keys(entries.len() as u32)?;
        for (i, &(child, key)) in entries.iter().enumerate() {
            left.set_internal_child(i, child)?;
            left.set_internal_key(i, key)?;
        }
        left.set_internal_right_child(right_right)?;
    }
    for child in moved {
        pager.page_mut(child)?.set_parent(left_page)?;
    }
    pager.free_page(right_page)?;
    debug!(left = left_page, freed = right_page, "merged internal nodes");
    internal_remove_child(pager, parent_page, removed_index)
}

/// Promotes the sole remaining child of a keyless root, frees the old
/// root page, and moves the header's root pointer.
fn collapse_root(pager: &mut Pager) -> Result<(), Error> {
    let old_root = pager.root_page();
    let child = pager.page(old_root)?.internal_right_child()?;
    {
        let node = pager.page_mut(child)?;
        node.set_root(true);
        node.set_parent(0)?;
    }
    pager.set_root_page(child);
    pager.free_page(old_root)?;
    debug!(root = child, freed = old_root, "collapsed root");
    Ok(())
}

// Diagnostics

/// Walks the tree and the freelist, reporting the first violated
/// invariant with enough context to locate it. Also checks that
/// reachable pages and free pages partition the file exactly.
pub fn validate(pager: &mut Pager) -> Result<(), Error> {
    let root = pager.root_page();
    let mut reachable: HashSet<u32> = HashSet::new();
    let mut leaves_in_order: Vec<u32> = Vec::new();
    let mut leaf_depth: Option<usize> = None;
    validate_node(
        pager,
        root,
        None,
        0,
        &mut leaf_depth,
        &mut reachable,
        &mut leaves_in_order,
    )?;
    validate_leaf_chain(pager, &leaves_in_order)?;

    pager.validate_freelist()?;
    let free: HashSet<u32> = pager.free_pages().into_iter().collect();
    if free.contains(&0) {
        return Err(err!(Corrupt, "page 0 is on the freelist"));
    }
    if let Some(shared) = reachable.intersection(&free).next() {
        return Err(err!(
            Corrupt,
            "page {} is both reachable and on the freelist",
            shared
        ));
    }
    let accounted = reachable.len() + free.len();
    if accounted != pager.num_pages() as usize {
        return Err(err!(
            Corrupt,
            "{} reachable plus {} free pages do not account for {} total",
            reachable.len(),
            free.len(),
            pager.num_pages()
        ));
    }
    Ok(())
}

fn validate_node(
    pager: &mut Pager,
    page_num: u32,
    expected_parent: Option<u32>,
    depth: usize,
    leaf_depth: &mut Option<usize>,
    reachable: &mut HashSet<u32>,
    leaves_in_order: &mut Vec<u32>,
) -> Result<(), Error> {
    if !reachable.insert(page_num) {
        return Err(err!(Corrupt, "page {} reachable twice", page_num));
    }
    let node = pager.page(page_num)?.clone();
    match expected_parent {
        None => {
            if !node.is_root() {
                return Err(err!(Corrupt, "root page {} lacks the root flag", page_num));
            }
        }
        Some(parent) => {
            if node.is_root() {
                return Err(err!(Corrupt, "non-root page {} carries the root flag", page_num));
            }
            if node.parent()? != parent {
                return Err(err!(
                    Corrupt,
                    "page {} has parent {} but is a child of {}",
                    page_num,
                    node.parent()?,
                    parent
                ));
            }
        }
    }
    match node.node_type()? {
        NodeType::Leaf => {
            let num_cells = node.leaf_num_cells()? as usize;
            if num_cells > LEAF_MAX_CELLS {
                return Err(err!(Corrupt, "leaf {} claims {} cells", page_num, num_cells));
            }
            if expected_parent.is_some() && num_cells < LEAF_MIN_CELLS {
                return Err(err!(
                    Corrupt,
                    "leaf {} below minimum fill ({} cells)",
                    page_num,
                    num_cells
                ));
            }
            for i in 1..num_cells {
                if node.leaf_key(i - 1)? >= node.leaf_key(i)? {
                    return Err(err!(
                        Corrupt,
                        "leaf {} keys not strictly ascending at cell {}",
                        page_num,
                        i
                    ));
                }
            }
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    return Err(err!(
                        Corrupt,
                        "leaf {} at depth {}, expected {}",
                        page_num,
                        depth,
                        expected
                    ));
                }
                Some(_) => {}
            }
            leaves_in_order.push(page_num);
        }
        NodeType::Internal => {
            let num_keys = node.internal_num_keys()? as usize;
            if num_keys > INTERNAL_MAX_KEYS {
                return Err(err!(
                    Corrupt,
                    "internal node {} claims {} keys",
                    page_num,
                    num_keys
                ));
            }
            if num_keys == 0 {
                return Err(err!(Corrupt, "internal node {} has no keys", page_num));
            }
            if expected_parent.is_some() && num_keys < INTERNAL_MIN_KEYS {
                return Err(err!(
                    Corrupt,
                    "internal node {} below minimum fill ({} keys)",
                    page_num,
                    num_keys
                ));
            }
            for i in 1..num_keys {
                if node.internal_key(i - 1)? >= node.internal_key(i)? {
                    return Err(err!(
                        Corrupt,
                        "internal node {} separators not strictly ascending at {}",
                        page_num,
                        i
                    ));
                }
            }
            for i in 0..num_keys {
                let child = node.internal_child(i)?;
                validate_node(
                    pager,
                    child,
                    Some(page_num),
                    depth + 1,
                    leaf_depth,
                    reachable,
                    leaves_in_order,
                )?;
                let child_max = max_key(pager, child)?;
                let separator = node.internal_key(i)?;
                if separator != child_max {
                    return Err(err!(
                        Corrupt,
                        "internal node {} separator {} is {} but child {} max is {}",
                        page_num,
                        i,
                        separator,
                        child,
                        child_max
                    ));
                }
            }
            validate_node(
                pager,
                node.internal_right_child()?,
                Some(page_num),
                depth + 1,
                leaf_depth,
                reachable,
                leaves_in_order,
            )?;
        }
    }
    Ok(())
}

/// The sibling chain must visit exactly the leaves of the in-order
/// traversal, with keys strictly ascending across the whole walk.
fn validate_leaf_chain(pager: &mut Pager, leaves_in_order: &[u32]) -> Result<(), Error> {
    let mut chain: Vec<u32> = Vec::new();
    let mut current = match leaves_in_order.first() {
        Some(&first) => first,
        None => return Ok(()),
    };
    let mut last_key: Option<u32> = None;
    loop {
        chain.push(current);
        if chain.len() > leaves_in_order.len() {
            return Err(err!(Corrupt, "leaf chain longer than the tree's leaf count"));
        }
        let node = pager.page(current)?.clone();
        for i in 0..node.leaf_num_cells()? as usize {
            let key = node.leaf_key(i)?;
            if let Some(last) = last_key {
                if last >= key {
                    return Err(err!(
                        Corrupt,
                        "leaf chain key {} after {} in leaf {}",
                        key,
                        last,
                        current
                    ));
                }
            }
            last_key = Some(key);
        }
        match node.next_leaf()? {
            0 => break,
            next => current = next,
        }
    }
    if chain != leaves_in_order {
        return Err(err!(
            Corrupt,
            "leaf chain {:?} does not match in-order leaves {:?}",
            chain,
            leaves_in_order
        ));
    }
    Ok(())
}

/// Indented dump of the whole tree, one line per node or key.
pub fn dump(pager: &mut Pager) -> Result<String, Error> {
    let mut out = String::new();
    dump_node(pager, pager.root_page(), 0, &mut out)?;
    Ok(out)
}

fn dump_node(
    pager: &mut Pager,
    page_num: u32,
    indent: usize,
    out: &mut String,
) -> Result<(), Error> {
    let node = pager.page(page_num)?.clone();
    let pad = "  ".repeat(indent);
    match node.node_type()? {
        NodeType::Leaf => {
            let num_cells = node.leaf_num_cells()?;
            out.push_str(&format!("{}- leaf {} (size {})\n", pad, page_num, num_cells));
            for i in 0..num_cells as usize {
                out.push_str(&format!("{}  - {}\n", pad, node.leaf_key(i)?));
            }
        }
        NodeType::Internal => {
            let num_keys = node.internal_num_keys()?;
            out.push_str(&format!(
                "{}- internal {} (size {})\n",
                pad, page_num, num_keys
            ));
            for i in 0..num_keys as usize {
                dump_node(pager, node.internal_child(i)?, indent + 1, out)?;
                out.push_str(&format!("{}  - key {}\n", pad, node.internal_key(i)?));
            }
            dump_node(pager, node.internal_right_child()?, indent + 1, out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn open_pager(dir: &TempDir) -> Pager {
        let path: PathBuf = dir.path().join("btree_test.db");
        let mut pager = Pager::open(&path).unwrap();
        let page_num = pager.allocate_page().unwrap();
        let root = pager.page_mut(page_num).unwrap();
        root.init_leaf();
        root.set_root(true);
        pager.set_root_page(page_num);
        pager
    }

    fn row(id: u32) -> Row {
        Row::new(id, &format!("user{}", id), &format!("user{}@example.com", id)).unwrap()
    }

    fn all_keys(pager: &mut Pager) -> Vec<u32> {
        let mut keys = Vec::new();
        let mut cursor = Cursor::start(pager).unwrap();
        while !cursor.end_of_table {
            keys.push(cursor.key(pager).unwrap());
            cursor.advance(pager).unwrap();
        }
        keys
    }

    #[test]
    fn underflow_borrows_from_right_sibling() {
        let dir = TempDir::new().unwrap();
        let mut pager = open_pager(&dir);
        for id in 1..=14 {
            insert(&mut pager, &row(id)).unwrap();
        }
        // Left leaf holds 1..=7; two deletions push it below minimum
        // while the right sibling still has a cell to spare.
        remove(&mut pager, 1).unwrap();
        remove(&mut pager, 2).unwrap();
        validate(&mut pager).unwrap();
        assert_eq!(all_keys(&mut pager), (3..=14).collect::<Vec<_>>());

        let root = pager.page(pager.root_page()).unwrap().clone();
        assert_eq!(root.node_type().unwrap(), NodeType::Internal);
        let left = root.internal_child(0).unwrap();
        assert_eq!(pager.page(left).unwrap().leaf_num_cells().unwrap(), 6);
        // The borrowed cell is key 8, so the separator follows it.
        assert_eq!(root.internal_key(0).unwrap(), 8);
    }

    #[test]
    fn underflow_borrows_from_left_sibling() {
        let dir = TempDir::new().unwrap();
        let mut pager = open_pager(&dir);
        for id in 1..=14 {
            insert(&mut pager, &row(id)).unwrap();
        }
        remove(&mut pager, 14).unwrap();
        remove(&mut pager, 13).unwrap();
        validate(&mut pager).unwrap();
        assert_eq!(all_keys(&mut pager), (1..=12).collect::<Vec<_>>());

        let root = pager.page(pager.root_page()).unwrap().clone();
        let right = root.internal_right_child().unwrap();
        // Key 7 moved across; the separator fell back to 6.
        assert_eq!(pager.page(right).unwrap().leaf_num_cells().unwrap(), 6);
        assert_eq!(root.internal_key(0).unwrap(), 6);
    }

    #[test]
    fn merge_collapses_the_root() {
        let dir = TempDir::new().unwrap();
        let mut pager = open_pager(&dir);
        for id in 1..=14 {
            insert(&mut pager, &row(id)).unwrap();
        }
        // Trim both leaves to minimum, then force the merge.
        remove(&mut pager, 8).unwrap();
        remove(&mut pager, 1).unwrap();
        remove(&mut pager, 2).unwrap();
        validate(&mut pager).unwrap();

        let root = pager.page(pager.root_page()).unwrap().clone();
        assert_eq!(root.node_type().unwrap(), NodeType::Leaf);
        assert!(root.is_root());
        assert_eq!(
            all_keys(&mut pager),
            vec![3, 4, 5, 6, 7, 9, 10, 11, 12, 13, 14]
        );
        // The absorbed leaf and the old root are both reclaimable.
        assert_eq!(pager.free_pages().len(), 2);
    }

    #[test]
    fn deleting_a_leaf_max_repairs_separators() {
        let dir = TempDir::new().unwrap();
        let mut pager = open_pager(&dir);
        for id in 1..=14 {
            insert(&mut pager, &row(id)).unwrap();
        }
        // Key 7 is the left leaf's max and its separator in the root.
        remove(&mut pager, 7).unwrap();
        let root = pager.page(pager.root_page()).unwrap().clone();
        assert_eq!(root.internal_key(0).unwrap(), 6);
        validate(&mut pager).unwrap();
    }

    #[test]
    fn interleaved_inserts_after_split() {
        let dir = TempDir::new().unwrap();
        let mut pager = open_pager(&dir);
        // Odd keys first so later even keys land in existing leaves.
        for id in (1..=27).step_by(2) {
            insert(&mut pager, &row(id)).unwrap();
        }
        for id in (2..=26).step_by(2) {
            insert(&mut pager, &row(id)).unwrap();
        }
        validate(&mut pager).unwrap();
        assert_eq!(all_keys(&mut pager), (1..=27).collect::<Vec<_>>());
    }

    #[test]
    fn deep_tree_grows_and_shrinks() {
        let dir = TempDir::new().unwrap();
        let mut pager = open_pager(&dir);
        // Enough sequential keys to overflow an internal node (511
        // children), forcing an internal split and a three-level tree.
        let total: u32 = 4000;
        for id in 1..=total {
            insert(&mut pager, &row(id)).unwrap();
        }
        validate(&mut pager).unwrap();
        {
            let root = pager.page(pager.root_page()).unwrap().clone();
            assert_eq!(root.node_type().unwrap(), NodeType::Internal);
            let first_child = root.internal_child(0).unwrap();
            assert_eq!(
                pager.page(first_child).unwrap().node_type().unwrap(),
                NodeType::Internal
            );
        }

        // Shrink back through internal borrows, internal merges, and
        // two root collapses.
        for id in 1..=total - 100 {
            remove(&mut pager, id).unwrap();
            if id % 500 == 0 {
                validate(&mut pager).unwrap();
            }
        }
        validate(&mut pager).unwrap();
        assert_eq!(
            all_keys(&mut pager),
            (total - 99..=total).collect::<Vec<_>>()
        );

        // Every page is still either reachable or reclaimable.
        for id in total - 99..=total {
            remove(&mut pager, id).unwrap();
        }
        validate(&mut pager).unwrap();
        assert!(all_keys(&mut pager).is_empty());
        let root = pager.page(pager.root_page()).unwrap().clone();
        assert_eq!(root.node_type().unwrap(), NodeType::Leaf);
    }

    #[test]
    fn absent_keys_report_not_found() {
        let dir = TempDir::new().unwrap();
        let mut pager = open_pager(&dir);
        for id in [2, 4, 6] {
            insert(&mut pager, &row(id)).unwrap();
        }
        assert!(find(&mut pager, 3).unwrap().is_none());
        assert!(matches!(remove(&mut pager, 3), Err(Error::NotFound(3))));
        assert!(matches!(
            update(&mut pager, &row(5)),
            Err(Error::NotFound(5))
        ));
    }
}
