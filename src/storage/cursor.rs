//! Cursor-based navigation over the leaf chain.
//!
//! A cursor is a plain `(page, cell)` position plus an end marker; it
//! borrows nothing, so callers pass the pager into every move. Scans
//! walk the leaf sibling chain instead of re-descending from the root.

use crate::errors::Error;
use crate::storage::node::NodeType;
use crate::storage::pager::Pager;
use crate::storage::row::Row;

pub struct Cursor {
    /// Leaf page the cursor points into.
    pub page_num: u32,
    /// Cell within that leaf.
    pub cell_num: u32,
    /// One past the last cell of the last leaf.
    pub end_of_table: bool,
}

impl Cursor {
    /// Positions at the first cell of the leftmost leaf.
    pub fn start(pager: &mut Pager) -> Result<Self, Error> {
        let mut page_num = pager.root_page();
        loop {
            let node = pager.page(page_num)?;
            match node.node_type()? {
                NodeType::Leaf => break,
                NodeType::Internal => page_num = node.internal_child(0)?,
            }
        }
        let num_cells = pager.page(page_num)?.leaf_num_cells()?;
        Ok(Cursor {
            page_num,
            cell_num: 0,
            end_of_table: num_cells == 0,
        })
    }

    /// Descends from the root to the leaf that holds `key`, or to the
    /// position where `key` would be inserted. Internal levels pick the
    /// least separator that is `>= key`; the leaf level binary-searches
    /// its cells.
    pub fn find(pager: &mut Pager, key: u32) -> Result<Self, Error> {
        let mut page_num = pager.root_page();
        loop {
            let node = pager.page(page_num)?;
            match node.node_type()? {
                NodeType::Leaf => return Self::leaf_find(pager, page_num, key),
                NodeType::Internal => {
                    let child_index = node.internal_find_child(key)?;
                    page_num = node.internal_child(child_index)?;
                }
            }
        }
    }

    fn leaf_find(pager: &mut Pager, page_num: u32, key: u32) -> Result<Self, Error> {
        let node = pager.page(page_num)?;
        let mut min_index = 0u32;
        let mut one_past_max_index = node.leaf_num_cells()?;
        while one_past_max_index != min_index {
            let index = (min_index + one_past_max_index) / 2;
            let key_at_index = node.leaf_key(index as usize)?;
            if key == key_at_index {
                min_index = index;
                break;
            }
            if key < key_at_index {
                one_past_max_index = index;
            } else {
                min_index = index + 1;
            }
        }
        Ok(Cursor {
            page_num,
            cell_num: min_index,
            end_of_table: false,
        })
    }

    /// True when the cursor sits on a cell holding exactly `key`.
    pub fn points_at(&self, pager: &mut Pager, key: u32) -> Result<bool, Error> {
        if self.end_of_table {
            return Ok(false);
        }
        let node = pager.page(self.page_num)?;
        if self.cell_num >= node.leaf_num_cells()? {
            return Ok(false);
        }
        Ok(node.leaf_key(self.cell_num as usize)? == key)
    }

    /// Steps to the next cell, following the sibling chain across leaf
    /// boundaries.
    pub fn advance(&mut self, pager: &mut Pager) -> Result<(), Error> {
        let node = pager.page(self.page_num)?;
        self.cell_num += 1;
        if self.cell_num >= node.leaf_num_cells()? {
            let next = node.next_leaf()?;
            if next == 0 {
                self.end_of_table = true;
            } else {
                self.page_num = next;
                self.cell_num = 0;
                if pager.page(next)?.leaf_num_cells()? == 0 {
                    self.end_of_table = true;
                }
            }
        }
        Ok(())
    }

    pub fn key(&self, pager: &mut Pager) -> Result<u32, Error> {
        pager.page(self.page_num)?.leaf_key(self.cell_num as usize)
    }

    pub fn read_row(&self, pager: &mut Pager) -> Result<Row, Error> {
        let node = pager.page(self.page_num)?;
        Row::deserialize(node.leaf_value(self.cell_num as usize)?)
    }
}
