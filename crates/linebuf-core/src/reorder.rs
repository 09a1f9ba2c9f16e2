//! Drag-and-drop reordering
//!
//! Moving a row is a pure position change: the row content is untouched and
//! the dirtiness index sets are remapped so they keep pointing at the same
//! rows. All index arithmetic lives in `remap_index`.

use std::collections::BTreeSet;

/// New position of the element that was at `k` after moving `old_index` to `new_index`.
///
/// Array-move semantics: the element is removed at `old_index` and inserted at
/// `new_index`, shifting everything in between by one.
pub fn remap_index(old_index: usize, new_index: usize, k: usize) -> usize {
    if k == old_index {
        new_index
    } else if old_index < new_index && old_index < k && k <= new_index {
        k - 1
    } else if old_index > new_index && new_index <= k && k < old_index {
        k + 1
    } else {
        k
    }
}

/// Remap every tracked index of a dirtiness set
pub fn remap_set(set: &BTreeSet<usize>, old_index: usize, new_index: usize) -> BTreeSet<usize> {
    set.iter()
        .map(|&k| remap_index(old_index, new_index, k))
        .collect()
}

/// Move an element in place. Both indices must be in bounds.
pub fn move_element<T>(items: &mut Vec<T>, old_index: usize, new_index: usize) {
    if old_index == new_index {
        return;
    }
    let item = items.remove(old_index);
    items.insert(new_index, item);
}
