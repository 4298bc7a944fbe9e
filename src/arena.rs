/*
 * Created on Mon Jan 13 2025
 *
 * This file is a part of sfsd, a deadlock-free shared-file coordination
 * service implementing the Resource-Allocation-Graph avoidance algorithm.
 *
 * Copyright (c) 2025, the sfsd authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

/*
 * Bump allocator with a free-list, producing fixed-size Node slots addressed
 * by offset: bump while capacity remains, else pop the free-list; released
 * slots go back onto the free-list head.
 */

use crate::{
    error::{Error, SfsResult},
    node::{NodeKind, NodeOffset},
    region::RegionGuard,
};

/// Allocate a zeroed slot and tag it `kind`. Returns `Error::OutOfArena` once
/// both the free-list and the untouched tail of the Region are exhausted.
pub fn allocate(guard: &mut RegionGuard<'_>, kind: NodeKind) -> SfsResult<NodeOffset> {
    let off = if is_on_free_list(guard) {
        pop_free(guard)
    } else {
        bump(guard)?
    };
    guard.node_mut(off).zero();
    tag(guard, off, kind);
    Ok(off)
}

fn tag(guard: &mut RegionGuard<'_>, off: NodeOffset, kind: NodeKind) {
    let node = guard.node_mut(off);
    match kind {
        NodeKind::Process => node.init_process(crate::node::Pid(0)),
        NodeKind::Resource => node.init_resource("").expect("empty placeholder name always fits"),
        NodeKind::ListCell => node.init_list_cell(NodeOffset::NIL),
        NodeKind::Free => unreachable!("allocate() never produces a Free-tagged slot"),
    }
}

fn is_on_free_list(guard: &RegionGuard<'_>) -> bool {
    let head = guard.header_open_nodes();
    !head.is_nil() && guard.node(head).kind() == NodeKind::Free
}

fn pop_free(guard: &mut RegionGuard<'_>) -> NodeOffset {
    let head = guard.header_open_nodes();
    let next = guard.node(head).next();
    guard.set_header_open_nodes(next);
    head
}

fn bump(guard: &mut RegionGuard<'_>) -> SfsResult<NodeOffset> {
    let next_free = guard.header_next_free();
    if next_free as usize >= guard.region().capacity() {
        return Err(Error::OutOfArena);
    }
    guard.set_header_next_free(next_free + 1);
    Ok(NodeOffset(next_free))
}

/// Return `off` to the free-list. The caller must have already unlinked it
/// from every chain it participated in (processes/resources/out_edges).
pub fn release(guard: &mut RegionGuard<'_>, off: NodeOffset) {
    let head = guard.header_open_nodes();
    let node = guard.node_mut(off);
    node.zero();
    node.set_next(head);
    guard.set_header_open_nodes(off);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    #[test]
    fn allocate_then_release_reuses_slot() {
        let heap = HeapRegion::new(64 * 1024);
        let handle = heap.handle();
        handle.ensure_initialized().unwrap();
        let mut guard = handle.lock().unwrap();

        let a = allocate(&mut guard, NodeKind::ListCell).unwrap();
        let b = allocate(&mut guard, NodeKind::ListCell).unwrap();
        assert_ne!(a, b);

        release(&mut guard, a);
        let c = allocate(&mut guard, NodeKind::ListCell).unwrap();
        assert_eq!(a, c, "freed slot should be reused before bumping further");
    }

    #[test]
    fn exhausts_with_out_of_arena() {
        let heap = HeapRegion::new(crate::region::MIN_REGION_BYTES);
        let handle = heap.handle();
        handle.ensure_initialized().unwrap();
        let mut guard = handle.lock().unwrap();
        assert_eq!(handle.capacity(), 1);

        allocate(&mut guard, NodeKind::ListCell).unwrap();
        let err = allocate(&mut guard, NodeKind::ListCell).unwrap_err();
        assert!(matches!(err, Error::OutOfArena));
    }
}
