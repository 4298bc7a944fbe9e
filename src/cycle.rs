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
 * Iterative three-colour DFS over the bipartite Process/Resource graph,
 * answering "would adding this edge create a cycle" before the edge is
 * committed. Written iteratively with an explicit stack, not recursion,
 * since the graph can be as large as the Region's node capacity and an
 * unbounded recursive DFS would be unsound.
 */

use crate::{
    graph,
    node::{NodeOffset, VisitState},
    region::RegionGuard,
};

/// `true` if a path exists from `start` back to `start` using only
/// out-edges, i.e. the graph (with any edges the caller has already added)
/// contains a cycle reachable from `start`. Resets every node's
/// `visit_state` scratch field to `Unvisited` before running, and leaves
/// every node `Processed` on return (cheap: bounded by the node count).
pub fn reachable_cycle_from(guard: &mut RegionGuard<'_>, start: NodeOffset) -> bool {
    reset_visit_states(guard);
    let mut stack: Vec<(NodeOffset, usize)> = vec![(start, 0)];
    set_state(guard, start, VisitState::Visited);

    while let Some((node, next_child_idx)) = stack.pop() {
        let children = graph::out_edges(guard, node);
        if next_child_idx >= children.len() {
            set_state(guard, node, VisitState::Processed);
            continue;
        }
        // resume this frame at the next child once its subtree is done
        stack.push((node, next_child_idx + 1));

        let child = children[next_child_idx];
        match state(guard, child) {
            VisitState::Unvisited => {
                set_state(guard, child, VisitState::Visited);
                stack.push((child, 0));
            }
            VisitState::Visited => {
                // a back-edge to a node still on the current DFS path: cycle
                return true;
            }
            VisitState::Processed => {
                // cross-edge to an already-fully-explored subtree: no cycle here
            }
        }
    }
    false
}

fn state(guard: &RegionGuard<'_>, off: NodeOffset) -> VisitState {
    guard.node(off).visit_state()
}

fn set_state(guard: &mut RegionGuard<'_>, off: NodeOffset, s: VisitState) {
    guard.node_mut(off).set_visit_state(s);
}

fn reset_visit_states(guard: &mut RegionGuard<'_>) {
    let mut cur = guard.header_processes();
    while !cur.is_nil() {
        set_state(guard, cur, VisitState::Unvisited);
        cur = guard.node(cur).next();
    }
    let mut cur = guard.header_resources();
    while !cur.is_nil() {
        set_state(guard, cur, VisitState::Unvisited);
        cur = guard.node(cur).next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::{add_edge, create_process, ensure_resource},
        node::Pid,
        region::HeapRegion,
    };

    #[test]
    fn no_cycle_in_simple_wait_chain() {
        let heap = HeapRegion::new(64 * 1024);
        heap.handle().ensure_initialized().unwrap();
        let handle = heap.handle();
        let mut guard = handle.lock().unwrap();

        let p1 = create_process(&mut guard, Pid(1)).unwrap();
        let r1 = ensure_resource(&mut guard, "/tmp/a").unwrap();
        let p2 = create_process(&mut guard, Pid(2)).unwrap();

        // p1 -> r1 (claim), r1 -> p2 (assignment: p2 holds r1)
        add_edge(&mut guard, p1, r1).unwrap();
        add_edge(&mut guard, r1, p2).unwrap();

        assert!(!reachable_cycle_from(&mut guard, p1));
    }

    #[test]
    fn detects_two_process_deadlock() {
        let heap = HeapRegion::new(64 * 1024);
        heap.handle().ensure_initialized().unwrap();
        let handle = heap.handle();
        let mut guard = handle.lock().unwrap();

        let p1 = create_process(&mut guard, Pid(1)).unwrap();
        let p2 = create_process(&mut guard, Pid(2)).unwrap();
        let r1 = ensure_resource(&mut guard, "/tmp/a").unwrap();
        let r2 = ensure_resource(&mut guard, "/tmp/b").unwrap();

        // p1 holds r1, wants r2; p2 holds r2, wants r1
        add_edge(&mut guard, r1, p1).unwrap();
        add_edge(&mut guard, r2, p2).unwrap();
        add_edge(&mut guard, p1, r2).unwrap();
        add_edge(&mut guard, p2, r1).unwrap();

        assert!(reachable_cycle_from(&mut guard, p1));
    }
}
