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
 * Process/resource lookup, edge insertion and removal over the arena-backed
 * linked chains, and the scans `leave` and `release` need over them.
 */

use crate::{
    arena,
    error::{Error, SfsResult},
    node::{FileHandle, NodeKind, NodeOffset, Pid},
    region::RegionGuard,
};

pub fn find_process(guard: &RegionGuard<'_>, pid: Pid) -> Option<NodeOffset> {
    walk(guard, guard.header_processes(), |off| guard.node(off).pid() == pid)
}

pub fn find_resource_by_name(guard: &RegionGuard<'_>, name: &str) -> Option<NodeOffset> {
    walk(guard, guard.header_resources(), |off| {
        guard.node(off).name() == name.as_bytes()
    })
}

pub fn find_resource_by_handle(guard: &RegionGuard<'_>, handle: FileHandle) -> Option<NodeOffset> {
    walk(guard, guard.header_resources(), |off| {
        guard.node(off).file_handle() == handle
    })
}

fn walk(
    guard: &RegionGuard<'_>,
    mut cur: NodeOffset,
    pred: impl Fn(NodeOffset) -> bool,
) -> Option<NodeOffset> {
    while !cur.is_nil() {
        if pred(cur) {
            return Some(cur);
        }
        cur = guard.node(cur).next();
    }
    None
}

/// Allocate a Process node for `pid` and link it onto the head of the
/// processes chain. Caller must already have checked `find_process` is `None`.
pub fn create_process(guard: &mut RegionGuard<'_>, pid: Pid) -> SfsResult<NodeOffset> {
    let off = arena::allocate(guard, NodeKind::Process)?;
    guard.node_mut(off).init_process(pid);
    let head = guard.header_processes();
    guard.node_mut(off).set_next(head);
    guard.set_header_processes(off);
    Ok(off)
}

/// Find the Resource node for `name`, creating and chaining it in if absent.
pub fn ensure_resource(guard: &mut RegionGuard<'_>, name: &str) -> SfsResult<NodeOffset> {
    if let Some(off) = find_resource_by_name(guard, name) {
        return Ok(off);
    }
    let off = arena::allocate(guard, NodeKind::Resource)?;
    if let Err(e) = guard.node_mut(off).init_resource(name) {
        arena::release(guard, off);
        return Err(e);
    }
    let head = guard.header_resources();
    guard.node_mut(off).set_next(head);
    guard.set_header_resources(off);
    Ok(off)
}

/// Insert a directed edge `from -> to` by prepending a ListCell onto
/// `from`'s out_edges chain. No-op if the edge already exists.
pub fn add_edge(guard: &mut RegionGuard<'_>, from: NodeOffset, to: NodeOffset) -> SfsResult<()> {
    if has_edge(guard, from, to) {
        return Ok(());
    }
    let cell = arena::allocate(guard, NodeKind::ListCell)?;
    guard.node_mut(cell).init_list_cell(to);
    let head = guard.node(from).out_edges();
    guard.node_mut(cell).set_next(head);
    guard.node_mut(from).set_out_edges(cell);
    Ok(())
}

pub fn has_edge(guard: &RegionGuard<'_>, from: NodeOffset, to: NodeOffset) -> bool {
    walk(guard, guard.node(from).out_edges(), |off| guard.node(off).data() == to).is_some()
}

/// Remove the `from -> to` edge, if present, and return its ListCell to the
/// arena. No-op (not an error) if the edge does not exist.
pub fn delete_edge(guard: &mut RegionGuard<'_>, from: NodeOffset, to: NodeOffset) {
    let mut prev: Option<NodeOffset> = None;
    let mut cur = guard.node(from).out_edges();
    while !cur.is_nil() {
        let next = guard.node(cur).next();
        if guard.node(cur).data() == to {
            match prev {
                Some(p) => guard.node_mut(p).set_next(next),
                None => guard.node_mut(from).set_out_edges(next),
            }
            arena::release(guard, cur);
            return;
        }
        prev = Some(cur);
        cur = next;
    }
}

pub fn out_edges(guard: &RegionGuard<'_>, from: NodeOffset) -> Vec<NodeOffset> {
    let mut out = Vec::new();
    let mut cur = guard.node(from).out_edges();
    while !cur.is_nil() {
        out.push(guard.node(cur).data());
        cur = guard.node(cur).next();
    }
    out
}

/// True if any Process Node has an outgoing (claim) edge into `resource`.
/// Backs `leave`'s decision to reclaim a Resource Node once the departing
/// process's own claim has been dropped: if nobody else still claims it
/// either, it can be unlinked.
pub fn resource_has_incoming_from_any_process(guard: &RegionGuard<'_>, resource: NodeOffset) -> bool {
    let mut cur = guard.header_processes();
    while !cur.is_nil() {
        if has_edge(guard, cur, resource) {
            return true;
        }
        cur = guard.node(cur).next();
    }
    false
}

/// Every Resource currently assigned (held) by `proc`, i.e. every R with an
/// outgoing assignment edge R -> proc. By invariant I2 a resource has at
/// most one such edge, but `leave` needs this scanned by holder, not by
/// chasing `proc`'s own out_edges (which hold claims, not assignments).
pub fn resources_assigned_to(guard: &RegionGuard<'_>, proc: NodeOffset) -> Vec<NodeOffset> {
    let mut out = Vec::new();
    let mut cur = guard.header_resources();
    while !cur.is_nil() {
        if has_edge(guard, cur, proc) {
            out.push(cur);
        }
        cur = guard.node(cur).next();
    }
    out
}

/// Unlink `resource` from the resources chain and return its slot to the
/// arena. Caller must have already removed all edges touching it.
pub fn unlink_resource(guard: &mut RegionGuard<'_>, resource: NodeOffset) {
    unlink_from_chain(guard, resource, RegionGuard::header_resources, RegionGuard::set_header_resources);
    arena::release(guard, resource);
}

pub fn unlink_process(guard: &mut RegionGuard<'_>, process: NodeOffset) {
    unlink_from_chain(guard, process, RegionGuard::header_processes, RegionGuard::set_header_processes);
    arena::release(guard, process);
}

fn unlink_from_chain(
    guard: &mut RegionGuard<'_>,
    target: NodeOffset,
    get_head: fn(&RegionGuard<'_>) -> NodeOffset,
    set_head: fn(&mut RegionGuard<'_>, NodeOffset),
) {
    let head = get_head(guard);
    if head == target {
        let next = guard.node(target).next();
        set_head(guard, next);
        return;
    }
    let mut cur = head;
    while !cur.is_nil() {
        let next = guard.node(cur).next();
        if next == target {
            let after = guard.node(target).next();
            guard.node_mut(cur).set_next(after);
            return;
        }
        cur = next;
    }
}

pub fn require_process(guard: &RegionGuard<'_>, pid: Pid) -> SfsResult<NodeOffset> {
    find_process(guard, pid).ok_or(Error::NotDeclared)
}

pub fn require_resource(guard: &RegionGuard<'_>, name: &str) -> SfsResult<NodeOffset> {
    find_resource_by_name(guard, name).ok_or(Error::NotDeclared)
}
