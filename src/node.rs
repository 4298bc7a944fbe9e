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
 * A single fixed-size POD slot stores every entity in the graph. Every
 * access goes through a kind-checked view (`pid`/`name`/`data`, etc.)
 * instead of raw field access, so a caller cannot read a Resource's `name`
 * out of a slot that is actually a ListCell without tripping a debug
 * assertion. The slot itself must stay a single fixed-size POD type because
 * the arena (`arena.rs`) requires every Node to be the same size.
 */

use crate::error::{Error, SfsResult};

pub const MAX_NAME_LEN: usize = 150;

/// Offset, in bytes, from the Region base. `NIL` terminates every chain.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct NodeOffset(pub u32);

impl NodeOffset {
    pub const NIL: Self = Self(u32::MAX);

    #[inline]
    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }
}

/// A participant's process id. Sourced from `libc::getpid()` in production,
/// supplied directly by test code simulating participants as threads.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct Pid(pub u64);

/// An opaque, process-local key identifying a granted file. Never
/// dereferenced by a participant other than the one that opened it -- a
/// handle minted in one address space means nothing in another.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct FileHandle(pub u64);

impl FileHandle {
    pub const NONE: Self = Self(0);

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeKind {
    Free = 0,
    Process = 1,
    Resource = 2,
    ListCell = 3,
}

impl NodeKind {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Free,
            1 => Self::Process,
            2 => Self::Resource,
            3 => Self::ListCell,
            other => panic!("corrupt region: unknown node kind tag {other}"),
        }
    }
}

/// Scratch field used exclusively by the cycle detector. Reset to
/// `Unvisited` at the start of every run.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VisitState {
    Unvisited = 0,
    Visited = 1,
    Processed = 2,
}

impl VisitState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Unvisited,
            1 => Self::Visited,
            2 => Self::Processed,
            other => panic!("corrupt region: unknown visit state tag {other}"),
        }
    }
}

/// The fixed-size, POD, on-Region representation of every graph entity.
///
/// All fields are present regardless of `kind`; the accessor views below are
/// what prevent a caller from treating, say, a `ListCell`'s `data` as a
/// `Resource`'s `file_handle`.
#[repr(C)]
pub struct RawNode {
    kind: u8,
    state: u8,
    _pad: [u8; 2],
    /// Next node of the same kind in whichever chain owns this slot
    /// (`processes`, `resources`, or the arena free-list).
    next: u32,
    /// Head of the outgoing-edge `ListCell` chain. Process and Resource only.
    out_edges: u32,
    /// ListCell: offset of the edge's target node.
    data: u32,
    /// Resource: opaque handle of the currently-open file, `FileHandle::NONE`
    /// if not currently granted.
    file_handle: u64,
    /// Process: the participant's pid.
    pid: u64,
    name_len: u8,
    name: [u8; MAX_NAME_LEN],
}

pub const NODE_SIZE: usize = std::mem::size_of::<RawNode>();
pub const NODE_ALIGN: usize = std::mem::align_of::<RawNode>();

impl RawNode {
    pub fn zero(&mut self) {
        // SAFETY: RawNode is plain old data (no Drop, no niches beyond what
        // the enums below already mask via `from_u8`'s exhaustive panic).
        unsafe {
            std::ptr::write_bytes(self as *mut RawNode, 0, 1);
        }
        self.next = NodeOffset::NIL.0;
        self.out_edges = NodeOffset::NIL.0;
        self.data = NodeOffset::NIL.0;
    }

    pub fn kind(&self) -> NodeKind {
        NodeKind::from_u8(self.kind)
    }

    fn set_kind(&mut self, kind: NodeKind) {
        self.kind = kind as u8;
    }

    pub fn next(&self) -> NodeOffset {
        NodeOffset(self.next)
    }

    pub fn set_next(&mut self, off: NodeOffset) {
        self.next = off.0;
    }

    pub fn out_edges(&self) -> NodeOffset {
        debug_assert!(matches!(self.kind(), NodeKind::Process | NodeKind::Resource));
        NodeOffset(self.out_edges)
    }

    pub fn set_out_edges(&mut self, off: NodeOffset) {
        debug_assert!(matches!(self.kind(), NodeKind::Process | NodeKind::Resource));
        self.out_edges = off.0;
    }

    pub fn visit_state(&self) -> VisitState {
        debug_assert!(matches!(self.kind(), NodeKind::Process | NodeKind::Resource));
        VisitState::from_u8(self.state)
    }

    pub fn set_visit_state(&mut self, s: VisitState) {
        debug_assert!(matches!(self.kind(), NodeKind::Process | NodeKind::Resource));
        self.state = s as u8;
    }

    /// Initialise this (already-zeroed) slot as a Process.
    pub fn init_process(&mut self, pid: Pid) {
        self.set_kind(NodeKind::Process);
        self.pid = pid.0;
    }

    pub fn pid(&self) -> Pid {
        debug_assert_eq!(self.kind(), NodeKind::Process);
        Pid(self.pid)
    }

    /// Initialise this (already-zeroed) slot as a Resource. Fails with
    /// `Error::NameTooLong` rather than truncating, so a caller never ends
    /// up silently coordinating on the wrong path.
    pub fn init_resource(&mut self, name: &str) -> SfsResult<()> {
        let bytes = name.as_bytes();
        if bytes.len() > MAX_NAME_LEN {
            return Err(Error::NameTooLong);
        }
        self.set_kind(NodeKind::Resource);
        self.name[..bytes.len()].copy_from_slice(bytes);
        self.name_len = bytes.len() as u8;
        self.file_handle = FileHandle::NONE.0;
        Ok(())
    }

    pub fn name(&self) -> &[u8] {
        debug_assert_eq!(self.kind(), NodeKind::Resource);
        &self.name[..self.name_len as usize]
    }

    pub fn file_handle(&self) -> FileHandle {
        debug_assert_eq!(self.kind(), NodeKind::Resource);
        FileHandle(self.file_handle)
    }

    pub fn set_file_handle(&mut self, fh: FileHandle) {
        debug_assert_eq!(self.kind(), NodeKind::Resource);
        self.file_handle = fh.0;
    }

    /// Initialise this (already-zeroed) slot as a ListCell pointing at `target`.
    pub fn init_list_cell(&mut self, target: NodeOffset) {
        self.set_kind(NodeKind::ListCell);
        self.data = target.0;
    }

    pub fn data(&self) -> NodeOffset {
        debug_assert_eq!(self.kind(), NodeKind::ListCell);
        NodeOffset(self.data)
    }
}
