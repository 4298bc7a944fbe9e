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
 * The Shared Region: a fixed-size byte window, process-shared in
 * production (POSIX `shm_open`+`mmap`) or heap-backed for in-process tests,
 * holding the header (mutex, condvar, chain heads) followed by the Node
 * arena.
 */

use crate::{
    error::{Error, SfsResult},
    node::{NodeOffset, RawNode, NODE_ALIGN, NODE_SIZE},
    sync_prim,
};
use libc::{pthread_cond_t, pthread_mutex_t};
use std::{
    io,
    sync::atomic::{AtomicU32, Ordering},
    thread,
    time::Duration,
};

pub const DEFAULT_REGION_BYTES: usize = 32 * 1024;

const STATE_UNINIT: u32 = 0;
const STATE_INITIALIZING: u32 = 1;
const STATE_READY: u32 = 2;

#[repr(C)]
struct Header {
    /// Tri-state init handshake (UNINIT/INITIALIZING/READY), checked with
    /// atomic CAS since the mutex below doesn't exist yet when the first
    /// participant attaches. Whoever wins the CAS from UNINIT runs
    /// `init_fresh`; everyone else spins until it flips to READY.
    state: AtomicU32,
    capacity: u32,
    next_free: u32,
    open_nodes: u32,
    processes: u32,
    resources: u32,
    next_handle_hi: AtomicU32,
    next_handle_lo: AtomicU32,
    mutex: pthread_mutex_t,
    cond: pthread_cond_t,
}

const HEADER_SIZE: usize = std::mem::size_of::<Header>();

const ARENA_OFFSET: usize = {
    // const fn-friendly manual align_up since `align_up` isn't const here
    let a = NODE_ALIGN;
    (HEADER_SIZE + a - 1) / a * a
};

/// Minimum viable region: header plus room for exactly one Node.
pub const MIN_REGION_BYTES: usize = ARENA_OFFSET + NODE_SIZE;

pub fn capacity_for(region_bytes: usize) -> usize {
    if region_bytes <= ARENA_OFFSET {
        0
    } else {
        (region_bytes - ARENA_OFFSET) / NODE_SIZE
    }
}

/// A handle to an attached Region. Cheap to copy; every participant holding
/// one operates on the identical bytes (real shared memory in production,
/// a shared heap allocation under test).
#[derive(Clone, Copy)]
pub struct RegionHandle {
    base: *mut u8,
    len: usize,
}

// SAFETY: all access to the pointed-to bytes is serialised by the
// process-shared mutex embedded in the header; the raw pointer itself
// carries no thread-affinity.
unsafe impl Send for RegionHandle {}
unsafe impl Sync for RegionHandle {}

impl RegionHandle {
    /// # Safety
    /// `base` must point at `len` bytes that remain valid and unmoved for as
    /// long as this handle (or any copy of it) is used.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        capacity_for(self.len)
    }

    fn header(&self) -> &Header {
        unsafe { &*(self.base as *const Header) }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut Header {
        unsafe { &mut *(self.base as *mut Header) }
    }

    fn node_ptr(&self, off: NodeOffset) -> *mut RawNode {
        debug_assert!(!off.is_nil());
        let byte_off = ARENA_OFFSET + off.0 as usize * NODE_SIZE;
        debug_assert!(byte_off + NODE_SIZE <= self.len);
        unsafe { self.base.add(byte_off) as *mut RawNode }
    }

    /// Zero the header and arena-adjacent state, and initialise the
    /// process-shared mutex/condvar. Destructive; call only through
    /// `ensure_initialized`, which arbitrates exactly one caller into here.
    fn init_fresh(&self) -> SfsResult<()> {
        assert!(
            self.len >= MIN_REGION_BYTES,
            "region of {} bytes cannot hold the header plus one node (need >= {})",
            self.len,
            MIN_REGION_BYTES
        );
        unsafe {
            std::ptr::write_bytes(self.base, 0, HEADER_SIZE);
        }
        let h = self.header_mut();
        h.state = AtomicU32::new(STATE_INITIALIZING);
        h.capacity = self.capacity() as u32;
        h.next_free = 0;
        h.open_nodes = NodeOffset::NIL.0;
        h.processes = NodeOffset::NIL.0;
        h.resources = NodeOffset::NIL.0;
        h.next_handle_hi.store(0, Ordering::Relaxed);
        h.next_handle_lo.store(0, Ordering::Relaxed);
        sync_prim::init_mutex(&mut h.mutex as *mut _)?;
        sync_prim::init_condvar(&mut h.cond as *mut _)?;
        Ok(())
    }

    /// Race-safe one-time initialisation: the first participant to attach a
    /// given Region runs `init_fresh`; every other concurrent attacher spins
    /// until that finishes instead of re-initialising (and clobbering) it.
    pub fn ensure_initialized(&self) -> SfsResult<()> {
        let state = unsafe { &(*(self.base as *const Header)).state };
        match state.compare_exchange(
            STATE_UNINIT,
            STATE_INITIALIZING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                self.init_fresh()?;
                state.store(STATE_READY, Ordering::SeqCst);
                Ok(())
            }
            Err(_) => {
                while state.load(Ordering::SeqCst) != STATE_READY {
                    thread::sleep(Duration::from_micros(200));
                }
                Ok(())
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.header().state.load(Ordering::SeqCst) == STATE_READY
    }

    /// Acquire the global mutex. The sole suspension point of the protocol
    /// (`RegionGuard::wait`) lives on the guard this returns.
    pub fn lock(&self) -> SfsResult<RegionGuard<'_>> {
        let h = self.header_mut();
        sync_prim::lock(&mut h.mutex as *mut _)?;
        Ok(RegionGuard { region: self })
    }

    /// Monotonically-increasing id, unique for the Region's lifetime. Used
    /// to mint `FileHandle`s. Must be called with the mutex held.
    fn next_handle_raw(&self) -> u64 {
        let h = self.header_mut();
        let lo = h.next_handle_lo.fetch_add(1, Ordering::Relaxed);
        if lo == u32::MAX {
            h.next_handle_hi.fetch_add(1, Ordering::Relaxed);
        }
        ((h.next_handle_hi.load(Ordering::Relaxed) as u64) << 32) | (lo as u64 + 1)
    }
}

/// RAII guard for the Region's global mutex. All Graph/Cycle-detector
/// operations take a `&mut RegionGuard` to make "under the mutex" visible in
/// every function signature that needs it.
pub struct RegionGuard<'a> {
    region: &'a RegionHandle,
}

impl<'a> RegionGuard<'a> {
    pub fn region(&self) -> &RegionHandle {
        self.region
    }

    pub fn header_processes(&self) -> NodeOffset {
        NodeOffset(self.region.header().processes)
    }

    pub fn set_header_processes(&mut self, off: NodeOffset) {
        self.region.header_mut().processes = off.0;
    }

    pub fn header_resources(&self) -> NodeOffset {
        NodeOffset(self.region.header().resources)
    }

    pub fn set_header_resources(&mut self, off: NodeOffset) {
        self.region.header_mut().resources = off.0;
    }

    pub(crate) fn header_open_nodes(&self) -> NodeOffset {
        NodeOffset(self.region.header().open_nodes)
    }

    pub(crate) fn set_header_open_nodes(&mut self, off: NodeOffset) {
        self.region.header_mut().open_nodes = off.0;
    }

    pub(crate) fn header_next_free(&self) -> u32 {
        self.region.header().next_free
    }

    pub(crate) fn set_header_next_free(&mut self, v: u32) {
        self.region.header_mut().next_free = v;
    }

    pub fn node(&self, off: NodeOffset) -> &RawNode {
        unsafe { &*self.region.node_ptr(off) }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn node_mut(&mut self, off: NodeOffset) -> &mut RawNode {
        unsafe { &mut *self.region.node_ptr(off) }
    }

    pub fn mint_handle(&mut self) -> crate::node::FileHandle {
        crate::node::FileHandle(self.region.next_handle_raw())
    }

    /// Atomically release the mutex and block until `broadcast` is called
    /// elsewhere, then reacquire the mutex before returning.
    pub fn wait(&mut self) {
        let h = self.region.header_mut();
        sync_prim::wait(&mut h.cond as *mut _, &mut h.mutex as *mut _);
    }

    pub fn broadcast(&mut self) {
        let h = self.region.header_mut();
        sync_prim::broadcast(&mut h.cond as *mut _);
    }
}

impl<'a> Drop for RegionGuard<'a> {
    fn drop(&mut self) {
        let h = self.region.header_mut();
        sync_prim::unlock(&mut h.mutex as *mut _);
    }
}

#[cfg(unix)]
mod shm {
    use super::*;
    use std::ffi::CString;
    use std::os::unix::io::RawFd;

    fn shm_name(key: i32) -> CString {
        CString::new(format!("/sfsd-{key:08x}")).expect("key formats to a valid C string")
    }

    fn last_err() -> Error {
        Error::Attach(io::Error::last_os_error())
    }

    /// Get-or-create the POSIX shared memory object for `key`, size it to
    /// `region_bytes`, map it, and return a handle to the mapping.
    pub fn attach(key: i32, region_bytes: usize) -> SfsResult<RegionHandle> {
        let name = shm_name(key);
        let fd: RawFd = unsafe {
            libc::shm_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            return Err(last_err());
        }
        let rc = unsafe { libc::ftruncate(fd, region_bytes as libc::off_t) };
        if rc != 0 {
            unsafe { libc::close(fd) };
            return Err(last_err());
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                region_bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(last_err());
        }
        Ok(unsafe { RegionHandle::from_raw(ptr as *mut u8, region_bytes) })
    }

    pub fn detach(handle: RegionHandle) -> SfsResult<()> {
        let rc = unsafe { libc::munmap(handle.base as *mut libc::c_void, handle.len) };
        if rc != 0 {
            return Err(last_err());
        }
        Ok(())
    }

    pub fn unlink(key: i32) -> SfsResult<()> {
        let name = shm_name(key);
        let rc = unsafe { libc::shm_unlink(name.as_ptr()) };
        if rc != 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::NotFound {
                return Ok(());
            }
            return Err(Error::Attach(e));
        }
        Ok(())
    }
}

#[cfg(unix)]
pub use shm::{attach, detach, unlink};

/// A heap-backed region for in-process tests: the identical header/arena
/// layout and mutex/condvar protocol, just without POSIX shared memory.
/// Multiple `RegionHandle`s taken from one `HeapRegion` behave exactly like
/// multiple processes attached to the same key, since `pthread_mutex_t`
/// initialised with `PTHREAD_PROCESS_SHARED` works perfectly well between
/// threads of one process too.
#[cfg(any(test, feature = "test-util"))]
pub struct HeapRegion {
    bytes: Box<[u8]>,
}

#[cfg(any(test, feature = "test-util"))]
impl HeapRegion {
    pub fn new(region_bytes: usize) -> Self {
        Self {
            bytes: vec![0u8; region_bytes].into_boxed_slice(),
        }
    }

    pub fn handle(&self) -> RegionHandle {
        unsafe { RegionHandle::from_raw(self.bytes.as_ptr() as *mut u8, self.bytes.len()) }
    }
}
