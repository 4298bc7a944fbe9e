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
 * The five public entry points: `init`, `declare`, `acquire`, `release`,
 * `leave`, `destroy`. `acquire` is the only one that can block; every other
 * entry point only ever touches the graph under the region lock and
 * returns.
 */

use crate::{
    config::Config,
    cycle,
    error::{Error, SfsResult},
    fileio, graph,
    node::{FileHandle, Pid},
    region::{self, RegionHandle},
};

/// A single participant's view onto a coordination Region: the attached
/// shared memory plus this process's private table of open file handles.
/// One `Coordinator` per participant; never shared across processes
/// (each process constructs its own by calling `init`).
pub struct Coordinator {
    region: RegionHandle,
    handles: fileio::HandleTable,
    pid: Pid,
    owned_key: Option<i32>,
}

impl Coordinator {
    /// Attach to (creating if necessary) the Region identified by
    /// `cfg.shm_key`, and register this process as a participant. Safe to
    /// call concurrently from unrelated processes: exactly one of them
    /// performs the destructive one-time Region initialisation.
    pub fn init(cfg: &Config) -> SfsResult<Self> {
        cfg.validate()?;
        let region = region::attach(cfg.shm_key, cfg.region_bytes)?;
        region.ensure_initialized()?;
        let pid = Pid(current_pid());
        log::info!("participant {:?} attached to region key={:#x}", pid, cfg.shm_key);
        Ok(Self {
            region,
            handles: fileio::HandleTable::new(),
            pid,
            owned_key: Some(cfg.shm_key),
        })
    }

    /// Construct a Coordinator over an already-attached, already-initialised
    /// Region and an explicit `Pid` -- used by tests that simulate
    /// participants as threads sharing one `HeapRegion` rather than real
    /// processes attached by key.
    pub fn from_region(region: RegionHandle, pid: Pid) -> Self {
        Self {
            region,
            handles: fileio::HandleTable::new(),
            pid,
            owned_key: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Register this process as a participant and install one claim edge
    /// per name in `paths`. Must be called at most once per participant per
    /// Region lifetime, before any `acquire` referencing one of `paths`.
    pub fn declare(&mut self, paths: &[&str]) -> SfsResult<()> {
        let mut guard = self.region.lock()?;
        let proc_off = match graph::find_process(&guard, self.pid) {
            Some(off) => off,
            None => graph::create_process(&mut guard, self.pid)?,
        };
        for path in paths {
            let res_off = graph::ensure_resource(&mut guard, path)?;
            graph::add_edge(&mut guard, proc_off, res_off)?;
        }
        log::debug!("{:?} declared {paths:?}", self.pid);
        Ok(())
    }

    /// Request `path` opened in `mode`. Blocks (via the Region's condvar)
    /// while granting the request would create a cycle in the
    /// Resource-Allocation Graph, i.e. while it would deadlock. Returns an
    /// opaque `FileHandle` once the file is actually open.
    pub fn acquire(&mut self, path: &str, mode: &str) -> SfsResult<FileHandle> {
        let mut guard = self.region.lock()?;
        let proc_off = graph::require_process(&guard, self.pid)?;
        let res_off = graph::require_resource(&guard, path)?;

        loop {
            // I2 is enforced here, not by the cycle detector: a resource
            // already assigned to a different process must block on
            // ordinary contention before we even consider the graph shape.
            let current_holder = graph::out_edges(&guard, res_off);
            if !current_holder.is_empty() && current_holder != vec![proc_off] {
                log::debug!("{:?} waiting on {path:?}: already held", self.pid);
                guard.wait();
                continue;
            }

            // tentatively promote the claim to an assignment, then check
            // whether *that* grant would close a cycle -- the cycle check
            // must run against the post-grant graph, not the pre-grant one,
            // or a deadlock introduced by this exact edge is invisible to it.
            graph::delete_edge(&mut guard, proc_off, res_off);
            graph::add_edge(&mut guard, res_off, proc_off)?;

            if cycle::reachable_cycle_from(&mut guard, proc_off) {
                log::debug!("{:?} waiting on {path:?}: granting now would deadlock", self.pid);
                graph::delete_edge(&mut guard, res_off, proc_off);
                graph::add_edge(&mut guard, proc_off, res_off)?;
                guard.wait();
                continue;
            }
            break;
        }

        drop(guard);
        let file = match fileio::open_for_mode(path, mode) {
            Ok(f) => f,
            Err(e) => {
                // the open failed after the grant was already committed to
                // the graph; revert to a claim edge and wake any waiter that
                // might now be unblocked by this participant backing off.
                let mut guard = self.region.lock()?;
                graph::delete_edge(&mut guard, res_off, proc_off);
                graph::add_edge(&mut guard, proc_off, res_off)?;
                guard.broadcast();
                return Err(e);
            }
        };

        let mut guard = self.region.lock()?;
        let handle = guard.mint_handle();
        guard.node_mut(res_off).set_file_handle(handle);
        drop(guard);

        self.handles.insert(handle, file);
        let pid = self.pid;
        log::info!("{pid:?} acquired {path:?} ({mode}) as {handle:?}");
        Ok(handle)
    }

    /// Release a previously-acquired handle. Closes the underlying file and,
    /// if no other process still holds this resource, clears its
    /// `file_handle` so the next `acquire` can reopen it. Broadcasts so any
    /// process blocked on the resulting graph change can re-check.
    pub fn release(&mut self, handle: FileHandle) -> SfsResult<()> {
        self.handles.remove(handle).ok_or(Error::NotFound)?;

        let mut guard = self.region.lock()?;
        let proc_off = graph::require_process(&guard, self.pid)?;
        let res_off = graph::find_resource_by_handle(&guard, handle).ok_or(Error::NotFound)?;

        // assignment -> claim: res -> proc becomes proc -> res. By I2 a
        // resource has at most one assignment edge, so this is unconditional.
        graph::delete_edge(&mut guard, res_off, proc_off);
        graph::add_edge(&mut guard, proc_off, res_off)?;
        guard.node_mut(res_off).set_file_handle(FileHandle::NONE);
        guard.broadcast();
        log::info!("{:?} released {handle:?}", self.pid);
        Ok(())
    }

    /// Remove this process from the graph entirely: release every handle it
    /// still holds, delete any outstanding claim edges, then unlink its
    /// Process node. Intended for clean process shutdown.
    pub fn leave(&mut self) -> SfsResult<()> {
        for h in self.handles.keys() {
            self.handles.remove(h);
        }

        let mut guard = self.region.lock()?;
        let proc_off = match graph::find_process(&guard, self.pid) {
            Some(off) => off,
            None => return Ok(()),
        };

        // demote every resource this process still holds back to a claim,
        // and clear its file_handle -- the underlying fd already closed
        // above when its HandleTable entry was dropped.
        for res_off in graph::resources_assigned_to(&guard, proc_off) {
            graph::delete_edge(&mut guard, res_off, proc_off);
            graph::add_edge(&mut guard, proc_off, res_off)?;
            guard.node_mut(res_off).set_file_handle(FileHandle::NONE);
        }

        // drop every remaining claim; reclaim any resource this was the
        // last claimant of, provided nobody else currently holds it either.
        for res_off in graph::out_edges(&guard, proc_off) {
            graph::delete_edge(&mut guard, proc_off, res_off);
            let held = !graph::out_edges(&guard, res_off).is_empty();
            if !held && !graph::resource_has_incoming_from_any_process(&guard, res_off) {
                graph::unlink_resource(&mut guard, res_off);
            }
        }

        graph::unlink_process(&mut guard, proc_off);
        guard.broadcast();
        log::info!("{:?} left", self.pid);
        Ok(())
    }

    /// Detach from the Region. Does not disturb other participants; the
    /// Region and its graph state persist until `destroy`.
    pub fn detach(self) -> SfsResult<()> {
        region::detach(self.region)
    }

    /// Tear down the Region: unmap it and, if this Coordinator owns the key
    /// (i.e. it was constructed via `init`, not `from_region`), unlink the
    /// underlying shared memory object. Callers are responsible for making
    /// sure no other participant is still using the Region.
    pub fn destroy(self) -> SfsResult<()> {
        {
            let mut guard = self.region.lock()?;
            // safety net for participants that crashed without calling
            // `release`/`leave`: clear any file_handle still set so the
            // Region doesn't come back up next time looking held. Always
            // advance to the next node before touching this one, or an
            // unlink partway through the chain would loop forever.
            let mut cur = guard.header_resources();
            while !cur.is_nil() {
                let next = guard.node(cur).next();
                if !guard.node(cur).file_handle().is_none() {
                    log::warn!(
                        "destroy: resource still shows an open handle, clearing it \
                         (its owning process likely crashed without releasing)"
                    );
                    guard.node_mut(cur).set_file_handle(FileHandle::NONE);
                }
                cur = next;
            }
        }

        let key = self.owned_key;
        region::detach(self.region)?;
        if let Some(key) = key {
            region::unlink(key)?;
        }
        Ok(())
    }
}

fn current_pid() -> u64 {
    #[cfg(unix)]
    {
        unsafe { libc::getpid() as u64 }
    }
    #[cfg(not(unix))]
    {
        std::process::id() as u64
    }
}
