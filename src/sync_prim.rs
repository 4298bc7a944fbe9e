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
 * Process-shared mutex and condition variable, built directly on the raw
 * `libc::pthread_mutex_t`/`pthread_cond_t` primitives with the
 * `PTHREAD_PROCESS_SHARED` attribute. `parking_lot`/`std::sync` cannot be
 * used here: neither supports a mutex whose memory is shared by independent
 * processes rather than threads of one process.
 */

use crate::error::{Error, SfsResult};
use libc::{
    pthread_cond_t, pthread_condattr_t, pthread_mutex_t, pthread_mutexattr_t, PTHREAD_MUTEX_NORMAL,
    PTHREAD_PROCESS_SHARED,
};
use std::mem::MaybeUninit;

/// Initialise `mutex` in place with the process-shared attribute. Must be
/// called exactly once, by whichever participant calls `init_fresh`.
pub fn init_mutex(mutex: *mut pthread_mutex_t) -> SfsResult<()> {
    unsafe {
        let mut attr = MaybeUninit::<pthread_mutexattr_t>::uninit();
        check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
        let mut attr = attr.assume_init();
        check(libc::pthread_mutexattr_setpshared(
            &mut attr,
            PTHREAD_PROCESS_SHARED,
        ))?;
        check(libc::pthread_mutexattr_settype(&mut attr, PTHREAD_MUTEX_NORMAL))?;
        #[cfg(target_os = "linux")]
        {
            // best-effort: lets a lock held by a participant that crashed be
            // recovered as `Error::Poisoned` instead of wedging every other
            // participant forever. Not available on all unices.
            let _ = libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
        }
        check(libc::pthread_mutex_init(mutex, &attr))?;
        libc::pthread_mutexattr_destroy(&mut attr);
    }
    Ok(())
}

/// Initialise `cond` in place with the process-shared attribute.
pub fn init_condvar(cond: *mut pthread_cond_t) -> SfsResult<()> {
    unsafe {
        let mut attr = MaybeUninit::<pthread_condattr_t>::uninit();
        check(libc::pthread_condattr_init(attr.as_mut_ptr()))?;
        let mut attr = attr.assume_init();
        check(libc::pthread_condattr_setpshared(
            &mut attr,
            PTHREAD_PROCESS_SHARED,
        ))?;
        check(libc::pthread_cond_init(cond, &attr))?;
        libc::pthread_condattr_destroy(&mut attr);
    }
    Ok(())
}

/// Lock `mutex`. Returns `Error::Poisoned` if the previous owner died while
/// holding it (Linux-only robust-mutex recovery).
pub fn lock(mutex: *mut pthread_mutex_t) -> SfsResult<()> {
    let rc = unsafe { libc::pthread_mutex_lock(mutex) };
    if rc == 0 {
        return Ok(());
    }
    #[cfg(target_os = "linux")]
    if rc == libc::EOWNERDEAD {
        // the mutex is held by us now, but the previous owner left the
        // region in a state we cannot trust; mark it consistent so later
        // participants aren't wedged forever, then surface the poison.
        unsafe {
            libc::pthread_mutex_consistent(mutex);
            libc::pthread_mutex_unlock(mutex);
        }
        return Err(Error::Poisoned);
    }
    Err(Error::Poisoned)
}

pub fn unlock(mutex: *mut pthread_mutex_t) {
    unsafe {
        libc::pthread_mutex_unlock(mutex);
    }
}

/// Atomically release `mutex` and block on `cond`, reacquiring `mutex`
/// before returning. This is the protocol's sole suspension point.
pub fn wait(cond: *mut pthread_cond_t, mutex: *mut pthread_mutex_t) {
    unsafe {
        libc::pthread_cond_wait(cond, mutex);
    }
}

pub fn broadcast(cond: *mut pthread_cond_t) {
    unsafe {
        libc::pthread_cond_broadcast(cond);
    }
}

fn check(rc: i32) -> SfsResult<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::Attach(std::io::Error::from_raw_os_error(rc)))
    }
}
