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

//! # sfsd
//!
//! A deadlock-free shared-file coordination service: cooperating processes
//! `declare` which files they intend to touch, then `acquire`/`release` them
//! through a small cross-process coordinator that runs the Banker's
//! algorithm over a live Resource-Allocation Graph before granting any
//! request that could deadlock the set of participants.
//!
//! The graph itself lives in a POSIX shared memory Region (`region`)
//! guarded by a single process-shared mutex/condvar pair (`sync_prim`); every
//! entity in it -- processes, resources, and the edges between them -- is a
//! fixed-size slot out of a bump/free-list arena (`arena`, `node`) addressed
//! by offset rather than pointer, since the Region is mapped at a different
//! address in every participant. `graph` and `cycle` implement the model and
//! the deadlock-avoidance check on top of that arena; `coordinator` exposes
//! the five operations participants actually call: `init`, `declare`,
//! `acquire`, `release`, `leave`, `destroy`.

pub mod arena;
pub mod config;
pub mod coordinator;
pub mod cycle;
pub mod error;
pub mod fileio;
pub mod graph;
pub mod node;
pub mod region;
pub mod sync_prim;

pub use config::Config;
pub use coordinator::Coordinator;
pub use error::{Error, SfsResult};
pub use node::{FileHandle, Pid};
