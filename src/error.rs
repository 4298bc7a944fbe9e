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

use std::{fmt, io};

pub type SfsResult<T> = Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// failed to attach, detach or unlink the shared region
    Attach(io::Error),
    /// the node arena is exhausted; the region was sized too small
    OutOfArena,
    /// a path or pid referenced in `acquire` was never declared
    NotDeclared,
    /// a resource name passed to `declare` is longer than the fixed on-disk
    /// slot can hold
    NameTooLong,
    /// a handle or pid referenced in `release`/`leave` does not exist
    NotFound,
    /// the external file-open/close collaborator failed
    Io(io::Error),
    /// the process-shared mutex was left in an inconsistent state by a
    /// participant that died while holding it
    Poisoned,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attach(e) => write!(f, "failed to attach shared region: {e}"),
            Self::OutOfArena => write!(f, "node arena exhausted"),
            Self::NotDeclared => write!(f, "path or process was never declared"),
            Self::NameTooLong => write!(f, "resource name exceeds the maximum length"),
            Self::NotFound => write!(f, "unknown file handle or process"),
            Self::Io(e) => write!(f, "file I/O error: {e}"),
            Self::Poisoned => write!(f, "shared region mutex poisoned by a dead participant"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
