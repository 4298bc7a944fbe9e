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
 * File I/O collaborator: maps `mode` strings onto `std::fs::OpenOptions`
 * and keeps the process-local table from opaque `FileHandle` to the real
 * open `std::fs::File`. Byte-level I/O is out of scope; this module only
 * opens/closes files on the coordinator's behalf.
 */

use crate::{
    error::{Error, SfsResult},
    node::FileHandle,
};
use std::{collections::HashMap, fs::{File, OpenOptions}};

/// `fopen`-style mode strings: "r", "w", "a", "r+"/"w+"/"a+".
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FileMode {
    Read,
    Write,
    Append,
    ReadWrite,
}

impl FileMode {
    pub fn parse(mode: &str) -> SfsResult<Self> {
        match mode {
            "r" => Ok(Self::Read),
            "w" => Ok(Self::Write),
            "a" => Ok(Self::Append),
            "r+" | "w+" => Ok(Self::ReadWrite),
            _ => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unrecognised mode string {mode:?}"),
            ))),
        }
    }

    fn open_options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        match self {
            Self::Read => {
                opts.read(true);
            }
            Self::Write => {
                opts.write(true).create(true).truncate(true);
            }
            Self::Append => {
                opts.append(true).create(true);
            }
            Self::ReadWrite => {
                opts.read(true).write(true).create(true);
            }
        }
        opts
    }
}

pub fn open_for_mode(path: &str, mode: &str) -> SfsResult<File> {
    let mode = FileMode::parse(mode)?;
    mode.open_options().open(path).map_err(Error::Io)
}

/// Process-local map from the opaque handles stored in the shared Region to
/// the real `File`s this participant opened. Never shared across
/// participants: a `File`/fd from one process means nothing in another.
#[derive(Default)]
pub struct HandleTable {
    files: HashMap<FileHandle, File>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: FileHandle, file: File) {
        self.files.insert(handle, file);
    }

    pub fn remove(&mut self, handle: FileHandle) -> Option<File> {
        self.files.remove(&handle)
    }

    pub fn contains(&self, handle: FileHandle) -> bool {
        self.files.contains_key(&handle)
    }

    pub fn keys(&self) -> Vec<FileHandle> {
        self.files.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing_matches_reference_table() {
        assert_eq!(FileMode::parse("r").unwrap(), FileMode::Read);
        assert_eq!(FileMode::parse("w").unwrap(), FileMode::Write);
        assert_eq!(FileMode::parse("a").unwrap(), FileMode::Append);
        assert_eq!(FileMode::parse("r+").unwrap(), FileMode::ReadWrite);
        assert_eq!(FileMode::parse("w+").unwrap(), FileMode::ReadWrite);
        assert!(FileMode::parse("q").is_err());
    }

    #[test]
    fn open_write_then_read_roundtrip() {
        let dir = std::env::temp_dir().join(format!("sfsd-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("roundtrip.txt");
        let path = path.to_str().unwrap();

        {
            use std::io::Write;
            let mut f = open_for_mode(path, "w").unwrap();
            f.write_all(b"hello").unwrap();
        }
        {
            use std::io::Read;
            let mut f = open_for_mode(path, "r").unwrap();
            let mut buf = String::new();
            f.read_to_string(&mut buf).unwrap();
            assert_eq!(buf, "hello");
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn handle_table_insert_remove() {
        let mut table = HandleTable::new();
        let dir = std::env::temp_dir();
        let f = open_for_mode(dir.join("sfsd-handle-test").to_str().unwrap(), "w").unwrap();
        let h = FileHandle(7);
        table.insert(h, f);
        assert!(table.contains(h));
        assert!(table.remove(h).is_some());
        assert!(!table.contains(h));
    }
}
