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
 * Runtime configuration, read from the environment before a participant
 * attaches to a Region.
 */

use serde::{Deserialize, Serialize};

const ENV_SHM_KEY: &str = "SFS_SHM_KEY";
const ENV_REGION_BYTES: &str = "SFS_REGION_BYTES";
const ENV_LOG_FILTER: &str = "SFS_LOG";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Identifies the shared memory object; all cooperating participants
    /// must agree on this value out of band (e.g. a well-known constant, or
    /// passed down from a forking parent).
    pub shm_key: i32,
    /// Total size, in bytes, of the shared Region. Bounds the number of
    /// Processes/Resources/edges that can exist concurrently.
    pub region_bytes: usize,
    /// `env_logger` filter string passed to `init_logging`.
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shm_key: 0x5f53_4653, // "_SFS"
            region_bytes: crate::region::DEFAULT_REGION_BYTES,
            log_filter: "info".to_owned(),
        }
    }
}

impl Config {
    /// Build from environment variables, falling back to defaults for any
    /// that are unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var(ENV_SHM_KEY) {
            if let Ok(parsed) = v.parse() {
                cfg.shm_key = parsed;
            } else {
                log::warn!("{ENV_SHM_KEY}={v:?} is not a valid i32, using default");
            }
        }
        if let Ok(v) = std::env::var(ENV_REGION_BYTES) {
            if let Ok(parsed) = v.parse() {
                cfg.region_bytes = parsed;
            } else {
                log::warn!("{ENV_REGION_BYTES}={v:?} is not a valid usize, using default");
            }
        }
        if let Ok(v) = std::env::var(ENV_LOG_FILTER) {
            cfg.log_filter = v;
        }
        cfg
    }

    pub fn validate(&self) -> crate::error::SfsResult<()> {
        if self.region_bytes < crate::region::MIN_REGION_BYTES {
            return Err(crate::error::Error::OutOfArena);
        }
        Ok(())
    }
}

/// Initialise `env_logger` with `cfg.log_filter`. Safe to call more than
/// once; later calls are no-ops.
pub fn init_logging(cfg: &Config) {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cfg.log_filter.clone()),
    )
    .is_test(cfg!(test))
    .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_passes_validation() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn undersized_region_fails_validation() {
        let cfg = Config {
            region_bytes: 8,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
