/* Copyright (c) 2018 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! Startup configuration: the module specification document and the
//! scheduler policy environment variable.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::FatalError;

/// Environment variable selecting the admission policy.
pub const SCHEDULER_ENV_VAR: &str = "KILN_SCHEDULER";

pub const DEFAULT_ADMISSION_CAPACITY: usize = 4_096;
pub const DEFAULT_MEMORY_LIMIT_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_STACK_SIZE_BYTES: usize = 512 * 1024;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Order in which pending invocations are admitted. Frozen for the process
/// lifetime once chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPolicy {
    /// Oldest request first.
    Fifo,
    /// Earliest absolute deadline first.
    Edf,
}

impl SchedulerPolicy {
    /// Parses a policy name as it appears in the environment.
    pub fn parse(value: &str) -> Result<SchedulerPolicy, FatalError> {
        match value {
            "FIFO" => Ok(SchedulerPolicy::Fifo),
            "EDF" => Ok(SchedulerPolicy::Edf),
            other => Err(FatalError::InvalidPolicy(other.to_string())),
        }
    }

    /// Reads the policy from `KILN_SCHEDULER`, defaulting to FIFO when the
    /// variable is unset. Any unrecognized value is fatal.
    pub fn from_env() -> Result<SchedulerPolicy, FatalError> {
        match std::env::var(SCHEDULER_ENV_VAR) {
            Ok(value) => SchedulerPolicy::parse(&value),
            Err(std::env::VarError::NotPresent) => Ok(SchedulerPolicy::Fifo),
            Err(std::env::VarError::NotUnicode(raw)) => {
                Err(FatalError::InvalidPolicy(raw.to_string_lossy().into_owned()))
            }
        }
    }
}

impl fmt::Display for SchedulerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerPolicy::Fifo => write!(f, "FIFO"),
            SchedulerPolicy::Edf => write!(f, "EDF"),
        }
    }
}

/// One entry of the module specification document.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleSpec {
    /// Unique module name.
    pub name: String,

    /// Shared object exporting `guest_main`. Optional so embedders can
    /// register native entries instead.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// TCP port the listener accepts invocations for this module on.
    pub port: u16,

    /// Deadline budget granted to every invocation, relative to admission.
    pub relative_deadline_us: u64,

    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: usize,

    #[serde(default = "default_stack_size")]
    pub stack_size_bytes: usize,

    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,
}

fn default_memory_limit() -> usize {
    DEFAULT_MEMORY_LIMIT_BYTES
}

fn default_stack_size() -> usize {
    DEFAULT_STACK_SIZE_BYTES
}

fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD_BYTES
}

/// Loads and parses the module specification document.
///
/// # Arguments
///
/// * `path`: Path to a JSON array of module entries.
pub fn load_module_specs(path: &Path) -> Result<Vec<ModuleSpec>, FatalError> {
    let raw = std::fs::read_to_string(path).map_err(|source| FatalError::ModuleSpecIo {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| FatalError::ModuleSpecParse {
        path: path.to_path_buf(),
        source,
    })
}
