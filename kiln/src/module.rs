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

//! Callable modules and their registry.
//!
//! A module pairs the per-module limits from the specification document with
//! the guest code to run. Guest code arrives either as a shared object whose
//! `guest_main` symbol is resolved at load time, or as a native function
//! registered by an embedder (that is also how the test suites drive the
//! scheduler).

use std::sync::Arc;

use ember::GuestEntry;

use crate::config::ModuleSpec;
use crate::error::FatalError;

/// Symbol every guest shared object must export.
const GUEST_ENTRY_SYMBOL: &[u8] = b"guest_main\0";

enum ModuleCode {
    Native(GuestEntry),
    Shared {
        entry: GuestEntry,
        // Keeps the mapping alive for as long as `entry` may run.
        _library: libloading::Library,
    },
}

pub struct Module {
    pub spec: ModuleSpec,
    code: ModuleCode,
}

impl Module {
    /// Wraps a native entry function; used by embedders and tests.
    pub fn native(spec: ModuleSpec, entry: GuestEntry) -> Module {
        Module {
            spec,
            code: ModuleCode::Native(entry),
        }
    }

    /// Loads the module's guest code from the shared object named in its
    /// specification entry.
    pub fn from_spec(spec: ModuleSpec) -> Result<Module, FatalError> {
        let Some(path) = spec.path.clone() else {
            return Err(FatalError::ModuleWithoutCode(spec.name.clone()));
        };
        unsafe {
            let library =
                libloading::Library::new(&path).map_err(|source| FatalError::ModuleLoad {
                    name: spec.name.clone(),
                    source,
                })?;
            let entry: GuestEntry = *library
                .get::<GuestEntry>(GUEST_ENTRY_SYMBOL)
                .map_err(|source| FatalError::ModuleLoad {
                    name: spec.name.clone(),
                    source,
                })?;
            Ok(Module {
                spec,
                code: ModuleCode::Shared {
                    entry,
                    _library: library,
                },
            })
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The guest entry function to run for each invocation of this module.
    #[inline]
    pub fn entry(&self) -> GuestEntry {
        match &self.code {
            ModuleCode::Native(entry) => *entry,
            ModuleCode::Shared { entry, .. } => *entry,
        }
    }
}

/// The set of modules this process serves. Built during startup and
/// immutable afterwards.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<Module>>,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry::default()
    }

    /// Adds a module, rejecting duplicate names and ports.
    pub fn register(&mut self, module: Module) -> Result<(), FatalError> {
        let duplicate = self
            .modules
            .iter()
            .any(|m| m.spec.name == module.spec.name || m.spec.port == module.spec.port);
        if duplicate {
            return Err(FatalError::DuplicateModule(module.spec.name));
        }
        self.modules.push(Arc::new(module));
        Ok(())
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Module>> {
        self.modules.iter().find(|m| m.spec.name == name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Module>> {
        self.modules.iter()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember::GuestApi;

    fn spec(name: &str, port: u16) -> ModuleSpec {
        ModuleSpec {
            name: name.to_string(),
            path: None,
            port,
            relative_deadline_us: 1_000,
            memory_limit_bytes: 4_096,
            stack_size_bytes: 16 * 1024,
            max_payload_bytes: 1_024,
        }
    }

    fn noop_entry(_api: &mut dyn GuestApi) {}

    #[test]
    fn registry_rejects_duplicates() {
        let mut registry = ModuleRegistry::new();
        registry.register(Module::native(spec("a", 1), noop_entry)).unwrap();
        assert!(matches!(
            registry.register(Module::native(spec("a", 2), noop_entry)),
            Err(FatalError::DuplicateModule(_))
        ));
        assert!(matches!(
            registry.register(Module::native(spec("b", 1), noop_entry)),
            Err(FatalError::DuplicateModule(_))
        ));
        registry.register(Module::native(spec("b", 2), noop_entry)).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.by_name("a").is_some());
        assert!(registry.by_name("c").is_none());
    }

    #[test]
    fn spec_module_requires_a_path() {
        assert!(matches!(
            Module::from_spec(spec("a", 1)),
            Err(FatalError::ModuleWithoutCode(_))
        ));
    }
}
