//! Naming & conflict resolution for HAProxy sections
//!
//! Backends are named either explicitly (`backend.name`) or by synthesis from
//! their target as `<service>.<namespace>:<port>`. Two provenance classes are
//! tracked separately:
//!
//! - explicit names must be pairwise unique across declarations
//! - synthesized names are unique per target, so repeated references to the
//!   same target share one section
//!
//! When the merged set still holds one name for two different definitions
//! (an explicit name equal to another target's synthesized name), the
//! collision is rejected. Equal definitions under one name share a section.

use std::collections::{BTreeMap, BTreeSet};

use crate::compiler::CompileError;
use crate::model::{Backend, ListenerKey};

/// Synthesized backend name for a Service target
pub fn backend_name(service: &str, namespace: &str, port: i32) -> String {
    format!("{}.{}:{}", service, namespace, port)
}

/// Frontend name: `http-<addr>-<port>` or `tcp-<addr>-<port>`
pub fn frontend_name(prefix: &str, key: &ListenerKey) -> String {
    let addr: String = key
        .address
        .chars()
        .map(|c| if c == '.' || c == ':' { '_' } else { c })
        .collect();
    format!("{}-{}-{}", prefix, addr, key.port)
}

/// Userlist name for a set of credential Secrets
pub fn userlist_name(namespace: &str, secrets: &[String]) -> String {
    let mut sorted: Vec<&str> = secrets.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    format!("auth_{}_{}", namespace, sorted.join("_"))
}

/// Assigns final backend names and detects collisions
#[derive(Debug, Default)]
pub struct NameResolver {
    explicit: BTreeSet<String>,
    sections: BTreeMap<String, Backend>,
}

impl NameResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend declaration and return its final section name.
    ///
    /// `backend.name` is overwritten with the final name.
    pub fn register(
        &mut self,
        explicit: Option<&str>,
        synthesized: String,
        mut backend: Backend,
    ) -> Result<String, CompileError> {
        let name = match explicit.filter(|n| !n.is_empty()) {
            Some(explicit) => {
                if !self.explicit.insert(explicit.to_string()) {
                    return Err(CompileError::DuplicateBackendName {
                        name: explicit.to_string(),
                    });
                }
                explicit.to_string()
            }
            None => synthesized,
        };
        backend.name = name.clone();

        match self.sections.get(&name) {
            Some(existing) if *existing != backend => {
                Err(CompileError::DuplicateBackendName { name })
            }
            Some(_) => Ok(name),
            None => {
                self.sections.insert(name.clone(), backend);
                Ok(name)
            }
        }
    }

    pub fn section_mut(&mut self, name: &str) -> Option<&mut Backend> {
        self.sections.get_mut(name)
    }

    /// All sections, sorted by name
    pub fn into_sections(self) -> Vec<Backend> {
        self.sections.into_values().collect()
    }
}
