//! Operator registry consulted during lowering.
//!
//! The registry is an explicit context object created per export invocation
//! and handed to the lowering engine, so no state leaks across cases.
//! Registration order only matters for conflict detection.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::ir::{InvalidQualName, LocalFunction, QualName};
use crate::lower::{LowerContext, LowerError};
use crate::trace::TracedNode;

/// Symbolic rewrite invoked at lowering time. It receives the graph-building
/// context and the traced call site, emits the replacement node, and must
/// set its output type explicitly.
pub type RewriteFn =
    Arc<dyn Fn(&mut LowerContext<'_>, &TracedNode) -> Result<crate::ir::ValueId, LowerError> + Send + Sync>;

/// One substitution rule: origin operator, target opset, optional compiled
/// local function, and the rewrite that produces the call-site node.
#[derive(Clone)]
pub struct RegistryEntry {
    pub origin: QualName,
    pub opset_version: i64,
    pub function: Option<Arc<LocalFunction>>,
    pub rewrite: RewriteFn,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("an entry for `{name}` at opset {opset_version} is already registered")]
    Conflict { name: String, opset_version: i64 },
    #[error(transparent)]
    InvalidName(#[from] InvalidQualName),
}

/// Mapping from `(origin name, target opset)` to a substitution rule.
/// Consulted read-only by the lowering engine.
#[derive(Default)]
pub struct RegistryContext {
    entries: HashMap<(QualName, i64), RegistryEntry>,
}

impl RegistryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry, failing with [`RegistryError::Conflict`] when the
    /// `(origin, opset)` pair is already present and `overwrite` is false.
    pub fn register(&mut self, entry: RegistryEntry, overwrite: bool) -> Result<(), RegistryError> {
        let key = (entry.origin.clone(), entry.opset_version);
        if !overwrite && self.entries.contains_key(&key) {
            return Err(RegistryError::Conflict {
                name: entry.origin.to_string(),
                opset_version: entry.opset_version,
            });
        }
        self.entries.insert(key, entry);
        Ok(())
    }

    /// Registers a symbolic rewrite for `symbolic_name` (qualified
    /// `<namespace>::<op>` form) at `opset_version`, optionally carrying a
    /// script-compiled local function to attach to the exported graph.
    pub fn register_custom_op_symbolic<F>(
        &mut self,
        symbolic_name: &str,
        symbolic_fn: F,
        opset_version: i64,
        script_fn: Option<LocalFunction>,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&mut LowerContext<'_>, &TracedNode) -> Result<crate::ir::ValueId, LowerError>
            + Send
            + Sync
            + 'static,
    {
        let origin = QualName::parse(symbolic_name)?;
        self.register(
            RegistryEntry {
                origin,
                opset_version,
                function: script_fn.map(Arc::new),
                rewrite: Arc::new(symbolic_fn),
            },
            false,
        )
    }

    /// Pure lookup by exact qualified name and opset version.
    pub fn lookup(&self, origin: &QualName, opset_version: i64) -> Option<&RegistryEntry> {
        self.entries.get(&(origin.clone(), opset_version))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry. Provided for tests that reuse a context.
    pub fn reset(&mut self) {
        self.entries.clear();
    }
}
