//! Opcode registry: canonical opcode -> definition and handler.
//!
//! The registry is assembled once at startup from two sources:
//! - the game's opcode catalogue (argument counts only, see
//!   [`definitions`](super::definitions)), which yields generic definitions
//!   bound to a no-op handler
//! - handlers bound in code, such as the built-in control opcodes, whose
//!   definitions carry named and typed parameters
//!
//! A bound definition refines the catalogue entry for the same opcode when
//! their arities agree. Defining or binding the same opcode twice is a
//! configuration error.

use crate::virtual_machine::args::OpcodeArgs;
use crate::virtual_machine::data_type::TypeConstraint;
use crate::virtual_machine::definitions::OpcodeRecord;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::{OpcodeId, undo_negation};
use crate::virtual_machine::opcodes;
use crate::virtual_machine::vm::ExecContext;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Behavior invoked when an opcode executes.
pub type OpcodeHandler =
    Arc<dyn Fn(&mut ExecContext<'_>, &OpcodeArgs) -> Result<(), VMError> + Send + Sync>;

/// Wraps a closure or function as an [`OpcodeHandler`].
pub fn handler_fn<F>(f: F) -> OpcodeHandler
where
    F: Fn(&mut ExecContext<'_>, &OpcodeArgs) -> Result<(), VMError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Shape of one declared parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    Single(TypeConstraint),
    /// Arguments up to and including an end marker.
    Variadic(TypeConstraint),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
}

impl Param {
    pub fn single(name: &str, constraint: TypeConstraint) -> Self {
        Self {
            name: name.to_string(),
            kind: ParamKind::Single(constraint),
        }
    }

    pub fn variadic(name: &str, constraint: TypeConstraint) -> Self {
        Self {
            name: name.to_string(),
            kind: ParamKind::Variadic(constraint),
        }
    }
}

/// Argument count of a definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arity {
    Fixed(usize),
    Variadic { fixed: usize },
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Fixed(n) => write!(f, "{}", n),
            Arity::Variadic { fixed } => write!(f, "{} + variadic", fixed),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OpcodeDefinition {
    pub opcode: OpcodeId,
    pub symbol: String,
    pub params: Vec<Param>,
    /// Free-form description from the catalogue.
    pub notes: String,
}

impl OpcodeDefinition {
    pub fn new(opcode: OpcodeId, symbol: &str, params: Vec<Param>) -> Self {
        Self {
            opcode,
            symbol: symbol.to_string(),
            params,
            notes: String::new(),
        }
    }

    /// Builds an untyped definition from a catalogue record.
    pub fn generic(record: &OpcodeRecord, symbol: Option<&str>) -> Self {
        let params = match usize::try_from(record.argument_count) {
            Ok(count) => (0..count)
                .map(|i| Param::single(&format!("arg_{}", i), TypeConstraint::Any))
                .collect(),
            Err(_) => vec![Param::variadic("var_args", TypeConstraint::Any)],
        };
        let symbol = match symbol {
            Some(name) => name.to_lowercase(),
            None => format!("opcode_{}", record.opcode),
        };
        Self {
            opcode: record.opcode,
            symbol,
            params,
            notes: record.notes.clone(),
        }
    }

    /// The opcode rendered as four hex digits.
    pub fn canonical_name(&self) -> String {
        self.opcode.to_string()
    }

    pub fn arity(&self) -> Arity {
        let fixed = self
            .params
            .iter()
            .filter(|p| matches!(p.kind, ParamKind::Single(_)))
            .count();
        if self
            .params
            .iter()
            .any(|p| matches!(p.kind, ParamKind::Variadic(_)))
        {
            Arity::Variadic { fixed }
        } else {
            Arity::Fixed(fixed)
        }
    }
}

struct RegistryEntry {
    definition: Arc<OpcodeDefinition>,
    handler: OpcodeHandler,
    bound: bool,
}

/// Immutable lookup table used by the decoder and the engine.
///
/// Maps each canonical opcode to its definition and handler. Lookups by raw
/// opcode word strip the negation bit first. Built once through
/// [`RegistryBuilder`] and never modified afterwards.
pub struct OpcodeRegistry {
    entries: HashMap<OpcodeId, RegistryEntry>,
}

impl OpcodeRegistry {
    /// Starts an empty builder.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry with only the built-in control opcodes.
    pub fn builtin() -> Result<Self, VMError> {
        let mut builder = Self::builder();
        builder.with_builtins()?;
        builder.build()
    }

    /// Looks up a raw opcode word, stripping the negation flag.
    pub fn lookup(&self, raw: u16) -> Option<(&OpcodeDefinition, bool)> {
        let (id, negated) = undo_negation(raw);
        self.definition(id).map(|d| (d, negated))
    }

    pub fn definition(&self, opcode: OpcodeId) -> Option<&OpcodeDefinition> {
        self.entries.get(&opcode).map(|e| e.definition.as_ref())
    }

    /// Shared definition and handler, detached from the registry borrow.
    pub fn entry(&self, opcode: OpcodeId) -> Option<(Arc<OpcodeDefinition>, OpcodeHandler)> {
        self.entries
            .get(&opcode)
            .map(|e| (Arc::clone(&e.definition), Arc::clone(&e.handler)))
    }

    /// Whether the opcode has behavior beyond the catalogue no-op.
    pub fn is_bound(&self, opcode: OpcodeId) -> bool {
        self.entries.get(&opcode).is_some_and(|e| e.bound)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    symbols: HashMap<OpcodeId, String>,
    catalogue: HashMap<OpcodeId, OpcodeRecord>,
    bound: HashMap<OpcodeId, (OpcodeDefinition, OpcodeHandler)>,
}

impl RegistryBuilder {
    /// Supplies human-readable names for catalogue entries.
    pub fn symbols(&mut self, symbols: HashMap<OpcodeId, String>) -> &mut Self {
        self.symbols.extend(symbols);
        self
    }

    pub fn catalogue<I>(&mut self, records: I) -> Result<&mut Self, VMError>
    where
        I: IntoIterator<Item = OpcodeRecord>,
    {
        for record in records {
            match self.catalogue.entry(record.opcode) {
                Entry::Occupied(_) => {
                    return Err(VMError::DuplicateOpcode {
                        opcode: record.opcode,
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
            }
        }
        Ok(self)
    }

    /// Binds behavior to an opcode.
    pub fn bind(
        &mut self,
        definition: OpcodeDefinition,
        handler: OpcodeHandler,
    ) -> Result<&mut Self, VMError> {
        if self.bound.contains_key(&definition.opcode) {
            return Err(VMError::DuplicateOpcode {
                opcode: definition.opcode,
            });
        }
        self.bound.insert(definition.opcode, (definition, handler));
        Ok(self)
    }

    pub fn with_builtins(&mut self) -> Result<&mut Self, VMError> {
        opcodes::register(self)?;
        Ok(self)
    }

    pub fn build(self) -> Result<OpcodeRegistry, VMError> {
        let mut entries = HashMap::with_capacity(self.catalogue.len() + self.bound.len());
        for (opcode, record) in &self.catalogue {
            let definition =
                OpcodeDefinition::generic(record, self.symbols.get(opcode).map(String::as_str));
            entries.insert(
                *opcode,
                RegistryEntry {
                    handler: noop_handler(*opcode),
                    definition: Arc::new(definition),
                    bound: false,
                },
            );
        }
        for (opcode, (mut definition, handler)) in self.bound {
            if let Some(existing) = entries.get(&opcode) {
                let catalogue = existing.definition.arity();
                let declared = definition.arity();
                if catalogue != declared {
                    return Err(VMError::ArityConflict {
                        opcode,
                        declared: declared.to_string(),
                        catalogue: catalogue.to_string(),
                    });
                }
                definition.notes = existing.definition.notes.clone();
            }
            entries.insert(
                opcode,
                RegistryEntry {
                    definition: Arc::new(definition),
                    handler,
                    bound: true,
                },
            );
        }
        Ok(OpcodeRegistry { entries })
    }
}

/// Handler for catalogue opcodes without behavior; warns on first use.
fn noop_handler(opcode: OpcodeId) -> OpcodeHandler {
    let warned = AtomicBool::new(false);
    handler_fn(move |ctx, _args| {
        if !warned.swap(true, Ordering::Relaxed) {
            crate::warn!(
                "opcode {} ({}) has no behavior, executing as no-op",
                opcode,
                ctx.definition().symbol
            );
        }
        Ok(())
    })
}
