//! Program calls against an injectable handler registry.
//!
//! A program is defined by its name and a fixed-layout parameter schema.
//! `InMemoryProgramCaller` validates call input against that schema and
//! dispatches to the handler registered under the program name, echoing the
//! input when none is registered. Handlers are registered on a
//! `ProgramRegistry` that the caller is given, so tests install fakes on their
//! own registry instead of patching shared state.

use crate::error::{DbError, DbResult};
use crate::models::{ProgramDefinition, ProgramParam, Record, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Handles one program call: receives the validated input, returns the output.
pub type ProgramHandler = Arc<dyn Fn(Record) -> DbResult<Record> + Send + Sync>;

/// Program name to handler mapping.
#[derive(Default, Clone)]
pub struct ProgramRegistry {
    handlers: Arc<RwLock<HashMap<String, ProgramHandler>>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `program_name`, replacing any earlier one.
    pub fn register<H>(&self, program_name: impl Into<String>, handler: H) -> DbResult<()>
    where
        H: Fn(Record) -> DbResult<Record> + Send + Sync + 'static,
    {
        let name = program_name.into();
        let mut handlers = self
            .handlers
            .write()
            .map_err(|e| DbError::usage(format!("Program registry lock poisoned: {}", e)))?;
        debug!(program = %name, "Registered program handler");
        handlers.insert(name, Arc::new(handler));
        Ok(())
    }

    pub fn unregister(&self, program_name: &str) -> bool {
        self.handlers
            .write()
            .map(|mut h| h.remove(program_name).is_some())
            .unwrap_or(false)
    }

    fn handler(&self, program_name: &str) -> Option<ProgramHandler> {
        self.handlers
            .read()
            .ok()
            .and_then(|h| h.get(program_name).cloned())
    }
}

impl std::fmt::Debug for ProgramRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        f.debug_struct("ProgramRegistry")
            .field("programs", &names)
            .finish()
    }
}

/// Program caller that runs registered handlers in-process.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProgramCaller {
    registry: ProgramRegistry,
}

impl InMemoryProgramCaller {
    pub fn new(registry: ProgramRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ProgramRegistry {
        &self.registry
    }

    /// Bind a definition to this caller.
    pub fn define_program(&self, definition: ProgramDefinition) -> Program {
        Program {
            definition,
            registry: self.registry.clone(),
        }
    }
}

/// A defined program, ready to be called.
#[derive(Debug, Clone)]
pub struct Program {
    definition: ProgramDefinition,
    registry: ProgramRegistry,
}

impl Program {
    pub fn definition(&self) -> &ProgramDefinition {
        &self.definition
    }

    /// Validate `input` against the parameter schema and run the program.
    pub fn call(&self, input: Record) -> DbResult<Record> {
        validate_input(&self.definition, &input)?;
        let name = &self.definition.program_name;
        match self.registry.handler(name) {
            Some(handler) => {
                debug!(program = %name, "Calling program handler");
                handler(input)
            }
            None => {
                debug!(program = %name, "No handler registered; echoing input");
                Ok(input)
            }
        }
    }
}

fn validate_input(definition: &ProgramDefinition, input: &Record) -> DbResult<()> {
    for key in input.keys() {
        if !definition.params_schema.iter().any(|p| &p.name == key) {
            return Err(DbError::binding(format!(
                "program '{}' has no parameter '{}'",
                definition.program_name, key
            )));
        }
    }
    for param in &definition.params_schema {
        if let Some(value) = input.get(&param.name) {
            check_param(param, value)?;
        }
    }
    Ok(())
}

fn check_param(param: &ProgramParam, value: &Value) -> DbResult<()> {
    match (param.decimals, value) {
        (_, Value::Null) => Ok(()),
        (None, Value::Text(text)) => check_width(param, text.chars().count(), param.size),
        (None, Value::Int(v)) => check_width(param, v.to_string().len(), param.size),
        (Some(decimals), Value::Int(v)) => {
            let digits = v.unsigned_abs().to_string().len();
            check_width(param, digits, param.size.saturating_sub(decimals))
        }
        (Some(decimals), Value::Float(v)) if v.is_finite() => {
            // Integer part only; the fraction is rounded to `decimals` places
            let digits = v.abs().trunc().to_string().len();
            check_width(param, digits, param.size.saturating_sub(decimals))
        }
        (_, other) => Err(DbError::binding(format!(
            "parameter '{}' cannot take a {} value",
            param.name,
            other.type_name()
        ))),
    }
}

fn check_width(param: &ProgramParam, width: usize, limit: u32) -> DbResult<()> {
    if width > limit as usize {
        return Err(DbError::binding(format!(
            "parameter '{}' value is {} wide, limit is {}",
            param.name, width, limit
        )));
    }
    Ok(())
}
