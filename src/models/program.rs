//! Program-call data models.

use serde::{Deserialize, Serialize};

/// One parameter of a program's fixed-layout parameter list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramParam {
    pub name: String,
    /// Field width in characters (text) or digits (numeric).
    pub size: u32,
    /// Decimal places for packed numeric fields. None means a text field.
    #[serde(default)]
    pub decimals: Option<u32>,
}

impl ProgramParam {
    pub fn text(name: impl Into<String>, size: u32) -> Self {
        Self {
            name: name.into(),
            size,
            decimals: None,
        }
    }

    pub fn decimal(name: impl Into<String>, size: u32, decimals: u32) -> Self {
        Self {
            name: name.into(),
            size,
            decimals: Some(decimals),
        }
    }
}

/// A callable program and its parameter schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramDefinition {
    pub program_name: String,
    pub params_schema: Vec<ProgramParam>,
}

impl ProgramDefinition {
    pub fn new(program_name: impl Into<String>, params_schema: Vec<ProgramParam>) -> Self {
        Self {
            program_name: program_name.into(),
            params_schema,
        }
    }
}
