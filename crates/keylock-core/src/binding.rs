use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::error::LockError;

/// Call-time view of a guarded operation: declared parameter names and the
/// argument values, in declaration order.
///
/// Runtimes that cannot recover parameter names return `None` from
/// [`parameter_names`](InvocationMetadata::parameter_names); name-based key
/// expressions then fail with [`LockError::InvalidParameterBinding`].
pub trait InvocationMetadata {
    fn parameter_names(&self) -> Option<&[String]>;
    fn arguments(&self) -> &[Value];
}

/// Explicitly built invocation metadata.
///
/// ```
/// use keylock_core::Invocation;
///
/// let invocation = Invocation::new().arg("id", &42).unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    names: Option<Vec<String>>,
    args: Vec<Value>,
}

impl Invocation {
    /// Create an invocation with named parameters and no arguments yet.
    pub fn new() -> Self {
        Self {
            names: Some(Vec::new()),
            args: Vec::new(),
        }
    }

    /// Create an invocation whose parameter names are unknown.
    pub fn positional(args: Vec<Value>) -> Self {
        Self { names: None, args }
    }

    /// Create an invocation from parallel name and value lists.
    pub fn from_parts(names: Vec<String>, args: Vec<Value>) -> Self {
        Self {
            names: Some(names),
            args,
        }
    }

    /// Append a named argument, serializing it to a JSON value.
    pub fn arg<T: Serialize + ?Sized>(
        mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<Self, LockError> {
        let name = name.into();
        let value = serde_json::to_value(value).map_err(|e| {
            LockError::InvalidParameterBinding(format!(
                "Failed to serialize argument '{}': {}",
                name, e
            ))
        })?;
        self.names.get_or_insert_with(Vec::new).push(name);
        self.args.push(value);
        Ok(self)
    }
}

impl InvocationMetadata for Invocation {
    fn parameter_names(&self) -> Option<&[String]> {
        self.names.as_deref()
    }

    fn arguments(&self) -> &[Value] {
        &self.args
    }
}

/// Name to value context for one invocation.
#[derive(Debug, Clone)]
pub struct ParameterBinding {
    variables: HashMap<String, Value>,
}

impl ParameterBinding {
    /// Build a binding from raw names and values.
    pub fn new(names: Option<&[String]>, values: &[Value]) -> Result<Self, LockError> {
        let names = names.ok_or_else(|| {
            LockError::InvalidParameterBinding(
                "parameter names are not available for this invocation".to_string(),
            )
        })?;

        if names.len() != values.len() {
            return Err(LockError::InvalidParameterBinding(format!(
                "{} parameter names but {} arguments",
                names.len(),
                values.len()
            )));
        }

        let mut variables = HashMap::with_capacity(names.len());
        for (name, value) in names.iter().zip(values) {
            if variables.insert(name.clone(), value.clone()).is_some() {
                return Err(LockError::InvalidParameterBinding(format!(
                    "duplicate parameter name '{}'",
                    name
                )));
            }
        }

        Ok(Self { variables })
    }

    /// Build a binding from an invocation.
    pub fn from_invocation(invocation: &impl InvocationMetadata) -> Result<Self, LockError> {
        Self::new(invocation.parameter_names(), invocation.arguments())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}
