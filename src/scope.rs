// This module defines the variable and scope model. Variables are front end
// entities with a name, a data format and a category (parameter or local).
// Scopes map the variables that are active inside them to the values that
// carry their contents; entering a scope loads the variables it requires and
// leaving it writes edited values back to their stack homes so that every
// predecessor of a join agrees on where each variable lives. Usage descriptors
// carry the caller supplied usage statistics that drive caching decisions.

//! Variables, scopes and usage statistics.

use hashbrown::HashMap;

use crate::core::format::Format;
use crate::value::ValueId;

/// Identifier of a variable in the unit's variable table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariableId(pub u32);

/// Identifier of a scope in the unit's scope table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableCategory {
    Parameter,
    Local,
}

/// A front end variable.
#[derive(Debug, Clone)]
pub struct Variable<'a> {
    pub name: &'a str,
    pub format: Format,
    pub category: VariableCategory,
}

impl<'a> Variable<'a> {
    pub fn is_parameter(&self) -> bool {
        self.category == VariableCategory::Parameter
    }
}

/// Usage statistics for one variable inside a region, supplied by the caller
/// from its own analysis of the function body.
#[derive(Debug, Clone, Copy)]
pub struct VariableUsage {
    pub variable: VariableId,
    /// Number of reads and writes inside the region.
    pub usages: u32,
    /// Whether the region writes the variable.
    pub edited: bool,
    /// Whether the variable is read after the region ends.
    pub used_after: bool,
}

/// A lexical scope during lowering.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    /// Enclosing scope, if any.
    pub outer: Option<ScopeId>,
    /// Variables the scope requires on entry.
    pub actives: Vec<VariableId>,
    /// Current value of each variable inside the scope.
    pub variables: HashMap<VariableId, ValueId>,
    /// Values loaded on entry, in activation order.
    pub loads: Vec<(VariableId, ValueId)>,
    /// Position of the instruction that ends the scope, filled during replay.
    pub end: Option<i32>,
}

impl Scope {
    pub fn new(outer: Option<ScopeId>, actives: Vec<VariableId>) -> Self {
        Self {
            outer,
            actives,
            variables: HashMap::new(),
            loads: Vec::new(),
            end: None,
        }
    }

    pub fn value_of(&self, variable: VariableId) -> Option<ValueId> {
        self.variables.get(&variable).copied()
    }

    pub fn set_value(&mut self, variable: VariableId, value: ValueId) {
        self.variables.insert(variable, value);
    }

    pub fn is_active(&self, variable: VariableId) -> bool {
        self.actives.contains(&variable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_tracks_variable_values() {
        let variable = VariableId(0);
        let mut scope = Scope::new(None, vec![variable]);

        assert!(scope.is_active(variable));
        assert!(!scope.is_active(VariableId(1)));
        assert_eq!(scope.value_of(variable), None);

        scope.set_value(variable, ValueId(7));
        assert_eq!(scope.value_of(variable), Some(ValueId(7)));

        scope.set_value(variable, ValueId(9));
        assert_eq!(scope.value_of(variable), Some(ValueId(9)));
    }
}
