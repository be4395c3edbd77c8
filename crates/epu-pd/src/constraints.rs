use epu_core::Constraint;
use serde_json::{Map, Value};

/// Checks process constraints against advertised resource properties.
///
/// A constraint with no accepted values places no requirement. Otherwise the
/// property must be advertised with one of the accepted values.
pub fn match_constraints(constraints: &[Constraint], properties: &Map<String, Value>) -> bool {
    constraints.iter().all(|constraint| {
        if constraint.accepts.is_empty() {
            return true;
        }
        properties
            .get(&constraint.property)
            .is_some_and(|advertised| constraint.accepts.contains(advertised))
    })
}
