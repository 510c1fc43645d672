//! Operator registry keyed by operation type.

use crate::operator::Operator;
use crate::types::{Model, OperationType};
use std::collections::HashMap;

/// Maps operation types to their `Operator` implementations.
///
/// # Example
///
/// ```ignore
/// let mut registry = OperatorRegistry::new();
/// registry
///     .register(OperationType::Conv2d, Conv2dOp)
///     .register(OperationType::Softmax, SoftmaxOp);
/// ```
pub struct OperatorRegistry {
    operators: HashMap<OperationType, Box<dyn Operator>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self {
            operators: HashMap::new(),
        }
    }

    /// Register an operator. Returns `self` for chaining.
    pub fn register<O>(&mut self, op_type: OperationType, operator: O) -> &mut Self
    where
        O: Operator + 'static,
    {
        self.operators.insert(op_type, Box::new(operator));
        self
    }

    pub fn get(&self, op_type: OperationType) -> Option<&dyn Operator> {
        self.operators.get(&op_type).map(|op| op.as_ref())
    }

    pub fn contains(&self, op_type: OperationType) -> bool {
        self.operators.contains_key(&op_type)
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Registered operation types, in operation-code order.
    pub fn operation_types(&self) -> Vec<OperationType> {
        let mut types: Vec<_> = self.operators.keys().copied().collect();
        types.sort();
        types
    }

    /// One flag per model operation, in declaration order.
    ///
    /// An operation is supported when an operator is registered for its type
    /// and that operator accepts the node's arguments.
    pub fn supported_operations(&self, model: &Model) -> Vec<bool> {
        model
            .operations
            .iter()
            .map(|operation| {
                self.get(operation.op_type)
                    .is_some_and(|op| op.supports(operation, model))
            })
            .collect()
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::CompileCtx;
    use crate::types::Operation;
    use crate::{Error, OpDispatch, Result};

    struct SoftmaxOp;
    impl Operator for SoftmaxOp {
        fn name(&self) -> &str {
            "Softmax"
        }
        fn create_dispatch(&self, _ctx: &CompileCtx<'_>) -> Result<Box<dyn OpDispatch>> {
            Err(Error::Unsupported("mock operator for testing".to_string()))
        }
    }

    struct PickyConv;
    impl Operator for PickyConv {
        fn name(&self) -> &str {
            "Conv2d"
        }
        fn supports(&self, operation: &Operation, _model: &Model) -> bool {
            operation.inputs.len() == 7
        }
        fn create_dispatch(&self, _ctx: &CompileCtx<'_>) -> Result<Box<dyn OpDispatch>> {
            Err(Error::Unsupported("mock operator for testing".to_string()))
        }
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = OperatorRegistry::new();
        registry
            .register(OperationType::Softmax, SoftmaxOp)
            .register(OperationType::Conv2d, PickyConv);

        assert_eq!(registry.len(), 2);
        assert!(registry.contains(OperationType::Softmax));
        assert!(!registry.contains(OperationType::Add));
        assert_eq!(registry.get(OperationType::Conv2d).unwrap().name(), "Conv2d");
        assert_eq!(
            registry.operation_types(),
            vec![OperationType::Conv2d, OperationType::Softmax]
        );
    }

    #[test]
    fn test_supported_operations_per_node() {
        let mut registry = OperatorRegistry::new();
        registry
            .register(OperationType::Softmax, SoftmaxOp)
            .register(OperationType::Conv2d, PickyConv);

        let model = Model {
            operations: vec![
                Operation::new(OperationType::Conv2d, vec![0; 7], vec![1]),
                Operation::new(OperationType::Conv2d, vec![0; 10], vec![1]),
                Operation::new(OperationType::Add, vec![0, 0, 0], vec![1]),
                Operation::new(OperationType::Softmax, vec![0, 0], vec![1]),
            ],
            ..Default::default()
        };
        assert_eq!(
            registry.supported_operations(&model),
            vec![true, false, false, true]
        );
    }

    #[test]
    fn test_empty_registry() {
        let registry = OperatorRegistry::default();
        assert!(registry.is_empty());
        assert!(registry.supported_operations(&Model::default()).is_empty());
    }
}
