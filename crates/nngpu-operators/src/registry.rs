//! Core operator registry.

use nngpu_core::{OperationType, OperatorRegistry};

use crate::operators::{Conv2dOp, DepthwiseConv2dOp, SoftmaxOp};

/// Returns an operator registry pre-populated with the GPU operators.
///
/// The registry includes:
/// - CONV_2D
/// - DEPTHWISE_CONV_2D
/// - SOFTMAX
///
/// Every other operation type is reported as unsupported.
pub fn core_operator_registry() -> OperatorRegistry {
    let mut registry = OperatorRegistry::new();

    registry
        .register(OperationType::Conv2d, Conv2dOp)
        .register(OperationType::DepthwiseConv2d, DepthwiseConv2dOp)
        .register(OperationType::Softmax, SoftmaxOp);

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_registry_contents() {
        let registry = core_operator_registry();
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.operation_types(),
            vec![
                OperationType::Conv2d,
                OperationType::DepthwiseConv2d,
                OperationType::Softmax
            ]
        );
        assert!(!registry.contains(OperationType::Add));
        assert_eq!(
            registry.get(OperationType::Softmax).map(|op| op.name()),
            Some("SOFTMAX")
        );
    }
}
