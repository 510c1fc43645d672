//! Operator trait: per-operation-type factory for dispatch objects.

use crate::dispatch::OpDispatch;
use crate::Result;
use crate::types::{Model, Operation};

/// What an operator sees when a model is prepared.
pub struct CompileCtx<'a> {
    /// Position of the node in the model's operation list.
    pub node_index: usize,
    pub operation: &'a Operation,
    pub model: &'a Model,
}

impl<'a> CompileCtx<'a> {
    pub fn new(node_index: usize, operation: &'a Operation, model: &'a Model) -> Self {
        Self {
            node_index,
            operation,
            model,
        }
    }

    /// Label used for pipelines and buffers created for this node.
    pub fn label(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.node_index)
    }
}

/// An operation type the driver can run.
///
/// The registry consults `supports` when the runtime asks which operations
/// of a model are supported, and `create_dispatch` once per node when a
/// model is prepared.
pub trait Operator: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this particular node can run on the GPU.
    ///
    /// Defaults to true; operators override it to decline argument
    /// combinations they cannot execute.
    fn supports(&self, _operation: &Operation, _model: &Model) -> bool {
        true
    }

    /// Build the dispatch object for one node.
    fn create_dispatch(&self, ctx: &CompileCtx<'_>) -> Result<Box<dyn OpDispatch>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::types::OperationType;

    struct MockOp;

    impl Operator for MockOp {
        fn name(&self) -> &str {
            "Mock"
        }

        fn create_dispatch(&self, _ctx: &CompileCtx<'_>) -> Result<Box<dyn OpDispatch>> {
            Err(Error::Unsupported("not implemented".to_string()))
        }
    }

    #[test]
    fn test_operator_trait_object() {
        let op: Box<dyn Operator> = Box::new(MockOp);
        assert_eq!(op.name(), "Mock");
        let model = Model::default();
        let operation = Operation::new(OperationType::Add, vec![], vec![]);
        assert!(op.supports(&operation, &model));
    }

    #[test]
    fn test_compile_ctx_labels_by_node() {
        let model = Model::default();
        let operation = Operation::new(OperationType::Conv2d, vec![], vec![]);
        let ctx = CompileCtx::new(3, &operation, &model);
        assert_eq!(ctx.label("conv"), "conv_3");
    }
}
