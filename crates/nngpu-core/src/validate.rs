//! Structural validation of models and requests.
//!
//! Runs before any GPU work. Every failure is an `InvalidArgument`.

use crate::types::{Model, OperandLifetime, Request, RequestArgument, byte_range};
use crate::{Error, Result};

fn invalid(message: String) -> Error {
    Error::InvalidArgument(message)
}

/// Check that a model is internally consistent.
pub fn validate_model(model: &Model) -> Result<()> {
    let operand_count = model.operands.len();

    for (index, operand) in model.operands.iter().enumerate() {
        match operand.lifetime {
            OperandLifetime::Constant | OperandLifetime::ScalarParameter => {
                let loc = operand.location;
                let end = byte_range(loc.offset, loc.length)?.end;
                if end > model.operand_values.len() {
                    return Err(invalid(format!(
                        "operand {index} value [{}, {end}) exceeds the value blob ({} bytes)",
                        loc.offset,
                        model.operand_values.len()
                    )));
                }
                if operand.operand_type.is_scalar() && loc.length != 4 {
                    return Err(invalid(format!(
                        "scalar operand {index} has {} bytes of data",
                        loc.length
                    )));
                }
            }
            OperandLifetime::ModelInput
            | OperandLifetime::ModelOutput
            | OperandLifetime::Intermediate => {
                if operand.dimensions.contains(&0) {
                    return Err(invalid(format!(
                        "operand {index} has unspecified dimensions {:?}",
                        operand.dimensions
                    )));
                }
            }
            OperandLifetime::NoValue => {}
        }
    }

    for (node, operation) in model.operations.iter().enumerate() {
        if operation.outputs.is_empty() {
            return Err(invalid(format!(
                "{} node {node} has no outputs",
                operation.op_type
            )));
        }
        for &index in operation.inputs.iter().chain(&operation.outputs) {
            if index >= operand_count {
                return Err(invalid(format!(
                    "{} node {node} references operand {index} (model has {operand_count})",
                    operation.op_type
                )));
            }
        }
        for &index in &operation.outputs {
            if model.operands[index].is_constant() {
                return Err(invalid(format!(
                    "{} node {node} writes constant operand {index}",
                    operation.op_type
                )));
            }
        }
    }

    check_io_list(model, &model.input_indexes, OperandLifetime::ModelInput, "input")?;
    check_io_list(model, &model.output_indexes, OperandLifetime::ModelOutput, "output")?;
    Ok(())
}

fn check_io_list(
    model: &Model,
    indexes: &[usize],
    lifetime: OperandLifetime,
    what: &str,
) -> Result<()> {
    for (position, &index) in indexes.iter().enumerate() {
        let operand = model.operands.get(index).ok_or_else(|| {
            invalid(format!("model {what} {position} references missing operand {index}"))
        })?;
        if operand.lifetime != lifetime {
            return Err(invalid(format!(
                "model {what} {position} (operand {index}) has lifetime {:?}",
                operand.lifetime
            )));
        }
    }
    Ok(())
}

/// Check a request against the model it will run on.
pub fn validate_request(request: &Request, model: &Model) -> Result<()> {
    check_arguments(request, model, &request.inputs, &model.input_indexes, "input")?;
    check_arguments(request, model, &request.outputs, &model.output_indexes, "output")?;
    Ok(())
}

fn check_arguments(
    request: &Request,
    model: &Model,
    arguments: &[RequestArgument],
    indexes: &[usize],
    what: &str,
) -> Result<()> {
    if arguments.len() != indexes.len() {
        return Err(invalid(format!(
            "request has {} {what}s, model expects {}",
            arguments.len(),
            indexes.len()
        )));
    }

    for (position, (argument, &index)) in arguments.iter().zip(indexes).enumerate() {
        let operand = model.operand(index)?;
        if argument.has_no_value {
            return Err(invalid(format!("request {what} {position} has no value")));
        }
        if !argument.dimensions.is_empty() && argument.dimensions != operand.dimensions {
            return Err(invalid(format!(
                "request {what} {position} dimensions {:?} differ from the model's {:?}",
                argument.dimensions, operand.dimensions
            )));
        }
        let pool = request.pools.get(argument.pool_index).ok_or_else(|| {
            invalid(format!(
                "request {what} {position} references pool {} (request has {})",
                argument.pool_index,
                request.pools.len()
            ))
        })?;
        let end = argument
            .offset
            .checked_add(argument.length)
            .filter(|end| *end <= pool.len());
        if end.is_none() {
            return Err(invalid(format!(
                "request {what} {position} range of {} bytes at {} exceeds pool {} ({} bytes)",
                argument.length,
                argument.offset,
                argument.pool_index,
                pool.len()
            )));
        }
        if argument.length != operand.byte_len() {
            return Err(invalid(format!(
                "request {what} {position} has {} bytes, operand {index} needs {}",
                argument.length,
                operand.byte_len()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemoryPool, Operand, OperandType, Operation, OperationType};

    fn softmax_model() -> Model {
        let mut model = Model::default();
        let input = model.push_operand(Operand::tensor(
            OperandType::TensorFloat32,
            &[1, 4],
            OperandLifetime::ModelInput,
        ));
        let beta = model.push_scalar_f32(1.0);
        let output = model.push_operand(Operand::tensor(
            OperandType::TensorFloat32,
            &[1, 4],
            OperandLifetime::ModelOutput,
        ));
        model.operations.push(Operation::new(
            OperationType::Softmax,
            vec![input, beta],
            vec![output],
        ));
        model.input_indexes = vec![input];
        model.output_indexes = vec![output];
        model
    }

    fn request() -> Request {
        Request {
            inputs: vec![RequestArgument::new(0, 0, 16)],
            outputs: vec![RequestArgument::new(0, 16, 16)],
            pools: vec![MemoryPool::new("ashmem", 32).unwrap()],
        }
    }

    #[test]
    fn test_valid_model_and_request() {
        let model = softmax_model();
        validate_model(&model).unwrap();
        validate_request(&request(), &model).unwrap();
    }

    #[test]
    fn test_model_with_dangling_operand() {
        let mut model = softmax_model();
        model.operations[0].inputs.push(42);
        let err = validate_model(&model).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_model_output_list_must_name_outputs() {
        let mut model = softmax_model();
        model.output_indexes = vec![0];
        assert!(validate_model(&model).is_err());
    }

    #[test]
    fn test_request_argument_count() {
        let model = softmax_model();
        let mut req = request();
        req.inputs.clear();
        assert!(validate_request(&req, &model).is_err());
    }

    #[test]
    fn test_request_pool_range_and_length() {
        let model = softmax_model();

        let mut req = request();
        req.outputs[0].pool_index = 3;
        assert!(validate_request(&req, &model).is_err());

        let mut req = request();
        req.outputs[0].offset = 20;
        assert!(validate_request(&req, &model).is_err());

        let mut req = request();
        req.inputs[0].length = 8;
        assert!(validate_request(&req, &model).is_err());

        let mut req = request();
        req.inputs[0].dimensions = vec![2, 2];
        assert!(validate_request(&req, &model).is_err());
    }

    #[test]
    fn test_overflowing_request_range_is_invalid() {
        let model = softmax_model();
        let mut req = request();
        req.inputs[0] = RequestArgument::new(0, usize::MAX - 4, 16);
        assert!(matches!(
            validate_request(&req, &model),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_overflowing_constant_location_is_invalid() {
        let mut model = softmax_model();
        model.operands[1].location.offset = usize::MAX - 1;
        assert!(matches!(validate_model(&model), Err(Error::InvalidArgument(_))));
        assert!(matches!(model.scalar_f32(1), Err(Error::InvalidArgument(_))));
    }
}
