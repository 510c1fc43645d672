//! Service boundary tests: capabilities, support query and preparation.

mod common;

use common::*;
use nngpu_core::{DeviceStatus, ErrorStatus, ExecutionPreference, ExecutorKind, Model, Operation, OperationType};
use nngpu_runtime::{Device, DriverConfig, ExecutionNotifier, PreparedNotifier};

fn recording_device() -> Device {
    let (manager, _backend) = recording_manager();
    Device::with_manager("nngpu-test", manager)
}

#[test]
fn test_status_and_capabilities() {
    let device = recording_device();
    assert_eq!(device.get_status(), DeviceStatus::Available);

    let (status, capabilities) = device.get_capabilities();
    assert_eq!(status, ErrorStatus::Success);
    assert!(capabilities.float32_performance.exec_time > 0.0);
}

#[test]
fn test_unregistered_operation_is_unsupported() {
    let device = recording_device();
    let (status, supported) = device.get_supported_operations(&softmax_then_add_model());
    assert_eq!(status, ErrorStatus::Success);
    assert_eq!(supported, vec![true, false]);
}

#[test]
fn test_fused_activation_is_unsupported() {
    let device = recording_device();
    let relu = conv_model(
        [1, 4, 4, 4],
        [2, 1, 1, 4],
        [1, 4, 4, 2],
        [0, 0, 0, 0],
        [1, 1],
        1,
        &ramp(8, 1.0),
        &ramp(2, 1.0),
    );
    let (status, supported) = device.get_supported_operations(&relu);
    assert_eq!(status, ErrorStatus::Success);
    assert_eq!(supported, vec![false]);
}

#[test]
fn test_support_query_rejects_invalid_model() {
    let device = recording_device();
    let mut model = softmax_model(&[1, 8], 1.0);
    model
        .operations
        .push(Operation::new(OperationType::Softmax, vec![0, 99], vec![2]));

    let (status, supported) = device.get_supported_operations(&model);
    assert_eq!(status, ErrorStatus::InvalidArgument);
    assert!(supported.is_empty());
}

#[test]
fn test_prepare_and_execute() {
    let device = recording_device();
    let model = scenario_conv_model();

    let prepared_cb = PreparedNotifier::new();
    let status = device.prepare_model(
        &model,
        ExecutionPreference::FastSingleAnswer,
        prepared_cb.clone(),
    );
    assert_eq!(status, ErrorStatus::Success);
    assert_eq!(prepared_cb.wait(), ErrorStatus::Success);

    let prepared = prepared_cb.prepared_model().unwrap();
    let execution = ExecutionNotifier::new();
    let input = ramp(8 * 8 * 3, 1.0);
    let launch = prepared.execute(make_request(&model, &[&input]), execution.clone());
    assert_eq!(launch, ErrorStatus::Success);
    assert_eq!(execution.wait(), ErrorStatus::Success);
}

#[test]
fn test_prepare_rejects_invalid_model() {
    let device = recording_device();
    let mut model = Model::default();
    model.input_indexes.push(3);

    let callback = PreparedNotifier::new();
    let status = device.prepare_model(&model, ExecutionPreference::LowPower, callback.clone());
    assert_eq!(status, ErrorStatus::InvalidArgument);
    assert_eq!(callback.wait(), ErrorStatus::InvalidArgument);
    assert!(callback.prepared_model().is_none());
}

#[test]
fn test_prepare_fails_on_unsupported_operation() {
    let device = recording_device();
    let callback = PreparedNotifier::new();
    let status = device.prepare_model(
        &softmax_then_add_model(),
        ExecutionPreference::SustainedSpeed,
        callback.clone(),
    );
    assert_eq!(status, ErrorStatus::GeneralFailure);
    assert_eq!(callback.wait(), ErrorStatus::GeneralFailure);
    assert!(callback.prepared_model().is_none());
}

#[test]
fn test_start_and_shutdown_recording_device() {
    let device = Device::new("nngpu-dry-run", DriverConfig::new(ExecutorKind::Recording));
    assert!(!device.manager().is_initialized());
    device.start().unwrap();
    assert!(device.manager().is_initialized());
    device.shutdown();
    assert!(!device.manager().is_initialized());
}
