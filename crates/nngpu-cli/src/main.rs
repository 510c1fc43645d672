//! nngpu CLI - query the driver, look up tuned shader configurations, run a demo convolution.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use nngpu_core::geometry::{PaddingScheme, output_size};
use nngpu_core::{
    ExecutorKind, MemoryPool, Model, Operand, OperandLifetime, OperandType, Operation,
    OperationType, Request, RequestArgument,
};
use nngpu_operators::{ConvKind, ConvSetup, DEFAULT_CONV_CONFIG};
use nngpu_runtime::{Device, DriverConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nngpu")]
#[command(about = "GPU compute driver for neural network models", long_about = None)]
#[command(version)]
struct Cli {
    /// Executor backend: vulkan, gles or recording
    #[arg(short, long, default_value = "vulkan", global = true)]
    executor: ExecutorKind,

    /// Tuning file loaded ahead of the built-in table
    #[arg(short, long, value_name = "FILE", global = true)]
    tuning_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the performance capabilities of the selected backend
    Capabilities,
    /// Show the signature and shader configuration of a convolution shape
    Signature {
        /// Input shape as NxHxWxC
        #[arg(long, value_name = "NxHxWxC")]
        input: String,

        /// Filter shape as OxHxWxI
        #[arg(long, value_name = "OxHxWxI")]
        filter: String,

        /// Implicit padding scheme
        #[arg(long, value_enum, default_value_t = Padding::Same)]
        padding: Padding,

        /// Stride along both spatial axes
        #[arg(long, default_value = "1")]
        stride: u32,
    },
    /// Prepare and run a 1x8x8x3 convolution and report each run
    Demo {
        /// Number of requests to execute
        #[arg(short, long, default_value = "2")]
        runs: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Padding {
    Same,
    Valid,
}

impl From<Padding> for PaddingScheme {
    fn from(padding: Padding) -> Self {
        match padding {
            Padding::Same => PaddingScheme::Same,
            Padding::Valid => PaddingScheme::Valid,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = DriverConfig::new(cli.executor);
    if let Some(path) = cli.tuning_file {
        config = config.with_tuning_file(path);
    }

    match cli.command {
        Commands::Capabilities => cmd_capabilities(config),
        Commands::Signature {
            input,
            filter,
            padding,
            stride,
        } => cmd_signature(config, &input, &filter, padding.into(), stride),
        Commands::Demo { runs } => cmd_demo(config, runs),
    }
}

fn cmd_capabilities(config: DriverConfig) -> Result<()> {
    let device = Device::new("nngpu", config);
    let (status, capabilities) = device.get_capabilities();
    println!("executor: {}", device.manager().kind());
    println!("status:   {status:?}");
    println!(
        "float32:  exec_time {:.2}, power_usage {:.2}",
        capabilities.float32_performance.exec_time,
        capabilities.float32_performance.power_usage
    );
    println!(
        "quant8:   exec_time {:.2}, power_usage {:.2}",
        capabilities.quantized8_performance.exec_time,
        capabilities.quantized8_performance.power_usage
    );
    println!(
        "relaxed:  exec_time {:.2}, power_usage {:.2}",
        capabilities.relaxed_float32_to_float16_performance.exec_time,
        capabilities.relaxed_float32_to_float16_performance.power_usage
    );
    Ok(())
}

fn cmd_signature(
    config: DriverConfig,
    input: &str,
    filter: &str,
    scheme: PaddingScheme,
    stride: u32,
) -> Result<()> {
    let input = parse_shape(input).context("Invalid --input shape")?;
    let filter = parse_shape(filter).context("Invalid --filter shape")?;
    if input[3] != filter[3] {
        bail!(
            "Input has {} channels but the filter expects {}",
            input[3],
            filter[3]
        );
    }
    if stride == 0 {
        bail!("Stride must be positive");
    }

    let out_h = output_size(input[1], filter[1], stride, 1, scheme);
    let out_w = output_size(input[2], filter[2], stride, 1, scheme);
    if out_h == 0 || out_w == 0 {
        bail!("Filter does not fit the input with {scheme:?} padding");
    }
    let output = [input[0], out_h, out_w, filter[0]];

    let model = conv_model(
        input,
        filter,
        output,
        ConvPadding::Scheme(scheme as i32),
        stride as i32,
    );
    let key = conv_signature(&model)?;

    let tuning = config.tuning_cache();
    let tuned = tuning.lookup(&key);
    let effective = tuning.lookup_or(&key, DEFAULT_CONV_CONFIG);

    println!("signature: {key}");
    match tuned {
        Some(found) => println!("tuned:     {found}"),
        None => println!("tuned:     (none)"),
    }
    println!("effective: {effective}");
    Ok(())
}

fn conv_signature(model: &Model) -> Result<String> {
    let setup = ConvSetup::derive(ConvKind::Standard, &model.operations[0], model)
        .context("Failed to derive convolution parameters")?;
    Ok(setup.signature.key())
}

fn cmd_demo(config: DriverConfig, runs: usize) -> Result<()> {
    let device = Device::new("nngpu-demo", config);
    device
        .start()
        .with_context(|| format!("Failed to start the {} executor", device.manager().kind()))?;

    let input = [1, 8, 8, 3];
    let filter = [8, 3, 3, 3];
    let output = [1, 8, 8, 8];
    let model = Arc::new(conv_model(input, filter, output, ConvPadding::Explicit(1), 1));

    let (status, supported) = device.get_supported_operations(&model);
    println!("support query: {status:?} {supported:?}");

    let manager = device.manager();
    let mut executor = manager
        .create_executor(model.clone())
        .context("Failed to create executor")?;
    executor
        .init_per_model(manager.registry())
        .context("Failed to initialize executor")?;
    info!(executor = %manager.kind(), runs, "demo model initialized");

    for run in 0..runs {
        let request = demo_request(&model).context("Failed to build request")?;
        match executor.run(&request) {
            Ok(dispatches) => {
                let output = read_output(&request)?;
                let checksum: f32 = output.iter().sum();
                println!("run {run}: Success, {dispatches} dispatches, output sum {checksum:.4}");
            }
            Err(e) => println!("run {run}: {:?} ({e})", e.status()),
        }
    }

    drop(executor);
    device.shutdown();
    Ok(())
}

fn parse_shape(text: &str) -> Result<[u32; 4]> {
    let dims = text
        .split(['x', 'X', ','])
        .map(|part| {
            part.trim()
                .parse::<u32>()
                .with_context(|| format!("'{part}' is not a dimension"))
        })
        .collect::<Result<Vec<_>>>()?;
    let dims: [u32; 4] = dims
        .try_into()
        .map_err(|dims: Vec<u32>| anyhow::anyhow!("expected 4 dimensions, got {}", dims.len()))?;
    if dims.contains(&0) {
        bail!("dimensions must be positive");
    }
    Ok(dims)
}

fn demo_values(len: usize, scale: f32) -> Vec<u8> {
    (0..len)
        .flat_map(|i| (((i % 5) as f32 - 2.0) * scale).to_le_bytes())
        .collect()
}

enum ConvPadding {
    /// Same padding on every side.
    Explicit(i32),
    /// Implicit scheme code.
    Scheme(i32),
}

fn conv_model(
    input: [u32; 4],
    filter: [u32; 4],
    output: [u32; 4],
    padding: ConvPadding,
    stride: i32,
) -> Model {
    let mut model = Model::default();
    let input_index = model.push_operand(Operand::tensor(
        OperandType::TensorFloat32,
        &input,
        OperandLifetime::ModelInput,
    ));
    model.input_indexes.push(input_index);

    let filter_len = filter.iter().product::<u32>() as usize;
    let filter_index = model.push_constant_operand(
        OperandType::TensorFloat32,
        &filter,
        &demo_values(filter_len, 0.1),
    );
    let bias_index = model.push_constant_operand(
        OperandType::TensorFloat32,
        &[filter[0]],
        &demo_values(filter[0] as usize, 0.5),
    );

    let mut inputs = vec![input_index, filter_index, bias_index];
    let scalars = match padding {
        ConvPadding::Explicit(pad) => vec![pad, pad, pad, pad, stride, stride, 0],
        ConvPadding::Scheme(code) => vec![code, stride, stride, 0],
    };
    for value in scalars {
        inputs.push(model.push_scalar_i32(value));
    }

    let output_index = model.push_operand(Operand::tensor(
        OperandType::TensorFloat32,
        &output,
        OperandLifetime::ModelOutput,
    ));
    model.output_indexes.push(output_index);
    model
        .operations
        .push(Operation::new(OperationType::Conv2d, inputs, vec![output_index]));
    model
}

fn demo_request(model: &Model) -> Result<Request> {
    let input_len = model.operands[model.input_indexes[0]].byte_len();
    let output_len = model.operands[model.output_indexes[0]].byte_len();

    let mut bytes = demo_values(input_len / 4, 0.25);
    bytes.resize(input_len + output_len, 0);

    Ok(Request {
        inputs: vec![RequestArgument::new(0, 0, input_len)],
        outputs: vec![RequestArgument::new(0, input_len, output_len)],
        pools: vec![MemoryPool::from_bytes("ashmem", &bytes)?],
    })
}

fn read_output(request: &Request) -> Result<Vec<f32>> {
    let argument = &request.outputs[0];
    let bytes = request.pools[argument.pool_index].read(argument.offset, argument.length)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|word| f32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shape() {
        assert_eq!(parse_shape("1x224x224x3").unwrap(), [1, 224, 224, 3]);
        assert_eq!(parse_shape("8,3,3,3").unwrap(), [8, 3, 3, 3]);
        assert!(parse_shape("1x2x3").is_err());
        assert!(parse_shape("1x0x3x3").is_err());
        assert!(parse_shape("1xax3x3").is_err());
    }

    #[test]
    fn test_demo_model_is_valid() {
        let model = conv_model(
            [1, 8, 8, 3],
            [8, 3, 3, 3],
            [1, 8, 8, 8],
            ConvPadding::Explicit(1),
            1,
        );
        nngpu_core::validate_model(&model).unwrap();
        let request = demo_request(&model).unwrap();
        nngpu_core::validate_request(&request, &model).unwrap();
    }

    #[test]
    fn test_builtin_signature_key() {
        let model = conv_model(
            [1, 224, 224, 3],
            [32, 3, 3, 3],
            [1, 112, 112, 32],
            ConvPadding::Scheme(PaddingScheme::Same as i32),
            2,
        );
        assert_eq!(
            conv_signature(&model).unwrap(),
            "optype3_batch1_in224x224x3_out112x112x32_filter3x3_pad0x0_stride2x2_act0_bias1"
        );
    }

    #[test]
    fn test_cli_parses_global_executor() {
        let cli = Cli::try_parse_from(["nngpu", "demo", "--executor", "recording"]).unwrap();
        assert_eq!(cli.executor, ExecutorKind::Recording);
        assert!(matches!(cli.command, Commands::Demo { runs: 2 }));
    }
}
