mod config;
mod engine;
mod worker;

use anyhow::Result;
use clap::Parser;
use multigpu::{GpuDetector, Orchestrator, OrchestratorOptions, RunRequest, WorkerCommand};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use config::{Cli, Command, RunArgs};

#[tokio::main]
async fn main() -> Result<()> {
	// Load environment variables
	dotenvy::dotenv().ok();

	let cli = Cli::parse();
	init_tracing();

	match cli.command {
		Command::Run(args) => {
			args.validate().map_err(|e| anyhow::anyhow!(e))?;
			let code = run_batch(&args).await?;
			std::process::exit(code)
		}
		Command::Gpus => {
			list_gpus();
			Ok(())
		}
		Command::Worker(args) => std::process::exit(worker::run(&args)),
	}
}

async fn run_batch(args: &RunArgs) -> Result<i32> {
	info!(
		input_dir = %args.input_dir.display(),
		model = %args.model_size,
		gpus = %args.gpus,
		"🚀 Starting multi-GPU transcription"
	);

	let worker_command = WorkerCommand::current_exe(args.worker_args())?;
	let orchestrator = Orchestrator::new(
		GpuDetector::default(),
		worker_command,
		OrchestratorOptions {
			stall_timeout: Duration::from_secs(args.stall_timeout_secs),
			..OrchestratorOptions::default()
		},
	);

	let request = RunRequest {
		input_dir: args.input_dir.clone(),
		output_dir: args.output_dir.clone(),
		gpus: args.gpus.clone(),
		model_size: args.model_size.to_string(),
		pattern: args.pattern.clone(),
	};

	Ok(orchestrator.run(&request).await)
}

fn list_gpus() {
	let detector = GpuDetector::default();
	let devices = detector.enumerate();
	if devices.is_empty() {
		println!("No GPUs detected. Make sure CUDA is available.");
		return;
	}
	println!("Detected {} GPU(s):", devices.len());
	for device in devices {
		println!("  {device}");
	}
}

/// Logs go to stderr; stdout belongs to progress lines in launcher mode and
/// to the result protocol in worker mode.
fn init_tracing() {
	let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

	tracing_subscriber::registry()
		.with(env_filter)
		.with(tracing_subscriber::fmt::layer().with_target(true).with_writer(std::io::stderr))
		.init();
}
