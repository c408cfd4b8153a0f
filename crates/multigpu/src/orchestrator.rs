use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::ProgressAggregator;
use crate::allocator;
use crate::device::GpuDetector;
use crate::error::{Error, Result};
use crate::supervisor::{WorkerCommand, WorkerShare, WorkerSupervisor};

/// How long finished workers get to exit on their own after the last result.
const WORKER_EXIT_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorOptions {
	/// Longest gap between results before the run is declared stalled.
	pub stall_timeout: Duration,
	/// SIGTERM-to-SIGKILL window when terminating workers.
	pub grace_period: Duration,
}

impl Default for OrchestratorOptions {
	fn default() -> Self {
		Self {
			stall_timeout: DEFAULT_STALL_TIMEOUT,
			grace_period: DEFAULT_GRACE_PERIOD,
		}
	}
}

/// One batch request, as it arrives from the CLI.
#[derive(Debug, Clone)]
pub struct RunRequest {
	pub input_dir: PathBuf,
	pub output_dir: PathBuf,
	/// Raw device request: `"auto"` or comma-separated physical indices.
	pub gpus: String,
	/// Model name, for the banner; workers receive it through their args.
	pub model_size: String,
	pub pattern: String,
}

/// Drives one batch end to end: validate, discover, partition, spawn,
/// drain, report. All collaborators are injected.
pub struct Orchestrator {
	detector: GpuDetector,
	worker_command: WorkerCommand,
	options: OrchestratorOptions,
}

impl Orchestrator {
	pub fn new(detector: GpuDetector, worker_command: WorkerCommand, options: OrchestratorOptions) -> Self {
		Self {
			detector,
			worker_command,
			options,
		}
	}

	/// Run the batch and return the process exit code: 0 for a fully
	/// successful (or empty) batch, 1 for any failure, 130 on interrupt.
	pub async fn run(&self, request: &RunRequest) -> i32 {
		let cancel = CancellationToken::new();
		let signals = tokio::spawn(cancel_on_shutdown_signal(cancel.clone()));

		let code = match self.run_batch(request, &cancel).await {
			Ok(code) => code,
			Err(Error::Interrupted) => {
				println!("\n\nInterrupted by user");
				130
			}
			Err(e) => {
				error!(error = %e, "❌ Transcription run failed");
				1
			}
		};

		signals.abort();
		code
	}

	async fn run_batch(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<i32> {
		let gpu_ids = self.detector.parse_spec(&request.gpus)?;
		self.detector.validate(&gpu_ids)?;

		if request.gpus.trim().eq_ignore_ascii_case("auto") {
			info!(gpus = ?gpu_ids, "🎯 Auto-detected {} GPU(s)", gpu_ids.len());
		}

		let files = allocator::discover(&request.input_dir, &request.pattern)?;
		if files.is_empty() {
			println!("No files matching {} in {}", request.pattern, request.input_dir.display());
			return Ok(0);
		}

		fs::create_dir_all(&request.output_dir)?;

		let estimate = allocator::estimate(&files);
		let partitions = allocator::partition(&files, gpu_ids.len());
		let loads = allocator::distribution(&partitions);
		for (gpu_id, load) in gpu_ids.iter().zip(&loads) {
			info!(gpu_id, files = load.files, size_mb = format!("{:.1}", load.megabytes()), "📦 Assigned workload");
		}

		self.print_banner(request, &gpu_ids, &estimate);

		info!(
			operation = "multi_gpu_transcription",
			total_files = files.len(),
			gpus = gpu_ids.len(),
			total_mb = format!("{:.1}", estimate.total_megabytes()),
			"🔄 Batch starting"
		);

		let (result_tx, mut result_rx) = allocator::result_channel();
		let mut supervisor = WorkerSupervisor::new(self.worker_command.clone()).with_grace_period(self.options.grace_period);

		let mut shares = Vec::with_capacity(gpu_ids.len());
		let mut next_index = 1;
		for (&gpu_id, bucket) in gpu_ids.iter().zip(&partitions) {
			shares.push(WorkerShare {
				gpu_id,
				tasks: allocator::task_messages(bucket, next_index, files.len()),
			});
			next_index += bucket.len();
		}

		if let Err(e) = supervisor.spawn(shares, result_tx) {
			supervisor.terminate_all().await;
			return Err(e);
		}

		let mut aggregator = ProgressAggregator::new(files.len());
		aggregator.register_gpus(&gpu_ids);
		if let Err(e) = aggregator.drain(&mut result_rx, files.len(), cancel, self.options.stall_timeout).await {
			supervisor.terminate_all().await;
			if matches!(e, Error::Stalled { .. }) {
				// Partial books are still worth showing
				aggregator.print_summary();
			}
			return Err(e);
		}

		if !supervisor.wait_all(Some(WORKER_EXIT_TIMEOUT)).await {
			warn!("Workers still running after the batch completed, terminating");
			supervisor.terminate_all().await;
		}

		aggregator.print_summary();

		let stats = aggregator.summary();
		info!(
			operation = "multi_gpu_transcription",
			successes = stats.successes,
			failures = stats.failures,
			overall_rtf = format!("{:.3}", stats.overall_rtf()),
			speedup = format!("{:.1}", stats.speedup()),
			"✅ Batch complete"
		);

		Ok(aggregator.exit_code())
	}

	fn print_banner(&self, request: &RunRequest, gpu_ids: &[u32], estimate: &allocator::WorkloadEstimate) {
		println!("=== Multi-GPU Transcription ===");
		println!("Input: {}", request.input_dir.display());
		println!("Output: {}", request.output_dir.display());
		println!("Model: {}", request.model_size);
		println!("GPUs: {gpu_ids:?}");
		println!("Files: {} ({:.1} MB total)", estimate.file_count, estimate.total_megabytes());
		println!();
	}
}

async fn cancel_on_shutdown_signal(cancel: CancellationToken) {
	let ctrl_c = async {
		signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
	};

	#[cfg(unix)]
	let terminate = async {
		signal::unix::signal(signal::unix::SignalKind::terminate())
			.expect("failed to install SIGTERM handler")
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}

	info!("🛑 Shutdown signal received (SIGTERM/SIGINT)");
	cancel.cancel();
}
