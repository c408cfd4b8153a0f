use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::messages::WorkerResult;

/// How often the drain loop wakes to check for cancellation and stalls.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuStats {
	pub processed: usize,
	pub busy_secs: f64,
	pub failures: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedFile {
	pub gpu_id: u32,
	pub file: String,
	pub error: String,
}

/// Aggregate accounting for one batch.
///
/// `successes + failures` equals `total_files` exactly when the batch drained
/// completely; a shortfall means a worker died with its share unprocessed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchStats {
	pub total_files: usize,
	pub successes: usize,
	pub failures: usize,
	pub total_audio_secs: f64,
	pub total_processing_secs: f64,
	pub per_gpu: BTreeMap<u32, GpuStats>,
	pub failed_files: Vec<FailedFile>,
	pub worker_errors: Vec<(u32, String)>,
}

impl BatchStats {
	pub fn completed(&self) -> usize {
		self.successes + self.failures
	}

	/// Cumulative processing time over cumulative audio duration; lower is
	/// faster. Zero when no audio has been accounted yet.
	pub fn overall_rtf(&self) -> f64 {
		if self.total_audio_secs > 0.0 {
			self.total_processing_secs / self.total_audio_secs
		} else {
			0.0
		}
	}

	/// Audio-seconds transcribed per wall-processing second across all
	/// devices. Zero when no processing time has been accounted yet.
	pub fn speedup(&self) -> f64 {
		if self.total_processing_secs > 0.0 {
			self.total_audio_secs / self.total_processing_secs
		} else {
			0.0
		}
	}

	pub const fn exit_code(&self) -> i32 {
		if self.failures == 0 {
			0
		} else {
			1
		}
	}
}

impl fmt::Display for BatchStats {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "\n=== Summary ===")?;
		writeln!(f, "Total files: {}", self.total_files)?;
		writeln!(f, "Successful: {}", self.successes)?;
		writeln!(f, "Failed: {}", self.failures)?;
		writeln!(f, "Total audio duration: {:.2}s ({:.2}m)", self.total_audio_secs, self.total_audio_secs / 60.0)?;
		writeln!(f, "Total processing time: {:.2}s ({:.2}m)", self.total_processing_secs, self.total_processing_secs / 60.0)?;
		writeln!(f, "Overall RTF: {:.3}", self.overall_rtf())?;
		writeln!(f, "Speedup: {:.2}x", self.speedup())?;

		writeln!(f, "\n=== Per-GPU Stats ===")?;
		for (gpu_id, gpu) in &self.per_gpu {
			writeln!(f, "GPU {gpu_id}: {} files, {:.2}s", gpu.processed, gpu.busy_secs)?;
		}

		if !self.worker_errors.is_empty() {
			writeln!(f, "\n=== Worker Errors ===")?;
			for (gpu_id, message) in &self.worker_errors {
				writeln!(f, "  - GPU {gpu_id}: {message}")?;
			}
		}

		if !self.failed_files.is_empty() {
			writeln!(f, "\n=== Failed Files ===")?;
			for failed in &self.failed_files {
				writeln!(f, "  - {}: {}", failed.file, failed.error)?;
			}
		}

		Ok(())
	}
}

/// Consumes the merged result stream and keeps the books.
#[derive(Debug, Default)]
pub struct ProgressAggregator {
	stats: BatchStats,
}

impl ProgressAggregator {
	pub fn new(total_files: usize) -> Self {
		Self {
			stats: BatchStats {
				total_files,
				..BatchStats::default()
			},
		}
	}

	/// Pre-seed per-device counters so a device that never reports (dead at
	/// init, or idle on a short batch) still shows up in the final report.
	pub fn register_gpus(&mut self, gpu_ids: &[u32]) {
		for gpu_id in gpu_ids {
			self.stats.per_gpu.entry(*gpu_id).or_default();
		}
	}

	pub const fn summary(&self) -> &BatchStats {
		&self.stats
	}

	pub fn exit_code(&self) -> i32 {
		self.stats.exit_code()
	}

	/// Clear all aggregates so the instance can serve a new batch.
	pub fn reset(&mut self) {
		self.stats = BatchStats::default();
	}

	/// Fold one result into the aggregates.
	///
	/// `WorkerError` is recorded and logged but never counts toward
	/// completion: a dead worker's share surfaces as a drain shortfall, not
	/// as phantom failures.
	pub fn record(&mut self, result: &WorkerResult) {
		match result {
			WorkerResult::Success {
				gpu_id,
				duration,
				processing_time,
				..
			} => {
				self.stats.successes += 1;
				self.stats.total_audio_secs += duration;
				self.stats.total_processing_secs += processing_time;
				let gpu = self.stats.per_gpu.entry(*gpu_id).or_default();
				gpu.processed += 1;
				gpu.busy_secs += processing_time;
			}
			WorkerResult::Failure { gpu_id, file, error: message } => {
				self.stats.failures += 1;
				self.stats.failed_files.push(FailedFile {
					gpu_id: *gpu_id,
					file: file.clone(),
					error: message.clone(),
				});
				self.stats.per_gpu.entry(*gpu_id).or_default().failures += 1;
			}
			WorkerResult::WorkerError { gpu_id, error: message } => {
				error!(gpu_id, error = %message, "GPU worker error");
				self.stats.worker_errors.push((*gpu_id, message.clone()));
			}
		}
	}

	/// Receive until `expected_total` files are accounted for.
	///
	/// Polls with a short timeout so cancellation is observed between
	/// results. Two conditions end the wait early, both fatal: the channel
	/// closing with results still outstanding (every worker exited), and no
	/// result arriving within `stall_timeout`.
	pub async fn drain(
		&mut self,
		rx: &mut mpsc::UnboundedReceiver<WorkerResult>,
		expected_total: usize,
		cancel: &CancellationToken,
		stall_timeout: Duration,
	) -> Result<()> {
		self.stats.total_files = expected_total;
		let mut last_result = Instant::now();

		debug!(expected_total, "Draining worker results");

		while self.stats.completed() < expected_total {
			tokio::select! {
				() = cancel.cancelled() => {
					return Err(Error::Interrupted);
				}
				received = tokio::time::timeout(POLL_INTERVAL, rx.recv()) => {
					match received {
						Ok(Some(result)) => {
							last_result = Instant::now();
							self.record(&result);
							self.print_progress(&result);
						}
						Ok(None) => {
							// All workers exited and their readers finished
							return Err(Error::Stalled {
								received: self.stats.completed(),
								expected: expected_total,
							});
						}
						Err(_) => {
							if last_result.elapsed() >= stall_timeout {
								return Err(Error::Stalled {
									received: self.stats.completed(),
									expected: expected_total,
								});
							}
						}
					}
				}
			}
		}

		Ok(())
	}

	/// One console line per result. Device-level errors get their own shape
	/// with no completion prefix; they never advance the count.
	fn progress_line(&self, result: &WorkerResult) -> String {
		let done = self.stats.completed();
		let total = self.stats.total_files;

		match result {
			WorkerResult::Success { gpu_id, file, rtf, .. } => {
				format!("[{done}/{total}] GPU {gpu_id}: {} (RTF: {rtf:.3})", file_name(file))
			}
			WorkerResult::Failure { gpu_id, file, error: message } => {
				format!("[{done}/{total}] GPU {gpu_id}: FAILED {} - {message}", file_name(file))
			}
			WorkerResult::WorkerError { gpu_id, error: message } => {
				format!("ERROR on GPU {gpu_id}: {message}")
			}
		}
	}

	fn print_progress(&self, result: &WorkerResult) {
		println!("{}", self.progress_line(result));
	}

	pub fn print_summary(&self) {
		print!("{}", self.stats);
	}
}

fn file_name(path: &str) -> String {
	Path::new(path).file_name().map_or_else(|| path.to_string(), |name| name.to_string_lossy().into_owned())
}
