use anyhow::Result;
use multigpu::{TaskMessage, WorkItem, WorkerResult};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use crate::config::WorkerArgs;
use crate::engine::{self, Transcriber, Transcription, WhisperEngine};

/// Worker process entry: read task lines from stdin, write result lines to
/// stdout, log to stderr. Returns the process exit code.
///
/// stdout carries nothing but result JSON; any stray print here would
/// corrupt the launcher's result stream.
pub fn run(args: &WorkerArgs) -> i32 {
	info!(gpu_id = args.gpu, model = %args.model_size, "🔄 Worker starting");

	let stdout = io::stdout();

	let engine = match WhisperEngine::load(&args.models_dir, args.model_size, args.threads) {
		Ok(engine) => engine,
		Err(e) => {
			error!(gpu_id = args.gpu, error = %e, "❌ Worker init failed");
			emit(
				&stdout,
				&WorkerResult::WorkerError {
					gpu_id: args.gpu,
					error: format!("{e:#}"),
				},
			);
			return 1;
		}
	};

	let mut processed = 0usize;
	let stdin = io::stdin();
	for line in stdin.lock().lines() {
		let line = match line {
			Ok(line) => line,
			Err(e) => {
				error!(gpu_id = args.gpu, error = %e, "Failed to read task line");
				break;
			}
		};
		let line = line.trim();
		if line.is_empty() {
			continue;
		}

		let task = match TaskMessage::from_line(line) {
			Ok(task) => task,
			Err(e) => {
				warn!(gpu_id = args.gpu, error = %e, line, "Ignoring malformed task line");
				continue;
			}
		};

		let item = match task {
			TaskMessage::Work(item) => item,
			TaskMessage::Sentinel => {
				debug!(gpu_id = args.gpu, "Sentinel received");
				break;
			}
		};

		info!(
			gpu_id = args.gpu,
			index = item.index,
			total = item.total,
			file = %item.path.display(),
			"🎬 Processing"
		);

		let result = process_item(&engine, args, &item);
		if matches!(result, WorkerResult::Success { .. }) {
			processed += 1;
		}
		emit(&stdout, &result);
	}

	info!(gpu_id = args.gpu, processed, "✅ Worker done");
	0
}

fn process_item<T: Transcriber>(engine: &T, args: &WorkerArgs, item: &WorkItem) -> WorkerResult {
	match transcribe_and_save(engine, args, item) {
		Ok((transcription, output_dir)) => WorkerResult::Success {
			gpu_id: args.gpu,
			file: item.path.display().to_string(),
			duration: transcription.duration,
			processing_time: transcription.processing_time,
			rtf: transcription.rtf,
			output_dir: output_dir.display().to_string(),
		},
		Err(e) => WorkerResult::Failure {
			gpu_id: args.gpu,
			file: item.path.display().to_string(),
			error: format!("{e:#}"),
		},
	}
}

fn transcribe_and_save<T: Transcriber>(engine: &T, args: &WorkerArgs, item: &WorkItem) -> Result<(Transcription, PathBuf)> {
	let transcription = engine.transcribe(&item.path, args.language.as_deref())?;
	let output_dir = engine::save_artifacts(&args.output_dir, &item.path, &transcription)?;
	Ok((transcription, output_dir))
}

/// One line per result, flushed immediately so the launcher sees progress
/// as it happens rather than on pipe-buffer boundaries.
fn emit(stdout: &io::Stdout, result: &WorkerResult) {
	match result.to_line() {
		Ok(line) => {
			let mut lock = stdout.lock();
			let _ = writeln!(lock, "{line}");
			let _ = lock.flush();
		}
		Err(e) => error!(error = %e, "Failed to encode result"),
	}
}
