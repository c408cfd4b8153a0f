use clap::{Args, Parser, Subcommand, ValueEnum};
use std::fmt;
use std::path::PathBuf;

const EXAMPLES: &str = "Examples:
  batch-transcriber run --input-dir data/audio --gpus auto
  batch-transcriber run --input-dir data/audio --gpus 0,1 --model-size large-v3
  batch-transcriber run --input-dir recordings --gpus 0 --language en --pattern 'interview_*.wav'
  batch-transcriber gpus";

#[derive(Parser, Debug)]
#[command(name = "batch-transcriber")]
#[command(about = "Multi-GPU batch audio transcription", long_about = None)]
#[command(after_help = EXAMPLES)]
pub struct Cli {
	#[command(subcommand)]
	pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
	/// Transcribe a directory of audio files across GPUs
	Run(RunArgs),
	/// List detected GPUs
	Gpus,
	/// Single-device worker process, spawned by `run`
	#[command(hide = true)]
	Worker(WorkerArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
	/// Directory containing audio files
	#[arg(long, env = "BATCH_INPUT_DIR")]
	pub input_dir: PathBuf,

	/// Directory for transcription artifacts
	#[arg(long, env = "BATCH_OUTPUT_DIR", default_value = "data/outputs")]
	pub output_dir: PathBuf,

	/// GPUs to use: comma-separated physical ids, or 'auto' for all
	#[arg(long, env = "BATCH_GPUS")]
	pub gpus: String,

	/// Whisper model size
	#[arg(long, env = "WHISPER_MODEL_SIZE", default_value = "base")]
	pub model_size: ModelSize,

	/// Directory holding ggml model files
	#[arg(long, env = "WHISPER_MODELS_PATH", default_value = "models")]
	pub models_dir: PathBuf,

	/// Force a transcription language (auto-detect if omitted)
	#[arg(long, env = "WHISPER_LANGUAGE")]
	pub language: Option<String>,

	/// File name pattern to match in the input directory
	#[arg(long, default_value = "*.wav")]
	pub pattern: String,

	/// Seconds without any worker result before the run is declared stalled
	#[arg(long, env = "BATCH_STALL_TIMEOUT", default_value = "600")]
	pub stall_timeout_secs: u64,

	/// Whisper threads per worker
	#[arg(long, env = "WHISPER_THREADS", default_value = "4")]
	pub threads: i32,
}

impl RunArgs {
	/// Validate configuration values
	pub fn validate(&self) -> Result<(), String> {
		if self.gpus.trim().is_empty() {
			return Err("gpus must not be empty".to_string());
		}

		if self.stall_timeout_secs == 0 {
			return Err("stall-timeout-secs must be greater than 0".to_string());
		}

		if self.threads < 1 {
			return Err("threads must be at least 1".to_string());
		}

		Ok(())
	}

	/// Fixed argument prefix for spawned workers; the supervisor appends
	/// `--gpu <id>` per device.
	pub fn worker_args(&self) -> Vec<String> {
		let mut args = vec![
			"worker".to_string(),
			"--model-size".to_string(),
			self.model_size.to_string(),
			"--models-dir".to_string(),
			self.models_dir.display().to_string(),
			"--output-dir".to_string(),
			self.output_dir.display().to_string(),
			"--threads".to_string(),
			self.threads.to_string(),
		];
		if let Some(language) = &self.language {
			args.push("--language".to_string());
			args.push(language.clone());
		}
		args
	}
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
	/// Physical GPU id this worker is bound to (for reporting; the device
	/// itself is selected through CUDA_VISIBLE_DEVICES set by the launcher)
	#[arg(long)]
	pub gpu: u32,

	/// Whisper model size
	#[arg(long, default_value = "base")]
	pub model_size: ModelSize,

	/// Directory holding ggml model files
	#[arg(long, env = "WHISPER_MODELS_PATH", default_value = "models")]
	pub models_dir: PathBuf,

	/// Force a transcription language
	#[arg(long)]
	pub language: Option<String>,

	/// Directory for transcription artifacts
	#[arg(long, default_value = "data/outputs")]
	pub output_dir: PathBuf,

	/// Whisper threads
	#[arg(long, default_value = "4")]
	pub threads: i32,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSize {
	Tiny,
	Base,
	Small,
	Medium,
	#[value(name = "medium.en")]
	MediumEn,
	#[value(name = "large-v3")]
	LargeV3,
}

impl ModelSize {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Tiny => "tiny",
			Self::Base => "base",
			Self::Small => "small",
			Self::Medium => "medium",
			Self::MediumEn => "medium.en",
			Self::LargeV3 => "large-v3",
		}
	}

	/// File name whisper.cpp model distributions use for this size.
	pub fn model_file(self) -> String {
		format!("ggml-{}.bin", self.as_str())
	}
}

impl fmt::Display for ModelSize {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
