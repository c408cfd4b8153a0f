use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
	#[error("No GPUs specified")]
	EmptyGpuRequest,

	#[error("No GPUs detected. Make sure CUDA is available.")]
	NoDevices,

	#[error("GPU {gpu_id} not available. Available GPUs: {available:?}")]
	DeviceUnavailable { gpu_id: u32, available: Vec<u32> },

	#[error("Invalid GPU list: {spec}. Use comma-separated integers (e.g., '0,1,2') or 'auto'")]
	InvalidGpuSpec { spec: String },

	#[error("Input directory not found: {}", .0.display())]
	InputDirNotFound(PathBuf),

	#[error("Path is not a directory: {}", .0.display())]
	NotADirectory(PathBuf),

	#[error("Failed to spawn worker for GPU {gpu_id}: {source}")]
	Spawn { gpu_id: u32, source: std::io::Error },

	#[error("Result stream stalled: received {received} of {expected} results")]
	Stalled { received: usize, expected: usize },

	#[error("Run interrupted")]
	Interrupted,

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}
