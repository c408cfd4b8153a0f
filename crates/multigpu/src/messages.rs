use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One file's slot in the batch: path plus its 1-based position and the
/// batch-wide total, attached at allocation time so workers can report
/// progress without any shared counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
	pub path: PathBuf,
	pub index: usize,
	pub total: usize,
}

/// A single entry in a worker's task stream, one JSON object per line on the
/// worker's stdin. `Sentinel` closes the stream; every worker receives
/// exactly one after its last work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskMessage {
	Work(WorkItem),
	Sentinel,
}

impl TaskMessage {
	pub fn to_line(&self) -> serde_json::Result<String> {
		serde_json::to_string(self)
	}

	pub fn from_line(line: &str) -> serde_json::Result<Self> {
		serde_json::from_str(line)
	}
}

/// A worker's report for one unit of work, one JSON object per line on the
/// worker's stdout.
///
/// `Success` and `Failure` account for exactly one file each. `WorkerError`
/// reports a worker that died before consuming any task (model init failure);
/// it accounts for no file, which is why a dead worker's share shows up as a
/// result shortfall rather than as failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerResult {
	#[serde(rename = "success")]
	Success {
		gpu_id: u32,
		file: String,
		duration: f64,
		processing_time: f64,
		rtf: f64,
		output_dir: String,
	},
	#[serde(rename = "failure")]
	Failure { gpu_id: u32, file: String, error: String },
	#[serde(rename = "error")]
	WorkerError { gpu_id: u32, error: String },
}

impl WorkerResult {
	pub const fn gpu_id(&self) -> u32 {
		match self {
			Self::Success { gpu_id, .. } | Self::Failure { gpu_id, .. } | Self::WorkerError { gpu_id, .. } => *gpu_id,
		}
	}

	pub fn to_line(&self) -> serde_json::Result<String> {
		serde_json::to_string(self)
	}

	pub fn from_line(line: &str) -> serde_json::Result<Self> {
		serde_json::from_str(line)
	}
}
