use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::messages::{TaskMessage, WorkItem, WorkerResult};

/// Per-file workload summary for a batch, before any worker is spawned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkloadEstimate {
	pub file_count: usize,
	pub total_bytes: u64,
	pub avg_bytes: f64,
	pub min_bytes: u64,
	pub max_bytes: u64,
}

impl WorkloadEstimate {
	pub fn total_megabytes(&self) -> f64 {
		self.total_bytes as f64 / (1024.0 * 1024.0)
	}
}

/// One device's share of the batch, as assigned by [`partition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLoad {
	pub files: usize,
	pub bytes: u64,
}

impl PartitionLoad {
	pub fn megabytes(&self) -> f64 {
		self.bytes as f64 / (1024.0 * 1024.0)
	}
}

pub fn validate_input_dir(dir: &Path) -> Result<()> {
	if !dir.exists() {
		return Err(Error::InputDirNotFound(dir.to_path_buf()));
	}
	if !dir.is_dir() {
		return Err(Error::NotADirectory(dir.to_path_buf()));
	}
	Ok(())
}

/// Find every file in `dir` (non-recursive) whose name matches `pattern`.
///
/// Matches are sorted by name so batch indices and partitions are stable
/// across runs. Zero matches is not an error.
pub fn discover(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
	validate_input_dir(dir)?;

	let mut matches = Vec::new();
	for entry in fs::read_dir(dir)? {
		let entry = entry?;
		if !entry.path().is_file() {
			continue;
		}
		let name = entry.file_name();
		let name = name.to_string_lossy();
		// Hidden files stay hidden, as shell globs treat them
		if name.starts_with('.') {
			continue;
		}
		if wildcard_match(pattern, &name) {
			matches.push(entry.path());
		}
	}

	matches.sort();
	Ok(matches)
}

/// Shell-style name match: `*` spans any run of characters, `?` exactly one,
/// everything else is literal. Case-sensitive.
fn wildcard_match(pattern: &str, name: &str) -> bool {
	let p: Vec<char> = pattern.chars().collect();
	let n: Vec<char> = name.chars().collect();

	let (mut pi, mut ni) = (0, 0);
	let mut star: Option<(usize, usize)> = None;

	while ni < n.len() {
		if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
			pi += 1;
			ni += 1;
		} else if pi < p.len() && p[pi] == '*' {
			// Match the star to the empty run first, widen on backtrack
			star = Some((pi, ni));
			pi += 1;
		} else if let Some((star_pi, star_ni)) = star {
			pi = star_pi + 1;
			ni = star_ni + 1;
			star = Some((star_pi, star_ni + 1));
		} else {
			return false;
		}
	}

	while pi < p.len() && p[pi] == '*' {
		pi += 1;
	}
	pi == p.len()
}

/// Split `files` across `device_count` buckets, balancing by byte size:
/// largest file first, each file to the bucket with the smallest running
/// total, ties to the lowest device index. Files whose size cannot be read
/// count as zero bytes.
///
/// The split is disjoint and exhaustive; a device's bucket may be empty when
/// there are fewer files than devices.
///
/// # Panics
///
/// Panics if `device_count` is zero. Callers validate the device list first.
pub fn partition(files: &[PathBuf], device_count: usize) -> Vec<Vec<PathBuf>> {
	let sized = files.iter().map(|f| (f.clone(), file_size(f))).collect();
	partition_by_size(sized, device_count)
}

fn partition_by_size(mut sized: Vec<(PathBuf, u64)>, device_count: usize) -> Vec<Vec<PathBuf>> {
	assert!(device_count > 0, "partition requires at least one device");

	// Stable sort keeps equal-size files in discovery order
	sized.sort_by_key(|(_, size)| Reverse(*size));

	let mut buckets: Vec<Vec<PathBuf>> = vec![Vec::new(); device_count];
	let mut loads = vec![0u64; device_count];

	for (file, size) in sized {
		let mut target = 0;
		for (i, &load) in loads.iter().enumerate() {
			if load < loads[target] {
				target = i;
			}
		}
		buckets[target].push(file);
		loads[target] += size;
	}

	buckets
}

fn file_size(path: &Path) -> u64 {
	fs::metadata(path).map_or(0, |m| m.len())
}

/// Byte/file totals per partition, in partition order.
pub fn distribution(partitions: &[Vec<PathBuf>]) -> Vec<PartitionLoad> {
	partitions
		.iter()
		.map(|files| PartitionLoad {
			files: files.len(),
			bytes: files.iter().map(|f| file_size(f)).sum(),
		})
		.collect()
}

/// One device's task stream: a `Work` message per file carrying its global
/// 1-based index and the batch total, closed by exactly one `Sentinel`.
pub fn task_messages(files: &[PathBuf], start_index: usize, batch_total: usize) -> Vec<TaskMessage> {
	let mut messages: Vec<TaskMessage> = files
		.iter()
		.enumerate()
		.map(|(offset, path)| {
			TaskMessage::Work(WorkItem {
				path: path.clone(),
				index: start_index + offset,
				total: batch_total,
			})
		})
		.collect();
	messages.push(TaskMessage::Sentinel);
	messages
}

/// The merged result stream: every worker's stdout reader sends into the
/// same channel, the aggregator drains it. Unbounded so a burst of short
/// files never blocks a reader behind the consumer.
pub fn result_channel() -> (mpsc::UnboundedSender<WorkerResult>, mpsc::UnboundedReceiver<WorkerResult>) {
	mpsc::unbounded_channel()
}

pub fn estimate(files: &[PathBuf]) -> WorkloadEstimate {
	let sizes: Vec<u64> = files.iter().map(|f| file_size(f)).collect();
	let total_bytes: u64 = sizes.iter().sum();

	WorkloadEstimate {
		file_count: files.len(),
		total_bytes,
		avg_bytes: if sizes.is_empty() { 0.0 } else { total_bytes as f64 / sizes.len() as f64 },
		min_bytes: sizes.iter().copied().min().unwrap_or(0),
		max_bytes: sizes.iter().copied().max().unwrap_or(0),
	}
}
