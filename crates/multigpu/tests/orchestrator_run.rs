// tests/orchestrator_run.rs
// Launcher exit-code paths, no real GPUs involved

use multigpu::{Device, DeviceProbe, GpuDetector, Orchestrator, OrchestratorOptions, RunRequest, WorkerCommand};
use std::path::PathBuf;
use tempfile::TempDir;

struct FixedProbe(Vec<u32>);

impl DeviceProbe for FixedProbe {
	fn probe(&self) -> Vec<Device> {
		self
			.0
			.iter()
			.map(|&id| Device {
				id,
				name: format!("Test GPU {id}"),
				memory_mb: 16_384,
				compute_cap: "8.6".to_string(),
			})
			.collect()
	}
}

fn detector(ids: &[u32]) -> GpuDetector {
	GpuDetector::new(Box::new(FixedProbe(ids.to_vec())))
}

fn request(input_dir: &TempDir, output_dir: &TempDir, gpus: &str) -> RunRequest {
	RunRequest {
		input_dir: input_dir.path().to_path_buf(),
		output_dir: output_dir.path().to_path_buf(),
		gpus: gpus.to_string(),
		model_size: "base".to_string(),
		pattern: "*.wav".to_string(),
	}
}

/// A worker command that must never actually run.
fn unreachable_worker() -> WorkerCommand {
	WorkerCommand::new("/nonexistent/worker", Vec::new())
}

#[tokio::test]
async fn empty_batch_exits_zero_without_spawning() {
	let input = TempDir::new().unwrap();
	let output = TempDir::new().unwrap();
	let orch = Orchestrator::new(detector(&[0, 1]), unreachable_worker(), OrchestratorOptions::default());

	// The nonexistent worker binary proves nothing is spawned for an
	// empty batch
	let code = orch.run(&request(&input, &output, "auto")).await;
	assert_eq!(code, 0);
}

#[tokio::test]
async fn unavailable_device_request_exits_one() {
	let input = TempDir::new().unwrap();
	std::fs::write(input.path().join("a.wav"), b"not really audio").unwrap();
	let output = TempDir::new().unwrap();
	let orch = Orchestrator::new(detector(&[0, 1]), unreachable_worker(), OrchestratorOptions::default());

	let code = orch.run(&request(&input, &output, "7")).await;
	assert_eq!(code, 1);
}

#[tokio::test]
async fn malformed_gpu_spec_exits_one() {
	let input = TempDir::new().unwrap();
	let output = TempDir::new().unwrap();
	let orch = Orchestrator::new(detector(&[0]), unreachable_worker(), OrchestratorOptions::default());

	let code = orch.run(&request(&input, &output, "zero,one")).await;
	assert_eq!(code, 1);
}

#[tokio::test]
async fn auto_with_no_devices_exits_one() {
	let input = TempDir::new().unwrap();
	let output = TempDir::new().unwrap();
	let orch = Orchestrator::new(detector(&[]), unreachable_worker(), OrchestratorOptions::default());

	let code = orch.run(&request(&input, &output, "auto")).await;
	assert_eq!(code, 1);
}

#[tokio::test]
async fn missing_input_dir_exits_one() {
	let input = TempDir::new().unwrap();
	let output = TempDir::new().unwrap();
	let orch = Orchestrator::new(detector(&[0]), unreachable_worker(), OrchestratorOptions::default());

	let mut req = request(&input, &output, "0");
	req.input_dir = PathBuf::from("/no/such/dir");

	let code = orch.run(&req).await;
	assert_eq!(code, 1);
}

// Full path with stub workers; unix only because the stub is a shell script.
#[cfg(unix)]
#[tokio::test]
async fn stub_workers_drive_a_full_run_to_zero() {
	const WORKER: &str = r#"
gpu="$1"
while IFS= read -r line; do
	case "$line" in
	*'"type":"sentinel"'*)
		exit 0
		;;
	*'"type":"work"'*)
		path=$(printf '%s' "$line" | sed -n 's/.*"path":"\([^"]*\)".*/\1/p')
		printf '{"type":"success","gpu_id":%s,"file":"%s","duration":2.0,"processing_time":1.0,"rtf":0.5,"output_dir":"out"}\n' "$gpu" "$path"
		;;
	esac
done
"#;

	let input = TempDir::new().unwrap();
	std::fs::write(input.path().join("one.wav"), vec![0u8; 64]).unwrap();
	std::fs::write(input.path().join("two.wav"), vec![0u8; 32]).unwrap();
	let output = TempDir::new().unwrap();

	let orch = Orchestrator::new(
		detector(&[0, 1]),
		WorkerCommand::new("/bin/sh", vec!["-c".to_string(), WORKER.to_string()]),
		OrchestratorOptions::default(),
	);

	let code = orch.run(&request(&input, &output, "auto")).await;
	assert_eq!(code, 0);
}
