// tests/worker_protocol.rs
// Real subprocess runs against stub workers that speak the stdin/stdout
// line protocol. Unix only: the stubs are /bin/sh scripts.

#![cfg(unix)]

use multigpu::allocator;
use multigpu::{Error, ProgressAggregator, WorkerCommand, WorkerShare, WorkerSupervisor};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Stub workers
// ============================================================================

// Happy path: one success line per work item, exit on sentinel.
const ECHO_WORKER: &str = r#"
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

// Reports a failure for any path containing "bad", success otherwise.
const FLAKY_WORKER: &str = r#"
gpu="$1"
while IFS= read -r line; do
	case "$line" in
	*'"type":"sentinel"'*)
		exit 0
		;;
	*'"type":"work"'*)
		path=$(printf '%s' "$line" | sed -n 's/.*"path":"\([^"]*\)".*/\1/p')
		case "$path" in
		*bad*)
			printf '{"type":"failure","gpu_id":%s,"file":"%s","error":"decode failed"}\n' "$gpu" "$path"
			;;
		*)
			printf '{"type":"success","gpu_id":%s,"file":"%s","duration":2.0,"processing_time":1.0,"rtf":0.5,"output_dir":"out"}\n' "$gpu" "$path"
			;;
		esac
		;;
	esac
done
"#;

// Init-failure path: one error line, immediate nonzero exit, stdin unread.
const BROKEN_WORKER: &str = r#"
printf '{"type":"error","gpu_id":%s,"error":"model load failed"}\n' "$1"
exit 1
"#;

// Ignores its task stream entirely.
const HUNG_WORKER: &str = "exec sleep 600";

fn sh(script: &str) -> WorkerCommand {
	// Supervisor-appended "--gpu <id>" lands in $0/$1 of the script
	WorkerCommand::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
}

fn paths(names: &[&str]) -> Vec<PathBuf> {
	names.iter().map(PathBuf::from).collect()
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn workers_stream_results_for_their_shares() {
	let mut supervisor = WorkerSupervisor::new(sh(ECHO_WORKER));
	let (tx, mut rx) = allocator::result_channel();

	let first = paths(&["clips/a.wav", "clips/b.wav"]);
	let second = paths(&["clips/c.wav"]);
	let shares = vec![
		WorkerShare {
			gpu_id: 0,
			tasks: allocator::task_messages(&first, 1, 3),
		},
		WorkerShare {
			gpu_id: 1,
			tasks: allocator::task_messages(&second, 3, 3),
		},
	];

	supervisor.spawn(shares, tx).unwrap();
	assert_eq!(supervisor.worker_count(), 2);

	let mut agg = ProgressAggregator::new(3);
	let cancel = CancellationToken::new();
	agg.drain(&mut rx, 3, &cancel, Duration::from_secs(10)).await.unwrap();

	let stats = agg.summary();
	assert_eq!(stats.successes, 3);
	assert_eq!(stats.per_gpu[&0].processed, 2);
	assert_eq!(stats.per_gpu[&1].processed, 1);

	assert!(supervisor.wait_all(Some(Duration::from_secs(5))).await, "workers should exit after their sentinels");
	let status = supervisor.status();
	assert!(status.iter().all(|s| !s.alive && s.exit_code == Some(0)), "{status:?}");
}

#[tokio::test]
async fn per_file_failures_are_reported_not_fatal() {
	let mut supervisor = WorkerSupervisor::new(sh(FLAKY_WORKER));
	let (tx, mut rx) = allocator::result_channel();

	let files = paths(&["clips/good.wav", "clips/bad.wav", "clips/fine.wav"]);
	supervisor
		.spawn(
			vec![WorkerShare {
				gpu_id: 0,
				tasks: allocator::task_messages(&files, 1, 3),
			}],
			tx,
		)
		.unwrap();

	let mut agg = ProgressAggregator::new(3);
	let cancel = CancellationToken::new();
	agg.drain(&mut rx, 3, &cancel, Duration::from_secs(10)).await.unwrap();

	let stats = agg.summary();
	assert_eq!(stats.successes, 2);
	assert_eq!(stats.failures, 1);
	assert_eq!(stats.failed_files[0].file, "clips/bad.wav");
	assert_eq!(agg.exit_code(), 1);

	assert!(supervisor.wait_all(Some(Duration::from_secs(5))).await);
}

// ============================================================================
// Worker death
// ============================================================================

#[tokio::test]
async fn dead_worker_surfaces_as_error_then_stall() {
	let mut supervisor = WorkerSupervisor::new(sh(BROKEN_WORKER));
	let (tx, mut rx) = allocator::result_channel();

	let files = paths(&["clips/a.wav"]);
	supervisor
		.spawn(
			vec![WorkerShare {
				gpu_id: 0,
				tasks: allocator::task_messages(&files, 1, 1),
			}],
			tx,
		)
		.unwrap();

	let mut agg = ProgressAggregator::new(1);
	let cancel = CancellationToken::new();
	let err = agg.drain(&mut rx, 1, &cancel, Duration::from_secs(10)).await.unwrap_err();

	// SCENARIO: the worker died before processing anything. Its error line
	// is on record, the channel closed, and the shortfall is a stall.
	assert!(matches!(err, Error::Stalled { received: 0, expected: 1 }), "got {err:?}");
	assert_eq!(agg.summary().worker_errors.len(), 1);
	assert_eq!(agg.summary().worker_errors[0].0, 0);

	supervisor.wait_all(Some(Duration::from_secs(5))).await;
	let status = supervisor.status();
	assert_eq!(status[0].exit_code, Some(1));
}

#[tokio::test]
async fn terminate_all_reaps_a_hung_worker() {
	let mut supervisor = WorkerSupervisor::new(sh(HUNG_WORKER)).with_grace_period(Duration::from_millis(200));
	let (tx, _rx) = allocator::result_channel();

	let files = paths(&["clips/a.wav"]);
	supervisor
		.spawn(
			vec![WorkerShare {
				gpu_id: 0,
				tasks: allocator::task_messages(&files, 1, 1),
			}],
			tx,
		)
		.unwrap();
	assert_eq!(supervisor.alive_count(), 1);

	let started = Instant::now();
	supervisor.terminate_all().await;

	assert_eq!(supervisor.alive_count(), 0, "worker must be gone after terminate_all");
	assert!(started.elapsed() < Duration::from_secs(5));
}
