// tests/aggregator_drain.rs
// Drain-loop semantics against synthetic result streams

use multigpu::allocator;
use multigpu::{Error, ProgressAggregator, WorkerResult};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Stream builders
// ============================================================================

fn success(gpu_id: u32, file: &str, duration: f64, processing_time: f64) -> WorkerResult {
	WorkerResult::Success {
		gpu_id,
		file: file.to_string(),
		duration,
		processing_time,
		rtf: if duration > 0.0 { processing_time / duration } else { 0.0 },
		output_dir: format!("out/{file}"),
	}
}

fn failure(gpu_id: u32, file: &str, error: &str) -> WorkerResult {
	WorkerResult::Failure {
		gpu_id,
		file: file.to_string(),
		error: error.to_string(),
	}
}

// ============================================================================
// Completion
// ============================================================================

#[tokio::test]
async fn drains_a_complete_stream() {
	let (tx, mut rx) = allocator::result_channel();
	for i in 0..5u32 {
		tx.send(success(i % 2, &format!("file{i}.wav"), 10.0, 1.0)).unwrap();
	}
	drop(tx);

	let mut agg = ProgressAggregator::new(5);
	let cancel = CancellationToken::new();
	agg.drain(&mut rx, 5, &cancel, Duration::from_secs(5)).await.unwrap();

	let stats = agg.summary();
	// Invariant: a completed drain accounts for every file exactly once
	assert_eq!(stats.completed(), 5);
	assert_eq!(stats.successes + stats.failures, stats.total_files);
	assert_eq!(stats.per_gpu[&0].processed, 3);
	assert_eq!(stats.per_gpu[&1].processed, 2);
	assert_eq!(agg.exit_code(), 0);
}

#[tokio::test]
async fn failures_complete_the_batch_but_flip_the_exit_code() {
	let (tx, mut rx) = allocator::result_channel();
	tx.send(success(0, "a.wav", 10.0, 1.0)).unwrap();
	tx.send(failure(0, "b.wav", "decode failed")).unwrap();
	tx.send(success(1, "c.wav", 20.0, 2.0)).unwrap();
	tx.send(failure(1, "d.wav", "oom")).unwrap();
	tx.send(success(1, "e.wav", 5.0, 0.5)).unwrap();
	drop(tx);

	let mut agg = ProgressAggregator::new(5);
	let cancel = CancellationToken::new();
	agg.drain(&mut rx, 5, &cancel, Duration::from_secs(5)).await.unwrap();

	let stats = agg.summary();
	assert_eq!(stats.successes, 3);
	assert_eq!(stats.failures, 2);
	assert_eq!(stats.failed_files.len(), 2);
	assert_eq!(agg.exit_code(), 1, "any per-file failure must fail the run");
}

#[tokio::test]
async fn empty_batch_drains_immediately() {
	let (_tx, mut rx) = allocator::result_channel();

	let mut agg = ProgressAggregator::new(0);
	let cancel = CancellationToken::new();
	// Nothing expected, so the open-but-silent channel must not block
	agg.drain(&mut rx, 0, &cancel, Duration::from_secs(5)).await.unwrap();
	assert_eq!(agg.summary().completed(), 0);
}

// ============================================================================
// Stalls
// ============================================================================

#[tokio::test]
async fn closed_channel_with_a_shortfall_is_a_stall() {
	let (tx, mut rx) = allocator::result_channel();
	tx.send(success(0, "a.wav", 10.0, 1.0)).unwrap();
	tx.send(success(0, "b.wav", 10.0, 1.0)).unwrap();
	tx.send(success(1, "c.wav", 10.0, 1.0)).unwrap();
	// Workers exit with two files still unaccounted
	drop(tx);

	let mut agg = ProgressAggregator::new(5);
	let cancel = CancellationToken::new();
	let err = agg.drain(&mut rx, 5, &cancel, Duration::from_secs(5)).await.unwrap_err();

	match err {
		Error::Stalled { received, expected } => {
			assert_eq!(received, 3);
			assert_eq!(expected, 5);
		}
		other => panic!("expected Stalled, got {other:?}"),
	}
	// The three results that did arrive are still on the books
	assert_eq!(agg.summary().successes, 3);
}

#[tokio::test]
async fn worker_error_alone_never_satisfies_the_drain() {
	let (tx, mut rx) = allocator::result_channel();
	tx.send(WorkerResult::WorkerError {
		gpu_id: 1,
		error: "model load failed".to_string(),
	})
	.unwrap();
	drop(tx);

	let mut agg = ProgressAggregator::new(2);
	let cancel = CancellationToken::new();
	let err = agg.drain(&mut rx, 2, &cancel, Duration::from_secs(5)).await.unwrap_err();

	match err {
		Error::Stalled { received, expected } => {
			assert_eq!(received, 0, "worker errors must not count as completed files");
			assert_eq!(expected, 2);
		}
		other => panic!("expected Stalled, got {other:?}"),
	}
	assert_eq!(agg.summary().worker_errors.len(), 1);
}

#[tokio::test]
async fn silence_past_the_stall_timeout_is_a_stall() {
	let (tx, mut rx) = allocator::result_channel();
	tx.send(success(0, "a.wav", 10.0, 1.0)).unwrap();

	let mut agg = ProgressAggregator::new(3);
	let cancel = CancellationToken::new();
	// tx stays alive, so the only way out is the inactivity bound
	let err = agg.drain(&mut rx, 3, &cancel, Duration::from_millis(300)).await.unwrap_err();

	match err {
		Error::Stalled { received, expected } => {
			assert_eq!(received, 1);
			assert_eq!(expected, 3);
		}
		other => panic!("expected Stalled, got {other:?}"),
	}
	drop(tx);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn cancellation_interrupts_the_drain() {
	let (tx, mut rx) = allocator::result_channel();
	tx.send(success(0, "a.wav", 10.0, 1.0)).unwrap();

	let cancel = CancellationToken::new();
	let canceller = cancel.clone();
	tokio::spawn(async move {
		tokio::time::sleep(Duration::from_millis(150)).await;
		canceller.cancel();
	});

	let mut agg = ProgressAggregator::new(3);
	let err = agg.drain(&mut rx, 3, &cancel, Duration::from_secs(30)).await.unwrap_err();

	assert!(matches!(err, Error::Interrupted), "got {err:?}");
	drop(tx);
}
