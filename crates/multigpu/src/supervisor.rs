use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::messages::{TaskMessage, WorkerResult};

/// How long workers get between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// How to start one worker process.
///
/// The production launcher re-executes the current binary with the hidden
/// `worker` subcommand; tests substitute stub programs that speak the same
/// stdin/stdout line protocol. The supervisor appends `--gpu <id>` and sets
/// `CUDA_VISIBLE_DEVICES` per device.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
	pub program: PathBuf,
	pub args: Vec<String>,
}

impl WorkerCommand {
	pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
		Self { program: program.into(), args }
	}

	pub fn current_exe(args: Vec<String>) -> Result<Self> {
		Ok(Self {
			program: std::env::current_exe()?,
			args,
		})
	}
}

/// One device's share of the batch: its task stream, sentinel included.
#[derive(Debug, Clone)]
pub struct WorkerShare {
	pub gpu_id: u32,
	pub tasks: Vec<TaskMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
	pub gpu_id: u32,
	pub pid: Option<u32>,
	pub alive: bool,
	pub exit_code: Option<i32>,
}

struct WorkerHandle {
	gpu_id: u32,
	pid: Option<u32>,
	child: Child,
	feeder: Option<JoinHandle<()>>,
	reader: Option<JoinHandle<()>>,
	exit_code: Option<i32>,
}

/// Owns the worker processes for one run.
///
/// Each worker is bound to its device through `CUDA_VISIBLE_DEVICES` set at
/// spawn, before the child initializes any CUDA state; inside the child the
/// assigned device is always device 0. The binding is immutable for the
/// child's lifetime.
pub struct WorkerSupervisor {
	command: WorkerCommand,
	grace_period: Duration,
	handles: Vec<WorkerHandle>,
}

impl WorkerSupervisor {
	pub fn new(command: WorkerCommand) -> Self {
		Self {
			command,
			grace_period: TERMINATE_GRACE,
			handles: Vec::new(),
		}
	}

	pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
		self.grace_period = grace_period;
		self
	}

	pub fn worker_count(&self) -> usize {
		self.handles.len()
	}

	/// Spawn one worker per share and wire up its task and result streams.
	///
	/// A feeder task writes the share's messages to the child's stdin and
	/// closes the pipe; a reader task parses result lines from the child's
	/// stdout into `result_tx`, skipping malformed lines. The sender is
	/// consumed here so the merged result channel closes exactly when the
	/// last reader finishes.
	pub fn spawn(&mut self, shares: Vec<WorkerShare>, result_tx: mpsc::UnboundedSender<WorkerResult>) -> Result<()> {
		for share in shares {
			let handle = self.spawn_worker(share, &result_tx)?;
			self.handles.push(handle);
		}
		Ok(())
	}

	fn spawn_worker(&self, share: WorkerShare, result_tx: &mpsc::UnboundedSender<WorkerResult>) -> Result<WorkerHandle> {
		let gpu_id = share.gpu_id;

		let mut command = self.build_command(gpu_id);
		let mut child = command.spawn().map_err(|source| Error::Spawn { gpu_id, source })?;
		let pid = child.id();

		info!(gpu_id, pid, files = share.tasks.len().saturating_sub(1), "🚀 Spawned worker");

		let feeder = child.stdin.take().map(|stdin| tokio::spawn(feed_tasks(gpu_id, stdin, share.tasks)));
		let reader = child
			.stdout
			.take()
			.map(|stdout| tokio::spawn(read_results(gpu_id, stdout, result_tx.clone())));

		Ok(WorkerHandle {
			gpu_id,
			pid,
			child,
			feeder,
			reader,
			exit_code: None,
		})
	}

	fn build_command(&self, gpu_id: u32) -> Command {
		let mut command = Command::new(&self.command.program);
		command
			.args(&self.command.args)
			.arg("--gpu")
			.arg(gpu_id.to_string())
			.env("CUDA_VISIBLE_DEVICES", gpu_id.to_string())
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::inherit())
			.kill_on_drop(true);
		command
	}

	/// Wait for every worker to exit. Returns false if `timeout` elapses
	/// with workers still running; no worker is signalled in that case.
	pub async fn wait_all(&mut self, timeout: Option<Duration>) -> bool {
		let wait = async {
			for handle in &mut self.handles {
				match handle.child.wait().await {
					Ok(status) => {
						handle.exit_code = status.code();
						if status.success() {
							debug!(gpu_id = handle.gpu_id, "Worker exited cleanly");
						} else {
							warn!(gpu_id = handle.gpu_id, code = ?status.code(), "Worker exited with an error");
						}
					}
					Err(e) => warn!(gpu_id = handle.gpu_id, error = %e, "Failed to reap worker"),
				}

				if let Some(feeder) = handle.feeder.take() {
					let _ = feeder.await;
				}
				if let Some(reader) = handle.reader.take() {
					let _ = reader.await;
				}
			}
		};

		match timeout {
			Some(limit) => tokio::time::timeout(limit, wait).await.is_ok(),
			None => {
				wait.await;
				true
			}
		}
	}

	/// Terminate every live worker: SIGTERM, a short grace period, then
	/// SIGKILL for whatever is still running. Used on interrupt and on
	/// fatal errors only.
	pub async fn terminate_all(&mut self) {
		let mut signalled = 0usize;
		for handle in &mut self.handles {
			if !is_alive(&mut handle.child) {
				continue;
			}
			terminate(&mut handle.child, handle.gpu_id);
			signalled += 1;
		}

		if signalled == 0 {
			return;
		}

		info!(workers = signalled, grace_ms = self.grace_period.as_millis() as u64, "🛑 Terminating workers");
		tokio::time::sleep(self.grace_period).await;

		for handle in &mut self.handles {
			if is_alive(&mut handle.child) {
				warn!(gpu_id = handle.gpu_id, "Worker ignored SIGTERM, killing");
				let _ = handle.child.start_kill();
			}
		}

		// Reap; a bounded wait in case something refuses to die
		self.wait_all(Some(Duration::from_secs(2))).await;
	}

	/// Liveness and exit codes for every spawned worker, in spawn order.
	pub fn status(&mut self) -> Vec<WorkerStatus> {
		self
			.handles
			.iter_mut()
			.map(|handle| {
				let (alive, exit_code) = match handle.child.try_wait() {
					Ok(Some(status)) => (false, status.code()),
					Ok(None) => (true, None),
					Err(_) => (false, None),
				};
				if exit_code.is_some() {
					handle.exit_code = exit_code;
				}
				WorkerStatus {
					gpu_id: handle.gpu_id,
					pid: handle.pid,
					alive,
					exit_code: exit_code.or(handle.exit_code),
				}
			})
			.collect()
	}

	pub fn alive_count(&mut self) -> usize {
		self.status().iter().filter(|s| s.alive).count()
	}
}

fn is_alive(child: &mut Child) -> bool {
	!matches!(child.try_wait(), Ok(Some(_)))
}

#[cfg(unix)]
fn terminate(child: &mut Child, gpu_id: u32) {
	if let Some(pid) = child.id() {
		debug!(gpu_id, pid, "Sending SIGTERM");
		// SAFETY: plain signal send to a pid we spawned and still own
		unsafe {
			libc::kill(pid as libc::pid_t, libc::SIGTERM);
		}
	}
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, gpu_id: u32) {
	debug!(gpu_id, "No SIGTERM on this platform, killing directly");
	let _ = child.start_kill();
}

async fn feed_tasks(gpu_id: u32, mut stdin: tokio::process::ChildStdin, tasks: Vec<TaskMessage>) {
	for task in &tasks {
		let line = match task.to_line() {
			Ok(line) => line,
			Err(e) => {
				warn!(gpu_id, error = %e, "Failed to encode task, skipping");
				continue;
			}
		};

		let write = async {
			stdin.write_all(line.as_bytes()).await?;
			stdin.write_all(b"\n").await?;
			stdin.flush().await
		};
		if let Err(e) = write.await {
			// Worker gone before its stream ended (init failure path)
			debug!(gpu_id, error = %e, "Worker stdin closed early");
			return;
		}
	}

	// Closing the pipe is a second end-of-stream signal after the sentinel
	drop(stdin);
}

async fn read_results(gpu_id: u32, stdout: tokio::process::ChildStdout, tx: mpsc::UnboundedSender<WorkerResult>) {
	let mut lines = BufReader::new(stdout).lines();

	loop {
		match lines.next_line().await {
			Ok(Some(line)) => {
				let line = line.trim();
				if line.is_empty() {
					continue;
				}
				match WorkerResult::from_line(line) {
					Ok(result) => {
						if tx.send(result).is_err() {
							// Aggregator is gone; nothing left to report to
							return;
						}
					}
					Err(e) => warn!(gpu_id, error = %e, line, "Ignoring malformed worker output"),
				}
			}
			Ok(None) => return,
			Err(e) => {
				warn!(gpu_id, error = %e, "Worker stdout read failed");
				return;
			}
		}
	}
}
