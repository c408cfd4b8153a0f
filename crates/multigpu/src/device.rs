use once_cell::sync::OnceCell;
use std::fmt;
use std::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A CUDA device visible to the launcher, identified by its physical index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
	pub id: u32,
	pub name: String,
	pub memory_mb: u64,
	pub compute_cap: String,
}

impl Device {
	pub fn memory_gb(&self) -> f64 {
		self.memory_mb as f64 / 1024.0
	}
}

impl fmt::Display for Device {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "GPU {}: {} ({:.1} GB, compute {})", self.id, self.name, self.memory_gb(), self.compute_cap)
	}
}

/// Source of the device inventory. Production probes the driver; tests
/// inject fixed inventories.
pub trait DeviceProbe: Send + Sync {
	fn probe(&self) -> Vec<Device>;
}

/// Probes through `nvidia-smi`. Hosts without the driver CLI (or with a
/// failing one) report no devices rather than an error.
pub struct NvidiaSmi;

impl DeviceProbe for NvidiaSmi {
	fn probe(&self) -> Vec<Device> {
		let output = match Command::new("nvidia-smi")
			.args(["--query-gpu=index,name,memory.total,compute_cap", "--format=csv,noheader,nounits"])
			.output()
		{
			Ok(output) => output,
			Err(e) => {
				debug!(error = %e, "nvidia-smi not available, assuming no GPUs");
				return Vec::new();
			}
		};

		if !output.status.success() {
			warn!(status = %output.status, "nvidia-smi exited with an error, assuming no GPUs");
			return Vec::new();
		}

		parse_query_output(&String::from_utf8_lossy(&output.stdout))
	}
}

fn parse_query_output(stdout: &str) -> Vec<Device> {
	stdout.lines().filter_map(parse_device_line).collect()
}

fn parse_device_line(line: &str) -> Option<Device> {
	let line = line.trim();
	if line.is_empty() {
		return None;
	}

	let mut fields = line.split(',').map(str::trim);
	let id = fields.next()?.parse().ok()?;
	let name = fields.next()?.to_string();
	let memory_mb = fields.next()?.parse().ok()?;
	let compute_cap = fields.next()?.to_string();

	Some(Device {
		id,
		name,
		memory_mb,
		compute_cap,
	})
}

/// Device discovery and validation.
///
/// The probe runs at most once per detector; every component in a run sees
/// the same inventory even if devices appear or vanish mid-batch.
pub struct GpuDetector {
	probe: Box<dyn DeviceProbe>,
	devices: OnceCell<Vec<Device>>,
}

impl Default for GpuDetector {
	fn default() -> Self {
		Self::new(Box::new(NvidiaSmi))
	}
}

impl GpuDetector {
	pub fn new(probe: Box<dyn DeviceProbe>) -> Self {
		Self {
			probe,
			devices: OnceCell::new(),
		}
	}

	/// All detected devices, probed on first call and cached for the
	/// detector's lifetime.
	pub fn enumerate(&self) -> &[Device] {
		self.devices.get_or_init(|| self.probe.probe())
	}

	pub fn device_count(&self) -> usize {
		self.enumerate().len()
	}

	pub fn device_ids(&self) -> Vec<u32> {
		self.enumerate().iter().map(|d| d.id).collect()
	}

	/// Check that every requested id exists. Read-only: a failed validation
	/// must leave no trace beyond the returned error.
	pub fn validate(&self, requested: &[u32]) -> Result<()> {
		if requested.is_empty() {
			return Err(Error::EmptyGpuRequest);
		}

		let available = self.device_ids();
		if available.is_empty() {
			return Err(Error::NoDevices);
		}

		for &gpu_id in requested {
			if !available.contains(&gpu_id) {
				return Err(Error::DeviceUnavailable {
					gpu_id,
					available: available.clone(),
				});
			}
		}

		Ok(())
	}

	/// Parse a device request: `"auto"` selects every detected device,
	/// otherwise comma-separated physical indices.
	pub fn parse_spec(&self, spec: &str) -> Result<Vec<u32>> {
		if spec.trim().eq_ignore_ascii_case("auto") {
			let ids = self.device_ids();
			if ids.is_empty() {
				return Err(Error::NoDevices);
			}
			return Ok(ids);
		}

		spec
			.split(',')
			.map(|part| {
				part.trim().parse::<u32>().map_err(|_| Error::InvalidGpuSpec { spec: spec.to_string() })
			})
			.collect()
	}
}
