//! GPU device request and placement constraints.
//!
//! Hardware selection lives in job-level constraints only; the device request
//! never carries constraints of its own.

use crate::api::types::{Constraint, RequestedDevice};
use nomad_config::GpuOptions;

pub const GPU_DEVICE: &str = "nvidia/gpu";

const ARCH_TARGET: &str = "${attr.cpu.arch}";
const DEDICATED_TARGET: &str = "${meta.gpu-dedicated}";
const COMPUTE_CAPABILITY_TARGET: &str = "${meta.gpu_compute_capability}";

pub fn gpu_device_request(gpu: &GpuOptions) -> RequestedDevice {
    RequestedDevice {
        name: GPU_DEVICE.to_string(),
        count: gpu.count,
        constraints: Vec::new(),
    }
}

/// `amd64` hosts that are not reserved for dedicated GPU work, optionally
/// with a minimum compute capability.
pub fn gpu_job_constraints(gpu: &GpuOptions) -> Vec<Constraint> {
    let mut constraints = vec![
        Constraint::new(ARCH_TARGET, "=", "amd64"),
        Constraint::new(DEDICATED_TARGET, "!=", "true"),
    ];
    if let Some(capability) = gpu.compute_capability {
        // Both sides parse as floats, so Nomad orders them numerically.
        constraints.push(Constraint::new(
            COMPUTE_CAPABILITY_TARGET,
            ">=",
            &capability.to_string(),
        ));
    }
    constraints
}
