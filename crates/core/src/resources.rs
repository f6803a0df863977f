//! Resource quantities as exchanged with the broker.

use serde::{Deserialize, Serialize};

/// A bundle of cluster resources, either required by a job or carried by an
/// offer. All dimensions are non-negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuantity {
    pub cpu: i32,
    #[serde(rename = "memMB")]
    pub mem_mb: i32,
    #[serde(default)]
    pub gpu: i32,
    #[serde(default)]
    pub ports: i32,
}

impl ResourceQuantity {
    pub fn new(cpu: i32, mem_mb: i32) -> Self {
        Self {
            cpu,
            mem_mb,
            gpu: 0,
            ports: 0,
        }
    }

    pub fn with_gpu(mut self, gpu: i32) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn with_ports(mut self, ports: i32) -> Self {
        self.ports = ports;
        self
    }

    /// Accumulate another quantity into this one.
    pub fn add(&mut self, other: &ResourceQuantity) {
        self.cpu += other.cpu;
        self.mem_mb += other.mem_mb;
        self.gpu += other.gpu;
        self.ports += other.ports;
    }

    /// Remove a previously accounted quantity.
    pub fn subtract(&mut self, other: &ResourceQuantity) {
        self.cpu -= other.cpu;
        self.mem_mb -= other.mem_mb;
        self.gpu -= other.gpu;
        self.ports -= other.ports;
    }

    /// Whether this requirement fits entirely within `capacity`.
    pub fn fits_in(&self, capacity: &ResourceQuantity) -> bool {
        self.cpu <= capacity.cpu
            && self.mem_mb <= capacity.mem_mb
            && self.gpu <= capacity.gpu
            && self.ports <= capacity.ports
    }
}

impl std::fmt::Display for ResourceQuantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpu={} mem={}MB gpu={} ports={}",
            self.cpu, self.mem_mb, self.gpu, self.ports
        )
    }
}
