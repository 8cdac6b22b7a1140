// the machine model: compute devices and the communication links between them

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid machine description: {0}")]
    InvalidMachine(String),
}

/// Index of a device in the topology. Tasks and lookup maps refer to devices
/// by id; the `Device` values themselves never move after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceId(pub(crate) u32);

/// A compute device (one GPU) or a directed communication link.
#[derive(Debug, Clone)]
pub enum Device {
    Compute {
        node_id: usize,
        gpu_id: usize,
        /// memory capacity in bytes
        capacity: u64,
    },
    Comm {
        /// bytes per second
        bandwidth: f32,
    },
}

impl Device {
    pub fn node_id(&self) -> usize {
        match self {
            Device::Compute { node_id, .. } => *node_id,
            Device::Comm { .. } => panic!("communication link has no node id"),
        }
    }

    pub fn gpu_id(&self) -> usize {
        match self {
            Device::Compute { gpu_id, .. } => *gpu_id,
            Device::Comm { .. } => panic!("communication link has no gpu id"),
        }
    }

    pub fn capacity(&self) -> u64 {
        match self {
            Device::Compute { capacity, .. } => *capacity,
            Device::Comm { .. } => panic!("communication link has no memory capacity"),
        }
    }

    pub fn bandwidth(&self) -> f32 {
        match self {
            Device::Comm { bandwidth } => *bandwidth,
            Device::Compute { .. } => panic!("compute device has no bandwidth"),
        }
    }

    pub fn is_compute(&self) -> bool {
        matches!(self, Device::Compute { .. })
    }
}

/// Description of the target machine. All bandwidths are bytes per second.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub num_nodes: usize,
    pub gpus_per_node: usize,
    /// GPU-to-GPU links inside one node (NVLink class)
    pub intra_node_bandwidth: f32,
    /// DRAM-to-DRAM links across nodes (interconnect class)
    pub inter_node_bandwidth: f32,
    pub gpu_to_dram_bandwidth: f32,
    pub dram_to_gpu_bandwidth: f32,
    /// per-GPU memory capacity in bytes
    pub gpu_memory_capacity: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            num_nodes: 1,
            gpus_per_node: 4,
            intra_node_bandwidth: 100e9,
            inter_node_bandwidth: 12.5e9,
            gpu_to_dram_bandwidth: 16e9,
            dram_to_gpu_bandwidth: 16e9,
            gpu_memory_capacity: 16 << 30,
        }
    }
}

impl MachineConfig {
    pub fn total_num_gpus(&self) -> usize {
        self.num_nodes * self.gpus_per_node
    }

    fn validate(&self) -> Result<(), SimError> {
        if self.num_nodes == 0 || self.gpus_per_node == 0 {
            return Err(SimError::InvalidMachine(format!(
                "{} nodes with {} gpus each",
                self.num_nodes, self.gpus_per_node
            )));
        }
        for (name, bw) in [
            ("intra_node_bandwidth", self.intra_node_bandwidth),
            ("inter_node_bandwidth", self.inter_node_bandwidth),
            ("gpu_to_dram_bandwidth", self.gpu_to_dram_bandwidth),
            ("dram_to_gpu_bandwidth", self.dram_to_gpu_bandwidth),
        ] {
            if !bw.is_finite() || bw <= 0.0 {
                return Err(SimError::InvalidMachine(format!("{} must be positive, got {}", name, bw)));
            }
        }
        if self.gpu_memory_capacity == 0 {
            return Err(SimError::InvalidMachine("gpu_memory_capacity is zero".into()));
        }
        Ok(())
    }
}

/// Immutable registry of all devices. One compute device per GPU, one
/// communication device per registered directed pair. Lookups of
/// unregistered ids are programmer errors and panic.
pub struct Topology {
    devices: Vec<Device>,
    gpus_per_node: usize,
    compute: BTreeMap<usize, DeviceId>,
    inter_gpu: BTreeMap<(usize, usize), DeviceId>,
    gpu_to_dram: BTreeMap<usize, DeviceId>,
    dram_to_gpu: BTreeMap<usize, DeviceId>,
    inter_node: BTreeMap<(usize, usize), DeviceId>,
}

impl Topology {
    pub fn new(machine: &MachineConfig) -> Result<Self, SimError> {
        machine.validate()?;

        let mut topo = Topology {
            devices: Vec::new(),
            gpus_per_node: machine.gpus_per_node,
            compute: BTreeMap::new(),
            inter_gpu: BTreeMap::new(),
            gpu_to_dram: BTreeMap::new(),
            dram_to_gpu: BTreeMap::new(),
            inter_node: BTreeMap::new(),
        };

        let total_gpus = machine.total_num_gpus();
        for gpu in 0..total_gpus {
            let node = gpu / machine.gpus_per_node;
            let id = topo.push(Device::Compute {
                node_id: node,
                gpu_id: gpu,
                capacity: machine.gpu_memory_capacity,
            });
            debug!("compute device {:?}: node {} gpu {} capacity {}", id, node, gpu, machine.gpu_memory_capacity);
            topo.compute.insert(gpu, id);
        }

        // one directed link per same-node gpu pair
        for src in 0..total_gpus {
            for dst in 0..total_gpus {
                if src != dst && src / machine.gpus_per_node == dst / machine.gpus_per_node {
                    let id = topo.push(Device::Comm { bandwidth: machine.intra_node_bandwidth });
                    topo.inter_gpu.insert((src, dst), id);
                }
            }
        }

        for gpu in 0..total_gpus {
            let id = topo.push(Device::Comm { bandwidth: machine.gpu_to_dram_bandwidth });
            topo.gpu_to_dram.insert(gpu, id);
            let id = topo.push(Device::Comm { bandwidth: machine.dram_to_gpu_bandwidth });
            topo.dram_to_gpu.insert(gpu, id);
        }

        for src in 0..machine.num_nodes {
            for dst in 0..machine.num_nodes {
                if src != dst {
                    let id = topo.push(Device::Comm { bandwidth: machine.inter_node_bandwidth });
                    topo.inter_node.insert((src, dst), id);
                }
            }
        }

        debug!("topology: {} gpus, {} devices total", total_gpus, topo.devices.len());
        Ok(topo)
    }

    fn push(&mut self, device: Device) -> DeviceId {
        let id = DeviceId(self.devices.len() as u32);
        self.devices.push(device);
        id
    }

    pub fn device(&self, id: DeviceId) -> &Device {
        &self.devices[id.0 as usize]
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn total_num_gpus(&self) -> usize {
        self.compute.len()
    }

    pub fn gpus_per_node(&self) -> usize {
        self.gpus_per_node
    }

    pub fn compute_device(&self, gpu_id: usize) -> DeviceId {
        *self
            .compute
            .get(&gpu_id)
            .unwrap_or_else(|| panic!("no compute device registered for gpu {}", gpu_id))
    }

    pub fn inter_gpu_comm_device(&self, src_gpu: usize, dst_gpu: usize) -> DeviceId {
        *self
            .inter_gpu
            .get(&(src_gpu, dst_gpu))
            .unwrap_or_else(|| panic!("no intra-node link registered for gpu pair ({}, {})", src_gpu, dst_gpu))
    }

    pub fn gpu_to_dram_comm_device(&self, gpu_id: usize) -> DeviceId {
        *self
            .gpu_to_dram
            .get(&gpu_id)
            .unwrap_or_else(|| panic!("no gpu-to-dram link registered for gpu {}", gpu_id))
    }

    pub fn dram_to_gpu_comm_device(&self, gpu_id: usize) -> DeviceId {
        *self
            .dram_to_gpu
            .get(&gpu_id)
            .unwrap_or_else(|| panic!("no dram-to-gpu link registered for gpu {}", gpu_id))
    }

    pub fn inter_node_comm_device(&self, src_node: usize, dst_node: usize) -> DeviceId {
        *self
            .inter_node
            .get(&(src_node, dst_node))
            .unwrap_or_else(|| panic!("no inter-node link registered for node pair ({}, {})", src_node, dst_node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_by_two() -> MachineConfig {
        MachineConfig {
            num_nodes: 2,
            gpus_per_node: 2,
            intra_node_bandwidth: 10e9,
            inter_node_bandwidth: 5e9,
            gpu_to_dram_bandwidth: 20e9,
            dram_to_gpu_bandwidth: 20e9,
            gpu_memory_capacity: 1 << 30,
        }
    }

    #[test]
    fn device_counts() {
        let topo = Topology::new(&two_by_two()).unwrap();
        // 4 gpus, 2 intra links per node, 2 dram links per gpu, 2 inter-node links
        assert_eq!(topo.total_num_gpus(), 4);
        assert_eq!(topo.num_devices(), 4 + 2 * 2 + 2 * 4 + 2);
    }

    #[test]
    fn lookups_resolve_registered_pairs() {
        let topo = Topology::new(&two_by_two()).unwrap();
        let link = topo.inter_gpu_comm_device(2, 3);
        assert_eq!(topo.device(link).bandwidth(), 10e9);
        let link = topo.inter_node_comm_device(1, 0);
        assert_eq!(topo.device(link).bandwidth(), 5e9);
        let gpu = topo.compute_device(3);
        assert_eq!(topo.device(gpu).node_id(), 1);
        assert_eq!(topo.device(gpu).gpu_id(), 3);
    }

    #[test]
    #[should_panic(expected = "no intra-node link")]
    fn cross_node_gpu_pair_is_not_registered() {
        let topo = Topology::new(&two_by_two()).unwrap();
        topo.inter_gpu_comm_device(0, 2);
    }

    #[test]
    fn rejects_degenerate_machines() {
        let mut machine = two_by_two();
        machine.gpus_per_node = 0;
        assert!(Topology::new(&machine).is_err());

        let mut machine = two_by_two();
        machine.inter_node_bandwidth = 0.0;
        assert!(Topology::new(&machine).is_err());
    }
}
