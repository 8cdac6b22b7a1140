// operator cost oracle: memoized kernel measurements backed by a scratch
// arena the probes use to stand up synthetic tiles

use crate::ops::{CostMetrics, DataType, DeviceType, Op, OpId, ParallelConfig, MAX_DIM};
use log::trace;
use std::collections::BTreeMap;

/// Bump allocator over one pre-sized buffer. Probes carve synthetic input,
/// output, and weight tiles out of it for kernel timing; it has no relation
/// to the model's real buffers. Running past the end is fatal.
pub struct Workspace {
    buffer: Box<[u8]>,
    offset: usize,
}

impl Workspace {
    pub fn new(capacity: usize) -> Workspace {
        Workspace { buffer: vec![0u8; capacity].into_boxed_slice(), offset: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn used(&self) -> usize {
        self.offset
    }

    pub fn allocate(&mut self, num_elements: usize, dtype: DataType) -> *mut u8 {
        let bytes = num_elements * dtype.size_bytes();
        let end = self.offset + bytes;
        if end > self.buffer.len() {
            panic!(
                "measurement workspace exhausted: {} bytes short; increase the workspace size to at least {} bytes",
                end - self.buffer.len(),
                end
            );
        }
        let ptr = self.buffer[self.offset..].as_mut_ptr();
        self.offset = end;
        ptr
    }

    pub fn free_all(&mut self) {
        self.offset = 0;
    }
}

/// Fingerprint of a cost request: operator identity plus the partitioning
/// shape. Placement (`device_ids`) is deliberately absent, parts are
/// interchangeable for kernel timing. Order of dims matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct CostKey {
    op: OpId,
    device_type: DeviceType,
    n_dims: usize,
    dim: [i32; MAX_DIM],
}

impl CostKey {
    fn of(op: OpId, config: &ParallelConfig) -> CostKey {
        let mut dim = [1; MAX_DIM];
        dim[..config.n_dims].copy_from_slice(&config.dim[..config.n_dims]);
        CostKey { op, device_type: config.device_type, n_dims: config.n_dims, dim }
    }
}

/// Append-only `(op, config shape) -> CostMetrics` map. Strategy search
/// re-evaluates the same partitioning shapes constantly; hits are the
/// common case and misses pay for a probe run.
pub(crate) struct CostOracle {
    cache: BTreeMap<CostKey, CostMetrics>,
}

impl CostOracle {
    pub fn new() -> CostOracle {
        CostOracle { cache: BTreeMap::new() }
    }

    pub fn measure(&mut self, op: &dyn Op, config: &ParallelConfig, workspace: &mut Workspace) -> CostMetrics {
        let key = CostKey::of(op.id(), config);
        if let Some(cached) = self.cache.get(&key) {
            trace!("cost cache hit for {} {:?}", op.name(), key.dim);
            return *cached;
        }
        workspace.free_all();
        let metrics = op.measure_cost(workspace, config).unwrap_or_else(|| {
            panic!("measure_cost not implemented for operator {} (type {})", op.name(), op.op_type())
        });
        trace!(
            "measured {} {:?}: fwd {:.6}s bwd {:.6}s mem {}B",
            op.name(),
            key.dim,
            metrics.forward_time,
            metrics.backward_time,
            metrics.memory_requirement
        );
        self.cache.insert(key, metrics);
        metrics
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.cache.len()
    }
}
