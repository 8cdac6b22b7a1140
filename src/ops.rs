// operator contract: the simulator consumes an ordered operator graph and a
// per-operator parallel configuration, it never constructs models itself

use crate::cost::Workspace;
use std::collections::BTreeMap;
use std::fmt;

/// Highest supported tensor rank for tiles and parallel dims.
pub const MAX_DIM: usize = 4;

/// Stable operator identity, assigned by the caller at model construction.
/// All fingerprints key on this id, never on addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceType {
    Gpu,
    Cpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompMode {
    Training,
    Inference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Conv2d,
    Linear,
    Embedding,
    Pool2d,
    Flat,
    Softmax,
    Concat,
    Split,
    BatchNorm,
    ElementWise,
    Attention,
    Other,
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpType::Conv2d => "conv2d",
            OpType::Linear => "linear",
            OpType::Embedding => "embedding",
            OpType::Pool2d => "pool2d",
            OpType::Flat => "flat",
            OpType::Softmax => "softmax",
            OpType::Concat => "concat",
            OpType::Split => "split",
            OpType::BatchNorm => "batch_norm",
            OpType::ElementWise => "element_wise",
            OpType::Attention => "attention",
            OpType::Other => "other",
        };
        write!(f, "{}", name)
    }
}

/// Element types the measurement workspace can allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Float,
    Double,
    Int32,
    Int64,
    Bool,
}

impl DataType {
    pub fn size_bytes(self) -> usize {
        match self {
            DataType::Float | DataType::Int32 => 4,
            DataType::Double | DataType::Int64 => 8,
            DataType::Bool => 1,
        }
    }
}

/// An axis-aligned integer rectangle: the sub-region of a tensor that one
/// part owns. Intervals are inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Domain {
    n_dims: usize,
    lo: [i64; MAX_DIM],
    hi: [i64; MAX_DIM],
}

impl Domain {
    pub fn new(bounds: &[(i64, i64)]) -> Domain {
        assert!(bounds.len() <= MAX_DIM, "domain rank {} exceeds MAX_DIM", bounds.len());
        let mut d = Domain { n_dims: bounds.len(), lo: [0; MAX_DIM], hi: [0; MAX_DIM] };
        for (i, &(lo, hi)) in bounds.iter().enumerate() {
            d.lo[i] = lo;
            d.hi[i] = hi;
        }
        d
    }

    pub fn n_dims(&self) -> usize {
        self.n_dims
    }

    pub fn intersection(&self, other: &Domain) -> Domain {
        assert_eq!(self.n_dims, other.n_dims, "intersecting domains of different rank");
        let mut out = *self;
        for i in 0..self.n_dims {
            out.lo[i] = self.lo[i].max(other.lo[i]);
            out.hi[i] = self.hi[i].min(other.hi[i]);
        }
        out
    }

    /// Number of elements; zero when any interval is empty.
    pub fn volume(&self) -> u64 {
        let mut vol = 1u64;
        for i in 0..self.n_dims {
            vol *= (self.hi[i] - self.lo[i] + 1).max(0) as u64;
        }
        vol
    }
}

/// How one operator is split across devices: `dim[i]` parts along each of
/// `n_dims` axes, part `j` placed on `device_ids[j]` (global gpu ids).
#[derive(Debug, Clone, PartialEq)]
pub struct ParallelConfig {
    pub device_type: DeviceType,
    pub n_dims: usize,
    pub dim: [i32; MAX_DIM],
    pub device_ids: Vec<usize>,
}

impl ParallelConfig {
    pub fn num_parts(&self) -> usize {
        let mut parts = 1usize;
        for i in 0..self.n_dims {
            parts *= self.dim[i] as usize;
        }
        parts
    }

    /// Data-parallel means only the outermost dim is split and parts sit on
    /// devices `0..num_parts` in order.
    pub fn is_data_parallel(&self) -> bool {
        for i in 0..self.n_dims.saturating_sub(1) {
            if self.dim[i] > 1 {
                return false;
            }
        }
        for i in 0..self.num_parts() {
            if self.device_ids[i] != i {
                return false;
            }
        }
        true
    }

    /// The canonical data-parallel placement over gpus `0..num_parts`.
    pub fn data_parallel(num_parts: usize) -> ParallelConfig {
        let mut dim = [1; MAX_DIM];
        dim[0] = num_parts as i32;
        ParallelConfig {
            device_type: DeviceType::Gpu,
            n_dims: 1,
            dim,
            device_ids: (0..num_parts).collect(),
        }
    }
}

/// What one operator probe reports: kernel times in seconds and the peak
/// device memory one part needs in bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostMetrics {
    pub forward_time: f32,
    pub backward_time: f32,
    pub memory_requirement: u64,
}

/// One node of the operator graph. Implemented by the embedding framework;
/// the simulator only reads identity, wiring, tile shapes, and the probe.
pub trait Op {
    fn id(&self) -> OpId;
    fn name(&self) -> &str;
    fn op_type(&self) -> OpType;
    fn num_inputs(&self) -> usize;
    fn num_weights(&self) -> usize;

    /// Producer of the i-th input tensor as `(operator, output index)`.
    /// `None` marks a model input, which contributes no dependency.
    fn input_source(&self, idx: usize) -> Option<(OpId, usize)>;

    /// Tile of the i-th input tensor owned by `part` under `config`.
    fn input_tile(&self, config: &ParallelConfig, tensor_idx: usize, part: usize) -> Domain;
    fn output_tile(&self, config: &ParallelConfig, tensor_idx: usize, part: usize) -> Domain;
    fn weight_tile(&self, config: &ParallelConfig, weight_idx: usize, part: usize) -> Domain;

    /// Measure forward/backward kernel time and memory for one part,
    /// synthesizing tiles in `workspace`. `None` means not implemented,
    /// which the oracle treats as fatal.
    fn measure_cost(&self, workspace: &mut Workspace, config: &ParallelConfig) -> Option<CostMetrics>;
}

#[derive(Debug, Clone, Default)]
pub struct ModelConfig {
    /// Overlap backward computation with parameter-server weight updates
    /// instead of the bulk-synchronous barrier scheme.
    pub overlap_backward_update: bool,
}

/// Ordered operator list, producers before consumers.
pub struct Model {
    layers: Vec<Box<dyn Op>>,
    by_id: BTreeMap<OpId, usize>,
    pub config: ModelConfig,
}

impl Model {
    pub fn new(config: ModelConfig) -> Model {
        Model { layers: Vec::new(), by_id: BTreeMap::new(), config }
    }

    pub fn add_layer(&mut self, op: Box<dyn Op>) {
        let id = op.id();
        for i in 0..op.num_inputs() {
            if let Some((producer, _)) = op.input_source(i) {
                assert!(
                    self.by_id.contains_key(&producer),
                    "operator {} consumes output of {:?} which is not in the model yet",
                    op.name(),
                    producer
                );
            }
        }
        let prev = self.by_id.insert(id, self.layers.len());
        assert!(prev.is_none(), "duplicate operator id {:?}", id);
        self.layers.push(op);
    }

    pub fn layers(&self) -> &[Box<dyn Op>] {
        &self.layers
    }

    pub fn op(&self, id: OpId) -> &dyn Op {
        let idx = *self.by_id.get(&id).unwrap_or_else(|| panic!("unknown operator id {:?}", id));
        self.layers[idx].as_ref()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// A complete strategy: every operator of the model maps to a config.
pub type Strategy = BTreeMap<OpId, ParallelConfig>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_intersection_and_volume() {
        let a = Domain::new(&[(0, 9), (0, 9)]);
        let b = Domain::new(&[(5, 14), (0, 4)]);
        let i = a.intersection(&b);
        assert_eq!(i, Domain::new(&[(5, 9), (0, 4)]));
        assert_eq!(i.volume(), 25);
        assert_eq!(a.volume(), 100);
    }

    #[test]
    fn disjoint_domains_have_empty_intersection() {
        let a = Domain::new(&[(0, 3)]);
        let b = Domain::new(&[(4, 7)]);
        assert_eq!(a.intersection(&b).volume(), 0);
        // and symmetric
        assert_eq!(b.intersection(&a).volume(), 0);
    }

    #[test]
    fn num_parts_is_the_dim_product() {
        let pc = ParallelConfig {
            device_type: DeviceType::Gpu,
            n_dims: 3,
            dim: [2, 1, 3, 1],
            device_ids: (0..6).collect(),
        };
        assert_eq!(pc.num_parts(), 6);
    }

    #[test]
    fn data_parallel_detection() {
        assert!(ParallelConfig::data_parallel(4).is_data_parallel());

        // outermost dim split, identity placement
        let pc = ParallelConfig {
            device_type: DeviceType::Gpu,
            n_dims: 2,
            dim: [1, 4, 1, 1],
            device_ids: vec![0, 1, 2, 3],
        };
        assert!(pc.is_data_parallel());

        // inner dim split is model parallelism
        let pc = ParallelConfig { dim: [4, 1, 1, 1], ..pc };
        assert!(!pc.is_data_parallel());

        // permuted devices are not data parallel either
        let mut pc = ParallelConfig::data_parallel(4);
        pc.device_ids.swap(1, 2);
        assert!(!pc.is_data_parallel());
    }

    #[test]
    #[should_panic(expected = "different rank")]
    fn rank_mismatch_is_a_bug() {
        Domain::new(&[(0, 1)]).intersection(&Domain::new(&[(0, 1), (0, 1)]));
    }
}
