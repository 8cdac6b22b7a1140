// predict the makespan of one iteration: expand the operator graph into
// compute/comm/sync tasks, then list-schedule them over the machine

use log::debug;
use std::cmp;
use std::collections::{BTreeSet, BinaryHeap};
use std::io;

use crate::cost::{CostOracle, Workspace};
use crate::dot::DotWriter;
use crate::machine::{MachineConfig, SimError, Topology};
use crate::ops::{CompMode, CostMetrics, Domain, Model, Op, ParallelConfig, Strategy};
use crate::task::{SimTask, TaskId, TaskPool};

/// All simulated transfers move f32 elements.
const ELEMENT_BYTES: u64 = std::mem::size_of::<f32>() as u64;

/// Charge one millisecond per megabyte over a device's memory budget.
const MEMORY_PENALTY_PER_BYTE: f32 = 1e-9;

pub struct Simulator {
    topology: Topology,
    pool: TaskPool,
    oracle: CostOracle,
    workspace: Workspace,
}

/// Min-heap entry: earliest ready task first, task id breaking ties.
#[derive(PartialEq)]
struct ReadyTask {
    ready_time: f32,
    id: TaskId,
}

impl Eq for ReadyTask {}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        other
            .ready_time
            .total_cmp(&self.ready_time)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// One group of parts whose tiles of a weight coincide exactly and must be
/// kept in sync. `others` never contains `first`.
struct WeightClass {
    first: usize,
    others: Vec<usize>,
    tile: Domain,
}

/// Walk part indices in increasing order and group them by weight-tile
/// overlap. Overlapping tiles must coincide exactly; a partial overlap is a
/// broken strategy and fatal.
fn weight_sync_classes(op: &dyn Op, pc: &ParallelConfig, weight_idx: usize) -> Vec<WeightClass> {
    let mut synched = BTreeSet::new();
    let mut classes = Vec::new();
    for first in 0..pc.num_parts() {
        if !synched.insert(first) {
            continue;
        }
        let first_tile = op.weight_tile(pc, weight_idx, first);
        let mut others = Vec::new();
        for next in first + 1..pc.num_parts() {
            let next_tile = op.weight_tile(pc, weight_idx, next);
            if first_tile.intersection(&next_tile).volume() > 0 {
                assert!(
                    first_tile == next_tile,
                    "weight {} of operator {} is partially shared between parts {} and {}; tiles must fully coincide or be disjoint",
                    weight_idx,
                    op.name(),
                    first,
                    next
                );
                assert!(
                    synched.insert(next),
                    "weight {} of operator {}: part {} overlaps more than one synchronization class",
                    weight_idx,
                    op.name(),
                    next
                );
                others.push(next);
            }
        }
        classes.push(WeightClass { first, others, tile: first_tile });
    }
    classes
}

fn config_of<'a>(strategy: &'a Strategy, op: &dyn Op) -> &'a ParallelConfig {
    strategy
        .get(&op.id())
        .unwrap_or_else(|| panic!("strategy does not assign a parallel config to operator {}", op.name()))
}

impl Simulator {
    pub fn new(machine: &MachineConfig, workspace_bytes: usize, max_num_tasks: usize) -> Result<Simulator, SimError> {
        Ok(Simulator {
            topology: Topology::new(machine)?,
            pool: TaskPool::new(max_num_tasks),
            oracle: CostOracle::new(),
            workspace: Workspace::new(workspace_bytes),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Task records of the most recent simulation, in allocation order,
    /// with their scheduled `[start_time, end_time)` intervals. Diagnostic
    /// surface; the next `simulate_runtime` call invalidates it.
    pub fn tasks(&self) -> &[SimTask] {
        self.pool.live()
    }

    /// Memoized operator cost. Misses reset the measurement workspace and
    /// run the operator's probe.
    pub fn measure_operator_cost(&mut self, op: &dyn Op, config: &ParallelConfig) -> CostMetrics {
        self.oracle.measure(op, config, &mut self.workspace)
    }

    /// Predicted wall-clock seconds of one iteration under `strategy`,
    /// including the memory penalty.
    pub fn simulate_runtime(&mut self, model: &Model, strategy: &Strategy, comp_mode: CompMode) -> f32 {
        self.simulate_runtime_traced::<io::Sink>(model, strategy, comp_mode, None)
    }

    /// Same as `simulate_runtime`, optionally dumping the scheduled task
    /// graph to `trace` in Graphviz dot format.
    pub fn simulate_runtime_traced<W: io::Write>(
        &mut self,
        model: &Model,
        strategy: &Strategy,
        comp_mode: CompMode,
        trace: Option<&mut W>,
    ) -> f32 {
        let export = trace.is_some();
        let training = comp_mode == CompMode::Training;
        self.pool.reset();
        debug!("simulating {} operators in {:?} mode", model.len(), comp_mode);

        // pass A: per-part compute tasks
        for op in model.layers() {
            let config = config_of(strategy, op.as_ref());
            let cost = self.measure_operator_cost(op.as_ref(), config);
            for j in 0..config.num_parts() {
                let device = self.topology.compute_device(config.device_ids[j]);
                let fwd = self.pool.new_forward_task(op.as_ref(), j);
                let task = self.pool.task_mut(fwd);
                task.device = Some(device);
                task.run_time = cost.forward_time;
                if training {
                    let bwd = self.pool.new_backward_task(op.as_ref(), j);
                    let task = self.pool.task_mut(bwd);
                    task.device = Some(device);
                    task.run_time = cost.backward_time;
                    self.pool.add_edge(fwd, bwd);
                }
            }
        }

        // pass B: data dependencies wherever producer and consumer tiles overlap
        for op in model.layers() {
            let config = config_of(strategy, op.as_ref());
            for i in 0..op.num_inputs() {
                let (pre_id, owner_idx) = match op.input_source(i) {
                    Some(source) => source,
                    None => continue, // model input
                };
                let pre_op = model.op(pre_id);
                let pre_config = config_of(strategy, pre_op);
                for dst in 0..config.num_parts() {
                    let dst_tile = op.input_tile(config, i, dst);
                    for src in 0..pre_config.num_parts() {
                        let src_tile = pre_op.output_tile(pre_config, owner_idx, src);
                        let overlap = dst_tile.intersection(&src_tile).volume();
                        if overlap > 0 {
                            let src_task = self.pool.forward_task(pre_id, src);
                            let dst_task = self.pool.forward_task(op.id(), dst);
                            self.add_task_dependencies_with_xfer(src_task, dst_task, overlap);
                            if training {
                                // gradients flow the other way
                                let src_task = self.pool.backward_task(op.id(), dst);
                                let dst_task = self.pool.backward_task(pre_id, src);
                                self.add_task_dependencies_with_xfer(src_task, dst_task, overlap);
                            }
                        }
                    }
                }
            }
        }

        // pass C: parameter-server weight synchronization. Collectives are
        // priced after scheduling instead, see collective_sync_cost.
        if !cfg!(feature = "nccl") {
            // per-device final barriers capture the returning update traffic
            let mut finals = Vec::with_capacity(self.topology.total_num_gpus());
            for d in 0..self.topology.total_num_gpus() {
                let t = self.pool.new_barrier_task();
                self.pool.task_mut(t).device = Some(self.topology.compute_device(d));
                finals.push(t);
            }

            if model.config.overlap_backward_update && training {
                self.build_overlapped_updates(model, strategy, &finals);
            } else if training {
                self.build_bulk_synchronous_updates(model, strategy, &finals);
            }
        }

        // list-schedule with per-device serial occupancy
        let mut ready_queue = BinaryHeap::new();
        for idx in 0..self.pool.len() {
            let id = TaskId(idx as u32);
            let task = self.pool.task(id);
            if task.counter == 0 {
                ready_queue.push(ReadyTask { ready_time: task.ready_time, id });
            }
        }

        let mut dot = match trace {
            Some(out) => Some(DotWriter::new(out).expect("failed to write task graph")),
            None => None,
        };
        let mut device_end_time = vec![0.0f32; self.topology.num_devices()];
        let mut sim_time = 0.0f32;
        let mut scheduled = 0usize;

        while let Some(ReadyTask { id, .. }) = ready_queue.pop() {
            let task = self.pool.task(id);
            let device = task.device.expect("task was never placed on a device");
            let start = task.ready_time.max(device_end_time[device.0 as usize]);
            let end = start + task.run_time;
            device_end_time[device.0 as usize] = end;
            sim_time = sim_time.max(end);

            let task = self.pool.task_mut(id);
            task.start_time = start;
            task.end_time = end;

            if let Some(dot) = &mut dot {
                let task = self.pool.task(id);
                let label = match &task.op_name {
                    Some(name) => format!("{{ {} | {} | {{ {} | {} }} }}", name, task.kind, start, end),
                    None => format!("{{ {} | {{ {} | {} }} }}", task.kind, start, end),
                };
                dot.node(id.index(), &label).expect("failed to write task graph");
            }

            for k in 0..self.pool.task(id).next.len() {
                let next = self.pool.task(id).next[k];
                if let Some(dot) = &mut dot {
                    dot.edge(id.index(), next.index()).expect("failed to write task graph");
                }
                let task = self.pool.task_mut(next);
                task.ready_time = task.ready_time.max(end);
                task.counter -= 1;
                if task.counter == 0 {
                    ready_queue.push(ReadyTask { ready_time: task.ready_time, id: next });
                }
            }
            scheduled += 1;
        }

        if let Some(dot) = dot {
            dot.finish().expect("failed to write task graph");
        }
        assert_eq!(
            scheduled,
            self.pool.len(),
            "task graph left unscheduled tasks behind (cycle or dangling dependency)"
        );

        if cfg!(feature = "nccl") && training {
            sim_time += self.collective_sync_cost(model, strategy);
        }

        sim_time + self.memory_penalty(model, strategy, export)
    }

    /// Chain `src -> dst`, inserting the communication tasks the device
    /// placement implies: nothing for the same device, one hop over the
    /// intra-node link, or a store-and-forward gpu -> dram -> dram -> gpu
    /// chain across nodes. `volume` is in elements.
    fn add_task_dependencies_with_xfer(&mut self, src: TaskId, dst: TaskId, volume: u64) {
        let src_dev = self.pool.task(src).device.expect("source task was never placed");
        let dst_dev = self.pool.task(dst).device.expect("destination task was never placed");
        if src_dev == dst_dev {
            self.pool.add_edge(src, dst);
            return;
        }

        let bytes = (volume * ELEMENT_BYTES) as f32;
        let (src_dev, dst_dev) = (self.topology.device(src_dev), self.topology.device(dst_dev));
        if src_dev.node_id() == dst_dev.node_id() {
            let link = self.topology.inter_gpu_comm_device(src_dev.gpu_id(), dst_dev.gpu_id());
            let comm = self.pool.new_comm_task();
            let task = self.pool.task_mut(comm);
            task.device = Some(link);
            task.run_time = bytes / self.topology.device(link).bandwidth();
            self.pool.add_edge(src, comm);
            self.pool.add_edge(comm, dst);
        } else {
            let hops = [
                self.topology.gpu_to_dram_comm_device(src_dev.gpu_id()),
                self.topology.inter_node_comm_device(src_dev.node_id(), dst_dev.node_id()),
                self.topology.dram_to_gpu_comm_device(dst_dev.gpu_id()),
            ];
            let mut tail = src;
            for link in hops {
                let comm = self.pool.new_comm_task();
                let task = self.pool.task_mut(comm);
                task.device = Some(link);
                task.run_time = bytes / self.topology.device(link).bandwidth();
                self.pool.add_edge(tail, comm);
                tail = comm;
            }
            self.pool.add_edge(tail, dst);
        }
    }

    /// Weight updates racing the rest of backpropagation: gradients of the
    /// non-owning parts stream to one Update task per class, and the updated
    /// parameters stream back to each member's final barrier.
    fn build_overlapped_updates(&mut self, model: &Model, strategy: &Strategy, finals: &[TaskId]) {
        for op in model.layers().iter().rev() {
            let pc = config_of(strategy, op.as_ref());
            for j in 0..op.num_weights() {
                for class in weight_sync_classes(op.as_ref(), pc, j) {
                    let update = self.pool.new_update_task();
                    let device = self.topology.compute_device(pc.device_ids[class.first]);
                    // the update itself is free, only parameter motion costs.
                    // the owner's backward needs no edge: it shares the
                    // update's device and serial occupancy orders them.
                    self.pool.task_mut(update).device = Some(device);
                    for &next in &class.others {
                        let back = self.pool.backward_task(op.id(), next);
                        self.add_task_dependencies_with_xfer(back, update, class.tile.volume());
                        let gpu = self.device_gpu(back);
                        self.add_task_dependencies_with_xfer(update, finals[gpu], class.tile.volume());
                    }
                }
            }
        }
    }

    /// Bulk-synchronous parameter server: every backward task reports to its
    /// device barrier, updates run strictly after the barrier layer.
    fn build_bulk_synchronous_updates(&mut self, model: &Model, strategy: &Strategy, finals: &[TaskId]) {
        let mut barriers = Vec::with_capacity(self.topology.total_num_gpus());
        for d in 0..self.topology.total_num_gpus() {
            let t = self.pool.new_barrier_task();
            self.pool.task_mut(t).device = Some(self.topology.compute_device(d));
            barriers.push(t);
        }
        for op in model.layers() {
            let pc = config_of(strategy, op.as_ref());
            for j in 0..pc.num_parts() {
                let back = self.pool.backward_task(op.id(), j);
                let gpu = self.device_gpu(back);
                self.pool.add_edge(back, barriers[gpu]);
            }
        }
        for op in model.layers() {
            let pc = config_of(strategy, op.as_ref());
            for j in 0..op.num_weights() {
                for class in weight_sync_classes(op.as_ref(), pc, j) {
                    let update = self.pool.new_update_task();
                    let owner_gpu = pc.device_ids[class.first];
                    self.pool.task_mut(update).device = Some(self.topology.compute_device(owner_gpu));
                    self.pool.add_edge(barriers[owner_gpu], update);
                    for &next in &class.others {
                        let back = self.pool.backward_task(op.id(), next);
                        let gpu = self.device_gpu(back);
                        debug_assert_eq!(gpu, pc.device_ids[next]);
                        self.add_task_dependencies_with_xfer(barriers[gpu], update, class.tile.volume());
                        self.add_task_dependencies_with_xfer(update, finals[gpu], class.tile.volume());
                    }
                }
            }
        }
    }

    /// Blocking collective cost, added to the makespan after scheduling:
    /// per synchronization class, the slowest pairwise transfer between the
    /// owner and any member, accumulated sequentially across all weights.
    fn collective_sync_cost(&self, model: &Model, strategy: &Strategy) -> f32 {
        let mut total = 0.0f32;
        for op in model.layers() {
            let pc = config_of(strategy, op.as_ref());
            for j in 0..op.num_weights() {
                for class in weight_sync_classes(op.as_ref(), pc, j) {
                    let first = self.topology.device(self.topology.compute_device(pc.device_ids[class.first]));
                    let mut class_time = 0.0f32;
                    for &next in &class.others {
                        let next_dev = self.topology.device(self.topology.compute_device(pc.device_ids[next]));
                        let bandwidth = if first.node_id() == next_dev.node_id() {
                            let link = self.topology.inter_gpu_comm_device(first.gpu_id(), next_dev.gpu_id());
                            self.topology.device(link).bandwidth()
                        } else {
                            let link = self.topology.inter_node_comm_device(first.node_id(), next_dev.node_id());
                            self.topology.device(link).bandwidth()
                        };
                        class_time = class_time.max((class.tile.volume() * ELEMENT_BYTES) as f32 / bandwidth);
                    }
                    total += class_time;
                }
            }
        }
        total
    }

    /// Sum per-part memory over the strategy and charge for every byte over
    /// a device's capacity.
    fn memory_penalty(&mut self, model: &Model, strategy: &Strategy, export: bool) -> f32 {
        let mut usage = vec![0u64; self.topology.total_num_gpus()];
        for op in model.layers() {
            let config = config_of(strategy, op.as_ref());
            let cost = self.measure_operator_cost(op.as_ref(), config);
            for j in 0..config.num_parts() {
                usage[config.device_ids[j]] += cost.memory_requirement;
            }
        }
        let mut penalty = 0.0f32;
        for (gpu, &used) in usage.iter().enumerate() {
            if export {
                debug!("gpu {} memory usage before penalty: {} bytes", gpu, used);
            }
            let capacity = self.topology.device(self.topology.compute_device(gpu)).capacity();
            if used > capacity {
                penalty += (used - capacity) as f32 * MEMORY_PENALTY_PER_BYTE;
            }
        }
        penalty
    }

    fn device_gpu(&self, task: TaskId) -> usize {
        let device = self.pool.task(task).device.expect("task was never placed on a device");
        self.topology.device(device).gpu_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{DeviceType, OpId, OpType};

    struct WeightedOp {
        tiles: Vec<Domain>,
    }

    impl Op for WeightedOp {
        fn id(&self) -> OpId {
            OpId(1)
        }
        fn name(&self) -> &str {
            "weighted"
        }
        fn op_type(&self) -> OpType {
            OpType::Linear
        }
        fn num_inputs(&self) -> usize {
            0
        }
        fn num_weights(&self) -> usize {
            1
        }
        fn input_source(&self, _idx: usize) -> Option<(OpId, usize)> {
            None
        }
        fn input_tile(&self, _: &ParallelConfig, _: usize, _: usize) -> Domain {
            Domain::new(&[])
        }
        fn output_tile(&self, _: &ParallelConfig, _: usize, _: usize) -> Domain {
            Domain::new(&[])
        }
        fn weight_tile(&self, _: &ParallelConfig, _: usize, part: usize) -> Domain {
            self.tiles[part]
        }
        fn measure_cost(&self, _: &mut Workspace, _: &ParallelConfig) -> Option<CostMetrics> {
            Some(CostMetrics::default())
        }
    }

    fn four_part_config() -> ParallelConfig {
        ParallelConfig {
            device_type: DeviceType::Gpu,
            n_dims: 1,
            dim: [4, 1, 1, 1],
            device_ids: vec![0, 1, 2, 3],
        }
    }

    #[test]
    fn replicated_weight_forms_one_class() {
        let tile = Domain::new(&[(0, 1023)]);
        let op = WeightedOp { tiles: vec![tile; 4] };
        let classes = weight_sync_classes(&op, &four_part_config(), 0);
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].first, 0);
        assert_eq!(classes[0].others, vec![1, 2, 3]);
        assert_eq!(classes[0].tile.volume(), 1024);
    }

    #[test]
    fn sharded_weight_forms_singleton_classes() {
        let tiles = (0..4i64).map(|i| Domain::new(&[(256 * i, 256 * i + 255)])).collect();
        let op = WeightedOp { tiles };
        let classes = weight_sync_classes(&op, &four_part_config(), 0);
        assert_eq!(classes.len(), 4);
        assert!(classes.iter().all(|c| c.others.is_empty()));
    }

    #[test]
    fn grouping_follows_tile_equality() {
        let a = Domain::new(&[(0, 511)]);
        let b = Domain::new(&[(512, 1023)]);
        let op = WeightedOp { tiles: vec![a, b, a, b] };
        let classes = weight_sync_classes(&op, &four_part_config(), 0);
        assert_eq!(classes.len(), 2);
        assert_eq!((classes[0].first, classes[0].others.as_slice()), (0, &[2][..]));
        assert_eq!((classes[1].first, classes[1].others.as_slice()), (1, &[3][..]));
    }

    #[test]
    #[should_panic(expected = "partially shared")]
    fn partially_overlapping_weight_tiles_are_fatal() {
        let op = WeightedOp { tiles: vec![Domain::new(&[(0, 599)]), Domain::new(&[(400, 1023)])] };
        let pc = ParallelConfig {
            device_type: DeviceType::Gpu,
            n_dims: 1,
            dim: [2, 1, 1, 1],
            device_ids: vec![0, 1],
        };
        weight_sync_classes(&op, &pc, 0);
    }
}
