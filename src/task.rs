// preallocated task records for one simulation, wired into a DAG by index

use crate::machine::DeviceId;
use crate::ops::{Op, OpId};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u32);

impl TaskId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Forward,
    Backward,
    Comm,
    Update,
    Barrier,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Forward => "Forward",
            TaskKind::Backward => "Backward",
            TaskKind::Comm => "Comm",
            TaskKind::Update => "Update",
            TaskKind::Barrier => "Barrier",
        };
        write!(f, "{}", name)
    }
}

/// One unit of scheduled work. Becomes schedulable exactly when `counter`
/// drops to zero; the scheduler then records its `[start_time, end_time)`
/// interval on the owning device.
#[derive(Debug, Clone)]
pub struct SimTask {
    pub kind: TaskKind,
    pub device: Option<DeviceId>,
    pub run_time: f32,
    pub ready_time: f32,
    /// unsatisfied in-edges
    pub counter: u32,
    pub next: Vec<TaskId>,
    pub op_name: Option<String>,
    pub start_time: f32,
    pub end_time: f32,
}

impl SimTask {
    fn blank() -> SimTask {
        SimTask {
            kind: TaskKind::Barrier,
            device: None,
            run_time: 0.0,
            ready_time: 0.0,
            counter: 0,
            next: Vec::new(),
            op_name: None,
            start_time: 0.0,
            end_time: 0.0,
        }
    }
}

/// Arena of task slots reused across simulations. `reset` only rewinds the
/// cursor and clears the fingerprint maps; slots are reinitialized when
/// allocated again.
pub(crate) struct TaskPool {
    tasks: Vec<SimTask>,
    cursor: usize,
    forward: BTreeMap<(OpId, usize), TaskId>,
    backward: BTreeMap<(OpId, usize), TaskId>,
}

impl TaskPool {
    pub fn new(max_num_tasks: usize) -> TaskPool {
        TaskPool {
            tasks: vec![SimTask::blank(); max_num_tasks],
            cursor: 0,
            forward: BTreeMap::new(),
            backward: BTreeMap::new(),
        }
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
        self.forward.clear();
        self.backward.clear();
    }

    pub fn len(&self) -> usize {
        self.cursor
    }

    pub fn max_num_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Task records of the current simulation, in allocation order.
    pub fn live(&self) -> &[SimTask] {
        &self.tasks[..self.cursor]
    }

    pub fn task(&self, id: TaskId) -> &SimTask {
        &self.tasks[id.index()]
    }

    pub fn task_mut(&mut self, id: TaskId) -> &mut SimTask {
        &mut self.tasks[id.index()]
    }

    fn new_task(&mut self, kind: TaskKind) -> TaskId {
        if self.cursor >= self.tasks.len() {
            panic!(
                "task pool exhausted: simulation needs more than {} tasks, widen max_num_tasks",
                self.tasks.len()
            );
        }
        let id = TaskId(self.cursor as u32);
        let task = &mut self.tasks[self.cursor];
        self.cursor += 1;
        task.kind = kind;
        task.device = None;
        task.run_time = 0.0;
        task.ready_time = 0.0;
        task.counter = 0;
        task.next.clear();
        task.op_name = None;
        task.start_time = 0.0;
        task.end_time = 0.0;
        id
    }

    pub fn new_comm_task(&mut self) -> TaskId {
        self.new_task(TaskKind::Comm)
    }

    pub fn new_update_task(&mut self) -> TaskId {
        self.new_task(TaskKind::Update)
    }

    pub fn new_barrier_task(&mut self) -> TaskId {
        self.new_task(TaskKind::Barrier)
    }

    pub fn new_forward_task(&mut self, op: &dyn Op, part: usize) -> TaskId {
        let id = self.new_task(TaskKind::Forward);
        self.tasks[id.index()].op_name = Some(op.name().to_owned());
        self.forward.insert((op.id(), part), id);
        id
    }

    pub fn new_backward_task(&mut self, op: &dyn Op, part: usize) -> TaskId {
        let id = self.new_task(TaskKind::Backward);
        self.tasks[id.index()].op_name = Some(op.name().to_owned());
        self.backward.insert((op.id(), part), id);
        id
    }

    pub fn forward_task(&self, op: OpId, part: usize) -> TaskId {
        *self
            .forward
            .get(&(op, part))
            .unwrap_or_else(|| panic!("no forward task registered for {:?} part {}", op, part))
    }

    pub fn backward_task(&self, op: OpId, part: usize) -> TaskId {
        *self
            .backward
            .get(&(op, part))
            .unwrap_or_else(|| panic!("no backward task registered for {:?} part {}", op, part))
    }

    /// Wire `src -> dst` and account the in-edge on `dst`.
    pub fn add_edge(&mut self, src: TaskId, dst: TaskId) {
        self.tasks[src.index()].next.push(dst);
        self.tasks[dst.index()].counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::Workspace;
    use crate::ops::{CostMetrics, Domain, OpType, ParallelConfig};

    struct StubOp(u64);

    impl Op for StubOp {
        fn id(&self) -> OpId {
            OpId(self.0)
        }
        fn name(&self) -> &str {
            "stub"
        }
        fn op_type(&self) -> OpType {
            OpType::Other
        }
        fn num_inputs(&self) -> usize {
            0
        }
        fn num_weights(&self) -> usize {
            0
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
        fn weight_tile(&self, _: &ParallelConfig, _: usize, _: usize) -> Domain {
            Domain::new(&[])
        }
        fn measure_cost(&self, _: &mut Workspace, _: &ParallelConfig) -> Option<CostMetrics> {
            Some(CostMetrics::default())
        }
    }

    #[test]
    fn fingerprints_survive_until_reset() {
        let mut pool = TaskPool::new(8);
        let op = StubOp(1);
        let fwd = pool.new_forward_task(&op, 0);
        let bwd = pool.new_backward_task(&op, 0);
        assert_eq!(pool.forward_task(OpId(1), 0), fwd);
        assert_eq!(pool.backward_task(OpId(1), 0), bwd);
        assert_eq!(pool.len(), 2);

        pool.reset();
        assert_eq!(pool.len(), 0);
        let fwd2 = pool.new_forward_task(&op, 0);
        assert_eq!(fwd2, fwd); // same slot, fresh record
    }

    #[test]
    #[should_panic(expected = "no forward task registered")]
    fn reset_clears_fingerprints() {
        let mut pool = TaskPool::new(8);
        let op = StubOp(1);
        pool.new_forward_task(&op, 0);
        pool.reset();
        pool.forward_task(OpId(1), 0);
    }

    #[test]
    fn slots_are_reinitialized_on_allocation() {
        let mut pool = TaskPool::new(4);
        let a = pool.new_comm_task();
        let b = pool.new_comm_task();
        pool.task_mut(a).run_time = 5.0;
        pool.task_mut(a).ready_time = 1.0;
        pool.add_edge(a, b);
        assert_eq!(pool.task(b).counter, 1);

        pool.reset();
        let a2 = pool.new_barrier_task();
        assert_eq!(a2, a);
        let t = pool.task(a2);
        assert_eq!(t.kind, TaskKind::Barrier);
        assert_eq!(t.run_time, 0.0);
        assert_eq!(t.ready_time, 0.0);
        assert_eq!(t.counter, 0);
        assert!(t.next.is_empty());
    }

    #[test]
    #[should_panic(expected = "task pool exhausted")]
    fn pool_overflow_is_fatal() {
        let mut pool = TaskPool::new(2);
        pool.new_comm_task();
        pool.new_comm_task();
        pool.new_comm_task();
    }
}
