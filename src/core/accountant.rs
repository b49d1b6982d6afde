//! Committed-load bookkeeping.
//!
//! The accountant is the single source of truth for "is this machine fit for
//! more work". The (task -> machine) map is authoritative: every commit has
//! a matching release keyed by it, so both mutators are idempotent and the
//! accountant never drives committed values negative.

use std::collections::{HashMap, VecDeque};

use crate::core::inventory::{Inventory, MachineRecord, VmRecord};
use crate::core::types::{MachineId, Priority, TaskId, TaskInfo, Time, VmId};

/// MIPS capacity of a machine at its current P-state, across all cores.
pub fn machine_mips_capacity(machine: &MachineRecord) -> f64 {
    machine.mips_capacity()
}

/// Committed MIPS over capacity, clamped to [0, 1].
pub fn machine_cpu_utilisation(machine: &MachineRecord) -> f64 {
    machine.cpu_utilisation()
}

/// Committed memory over total memory.
pub fn machine_memory_utilisation(machine: &MachineRecord) -> f64 {
    machine.memory_utilisation()
}

/// MIPS demand of a task: instruction count over its time budget.
///
/// With time in microseconds, instructions per microsecond is numerically
/// millions of instructions per second. A target completion at or before the
/// arrival is guarded by the 1 microsecond floor, never producing infinity.
pub fn task_mips_demand(task: &TaskInfo) -> f64 {
    let budget = task.target_completion.saturating_sub(task.arrival).max(1);
    task.total_instructions as f64 / budget as f64
}

/// One committed task: where it runs and what it cost to commit.
#[derive(Clone, Debug)]
pub struct CommittedTask {
    pub machine: MachineId,
    pub demand: f64,
    pub memory: u64,
    pub priority: Priority,
}

const RESPONSE_WINDOW: usize = 16;

/// Sliding window of response-time ratios for one VM. A ratio is the actual
/// completion time over the SLA budget, so 1.0 means the task finished
/// exactly on target.
#[derive(Clone, Debug, Default)]
pub struct ResponseHistory {
    samples: VecDeque<f64>,
}

impl ResponseHistory {
    pub fn push(&mut self, ratio: f64) {
        if self.samples.len() == RESPONSE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(ratio);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// True when the recent half of the window is clearly slower than the
    /// older half. Used by the predictive P-state adjustment.
    pub fn is_degrading(&self) -> bool {
        if self.samples.len() < 4 {
            return false;
        }
        let mid = self.samples.len() / 2;
        let older = self.samples.iter().take(mid).sum::<f64>() / mid as f64;
        let recent = self.samples.iter().skip(mid).sum::<f64>() / (self.samples.len() - mid) as f64;
        recent > older * 1.25
    }
}

/// Tracks every running task's placement and load contribution, plus the
/// per-VM response-time history.
pub struct LoadAccountant {
    tasks: HashMap<TaskId, CommittedTask>,
    vm_history: HashMap<VmId, ResponseHistory>,
}

impl LoadAccountant {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            vm_history: HashMap::new(),
        }
    }

    /// Adds the task's demand to the machine. A task that is already
    /// committed is left untouched.
    ///
    /// Committed memory may transiently exceed the machine total during a
    /// memory-warning episode; the overshoot is resolved by migration.
    pub fn commit(
        &mut self,
        inventory: &mut Inventory,
        task: TaskId,
        machine: MachineId,
        demand: f64,
        memory: u64,
        priority: Priority,
    ) {
        if self.tasks.contains_key(&task) {
            return;
        }
        let record = inventory.machine_mut(machine);
        record.committed_mips += demand;
        record.committed_memory += memory;
        self.tasks.insert(
            task,
            CommittedTask {
                machine,
                demand,
                memory,
                priority,
            },
        );
    }

    /// Removes the task's demand from its machine, clamping at zero, and
    /// drops the (task -> machine) entry. Releasing an unknown task is a
    /// no-op.
    pub fn release(&mut self, inventory: &mut Inventory, task: TaskId) -> Option<CommittedTask> {
        let entry = self.tasks.remove(&task)?;
        let record = inventory.machine_mut(entry.machine);
        record.committed_mips = (record.committed_mips - entry.demand).max(0.);
        record.committed_memory = record.committed_memory.saturating_sub(entry.memory);
        Some(entry)
    }

    /// Atomically transfers a committed task to another machine, preserving
    /// its demand, memory and priority. Used when a migration starts.
    pub fn relocate(&mut self, inventory: &mut Inventory, task: TaskId, destination: MachineId) {
        if let Some(entry) = self.release(inventory, task) {
            self.commit(inventory, task, destination, entry.demand, entry.memory, entry.priority);
        }
    }

    /// Updates the recorded priority of a committed task (SLA escalation).
    pub fn set_priority(&mut self, task: TaskId, priority: Priority) {
        if let Some(entry) = self.tasks.get_mut(&task) {
            entry.priority = priority;
        }
    }

    pub fn host_of(&self, task: TaskId) -> Option<MachineId> {
        self.tasks.get(&task).map(|entry| entry.machine)
    }

    pub fn entry(&self, task: TaskId) -> Option<&CommittedTask> {
        self.tasks.get(&task)
    }

    /// Number of tasks currently committed anywhere in the cluster.
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Tasks currently mapped to the machine.
    pub fn tasks_on(&self, machine: MachineId) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|(_, entry)| entry.machine == machine)
            .map(|(task, _)| *task)
            .collect()
    }

    pub fn machine_task_count(&self, machine: MachineId) -> usize {
        self.tasks.values().filter(|entry| entry.machine == machine).count()
    }

    /// True when the machine hosts at least one task at the given priority.
    pub fn machine_hosts_priority(&self, machine: MachineId, priority: Priority) -> bool {
        self.tasks
            .values()
            .any(|entry| entry.machine == machine && entry.priority == priority)
    }

    /// Folds a finished task into its VM's response-time history.
    pub fn record_completion(&mut self, vm: VmId, task: &TaskInfo, completed_at: Time) {
        let budget = task.target_completion.saturating_sub(task.arrival).max(1);
        let took = completed_at.saturating_sub(task.arrival);
        self.vm_history.entry(vm).or_default().push(took as f64 / budget as f64);
    }

    pub fn vm_response(&self, vm: VmId) -> Option<&ResponseHistory> {
        self.vm_history.get(&vm)
    }

    /// Aggregate MIPS demand and memory of all tasks on one VM.
    pub fn vm_committed(&self, vm: &VmRecord) -> (f64, u64) {
        let mut demand = 0.;
        let mut memory = 0;
        for task in &vm.tasks {
            if let Some(entry) = self.tasks.get(task) {
                demand += entry.demand;
                memory += entry.memory;
            }
        }
        (demand, memory)
    }
}

impl Default for LoadAccountant {
    fn default() -> Self {
        Self::new()
    }
}
