//! Down-call boundary between the scheduler and the simulator.

use crate::core::error::SchedulerError;
use crate::core::types::{
    CpuArch, GuestOs, MachineId, MachineInfo, PState, Priority, SState, SlaClass, TaskId, TaskInfo, VmId, VmInfo,
};

/// Operations the scheduler may invoke on the simulator.
///
/// Power transitions and VM migrations are asynchronous: the call returns
/// immediately and the effect is acknowledged later through the
/// corresponding up-call (`StateChangeComplete`, `MigrationDone`). Everything
/// issued is irrevocable, so callers must gate their requests instead of
/// relying on cancellation.
///
/// Synchronous calls that can fail (attach to a mismatched or sleeping
/// machine, adding a task to an incompatible VM, shutting down a busy VM)
/// return a [`SchedulerError`]; the engine treats every such error as local
/// to the current up-call.
pub trait CloudApi {
    /// Number of machines in the cluster.
    fn machine_count(&self) -> u32;

    /// Snapshot of the current machine state.
    fn machine_info(&self, machine: MachineId) -> MachineInfo;

    /// Energy consumed so far by one machine, in simulator units.
    fn machine_energy(&self, machine: MachineId) -> u64;

    /// Energy consumed so far by the whole cluster, in kW·h.
    fn cluster_energy(&self) -> f64;

    /// Requests an asynchronous S-state transition.
    fn set_machine_state(&mut self, machine: MachineId, state: SState);

    /// Sets the P-state of all cores of the machine. The core id is part of
    /// the boundary contract but is ignored by the simulator.
    fn set_core_performance(&mut self, machine: MachineId, core: u32, p_state: PState);

    /// Creates a new, unattached VM and returns its id.
    fn create_vm(&mut self, kind: GuestOs, arch: CpuArch) -> VmId;

    /// Attaches a VM to a machine. Fails on CPU mismatch or when the machine
    /// is not in the active S-state.
    fn attach_vm(&mut self, vm: VmId, machine: MachineId) -> Result<(), SchedulerError>;

    /// Adds a task to a VM at the given priority. Fails when the task is
    /// incompatible with the VM's guest OS or CPU architecture.
    fn add_task(&mut self, vm: VmId, task: TaskId, priority: Priority) -> Result<(), SchedulerError>;

    /// Removes a task from a VM.
    fn remove_task(&mut self, vm: VmId, task: TaskId) -> Result<(), SchedulerError>;

    /// Starts an asynchronous migration of a VM to the destination machine.
    fn migrate_vm(&mut self, vm: VmId, destination: MachineId);

    /// Shuts down a VM. Fails while the VM still hosts active tasks.
    fn shutdown_vm(&mut self, vm: VmId) -> Result<(), SchedulerError>;

    /// Snapshot of the current VM state.
    fn vm_info(&self, vm: VmId) -> VmInfo;

    /// Read-only task attributes.
    fn task_info(&self, task: TaskId) -> TaskInfo;

    /// Raises or lowers the priority of an already placed task.
    fn set_task_priority(&mut self, task: TaskId, priority: Priority);

    /// Fraction of tasks of the given SLA class that completed on time,
    /// as a percentage.
    fn sla_report(&self, sla: SlaClass) -> f64;
}
