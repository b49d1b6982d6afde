//! Error taxonomy of the policy engine.
//!
//! Every error is local to a single up-call: the engine logs it and carries
//! on, it never unwinds into the simulator and never aborts the simulation.

use thiserror::Error;

use crate::core::types::{CpuArch, MachineId, TaskId, VmId};

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// VM attach to a machine of a different CPU architecture. A fatal
    /// invariant violation if produced by our own placement: logged, and the
    /// accountant is left untouched.
    #[error("vm {vm} ({vm_arch}) cannot attach to machine {machine} ({machine_arch})")]
    ArchMismatch {
        vm: VmId,
        vm_arch: CpuArch,
        machine: MachineId,
        machine_arch: CpuArch,
    },

    /// Attach or task-add against a machine that is not in the active
    /// S-state.
    #[error("machine {machine} is not active")]
    MachineNotActive { machine: MachineId },

    /// Task added to a VM of the wrong guest OS or CPU architecture.
    #[error("task {task} is incompatible with vm {vm}")]
    IncompatibleTask { task: TaskId, vm: VmId },

    /// Shutdown requested for a VM that still hosts active tasks.
    #[error("vm {vm} has active tasks")]
    VmBusy { vm: VmId },

    /// Operation against a VM with a migration in flight.
    #[error("vm {vm} is migrating")]
    VmMigrating { vm: VmId },

    #[error("unknown vm {vm}")]
    UnknownVm { vm: VmId },
}
