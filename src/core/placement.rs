//! Task-arrival placement path.
//!
//! Placement walks the utilisation-ascending machine list through five
//! passes, each terminating the algorithm on success:
//!
//! * Pass A — existing VM of the required guest OS on an active machine.
//! * Pass B — same, additionally admitting machines that are currently
//!   migration destinations.
//! * Pass C — create a VM on a ready machine.
//! * Pass D — wake a sleeping machine and defer the attach until the
//!   state-change callback.
//! * Pass E — last resort: first live VM regardless of fit, the SLA risk is
//!   accepted and logged.
//!
//! Ties break on lowest max(cpu, memory) utilisation, then lowest machine
//! id, then earliest-created VM.

use crate::core::accountant::{task_mips_demand, LoadAccountant};
use crate::core::api::CloudApi;
use crate::core::engine::EngineContext;
use crate::core::inventory::{Inventory, MachineRecord, Tier};
use crate::core::types::{MachineId, Priority, SState, TaskId, TaskInfo, Time, VmId};
use crate::{log_debug, log_error, log_warn};

/// Feasibility of one machine for one task. Anything but `Success` means
/// "skip this candidate", never an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlacementVerdict {
    Success,
    ArchMismatch,
    NotActive,
    MigrationTarget,
    NoGpu,
    NotEnoughMips,
    NotEnoughMemory,
}

/// A placement decision deferred until its machine finishes waking: the VM
/// exists but is attached, loaded and accounted only in the
/// state-change-complete callback.
#[derive(Clone, Debug)]
pub struct PendingAttachment {
    pub vm: VmId,
    pub machine: MachineId,
    pub task: TaskId,
    pub priority: Priority,
    pub demand: f64,
    pub memory: u64,
    pub created: Time,
}

/// What the placement run did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlacementOutcome {
    /// Task assigned to a VM, load committed.
    Assigned { vm: VmId, machine: MachineId },
    /// Machine woken, attachment pending.
    Deferred { machine: MachineId },
    /// Placed ignoring fit; the SLA violation is accepted.
    LastResort { vm: VmId, machine: MachineId },
    /// No VM exists anywhere; the task could not be placed.
    Failed,
}

pub struct PlacementEngine;

impl PlacementEngine {
    pub fn new() -> Self {
        Self {}
    }

    /// Runs the five placement passes for a newly arrived task.
    pub fn place(
        &self,
        ctx: &EngineContext,
        task: &TaskInfo,
        inventory: &mut Inventory,
        accountant: &mut LoadAccountant,
        pending: &mut Vec<PendingAttachment>,
        cloud: &mut dyn CloudApi,
    ) -> PlacementOutcome {
        let priority = Priority::from(task.sla);
        let demand = task_mips_demand(task);
        let order = inventory.sorted_by_utilisation();

        // Passes A and B differ only in the migration-destination gate.
        for admit_migration_targets in [false, true] {
            for &machine_id in &order {
                let verdict = self.machine_verdict(inventory.machine(machine_id), task, demand, admit_migration_targets);
                if verdict != PlacementVerdict::Success {
                    continue;
                }
                let Some(vm) = inventory.find_vm(machine_id, task.required_kind) else {
                    continue;
                };
                match cloud.add_task(vm, task.id, priority) {
                    Ok(()) => {
                        inventory.vm_mut(vm).tasks.insert(task.id);
                        accountant.commit(inventory, task.id, machine_id, demand, task.memory, priority);
                        log_debug!(
                            ctx,
                            "task {} placed on vm {} / machine {} at {:?}",
                            task.id,
                            vm,
                            machine_id,
                            priority
                        );
                        return PlacementOutcome::Assigned { vm, machine: machine_id };
                    }
                    Err(err) => {
                        log_error!(ctx, "task {} rejected by vm {}: {}", task.id, vm, err);
                        continue;
                    }
                }
            }
        }

        // Pass C: create a VM of the required kind on the first ready
        // machine. Only CPU, GPU and memory gate here; a MIPS overshoot is
        // picked up later by the overload sweep.
        for &machine_id in &order {
            {
                let machine = inventory.machine(machine_id);
                if !machine.is_active()
                    || machine.arch != task.required_arch
                    || (task.gpu_capable && !machine.has_gpu)
                    || machine.free_memory() < task.memory
                {
                    continue;
                }
            }
            let vm = cloud.create_vm(task.required_kind, task.required_arch);
            inventory.add_vm(vm, task.required_kind, task.required_arch);
            if let Err(err) = cloud.attach_vm(vm, machine_id) {
                log_error!(ctx, "cannot attach vm {} to machine {}: {}", vm, machine_id, err);
                inventory.remove_vm(vm);
                continue;
            }
            inventory.attach_vm(vm, machine_id);
            match cloud.add_task(vm, task.id, priority) {
                Ok(()) => {
                    inventory.vm_mut(vm).tasks.insert(task.id);
                    accountant.commit(inventory, task.id, machine_id, demand, task.memory, priority);
                    log_debug!(
                        ctx,
                        "task {} placed on fresh vm {} / machine {}",
                        task.id,
                        vm,
                        machine_id
                    );
                    return PlacementOutcome::Assigned { vm, machine: machine_id };
                }
                Err(err) => {
                    log_error!(ctx, "task {} rejected by fresh vm {}: {}", task.id, vm, err);
                    continue;
                }
            }
        }

        // Pass D: wake a compatible sleeping machine and defer the attach.
        for &machine_id in &order {
            let waking;
            {
                let machine = inventory.machine(machine_id);
                if machine.arch != task.required_arch
                    || (task.gpu_capable && !machine.has_gpu)
                    || machine.free_memory() < task.memory
                    || !machine.s_state.is_sleep()
                {
                    continue;
                }
                waking = machine.target_state == Some(SState::S0);
                // A machine already transitioning somewhere other than S0
                // cannot be recalled; skip it.
                if machine.target_state.is_some() && !waking {
                    continue;
                }
            }
            if !waking {
                cloud.set_machine_state(machine_id, SState::S0);
                inventory.set_target_state(machine_id, SState::S0);
            }
            inventory.machine_mut(machine_id).tier = Tier::Running;
            let vm = cloud.create_vm(task.required_kind, task.required_arch);
            inventory.add_vm(vm, task.required_kind, task.required_arch);
            pending.push(PendingAttachment {
                vm,
                machine: machine_id,
                task: task.id,
                priority,
                demand,
                memory: task.memory,
                created: ctx.now(),
            });
            log_debug!(
                ctx,
                "task {} deferred until machine {} wakes (vm {})",
                task.id,
                machine_id,
                vm
            );
            return PlacementOutcome::Deferred { machine: machine_id };
        }

        // Pass E: last resort. Prefer a compatible VM, otherwise the first
        // live VM; either way the fit checks are skipped.
        let candidate = inventory
            .vms()
            .filter(|vm| !vm.migrating && vm.kind == task.required_kind && vm.arch == task.required_arch)
            .filter_map(|vm| vm.host.map(|host| (vm.id, host)))
            .min_by_key(|(id, _)| *id)
            .or_else(|| {
                inventory
                    .vms()
                    .filter(|vm| !vm.migrating)
                    .filter_map(|vm| vm.host.map(|host| (vm.id, host)))
                    .min_by_key(|(id, _)| *id)
            });
        if let Some((vm, machine_id)) = candidate {
            match cloud.add_task(vm, task.id, priority) {
                Ok(()) => {
                    inventory.vm_mut(vm).tasks.insert(task.id);
                    accountant.commit(inventory, task.id, machine_id, demand, task.memory, priority);
                    log_warn!(
                        ctx,
                        "task {} placed on vm {} / machine {} ignoring fit, accepting sla risk",
                        task.id,
                        vm,
                        machine_id
                    );
                    return PlacementOutcome::LastResort { vm, machine: machine_id };
                }
                Err(err) => {
                    log_error!(ctx, "last resort vm {} rejected task {}: {}", vm, task.id, err);
                }
            }
        }

        log_warn!(ctx, "no placement found for task {}", task.id);
        PlacementOutcome::Failed
    }

    /// Machine-level gates shared by passes A and B.
    fn machine_verdict(
        &self,
        machine: &MachineRecord,
        task: &TaskInfo,
        demand: f64,
        admit_migration_targets: bool,
    ) -> PlacementVerdict {
        if machine.arch != task.required_arch {
            return PlacementVerdict::ArchMismatch;
        }
        if !machine.is_active() {
            return PlacementVerdict::NotActive;
        }
        if !admit_migration_targets && machine.is_migration_target() {
            return PlacementVerdict::MigrationTarget;
        }
        if task.gpu_capable && !machine.has_gpu {
            return PlacementVerdict::NoGpu;
        }
        if machine.committed_mips + demand > machine.mips_capacity() {
            return PlacementVerdict::NotEnoughMips;
        }
        if machine.free_memory() < task.memory {
            return PlacementVerdict::NotEnoughMemory;
        }
        PlacementVerdict::Success
    }
}

impl Default for PlacementEngine {
    fn default() -> Self {
        Self::new()
    }
}
