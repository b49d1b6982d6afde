//! VM migration coordination.
//!
//! Migrations start from three triggers: the periodic overload sweep, an SLA
//! warning for a placed task, and a memory warning for an overcommitted
//! machine. A migration atomically transfers the VM's committed load and all
//! of its (task -> machine) entries to the destination when it starts; the
//! inventory host binding moves when the simulator acknowledges completion.
//!
//! At most one migration per VM is in flight, enforced by the per-VM
//! migrating flag. A migrating VM is invisible to placement until the
//! completion callback clears the flag.

use std::collections::HashMap;

use crate::core::accountant::LoadAccountant;
use crate::core::api::CloudApi;
use crate::core::engine::EngineContext;
use crate::core::inventory::Inventory;
use crate::core::types::{MachineId, TaskId, VmId};
use crate::{log_debug, log_info, log_warn};

/// One in-flight migration.
#[derive(Clone, Debug)]
pub struct MigrationRecord {
    pub vm: VmId,
    pub source: MachineId,
    pub destination: MachineId,
    /// Aggregate MIPS demand moved with the VM.
    pub demand: f64,
    /// Aggregate task memory moved with the VM.
    pub memory: u64,
}

pub struct MigrationCoordinator {
    overload_threshold: f64,
    headroom: f64,
    in_flight: HashMap<VmId, MigrationRecord>,
}

impl MigrationCoordinator {
    pub fn new(overload_threshold: f64, headroom: f64) -> Self {
        Self {
            overload_threshold,
            headroom,
            in_flight: HashMap::new(),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn record(&self, vm: VmId) -> Option<&MigrationRecord> {
        self.in_flight.get(&vm)
    }

    /// Periodic overload detection: relieve every machine above the
    /// overload threshold by migrating one VM away.
    pub fn sweep(
        &mut self,
        ctx: &EngineContext,
        inventory: &mut Inventory,
        accountant: &mut LoadAccountant,
        cloud: &mut dyn CloudApi,
    ) {
        let overloaded: Vec<MachineId> = inventory
            .machines()
            .filter(|machine| machine.is_active() && machine.cpu_utilisation() > self.overload_threshold)
            .map(|machine| machine.id)
            .collect();
        for machine in overloaded {
            self.relieve(ctx, machine, inventory, accountant, cloud);
        }
    }

    /// SLA-violation reaction: treat the task's machine as overloaded.
    pub fn react_sla(
        &mut self,
        ctx: &EngineContext,
        task: TaskId,
        inventory: &mut Inventory,
        accountant: &mut LoadAccountant,
        cloud: &mut dyn CloudApi,
    ) -> bool {
        let Some(machine) = accountant.host_of(task) else {
            log_warn!(ctx, "sla warning for task {} with no recorded machine", task);
            return false;
        };
        self.relieve(ctx, machine, inventory, accountant, cloud)
    }

    /// Memory-warning reaction: move the largest-memory VM to any
    /// compatible destination with room for it.
    pub fn react_memory(
        &mut self,
        ctx: &EngineContext,
        machine: MachineId,
        inventory: &mut Inventory,
        accountant: &mut LoadAccountant,
        cloud: &mut dyn CloudApi,
    ) -> bool {
        let Some(source) = inventory.get_machine(machine) else {
            log_warn!(ctx, "memory warning for unknown machine {}", machine);
            return false;
        };
        let mut candidates: Vec<(u64, f64, VmId)> = Vec::new();
        for vm_id in &source.vms {
            let vm = inventory.vm(*vm_id);
            if vm.migrating {
                continue;
            }
            let (demand, memory) = accountant.vm_committed(vm);
            if memory > 0 {
                candidates.push((memory, demand, *vm_id));
            }
        }
        // Largest memory footprint first.
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.2.cmp(&b.2)));

        for (memory, demand, vm_id) in candidates {
            let needs_gpu = self.vm_needs_gpu(inventory, vm_id, cloud);
            let destination = self.pick_destination(inventory, machine, vm_id, memory, needs_gpu, None);
            if let Some(destination) = destination {
                self.start(ctx, vm_id, machine, destination, demand, memory, inventory, accountant, cloud);
                return true;
            }
        }
        log_debug!(ctx, "no destination relieves memory pressure on machine {}", machine);
        false
    }

    /// Picks one VM off the source machine and migrates it to the
    /// lowest-utilisation compatible destination at least `headroom` below
    /// the source. Returns false when nothing movable or no destination
    /// qualifies.
    fn relieve(
        &mut self,
        ctx: &EngineContext,
        source: MachineId,
        inventory: &mut Inventory,
        accountant: &mut LoadAccountant,
        cloud: &mut dyn CloudApi,
    ) -> bool {
        let Some(record) = inventory.get_machine(source) else {
            return false;
        };
        let source_util = record.cpu_utilisation();
        let mut candidates: Vec<(f64, u64, VmId)> = Vec::new();
        for vm_id in &record.vms {
            let vm = inventory.vm(*vm_id);
            if vm.migrating {
                continue;
            }
            let (demand, memory) = accountant.vm_committed(vm);
            // Only a VM with committed demand lowers the source utilisation.
            if demand > 0. {
                candidates.push((demand, memory, *vm_id));
            }
        }
        // Most relief per migration first.
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal).then(a.2.cmp(&b.2)));

        for (demand, memory, vm_id) in candidates {
            let needs_gpu = self.vm_needs_gpu(inventory, vm_id, cloud);
            let cap = source_util - self.headroom;
            let destination = self.pick_destination(inventory, source, vm_id, memory, needs_gpu, Some(cap));
            if let Some(destination) = destination {
                self.start(ctx, vm_id, source, destination, demand, memory, inventory, accountant, cloud);
                return true;
            }
        }
        log_debug!(ctx, "no migration relieves machine {}", source);
        false
    }

    /// Lowest-utilisation active machine of the same architecture with
    /// enough free memory, optionally below a utilisation cap.
    fn pick_destination(
        &self,
        inventory: &Inventory,
        source: MachineId,
        vm_id: VmId,
        memory: u64,
        needs_gpu: bool,
        utilisation_cap: Option<f64>,
    ) -> Option<MachineId> {
        let arch = inventory.vm(vm_id).arch;
        let mut best: Option<(f64, MachineId)> = None;
        for machine in inventory.machines() {
            if machine.id == source || machine.arch != arch || !machine.is_active() {
                continue;
            }
            if needs_gpu && !machine.has_gpu {
                continue;
            }
            if machine.free_memory() < memory {
                continue;
            }
            let util = machine.cpu_utilisation();
            if let Some(cap) = utilisation_cap {
                if util > cap {
                    continue;
                }
            }
            match best {
                Some((best_util, best_id)) if (util, machine.id) >= (best_util, best_id) => {}
                _ => best = Some((util, machine.id)),
            }
        }
        best.map(|(_, id)| id)
    }

    /// Marks the VM migrating, transfers its committed load and task
    /// entries to the destination, and issues the migrate down-call. The
    /// destination is known to be active, gated by `pick_destination`.
    #[allow(clippy::too_many_arguments)]
    fn start(
        &mut self,
        ctx: &EngineContext,
        vm: VmId,
        source: MachineId,
        destination: MachineId,
        demand: f64,
        memory: u64,
        inventory: &mut Inventory,
        accountant: &mut LoadAccountant,
        cloud: &mut dyn CloudApi,
    ) {
        inventory.vm_mut(vm).migrating = true;
        inventory.machine_mut(source).outbound_migrations += 1;
        inventory.machine_mut(destination).inbound_migrations += 1;
        let tasks: Vec<TaskId> = inventory.vm(vm).tasks.iter().cloned().collect();
        for task in tasks {
            accountant.relocate(inventory, task, destination);
        }
        self.in_flight.insert(
            vm,
            MigrationRecord {
                vm,
                source,
                destination,
                demand,
                memory,
            },
        );
        cloud.migrate_vm(vm, destination);
        log_info!(
            ctx,
            "migrating vm {} from machine {} to machine {} ({:.1} mips, {} mem)",
            vm,
            source,
            destination,
            demand,
            memory
        );
    }

    /// Migration-complete callback: clears the flag and rebinds the VM to
    /// its destination host.
    pub fn complete(&mut self, ctx: &EngineContext, vm: VmId, inventory: &mut Inventory) {
        let Some(record) = self.in_flight.remove(&vm) else {
            log_warn!(ctx, "migration-complete for vm {} with no record", vm);
            return;
        };
        inventory.vm_mut(vm).migrating = false;
        let source = inventory.machine_mut(record.source);
        source.outbound_migrations = source.outbound_migrations.saturating_sub(1);
        let destination = inventory.machine_mut(record.destination);
        destination.inbound_migrations = destination.inbound_migrations.saturating_sub(1);
        inventory.move_vm_host(vm, record.destination);
        log_debug!(
            ctx,
            "vm {} migration to machine {} complete",
            vm,
            record.destination
        );
    }

    fn vm_needs_gpu(&self, inventory: &Inventory, vm: VmId, cloud: &dyn CloudApi) -> bool {
        inventory.vm(vm).tasks.iter().any(|task| cloud.task_info(*task).gpu_capable)
    }
}
