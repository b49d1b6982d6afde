//! Event adapter: the stateless translation layer between simulator
//! up-calls and the policy components.
//!
//! The engine runs inside the simulator's single-threaded event loop; every
//! up-call is serialised and none suspend. Down-calls with latency (power
//! transitions, migrations) are tracked as target states, migration records
//! and pending attachments so that every decision taken between issue and
//! completion stays correct even if a transition never completes.

use std::collections::HashSet;

use crate::core::accountant::LoadAccountant;
use crate::core::api::CloudApi;
use crate::core::config::SchedulerConfig;
use crate::core::consolidation::{adjust_pstates, power_policy_resolver, PowerPolicy};
use crate::core::inventory::{Inventory, Tier};
use crate::core::logger::{Logger, StdoutLogger};
use crate::core::migration::MigrationCoordinator;
use crate::core::placement::{PendingAttachment, PlacementEngine, PlacementOutcome};
use crate::core::types::{CpuArch, GuestOs, MachineId, Priority, SState, SlaClass, TaskId, Time, VmId};
use crate::{log_debug, log_error, log_warn};

/// Time and identity handed to the logging macros.
pub struct EngineContext {
    time: Time,
    name: String,
}

impl EngineContext {
    pub fn new(name: &str) -> Self {
        Self {
            time: 0,
            name: name.to_string(),
        }
    }

    /// Current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.time as f64 / 1e6
    }

    /// Current simulation time in microseconds.
    pub fn now(&self) -> Time {
        self.time
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Simulator time is monotone; earlier timestamps are ignored.
    pub fn advance(&mut self, time: Time) {
        if time > self.time {
            self.time = time;
        }
    }
}

/// The scheduling policy engine. One instance lives for the whole
/// simulation and owns all policy state.
pub struct Scheduler {
    ctx: EngineContext,
    config: SchedulerConfig,
    inventory: Inventory,
    accountant: LoadAccountant,
    placement: PlacementEngine,
    power_policy: Box<dyn PowerPolicy>,
    migrations: MigrationCoordinator,
    pending: Vec<PendingAttachment>,
    memory_pressure: HashSet<MachineId>,
    logger: Box<dyn Logger>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let power_policy = power_policy_resolver(&config.power_policy);
        let migrations = MigrationCoordinator::new(config.overload_threshold, config.migration_headroom);
        Self {
            ctx: EngineContext::new("scheduler"),
            config,
            inventory: Inventory::new(),
            accountant: LoadAccountant::new(),
            placement: PlacementEngine::new(),
            power_policy,
            migrations,
            pending: Vec::new(),
            memory_pressure: HashSet::new(),
            logger: Box::new(StdoutLogger::new()),
        }
    }

    pub fn with_logger(mut self, logger: Box<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Saves the logger's audit trail, if the configured logger keeps one.
    pub fn save_log(&self, path: &str) -> Result<(), std::io::Error> {
        self.logger.save_log(path)
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn accountant(&self) -> &LoadAccountant {
        &self.accountant
    }

    pub fn migrations(&self) -> &MigrationCoordinator {
        &self.migrations
    }

    pub fn pending_attachments(&self) -> &[PendingAttachment] {
        &self.pending
    }

    /// Discovers the cluster, lets the power policy seed machine tiers and
    /// eagerly provisions the standard VM set on every running machine.
    pub fn init(&mut self, cloud: &mut dyn CloudApi) {
        let total = cloud.machine_count();
        self.logger
            .log_info(&self.ctx, format!("init: discovered {} machines", total));
        for id in 0..total {
            let info = cloud.machine_info(id);
            self.inventory.add_machine(&info);
        }
        self.power_policy.on_init(&self.ctx, &mut self.inventory, cloud);
        for machine in self.inventory.machine_ids() {
            let record = self.inventory.machine(machine);
            if record.tier == Tier::Running && record.is_active() {
                self.provision_standard_vms(machine, cloud);
            }
        }
    }

    /// Task arrival: run the placement passes.
    pub fn on_new_task(&mut self, time: Time, task: TaskId, cloud: &mut dyn CloudApi) {
        self.ctx.advance(time);
        let info = cloud.task_info(task);
        let outcome = self.placement.place(
            &self.ctx,
            &info,
            &mut self.inventory,
            &mut self.accountant,
            &mut self.pending,
            cloud,
        );
        if outcome == PlacementOutcome::Failed {
            self.logger
                .log_warn(&self.ctx, format!("task {} left unplaced", task));
        }
    }

    /// Task completion: release load and let the power policy react.
    pub fn on_task_complete(&mut self, time: Time, task: TaskId, cloud: &mut dyn CloudApi) {
        self.ctx.advance(time);
        let owner = self
            .inventory
            .vms()
            .find(|vm| vm.tasks.contains(&task))
            .map(|vm| vm.id);
        if let Some(vm) = owner {
            let info = cloud.task_info(task);
            self.accountant.record_completion(vm, &info, self.ctx.now());
            self.inventory.vm_mut(vm).tasks.remove(&task);
        }
        if self.accountant.release(&mut self.inventory, task).is_none() {
            log_debug!(self.ctx, "completion of task {} that was never committed", task);
        }
        self.pending.retain(|p| p.task != task);
        self.power_policy.rebalance(
            &self.ctx,
            &mut self.inventory,
            &self.accountant,
            &self.pending,
            cloud,
        );
    }

    /// Memory overcommitment reported by the simulator: record the episode
    /// and migrate the largest-memory VM away if anything can take it.
    pub fn on_memory_warning(&mut self, time: Time, machine: MachineId, cloud: &mut dyn CloudApi) {
        self.ctx.advance(time);
        self.memory_pressure.insert(machine);
        self.logger
            .log_warn(&self.ctx, format!("memory warning on machine {}", machine));
        self.migrations
            .react_memory(&self.ctx, machine, &mut self.inventory, &mut self.accountant, cloud);
    }

    /// Migration acknowledged by the simulator.
    pub fn on_migration_done(&mut self, time: Time, vm: VmId, _cloud: &mut dyn CloudApi) {
        self.ctx.advance(time);
        self.migrations.complete(&self.ctx, vm, &mut self.inventory);
    }

    /// SLA warning for a placed task: escalate its priority and treat its
    /// machine as overloaded.
    pub fn on_sla_warning(&mut self, time: Time, task: TaskId, cloud: &mut dyn CloudApi) {
        self.ctx.advance(time);
        cloud.set_task_priority(task, Priority::High);
        self.accountant.set_priority(task, Priority::High);
        self.migrations
            .react_sla(&self.ctx, task, &mut self.inventory, &mut self.accountant, cloud);
    }

    /// Periodic check: consolidation sweep, overload detection and the
    /// optional DVFS adjustment.
    pub fn on_scheduler_check(&mut self, time: Time, cloud: &mut dyn CloudApi) {
        self.ctx.advance(time);
        let inventory = &self.inventory;
        self.memory_pressure.retain(|machine| {
            inventory
                .get_machine(*machine)
                .map_or(false, |record| record.committed_memory > record.memory_total)
        });
        self.power_policy.rebalance(
            &self.ctx,
            &mut self.inventory,
            &self.accountant,
            &self.pending,
            cloud,
        );
        self.migrations
            .sweep(&self.ctx, &mut self.inventory, &mut self.accountant, cloud);
        if self.config.dvfs {
            adjust_pstates(&self.ctx, &mut self.inventory, &self.accountant, cloud);
        }
    }

    /// A requested S-state transition completed. Machines that reached S0
    /// consume their pending attachments; all other pendings are retained.
    pub fn on_state_change_complete(&mut self, time: Time, machine: MachineId, cloud: &mut dyn CloudApi) {
        self.ctx.advance(time);
        let info = cloud.machine_info(machine);
        self.inventory.acknowledge_state(machine, info.s_state);
        log_debug!(self.ctx, "machine {} reached {}", machine, info.s_state);
        if info.s_state != SState::S0 {
            return;
        }

        let (ready, retained): (Vec<_>, Vec<_>) = self.pending.drain(..).partition(|p| p.machine == machine);
        self.pending = retained;
        for p in ready {
            if let Err(err) = cloud.attach_vm(p.vm, machine) {
                log_error!(self.ctx, "pending vm {} failed to attach: {}", p.vm, err);
                self.inventory.remove_vm(p.vm);
                continue;
            }
            self.inventory.attach_vm(p.vm, machine);
            match cloud.add_task(p.vm, p.task, p.priority) {
                Ok(()) => {
                    self.inventory.vm_mut(p.vm).tasks.insert(p.task);
                    self.accountant
                        .commit(&mut self.inventory, p.task, machine, p.demand, p.memory, p.priority);
                    log_debug!(
                        self.ctx,
                        "pending task {} attached to vm {} on machine {}",
                        p.task,
                        p.vm,
                        machine
                    );
                }
                Err(err) => {
                    log_error!(self.ctx, "pending task {} rejected by vm {}: {}", p.task, p.vm, err);
                }
            }
        }

        // A running-tier machine that woke empty (tier promotion) gets the
        // standard VM set so later arrivals hit pass A instead of pass C.
        let record = self.inventory.machine(machine);
        if record.tier == Tier::Running && record.vms.is_empty() {
            self.provision_standard_vms(machine, cloud);
        }
    }

    /// End of simulation: report, expire pending work, shut everything down.
    pub fn on_simulation_complete(&mut self, time: Time, cloud: &mut dyn CloudApi) {
        self.ctx.advance(time);
        println!("SLA violation report");
        println!("SLA0: {}%", cloud.sla_report(SlaClass::Sla0));
        println!("SLA1: {}%", cloud.sla_report(SlaClass::Sla1));
        println!("SLA2: {}%", cloud.sla_report(SlaClass::Sla2));
        println!("Total Energy {}KW-Hour", cloud.cluster_energy());
        println!("Simulation run finished in {} seconds", time as f64 / 1e6);

        if !self.pending.is_empty() {
            log_warn!(
                self.ctx,
                "discarding {} pending attachments at shutdown",
                self.pending.len()
            );
            self.pending.clear();
        }
        let vms: Vec<VmId> = self.inventory.vms().map(|vm| vm.id).collect();
        for vm in vms {
            match cloud.shutdown_vm(vm) {
                Ok(()) => self.inventory.remove_vm(vm),
                Err(err) => log_warn!(self.ctx, "vm {} not shut down: {}", vm, err),
            }
        }
        self.logger.log_info(&self.ctx, "simulation complete".to_string());
    }

    /// Creates and attaches the standard guest set for one machine: LINUX
    /// and LINUX_RT everywhere, WIN on X86/ARM, AIX on POWER.
    fn provision_standard_vms(&mut self, machine: MachineId, cloud: &mut dyn CloudApi) {
        let arch = self.inventory.machine(machine).arch;
        let mut kinds = vec![GuestOs::Linux, GuestOs::LinuxRt];
        match arch {
            CpuArch::X86 | CpuArch::Arm => kinds.push(GuestOs::Win),
            CpuArch::Power => kinds.push(GuestOs::Aix),
            CpuArch::Riscv => {}
        }
        for kind in kinds {
            let vm = cloud.create_vm(kind, arch);
            self.inventory.add_vm(vm, kind, arch);
            match cloud.attach_vm(vm, machine) {
                Ok(()) => self.inventory.attach_vm(vm, machine),
                Err(err) => {
                    log_error!(self.ctx, "cannot attach vm {} to machine {}: {}", vm, machine, err);
                    self.inventory.remove_vm(vm);
                }
            }
        }
    }
}
