//! Consolidation and machine power management.
//!
//! Two mutually exclusive policies, chosen at configuration time:
//!
//! * [`DrainAndPowerOff`] — any active machine with zero committed load and
//!   no live tasks is powered off (S5). Empty VMs stay attached until their
//!   machine powers down, at which point they are shut down.
//! * [`TierManager`] — machines are partitioned into running (S0),
//!   intermediate (S3) and off (S5) tiers; desired tier sizes follow the
//!   cluster memory load and the active task count.
//!
//! Both respect the gates of the concurrency model: a machine with pending
//! attachments or migration traffic keeps its power state, and a transition
//! already in flight is never recalled.

use dyn_clone::{clone_trait_object, DynClone};
use strum_macros::EnumString;

use crate::core::accountant::LoadAccountant;
use crate::core::api::CloudApi;
use crate::core::config::{parse_config_value, parse_options};
use crate::core::engine::EngineContext;
use crate::core::inventory::{Inventory, Tier};
use crate::core::placement::PendingAttachment;
use crate::core::types::{MachineId, PState, Priority, SState};
use crate::{log_debug, log_info};

/// Background power-management strategy invoked from task completion and
/// the periodic check.
pub trait PowerPolicy: DynClone {
    fn name(&self) -> &'static str;

    /// Partitions the discovered machines into tiers and issues the initial
    /// power transitions. Machines put in the off tier go straight to S5.
    fn on_init(&mut self, ctx: &EngineContext, inventory: &mut Inventory, cloud: &mut dyn CloudApi);

    /// One consolidation step over the whole cluster.
    fn rebalance(
        &mut self,
        ctx: &EngineContext,
        inventory: &mut Inventory,
        accountant: &LoadAccountant,
        pending: &[PendingAttachment],
        cloud: &mut dyn CloudApi,
    );
}

clone_trait_object!(PowerPolicy);

#[derive(Clone, Debug, PartialEq, EnumString)]
pub enum PowerPolicyType {
    DrainAndPowerOff,
    TierManager,
}

/// Resolves a `Name[key=value,...]` configuration string into a policy.
pub fn power_policy_resolver(config_str: &str) -> Box<dyn PowerPolicy> {
    let (name, options) = parse_config_value(config_str);
    let policy_type: PowerPolicyType = name
        .parse()
        .unwrap_or_else(|_| panic!("Can't resolve power policy: {}", config_str));
    match policy_type {
        PowerPolicyType::DrainAndPowerOff => Box::new(DrainAndPowerOff::new()),
        PowerPolicyType::TierManager => match options {
            Some(options) => Box::new(TierManager::from_options(&options)),
            None => Box::new(TierManager::default()),
        },
    }
}

fn machine_is_drainable(
    inventory: &Inventory,
    accountant: &LoadAccountant,
    pending: &[PendingAttachment],
    machine: MachineId,
) -> bool {
    let record = inventory.machine(machine);
    record.is_active()
        && record.committed_mips == 0.
        && record.committed_memory == 0
        && accountant.machine_task_count(machine) == 0
        && !record.has_migration_traffic()
        && !pending.iter().any(|p| p.machine == machine)
        && record.vms.iter().all(|vm| inventory.vm(*vm).tasks.is_empty())
}

/// Shuts down every (empty) VM on the machine. Returns false and leaves the
/// machine alone if any VM refuses to die.
fn shutdown_machine_vms(
    ctx: &EngineContext,
    inventory: &mut Inventory,
    cloud: &mut dyn CloudApi,
    machine: MachineId,
) -> bool {
    let vms: Vec<_> = inventory.machine(machine).vms.iter().cloned().collect();
    for vm in vms {
        match cloud.shutdown_vm(vm) {
            Ok(()) => inventory.remove_vm(vm),
            Err(err) => {
                log_debug!(ctx, "vm {} on machine {} not shut down: {}", vm, machine, err);
                return false;
            }
        }
    }
    true
}

////////////////////////////////////////////////////////////////////////////////

/// Powers off every idle machine; placement wakes them back on demand.
#[derive(Clone)]
pub struct DrainAndPowerOff;

impl DrainAndPowerOff {
    pub fn new() -> Self {
        Self {}
    }
}

impl PowerPolicy for DrainAndPowerOff {
    fn name(&self) -> &'static str {
        "DrainAndPowerOff"
    }

    fn on_init(&mut self, _ctx: &EngineContext, _inventory: &mut Inventory, _cloud: &mut dyn CloudApi) {
        // Every machine starts in the running tier; the first rebalance
        // powers down whatever stays idle.
    }

    fn rebalance(
        &mut self,
        ctx: &EngineContext,
        inventory: &mut Inventory,
        accountant: &LoadAccountant,
        pending: &[PendingAttachment],
        cloud: &mut dyn CloudApi,
    ) {
        for machine in inventory.machine_ids() {
            if !machine_is_drainable(inventory, accountant, pending, machine) {
                continue;
            }
            if !shutdown_machine_vms(ctx, inventory, cloud, machine) {
                continue;
            }
            cloud.set_machine_state(machine, SState::S5);
            inventory.set_target_state(machine, SState::S5);
            inventory.machine_mut(machine).tier = Tier::Off;
            log_info!(ctx, "machine {} drained, powering off", machine);
        }
    }
}

impl Default for DrainAndPowerOff {
    fn default() -> Self {
        Self::new()
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Three-tier power management: running machines take work, intermediate
/// machines wait in light sleep with a short wake latency, the rest are off.
#[derive(Clone)]
pub struct TierManager {
    high_load: f64,
    low_load: f64,
}

impl TierManager {
    pub fn new(high_load: f64, low_load: f64) -> Self {
        Self { high_load, low_load }
    }

    pub fn from_options(options_str: &str) -> Self {
        let options = parse_options(options_str);
        let high_load = options.get("high").map(|v| v.parse::<f64>().unwrap()).unwrap_or(0.7);
        let low_load = options.get("low").map(|v| v.parse::<f64>().unwrap()).unwrap_or(0.3);
        Self { high_load, low_load }
    }

    /// Desired (running, intermediate) tier sizes for the current load.
    fn tier_sizes(&self, total: usize, load: f64, active_tasks: usize) -> (usize, usize) {
        let total_f = total as f64;
        let (mut running, intermediate) = if load > self.high_load {
            (((total_f * 0.6) as usize).max(4), ((total_f * 0.2) as usize).max(2))
        } else if load < self.low_load {
            (((total_f * 0.3) as usize).max(2), ((total_f * 0.2) as usize).max(2))
        } else {
            (((total_f * 0.4) as usize).max(3), ((total_f * 0.2) as usize).max(2))
        };
        running = running.max(((active_tasks + 3) / 4).max(2));
        running = running.min(total);
        let intermediate = intermediate.min(total - running);
        (running, intermediate)
    }
}

impl Default for TierManager {
    fn default() -> Self {
        Self::new(0.7, 0.3)
    }
}

impl PowerPolicy for TierManager {
    fn name(&self) -> &'static str {
        "TierManager"
    }

    fn on_init(&mut self, ctx: &EngineContext, inventory: &mut Inventory, cloud: &mut dyn CloudApi) {
        let total = inventory.machine_count();
        let running_size = (total / 3).max(4).min(total);
        let intermediate_size = (total / 6).max(2).min(total.saturating_sub(running_size));

        // Group machines by architecture and take the head of each group in
        // turn, so every architecture keeps running capacity when possible.
        let mut groups: Vec<Vec<MachineId>> = Vec::new();
        let mut seen: Vec<MachineId> = Vec::new();
        for machine in inventory.machines() {
            let ids = inventory.machines_with_arch(machine.arch);
            if !seen.contains(&ids[0]) {
                seen.push(ids[0]);
                groups.push(ids.to_vec());
            }
        }
        let mut ordered: Vec<MachineId> = Vec::new();
        let mut cursor = 0;
        while ordered.len() < total {
            let mut advanced = false;
            for group in &groups {
                if cursor < group.len() {
                    ordered.push(group[cursor]);
                    advanced = true;
                }
            }
            cursor += 1;
            if !advanced {
                break;
            }
        }

        for (index, machine) in ordered.into_iter().enumerate() {
            if index < running_size {
                inventory.machine_mut(machine).tier = Tier::Running;
            } else if index < running_size + intermediate_size {
                inventory.machine_mut(machine).tier = Tier::Intermediate;
                cloud.set_machine_state(machine, SState::S3);
                inventory.set_target_state(machine, SState::S3);
            } else {
                inventory.machine_mut(machine).tier = Tier::Off;
                cloud.set_machine_state(machine, SState::S5);
                inventory.set_target_state(machine, SState::S5);
            }
        }
        log_info!(
            ctx,
            "tier seeding: {} running, {} intermediate, {} off",
            running_size,
            intermediate_size,
            total - running_size - intermediate_size
        );
    }

    fn rebalance(
        &mut self,
        ctx: &EngineContext,
        inventory: &mut Inventory,
        accountant: &LoadAccountant,
        pending: &[PendingAttachment],
        cloud: &mut dyn CloudApi,
    ) {
        let total = inventory.machine_count();
        let load = inventory.cluster_memory_utilisation();
        let (desired_running, desired_intermediate) = self.tier_sizes(total, load, accountant.active_tasks());

        let current_running = inventory.count_tier(Tier::Running);

        if current_running < desired_running {
            // Promote intermediate machines that are not mid-transition.
            let mut deficit = desired_running - current_running;
            for machine in inventory.machine_ids() {
                if deficit == 0 {
                    break;
                }
                let record = inventory.machine(machine);
                if record.tier != Tier::Intermediate || record.target_state.is_some() {
                    continue;
                }
                cloud.set_machine_state(machine, SState::S0);
                inventory.set_target_state(machine, SState::S0);
                inventory.machine_mut(machine).tier = Tier::Running;
                log_debug!(ctx, "promoting machine {} to running tier", machine);
                deficit -= 1;
            }
        } else if current_running > desired_running {
            // Demote only machines whose committed load is zero.
            let mut surplus = current_running - desired_running;
            for machine in inventory.machine_ids() {
                if surplus == 0 {
                    break;
                }
                if inventory.machine(machine).tier != Tier::Running
                    || !machine_is_drainable(inventory, accountant, pending, machine)
                {
                    continue;
                }
                if !shutdown_machine_vms(ctx, inventory, cloud, machine) {
                    continue;
                }
                cloud.set_machine_state(machine, SState::S3);
                inventory.set_target_state(machine, SState::S3);
                inventory.machine_mut(machine).tier = Tier::Intermediate;
                log_debug!(ctx, "demoting machine {} to intermediate tier", machine);
                surplus -= 1;
            }
        }

        let current_running = inventory.count_tier(Tier::Running);
        let current_intermediate = inventory.count_tier(Tier::Intermediate);
        let current_total = current_running + current_intermediate;
        let desired_total = desired_running + desired_intermediate;

        if current_total < desired_total {
            // Pull machines out of the off tier into standby.
            let mut deficit = desired_total - current_total;
            for machine in inventory.machine_ids() {
                if deficit == 0 {
                    break;
                }
                let record = inventory.machine(machine);
                if record.tier != Tier::Off || record.target_state.is_some() {
                    continue;
                }
                cloud.set_machine_state(machine, SState::S3);
                inventory.set_target_state(machine, SState::S3);
                inventory.machine_mut(machine).tier = Tier::Intermediate;
                log_debug!(ctx, "waking machine {} into intermediate tier", machine);
                deficit -= 1;
            }
        } else if current_intermediate > desired_intermediate {
            // Push surplus standby machines all the way off.
            let mut surplus = current_intermediate - desired_intermediate;
            for machine in inventory.machine_ids() {
                if surplus == 0 {
                    break;
                }
                let record = inventory.machine(machine);
                if record.tier != Tier::Intermediate || record.target_state.is_some() || record.s_state != SState::S3 {
                    continue;
                }
                cloud.set_machine_state(machine, SState::S5);
                inventory.set_target_state(machine, SState::S5);
                inventory.machine_mut(machine).tier = Tier::Off;
                log_debug!(ctx, "powering off surplus intermediate machine {}", machine);
                surplus -= 1;
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Utilisation-band DVFS: map each active machine's utilisation to a
/// P-state, never starving committed load and pinning machines that host
/// High-priority tasks at P0.
pub fn adjust_pstates(
    ctx: &EngineContext,
    inventory: &mut Inventory,
    accountant: &LoadAccountant,
    cloud: &mut dyn CloudApi,
) {
    for machine in inventory.machine_ids() {
        let record = inventory.machine(machine);
        if !record.is_active() {
            continue;
        }
        let utilisation = record.cpu_utilisation();
        let mut target = if utilisation >= 0.75 {
            PState::P0
        } else if utilisation >= 0.5 {
            PState::P1
        } else if utilisation >= 0.25 {
            PState::P2
        } else {
            PState::P3
        };
        // A guest with a worsening response-time slope buys one notch up
        // before its tasks start missing targets.
        let degrading = record
            .vms
            .iter()
            .any(|vm| accountant.vm_response(*vm).map_or(false, |history| history.is_degrading()));
        if degrading {
            target = faster(target);
        }
        if accountant.machine_hosts_priority(machine, Priority::High) {
            target = PState::P0;
        }
        // Raise the target until the committed load still fits.
        while target != PState::P0 && record.committed_mips > capacity_at(record.cores, &record.mips, target) {
            target = faster(target);
        }
        if target != record.p_state {
            cloud.set_core_performance(machine, 0, target);
            inventory.machine_mut(machine).p_state = target;
            log_debug!(ctx, "machine {} p-state set to {}", machine, target);
        }
    }
}

fn capacity_at(cores: u32, mips: &[u32], p_state: PState) -> f64 {
    mips.get(p_state.index()).copied().unwrap_or(0) as f64 * cores as f64
}

fn faster(p_state: PState) -> PState {
    match p_state {
        PState::P0 | PState::P1 => PState::P0,
        PState::P2 => PState::P1,
        PState::P3 => PState::P2,
    }
}
