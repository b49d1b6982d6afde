//! In-memory catalogue of machines and VMs with secondary indices.
//!
//! The inventory exclusively owns machine and VM records; every other
//! component refers to them by id and resolves through the accessors here.
//! The utilisation-ascending order is recomputed on demand, it is used at
//! most once per event.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::types::{CpuArch, GuestOs, MachineId, MachineInfo, PState, SState, TaskId, VmId};

/// Logical power tier of a machine, managed by the active power policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    Running,
    Intermediate,
    Off,
}

/// Machine properties and the scheduler's view of its state.
///
/// `s_state` is the last acknowledged power state; `target_state` is set
/// while a requested transition is in flight. Committed MIPS and memory are
/// mutated only through the load accountant.
#[derive(Clone, Debug)]
pub struct MachineRecord {
    pub id: MachineId,
    pub arch: CpuArch,
    pub cores: u32,
    pub memory_total: u64,
    pub has_gpu: bool,
    /// Per-core MIPS rating indexed by P-state.
    pub mips: Vec<u32>,
    pub s_state: SState,
    pub target_state: Option<SState>,
    pub p_state: PState,
    pub committed_mips: f64,
    pub committed_memory: u64,
    pub vms: BTreeSet<VmId>,
    pub inbound_migrations: u32,
    pub outbound_migrations: u32,
    pub tier: Tier,
}

impl MachineRecord {
    /// MIPS capacity at the current P-state, across all cores.
    pub fn mips_capacity(&self) -> f64 {
        let per_core = self.mips.get(self.p_state.index()).copied().unwrap_or(0);
        per_core as f64 * self.cores as f64
    }

    /// Committed MIPS over capacity, clamped to [0, 1].
    pub fn cpu_utilisation(&self) -> f64 {
        let capacity = self.mips_capacity();
        if capacity == 0. {
            return 0.;
        }
        (self.committed_mips / capacity).clamp(0., 1.)
    }

    /// Committed memory over total memory.
    pub fn memory_utilisation(&self) -> f64 {
        if self.memory_total == 0 {
            return 0.;
        }
        self.committed_memory as f64 / self.memory_total as f64
    }

    /// Sort key used by placement: the tighter of the two resources.
    pub fn utilisation(&self) -> f64 {
        self.cpu_utilisation().max(self.memory_utilisation())
    }

    /// Memory not yet committed. Saturates at zero during a memory-warning
    /// episode.
    pub fn free_memory(&self) -> u64 {
        self.memory_total.saturating_sub(self.committed_memory)
    }

    /// Active means acknowledged S0 with no transition in flight. A machine
    /// on its way to or from sleep accepts no work.
    pub fn is_active(&self) -> bool {
        self.s_state == SState::S0 && self.target_state.is_none()
    }

    /// True when this machine is the destination of an in-flight migration.
    pub fn is_migration_target(&self) -> bool {
        self.inbound_migrations > 0
    }

    /// True when any migration touches this machine. Such machines must keep
    /// their current power state.
    pub fn has_migration_traffic(&self) -> bool {
        self.inbound_migrations > 0 || self.outbound_migrations > 0
    }
}

/// VM identity and the scheduler's view of its placement.
#[derive(Clone, Debug)]
pub struct VmRecord {
    pub id: VmId,
    pub kind: GuestOs,
    pub arch: CpuArch,
    pub host: Option<MachineId>,
    pub tasks: BTreeSet<TaskId>,
    pub migrating: bool,
}

/// Central catalogue. Machines are indexed by id and CPU architecture, VMs
/// by id; the (host, guest OS) lookup goes through the host's VM set.
pub struct Inventory {
    machines: BTreeMap<MachineId, MachineRecord>,
    vms: BTreeMap<VmId, VmRecord>,
    by_arch: HashMap<CpuArch, Vec<MachineId>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self {
            machines: BTreeMap::new(),
            vms: BTreeMap::new(),
            by_arch: HashMap::new(),
        }
    }

    /// Registers a machine discovered at Init from its simulator snapshot.
    pub fn add_machine(&mut self, info: &MachineInfo) {
        self.by_arch.entry(info.arch).or_default().push(info.id);
        self.machines.insert(
            info.id,
            MachineRecord {
                id: info.id,
                arch: info.arch,
                cores: info.cores,
                memory_total: info.memory_total,
                has_gpu: info.has_gpu,
                mips: info.mips.clone(),
                s_state: info.s_state,
                target_state: None,
                p_state: info.p_state,
                committed_mips: 0.,
                committed_memory: 0,
                vms: BTreeSet::new(),
                inbound_migrations: 0,
                outbound_migrations: 0,
                tier: Tier::Running,
            },
        );
    }

    pub fn machine(&self, id: MachineId) -> &MachineRecord {
        &self.machines[&id]
    }

    pub fn machine_mut(&mut self, id: MachineId) -> &mut MachineRecord {
        self.machines.get_mut(&id).unwrap_or_else(|| panic!("machine {} is not in the inventory", id))
    }

    pub fn get_machine(&self, id: MachineId) -> Option<&MachineRecord> {
        self.machines.get(&id)
    }

    pub fn machine_ids(&self) -> Vec<MachineId> {
        self.machines.keys().cloned().collect()
    }

    pub fn machines(&self) -> impl Iterator<Item = &MachineRecord> {
        self.machines.values()
    }

    pub fn machine_count(&self) -> usize {
        self.machines.len()
    }

    /// Machine ids of the given CPU architecture, in discovery order.
    pub fn machines_with_arch(&self, arch: CpuArch) -> &[MachineId] {
        self.by_arch.get(&arch).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Machine ids ordered by ascending utilisation, ties broken by id.
    pub fn sorted_by_utilisation(&self) -> Vec<MachineId> {
        let mut ids: Vec<MachineId> = self.machines.keys().cloned().collect();
        ids.sort_by(|a, b| {
            let ua = self.machines[a].utilisation();
            let ub = self.machines[b].utilisation();
            ua.partial_cmp(&ub).unwrap_or(std::cmp::Ordering::Equal).then(a.cmp(b))
        });
        ids
    }

    /// Cluster load: committed memory over total memory across all machines.
    pub fn cluster_memory_utilisation(&self) -> f64 {
        let total: u64 = self.machines.values().map(|m| m.memory_total).sum();
        if total == 0 {
            return 0.;
        }
        let used: u64 = self.machines.values().map(|m| m.committed_memory).sum();
        used as f64 / total as f64
    }

    pub fn count_tier(&self, tier: Tier) -> usize {
        self.machines.values().filter(|m| m.tier == tier).count()
    }

    /// Records a requested asynchronous S-state transition.
    pub fn set_target_state(&mut self, id: MachineId, state: SState) {
        self.machine_mut(id).target_state = Some(state);
    }

    /// Applies the acknowledged S-state from the state-change callback.
    pub fn acknowledge_state(&mut self, id: MachineId, state: SState) {
        let machine = self.machine_mut(id);
        machine.s_state = state;
        machine.target_state = None;
    }

    /// Registers a freshly created VM, not yet attached anywhere.
    pub fn add_vm(&mut self, id: VmId, kind: GuestOs, arch: CpuArch) {
        self.vms.insert(
            id,
            VmRecord {
                id,
                kind,
                arch,
                host: None,
                tasks: BTreeSet::new(),
                migrating: false,
            },
        );
    }

    /// Binds a VM to its host machine. The vm -> machine and
    /// machine -> set-of-vms maps are updated in lock-step.
    pub fn attach_vm(&mut self, vm: VmId, machine: MachineId) {
        if let Some(record) = self.vms.get_mut(&vm) {
            record.host = Some(machine);
        }
        self.machine_mut(machine).vms.insert(vm);
    }

    /// Drops a VM from the catalogue (after VM shutdown).
    pub fn remove_vm(&mut self, vm: VmId) {
        if let Some(record) = self.vms.remove(&vm) {
            if let Some(host) = record.host {
                if let Some(machine) = self.machines.get_mut(&host) {
                    machine.vms.remove(&vm);
                }
            }
        }
    }

    /// Rebinds a migrated VM to its destination host.
    pub fn move_vm_host(&mut self, vm: VmId, destination: MachineId) {
        let previous = self.vms.get(&vm).and_then(|record| record.host);
        if let Some(source) = previous {
            if let Some(machine) = self.machines.get_mut(&source) {
                machine.vms.remove(&vm);
            }
        }
        self.attach_vm(vm, destination);
    }

    pub fn vm(&self, id: VmId) -> &VmRecord {
        &self.vms[&id]
    }

    pub fn vm_mut(&mut self, id: VmId) -> &mut VmRecord {
        self.vms.get_mut(&id).unwrap_or_else(|| panic!("vm {} is not in the inventory", id))
    }

    pub fn get_vm(&self, id: VmId) -> Option<&VmRecord> {
        self.vms.get(&id)
    }

    pub fn vms(&self) -> impl Iterator<Item = &VmRecord> {
        self.vms.values()
    }

    /// Earliest-created non-migrating VM of the given guest OS on the host.
    /// Ids ascend with creation order, so the lowest id wins.
    pub fn find_vm(&self, host: MachineId, kind: GuestOs) -> Option<VmId> {
        let machine = self.machines.get(&host)?;
        machine
            .vms
            .iter()
            .find(|vm| {
                let record = &self.vms[vm];
                record.kind == kind && !record.migrating
            })
            .cloned()
    }

    /// Any non-migrating VM on the host, earliest-created first.
    pub fn first_vm(&self, host: MachineId) -> Option<VmId> {
        let machine = self.machines.get(&host)?;
        machine.vms.iter().find(|vm| !self.vms[vm].migrating).cloned()
    }
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}
