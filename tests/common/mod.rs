//! Mock simulator used to drive the engine in integration tests.
#![allow(dead_code)]

use std::collections::HashMap;

use ecosched::core::api::CloudApi;
use ecosched::core::error::SchedulerError;
use ecosched::core::types::{
    CpuArch, GuestOs, MachineId, MachineInfo, PState, Priority, SState, SlaClass, TaskId, TaskInfo, TaskKind, Time,
    VmId, VmInfo,
};

pub struct MockMachine {
    pub arch: CpuArch,
    pub cores: u32,
    pub memory: u64,
    pub gpu: bool,
    pub mips: Vec<u32>,
    pub s_state: SState,
    pub p_state: PState,
    /// Transition requested but not yet applied; applied by
    /// [`MockCloud::complete_state_change`].
    pub pending_state: Option<SState>,
}

pub struct MockVm {
    pub kind: GuestOs,
    pub arch: CpuArch,
    pub host: Option<MachineId>,
    pub tasks: Vec<TaskId>,
    pub migrating_to: Option<MachineId>,
}

/// Every down-call with a side effect, in issue order.
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    SetState(MachineId, SState),
    SetPerformance(MachineId, PState),
    CreateVm(VmId, GuestOs, CpuArch),
    Attach(VmId, MachineId),
    AddTask(VmId, TaskId, Priority),
    RemoveTask(VmId, TaskId),
    Migrate(VmId, MachineId),
    Shutdown(VmId),
    SetTaskPriority(TaskId, Priority),
}

pub struct MockCloud {
    pub machines: Vec<MockMachine>,
    pub vms: HashMap<VmId, MockVm>,
    pub tasks: HashMap<TaskId, TaskInfo>,
    pub calls: Vec<Call>,
    pub energy: f64,
    pub sla: HashMap<SlaClass, f64>,
    next_vm: VmId,
}

impl MockCloud {
    pub fn new() -> Self {
        Self {
            machines: Vec::new(),
            vms: HashMap::new(),
            tasks: HashMap::new(),
            calls: Vec::new(),
            energy: 0.,
            sla: HashMap::new(),
            next_vm: 0,
        }
    }

    pub fn add_machine(&mut self, arch: CpuArch, cores: u32, memory: u64, gpu: bool, s_state: SState) -> MachineId {
        self.machines.push(MockMachine {
            arch,
            cores,
            memory,
            gpu,
            mips: vec![3000, 2400, 1800, 1200],
            s_state,
            p_state: PState::P0,
            pending_state: None,
        });
        (self.machines.len() - 1) as MachineId
    }

    pub fn with_mips(&mut self, machine: MachineId, mips: Vec<u32>) {
        self.machines[machine as usize].mips = mips;
    }

    pub fn register_task(&mut self, info: TaskInfo) {
        self.tasks.insert(info.id, info);
    }

    /// Applies the pending S-state transition; the test then reports it to
    /// the engine via `on_state_change_complete`.
    pub fn complete_state_change(&mut self, machine: MachineId) -> SState {
        let record = &mut self.machines[machine as usize];
        if let Some(state) = record.pending_state.take() {
            record.s_state = state;
        }
        record.s_state
    }

    /// Applies an in-flight migration; the test then reports it via
    /// `on_migration_done`.
    pub fn complete_migration(&mut self, vm: VmId) {
        if let Some(record) = self.vms.get_mut(&vm) {
            if let Some(destination) = record.migrating_to.take() {
                record.host = Some(destination);
            }
        }
    }

    pub fn count_calls(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|call| pred(call)).count()
    }

    fn machine_memory_used(&self, machine: MachineId) -> u64 {
        self.vms
            .values()
            .filter(|vm| vm.host == Some(machine))
            .flat_map(|vm| vm.tasks.iter())
            .filter_map(|task| self.tasks.get(task))
            .map(|task| task.memory)
            .sum()
    }
}

impl CloudApi for MockCloud {
    fn machine_count(&self) -> u32 {
        self.machines.len() as u32
    }

    fn machine_info(&self, machine: MachineId) -> MachineInfo {
        let record = &self.machines[machine as usize];
        let vms = self.vms.values().filter(|vm| vm.host == Some(machine));
        MachineInfo {
            id: machine,
            arch: record.arch,
            cores: record.cores,
            memory_total: record.memory,
            memory_used: self.machine_memory_used(machine),
            has_gpu: record.gpu,
            mips: record.mips.clone(),
            s_state_power: vec![100, 80, 60, 40, 20, 10, 0],
            s_state: record.s_state,
            p_state: record.p_state,
            active_tasks: vms.clone().map(|vm| vm.tasks.len() as u32).sum(),
            active_vms: vms.count() as u32,
        }
    }

    fn machine_energy(&self, _machine: MachineId) -> u64 {
        0
    }

    fn cluster_energy(&self) -> f64 {
        self.energy
    }

    fn set_machine_state(&mut self, machine: MachineId, state: SState) {
        self.calls.push(Call::SetState(machine, state));
        self.machines[machine as usize].pending_state = Some(state);
    }

    fn set_core_performance(&mut self, machine: MachineId, _core: u32, p_state: PState) {
        self.calls.push(Call::SetPerformance(machine, p_state));
        self.machines[machine as usize].p_state = p_state;
    }

    fn create_vm(&mut self, kind: GuestOs, arch: CpuArch) -> VmId {
        let id = self.next_vm;
        self.next_vm += 1;
        self.vms.insert(
            id,
            MockVm {
                kind,
                arch,
                host: None,
                tasks: Vec::new(),
                migrating_to: None,
            },
        );
        self.calls.push(Call::CreateVm(id, kind, arch));
        id
    }

    fn attach_vm(&mut self, vm: VmId, machine: MachineId) -> Result<(), SchedulerError> {
        let machine_record = &self.machines[machine as usize];
        if machine_record.s_state != SState::S0 {
            return Err(SchedulerError::MachineNotActive { machine });
        }
        let record = self.vms.get_mut(&vm).ok_or(SchedulerError::UnknownVm { vm })?;
        if record.arch != machine_record.arch {
            return Err(SchedulerError::ArchMismatch {
                vm,
                vm_arch: record.arch,
                machine,
                machine_arch: machine_record.arch,
            });
        }
        record.host = Some(machine);
        self.calls.push(Call::Attach(vm, machine));
        Ok(())
    }

    fn add_task(&mut self, vm: VmId, task: TaskId, priority: Priority) -> Result<(), SchedulerError> {
        let info = self.tasks.get(&task).unwrap_or_else(|| panic!("unregistered task {}", task));
        let record = self.vms.get_mut(&vm).ok_or(SchedulerError::UnknownVm { vm })?;
        if record.migrating_to.is_some() {
            return Err(SchedulerError::VmMigrating { vm });
        }
        if info.required_kind != record.kind || info.required_arch != record.arch {
            return Err(SchedulerError::IncompatibleTask { task, vm });
        }
        record.tasks.push(task);
        self.calls.push(Call::AddTask(vm, task, priority));
        Ok(())
    }

    fn remove_task(&mut self, vm: VmId, task: TaskId) -> Result<(), SchedulerError> {
        let record = self.vms.get_mut(&vm).ok_or(SchedulerError::UnknownVm { vm })?;
        record.tasks.retain(|t| *t != task);
        self.calls.push(Call::RemoveTask(vm, task));
        Ok(())
    }

    fn migrate_vm(&mut self, vm: VmId, destination: MachineId) {
        self.calls.push(Call::Migrate(vm, destination));
        if let Some(record) = self.vms.get_mut(&vm) {
            record.migrating_to = Some(destination);
        }
    }

    fn shutdown_vm(&mut self, vm: VmId) -> Result<(), SchedulerError> {
        let busy = match self.vms.get(&vm) {
            Some(record) => !record.tasks.is_empty(),
            None => return Err(SchedulerError::UnknownVm { vm }),
        };
        if busy {
            return Err(SchedulerError::VmBusy { vm });
        }
        self.vms.remove(&vm);
        self.calls.push(Call::Shutdown(vm));
        Ok(())
    }

    fn vm_info(&self, vm: VmId) -> VmInfo {
        let record = &self.vms[&vm];
        VmInfo {
            id: vm,
            kind: record.kind,
            arch: record.arch,
            host: record.host,
            active_tasks: record.tasks.clone(),
        }
    }

    fn task_info(&self, task: TaskId) -> TaskInfo {
        self.tasks
            .get(&task)
            .unwrap_or_else(|| panic!("unregistered task {}", task))
            .clone()
    }

    fn set_task_priority(&mut self, task: TaskId, priority: Priority) {
        self.calls.push(Call::SetTaskPriority(task, priority));
    }

    fn sla_report(&self, sla: SlaClass) -> f64 {
        self.sla.get(&sla).copied().unwrap_or(100.)
    }
}

/// Builds a task description; demand follows from instructions over the
/// arrival-to-target window.
#[allow(clippy::too_many_arguments)]
pub fn task_info(
    id: TaskId,
    arch: CpuArch,
    kind: GuestOs,
    sla: SlaClass,
    memory: u64,
    instructions: u64,
    arrival: Time,
    target: Time,
    gpu: bool,
) -> TaskInfo {
    TaskInfo {
        id,
        total_instructions: instructions,
        arrival,
        target_completion: target,
        required_arch: arch,
        required_kind: kind,
        memory,
        gpu_capable: gpu,
        sla,
        kind: TaskKind::Web,
    }
}

/// Checks the cross-component invariants that must hold after every
/// up-call returns.
pub fn assert_invariants(scheduler: &ecosched::core::engine::Scheduler, cloud: &MockCloud) {
    let inventory = scheduler.inventory();
    let accountant = scheduler.accountant();

    for machine in inventory.machines() {
        let tasks = accountant.tasks_on(machine.id);
        let demand: f64 = tasks
            .iter()
            .filter_map(|task| accountant.entry(*task))
            .map(|entry| entry.demand)
            .sum();
        let memory: u64 = tasks
            .iter()
            .filter_map(|task| accountant.entry(*task))
            .map(|entry| entry.memory)
            .sum();
        assert!(
            (machine.committed_mips - demand).abs() < 1e-9,
            "machine {} committed mips {} != task sum {}",
            machine.id,
            machine.committed_mips,
            demand
        );
        assert_eq!(
            machine.committed_memory, memory,
            "machine {} committed memory mismatch",
            machine.id
        );
    }

    for vm in inventory.vms() {
        for task in &vm.tasks {
            let info = &cloud.tasks[task];
            assert_eq!(info.required_kind, vm.kind, "task {} on wrong guest os", task);
            assert_eq!(info.required_arch, vm.arch, "task {} on wrong architecture", task);
            if let Some(host) = vm.host {
                assert_eq!(inventory.machine(host).arch, vm.arch, "vm {} arch differs from host", vm.id);
            }
        }
    }
}
