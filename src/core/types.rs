//! Identifiers, enumerations and state snapshots shared across the engine.

use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Stable identifier of a physical machine.
pub type MachineId = u32;
/// Stable identifier of a virtual machine.
pub type VmId = u32;
/// Stable identifier of a task.
pub type TaskId = u32;
/// Simulation time in microseconds.
pub type Time = u64;

/// CPU architecture of a machine, VM or task requirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CpuArch {
    X86,
    Arm,
    Riscv,
    Power,
}

/// Guest operating system hosted by a VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum GuestOs {
    Linux,
    LinuxRt,
    Win,
    Aix,
}

impl GuestOs {
    /// Fixed guest/host compatibility matrix: AIX runs only on POWER, WIN on
    /// X86 and ARM, LINUX and LINUX_RT everywhere.
    pub fn runs_on(&self, arch: CpuArch) -> bool {
        match self {
            GuestOs::Aix => arch == CpuArch::Power,
            GuestOs::Win => arch == CpuArch::X86 || arch == CpuArch::Arm,
            GuestOs::Linux | GuestOs::LinuxRt => true,
        }
    }
}

/// Service-level agreement class of a task.
///
/// The class fixes the fraction of tasks that must complete on time:
/// SLA0 95%, SLA1 90%, SLA2 80%, SLA3 best effort.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SlaClass {
    Sla0,
    Sla1,
    Sla2,
    Sla3,
}

/// Task scheduling priority, derived from the SLA class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
pub enum Priority {
    High,
    Mid,
    Low,
}

impl From<SlaClass> for Priority {
    fn from(sla: SlaClass) -> Self {
        match sla {
            SlaClass::Sla0 => Priority::High,
            SlaClass::Sla1 => Priority::Mid,
            SlaClass::Sla2 | SlaClass::Sla3 => Priority::Low,
        }
    }
}

/// Whole-machine power state.
///
/// S0 is the only state in which tasks execute. The policy drives the
/// S0 <-> S3 <-> S5 subset; the remaining states exist for completeness of
/// the machine description.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
pub enum SState {
    S0,
    S0i1,
    S1,
    S2,
    S3,
    S4,
    S5,
}

impl SState {
    /// True for every state except the active one.
    pub fn is_sleep(&self) -> bool {
        *self != SState::S0
    }
}

/// Per-core performance state, uniform across all cores of a machine.
/// P0 is the fastest, P3 the slowest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
pub enum PState {
    P0,
    P1,
    P2,
    P3,
}

impl PState {
    /// Index into the per-P-state MIPS rating vector.
    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// Workload family of a task, as declared in the trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    Web,
    Crypto,
    Hpc,
    Stream,
    Ai,
}

/// Snapshot of machine state as reported by the simulator.
#[derive(Clone, Debug, Serialize)]
pub struct MachineInfo {
    pub id: MachineId,
    pub arch: CpuArch,
    pub cores: u32,
    pub memory_total: u64,
    pub memory_used: u64,
    pub has_gpu: bool,
    /// Per-core MIPS rating indexed by P-state.
    pub mips: Vec<u32>,
    /// Power draw per S-state.
    pub s_state_power: Vec<u64>,
    pub s_state: SState,
    pub p_state: PState,
    pub active_tasks: u32,
    pub active_vms: u32,
}

/// Snapshot of VM state as reported by the simulator.
#[derive(Clone, Debug, Serialize)]
pub struct VmInfo {
    pub id: VmId,
    pub kind: GuestOs,
    pub arch: CpuArch,
    pub host: Option<MachineId>,
    pub active_tasks: Vec<TaskId>,
}

/// Read-only task attributes, fixed at arrival.
#[derive(Clone, Debug, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub total_instructions: u64,
    pub arrival: Time,
    pub target_completion: Time,
    pub required_arch: CpuArch,
    pub required_kind: GuestOs,
    pub memory: u64,
    pub gpu_capable: bool,
    pub sla: SlaClass,
    pub kind: TaskKind,
}
