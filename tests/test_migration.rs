mod common;

use ecosched::core::config::SchedulerConfig;
use ecosched::core::engine::Scheduler;
use ecosched::core::types::{CpuArch, GuestOs, Priority, SState, SlaClass};

use common::{assert_invariants, task_info, Call, MockCloud};

fn scheduler() -> Scheduler {
    Scheduler::new(SchedulerConfig::default())
}

fn two_small_machines(cloud: &mut MockCloud) {
    cloud.add_machine(CpuArch::X86, 1, 8192, false, SState::S0);
    cloud.add_machine(CpuArch::X86, 1, 8192, false, SState::S0);
    cloud.with_mips(0, vec![1000, 800, 600, 400]);
    cloud.with_mips(1, vec![1000, 800, 600, 400]);
}

#[test]
// An overloaded machine sheds its heaviest guest to the emptiest compatible
// machine; the committed load moves with the migration start, the host
// binding only with the completion. Cluster-wide load is conserved and the
// VM never has two migrations in flight.
fn test_overload_triggers_migration() {
    let mut cloud = MockCloud::new();
    two_small_machines(&mut cloud);
    let mut sched = scheduler();
    sched.init(&mut cloud);

    cloud.register_task(task_info(
        1,
        CpuArch::X86,
        GuestOs::Linux,
        SlaClass::Sla0,
        100,
        920_000_000,
        0,
        1_000_000,
        false,
    ));
    cloud.register_task(task_info(
        2,
        CpuArch::X86,
        GuestOs::Linux,
        SlaClass::Sla3,
        10,
        10_000_000,
        0,
        1_000_000,
        false,
    ));
    sched.on_new_task(0, 1, &mut cloud);
    sched.on_new_task(100, 2, &mut cloud);

    let before: f64 = sched.inventory().machines().map(|m| m.committed_mips).sum();

    sched.on_scheduler_check(1_000_000, &mut cloud);

    let migrated = cloud
        .calls
        .iter()
        .find_map(|c| match c {
            Call::Migrate(vm, dst) => Some((*vm, *dst)),
            _ => None,
        })
        .expect("a migration should have started");
    assert_eq!(migrated.1, 1);
    assert!(sched.inventory().vm(migrated.0).migrating);
    assert_eq!(sched.migrations().in_flight_count(), 1);

    // Load already transferred, host binding not yet.
    assert_eq!(sched.inventory().machine(0).committed_mips, 0.);
    assert_eq!(sched.accountant().host_of(1), Some(1));
    assert!(sched.inventory().machine(0).vms.contains(&migrated.0));
    let after: f64 = sched.inventory().machines().map(|m| m.committed_mips).sum();
    assert!((before - after).abs() < 1e-9);

    cloud.complete_migration(migrated.0);
    sched.on_migration_done(1_200_000, migrated.0, &mut cloud);
    assert!(!sched.inventory().vm(migrated.0).migrating);
    assert_eq!(sched.inventory().vm(migrated.0).host, Some(1));
    assert_eq!(sched.migrations().in_flight_count(), 0);
    assert_invariants(&sched, &cloud);

    // The drained source powers off on the next check; machine 1 stays hot
    // and cannot shed anywhere, so no further migration starts.
    sched.on_scheduler_check(2_000_000, &mut cloud);
    assert_eq!(cloud.count_calls(|c| matches!(c, Call::SetState(0, SState::S5))), 1);
    assert_eq!(cloud.count_calls(|c| matches!(c, Call::Migrate(..))), 1);
}

#[test]
// An SLA warning escalates the task to High priority and treats its machine
// as overloaded even below the overload threshold.
fn test_sla_warning_reaction() {
    let mut cloud = MockCloud::new();
    two_small_machines(&mut cloud);
    let mut sched = scheduler();
    sched.init(&mut cloud);

    cloud.register_task(task_info(
        1,
        CpuArch::X86,
        GuestOs::Linux,
        SlaClass::Sla2,
        100,
        400_000_000,
        0,
        1_000_000,
        false,
    ));
    cloud.register_task(task_info(
        2,
        CpuArch::X86,
        GuestOs::Linux,
        SlaClass::Sla3,
        10,
        10_000_000,
        0,
        1_000_000,
        false,
    ));
    sched.on_new_task(0, 1, &mut cloud);
    sched.on_new_task(100, 2, &mut cloud);
    assert_eq!(sched.accountant().entry(1).unwrap().priority, Priority::Low);

    sched.on_sla_warning(500_000, 1, &mut cloud);

    assert_eq!(
        cloud.count_calls(|c| matches!(c, Call::SetTaskPriority(1, Priority::High))),
        1
    );
    assert_eq!(sched.accountant().entry(1).unwrap().priority, Priority::High);
    assert_eq!(cloud.count_calls(|c| matches!(c, Call::Migrate(_, 1))), 1);
    assert_invariants(&sched, &cloud);
}

#[test]
// A memory warning migrates a memory-heavy guest to a machine with room.
fn test_memory_warning_reaction() {
    let mut cloud = MockCloud::new();
    cloud.add_machine(CpuArch::X86, 4, 4000, false, SState::S0);
    cloud.add_machine(CpuArch::X86, 4, 10000, false, SState::S0);
    let mut sched = scheduler();
    sched.init(&mut cloud);

    cloud.register_task(task_info(
        1,
        CpuArch::X86,
        GuestOs::Linux,
        SlaClass::Sla1,
        3000,
        1_000_000,
        0,
        1_000_000,
        false,
    ));
    sched.on_new_task(0, 1, &mut cloud);
    assert_eq!(sched.accountant().host_of(1), Some(0));

    sched.on_memory_warning(100_000, 0, &mut cloud);

    let migrated = cloud
        .calls
        .iter()
        .find_map(|c| match c {
            Call::Migrate(vm, dst) => Some((*vm, *dst)),
            _ => None,
        })
        .expect("memory pressure should trigger a migration");
    assert_eq!(migrated.1, 1);
    assert_eq!(sched.accountant().host_of(1), Some(1));
    assert_invariants(&sched, &cloud);
}

#[test]
// Without a compatible destination nothing moves; the warning is absorbed.
fn test_no_destination_no_migration() {
    let mut cloud = MockCloud::new();
    cloud.add_machine(CpuArch::X86, 1, 8192, false, SState::S0);
    cloud.with_mips(0, vec![1000, 800, 600, 400]);
    let mut sched = scheduler();
    sched.init(&mut cloud);

    cloud.register_task(task_info(
        1,
        CpuArch::X86,
        GuestOs::Linux,
        SlaClass::Sla0,
        100,
        950_000_000,
        0,
        1_000_000,
        false,
    ));
    sched.on_new_task(0, 1, &mut cloud);

    sched.on_scheduler_check(1_000_000, &mut cloud);
    sched.on_sla_warning(1_100_000, 1, &mut cloud);

    assert_eq!(cloud.count_calls(|c| matches!(c, Call::Migrate(..))), 0);
    assert_eq!(sched.accountant().host_of(1), Some(0));
    assert_invariants(&sched, &cloud);
}
