// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end behaviour against the simulated part

use npu_driver::prelude::*;
use npu_driver::{DeviceConfig, NpuError, SimEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(2);

fn open(sim: &Arc<SimulatedNpu>, cfg: DeviceConfig) -> Device {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Device::new(sim.clone(), cfg).unwrap()
}

fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Task on `[core, core + cnt)` whose trigger address is `base`
fn task_at(id: u32, base: u64, core: u8, cnt: u8) -> Task {
    Task::new(id, CommandBuffer::for_window(base, core, cnt, &[0x40])).with_cores(core, cnt)
}

fn manual(cores: u8) -> Arc<SimulatedNpu> {
    Arc::new(SimulatedNpu::new(cores).with_default_behavior(JobBehavior::Manual))
}

#[test]
fn single_core_tasks_dispatch_in_order() {
    let sim = manual(1);
    let dev = open(&sim, DeviceConfig::default().with_wait_link_depth(1));

    let t1 = dev.submit(task_at(1, 0x1000, 0, 1)).unwrap();
    let t2 = dev.submit(task_at(2, 0x2000, 0, 1)).unwrap();

    assert!(eventually(|| sim.running_addr(0) == Some(0x1000)));
    assert_eq!(dev.status(t1).unwrap(), TaskStatus::InferStart);
    assert_eq!(dev.status(t2).unwrap(), TaskStatus::Ready);
    assert_eq!(dev.query_database().queued(), 1);

    assert!(sim.complete(0));
    dev.wait(t1, WAIT).unwrap();

    assert!(eventually(|| sim.running_addr(0) == Some(0x2000)));
    assert_eq!(dev.status(t2).unwrap(), TaskStatus::InferStart);
    assert!(sim.complete(0));
    dev.wait(t2, WAIT).unwrap();

    let starts: Vec<u64> = sim
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SimEvent::Started(0, addr) => Some(addr),
            _ => None,
        })
        .collect();
    assert_eq!(starts, vec![0x1000, 0x2000]);
}

#[test]
fn auto_schedule_picks_least_loaded_window() {
    let sim = manual(4);
    let cfg = DeviceConfig::default().with_default_exec_estimate(Duration::from_secs(5));
    let dev = open(&sim, cfg);

    let left = dev.submit(task_at(1, 0x1000, 0, 1)).unwrap();
    let right = dev.submit(task_at(2, 0x2000, 3, 1)).unwrap();
    assert!(eventually(|| sim.running_addr(0).is_some() && sim.running_addr(3).is_some()));

    let pair = dev.submit(task_at(3, 0x3000, 0, 2).auto_scheduled()).unwrap();
    assert!(eventually(|| {
        sim.running_addr(1) == Some(0x3000) && sim.running_addr(2) == Some(0x3000)
    }));
    assert_eq!(sim.running_addr(0), Some(0x1000));

    for core in 0..4 {
        assert!(sim.complete(core));
    }
    dev.wait(left, WAIT).unwrap();
    dev.wait(right, WAIT).unwrap();
    dev.wait(pair, WAIT).unwrap();
}

#[test]
fn timeout_recovers_only_the_implicated_unit() {
    let sim = manual(4);
    sim.set_behavior(0x2000, JobBehavior::Hang);
    let dev = open(&sim, DeviceConfig::default());

    let others: Vec<TaskHandle> = [0u8, 1, 3]
        .iter()
        .map(|&c| dev.submit(task_at(10 + u32::from(c), 0x1000 + u64::from(c) * 0x10, c, 1)).unwrap())
        .collect();
    let hung = dev
        .submit(task_at(2, 0x2000, 2, 1).with_timeout(Duration::from_millis(100)))
        .unwrap();
    let behind = dev.submit(task_at(3, 0x2100, 2, 1)).unwrap();
    assert!(eventually(|| dev.status(behind).unwrap() == TaskStatus::InferStart));

    assert_eq!(dev.wait(hung, WAIT), Err(NpuError::Timeout { duration_ms: 100 }));
    assert_eq!(dev.wait(behind, WAIT), Err(NpuError::Recovered));

    for &h in &others {
        assert_eq!(dev.status(h).unwrap(), TaskStatus::InferStart);
    }
    for core in [0u8, 1, 3] {
        assert!(sim.complete(core));
    }
    for h in others {
        dev.wait(h, WAIT).unwrap();
    }

    let db = dev.query_database();
    assert_eq!(db.counters.recoveries, 1);
    assert_eq!(db.counters.timed_out, 1);
    assert_eq!(db.counters.recovered, 1);
    assert_eq!(db.failed_mask(), 0);

    // The unit is usable again.
    let again = dev.submit(task_at(4, 0x2200, 2, 1)).unwrap();
    assert!(eventually(|| sim.running_addr(2) == Some(0x2200)));
    assert!(sim.complete(2));
    dev.wait(again, WAIT).unwrap();
}

#[test]
fn task_deadline_fires_while_power_timers_are_long() {
    let sim = manual(2);
    sim.set_behavior(0x1000, JobBehavior::Hang);
    let cfg = DeviceConfig::default()
        .with_power_timeouts(Duration::from_secs(60), Duration::from_secs(60));
    let dev = open(&sim, cfg);

    let started = Instant::now();
    let t = dev
        .submit(task_at(1, 0x1000, 0, 1).with_timeout(Duration::from_millis(50)))
        .unwrap();
    assert_eq!(dev.wait(t, WAIT), Err(NpuError::Timeout { duration_ms: 50 }));
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(500), "recovered after {elapsed:?}");
    assert!(eventually(|| dev.query_database().counters.recoveries == 1));
}

#[test]
fn recovery_leaves_neighbouring_cores_alone() {
    let sim = manual(4);
    sim.set_behavior(0x2000, JobBehavior::Hang);
    let dev = open(&sim, DeviceConfig::default());

    let a = dev.submit(task_at(1, 0x1000, 1, 1)).unwrap();
    let b = dev
        .submit(task_at(2, 0x2000, 2, 1).with_timeout(Duration::from_millis(200)))
        .unwrap();
    assert!(eventually(|| {
        sim.running_addr(1) == Some(0x1000) && sim.running_addr(2) == Some(0x2000)
    }));
    // Two cores, queued behind A on core 1 and behind B on core 2.
    let c = dev.submit(task_at(3, 0x3000, 1, 2)).unwrap();
    assert!(eventually(|| dev.status(c).unwrap() == TaskStatus::InferStart));

    assert_eq!(dev.wait(b, WAIT), Err(NpuError::Timeout { duration_ms: 200 }));
    assert_eq!(dev.wait(c, WAIT), Err(NpuError::Recovered));
    assert_eq!(dev.status(a).unwrap(), TaskStatus::InferStart);
    let resets = |core| {
        sim.events()
            .iter()
            .filter(|e| **e == SimEvent::Reset(core))
            .count()
    };
    assert_eq!(resets(1), 1);
    assert_eq!(resets(2), 2);

    assert!(sim.complete(1));
    dev.wait(a, WAIT).unwrap();
    // C's entry on core 1 still drains; its result is dropped.
    assert!(eventually(|| sim.running_addr(1) == Some(0x3000)));
    assert!(sim.complete(1));
    assert!(eventually(|| dev.query_database().in_flight() == 0));

    let db = dev.query_database();
    assert_eq!(db.counters.recoveries, 1);
    assert_eq!(db.counters.completed, 1);
    assert_eq!(db.counters.recovered, 1);
}

#[test]
fn power_follows_run_end_and_idle_timer() {
    let sim = manual(1);
    let cfg = DeviceConfig::default()
        .with_power_timeouts(Duration::from_millis(50), Duration::from_secs(60));
    let dev = open(&sim, cfg);
    assert_eq!(dev.power_state(0).unwrap(), PowerState::Idle);

    let t = dev.submit(task_at(1, 0x1000, 0, 1)).unwrap();
    assert!(eventually(|| dev.power_state(0).unwrap() == PowerState::Run));
    assert!(sim.is_clocked(0));

    assert!(sim.complete(0));
    dev.wait(t, WAIT).unwrap();
    assert!(eventually(|| dev.power_state(0).unwrap() == PowerState::Ready));
    assert!(eventually(|| dev.power_state(0).unwrap() == PowerState::Idle));
    assert!(!sim.is_clocked(0));
    assert!(sim.is_powered(0));
}

#[test]
fn clock_stays_on_when_suspend_disabled() {
    let sim = manual(1);
    let cfg = DeviceConfig::default()
        .with_power_timeouts(Duration::from_millis(10), Duration::from_secs(60))
        .with_disable_clock_suspend(true);
    let dev = open(&sim, cfg);

    let t = dev.submit(task_at(1, 0x1000, 0, 1)).unwrap();
    assert!(eventually(|| sim.running_addr(0).is_some()));
    assert!(sim.complete(0));
    dev.wait(t, WAIT).unwrap();
    assert!(eventually(|| dev.power_state(0).unwrap() == PowerState::Ready));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(dev.power_state(0).unwrap(), PowerState::Ready);
}

#[test]
fn cancel_queued_and_finished_tasks() {
    let sim = manual(1);
    let dev = open(&sim, DeviceConfig::default().with_wait_link_depth(1));

    let running = dev.submit(task_at(1, 0x1000, 0, 1)).unwrap();
    let queued = dev.submit(task_at(2, 0x2000, 0, 1)).unwrap();
    assert!(eventually(|| sim.running_addr(0) == Some(0x1000)));

    dev.cancel(queued).unwrap();
    // Retired by the cancel: further cancels are no-ops, waits see a stale handle.
    dev.cancel(queued).unwrap();
    assert!(matches!(
        dev.wait(queued, WAIT),
        Err(NpuError::InvalidHandle { .. })
    ));
    assert!(matches!(dev.status(queued), Err(NpuError::InvalidHandle { .. })));

    // Finished but not yet waited: cancel leaves the outcome alone.
    assert!(sim.complete(0));
    assert!(eventually(|| dev.status(running).unwrap() == TaskStatus::InferEnd));
    dev.cancel(running).unwrap();
    dev.wait(running, WAIT).unwrap();
    assert_eq!(dev.query_database().counters.canceled, 1);
}

#[test]
fn cancel_frees_the_slot() {
    let sim = manual(1);
    let cfg = DeviceConfig::default()
        .with_wait_link_depth(1)
        .with_slot_capacity(2, 2)
        .with_allow_expand(false);
    let dev = open(&sim, cfg);

    let running = dev.submit(task_at(1, 0x1000, 0, 1)).unwrap();
    let queued = dev.submit(task_at(2, 0x2000, 0, 1)).unwrap();
    assert!(eventually(|| sim.running_addr(0) == Some(0x1000)));
    assert!(dev.submit(task_at(3, 0x3000, 0, 1)).unwrap_err().is_retryable());

    dev.cancel(queued).unwrap();
    assert_eq!(dev.query_database().slots.len, 1);
    let next = dev.submit(task_at(3, 0x3000, 0, 1)).unwrap();

    assert!(sim.complete(0));
    dev.wait(running, WAIT).unwrap();
    assert!(eventually(|| sim.running_addr(0) == Some(0x3000)));
    assert!(sim.complete(0));
    dev.wait(next, WAIT).unwrap();
    assert!(eventually(|| dev.query_database().slots.len == 0));
}

#[test]
fn cancel_behind_the_head_needs_no_recovery() {
    let sim = manual(4);
    let dev = open(&sim, DeviceConfig::default().with_wait_link_depth(2));

    let head = dev.submit(task_at(1, 0x1000, 0, 1)).unwrap();
    let second = dev.submit(task_at(2, 0x2000, 0, 1)).unwrap();
    assert!(eventually(|| dev.status(second).unwrap() == TaskStatus::InferStart));
    assert!(eventually(|| sim.running_addr(0) == Some(0x1000)));

    let started = Instant::now();
    dev.cancel(second).unwrap();
    assert!(started.elapsed() < dev.config().sw_cancel_cap);
    assert!(matches!(
        dev.wait(second, WAIT),
        Err(NpuError::InvalidHandle { .. })
    ));
    assert!(!sim.events().contains(&SimEvent::Cancel(0)));
    assert_eq!(dev.status(head).unwrap(), TaskStatus::InferStart);

    assert!(sim.complete(0));
    dev.wait(head, WAIT).unwrap();
    // The hardware still runs the dropped entry; its result is discarded.
    assert!(eventually(|| sim.running_addr(0) == Some(0x2000)));
    assert!(sim.complete(0));
    assert!(eventually(|| dev.query_database().in_flight() == 0));

    let db = dev.query_database();
    assert_eq!(db.counters.canceled, 1);
    assert_eq!(db.counters.completed, 1);
    assert_eq!(db.counters.recoveries, 0);
}

#[test]
fn cancel_running_task_with_job_cancel() {
    let sim = Arc::new(
        SimulatedNpu::new(4)
            .with_job_cancel(true)
            .with_default_behavior(JobBehavior::Hang),
    );
    let dev = open(&sim, DeviceConfig::default());

    let t = dev.submit(task_at(1, 0x1000, 1, 1)).unwrap();
    assert!(eventually(|| sim.running_addr(1).is_some()));
    dev.cancel(t).unwrap();
    assert!(matches!(dev.wait(t, WAIT), Err(NpuError::InvalidHandle { .. })));
    assert!(sim.events().contains(&SimEvent::Cancel(1)));
    assert!(eventually(|| dev.query_database().slots.len == 0));
    let db = dev.query_database();
    assert_eq!(db.counters.canceled, 1);
    assert_eq!(db.counters.recoveries, 0);
}

#[test]
fn software_cancel_is_bounded_by_cap() {
    let sim = Arc::new(
        SimulatedNpu::new(2)
            .with_job_cancel(false)
            .with_default_behavior(JobBehavior::Hang),
    );
    let cfg = DeviceConfig::default().with_sw_cancel_cap(Duration::from_millis(30));
    let dev = open(&sim, cfg);

    let t = dev.submit(task_at(1, 0x1000, 0, 1)).unwrap();
    assert!(eventually(|| sim.running_addr(0).is_some()));

    let started = Instant::now();
    dev.cancel(t).unwrap();
    assert!(started.elapsed() < WAIT);
    assert!(matches!(dev.wait(t, WAIT), Err(NpuError::InvalidHandle { .. })));
    assert!(eventually(|| dev.query_database().counters.recovered == 1));
    // Bring-up resets both cores once; recovery resets only core 0.
    let resets = |core| {
        sim.events()
            .iter()
            .filter(|e| **e == SimEvent::Reset(core))
            .count()
    };
    assert_eq!(resets(0), 2);
    assert_eq!(resets(1), 1);
}

#[test]
fn fault_reports_core_and_recovers() {
    let sim = manual(2);
    sim.set_behavior(0x1000, JobBehavior::Fault(npu_chip::regs::status::FAULT_BUS));
    let dev = open(&sim, DeviceConfig::default());

    let t = dev.submit(task_at(1, 0x1000, 0, 1)).unwrap();
    match dev.wait(t, WAIT) {
        Err(NpuError::Fault { core, status }) => {
            assert_eq!(core, 0);
            assert_ne!(status & npu_chip::regs::status::FAULT_BUS, 0);
        }
        other => panic!("expected fault, got {other:?}"),
    }
    assert!(eventually(|| dev.query_database().counters.recoveries == 1));
    assert_eq!(dev.query_database().counters.faulted, 1);
}

#[test]
fn multi_core_task_retires_on_primary() {
    let sim = manual(4);
    let dev = open(&sim, DeviceConfig::default());

    let t = dev.submit(task_at(1, 0x1000, 2, 2)).unwrap();
    assert!(eventually(|| {
        sim.running_addr(2) == Some(0x1000) && sim.running_addr(3) == Some(0x1000)
    }));
    assert!(sim.complete(3));
    assert!(sim.complete(2));
    dev.wait(t, WAIT).unwrap();
    assert!(eventually(|| dev.query_database().in_flight() == 0));
}

#[test]
fn core_index_round_trips_without_auto_schedule() {
    let sim = manual(4);
    let dev = open(&sim, DeviceConfig::default());
    let t = dev.submit(task_at(7, 0x7000, 3, 1)).unwrap();
    assert!(eventually(|| sim.running_addr(3) == Some(0x7000)));
    assert_eq!(t.task_id(), 7);
    assert!(sim.complete(3));
    dev.wait(t, WAIT).unwrap();
}

#[test]
fn duplicate_key_rejected_while_in_flight() {
    let sim = manual(1);
    let dev = open(&sim, DeviceConfig::default());
    let t = dev.submit(task_at(1, 0x1000, 0, 1)).unwrap();
    assert!(matches!(
        dev.submit(task_at(1, 0x1000, 0, 1)),
        Err(NpuError::AlreadyExists { .. })
    ));
    assert!(eventually(|| sim.running_addr(0).is_some()));
    assert!(sim.complete(0));
    dev.wait(t, WAIT).unwrap();
    // Retired: the key is free again.
    let again = dev.submit(task_at(1, 0x1000, 0, 1)).unwrap();
    assert!(eventually(|| sim.running_addr(0).is_some()));
    assert!(sim.complete(0));
    dev.wait(again, WAIT).unwrap();
}

#[test]
fn wait_timeout_leaves_task_in_flight() {
    let sim = manual(1);
    let dev = open(&sim, DeviceConfig::default());
    let t = dev.submit(task_at(1, 0x1000, 0, 1)).unwrap();
    assert_eq!(
        dev.wait(t, Duration::from_millis(10)),
        Err(NpuError::WaitTimeout { duration_ms: 10 })
    );
    assert!(eventually(|| sim.running_addr(0).is_some()));
    assert_eq!(dev.status(t).unwrap(), TaskStatus::InferStart);
    assert!(sim.complete(0));
    dev.wait(t, WAIT).unwrap();
}

#[test]
fn suspend_holds_dispatch_until_resume() {
    let sim = Arc::new(SimulatedNpu::new(1));
    let dev = open(&sim, DeviceConfig::default());
    dev.suspend().unwrap();
    assert!(dev.query_database().suspended);

    let t = dev.submit(task_at(1, 0x1000, 0, 1)).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(dev.status(t).unwrap(), TaskStatus::Ready);

    dev.resume().unwrap();
    dev.wait(t, WAIT).unwrap();
}

#[test]
fn power_event_refused_while_busy() {
    let sim = manual(1);
    let dev = open(&sim, DeviceConfig::default());
    let t = dev.submit(task_at(1, 0x1000, 0, 1)).unwrap();
    assert!(eventually(|| sim.running_addr(0).is_some()));
    assert!(matches!(
        dev.power_event(0, PowerEvent::ForceOff),
        Err(NpuError::InvalidState { .. })
    ));
    assert!(matches!(
        dev.power_event(9, PowerEvent::On),
        Err(NpuError::InvalidArgument { .. })
    ));
    assert!(sim.complete(0));
    dev.wait(t, WAIT).unwrap();
}

#[test]
fn shutdown_cancels_queued_work_and_powers_off() {
    let sim = manual(1);
    let cfg = DeviceConfig::default()
        .with_wait_link_depth(1)
        .with_sw_cancel_cap(Duration::from_millis(20));
    let dev = open(&sim, cfg);
    let _running = dev.submit(task_at(1, 0x1000, 0, 1)).unwrap();
    let queued = dev.submit(task_at(2, 0x2000, 0, 1)).unwrap();
    assert!(eventually(|| sim.running_addr(0).is_some()));

    dev.shutdown();
    assert_eq!(dev.wait(queued, WAIT), Err(NpuError::Canceled));
    assert!(!sim.is_powered(0));
    assert!(matches!(
        dev.submit(task_at(3, 0x3000, 0, 1)),
        Err(NpuError::ShuttingDown)
    ));
    dev.shutdown();
}

#[test]
fn failed_bring_up_is_an_error() {
    let sim = Arc::new(SimulatedNpu::new(2));
    sim.stick_after_reset(1, true);
    let err = Device::new(sim.clone(), DeviceConfig::default()).unwrap_err();
    assert!(matches!(err, NpuError::Io { core: 1, .. }));
    assert!(!sim.is_powered(0));
}
