//! Multi-host-thread scheduling scenarios: every guest thread is backed by a
//! real `std::thread` blocking inside the scheduler.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use vega_kernel::{
    CoreMask, FlatMemory, Kernel, KernelConfig, Process, Tcb, ThreadHandle, ThreadSpawn,
    ThreadState,
};

fn fixture(config: KernelConfig) -> (Arc<Kernel>, Arc<Process>) {
    let kernel = Kernel::new(config).expect("valid config");
    let process = Arc::new(Process::new(
        Arc::clone(&kernel),
        Arc::new(FlatMemory::new(0, 0x1000)),
    ));
    (kernel, process)
}

fn spawn_tcb(process: &Process, priority: u8, core: u8, affinity: CoreMask) -> Arc<Tcb> {
    process
        .create_thread(ThreadSpawn {
            entry_point: 0x8000,
            entry_arg: 0,
            stack_top: 0x10_0000,
            priority,
            ideal_core: core,
            affinity,
        })
        .expect("valid spawn")
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn threads_are_scheduled_in_priority_then_arrival_order() {
    let (kernel, process) = fixture(KernelConfig::default());
    let gate = spawn_tcb(&process, 0, 0, CoreMask::single(0));
    kernel.insert_thread(&gate);

    let a = spawn_tcb(&process, 10, 0, CoreMask::single(0));
    let b = spawn_tcb(&process, 5, 0, CoreMask::single(0));
    let c = spawn_tcb(&process, 5, 0, CoreMask::single(0));
    kernel.insert_thread(&a);
    kernel.insert_thread(&b);
    kernel.insert_thread(&c);
    assert_eq!(
        kernel.queue_order(0),
        vec![gate.handle, b.handle, c.handle, a.handle]
    );

    let log: Arc<Mutex<Vec<ThreadHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let workers: Vec<_> = [&a, &b, &c]
        .into_iter()
        .map(|tcb| {
            let kernel = Arc::clone(&kernel);
            let tcb = Arc::clone(tcb);
            let log = Arc::clone(&log);
            thread::spawn(move || {
                kernel.begin_context(&tcb);
                if kernel.wait_schedule(&tcb, false) {
                    log.lock().unwrap().push(tcb.handle);
                    kernel.remove_thread(&tcb);
                }
            })
        })
        .collect();

    // Opening the gate cascades through the queue in order.
    kernel.remove_thread(&gate);
    for worker in workers {
        worker.join().expect("worker finished");
    }
    assert_eq!(*log.lock().unwrap(), vec![b.handle, c.handle, a.handle]);
}

#[test]
fn timed_wait_schedule_reports_timeout_then_success() {
    let (kernel, process) = fixture(KernelConfig::default());
    let gate = spawn_tcb(&process, 0, 0, CoreMask::single(0));
    let thread = spawn_tcb(&process, 10, 0, CoreMask::single(0));
    kernel.insert_thread(&gate);
    kernel.insert_thread(&thread);

    assert!(!kernel.timed_wait_schedule(&thread, Duration::from_millis(50)));

    kernel.remove_thread(&gate);
    assert!(kernel.timed_wait_schedule(&thread, Duration::from_millis(50)));
    assert_eq!(thread.state(), ThreadState::Running);
}

#[test]
fn kill_unblocks_a_scheduler_wait() {
    let (kernel, process) = fixture(KernelConfig::default());
    let gate = spawn_tcb(&process, 0, 0, CoreMask::single(0));
    let victim = spawn_tcb(&process, 10, 0, CoreMask::single(0));
    kernel.insert_thread(&gate);
    kernel.insert_thread(&victim);

    let worker = {
        let kernel = Arc::clone(&kernel);
        let victim = Arc::clone(&victim);
        thread::spawn(move || kernel.wait_schedule(&victim, false))
    };

    assert!(wait_until(Duration::from_secs(1), || {
        victim.state() == ThreadState::Ready
    }));
    thread::sleep(Duration::from_millis(20));
    process.kill_thread(victim.handle).expect("known handle");

    assert!(!worker.join().expect("worker finished"));
    assert_eq!(victim.state(), ThreadState::Killed);
    assert_eq!(kernel.queue_order(0), vec![gate.handle]);
}

#[test]
fn blocked_thread_load_balances_to_an_idle_core() {
    let mut config = KernelConfig::default();
    config.preempt_quantum = Duration::from_millis(5);
    let (kernel, process) = fixture(config);

    let gate = spawn_tcb(&process, 0, 0, CoreMask::single(0));
    kernel.insert_thread(&gate);
    let migrant = spawn_tcb(&process, 10, 0, CoreMask(0b0011));
    kernel.insert_thread(&migrant);

    let worker = {
        let kernel = Arc::clone(&kernel);
        let migrant = Arc::clone(&migrant);
        thread::spawn(move || kernel.wait_schedule(&migrant, true))
    };

    // The escalating wait expires, a balancing pass finds core 1 idle, and
    // the thread schedules there without anyone releasing core 0.
    assert!(worker.join().expect("worker finished"));
    assert_eq!(migrant.core_id(), 1);
    assert_eq!(kernel.queue_order(1), vec![migrant.handle]);
    assert_eq!(kernel.queue_order(0), vec![gate.handle]);
}

#[test]
fn deferred_interrupt_surfaces_when_context_is_established() {
    let (kernel, process) = fixture(KernelConfig::default());
    let early = spawn_tcb(&process, 20, 0, CoreMask::single(0));
    kernel.insert_thread(&early);

    // The displacing insert fires before `early`'s host thread is ready.
    let usurper = spawn_tcb(&process, 5, 0, CoreMask::single(0));
    kernel.insert_thread(&usurper);

    assert!(kernel.begin_context(&early));
    assert!(early.pending_yield.load(std::sync::atomic::Ordering::Acquire));
}

#[test]
fn park_until_a_weaker_thread_offers_its_core() {
    let (kernel, process) = fixture(KernelConfig::default());
    let runner = spawn_tcb(&process, 20, 2, CoreMask::single(2));
    kernel.insert_thread(&runner);

    let parked = spawn_tcb(&process, 5, 0, CoreMask::all(4));
    let worker = {
        let kernel = Arc::clone(&kernel);
        let parked = Arc::clone(&parked);
        thread::spawn(move || kernel.park_thread(&parked))
    };

    assert!(wait_until(Duration::from_secs(1), || {
        parked.parked.load(std::sync::atomic::Ordering::Acquire)
    }));
    kernel.wake_parked_thread(&runner);

    assert!(worker.join().expect("worker finished"));
    assert_eq!(parked.core_id(), 2);
    // The woken thread outranks the runner and takes the head; the runner is
    // told to yield.
    assert_eq!(kernel.queue_order(2), vec![parked.handle, runner.handle]);
    assert!(runner.pending_yield.load(std::sync::atomic::Ordering::Acquire));
}

#[test]
fn kill_unblocks_a_parked_thread() {
    let (kernel, process) = fixture(KernelConfig::default());
    let parked = spawn_tcb(&process, 5, 0, CoreMask::all(4));
    let worker = {
        let kernel = Arc::clone(&kernel);
        let parked = Arc::clone(&parked);
        thread::spawn(move || kernel.park_thread(&parked))
    };

    assert!(wait_until(Duration::from_secs(1), || {
        parked.parked.load(std::sync::atomic::Ordering::Acquire)
    }));
    process.kill_thread(parked.handle).expect("known handle");

    assert!(!worker.join().expect("worker finished"));
    assert_eq!(parked.state(), ThreadState::Killed);
}
