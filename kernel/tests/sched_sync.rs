//! Scheduler scenarios driven through the interrupt-frame interface, the
//! way the timer and yield vectors drive it on hardware.

use std::sync::Once;

use aasvogel_kernel::arch::x86::context::InterruptFrame;
use aasvogel_kernel::mm::testhost;
use aasvogel_kernel::sched::{self, testhook, ThreadStatus};

static SCHED_INIT: Once = Once::new();

fn setup() -> std::sync::MutexGuard<'static, ()> {
    let guard = testhost::boot(&[]);
    SCHED_INIT.call_once(sched::init);
    testhook::set_current(Some(testhook::boot_thread()));
    testhook::defer_preemption();
    guard
}

fn frame() -> InterruptFrame {
    InterruptFrame {
        esp: 0xdead_0000,
        ..InterruptFrame::default()
    }
}

extern "C" fn noop_entry(_arg: usize) {}

fn park_on_boot() {
    let mut regs = frame();
    let mut spins = 0;
    while sched::current_thread() != Some(testhook::boot_thread()) {
        sched::switch_any(&mut regs);
        spins += 1;
        assert!(spins < 64, "boot thread never came back around");
    }
}

#[test]
fn round_robin_alternates_between_processes() {
    let _g = setup();

    let p2 = sched::process_create("worker").expect("process creation should succeed");
    let t1 = sched::thread_create(p2, noop_entry, 1).expect("thread creation should succeed");
    let t2 = sched::thread_create(p2, noop_entry, 2).expect("thread creation should succeed");

    let boot_tid = unsafe { testhook::boot_thread().as_ref() }.tid();
    let (tid1, tid2) = unsafe { (t1.as_ref().tid(), t2.as_ref().tid()) };

    let mut regs = frame();
    let mut seen = Vec::new();
    for _ in 0..6 {
        sched::switch_any(&mut regs);
        seen.push(unsafe { sched::current_thread().unwrap().as_ref() }.tid());
    }

    // The process rotation interleaves the kernel process's boot thread
    // with the worker's threads, and the worker's own queue alternates.
    assert_eq!(seen, [tid1, boot_tid, tid2, boot_tid, tid1, boot_tid]);

    park_on_boot();
    sched::process_destroy(p2);
}

#[test]
fn timer_preempts_when_the_quantum_expires() {
    let _g = setup();

    let p2 = sched::process_create("spinner").expect("process creation should succeed");
    let _t = sched::thread_create(p2, noop_entry, 0).expect("thread creation should succeed");

    // A fresh quantum: the first nine ticks change nothing, the tenth
    // forces a switch.
    let mut regs = frame();
    sched::switch_any(&mut regs); // resets the preemption counter
    let running = sched::current_thread();

    for _ in 0..sched::TICKS_BEFORE_PREEMPT - 1 {
        let mut regs = frame();
        sched::timer_tick(&mut regs);
        assert_eq!(sched::current_thread(), running);
    }
    let mut regs = frame();
    sched::timer_tick(&mut regs);
    assert_ne!(sched::current_thread(), running);

    park_on_boot();
    sched::process_destroy(p2);
}

#[test]
fn sleep_parks_until_the_deadline_passes() {
    let _g = setup();

    let kproc = sched::current_process().expect("kernel process must exist");
    let sleeper = sched::thread_create(kproc, noop_entry, 0).expect("thread creation should succeed");
    aasvogel_kernel::sched::queue::force_dequeue(sleeper);

    testhook::set_current(Some(sleeper));
    let start = sched::ticks();
    sched::sleep(12); // three 4 ms ticks

    let s = unsafe { sleeper.as_ref() };
    assert_eq!(s.status(), ThreadStatus::Sleeping);
    assert_eq!(s.wake_time(), start + 3);

    testhook::set_current(Some(testhook::boot_thread()));
    for _ in 0..2 {
        testhook::defer_preemption();
        let mut regs = frame();
        sched::timer_tick(&mut regs);
        assert_eq!(s.status(), ThreadStatus::Sleeping);
    }
    testhook::defer_preemption();
    let mut regs = frame();
    sched::timer_tick(&mut regs);
    assert_eq!(s.status(), ThreadStatus::Ready);

    sched::thread_destroy(sleeper);
}

#[test]
fn sleep_zero_requeues_and_keeps_running_state_sane() {
    let _g = setup();

    let kproc = sched::current_process().expect("kernel process must exist");
    let t = sched::thread_create(kproc, noop_entry, 0).expect("thread creation should succeed");
    aasvogel_kernel::sched::queue::force_dequeue(t);

    testhook::set_current(Some(t));
    sched::sleep(0);

    // A zero sleep is a courtesy yield: back on the run queue, Ready.
    let t_ref = unsafe { t.as_ref() };
    assert_eq!(t_ref.status(), ThreadStatus::Ready);

    testhook::set_current(Some(testhook::boot_thread()));
    sched::thread_destroy(t);
}
