//! The CPU scheduler: processes, kernel threads and the round-robin
//! switching engine.
//!
//! At most one thread is Running at any time; every other runnable thread
//! waits on its process's run queue, and every process sits on the global
//! process run queue. [`switch_any`] rotates the process queue, takes the
//! head thread of the chosen process, and swaps register state through the
//! interrupt frame: the context switch always happens inside an interrupt
//! (the PIT tick or the dedicated software interrupt raised by
//! [`yield_now`]), so the frame the stubs pushed is the state being saved
//! and the frame restored on IRET is the state being resumed.
//!
//! Register handoff uses a dirty flag and the per-thread register lock.
//! With one CPU the flag never spins, but the protocol is kept so the
//! switching engine stays correct once more CPUs can be saving register
//! frames concurrently.

pub mod queue;

use core::cell::{Cell, UnsafeCell};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

use crate::arch::x86::context::{InterruptFrame, SavedRegisters};
use crate::arch::x86::gdt;
use crate::arch::{interrupts_disable, interrupts_restore, pause};
use crate::error::{KernelError, KernelResult};
use crate::mm::page::{self, AddressSpace, PageFlags};
use crate::mm::phys::FrameFlags;
use crate::mm::pool::SmallPool;
use crate::mm::{VirtAddr, FRAME_SIZE};
use crate::sync::mutex::Mutex;
use crate::sync::spinlock::SpinLock;

use queue::{force_dequeue, Queue, QueueNode};

/// Timer frequency driving preemption and sleep.
pub const TICKS_PER_SECOND: u64 = 250;
/// Full scheduling quantum, in ticks.
pub const TICKS_BEFORE_PREEMPT: u64 = 10;
/// PIT channel-0 divisor for [`TICKS_PER_SECOND`].
pub const PIT_TICK_DIVISOR: u32 = 1_193_182 / TICKS_PER_SECOND as u32;
pub const MILLISECONDS_PER_TICK: u64 = 1000 / TICKS_PER_SECOND;

/// Software interrupt vector whose handler performs the context switch.
/// Unlike the other extended vectors it is not callable from user mode.
pub const CONTEXT_SWITCH_VECTOR: u8 = 0x90;

/// Kernel thread stacks are 256 KiB, writable, never executable.
pub const THREAD_STACK_SIZE: usize = 0x40000;

/// EFLAGS image new threads start with: reserved bit 1 plus IF.
const THREAD_EFLAGS: u32 = (1 << 1) | (1 << 9);

/// Maximum process name length.
pub const PROCESS_NAME_MAX: usize = 32;

pub type ThreadQueue = Queue<Thread>;
pub type ProcessQueue = Queue<Process>;

/// A thread's scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Currently executing (equivalently: this is the current thread).
    Running,
    /// Runnable, waiting on its process's run queue.
    Ready,
    /// Waiting on a synchronisation primitive's queue.
    Blocking,
    /// On the sleep queue until `sleep_until`.
    Sleeping,
    /// Destroyed; the record is about to be (or has been) freed.
    Dead,
}

/// The entry point of a kernel thread.
pub type ThreadFn = extern "C" fn(usize);

/// A kernel thread.
pub struct Thread {
    pub(crate) process: Cell<Option<NonNull<Process>>>,
    tid: u64,
    pub(crate) status: Cell<ThreadStatus>,
    pub(crate) sleep_until: Cell<u64>,

    pub(crate) registers_lock: SpinLock,
    registers_dirty: AtomicBool,
    registers: UnsafeCell<SavedRegisters>,

    stack_low: Cell<VirtAddr>,
    stack_high: Cell<VirtAddr>,

    next_in_process: Cell<Option<NonNull<Thread>>>,
    in_queue: Cell<Option<NonNull<ThreadQueue>>>,
    next_in_queue: Cell<Option<NonNull<Thread>>>,

    /// Head of the intrusive stack of mutexes this thread holds, most
    /// recently acquired first.
    pub(crate) held_mutexes: Cell<Option<NonNull<Mutex>>>,

    #[cfg(feature = "sched_debug")]
    creation: Cell<u64>,
    #[cfg(feature = "sched_debug")]
    pub(crate) run_ticks: Cell<u64>,
}

// SAFETY: thread state is guarded by the queue/scheduler locking
// discipline; register state by registers_lock plus the dirty flag.
unsafe impl Sync for Thread {}
// SAFETY: as above.
unsafe impl Send for Thread {}

impl Thread {
    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn status(&self) -> ThreadStatus {
        self.status.get()
    }

    pub fn process(&self) -> Option<NonNull<Process>> {
        self.process.get()
    }

    pub fn wake_time(&self) -> u64 {
        self.sleep_until.get()
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.in_queue.get().is_some()
    }
}

impl QueueNode for Thread {
    fn next_in_queue(&self) -> &Cell<Option<NonNull<Self>>> {
        &self.next_in_queue
    }
    fn in_queue(&self) -> &Cell<Option<NonNull<Queue<Self>>>> {
        &self.in_queue
    }
}

/// A process: a named container of threads sharing an address space.
pub struct Process {
    pub lock: SpinLock,
    pid: u64,
    name: UnsafeCell<heapless::String<PROCESS_NAME_MAX>>,

    address_space: Cell<Option<NonNull<AddressSpace>>>,

    next_tid: Cell<u64>,
    first_thread: Cell<Option<NonNull<Thread>>>,
    pub thread_run_queue: ThreadQueue,

    in_queue: Cell<Option<NonNull<ProcessQueue>>>,
    next_in_queue: Cell<Option<NonNull<Process>>>,

    /// Link on the global list of all processes.
    next: Cell<Option<NonNull<Process>>>,
}

// SAFETY: mutable state is guarded by the process lock, the queue locks
// and the global process-list lock.
unsafe impl Sync for Process {}
// SAFETY: as above.
unsafe impl Send for Process {}

impl Process {
    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn name(&self) -> &str {
        // SAFETY: the name is written once before the process is
        // published and never mutated afterwards.
        unsafe { &*self.name.get() }
    }

    pub fn address_space(&self) -> Option<NonNull<AddressSpace>> {
        self.address_space.get()
    }
}

impl QueueNode for Process {
    fn next_in_queue(&self) -> &Cell<Option<NonNull<Self>>> {
        &self.next_in_queue
    }
    fn in_queue(&self) -> &Cell<Option<NonNull<Queue<Self>>>> {
        &self.in_queue
    }
}

static PROCESS_POOL: SmallPool = SmallPool::new();
static THREAD_POOL: SmallPool = SmallPool::new();

static NEXT_PID: AtomicU64 = AtomicU64::new(0);
static TICKS: AtomicU64 = AtomicU64::new(0);
static TICKS_UNTIL_PREEMPT: AtomicU64 = AtomicU64::new(TICKS_BEFORE_PREEMPT);

static CURRENT_THREAD: AtomicPtr<Thread> = AtomicPtr::new(core::ptr::null_mut());
static CURRENT_PROCESS: AtomicPtr<Process> = AtomicPtr::new(core::ptr::null_mut());
static IDLE_THREAD: AtomicPtr<Thread> = AtomicPtr::new(core::ptr::null_mut());
static BOOT_THREAD: AtomicPtr<Thread> = AtomicPtr::new(core::ptr::null_mut());

static PROCESS_RUN_QUEUE: ProcessQueue = ProcessQueue::new();
static SLEEP_QUEUE: ThreadQueue = ThreadQueue::new();

static PROCESS_LIST_LOCK: SpinLock = SpinLock::new(());
static FIRST_PROCESS: AtomicPtr<Process> = AtomicPtr::new(core::ptr::null_mut());

/// Timer ticks since the scheduler came up.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// The thread currently executing, if any (None while idling).
pub fn current_thread() -> Option<NonNull<Thread>> {
    NonNull::new(CURRENT_THREAD.load(Ordering::Relaxed))
}

/// The process owning the current thread.
pub fn current_process() -> Option<NonNull<Process>> {
    NonNull::new(CURRENT_PROCESS.load(Ordering::Relaxed))
}

/// The global process run queue (exposed for the switching engine's own
/// diagnostics and tests).
pub fn process_run_queue() -> &'static ProcessQueue {
    &PROCESS_RUN_QUEUE
}

fn init_registers(regs: &mut SavedRegisters, stack: u32, entry: u32) {
    regs.gs = gdt::KERNEL_DATA as u32;
    regs.fs = gdt::KERNEL_DATA as u32;
    regs.es = gdt::KERNEL_DATA as u32;
    regs.ds = gdt::KERNEL_DATA as u32;
    regs.ss = gdt::KERNEL_DATA as u32;
    regs.cs = gdt::KERNEL_CODE as u32;

    regs.edi = 0;
    regs.esi = 0;
    regs.ebp = 0;
    regs.ebx = 0;
    regs.edx = 0;
    regs.ecx = 0;
    regs.eax = 0;
    regs.eflags = THREAD_EFLAGS;

    regs.eip = entry;
    regs.esp = stack;
}

fn alloc_init_process(name: &str) -> Option<NonNull<Process>> {
    let raw = PROCESS_POOL.alloc(FrameFlags::empty())?;
    let proc = raw.cast::<Process>();

    let mut bounded = heapless::String::new();
    for c in name.chars() {
        if bounded.push(c).is_err() {
            break;
        }
    }

    // SAFETY: the pool returned a fresh, correctly sized and aligned slot.
    unsafe {
        proc.as_ptr().write(Process {
            lock: SpinLock::new(()),
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            name: UnsafeCell::new(bounded),
            address_space: Cell::new(Some(NonNull::from(page::kernel_space()))),
            next_tid: Cell::new(0),
            first_thread: Cell::new(None),
            thread_run_queue: ThreadQueue::new(),
            in_queue: Cell::new(None),
            next_in_queue: Cell::new(None),
            next: Cell::new(None),
        });
    }
    // SAFETY: just initialized above.
    let proc_ref = unsafe { proc.as_ref() };

    let plock = proc_ref.lock.lock();

    {
        let _guard = PROCESS_LIST_LOCK.lock();
        proc_ref
            .next
            .set(NonNull::new(FIRST_PROCESS.load(Ordering::Relaxed)));
        FIRST_PROCESS.store(proc.as_ptr(), Ordering::Relaxed);
    }

    {
        let _guard = PROCESS_RUN_QUEUE.lock.lock();
        // SAFETY: run queue lock held; the process is fresh and unqueued.
        unsafe {
            PROCESS_RUN_QUEUE.enqueue(proc);
        }
    }

    drop(plock);

    log::debug!("Created process {} ({})", proc_ref.pid, proc_ref.name());
    Some(proc)
}

fn alloc_init_thread(process: Option<NonNull<Process>>) -> Option<NonNull<Thread>> {
    let raw = THREAD_POOL.alloc(FrameFlags::empty())?;
    let thread = raw.cast::<Thread>();

    let tid = match process {
        Some(p) => {
            // SAFETY: p is a live process.
            let p_ref = unsafe { p.as_ref() };
            let tid = p_ref.next_tid.get();
            p_ref.next_tid.set(tid + 1);
            tid
        }
        None => 0,
    };

    // SAFETY: the pool returned a fresh, correctly sized and aligned slot.
    unsafe {
        thread.as_ptr().write(Thread {
            process: Cell::new(process),
            tid,
            status: Cell::new(ThreadStatus::Ready),
            sleep_until: Cell::new(0),
            registers_lock: SpinLock::new(()),
            registers_dirty: AtomicBool::new(false),
            registers: UnsafeCell::new(SavedRegisters::default()),
            stack_low: Cell::new(0),
            stack_high: Cell::new(0),
            next_in_process: Cell::new(None),
            in_queue: Cell::new(None),
            next_in_queue: Cell::new(None),
            held_mutexes: Cell::new(None),
            #[cfg(feature = "sched_debug")]
            creation: Cell::new(ticks()),
            #[cfg(feature = "sched_debug")]
            run_ticks: Cell::new(0),
        });
    }
    // SAFETY: just initialized above.
    let thread_ref = unsafe { thread.as_ref() };

    if let Some(p) = process {
        // SAFETY: p is a live process.
        let p_ref = unsafe { p.as_ref() };
        thread_ref.next_in_process.set(p_ref.first_thread.get());
        p_ref.first_thread.set(Some(thread));

        let _guard = p_ref.thread_run_queue.lock.lock();
        // SAFETY: queue lock held; thread is fresh and unqueued.
        unsafe {
            p_ref.thread_run_queue.enqueue(thread);
        }

        log::debug!(
            "Created thread {} under process {} ({})",
            tid,
            p_ref.pid,
            p_ref.name()
        );
    } else {
        log::debug!("Created disconnected thread");
    }

    Some(thread)
}

/// The idle thread: nothing to run, so wait for the next interrupt.
extern "C" fn idle_main(_arg: usize) {
    loop {
        pause();
        crate::arch::x86::halt_until_interrupt();
    }
}

/// Brings up the scheduler: the kernel process, its boot thread (the code
/// currently executing becomes thread 0), the idle thread, the PIT tick
/// and the context-switch vector.
pub fn init() {
    PROCESS_POOL.init(
        "sched_process pool",
        core::mem::size_of::<Process>() as u32,
        core::mem::align_of::<Process>() as u32,
        FrameFlags::empty(),
    );
    THREAD_POOL.init(
        "sched_thread pool",
        core::mem::size_of::<Thread>() as u32,
        core::mem::align_of::<Thread>() as u32,
        FrameFlags::empty(),
    );

    let kproc = alloc_init_process("kernel")
        .unwrap_or_else(|| crate::crash!("Failed to initialize kernel process!"));
    CURRENT_PROCESS.store(kproc.as_ptr(), Ordering::Relaxed);

    let kthread = alloc_init_thread(Some(kproc))
        .unwrap_or_else(|| crate::crash!("Failed to initialize first kernel thread!"));
    // SAFETY: freshly created and owned by this function.
    let kthread_ref = unsafe { kthread.as_ref() };

    // The boot thread is what is executing right now: pull it back off the
    // run queue and mark it running. Its registers are live in the CPU,
    // not in the record, hence the dirty flag.
    force_dequeue(kthread);
    kthread_ref.status.set(ThreadStatus::Running);
    kthread_ref.registers_dirty.store(true, Ordering::Relaxed);
    CURRENT_THREAD.store(kthread.as_ptr(), Ordering::Relaxed);
    BOOT_THREAD.store(kthread.as_ptr(), Ordering::Relaxed);

    let idle = alloc_init_thread(None)
        .unwrap_or_else(|| crate::crash!("Failed to initialize idle thread!"));
    // SAFETY: freshly created and owned by this function.
    unsafe {
        let idle_ref = idle.as_ref();
        let regs = &mut *idle_ref.registers.get();
        // The idle thread executes on whatever stack was interrupted; the
        // switching engine patches ESP in, so only the entry point
        // matters here.
        init_registers(regs, 0, idle_main as usize as u32);
    }
    IDLE_THREAD.store(idle.as_ptr(), Ordering::Relaxed);

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        use crate::arch::x86::{idt, timer};

        idt::register_irq_handler(0, timer_tick);
        timer::pit_init(PIT_TICK_DIVISOR);
        idt::set_irq_enabled(0, true);

        // The context-switch vector must not be reachable from user mode
        // and must run with interrupts disabled.
        let ext = (CONTEXT_SWITCH_VECTOR - idt::EXT_START) as usize;
        idt::set_ext_handler_flags(ext, idt::GATE_KERNEL);
        idt::register_ext_handler(ext, yield_handler);
    }

    log::info!("scheduler online: {} Hz preemption", TICKS_PER_SECOND);
}

/// Creates a process with no threads.
pub fn process_create(name: &str) -> KernelResult<NonNull<Process>> {
    alloc_init_process(name).ok_or(KernelError::NoMemory)
}

/// Destroys a process: every thread first, then the record itself.
pub fn process_destroy(process: NonNull<Process>) {
    if Some(process) == current_process() {
        crate::crash!("Attempt to destroy the current process!");
    }
    // SAFETY: the caller owns a live process.
    let proc_ref = unsafe { process.as_ref() };

    while let Some(t) = proc_ref.first_thread.get() {
        thread_destroy(t);
    }

    force_dequeue(process);

    {
        let _guard = PROCESS_LIST_LOCK.lock();
        let mut cur = NonNull::new(FIRST_PROCESS.load(Ordering::Relaxed));
        if cur == Some(process) {
            FIRST_PROCESS.store(
                proc_ref.next.get().map_or(core::ptr::null_mut(), |p| p.as_ptr()),
                Ordering::Relaxed,
            );
        } else {
            while let Some(p) = cur {
                // SAFETY: list members are live processes.
                let p_ref = unsafe { p.as_ref() };
                if p_ref.next.get() == Some(process) {
                    p_ref.next.set(proc_ref.next.get());
                    break;
                }
                cur = p_ref.next.get();
            }
        }
    }

    log::debug!("Destroyed process {} ({})", proc_ref.pid, proc_ref.name());
    PROCESS_POOL.free(process.cast());
}

/// Creates a thread in `process`, entering at `entry` with `arg` on top of
/// a fresh 256 KiB stack (writable, non-executable). The thread starts
/// Ready on its process's run queue.
pub fn thread_create(
    process: NonNull<Process>,
    entry: ThreadFn,
    arg: usize,
) -> KernelResult<NonNull<Thread>> {
    let pages = THREAD_STACK_SIZE / FRAME_SIZE;
    let stack = page::global_alloc(
        PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
        FrameFlags::empty(),
        pages,
    )
    .ok_or(KernelError::NoMemory)?;

    let stack_low = stack.as_ptr() as VirtAddr;
    let stack_high = stack_low + THREAD_STACK_SIZE;

    // The argument, then a null return slot: falling off the entry
    // function is a bug and lands on a null instruction fetch. Threads end
    // with thread_end().
    // SAFETY: the top two slots are inside the freshly mapped stack.
    unsafe {
        *((stack_high - core::mem::size_of::<usize>()) as *mut usize) = arg;
        *((stack_high - 2 * core::mem::size_of::<usize>()) as *mut usize) = 0;
    }

    let thread = match alloc_init_thread(Some(process)) {
        Some(t) => t,
        None => {
            page::global_free(stack, pages);
            return Err(KernelError::NoMemory);
        }
    };
    // SAFETY: freshly created and not yet runnable from anywhere else.
    unsafe {
        let t_ref = thread.as_ref();
        let regs = &mut *t_ref.registers.get();
        init_registers(
            regs,
            (stack_high - 2 * core::mem::size_of::<usize>()) as u32,
            entry as usize as u32,
        );
        t_ref.stack_low.set(stack_low);
        t_ref.stack_high.set(stack_high);
    }

    log::debug!(
        "Allocated stack from {:#x} to {:#x} (size {})",
        stack_low,
        stack_high,
        THREAD_STACK_SIZE
    );

    Ok(thread)
}

/// Destroys a thread: off whatever queue it is on, stack freed, unlinked
/// from its process.
pub fn thread_destroy(thread: NonNull<Thread>) {
    if Some(thread) == current_thread() {
        crate::crash!("Attempt to destroy the current thread!");
    }
    // SAFETY: the caller owns a live thread.
    let t_ref = unsafe { thread.as_ref() };

    if t_ref.is_queued() {
        force_dequeue(thread);
    }

    if t_ref.stack_low.get() != 0 {
        // SAFETY: stack_low was returned by global_alloc at creation.
        let stack = unsafe { NonNull::new_unchecked(t_ref.stack_low.get() as *mut u8) };
        page::global_free(stack, THREAD_STACK_SIZE / FRAME_SIZE);
    }

    if let Some(p) = t_ref.process.get() {
        // SAFETY: the owning process outlives its threads.
        let p_ref = unsafe { p.as_ref() };
        if p_ref.first_thread.get() == Some(thread) {
            p_ref.first_thread.set(t_ref.next_in_process.get());
        } else {
            let mut cur = p_ref.first_thread.get();
            while let Some(t) = cur {
                // SAFETY: thread-list members are live threads.
                let cur_ref = unsafe { t.as_ref() };
                if cur_ref.next_in_process.get() == Some(thread) {
                    cur_ref.next_in_process.set(t_ref.next_in_process.get());
                    break;
                }
                cur = cur_ref.next_in_process.get();
            }
        }

        log::debug!(
            "Destroyed thread {} under process {} ({})",
            t_ref.tid,
            p_ref.pid,
            p_ref.name()
        );
    }

    t_ref.status.set(ThreadStatus::Dead);
    THREAD_POOL.free(thread.cast());
}

/// Ends the calling thread. It never runs again; the record is reaped by
/// whoever joins on it (or leaks, for detached kernel threads).
pub fn thread_end() -> ! {
    let cur = current_thread().unwrap_or_else(|| crate::crash!("thread_end with no thread!"));
    // SAFETY: the current thread is live.
    unsafe { cur.as_ref() }.status.set(ThreadStatus::Dead);
    loop {
        yield_now();
    }
}

/// Makes a Blocking thread runnable again. The caller must have removed it
/// from the wait queue it was parked on.
pub fn thread_wake(thread: NonNull<Thread>) {
    // SAFETY: the caller owns a live blocked thread.
    let t_ref = unsafe { thread.as_ref() };
    assert!(
        !t_ref.is_queued() && t_ref.status.get() == ThreadStatus::Blocking,
        "waking a thread that is not parked"
    );

    let p = t_ref
        .process
        .get()
        .unwrap_or_else(|| crate::crash!("Waking a thread with no process!"));
    // SAFETY: the owning process is live.
    let p_ref = unsafe { p.as_ref() };

    let _guard = p_ref.thread_run_queue.lock.lock();
    t_ref.status.set(ThreadStatus::Ready);
    // SAFETY: queue lock held; the thread is unqueued (asserted above).
    unsafe {
        p_ref.thread_run_queue.enqueue(thread);
    }
}

/// Saves the outgoing thread's registers out of the interrupt frame and,
/// if it was still Running, parks it back on its run queue as Ready.
fn save_current(regs: &InterruptFrame) {
    let cur = match current_thread() {
        Some(c) => c,
        None => return,
    };
    // SAFETY: the current thread is live.
    let cur_ref = unsafe { cur.as_ref() };
    if cur_ref.status.get() == ThreadStatus::Dead {
        return;
    }

    {
        let _guard = cur_ref.registers_lock.lock();
        // SAFETY: register frame access under registers_lock.
        unsafe {
            (*cur_ref.registers.get()).save_from(regs);
        }
    }
    cur_ref.registers_dirty.store(false, Ordering::Release);

    if cur_ref.status.get() == ThreadStatus::Running {
        let p = cur_ref
            .process
            .get()
            .unwrap_or_else(|| crate::crash!("Running thread with no process!"));
        // SAFETY: the owning process is live.
        let p_ref = unsafe { p.as_ref() };
        let _guard = p_ref.thread_run_queue.lock.lock();
        cur_ref.status.set(ThreadStatus::Ready);
        // SAFETY: queue lock held; a Running thread is never queued.
        unsafe {
            p_ref.thread_run_queue.enqueue(cur);
        }
    }
}

/// Switches to a specific Ready thread.
pub fn switch_thread(thread: NonNull<Thread>, regs: &mut InterruptFrame) {
    if Some(thread) == current_thread() {
        return;
    }
    // SAFETY: the chosen thread is live.
    let t_ref = unsafe { thread.as_ref() };
    assert_eq!(t_ref.status.get(), ThreadStatus::Ready);

    save_current(regs);

    CURRENT_THREAD.store(thread.as_ptr(), Ordering::Relaxed);
    CURRENT_PROCESS.store(
        t_ref
            .process
            .get()
            .map_or(core::ptr::null_mut(), |p| p.as_ptr()),
        Ordering::Relaxed,
    );

    // Another CPU may still be writing this thread's frame out; wait for
    // the store to land before reading it back.
    while t_ref.registers_dirty.load(Ordering::Acquire) {
        pause();
    }

    t_ref.status.set(ThreadStatus::Running);
    t_ref.registers_dirty.store(true, Ordering::Relaxed);

    {
        let _guard = t_ref.registers_lock.lock();
        // SAFETY: register frame access under registers_lock.
        unsafe {
            let saved = &*t_ref.registers.get();
            if t_ref.stack_low.get() != 0 {
                debug_assert!(
                    (saved.esp as VirtAddr) >= t_ref.stack_low.get()
                        && (saved.esp as VirtAddr) <= t_ref.stack_high.get()
                );
            }
            saved.load_into(regs);
        }
    }
}

/// The scheduling decision: rotate the process run queue until a process
/// with a runnable thread turns up; failing a full lap, fall back to the
/// idle thread (which keeps the interrupted stack).
pub fn switch_any(regs: &mut InterruptFrame) {
    let rq_guard = PROCESS_RUN_QUEUE.lock.lock();

    // SAFETY: run queue lock held for all queue operations below.
    let (new_process, new_thread) = unsafe {
        let begin = PROCESS_RUN_QUEUE.dequeue();
        let mut new_process = begin;
        let mut new_thread = None;

        while let Some(p) = new_process {
            PROCESS_RUN_QUEUE.enqueue(p);

            let p_ref = p.as_ref();
            {
                let _tq = p_ref.thread_run_queue.lock.lock();
                new_thread = p_ref.thread_run_queue.dequeue();
            }
            if new_thread.is_some() {
                break;
            }

            new_process = PROCESS_RUN_QUEUE.dequeue();
            if new_process == begin {
                // Full lap with nothing runnable.
                PROCESS_RUN_QUEUE.enqueue(new_process.unwrap_unchecked());
                new_process = None;
            }
        }
        (new_process, new_thread)
    };
    drop(rq_guard);

    match (new_process, new_thread) {
        (Some(_), Some(thread)) => {
            switch_thread(thread, regs);
            TICKS_UNTIL_PREEMPT.store(TICKS_BEFORE_PREEMPT, Ordering::Relaxed);
        }
        _ => {
            save_current(regs);

            CURRENT_THREAD.store(core::ptr::null_mut(), Ordering::Relaxed);
            CURRENT_PROCESS.store(core::ptr::null_mut(), Ordering::Relaxed);

            let idle = NonNull::new(IDLE_THREAD.load(Ordering::Relaxed))
                .unwrap_or_else(|| crate::crash!("Idle thread missing!"));
            // The idle thread has no stack of its own: it executes its
            // pause/hlt loop on whatever stack the interrupt borrowed.
            let old_esp = regs.esp;
            // SAFETY: the idle thread's frame is written only here and at
            // init, always with interrupts disabled on the one CPU.
            unsafe {
                (*idle.as_ref().registers.get()).load_into(regs);
            }
            regs.esp = old_esp;

            // Re-check for runnable work on the very next tick.
            TICKS_UNTIL_PREEMPT.store(1, Ordering::Relaxed);
        }
    }
}

/// Handler behind [`CONTEXT_SWITCH_VECTOR`].
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn yield_handler(regs: &mut InterruptFrame) {
    switch_any(regs);
}

/// Gives up the CPU voluntarily. Raises the context-switch software
/// interrupt so the register frame the switching engine saves is the one
/// the interrupt pushed, not partial caller state.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn yield_now() {
    // SAFETY: vector 0x90 is installed at boot as an interrupt gate
    // reserved for the scheduler.
    unsafe {
        core::arch::asm!("int 0x90", options(nomem, nostack));
    }
}

/// Hosted builds have nothing to switch to; tests drive [`switch_any`]
/// with a fabricated frame instead.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn yield_now() {}

/// The PIT tick: advances time, wakes due sleepers, and preempts when the
/// quantum runs out.
pub fn timer_tick(regs: &mut InterruptFrame) {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;

    #[cfg(feature = "sched_debug")]
    if let Some(cur) = current_thread() {
        // SAFETY: the current thread is live.
        let cur_ref = unsafe { cur.as_ref() };
        cur_ref.run_ticks.set(cur_ref.run_ticks.get() + 1);
    }

    // Move every due sleeper back to its run queue, in wake-time order.
    loop {
        let sq_guard = SLEEP_QUEUE.lock.lock();
        // SAFETY: sleep queue lock held.
        let due = unsafe {
            match SLEEP_QUEUE.peek() {
                Some(t) if t.as_ref().sleep_until.get() <= now => SLEEP_QUEUE.dequeue(),
                _ => None,
            }
        };
        drop(sq_guard);

        let thread = match due {
            Some(t) => t,
            None => break,
        };
        // SAFETY: sleepers are live threads.
        let t_ref = unsafe { thread.as_ref() };
        let p = t_ref
            .process
            .get()
            .unwrap_or_else(|| crate::crash!("Sleeping thread with no process!"));
        // SAFETY: the owning process is live.
        let p_ref = unsafe { p.as_ref() };

        let _guard = p_ref.thread_run_queue.lock.lock();
        t_ref.status.set(ThreadStatus::Ready);
        // SAFETY: queue lock held; the thread just left the sleep queue.
        unsafe {
            p_ref.thread_run_queue.enqueue(thread);
        }
    }

    let remaining = TICKS_UNTIL_PREEMPT
        .load(Ordering::Relaxed)
        .saturating_sub(1);
    TICKS_UNTIL_PREEMPT.store(remaining, Ordering::Relaxed);
    if remaining == 0 {
        switch_any(regs);
    }
}

/// Sleeps the current thread for at least `milliseconds`. Zero yields the
/// rest of the quantum without leaving the run queue's rotation.
pub fn sleep(milliseconds: u64) {
    let nticks = milliseconds / MILLISECONDS_PER_TICK;
    let eflags = interrupts_disable();

    let cur = current_thread().unwrap_or_else(|| crate::crash!("sleep with no thread!"));
    // SAFETY: the current thread is live.
    let cur_ref = unsafe { cur.as_ref() };

    if nticks == 0 {
        let p = cur_ref
            .process
            .get()
            .unwrap_or_else(|| crate::crash!("Running thread with no process!"));
        // SAFETY: the owning process is live.
        let p_ref = unsafe { p.as_ref() };
        {
            let _guard = p_ref.thread_run_queue.lock.lock();
            cur_ref.status.set(ThreadStatus::Ready);
            // SAFETY: queue lock held; the running thread is unqueued.
            unsafe {
                p_ref.thread_run_queue.enqueue(cur);
            }
        }
        yield_now();
        interrupts_restore(eflags);
        return;
    }

    let until = ticks() + nticks;
    cur_ref.status.set(ThreadStatus::Sleeping);
    cur_ref.sleep_until.set(until);

    {
        let _guard = SLEEP_QUEUE.lock.lock();
        // SAFETY: sleep queue lock held; the running thread is unqueued.
        unsafe {
            SLEEP_QUEUE.insert_sorted(cur, |t| t.sleep_until.get() >= until);
        }
    }

    yield_now();
    interrupts_restore(eflags);
}

// Test hooks: hosted tests drive the switching engine directly, so they
// need to reposition "current" and inspect internal queues.
#[cfg(not(target_os = "none"))]
pub mod testhook {
    use super::*;

    /// Repoints the current thread/process (host tests only).
    pub fn set_current(thread: Option<NonNull<Thread>>) {
        match thread {
            Some(t) => {
                // SAFETY: test-owned live thread.
                let t_ref = unsafe { t.as_ref() };
                CURRENT_THREAD.store(t.as_ptr(), Ordering::Relaxed);
                CURRENT_PROCESS.store(
                    t_ref
                        .process
                        .get()
                        .map_or(core::ptr::null_mut(), |p| p.as_ptr()),
                    Ordering::Relaxed,
                );
            }
            None => {
                CURRENT_THREAD.store(core::ptr::null_mut(), Ordering::Relaxed);
                CURRENT_PROCESS.store(core::ptr::null_mut(), Ordering::Relaxed);
            }
        }
    }

    /// The thread that was current when the scheduler initialized.
    pub fn boot_thread() -> NonNull<Thread> {
        NonNull::new(BOOT_THREAD.load(Ordering::Relaxed)).expect("scheduler not initialized")
    }

    /// Stops the preemption countdown from firing during a test.
    pub fn defer_preemption() {
        TICKS_UNTIL_PREEMPT.store(u64::MAX, Ordering::Relaxed);
    }

    /// Runs scheduler init exactly once for the whole test process, no
    /// matter how many test modules call it.
    pub fn ensure_init() {
        static SCHED_INIT: std::sync::Once = std::sync::Once::new();
        SCHED_INIT.call_once(super::init);
    }

    /// Collects the tids currently parked on a process's run queue.
    pub fn run_queue_tids(process: NonNull<Process>) -> std::vec::Vec<u64> {
        // SAFETY: test-owned live process.
        let p_ref = unsafe { process.as_ref() };
        let _guard = p_ref.thread_run_queue.lock.lock();
        let mut out = std::vec::Vec::new();
        // SAFETY: queue lock held; members are live threads.
        unsafe {
            let mut cur = p_ref.thread_run_queue.peek();
            while let Some(t) = cur {
                out.push(t.as_ref().tid());
                cur = t.as_ref().next_in_queue().get();
            }
        }
        out
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::testhost;
    use std::vec::Vec;

    fn setup() -> std::sync::MutexGuard<'static, ()> {
        let guard = testhost::boot(&[]);
        testhook::ensure_init();
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

    #[test]
    fn boot_thread_is_running_and_unqueued() {
        let _g = setup();
        let boot = testhook::boot_thread();
        // SAFETY: boot thread is live.
        let b = unsafe { boot.as_ref() };
        assert_eq!(b.status(), ThreadStatus::Running);
        assert!(!b.is_queued());
        assert_eq!(current_thread(), Some(boot));
    }

    #[test]
    fn switch_any_rotates_round_robin() {
        let _g = setup();
        let kproc = current_process().expect("kernel process must exist");

        let t1 = thread_create(kproc, noop_entry, 1).expect("thread creation should succeed");
        let t2 = thread_create(kproc, noop_entry, 2).expect("thread creation should succeed");

        let mut regs = frame();
        let mut seen = Vec::new();
        for _ in 0..6 {
            switch_any(&mut regs);
            // SAFETY: current_thread is live.
            seen.push(unsafe { current_thread().unwrap().as_ref() }.tid());
        }

        // Strict rotation over {boot, t1, t2}: every thread runs twice in
        // six switches and no thread runs twice in a row.
        // SAFETY: live threads.
        let (tid1, tid2) = unsafe { (t1.as_ref().tid(), t2.as_ref().tid()) };
        let boot_tid = unsafe { testhook::boot_thread().as_ref() }.tid();
        for ids in seen.windows(2) {
            assert_ne!(ids[0], ids[1]);
        }
        for tid in [boot_tid, tid1, tid2] {
            assert_eq!(seen.iter().filter(|&&t| t == tid).count(), 2);
        }

        // Invariant: the running thread is exactly the current one and is
        // on no queue.
        let cur = current_thread().unwrap();
        // SAFETY: live thread.
        let cur_ref = unsafe { cur.as_ref() };
        assert_eq!(cur_ref.status(), ThreadStatus::Running);
        assert!(!cur_ref.is_queued());

        // Park the machine back on the boot thread and clean up.
        let mut regs = frame();
        while current_thread() != Some(testhook::boot_thread()) {
            switch_any(&mut regs);
        }
        thread_destroy(t1);
        thread_destroy(t2);
    }

    #[test]
    fn sleep_queue_wakes_in_deadline_order() {
        let _g = setup();
        let kproc = current_process().expect("kernel process must exist");

        let a = thread_create(kproc, noop_entry, 0).expect("thread creation should succeed");
        let b = thread_create(kproc, noop_entry, 0).expect("thread creation should succeed");
        let c = thread_create(kproc, noop_entry, 0).expect("thread creation should succeed");

        // Park all three on the sleep queue with staggered deadlines:
        // a -> +30 ticks, b -> +10, c -> +20.
        let now = ticks();
        for (t, dt) in [(a, 30), (b, 10), (c, 20)] {
            queue::force_dequeue(t);
            // SAFETY: live threads, just created.
            let t_ref = unsafe { t.as_ref() };
            t_ref.status.set(ThreadStatus::Sleeping);
            t_ref.sleep_until.set(now + dt);
            let until = now + dt;
            let _guard = SLEEP_QUEUE.lock.lock();
            // SAFETY: sleep queue lock held; thread unqueued.
            unsafe {
                SLEEP_QUEUE.insert_sorted(t, |s| s.sleep_until.get() >= until);
            }
        }

        let mut regs = frame();
        for _ in 0..35 {
            testhook::defer_preemption();
            timer_tick(&mut regs);
        }

        // All three woke; the run queue received them in deadline order
        // b, c, a.
        let tids = testhook::run_queue_tids(kproc);
        // SAFETY: live threads.
        let (ta, tb, tc) = unsafe { (a.as_ref().tid(), b.as_ref().tid(), c.as_ref().tid()) };
        let pos = |tid| tids.iter().position(|&t| t == tid).expect("thread must have woken");
        assert!(pos(tb) < pos(tc));
        assert!(pos(tc) < pos(ta));

        for t in [a, b, c] {
            thread_destroy(t);
        }
    }

    #[test]
    fn destroyed_threads_release_their_stacks() {
        let _g = setup();
        let kproc = current_process().expect("kernel process must exist");

        // Warm pass: stack allocation may lazily create kernel page
        // tables, which stay.
        let warm = thread_create(kproc, noop_entry, 0).expect("thread creation should succeed");
        thread_destroy(warm);
        let frames_before = crate::mm::phys::free_frames();

        let t = thread_create(kproc, noop_entry, 0).expect("thread creation should succeed");
        assert!(crate::mm::phys::free_frames() < frames_before);
        thread_destroy(t);
        assert_eq!(crate::mm::phys::free_frames(), frames_before);
    }

    #[test]
    fn process_lifecycle_detaches_cleanly() {
        let _g = setup();
        let p = process_create("worker").expect("process creation should succeed");
        // SAFETY: live process.
        assert_eq!(unsafe { p.as_ref() }.name(), "worker");

        let t = thread_create(p, noop_entry, 0).expect("thread creation should succeed");
        // SAFETY: live thread.
        assert!(unsafe { t.as_ref() }.is_queued());

        process_destroy(p);
        // The kernel process is still schedulable afterwards.
        let mut regs = frame();
        switch_any(&mut regs);
        let mut regs2 = frame();
        while current_thread() != Some(testhook::boot_thread()) {
            switch_any(&mut regs2);
        }
    }
}
