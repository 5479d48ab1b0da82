//! Stop-the-world suspension.
//!
//! A [`Suspender`] halts every registered thread except the caller and
//! captures each one's register file and stack pointer, producing a
//! [`FrozenWorld`]. The world stays frozen until the token is handed back to
//! [`Suspender::resume_all`].
//!
//! Between `freeze_all` and `resume_all` the caller must not allocate, log,
//! or take any lock a suspended thread could be holding. The detector
//! acquires its registry locks and reserves every buffer before freezing.
//!
//! On Linux, [`SignalSuspender`] delivers a signal to each thread. The handler
//! copies the interrupted `ucontext_t` into a pre-allocated capture slot,
//! acknowledges, and spins until the resume epoch changes.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::thread::{ThreadId, ThreadRecord};

/// Bytes below the stack pointer that a leaf function may still use.
const RED_ZONE: usize = if cfg!(target_arch = "x86_64") { 128 } else { 0 };

/// Suspension errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SuspendError {
    /// More threads than capture slots.
    #[error("cannot suspend {requested} threads (capacity {capacity})")]
    TooManyThreads {
        /// Threads to suspend.
        requested: usize,
        /// Capture slots available.
        capacity: usize,
    },
    /// Another freeze is in progress.
    #[error("another stop-the-world is already in progress")]
    Busy,
    /// The suspend signal handler could not be installed.
    #[error("failed to install suspend signal handler: {0}")]
    HandlerInstall(#[source] nix::errno::Errno),
    /// A thread did not stop in time.
    #[error("thread {thread} did not stop within {waited:?}")]
    Unresponsive {
        /// The thread that did not respond.
        thread: ThreadId,
        /// How long the suspender waited.
        waited: Duration,
    },
    /// Not implemented for this platform.
    #[error("thread suspension is not supported on this platform")]
    Unsupported,
}

/// A suspended thread and the state captured from it.
pub struct FrozenThread {
    /// The thread's registry record.
    pub record: ThreadRecord,
    /// Stack pointer at suspension, when known.
    pub stack_pointer: Option<usize>,
    registers: Box<[usize]>,
    register_count: usize,
    slot: Option<usize>,
}

impl FrozenThread {
    /// A thread with no captured state.
    pub fn new(record: ThreadRecord) -> Self {
        Self {
            record,
            stack_pointer: None,
            registers: Box::new([]),
            register_count: 0,
            slot: None,
        }
    }

    /// A thread with captured registers.
    pub fn with_registers(
        record: ThreadRecord,
        registers: Vec<usize>,
        stack_pointer: Option<usize>,
    ) -> Self {
        let register_count = registers.len();
        Self {
            record,
            stack_pointer,
            registers: registers.into_boxed_slice(),
            register_count,
            slot: None,
        }
    }

    /// Captured register words.
    pub fn registers(&self) -> &[usize] {
        &self.registers[..self.register_count]
    }

    /// The part of the stack that may hold live data.
    ///
    /// With a stack pointer inside the stack this is `[sp - red zone, end)`;
    /// otherwise the whole stack.
    pub fn live_stack(&self) -> (usize, usize) {
        let (begin, end) = (self.record.stack_begin, self.record.stack_end);
        match self.stack_pointer {
            Some(sp) if sp >= begin && sp < end => (sp.saturating_sub(RED_ZONE).max(begin), end),
            _ => (begin, end),
        }
    }
}

impl fmt::Debug for FrozenThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrozenThread")
            .field("thread", &self.record.thread_id)
            .field("stack_pointer", &self.stack_pointer)
            .field("registers", &self.register_count)
            .finish()
    }
}

/// Token for a frozen world. Hand it back to [`Suspender::resume_all`].
#[derive(Debug)]
#[must_use = "a frozen world must be resumed"]
pub struct FrozenWorld {
    threads: Vec<FrozenThread>,
    caller: ThreadId,
}

impl FrozenWorld {
    /// Build a world from already-captured threads, sorted by id.
    pub fn new(mut threads: Vec<FrozenThread>, caller: ThreadId) -> Self {
        threads.sort_by_key(|thread| thread.record.thread_id);
        Self { threads, caller }
    }

    /// Every registered thread, including the caller, sorted by id.
    pub fn threads(&self) -> &[FrozenThread] {
        &self.threads
    }

    /// The thread that froze the world.
    pub fn caller(&self) -> ThreadId {
        self.caller
    }

    /// Install registers the calling thread captured for itself.
    ///
    /// Returns the buffer they replace. It must not be dropped before the
    /// world is resumed.
    pub fn attach_caller_registers(&mut self, registers: Box<[usize]>) -> Box<[usize]> {
        let caller = self.caller;
        match self.threads.iter_mut().find(|thread| thread.record.thread_id == caller) {
            Some(thread) => {
                thread.register_count = registers.len();
                std::mem::replace(&mut thread.registers, registers)
            }
            None => registers,
        }
    }
}

/// Register file of the thread running a check.
///
/// Captured on entry to the check, before the checker's own frames can
/// spill callee-saved registers below the scanned part of the stack. The
/// words use the `ucontext_t` layout the suspend handler copies for other
/// threads.
pub struct CallerRegisters {
    context: Option<caller_context::Context>,
}

impl CallerRegisters {
    /// Capture the current thread's registers.
    #[inline(always)]
    pub fn capture() -> Self {
        Self {
            context: caller_context::Context::capture(),
        }
    }

    /// The captured words, empty if capture failed or is unsupported.
    pub fn words(&self) -> &[usize] {
        self.context.as_ref().map_or(&[], |context| context.words())
    }
}

impl fmt::Debug for CallerRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallerRegisters")
            .field("words", &self.words().len())
            .finish()
    }
}

#[cfg(all(
    target_os = "linux",
    target_env = "gnu",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
mod caller_context {
    use std::mem::size_of;

    pub(super) struct Context(libc::ucontext_t);

    impl Context {
        #[inline(always)]
        pub(super) fn capture() -> Option<Self> {
            // SAFETY: ucontext_t is plain data and all-zero is a valid value.
            let mut context: libc::ucontext_t = unsafe { std::mem::zeroed() };
            // SAFETY: context is a valid, writable ucontext_t.
            let rc = unsafe { libc::getcontext(&mut context) };
            (rc == 0).then_some(Self(context))
        }

        pub(super) fn words(&self) -> &[usize] {
            let len = size_of::<libc::ucontext_t>() / size_of::<usize>();
            // SAFETY: the context was zeroed and then filled, so every byte is
            // initialized, and ucontext_t is at least word aligned.
            unsafe { std::slice::from_raw_parts(&self.0 as *const libc::ucontext_t as *const usize, len) }
        }
    }
}

#[cfg(not(all(
    target_os = "linux",
    target_env = "gnu",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
mod caller_context {
    pub(super) struct Context;

    impl Context {
        #[inline(always)]
        pub(super) fn capture() -> Option<Self> {
            None
        }

        pub(super) fn words(&self) -> &[usize] {
            &[]
        }
    }
}

/// Stops and resumes the world.
pub trait Suspender: Send + Sync {
    /// Suspend every thread in `threads` other than `caller`.
    ///
    /// Must not return `Ok` until every such thread is stopped and its
    /// registers captured. On error no thread is left suspended.
    fn freeze_all(
        &self,
        threads: Vec<ThreadRecord>,
        caller: ThreadId,
    ) -> Result<FrozenWorld, SuspendError>;

    /// Resume every thread suspended by `freeze_all`.
    fn resume_all(&self, world: FrozenWorld);
}

/// A suspender that stops nothing.
///
/// Sound only when no other registered thread touches the heap during a
/// check, such as single-threaded programs and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSuspender;

impl Suspender for NoopSuspender {
    fn freeze_all(
        &self,
        threads: Vec<ThreadRecord>,
        caller: ThreadId,
    ) -> Result<FrozenWorld, SuspendError> {
        Ok(FrozenWorld::new(
            threads.into_iter().map(FrozenThread::new).collect(),
            caller,
        ))
    }

    fn resume_all(&self, _world: FrozenWorld) {}
}

/// Default number of capture slots.
pub const DEFAULT_CAPACITY: usize = 512;

/// Default time to wait for a thread to acknowledge suspension.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(target_os = "linux")]
pub use self::linux::SignalSuspender;

#[cfg(not(target_os = "linux"))]
pub use self::fallback::SignalSuspender;

#[cfg(target_os = "linux")]
mod linux {
    use std::cell::UnsafeCell;
    use std::mem::size_of;
    use std::ptr;
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
    use std::sync::OnceLock;
    use std::time::{Duration, Instant};

    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    use super::{FrozenThread, FrozenWorld, SuspendError, Suspender, DEFAULT_ACK_TIMEOUT, DEFAULT_CAPACITY};
    use crate::thread::{current_os_tid, ThreadId, ThreadRecord};

    const SUSPEND_SIGNAL: Signal = Signal::SIGPWR;
    const CAPTURE_WORDS: usize = size_of::<libc::ucontext_t>() / size_of::<usize>() + 1;

    static ACTIVE_SLOTS: AtomicPtr<CaptureSlot> = AtomicPtr::new(ptr::null_mut());
    static ACTIVE_LEN: AtomicUsize = AtomicUsize::new(0);
    static RESUME_EPOCH: AtomicU64 = AtomicU64::new(0);
    static BUSY: AtomicBool = AtomicBool::new(false);

    struct CaptureSlot {
        os_tid: AtomicI32,
        epoch: AtomicU64,
        acked: AtomicBool,
        stack_pointer: AtomicUsize,
        len: AtomicUsize,
        words: UnsafeCell<[usize; CAPTURE_WORDS]>,
    }

    // SAFETY: `words` is written only by the handler of the thread owning the
    // slot, before it sets `acked`, and read only after `acked` is observed.
    unsafe impl Sync for CaptureSlot {}

    impl CaptureSlot {
        fn new() -> Self {
            Self {
                os_tid: AtomicI32::new(0),
                epoch: AtomicU64::new(0),
                acked: AtomicBool::new(false),
                stack_pointer: AtomicUsize::new(0),
                len: AtomicUsize::new(0),
                words: UnsafeCell::new([0; CAPTURE_WORDS]),
            }
        }

        fn arm(&self, os_tid: i32, epoch: u64) {
            self.acked.store(false, Ordering::Relaxed);
            self.len.store(0, Ordering::Relaxed);
            self.stack_pointer.store(0, Ordering::Relaxed);
            self.epoch.store(epoch, Ordering::Relaxed);
            self.os_tid.store(os_tid, Ordering::Release);
        }

        /// Copy the interrupted context. Runs in the signal handler.
        unsafe fn capture(&self, context: *const libc::ucontext_t) {
            let bytes = size_of::<libc::ucontext_t>().min(CAPTURE_WORDS * size_of::<usize>());
            ptr::copy_nonoverlapping(context as *const u8, self.words.get() as *mut u8, bytes);
            self.len.store(bytes / size_of::<usize>(), Ordering::Relaxed);
            self.stack_pointer.store(stack_pointer_of(context), Ordering::Relaxed);
        }
    }

    #[cfg(target_arch = "x86_64")]
    unsafe fn stack_pointer_of(context: *const libc::ucontext_t) -> usize {
        (*context).uc_mcontext.gregs[libc::REG_RSP as usize] as usize
    }

    #[cfg(target_arch = "aarch64")]
    unsafe fn stack_pointer_of(context: *const libc::ucontext_t) -> usize {
        (*context).uc_mcontext.sp as usize
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    unsafe fn stack_pointer_of(_context: *const libc::ucontext_t) -> usize {
        0
    }

    extern "C" fn suspend_handler(
        _signal: libc::c_int,
        _info: *mut libc::siginfo_t,
        context: *mut libc::c_void,
    ) {
        // SAFETY: only async-signal-safe operations follow; errno is restored
        // before returning.
        unsafe {
            let saved_errno = *libc::__errno_location();
            let slots = ACTIVE_SLOTS.load(Ordering::SeqCst);
            if !slots.is_null() && !context.is_null() {
                let len = ACTIVE_LEN.load(Ordering::SeqCst);
                let tid = current_os_tid();
                let slots = std::slice::from_raw_parts(slots, len);
                if let Some(slot) = slots.iter().find(|slot| slot.os_tid.load(Ordering::Acquire) == tid) {
                    let epoch = slot.epoch.load(Ordering::Relaxed);
                    slot.capture(context as *const libc::ucontext_t);
                    slot.acked.store(true, Ordering::Release);
                    while RESUME_EPOCH.load(Ordering::SeqCst) == epoch {
                        libc::sched_yield();
                    }
                }
            }
            *libc::__errno_location() = saved_errno;
        }
    }

    fn install_handler() -> Result<(), SuspendError> {
        static INSTALLED: OnceLock<Result<(), nix::errno::Errno>> = OnceLock::new();
        let result = INSTALLED.get_or_init(|| {
            let action = SigAction::new(
                SigHandler::SigAction(suspend_handler),
                SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            // SAFETY: the handler only performs async-signal-safe work.
            unsafe { sigaction(SUSPEND_SIGNAL, &action) }.map(|_| ())
        });
        (*result).map_err(SuspendError::HandlerInstall)
    }

    /// Signal-based suspender for Linux.
    ///
    /// Threads are stopped with `SIGPWR`. The capture table is allocated on
    /// first use and lives for the rest of the process, because a late
    /// handler may still touch it.
    pub struct SignalSuspender {
        capacity: usize,
        ack_timeout: Duration,
        slots: OnceLock<&'static [CaptureSlot]>,
    }

    impl std::fmt::Debug for SignalSuspender {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SignalSuspender")
                .field("capacity", &self.capacity)
                .field("ack_timeout", &self.ack_timeout)
                .finish()
        }
    }

    impl Default for SignalSuspender {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SignalSuspender {
        /// Create a suspender with default capacity and timeout.
        pub fn new() -> Self {
            Self::with_capacity(DEFAULT_CAPACITY)
        }

        /// Create a suspender able to stop up to `capacity` threads.
        pub fn with_capacity(capacity: usize) -> Self {
            Self {
                capacity,
                ack_timeout: DEFAULT_ACK_TIMEOUT,
                slots: OnceLock::new(),
            }
        }

        /// Set how long to wait for each thread to stop.
        pub fn ack_timeout(mut self, timeout: Duration) -> Self {
            self.ack_timeout = timeout;
            self
        }

        /// Maximum number of threads that can be suspended.
        pub fn capacity(&self) -> usize {
            self.capacity
        }

        fn slots(&self) -> &'static [CaptureSlot] {
            self.slots.get_or_init(|| {
                let slots: Vec<CaptureSlot> = (0..self.capacity).map(|_| CaptureSlot::new()).collect();
                Box::leak(slots.into_boxed_slice())
            })
        }

        fn release() {
            ACTIVE_SLOTS.store(ptr::null_mut(), Ordering::SeqCst);
            RESUME_EPOCH.fetch_add(1, Ordering::SeqCst);
            BUSY.store(false, Ordering::Release);
        }
    }

    impl Suspender for SignalSuspender {
        fn freeze_all(
            &self,
            threads: Vec<ThreadRecord>,
            caller: ThreadId,
        ) -> Result<FrozenWorld, SuspendError> {
            install_handler()?;
            let targets = threads
                .iter()
                .filter(|record| record.thread_id != caller && record.os_tid != 0)
                .count();
            if targets > self.capacity {
                return Err(SuspendError::TooManyThreads {
                    requested: targets,
                    capacity: self.capacity,
                });
            }
            let slots = self.slots();
            if BUSY.swap(true, Ordering::AcqRel) {
                return Err(SuspendError::Busy);
            }

            // Everything the frozen phase needs is allocated here.
            let mut frozen: Vec<FrozenThread> = threads
                .into_iter()
                .map(|record| {
                    let mut thread = FrozenThread::new(record);
                    thread.registers = vec![0usize; CAPTURE_WORDS].into_boxed_slice();
                    thread
                })
                .collect();

            let epoch = RESUME_EPOCH.load(Ordering::SeqCst);
            let mut next = 0;
            for thread in frozen.iter_mut() {
                if thread.record.thread_id == caller || thread.record.os_tid == 0 {
                    continue;
                }
                slots[next].arm(thread.record.os_tid, epoch);
                thread.slot = Some(next);
                next += 1;
            }
            ACTIVE_LEN.store(next, Ordering::SeqCst);
            ACTIVE_SLOTS.store(slots.as_ptr() as *mut CaptureSlot, Ordering::SeqCst);

            // Frozen phase: no allocation, locking or logging until resume.
            // SAFETY: getpid has no preconditions.
            let pid = unsafe { libc::getpid() };
            for thread in frozen.iter() {
                let Some(index) = thread.slot else { continue };
                // SAFETY: tgkill only takes plain integers. A registered
                // thread can exit without unregistering, so the tid may be
                // gone (ESRCH) or, rarely, reused by a thread outside the
                // registry, whose handler finds no slot and returns.
                let rc = unsafe {
                    libc::syscall(
                        libc::SYS_tgkill,
                        pid,
                        thread.record.os_tid,
                        SUSPEND_SIGNAL as libc::c_int,
                    )
                };
                if rc != 0 {
                    // Already gone; nothing to capture.
                    slots[index].acked.store(true, Ordering::Release);
                }
            }

            let started = Instant::now();
            for thread in frozen.iter() {
                let Some(index) = thread.slot else { continue };
                while !slots[index].acked.load(Ordering::Acquire) {
                    if started.elapsed() > self.ack_timeout {
                        Self::release();
                        return Err(SuspendError::Unresponsive {
                            thread: thread.record.thread_id,
                            waited: started.elapsed(),
                        });
                    }
                    std::hint::spin_loop();
                    // SAFETY: no preconditions.
                    unsafe { libc::sched_yield() };
                }
            }

            for thread in frozen.iter_mut() {
                let Some(index) = thread.slot else { continue };
                let slot = &slots[index];
                let len = slot.len.load(Ordering::Relaxed).min(thread.registers.len());
                // SAFETY: the owning handler finished writing before `acked`.
                let words = unsafe { &*slot.words.get() };
                thread.registers[..len].copy_from_slice(&words[..len]);
                thread.register_count = len;
                let sp = slot.stack_pointer.load(Ordering::Relaxed);
                thread.stack_pointer = (sp != 0).then_some(sp);
            }

            Ok(FrozenWorld { threads: frozen, caller })
        }

        fn resume_all(&self, world: FrozenWorld) {
            Self::release();
            drop(world);
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod fallback {
    use std::time::Duration;

    use super::{FrozenWorld, SuspendError, Suspender, DEFAULT_ACK_TIMEOUT, DEFAULT_CAPACITY};
    use crate::thread::{ThreadId, ThreadRecord};

    /// Signal-based suspender. Unavailable on this platform.
    #[derive(Debug)]
    pub struct SignalSuspender {
        capacity: usize,
        ack_timeout: Duration,
    }

    impl Default for SignalSuspender {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SignalSuspender {
        /// Create a suspender with default capacity and timeout.
        pub fn new() -> Self {
            Self::with_capacity(DEFAULT_CAPACITY)
        }

        /// Create a suspender able to stop up to `capacity` threads.
        pub fn with_capacity(capacity: usize) -> Self {
            Self {
                capacity,
                ack_timeout: DEFAULT_ACK_TIMEOUT,
            }
        }

        /// Set how long to wait for each thread to stop.
        pub fn ack_timeout(mut self, timeout: Duration) -> Self {
            self.ack_timeout = timeout;
            self
        }

        /// Maximum number of threads that can be suspended.
        pub fn capacity(&self) -> usize {
            self.capacity
        }
    }

    impl Suspender for SignalSuspender {
        fn freeze_all(
            &self,
            _threads: Vec<ThreadRecord>,
            _caller: ThreadId,
        ) -> Result<FrozenWorld, SuspendError> {
            Err(SuspendError::Unsupported)
        }

        fn resume_all(&self, _world: FrozenWorld) {}
    }
}
