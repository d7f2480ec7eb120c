//! Linux sampling support.
//!
//! There is no way to read another thread's registers from userspace while
//! it keeps running, so suspension is implemented with a signal handshake:
//! the sampler sends SIGPROF to the target, the handler publishes the
//! interrupted register file and then parks on a semaphore until the sampler
//! has finished reading the target's stack. Semaphore post/wait are
//! async-signal-safe, and the handler preserves errno.

use std::cell::UnsafeCell;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use super::{Registers, SamplingError};

/// On Linux the platform handle for a thread is its kernel tid.
pub type ThreadHandle = u32;

pub fn current_thread_id() -> u32 {
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

pub fn current_thread_handle() -> ThreadHandle {
    current_thread_id()
}

/// Highest address of the current thread's stack.
pub fn current_stack_top() -> u64 {
    unsafe {
        let mut attr: libc::pthread_attr_t = mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return 0;
        }
        let mut stack_addr: *mut libc::c_void = ptr::null_mut();
        let mut stack_size: libc::size_t = 0;
        let result = libc::pthread_attr_getstack(&attr, &mut stack_addr, &mut stack_size);
        libc::pthread_attr_destroy(&mut attr);
        if result != 0 {
            return 0;
        }
        stack_addr as u64 + stack_size as u64
    }
}

struct Semaphore(UnsafeCell<libc::sem_t>);

unsafe impl Sync for Semaphore {}

impl Semaphore {
    fn new() -> Self {
        let sem = Semaphore(UnsafeCell::new(unsafe { mem::zeroed() }));
        unsafe { libc::sem_init(sem.0.get(), 0, 0) };
        sem
    }

    fn post(&self) {
        unsafe { libc::sem_post(self.0.get()) };
    }

    fn wait(&self) {
        unsafe {
            while libc::sem_wait(self.0.get()) == -1
                && *libc::__errno_location() == libc::EINTR
            {}
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { libc::sem_destroy(self.0.get()) };
    }
}

/// Shared state between one `suspend_and_sample_resume` call and the signal
/// handler it triggers. Lives on the sampler thread's stack for the duration
/// of the call.
struct SigHandlerCoordinator {
    regs: UnsafeCell<Registers>,
    /// Posted by the handler once `regs` is filled in.
    regs_published: Semaphore,
    /// Posted by the sampler once the critical section is over.
    resume: Semaphore,
    /// Posted by the handler just before it returns; only then may the
    /// coordinator be popped off the sampler's stack.
    handler_done: Semaphore,
}

unsafe impl Sync for SigHandlerCoordinator {}

static SIG_HANDLER_COORDINATOR: AtomicPtr<SigHandlerCoordinator> =
    AtomicPtr::new(ptr::null_mut());

#[cfg(target_arch = "x86_64")]
unsafe fn registers_from_ucontext(ucontext: &libc::ucontext_t) -> Registers {
    let gregs = &ucontext.uc_mcontext.gregs;
    Registers {
        pc: gregs[libc::REG_RIP as usize] as u64,
        sp: gregs[libc::REG_RSP as usize] as u64,
        fp: gregs[libc::REG_RBP as usize] as u64,
        lr: 0,
    }
}

#[cfg(target_arch = "aarch64")]
unsafe fn registers_from_ucontext(ucontext: &libc::ucontext_t) -> Registers {
    let mcontext = &ucontext.uc_mcontext;
    Registers {
        pc: mcontext.pc,
        sp: mcontext.sp,
        fp: mcontext.regs[29],
        lr: mcontext.regs[30],
    }
}

unsafe extern "C" fn sigprof_handler(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    // Everything in here must be async-signal-safe.
    let saved_errno = *libc::__errno_location();

    let coordinator = SIG_HANDLER_COORDINATOR.load(Ordering::Acquire);
    if !coordinator.is_null() {
        let coordinator = &*coordinator;
        *coordinator.regs.get() = registers_from_ucontext(&*(context as *const libc::ucontext_t));
        coordinator.regs_published.post();
        // Park until the sampler is done walking our stack.
        coordinator.resume.wait();
        coordinator.handler_done.post();
    }

    *libc::__errno_location() = saved_errno;
}

pub struct Sampler {
    sampler_tid: u32,
    old_action: libc::sigaction,
    installed: bool,
}

impl Sampler {
    /// Installs the SIGPROF handler. Call on the thread that will do the
    /// sampling.
    pub fn new() -> Self {
        unsafe {
            let mut new_action: libc::sigaction = mem::zeroed();
            new_action.sa_sigaction = sigprof_handler as libc::sighandler_t;
            new_action.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
            libc::sigemptyset(&mut new_action.sa_mask);
            let mut old_action: libc::sigaction = mem::zeroed();
            libc::sigaction(libc::SIGPROF, &new_action, &mut old_action);
            Sampler {
                sampler_tid: current_thread_id(),
                old_action,
                installed: true,
            }
        }
    }

    /// Restores the previous SIGPROF disposition.
    pub fn disable(&mut self) {
        if self.installed {
            unsafe { libc::sigaction(libc::SIGPROF, &self.old_action, ptr::null_mut()) };
            self.installed = false;
        }
    }

    /// Interrupts `target`, runs `callback` against its register file while
    /// it is parked in the signal handler, then lets it resume.
    ///
    /// The callback runs inside the critical section: it must not allocate
    /// and must not take any lock the target thread could hold.
    pub fn suspend_and_sample_resume<F>(
        &mut self,
        target: ThreadHandle,
        callback: F,
    ) -> Result<(), SamplingError>
    where
        F: FnOnce(&Registers),
    {
        if target == self.sampler_tid || target == current_thread_id() {
            return Err(SamplingError::SelfSample);
        }

        let coordinator = SigHandlerCoordinator {
            regs: UnsafeCell::new(Registers::default()),
            regs_published: Semaphore::new(),
            resume: Semaphore::new(),
            handler_done: Semaphore::new(),
        };
        SIG_HANDLER_COORDINATOR.store(
            &coordinator as *const SigHandlerCoordinator as *mut _,
            Ordering::Release,
        );

        let sent = unsafe {
            libc::syscall(
                libc::SYS_tgkill,
                libc::getpid() as libc::c_long,
                target as libc::c_long,
                libc::SIGPROF as libc::c_long,
            )
        };
        if sent != 0 {
            SIG_HANDLER_COORDINATOR.store(ptr::null_mut(), Ordering::Release);
            let errno = unsafe { *libc::__errno_location() };
            return Err(SamplingError::ThreadTerminated("tgkill", errno));
        }

        coordinator.regs_published.wait();

        // Critical section: the target is parked in its signal handler.
        let regs = unsafe { *coordinator.regs.get() };
        callback(&regs);

        coordinator.resume.post();
        coordinator.handler_done.wait();
        SIG_HANDLER_COORDINATOR.store(ptr::null_mut(), Ordering::Release);

        Ok(())
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.disable();
    }
}
