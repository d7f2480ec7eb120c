//! macOS sampling support, built on mach thread APIs: `thread_suspend`,
//! `thread_get_state`, `thread_resume`.

use std::mem;

use mach2::kern_return::{kern_return_t, KERN_INVALID_ARGUMENT, KERN_SUCCESS, KERN_TERMINATED};
use mach2::port::mach_port_t;
use mach2::thread_act::{thread_get_state, thread_resume, thread_suspend};
use mach2::thread_status::thread_state_t;

use super::{Registers, SamplingError};

/// On macOS the platform handle for a thread is its mach thread port.
pub type ThreadHandle = mach_port_t;

const MACH_SEND_INVALID_DEST: kern_return_t = 0x10000003;

pub fn current_thread_id() -> u32 {
    let mut tid: u64 = 0;
    unsafe { libc::pthread_threadid_np(libc::pthread_self(), &mut tid) };
    tid as u32
}

pub fn current_thread_handle() -> ThreadHandle {
    // Does not take an extra port reference, unlike mach_thread_self.
    unsafe { libc::pthread_mach_thread_np(libc::pthread_self()) }
}

/// Highest address of the current thread's stack.
pub fn current_stack_top() -> u64 {
    unsafe { libc::pthread_get_stackaddr_np(libc::pthread_self()) as u64 }
}

fn map_kern_error(context: &'static str, kr: kern_return_t) -> SamplingError {
    match kr {
        KERN_INVALID_ARGUMENT | KERN_TERMINATED | MACH_SEND_INVALID_DEST => {
            SamplingError::ThreadTerminated(context, kr)
        }
        kr => SamplingError::Ignorable(context, kr),
    }
}

#[cfg(target_arch = "x86_64")]
fn get_registers(thread: ThreadHandle) -> Result<Registers, SamplingError> {
    use mach2::structs::x86_thread_state64_t;
    use mach2::thread_status::x86_THREAD_STATE64;

    let mut state: x86_thread_state64_t = unsafe { mem::zeroed() };
    let mut count = x86_thread_state64_t::count();
    let kr = unsafe {
        thread_get_state(
            thread,
            x86_THREAD_STATE64,
            &mut state as *mut _ as thread_state_t,
            &mut count,
        )
    };
    if kr != KERN_SUCCESS {
        return Err(map_kern_error("thread_get_state", kr));
    }
    Ok(Registers {
        pc: state.__rip,
        sp: state.__rsp,
        fp: state.__rbp,
        lr: 0,
    })
}

#[cfg(target_arch = "aarch64")]
mod arm {
    use mach2::thread_status::thread_state_flavor_t;

    // mach2 does not ship the arm thread state, so bind it here.
    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    #[allow(non_camel_case_types)]
    pub struct arm_thread_state64_t {
        pub __x: [u64; 29],
        pub __fp: u64,
        pub __lr: u64,
        pub __sp: u64,
        pub __pc: u64,
        pub __cpsr: u32,
        pub __pad: u32,
    }

    pub const ARM_THREAD_STATE64: thread_state_flavor_t = 6;

    pub const ARM_THREAD_STATE64_COUNT: u32 =
        (std::mem::size_of::<arm_thread_state64_t>() / std::mem::size_of::<u32>()) as u32;
}

#[cfg(target_arch = "aarch64")]
fn get_registers(thread: ThreadHandle) -> Result<Registers, SamplingError> {
    use arm::{arm_thread_state64_t, ARM_THREAD_STATE64, ARM_THREAD_STATE64_COUNT};

    let mut state: arm_thread_state64_t = unsafe { mem::zeroed() };
    let mut count = ARM_THREAD_STATE64_COUNT;
    let kr = unsafe {
        thread_get_state(
            thread,
            ARM_THREAD_STATE64,
            &mut state as *mut _ as thread_state_t,
            &mut count,
        )
    };
    if kr != KERN_SUCCESS {
        return Err(map_kern_error("thread_get_state", kr));
    }
    // Strip pointer authentication bits; 47 address bits is the conservative
    // default for user space.
    let mask = (1u64 << 47) - 1;
    Ok(Registers {
        pc: state.__pc & mask,
        sp: state.__sp,
        fp: state.__fp & mask,
        lr: state.__lr & mask,
    })
}

pub struct Sampler {
    sampler_thread: ThreadHandle,
}

impl Sampler {
    pub fn new() -> Self {
        Sampler {
            sampler_thread: current_thread_handle(),
        }
    }

    /// No process-wide state to undo on macOS.
    pub fn disable(&mut self) {}

    /// Suspends `target`, runs `callback` against its register file, then
    /// resumes it.
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
        if target == self.sampler_thread || target == current_thread_handle() {
            return Err(SamplingError::SelfSample);
        }

        let kr = unsafe { thread_suspend(target) };
        if kr != KERN_SUCCESS {
            return Err(map_kern_error("thread_suspend", kr));
        }

        let result = get_registers(target);
        if let Ok(regs) = &result {
            callback(regs);
        }

        let _ = unsafe { thread_resume(target) };
        result.map(|_| ())
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.disable();
    }
}
