//! SIGSEGV plumbing. Translates the kernel's view of a fault into a
//! [`FaultCtx`], asks the JIT to recover, and either resumes the patched
//! context or lets the default handler kill the process.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::jit::fastmem::FaultCtx;
use crate::EmuCtx;

static ACTIVE_CTX: AtomicUsize = AtomicUsize::new(0);

/// x86-64 register number -> Linux gregs index.
const GREG_MAP: [i32; 16] = [
    libc::REG_RAX,
    libc::REG_RCX,
    libc::REG_RDX,
    libc::REG_RBX,
    libc::REG_RSP,
    libc::REG_RBP,
    libc::REG_RSI,
    libc::REG_RDI,
    libc::REG_R8,
    libc::REG_R9,
    libc::REG_R10,
    libc::REG_R11,
    libc::REG_R12,
    libc::REG_R13,
    libc::REG_R14,
    libc::REG_R15,
];

unsafe extern "C" fn segv_handler(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    raw_ctx: *mut libc::c_void,
) {
    let handled = unsafe {
        let access_address = (*info).si_addr() as usize;
        let uctx = &mut *(raw_ctx as *mut libc::ucontext_t);
        let gregs = &mut uctx.uc_mcontext.gregs;

        let mut fault_ctx = FaultCtx {
            rip: gregs[libc::REG_RIP as usize] as usize,
            regs: [0; 16],
        };
        for (reg, &index) in GREG_MAP.iter().enumerate() {
            fault_ctx.regs[reg] = gregs[index as usize] as u64;
        }

        let ctx = ACTIVE_CTX.load(Ordering::Acquire) as *mut EmuCtx;
        let handled = !ctx.is_null()
            && crate::jit::handle_fault_raw(ctx, access_address, &mut fault_ctx);
        if handled {
            gregs[libc::REG_RIP as usize] = fault_ctx.rip as i64;
            for (reg, &index) in GREG_MAP.iter().enumerate() {
                gregs[index as usize] = fault_ctx.regs[reg] as i64;
            }
        }
        handled
    };

    if !handled {
        // Fall back to the default action: returning re-executes the
        // faulting instruction and the OS kills the process.
        unsafe {
            libc::signal(libc::SIGSEGV, libc::SIG_DFL);
            libc::signal(libc::SIGBUS, libc::SIG_DFL);
        }
    }
}

/// Installs the fault handler for `ctx`. The BLR stack guard can fire
/// with rsp inside a guard page, so the handler runs on an alternate
/// stack.
pub fn install(ctx: *mut EmuCtx) {
    ACTIVE_CTX.store(ctx as usize, Ordering::Release);

    unsafe {
        let mut alt: libc::stack_t = std::mem::zeroed();
        let size = libc::SIGSTKSZ.max(64 * 1024);
        alt.ss_sp = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        alt.ss_size = size;
        alt.ss_flags = 0;
        libc::sigaltstack(&alt, std::ptr::null_mut());

        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = segv_handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGBUS, &action, std::ptr::null_mut());
    }
}

pub fn uninstall() {
    ACTIVE_CTX.store(0, Ordering::Release);
}
