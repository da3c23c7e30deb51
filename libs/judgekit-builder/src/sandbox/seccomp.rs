// seccomp-BPF syscall filters.
//
// The program is built in the parent (allocation is not allowed after fork)
// and installed in the child right before exec. A denied call kills the
// whole process with SIGSYS, which the executor reports as a security
// violation.

use super::SyscallPolicy;
use libc::{c_ulong, sock_filter, sock_fprog};
use std::io;

const BPF_LD_W_ABS: u16 = 0x20;
const BPF_JMP_JEQ_K: u16 = 0x15;
const BPF_JMP_JSET_K: u16 = 0x45;
const BPF_RET_K: u16 = 0x06;

const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

// Offsets into struct seccomp_data.
const DATA_NR: u32 = 0;
const DATA_ARCH: u32 = 4;
const DATA_ARG0_LOW: u32 = 16;

const SYS_CLONE3: u32 = 435;
const CLONE_THREAD: u32 = 0x0001_0000;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH: u32 = 0xC000_003E;
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH: u32 = 0xC000_00B7;

#[cfg(target_arch = "x86_64")]
const X32_SYSCALL_BIT: u32 = 0x4000_0000;

fn stmt(code: u16, k: u32) -> sock_filter {
    sock_filter { code, jt: 0, jf: 0, k }
}

fn jump(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

fn denied_syscalls(policy: SyscallPolicy) -> Vec<u32> {
    let mut denied = vec![
        libc::SYS_socket,
        libc::SYS_connect,
        libc::SYS_bind,
        libc::SYS_listen,
        libc::SYS_accept,
        libc::SYS_accept4,
        libc::SYS_ptrace,
        libc::SYS_process_vm_writev,
        libc::SYS_kill,
        libc::SYS_setsid,
        libc::SYS_setpgid,
        libc::SYS_unshare,
        libc::SYS_setns,
    ];
    #[cfg(target_arch = "x86_64")]
    denied.extend([libc::SYS_fork, libc::SYS_vfork]);
    if policy == SyscallPolicy::SingleProcess {
        denied.push(libc::SYS_clone);
    }
    denied.into_iter().map(|nr| nr as u32).collect()
}

/// Filter program for `policy`, or `None` when nothing is filtered.
pub fn build_filter(policy: SyscallPolicy) -> Option<Vec<sock_filter>> {
    if policy == SyscallPolicy::Unrestricted {
        return None;
    }

    let kill = stmt(BPF_RET_K, SECCOMP_RET_KILL_PROCESS);
    let mut program = vec![
        stmt(BPF_LD_W_ABS, DATA_ARCH),
        jump(BPF_JMP_JEQ_K, AUDIT_ARCH, 1, 0),
        kill,
        stmt(BPF_LD_W_ABS, DATA_NR),
    ];

    #[cfg(target_arch = "x86_64")]
    {
        program.push(jump(BPF_JMP_JSET_K, X32_SYSCALL_BIT, 0, 1));
        program.push(kill);
    }

    for nr in denied_syscalls(policy) {
        program.push(jump(BPF_JMP_JEQ_K, nr, 0, 1));
        program.push(kill);
    }

    // glibc falls back to clone when clone3 is unavailable, so clone3 is
    // refused with ENOSYS and the flags check below applies.
    program.push(jump(BPF_JMP_JEQ_K, SYS_CLONE3, 0, 1));
    program.push(stmt(BPF_RET_K, SECCOMP_RET_ERRNO | libc::ENOSYS as u32));

    if policy == SyscallPolicy::NoSubprocess {
        program.push(jump(BPF_JMP_JEQ_K, libc::SYS_clone as u32, 0, 3));
        program.push(stmt(BPF_LD_W_ABS, DATA_ARG0_LOW));
        program.push(jump(BPF_JMP_JSET_K, CLONE_THREAD, 1, 0));
        program.push(kill);
    }

    program.push(stmt(BPF_RET_K, SECCOMP_RET_ALLOW));
    Some(program)
}

/// Install `filter` on the calling thread. Only called between fork and exec.
pub fn install(filter: &[sock_filter]) -> io::Result<()> {
    let program = sock_fprog {
        len: filter.len() as libc::c_ushort,
        filter: filter.as_ptr() as *mut sock_filter,
    };
    // SAFETY: prctl with these options only reads `program`, which outlives the calls.
    unsafe {
        if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1 as c_ulong, 0 as c_ulong, 0 as c_ulong, 0 as c_ulong) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::prctl(
            libc::PR_SET_SECCOMP,
            libc::SECCOMP_MODE_FILTER as c_ulong,
            &program as *const sock_fprog as c_ulong,
            0 as c_ulong,
            0 as c_ulong,
        ) != 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal classic-BPF interpreter covering the opcodes emitted above.
    fn evaluate(program: &[sock_filter], arch: u32, nr: u32, arg0: u32) -> u32 {
        let mut acc = 0u32;
        let mut pc = 0usize;
        loop {
            let insn = program[pc];
            match insn.code {
                BPF_LD_W_ABS => {
                    acc = match insn.k {
                        DATA_NR => nr,
                        DATA_ARCH => arch,
                        DATA_ARG0_LOW => arg0,
                        other => panic!("unexpected load offset {other}"),
                    };
                    pc += 1;
                }
                BPF_JMP_JEQ_K => {
                    let offset = if acc == insn.k { insn.jt } else { insn.jf };
                    pc += 1 + offset as usize;
                }
                BPF_JMP_JSET_K => {
                    let offset = if acc & insn.k != 0 { insn.jt } else { insn.jf };
                    pc += 1 + offset as usize;
                }
                BPF_RET_K => return insn.k,
                other => panic!("unexpected opcode {other:#x}"),
            }
        }
    }

    fn run(policy: SyscallPolicy, nr: libc::c_long, arg0: u32) -> u32 {
        let program = build_filter(policy).unwrap();
        evaluate(&program, AUDIT_ARCH, nr as u32, arg0)
    }

    #[test]
    fn test_unrestricted_has_no_filter() {
        assert!(build_filter(SyscallPolicy::Unrestricted).is_none());
    }

    #[test]
    fn test_ordinary_syscalls_are_allowed() {
        for policy in [SyscallPolicy::NoSubprocess, SyscallPolicy::SingleProcess] {
            assert_eq!(run(policy, libc::SYS_read, 0), SECCOMP_RET_ALLOW);
            assert_eq!(run(policy, libc::SYS_write, 0), SECCOMP_RET_ALLOW);
            assert_eq!(run(policy, libc::SYS_execve, 0), SECCOMP_RET_ALLOW);
            assert_eq!(run(policy, libc::SYS_exit_group, 0), SECCOMP_RET_ALLOW);
        }
    }

    #[test]
    fn test_network_and_signals_are_fatal() {
        assert_eq!(run(SyscallPolicy::NoSubprocess, libc::SYS_socket, 0), SECCOMP_RET_KILL_PROCESS);
        assert_eq!(run(SyscallPolicy::NoSubprocess, libc::SYS_kill, 0), SECCOMP_RET_KILL_PROCESS);
        assert_eq!(run(SyscallPolicy::SingleProcess, libc::SYS_ptrace, 0), SECCOMP_RET_KILL_PROCESS);
    }

    #[test]
    fn test_no_subprocess_allows_threads_only() {
        let thread_flags = CLONE_THREAD | 0x0000_0100;
        assert_eq!(run(SyscallPolicy::NoSubprocess, libc::SYS_clone, thread_flags), SECCOMP_RET_ALLOW);
        // fork() via clone(SIGCHLD)
        assert_eq!(
            run(SyscallPolicy::NoSubprocess, libc::SYS_clone, libc::SIGCHLD as u32),
            SECCOMP_RET_KILL_PROCESS
        );
    }

    #[test]
    fn test_single_process_denies_all_clones() {
        assert_eq!(
            run(SyscallPolicy::SingleProcess, libc::SYS_clone, CLONE_THREAD),
            SECCOMP_RET_KILL_PROCESS
        );
    }

    #[test]
    fn test_clone3_reports_enosys() {
        assert_eq!(
            run(SyscallPolicy::NoSubprocess, SYS_CLONE3 as libc::c_long, 0),
            SECCOMP_RET_ERRNO | libc::ENOSYS as u32
        );
    }

    #[test]
    fn test_foreign_architecture_is_fatal() {
        let program = build_filter(SyscallPolicy::NoSubprocess).unwrap();
        assert_eq!(
            evaluate(&program, 0x4000_0003, libc::SYS_read as u32, 0),
            SECCOMP_RET_KILL_PROCESS
        );
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_fork_and_vfork_are_fatal() {
        assert_eq!(run(SyscallPolicy::NoSubprocess, libc::SYS_fork, 0), SECCOMP_RET_KILL_PROCESS);
        assert_eq!(run(SyscallPolicy::NoSubprocess, libc::SYS_vfork, 0), SECCOMP_RET_KILL_PROCESS);
    }
}
