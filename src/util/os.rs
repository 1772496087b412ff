//! Thin wrappers over the OS facilities the suspension core needs:
//! thread ids, futex waits, scheduler-state sampling and a monotonic
//! nanosecond clock.

use std::time::Instant;

lazy_static! {
    static ref PROCESS_START: Instant = Instant::now();
}

/// Monotonic nanoseconds since an arbitrary process-local epoch.
pub fn nanotime() -> u64 {
    PROCESS_START.elapsed().as_nanos() as u64
}

/// The OS thread id of the calling thread.
#[cfg(target_os = "linux")]
pub fn gettid() -> libc::pid_t {
    // SYS_gettid has no libc wrapper on older glibc.
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

#[cfg(not(target_os = "linux"))]
pub fn gettid() -> libc::pid_t {
    // Fall back to a process-unique token derived from pthread_self.
    unsafe { libc::pthread_self() as libc::pid_t }
}

/// The nice value of the given thread. Positive means lower priority.
/// Returns 0 if the value cannot be read.
#[cfg(target_os = "linux")]
pub fn native_priority(tid: libc::pid_t) -> i32 {
    // getpriority can legitimately return -1, so clear errno first.
    unsafe {
        *libc::__errno_location() = 0;
        let prio = libc::getpriority(libc::PRIO_PROCESS, tid as libc::id_t);
        if *libc::__errno_location() != 0 {
            0
        } else {
            prio
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn native_priority(_tid: libc::pid_t) -> i32 {
    0
}

/// Read `/proc/<tid>/stat` for a thread of this process. Returns an empty
/// string if the thread is gone or we are not on Linux.
pub fn thread_stat_quick(tid: libc::pid_t) -> String {
    if !cfg!(target_os = "linux") || tid == 0 {
        return String::new();
    }
    let task_path = format!("/proc/self/task/{}/stat", tid);
    match std::fs::read_to_string(&task_path) {
        Ok(s) => s.trim_end().to_string(),
        // The tid may belong to another process (or be gone already).
        Err(_) => std::fs::read_to_string(format!("/proc/{}/stat", tid))
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Extract the scheduler state character (R, S, D, t, Z, ...) from a stat
/// line. The comm field is parenthesised and may itself contain spaces or
/// parentheses, so scan from the last ')'.
pub fn state_from_stat(stat: &str) -> Option<char> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.chars().find(|c| !c.is_whitespace())
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", feature = "futex"))] {
        use std::sync::atomic::AtomicU32;
        use std::time::Duration;

        /// Block until `*word != expected` or the timeout elapses.
        /// Returns true if the wait timed out.
        pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> bool {
            let ts = timeout.map(|t| libc::timespec {
                tv_sec: t.as_secs() as libc::time_t,
                tv_nsec: t.subsec_nanos() as libc::c_long,
            });
            let ts_ptr = ts
                .as_ref()
                .map(|t| t as *const libc::timespec)
                .unwrap_or(std::ptr::null());
            let res = unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    word.as_ptr(),
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    expected,
                    ts_ptr,
                    std::ptr::null::<u32>(),
                    0u32,
                )
            };
            if res != 0 {
                let errno = unsafe { *libc::__errno_location() };
                match errno {
                    libc::ETIMEDOUT => return true,
                    libc::EAGAIN | libc::EINTR => return false,
                    _ => panic!("futex wait failed: errno {}", errno),
                }
            }
            false
        }

        /// Wake every waiter blocked on `word`.
        pub fn futex_wake_all(word: &AtomicU32) {
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    word.as_ptr(),
                    libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                    i32::MAX,
                    std::ptr::null::<libc::timespec>(),
                    std::ptr::null::<u32>(),
                    0u32,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_state_parses() {
        // A comm field with spaces and a ')' in it, like real kernels emit.
        let stat = "1234 (weird (comm) x) S 1 1234 1234 0 -1";
        assert_eq!(state_from_stat(stat), Some('S'));
        assert_eq!(state_from_stat("no parens here"), None);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn own_thread_is_running() {
        let stat = thread_stat_quick(gettid());
        assert!(!stat.is_empty());
        // We are on-CPU reading our own stat.
        assert_eq!(state_from_stat(&stat), Some('R'));
    }

    #[test]
    fn nanotime_is_monotonic() {
        let a = nanotime();
        let b = nanotime();
        assert!(b >= a);
    }
}
