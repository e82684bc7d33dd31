//! Monotonic timestamps and platform identity for trace headers
//!
//! Timestamps come from `CLOCK_BOOTTIME` on Linux/Android (keeps counting
//! across suspend) and `CLOCK_MONOTONIC` elsewhere. Producers and the drain
//! must read the same clock for heartbeat staleness checks to make sense.

#![allow(unsafe_code)]

/// Architecture values used in trace headers
pub const ARCH_X86_64: u8 = 1;
pub const ARCH_ARM64: u8 = 2;

/// Operating system values used in trace headers
pub const OS_IOS: u8 = 1;
pub const OS_ANDROID: u8 = 2;
pub const OS_MACOS: u8 = 3;
pub const OS_LINUX: u8 = 4;
pub const OS_WINDOWS: u8 = 5;

/// Clock type values used in trace headers
pub const CLOCK_MACH_CONTINUOUS: u8 = 1;
pub const CLOCK_QPC: u8 = 2;
pub const CLOCK_BOOTTIME: u8 = 3;

#[cfg(any(target_os = "linux", target_os = "android"))]
const CLOCK_ID: libc::clockid_t = libc::CLOCK_BOOTTIME;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const CLOCK_ID: libc::clockid_t = libc::CLOCK_MONOTONIC;

/// Current monotonic time in nanoseconds
///
/// Returns 0 if the clock cannot be read, which never happens for the clock
/// ids used here.
#[must_use]
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: ts is a valid, writable timespec for the duration of the call
    let rc = unsafe { libc::clock_gettime(CLOCK_ID, &mut ts) };
    if rc != 0 {
        return 0;
    }
    #[allow(clippy::cast_sign_loss)]
    let ns = (ts.tv_sec as u64).saturating_mul(1_000_000_000).saturating_add(ts.tv_nsec as u64);
    ns
}

/// Architecture of the running binary
#[must_use]
pub const fn host_arch() -> u8 {
    if cfg!(target_arch = "aarch64") {
        ARCH_ARM64
    } else {
        ARCH_X86_64
    }
}

/// Operating system of the running binary
#[must_use]
pub const fn host_os() -> u8 {
    if cfg!(target_os = "android") {
        OS_ANDROID
    } else if cfg!(target_os = "ios") {
        OS_IOS
    } else if cfg!(target_os = "macos") {
        OS_MACOS
    } else if cfg!(target_os = "windows") {
        OS_WINDOWS
    } else {
        OS_LINUX
    }
}

/// Clock type recorded in trace headers for [`now_ns`]
#[must_use]
pub const fn host_clock() -> u8 {
    if cfg!(any(target_os = "macos", target_os = "ios")) {
        CLOCK_MACH_CONTINUOUS
    } else if cfg!(target_os = "windows") {
        CLOCK_QPC
    } else {
        CLOCK_BOOTTIME
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn test_host_identity_is_known() {
        assert!(matches!(host_arch(), ARCH_X86_64 | ARCH_ARM64));
        assert!((OS_IOS..=OS_WINDOWS).contains(&host_os()));
        assert!((CLOCK_MACH_CONTINUOUS..=CLOCK_BOOTTIME).contains(&host_clock()));
    }
}
