//! Monotonic tick source used for busy/idle accounting. Backed by
//! CLOCK_MONOTONIC_RAW so ticks never jump with wall clock adjustments; one
//! tick is one nanosecond.

/// current tick count
pub fn ticks() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

/// tick frequency in Hz
pub fn ticks_hz() -> u64 {
    1_000_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_advance() {
        let a = ticks();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let b = ticks();
        assert!(b > a);
        assert!(b - a >= ticks_hz() / 1_000);
    }
}
