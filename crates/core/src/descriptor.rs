// SPDX-License-Identifier: MIT

//! Descriptor-router math (§2.5) and the one-time `dtblsize` capture.

use std::os::fd::RawFd;

/// `shard = fd & (N-1)`. `n` must be a power of two (§9 "Shard by bit
/// mask"); callers are responsible for upholding that invariant — this
/// function does not validate it, to stay a hot-path one-liner.
#[inline]
pub fn shard_for(fd: RawFd, n: usize) -> usize {
    debug_assert!(n.is_power_of_two());
    (fd as usize) & (n - 1)
}

/// Capture the process's max-open-files limit once at startup (§9, open
/// question #1: lowering this limit after the daemon has started is
/// unspecified behavior and must not be done). This function is
/// intentionally only ever called once, from `Daemon::new`.
pub fn capture_dtblsize() -> usize {
    match nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE) {
        Ok((soft, _hard)) => soft as usize,
        Err(_) => 1024,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn shard_for_masks_low_bits() {
        assert_eq!(shard_for(10, 4), 2);
        assert_eq!(shard_for(11, 4), 3);
        assert_eq!(shard_for(11, 1), 0);
    }

    #[test]
    fn dtblsize_is_nonzero() {
        assert!(capture_dtblsize() > 0);
    }

    proptest! {
        /// Total coverage of the descriptor router: for any power-of-two
        /// shard count, every fd lands in `0..n`, and any two fds that
        /// differ only in bits above `n`'s mask land on the same shard.
        #[test]
        fn shard_for_is_total_and_mask_stable(
            fd in 0..i32::MAX,
            shift in 0u32..10,
            high_bits in 0i32..i32::MAX,
        ) {
            let n = 1usize << shift;
            let idx = shard_for(fd, n);
            prop_assert!(idx < n);

            let mask = (n as i32) - 1;
            let perturbed = (fd & mask) | (high_bits & !mask);
            prop_assert_eq!(shard_for(perturbed, n), idx);
        }
    }
}
