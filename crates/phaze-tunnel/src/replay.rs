//! Replay Protection
//!
//! Sliding bitmap over recently accepted sequence numbers. Frames may
//! arrive out of order within the window; duplicates and anything older
//! than the window are rejected.

use crate::codec::CodecError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default window size in frames
pub const DEFAULT_WINDOW: usize = 64;

/// Sliding replay window.
///
/// Bit `n` of the bitmap records whether `highest - n` was accepted.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    bitmap: Vec<u64>,
    size: u64,
    highest: u64,
    initialized: bool,
}

impl ReplayWindow {
    /// Create a window tracking `size` sequence numbers (minimum 1)
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            bitmap: vec![0; size.div_ceil(64)],
            size: size as u64,
            highest: 0,
            initialized: false,
        }
    }

    /// Window size in frames
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Highest accepted sequence, if any
    pub fn highest(&self) -> Option<u64> {
        self.initialized.then_some(self.highest)
    }

    /// Check whether `seq` would be rejected, without updating
    pub fn is_replay(&self, seq: u64) -> bool {
        if !self.initialized || seq > self.highest {
            return false;
        }

        let diff = self.highest - seq;
        if diff >= self.size {
            return true;
        }
        self.bit(diff)
    }

    /// Accept `seq` if it is new and inside the window
    pub fn check_and_update(&mut self, seq: u64) -> Result<(), CodecError> {
        if !self.initialized {
            self.initialized = true;
            self.highest = seq;
            self.set_bit(0);
            return Ok(());
        }

        if seq > self.highest {
            self.shift(seq - self.highest);
            self.highest = seq;
            self.set_bit(0);
            return Ok(());
        }

        let diff = self.highest - seq;
        if diff >= self.size || self.bit(diff) {
            return Err(CodecError::Replayed { sequence: seq });
        }
        self.set_bit(diff);
        Ok(())
    }

    /// Forget everything
    pub fn reset(&mut self) {
        self.bitmap.iter_mut().for_each(|w| *w = 0);
        self.highest = 0;
        self.initialized = false;
    }

    fn bit(&self, diff: u64) -> bool {
        let idx = diff as usize;
        self.bitmap[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    fn set_bit(&mut self, diff: u64) {
        let idx = diff as usize;
        self.bitmap[idx / 64] |= 1u64 << (idx % 64);
    }

    /// Move every recorded bit `shift` positions towards older
    fn shift(&mut self, shift: u64) {
        if shift >= self.size {
            self.bitmap.iter_mut().for_each(|w| *w = 0);
            return;
        }

        let words = (shift / 64) as usize;
        let bits = (shift % 64) as u32;
        let len = self.bitmap.len();

        for i in (0..len).rev() {
            let mut value = 0;
            if i >= words {
                value = self.bitmap[i - words] << bits;
                if bits > 0 && i > words {
                    value |= self.bitmap[i - words - 1] >> (64 - bits);
                }
            }
            self.bitmap[i] = value;
        }
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

/// Per-session sequence bookkeeping for both directions.
///
/// Outlives individual transports so sequence numbers keep increasing
/// across reconnects.
#[derive(Debug)]
pub struct SequenceState {
    next_tx: AtomicU64,
    rx_window: Mutex<ReplayWindow>,
}

impl SequenceState {
    pub fn new(window: usize) -> Self {
        Self {
            next_tx: AtomicU64::new(0),
            rx_window: Mutex::new(ReplayWindow::new(window)),
        }
    }

    /// Allocate the next outbound sequence number
    pub fn next_sequence(&self) -> u64 {
        self.next_tx.fetch_add(1, Ordering::Relaxed)
    }

    /// Cheap pre-check before decryption
    pub fn is_replay(&self, seq: u64) -> bool {
        self.rx_window.lock().is_replay(seq)
    }

    /// Record an authenticated inbound sequence number
    pub fn accept(&self, seq: u64) -> Result<(), CodecError> {
        self.rx_window.lock().check_and_update(seq)
    }
}

impl Default for SequenceState {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted(window: &mut ReplayWindow, seqs: &[u64]) -> Vec<u64> {
        seqs.iter()
            .copied()
            .filter(|&seq| window.check_and_update(seq).is_ok())
            .collect()
    }

    #[test]
    fn test_out_of_order_within_window() {
        let mut window = ReplayWindow::new(64);
        assert_eq!(accepted(&mut window, &[5, 3, 4, 9]), vec![5, 3, 4, 9]);
    }

    #[test]
    fn test_duplicate_dropped() {
        let mut window = ReplayWindow::new(64);
        assert_eq!(accepted(&mut window, &[5, 5]), vec![5]);
        assert!(window.is_replay(5));
    }

    #[test]
    fn test_below_window_rejected() {
        let mut window = ReplayWindow::new(64);
        window.check_and_update(100).unwrap();

        assert_eq!(
            window.check_and_update(36),
            Err(CodecError::Replayed { sequence: 36 })
        );
        assert!(window.check_and_update(37).is_ok());
    }

    #[test]
    fn test_bits_survive_shift() {
        let mut window = ReplayWindow::new(256);
        window.check_and_update(10).unwrap();
        window.check_and_update(7).unwrap();

        // crosses a word boundary
        window.check_and_update(80).unwrap();
        assert!(window.is_replay(10));
        assert!(window.is_replay(7));
        assert!(!window.is_replay(8));

        window.check_and_update(200).unwrap();
        assert!(window.is_replay(10));
        assert!(!window.is_replay(9));
        assert!(window.is_replay(80));
    }

    #[test]
    fn test_large_jump_clears_window() {
        let mut window = ReplayWindow::new(64);
        window.check_and_update(1).unwrap();
        window.check_and_update(1_000).unwrap();

        assert!(window.is_replay(1));
        assert!(!window.is_replay(999));
        assert_eq!(window.highest(), Some(1_000));
    }

    #[test]
    fn test_odd_window_size() {
        let mut window = ReplayWindow::new(3);
        window.check_and_update(10).unwrap();

        assert!(window.check_and_update(8).is_ok());
        assert!(window.check_and_update(7).is_err());
    }

    #[test]
    fn test_reset() {
        let mut window = ReplayWindow::default();
        window.check_and_update(5).unwrap();
        window.reset();

        assert_eq!(window.highest(), None);
        assert!(window.check_and_update(5).is_ok());
    }

    #[test]
    fn test_sequence_state() {
        let state = SequenceState::new(64);
        assert_eq!(state.next_sequence(), 0);
        assert_eq!(state.next_sequence(), 1);

        assert!(state.accept(3).is_ok());
        assert!(state.is_replay(3));
        assert!(state.accept(3).is_err());
    }
}
