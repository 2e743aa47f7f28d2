//! # Capture Window Accumulation
//!
//! Audio devices hand over samples in whatever block size the driver picked. The
//! encoder works on fixed windows (4096 samples by default), so this buffer collects
//! device blocks and releases exactly one window at a time.
//!
//! ## Key Features:
//! - **Exact windows**: every window released has precisely `window_size` samples
//! - **Order preserving**: samples leave in the order they arrived, none are skipped
//! - **No partial frames**: a trailing short read stays buffered and is dropped on reset

/// Accumulates device samples into fixed-size capture windows.
///
/// ## Rust Concepts:
/// - **Vec<f32>**: Growable buffer owned by the capture callback
/// - **FnMut callback**: `push` hands each finished window to the caller without allocating a list
#[derive(Debug)]
pub struct WindowAccumulator {
    /// Samples waiting for the current window to fill
    pending: Vec<f32>,

    /// Number of samples per released window
    window_size: usize,

    /// Channels interleaved in the device blocks (downmixed to mono)
    channels: usize,
}

impl WindowAccumulator {
    /// Create an accumulator for mono input.
    pub fn new(window_size: usize) -> Self {
        Self::with_channels(window_size, 1)
    }

    /// Create an accumulator for interleaved multi-channel input.
    ///
    /// ## Downmix:
    /// Each interleaved frame is averaged to one mono sample before windowing.
    pub fn with_channels(window_size: usize, channels: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            pending: Vec::with_capacity(window_size),
            window_size,
            channels: channels.max(1),
        }
    }

    /// Append a device block, calling `on_window` once for every completed window.
    pub fn push<F>(&mut self, data: &[f32], mut on_window: F)
    where
        F: FnMut(Vec<f32>),
    {
        for frame in data.chunks(self.channels) {
            // A torn frame at the end of a block would skew the downmix
            if frame.len() < self.channels {
                break;
            }
            let sample = if self.channels == 1 {
                frame[0]
            } else {
                frame.iter().sum::<f32>() / self.channels as f32
            };
            self.pending.push(sample);

            // When we have a full window, hand it over
            if self.pending.len() == self.window_size {
                let window = std::mem::replace(&mut self.pending, Vec::with_capacity(self.window_size));
                on_window(window);
            }
        }
    }

    /// Samples waiting for the next window.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Discard any partial window.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_releases_exact_windows_in_order() {
        let mut acc = WindowAccumulator::new(4);
        let mut windows = Vec::new();

        acc.push(&[1.0, 2.0, 3.0], |w| windows.push(w));
        assert!(windows.is_empty());
        assert_eq!(acc.pending_len(), 3);

        acc.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0], |w| windows.push(w));
        assert_eq!(windows, vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]]);
        assert_eq!(acc.pending_len(), 1);
    }

    #[test]
    fn test_short_read_never_released() {
        let mut acc = WindowAccumulator::new(4096);
        let mut released = 0;
        acc.push(&vec![0.0; 4000], |_| released += 1);
        acc.reset();
        acc.push(&vec![0.0; 100], |_| released += 1);
        assert_eq!(released, 0);
        assert_eq!(acc.pending_len(), 100);
    }

    #[test]
    fn test_stereo_downmix() {
        let mut acc = WindowAccumulator::with_channels(2, 2);
        let mut windows = Vec::new();
        acc.push(&[1.0, 0.0, 0.5, 0.5], |w| windows.push(w));
        assert_eq!(windows, vec![vec![0.5, 0.5]]);
    }
}
