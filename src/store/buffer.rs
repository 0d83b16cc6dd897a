//! Fixed-capacity, time-aligned sample buffers chained chronologically.

use std::collections::VecDeque;

use crate::error::{Result, StoreError};
use crate::model::BUFFER_CAP;
use crate::store::pool;

/// A contiguous run of samples for one metric at one level. Slot `i`
/// carries the sample whose true timestamp is
/// `start + frequency/2 + i*frequency`.
#[derive(Debug)]
pub struct Buffer {
    frequency: i64,
    start: i64,
    data: Vec<f32>,
    cap: usize,
    archived: bool,
}

impl Buffer {
    fn new(ts: i64, frequency: i64, cap: usize) -> Self {
        let data = if cap == BUFFER_CAP {
            pool::get()
        } else {
            Vec::with_capacity(cap)
        };
        Self {
            frequency,
            start: ts - frequency / 2,
            data,
            cap,
            archived: false,
        }
    }

    /// Materializes a buffer from persisted state. It keeps its natural
    /// length as capacity and never enters the pool.
    pub fn from_snapshot(start: i64, frequency: i64, data: Vec<f32>) -> Self {
        let cap = data.len();
        Self {
            frequency,
            start,
            data,
            cap,
            archived: true,
        }
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn frequency(&self) -> i64 {
        self.frequency
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn archived(&self) -> bool {
        self.archived
    }

    /// Timestamp of slot 0.
    pub fn first_write(&self) -> i64 {
        self.start + self.frequency / 2
    }

    /// Timestamp one step past this buffer's window; a rollover
    /// successor starts exactly here.
    pub fn end(&self) -> i64 {
        self.start + self.data.len() as i64 * self.frequency
    }

    fn release(mut self) {
        if self.cap == BUFFER_CAP {
            self.data.clear();
            pool::put(std::mem::take(&mut self.data));
        }
    }
}

/// Chronologically ordered buffers for one (level, metric) slot. The
/// newest buffer is the head; older buffers are reached front-first.
#[derive(Debug)]
pub struct BufferChain {
    bufs: VecDeque<Buffer>,
    cap: usize,
}

impl Default for BufferChain {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferChain {
    pub fn new() -> Self {
        Self::with_capacity(BUFFER_CAP)
    }

    /// Chain whose buffers roll over after `cap` slots instead of the
    /// canonical constant.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            bufs: VecDeque::new(),
            cap,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Number of linked buffers.
    pub fn depth(&self) -> usize {
        self.bufs.len()
    }

    /// Total sample count across the chain.
    pub fn count(&self) -> usize {
        self.bufs.iter().map(|b| b.data.len()).sum()
    }

    pub fn head(&self) -> Option<&Buffer> {
        self.bufs.back()
    }

    pub fn oldest(&self) -> Option<&Buffer> {
        self.bufs.front()
    }

    /// Appends a restored buffer. Callers feed snapshots oldest-first so
    /// the chronological chain invariant holds.
    pub fn push_loaded(&mut self, buffer: Buffer) {
        self.bufs.push_back(buffer);
    }

    /// Stores `value` at `ts`, overwriting an in-range slot, gap-filling
    /// with NaN, or rolling over into a fresh head buffer.
    pub fn write(&mut self, ts: i64, value: f32, frequency: i64) -> Result<()> {
        let head = match self.bufs.back_mut() {
            Some(head) => head,
            None => {
                let mut b = Buffer::new(ts, frequency, self.cap);
                b.data.push(value);
                self.bufs.push_back(b);
                return Ok(());
            }
        };

        if ts < head.start {
            return Err(StoreError::FromPast {
                ts,
                start: head.start,
            });
        }

        let idx = ((ts - head.start) / head.frequency) as usize;
        if idx < head.data.len() {
            head.data[idx] = value;
            return Ok(());
        }
        if idx < head.cap {
            while head.data.len() < idx {
                head.data.push(f32::NAN);
            }
            head.data.push(value);
            return Ok(());
        }

        let mut b = Buffer::new(ts, frequency, self.cap);
        b.data.push(value);
        self.bufs.push_back(b);
        Ok(())
    }

    /// Accumulates the `[from, to)` range into `data`, stepping by the
    /// metric frequency. Returns the populated length and the actual
    /// `(from, to)` bounds used.
    ///
    /// Missing slots contribute NaN so gaps propagate through summed
    /// sources (`NaN + x == NaN`).
    pub fn read(&self, from: i64, to: i64, data: &mut [f32]) -> Result<(usize, i64, i64)> {
        if self.bufs.is_empty() {
            return Err(StoreError::NoHostOrMetric);
        }

        // Walk toward older buffers while `from` precedes their first
        // slot, clamping once the oldest buffer is reached.
        let mut bi = self.bufs.len() - 1;
        while bi > 0 && from < self.bufs[bi].first_write() {
            bi -= 1;
        }
        let mut from = from;
        if from < self.bufs[bi].first_write() {
            from = self.bufs[bi].first_write();
        }

        let frequency = self.bufs[bi].frequency;
        let mut b = &self.bufs[bi];
        let mut i = 0usize;
        let mut t = from;
        while t < to && i < data.len() {
            let mut idx = (t - b.start) / frequency;
            if idx >= b.cap as i64 {
                bi += 1;
                if bi >= self.bufs.len() {
                    break;
                }
                b = &self.bufs[bi];
                // The new buffer has its own anchor; the slot index must
                // be recomputed, not reset to zero.
                idx = (t - b.start) / frequency;
            }
            if idx < 0 || idx as usize >= b.data.len() || t < b.start {
                data[i] += f32::NAN;
            } else {
                data[i] += b.data[idx as usize];
            }
            i += 1;
            t += frequency;
        }
        Ok((i, from, t))
    }

    /// Drops buffers whose entire window falls before `threshold`,
    /// returning canonical storages to the pool. Returns the number of
    /// buffers freed.
    pub fn free(&mut self, threshold: i64) -> usize {
        let mut freed = 0;
        while let Some(first) = self.bufs.front() {
            if first.end() >= threshold {
                break;
            }
            if let Some(b) = self.bufs.pop_front() {
                b.release();
                freed += 1;
            }
        }
        freed
    }

    /// Unconditionally removes the oldest buffer. Used by the
    /// memory-pressure path.
    pub fn force_free_oldest(&mut self) -> bool {
        match self.bufs.pop_front() {
            Some(b) => {
                b.release();
                true
            }
            None => false,
        }
    }

    /// Invokes `cb`, oldest first, on every buffer whose window
    /// intersects `[from, to]`. Stops at the first callback error.
    pub fn iter_from_to<F>(&self, from: i64, to: i64, mut cb: F) -> Result<()>
    where
        F: FnMut(&Buffer) -> Result<()>,
    {
        for b in &self.bufs {
            if b.start <= to && from <= b.end() {
                cb(b)?;
            }
        }
        Ok(())
    }
}
