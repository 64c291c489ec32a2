//! Per-device sample buffers.
//!
//! Every device gets one `DeviceAnalysisState`: the raw IMU window used for
//! feature extraction plus the derived series (acc/gyro magnitude, pitch,
//! roll) the rule detector reads. Both are fixed-capacity rings updated
//! sample by sample, so a push never reallocates.

use crate::model::ImuSample;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fixed-capacity FIFO. Oldest entries are overwritten first.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    data: Vec<T>,
    write_index: usize,
    filled: bool,
}

impl<T: Copy + Default> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: vec![T::default(); capacity],
            write_index: 0,
            filled: false,
        }
    }

    pub fn push(&mut self, value: T) {
        self.data[self.write_index] = value;
        self.write_index = (self.write_index + 1) % self.data.len();
        if self.write_index == 0 {
            self.filled = true;
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        if self.filled {
            self.data.len()
        } else {
            self.write_index
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.filled
    }

    /// Snapshot in arrival order, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        if !self.filled {
            return self.data[..self.write_index].to_vec();
        }
        let mut out = Vec::with_capacity(self.data.len());
        out.extend_from_slice(&self.data[self.write_index..]);
        out.extend_from_slice(&self.data[..self.write_index]);
        out
    }
}

/// Raw window plus the detector's derived series for one device.
#[derive(Debug, Clone)]
pub struct DeviceAnalysisState {
    samples: RingBuffer<ImuSample>,
    acc_mag: RingBuffer<f64>,
    gyro_mag: RingBuffer<f64>,
    pitch: RingBuffer<f64>,
    roll: RingBuffer<f64>,
    seen: u64,
}

/// Chronological copies of the derived series.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedWindow {
    pub acc: Vec<f64>,
    pub gyro: Vec<f64>,
    pub pitch: Vec<f64>,
    pub roll: Vec<f64>,
}

impl DeviceAnalysisState {
    pub fn new(window: usize, detector_window: usize) -> Self {
        Self {
            samples: RingBuffer::new(window),
            acc_mag: RingBuffer::new(detector_window),
            gyro_mag: RingBuffer::new(detector_window),
            pitch: RingBuffer::new(detector_window),
            roll: RingBuffer::new(detector_window),
            seen: 0,
        }
    }

    pub fn push(&mut self, sample: ImuSample) {
        let (pitch, roll) = sample.pitch_roll();
        self.samples.push(sample);
        self.acc_mag.push(sample.acc_magnitude());
        self.gyro_mag.push(sample.gyro_magnitude());
        self.pitch.push(pitch);
        self.roll.push(roll);
        self.seen += 1;
    }

    pub fn extend(&mut self, samples: &[ImuSample]) {
        for s in samples {
            self.push(*s);
        }
    }

    pub fn latest_window(&self) -> Vec<ImuSample> {
        self.samples.to_vec()
    }

    pub fn window_capacity(&self) -> usize {
        self.samples.capacity()
    }

    pub fn detector_capacity(&self) -> usize {
        self.acc_mag.capacity()
    }

    /// Total samples ever pushed.
    pub fn samples_seen(&self) -> u64 {
        self.seen
    }

    /// True once the detector series hold a full window.
    pub fn detector_ready(&self) -> bool {
        self.acc_mag.is_full()
    }

    pub fn derived(&self) -> DerivedWindow {
        DerivedWindow {
            acc: self.acc_mag.to_vec(),
            gyro: self.gyro_mag.to_vec(),
            pitch: self.pitch.to_vec(),
            roll: self.roll.to_vec(),
        }
    }
}

struct Slot {
    state: Arc<Mutex<DeviceAnalysisState>>,
    last_seen: Instant,
}

/// Lazily-populated map of device states, bounded by device count.
///
/// Pushes for one device are serialized by that device's mutex; the outer
/// map lock is only held to look up or insert a slot.
pub struct DeviceRegistry {
    slots: Mutex<HashMap<String, Slot>>,
    window: usize,
    detector_window: usize,
    max_devices: usize,
    idle: Duration,
}

impl DeviceRegistry {
    pub fn new(window: usize, detector_window: usize, max_devices: usize, idle: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            window,
            detector_window,
            max_devices: max_devices.max(1),
            idle,
        }
    }

    pub fn push(&self, device_id: &str, samples: &[ImuSample]) {
        self.push_each(device_id, samples, |_| ());
    }

    /// Appends `samples` one at a time and calls `f` after each push, all
    /// under the device lock so no other push can interleave.
    pub fn push_each(
        &self,
        device_id: &str,
        samples: &[ImuSample],
        mut f: impl FnMut(&DeviceAnalysisState),
    ) {
        let state = self.state_for(device_id);
        let mut guard = state.lock();
        for sample in samples {
            guard.push(*sample);
            f(&*guard);
        }
    }

    /// Runs `f` on an existing device state; `None` for unknown devices.
    pub fn inspect<R>(&self, device_id: &str, f: impl FnOnce(&DeviceAnalysisState) -> R) -> Option<R> {
        let state = self.get(device_id)?;
        let guard = state.lock();
        Some(f(&*guard))
    }

    /// Up to `window` samples, oldest first; empty for unknown devices.
    pub fn latest_window(&self, device_id: &str) -> Vec<ImuSample> {
        self.inspect(device_id, DeviceAnalysisState::latest_window)
            .unwrap_or_default()
    }

    fn get(&self, device_id: &str) -> Option<Arc<Mutex<DeviceAnalysisState>>> {
        let mut slots = self.slots.lock();
        slots.get_mut(device_id).map(|slot| {
            slot.last_seen = Instant::now();
            slot.state.clone()
        })
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.slots.lock().contains_key(device_id)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state_for(&self, device_id: &str) -> Arc<Mutex<DeviceAnalysisState>> {
        let now = Instant::now();
        let mut slots = self.slots.lock();

        if let Some(slot) = slots.get_mut(device_id) {
            slot.last_seen = now;
            return slot.state.clone();
        }

        if slots.len() >= self.max_devices {
            let idle = self.idle;
            let before = slots.len();
            slots.retain(|_, slot| now.duration_since(slot.last_seen) < idle);
            if before != slots.len() {
                tracing::debug!(evicted = before - slots.len(), "swept idle device buffers");
            }
        }
        if slots.len() >= self.max_devices {
            if let Some(oldest) = slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_seen)
                .map(|(id, _)| id.clone())
            {
                tracing::debug!(device_id = %oldest, "evicting least recently used device buffer");
                slots.remove(&oldest);
            }
        }

        let state = Arc::new(Mutex::new(DeviceAnalysisState::new(
            self.window,
            self.detector_window,
        )));
        slots.insert(
            device_id.to_string(),
            Slot {
                state: state.clone(),
                last_seen: now,
            },
        );
        state
    }
}
