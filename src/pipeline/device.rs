//! One exclusive execution context per compute device.

use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::{Checkpoint, Device, Geometry, Transform};

struct DeviceSlot {
    device: Device,
    transform: Mutex<Box<dyn Transform>>,
}

/// Transformation instances, one per configured device.
///
/// Each instance sits behind its own mutex, so a device's execution context
/// is only ever driven by one batch at a time while different devices run
/// concurrently.
pub struct DevicePool {
    slots: Vec<DeviceSlot>,
    geometry: Geometry,
}

impl std::fmt::Debug for DevicePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePool")
            .field("devices", &self.devices())
            .field("geometry", &self.geometry)
            .finish()
    }
}

impl DevicePool {
    /// Build one instance of `checkpoint` per device and place it.
    ///
    /// Devices that refuse the placement are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error for an empty device list, any construction
    /// error from the checkpoint, and `DeviceUnavailable` if no device
    /// accepted an instance.
    pub fn new(checkpoint: &Checkpoint, devices: &[Device]) -> Result<Self> {
        let instances = devices
            .iter()
            .map(|&device| Ok((device, checkpoint.instantiate()?)))
            .collect::<Result<Vec<_>>>()?;
        Self::from_instances(instances)
    }

    /// Place already constructed instances on their devices.
    ///
    /// # Errors
    ///
    /// Same as [`DevicePool::new`]; additionally `InvalidParams` if the
    /// instances disagree on geometry.
    pub fn from_instances(instances: Vec<(Device, Box<dyn Transform>)>) -> Result<Self> {
        let Some(first) = instances.first().map(|(device, _)| *device) else {
            return Err(Error::config("no compute devices configured"));
        };

        let mut slots = Vec::with_capacity(instances.len());
        for (device, mut transform) in instances {
            match transform.place(device) {
                Ok(()) => slots.push(DeviceSlot {
                    device,
                    transform: Mutex::new(transform),
                }),
                Err(err @ Error::DeviceUnavailable { .. }) => {
                    tracing::warn!("Skipping device: {err}");
                }
                Err(err) => return Err(err),
            }
        }

        let geometry = match slots.first() {
            Some(slot) => lock(slot)?.geometry(),
            None => {
                return Err(Error::DeviceUnavailable {
                    device: first,
                    reason: "no configured device could host the model".to_string(),
                })
            }
        };
        for slot in &slots {
            let other = lock(slot)?;
            if other.geometry() != geometry {
                return Err(Error::invalid_params(
                    other.kind().id(),
                    format!("instance on {} disagrees on geometry", slot.device),
                ));
            }
        }

        tracing::debug!(
            "Device pool ready on {:?} (scale {}, offset {})",
            slots.iter().map(|s| s.device).collect::<Vec<_>>(),
            geometry.scale,
            geometry.offset
        );
        Ok(Self { slots, geometry })
    }

    #[must_use]
    pub const fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Number of usable devices; never zero.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn devices(&self) -> Vec<Device> {
        self.slots.iter().map(|slot| slot.device).collect()
    }

    /// Run `job` with exclusive use of device `lane` (modulo the pool size).
    ///
    /// A `DeviceUnavailable` failure is retried once on the next device, if
    /// the pool has one.
    ///
    /// # Errors
    ///
    /// Returns the job's error, or the retry's error after a device loss.
    pub fn run<T, F>(&self, lane: usize, job: F) -> Result<T>
    where
        F: Fn(&mut dyn Transform) -> Result<T>,
    {
        let index = lane % self.slots.len();
        match self.run_on(index, &job) {
            Err(err @ Error::DeviceUnavailable { .. }) if self.slots.len() > 1 => {
                let alternate = (index + 1) % self.slots.len();
                tracing::warn!("{err}; retrying on {}", self.slots[alternate].device);
                self.run_on(alternate, &job)
            }
            result => result,
        }
    }

    fn run_on<T, F>(&self, index: usize, job: &F) -> Result<T>
    where
        F: Fn(&mut dyn Transform) -> Result<T>,
    {
        let slot = &self.slots[index];
        let mut transform = lock(slot)?;
        job(&mut **transform)
    }
}

fn lock(slot: &DeviceSlot) -> Result<std::sync::MutexGuard<'_, Box<dyn Transform>>> {
    slot.transform.lock().map_err(|_| Error::DeviceUnavailable {
        device: slot.device,
        reason: "execution context poisoned by an earlier panic".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::{Map, Value};

    use super::*;
    use crate::model::{BatchTensor, Nearest, NearestConfig, Precision, TransformKind};

    /// Nearest 2x that can refuse placement and counts forward calls.
    struct Flaky {
        inner: Nearest,
        refuse_placement: bool,
        lost: bool,
        calls: Arc<AtomicUsize>,
    }

    impl Flaky {
        fn boxed(refuse_placement: bool, lost: bool, calls: &Arc<AtomicUsize>) -> Box<dyn Transform> {
            Box::new(Self {
                inner: Nearest::new(NearestConfig { scale: 2 }).unwrap(),
                refuse_placement,
                lost,
                calls: Arc::clone(calls),
            })
        }
    }

    impl Transform for Flaky {
        fn kind(&self) -> TransformKind {
            TransformKind::Nearest
        }
        fn params(&self) -> Map<String, Value> {
            self.inner.params()
        }
        fn geometry(&self) -> Geometry {
            self.inner.geometry()
        }
        fn forward(&mut self, input: BatchTensor, precision: Precision) -> Result<BatchTensor> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.lost {
                return Err(Error::DeviceUnavailable {
                    device: Device::Gpu(0),
                    reason: "device lost".to_string(),
                });
            }
            self.inner.forward(input, precision)
        }
        fn place(&mut self, device: Device) -> Result<()> {
            if self.refuse_placement {
                return Err(Error::DeviceUnavailable {
                    device,
                    reason: "not present".to_string(),
                });
            }
            Ok(())
        }
    }

    fn run_once(pool: &DevicePool, lane: usize) -> Result<usize> {
        pool.run(lane, |transform| {
            let output = transform.forward(BatchTensor::zeros((1, 3, 2, 2)), Precision::Full)?;
            Ok(output.dim().2)
        })
    }

    #[test]
    fn test_skips_devices_that_refuse_placement() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = DevicePool::from_instances(vec![
            (Device::Gpu(0), Flaky::boxed(true, false, &calls)),
            (Device::Cpu, Flaky::boxed(false, false, &calls)),
        ])
        .unwrap();

        assert_eq!(pool.devices(), vec![Device::Cpu]);
        assert_eq!(pool.geometry(), Geometry::new(2, 0));
    }

    #[test]
    fn test_no_usable_device() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = DevicePool::from_instances(vec![(
            Device::Gpu(3),
            Flaky::boxed(true, false, &calls),
        )]);
        assert!(matches!(
            result,
            Err(Error::DeviceUnavailable {
                device: Device::Gpu(3),
                ..
            })
        ));
        assert!(matches!(
            DevicePool::from_instances(Vec::new()),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_device_loss_retried_on_next_device() {
        let lost = Arc::new(AtomicUsize::new(0));
        let healthy = Arc::new(AtomicUsize::new(0));
        let pool = DevicePool::from_instances(vec![
            (Device::Gpu(0), Flaky::boxed(false, true, &lost)),
            (Device::Gpu(1), Flaky::boxed(false, false, &healthy)),
        ])
        .unwrap();

        assert_eq!(run_once(&pool, 0).unwrap(), 4);
        assert_eq!(lost.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_device_loss_without_alternate_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pool =
            DevicePool::from_instances(vec![(Device::Gpu(0), Flaky::boxed(false, true, &calls))])
                .unwrap();

        assert!(matches!(
            run_once(&pool, 0),
            Err(Error::DeviceUnavailable { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
