use remux_common::model::{GpuAllocationStrategy, GpuKind};
use remux_common::time::unix_now;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::config::GpuConfig;

#[derive(Debug, Clone, Serialize)]
pub struct GpuDevice {
    pub device_id: String,
    pub kind: GpuKind,
    pub hwaccel_device: String,
    pub current_workers: u32,
    pub total_allocations: u64,
    pub is_available: bool,
    pub last_allocated: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuAllocation {
    pub device_id: String,
    pub worker_id: String,
    pub allocated_at: f64,
}

struct GpuManagerInner {
    devices: BTreeMap<String, GpuDevice>,
    allocations: HashMap<String, GpuAllocation>,
    max_workers_per_gpu: u32,
    strategy: GpuAllocationStrategy,
    round_robin_index: usize,
}

/// Hands hardware-acceleration devices to workers. Allocation is
/// idempotent per worker id; availability is bounded by
/// `max_workers_per_gpu`.
pub struct GpuManager {
    inner: Mutex<GpuManagerInner>,
}

fn kind_of(device_id: &str) -> GpuKind {
    match device_id.split(':').next() {
        Some("cuda") => GpuKind::Cuda,
        Some("vaapi") => GpuKind::Vaapi,
        _ => GpuKind::Unknown,
    }
}

impl GpuManager {
    pub fn from_config(config: &GpuConfig) -> Self {
        let devices = config
            .devices
            .iter()
            .map(|device| {
                (
                    device.device_id.clone(),
                    GpuDevice {
                        device_id: device.device_id.clone(),
                        kind: kind_of(&device.device_id),
                        hwaccel_device: device.hwaccel_device.clone(),
                        current_workers: 0,
                        total_allocations: 0,
                        is_available: config.max_workers_per_gpu > 0,
                        last_allocated: 0.0,
                    },
                )
            })
            .collect();

        Self {
            inner: Mutex::new(GpuManagerInner {
                devices,
                allocations: HashMap::new(),
                max_workers_per_gpu: config.max_workers_per_gpu.max(1),
                strategy: config.strategy,
                round_robin_index: 0,
            }),
        }
    }

    pub fn get_devices(&self) -> Vec<GpuDevice> {
        let inner = self.inner.lock().expect("gpu manager lock poisoned");
        inner.devices.values().cloned().collect()
    }

    /// Allocate a device for a worker. Re-allocating for a worker that
    /// already holds a device returns the existing mapping.
    pub fn allocate(&self, worker_id: &str, preferred_device_id: Option<&str>) -> Option<GpuDevice> {
        let mut inner = self.inner.lock().expect("gpu manager lock poisoned");

        if let Some(existing) = inner.allocations.get(worker_id) {
            let device_id = existing.device_id.clone();
            return inner.devices.get(&device_id).cloned();
        }

        let max = inner.max_workers_per_gpu;

        let chosen = if let Some(preferred) = preferred_device_id {
            inner
                .devices
                .get(preferred)
                .filter(|device| device.current_workers < max)
                .map(|device| device.device_id.clone())
        } else {
            None
        };

        let chosen = chosen.or_else(|| {
            let available: Vec<String> = inner
                .devices
                .values()
                .filter(|device| device.current_workers < max)
                .map(|device| device.device_id.clone())
                .collect();
            if available.is_empty() {
                return None;
            }
            match inner.strategy {
                GpuAllocationStrategy::RoundRobin => {
                    let index = inner.round_robin_index % available.len();
                    inner.round_robin_index = index + 1;
                    Some(available[index].clone())
                }
                GpuAllocationStrategy::LeastUsed => available.into_iter().min_by_key(|id| {
                    inner
                        .devices
                        .get(id)
                        .map(|device| device.current_workers)
                        .unwrap_or(u32::MAX)
                }),
                GpuAllocationStrategy::Manual => Some(available[0].clone()),
            }
        })?;

        let device = inner.devices.get_mut(&chosen)?;
        device.current_workers += 1;
        device.total_allocations += 1;
        device.last_allocated = unix_now();
        device.is_available = device.current_workers < max;
        let snapshot = device.clone();

        inner.allocations.insert(
            worker_id.to_string(),
            GpuAllocation {
                device_id: chosen,
                worker_id: worker_id.to_string(),
                allocated_at: unix_now(),
            },
        );

        Some(snapshot)
    }

    pub fn release(&self, worker_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("gpu manager lock poisoned");
        let max = inner.max_workers_per_gpu;
        match inner.allocations.remove(worker_id) {
            Some(allocation) => {
                if let Some(device) = inner.devices.get_mut(&allocation.device_id) {
                    device.current_workers = device.current_workers.saturating_sub(1);
                    device.is_available = device.current_workers < max;
                }
                true
            }
            None => false,
        }
    }

    pub fn get_worker_allocation(&self, worker_id: &str) -> Option<GpuAllocation> {
        let inner = self.inner.lock().expect("gpu manager lock poisoned");
        inner.allocations.get(worker_id).cloned()
    }

    pub fn set_max_workers_per_gpu(&self, max_workers: u32) {
        let mut inner = self.inner.lock().expect("gpu manager lock poisoned");
        inner.max_workers_per_gpu = max_workers.max(1);
        let max = inner.max_workers_per_gpu;
        for device in inner.devices.values_mut() {
            device.is_available = device.current_workers < max;
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::config::GpuDeviceConfig;

    fn manager(device_count: usize, max_workers_per_gpu: u32) -> GpuManager {
        let devices = (0..device_count)
            .map(|i| GpuDeviceConfig {
                device_id: format!("cuda:{i}"),
                hwaccel_device: format!("{i}"),
            })
            .collect();
        GpuManager::from_config(&GpuConfig {
            devices,
            max_workers_per_gpu,
            strategy: GpuAllocationStrategy::RoundRobin,
        })
    }

    #[test]
    fn allocation_is_idempotent_per_worker() {
        let manager = manager(2, 2);
        let first = manager.allocate("worker-0", None).unwrap();
        let second = manager.allocate("worker-0", None).unwrap();
        assert_eq!(first.device_id, second.device_id);

        let device = manager
            .get_devices()
            .into_iter()
            .find(|device| device.device_id == first.device_id)
            .unwrap();
        assert_eq!(device.current_workers, 1);
    }

    #[test]
    fn round_robin_spreads_workers() {
        let manager = manager(2, 2);
        let a = manager.allocate("worker-0", None).unwrap();
        let b = manager.allocate("worker-1", None).unwrap();
        assert_ne!(a.device_id, b.device_id);
    }

    #[test]
    fn availability_is_bounded_by_max_workers() {
        let manager = manager(1, 1);
        assert!(manager.allocate("worker-0", None).is_some());
        assert!(manager.allocate("worker-1", None).is_none());

        assert!(manager.release("worker-0"));
        assert!(manager.allocate("worker-1", None).is_some());
    }

    #[test]
    fn release_without_allocation_is_a_no_op() {
        let manager = manager(1, 1);
        assert!(!manager.release("worker-0"));
    }

    #[test]
    fn device_kind_derives_from_id() {
        assert_eq!(kind_of("cuda:0"), GpuKind::Cuda);
        assert_eq!(kind_of("vaapi:/dev/dri/renderD128"), GpuKind::Vaapi);
        assert_eq!(kind_of("something"), GpuKind::Unknown);
    }
}
