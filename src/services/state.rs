use crate::client::KohlerClientError;
use crate::models::kohler::{AdvancedState, ConnectivityState, Device, DeviceId, DeviceState, DeviceStateSnapshot};
use log::debug;

/// The reads the state fetcher needs from the vendor API.
pub trait DeviceApi {
    /// Devices from the last directory call; empty until one has succeeded.
    fn cached_devices(&self) -> Vec<Device>;
    /// Call the directory and replace the cache.
    fn list_devices(&self) -> Result<Vec<Device>, KohlerClientError>;
    fn advanced_state(&self, device_id: &DeviceId) -> Result<AdvancedState, KohlerClientError>;
    fn connectivity_state(&self, device_id: &DeviceId) -> Result<ConnectivityState, KohlerClientError>;
}

/// Fetch advanced and connectivity state for every GCS device.
///
/// Populates the directory first if nothing is cached. Other SKUs are skipped
/// entirely; any failed call fails the whole batch.
pub fn fetch_all_state<A: DeviceApi + ?Sized>(api: &A) -> Result<DeviceStateSnapshot, KohlerClientError> {
    let mut devices = api.cached_devices();
    if devices.is_empty() {
        devices = api.list_devices()?;
    }

    let mut snapshot = DeviceStateSnapshot::new();
    for device in devices {
        if !device.is_gcs() {
            debug!("Skipping device {} with unsupported sku {:?}", device.device_id, device.sku);
            continue;
        }
        let advanced_state = api.advanced_state(&device.device_id)?;
        let connectivity_state = api.connectivity_state(&device.device_id)?;
        snapshot.insert(
            device.device_id.clone(),
            DeviceState {
                device,
                advanced_state,
                connectivity_state,
            },
        );
    }
    Ok(snapshot)
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory stand-in for the vendor API, shared by the service tests.

    use super::*;
    use crate::models::kohler::{SKU_GCS, WarmUpState};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    pub struct FakeApi {
        pub directory: Mutex<Vec<Device>>,
        cache: Mutex<Vec<Device>>,
        pub directory_calls: AtomicUsize,
        pub state_calls: AtomicUsize,
        pub fetches: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
        pub fail_state: AtomicBool,
        pub warming: AtomicBool,
        pub latency: Mutex<Option<Duration>>,
    }

    pub fn device(id: &str, sku: &str) -> Device {
        Device {
            device_id: DeviceId(id.to_string()),
            sku: sku.to_string(),
            ..Device::default()
        }
    }

    impl FakeApi {
        pub fn with_devices(gcs: usize, other: usize) -> Self {
            let mut devices = Vec::new();
            for i in 0..gcs {
                devices.push(device(&format!("gcs-{}", i), SKU_GCS));
            }
            for i in 0..other {
                devices.push(device(&format!("other-{}", i), "VOX"));
            }
            let api = FakeApi::default();
            *api.directory.lock() = devices;
            api
        }

        pub fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    impl DeviceApi for FakeApi {
        fn cached_devices(&self) -> Vec<Device> {
            self.cache.lock().clone()
        }

        fn list_devices(&self) -> Result<Vec<Device>, KohlerClientError> {
            self.directory_calls.fetch_add(1, Ordering::SeqCst);
            let devices = self.directory.lock().clone();
            *self.cache.lock() = devices.clone();
            Ok(devices)
        }

        fn advanced_state(&self, _device_id: &DeviceId) -> Result<AdvancedState, KohlerClientError> {
            // with a single GCS device this counts polls
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(latency) = *self.latency.lock() {
                std::thread::sleep(latency);
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.state_calls.fetch_add(1, Ordering::SeqCst);

            if self.fail_state.load(Ordering::SeqCst) {
                return Err(KohlerClientError::Http {
                    status: 500,
                    message: "internal server error".to_string(),
                });
            }
            let warmup = if self.warming.load(Ordering::SeqCst) {
                "warmUpInProgress"
            } else {
                "warmUpNotInProgress"
            };
            let mut state = AdvancedState::default();
            state.state.warm_up_state = WarmUpState {
                state: Some(warmup.to_string()),
            };
            Ok(state)
        }

        fn connectivity_state(&self, _device_id: &DeviceId) -> Result<ConnectivityState, KohlerClientError> {
            self.state_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ConnectivityState {
                connection_state: Some("Connected".to_string()),
            })
        }
    }
}
