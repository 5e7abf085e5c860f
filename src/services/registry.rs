//! Device registry - maps device keys to lots
//!
//! A device starts `Unassigned` and becomes `Assigned` exactly once; there is
//! no transition back. Key generation goes through a `KeyGenerator` so the
//! collision policy is explicit:
//! - `RandomKeys` draws from the 31-bit space and inserts whatever it gets
//!   (two registrations may share a key; the later one wins the slot)
//! - `CollisionCheckedKeys` redraws while the key is taken. The check and the
//!   insert happen under the same write lock, so keys are unique.

use crate::domain::types::{DeviceKey, LotId};
use crate::infra::config::KeyPolicy;
use parking_lot::RwLock;
use rand::Rng;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{info, warn};

/// Upper bound on redraws before giving up on a free key
const MAX_KEY_ATTEMPTS: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown device {0}")]
    UnknownDevice(DeviceKey),
    #[error("device {key} is already assigned to lot {lot}")]
    AlreadyAssigned { key: DeviceKey, lot: LotId },
    #[error("no free device key after {0} attempts")]
    KeySpaceExhausted(usize),
}

/// Source of fresh device keys
pub trait KeyGenerator: Send + Sync {
    fn generate(&self) -> DeviceKey;

    /// Whether the registry should redraw on collision
    fn check_collisions(&self) -> bool;
}

/// Uniform draw from the 31-bit space, collisions accepted
#[derive(Debug, Default)]
pub struct RandomKeys;

impl KeyGenerator for RandomKeys {
    fn generate(&self) -> DeviceKey {
        DeviceKey(rand::thread_rng().gen_range(0..=DeviceKey::MAX))
    }

    fn check_collisions(&self) -> bool {
        false
    }
}

/// Uniform draw from the 31-bit space, redrawn until unused
#[derive(Debug, Default)]
pub struct CollisionCheckedKeys;

impl KeyGenerator for CollisionCheckedKeys {
    fn generate(&self) -> DeviceKey {
        RandomKeys.generate()
    }

    fn check_collisions(&self) -> bool {
        true
    }
}

pub fn key_generator(policy: KeyPolicy) -> Box<dyn KeyGenerator> {
    match policy {
        KeyPolicy::Random => Box::new(RandomKeys),
        KeyPolicy::CollisionChecked => Box::new(CollisionCheckedKeys),
    }
}

/// Registration state of one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceState {
    Unassigned,
    Assigned(LotId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub key: DeviceKey,
    pub state: DeviceState,
}

impl Device {
    pub fn lot(&self) -> Option<&LotId> {
        match &self.state {
            DeviceState::Assigned(lot) => Some(lot),
            DeviceState::Unassigned => None,
        }
    }
}

/// Device → lot mapping, safe for concurrent use
pub struct Registry {
    devices: RwLock<FxHashMap<DeviceKey, Device>>,
    keys: Box<dyn KeyGenerator>,
}

impl Registry {
    pub fn new(keys: Box<dyn KeyGenerator>) -> Self {
        Self { devices: RwLock::new(FxHashMap::default()), keys }
    }

    pub fn with_policy(policy: KeyPolicy) -> Self {
        Self::new(key_generator(policy))
    }

    /// Create a new unassigned device
    pub fn create(&self) -> Result<DeviceKey, RegistryError> {
        self.insert(DeviceState::Unassigned)
    }

    /// Create a device and assign it in one step
    pub fn register(&self, lot: Option<LotId>) -> Result<DeviceKey, RegistryError> {
        let state = match lot {
            Some(lot) => DeviceState::Assigned(lot),
            None => DeviceState::Unassigned,
        };
        self.insert(state)
    }

    fn insert(&self, state: DeviceState) -> Result<DeviceKey, RegistryError> {
        let mut devices = self.devices.write();

        let mut key = self.keys.generate();
        if self.keys.check_collisions() {
            let mut attempts = 1;
            while devices.contains_key(&key) {
                if attempts >= MAX_KEY_ATTEMPTS {
                    return Err(RegistryError::KeySpaceExhausted(attempts));
                }
                key = self.keys.generate();
                attempts += 1;
            }
        } else if devices.contains_key(&key) {
            warn!(device_key = %key, "device_key_collision");
        }

        let lot = match &state {
            DeviceState::Assigned(lot) => Some(lot.to_string()),
            DeviceState::Unassigned => None,
        };
        devices.insert(key, Device { key, state });
        drop(devices);

        info!(device_key = %key, lot_id = ?lot, "device_registered");
        Ok(key)
    }

    /// Assign an unassigned device to a lot
    pub fn assign(&self, key: DeviceKey, lot: LotId) -> Result<(), RegistryError> {
        let mut devices = self.devices.write();
        let device = devices.get_mut(&key).ok_or(RegistryError::UnknownDevice(key))?;

        if let DeviceState::Assigned(current) = &device.state {
            return Err(RegistryError::AlreadyAssigned { key, lot: current.clone() });
        }

        info!(device_key = %key, lot_id = %lot, "device_assigned");
        device.state = DeviceState::Assigned(lot);
        Ok(())
    }

    /// Look up a device; `Ok(None)` means known but unassigned
    pub fn resolve(&self, key: DeviceKey) -> Result<Option<LotId>, RegistryError> {
        let devices = self.devices.read();
        let device = devices.get(&key).ok_or(RegistryError::UnknownDevice(key))?;
        Ok(device.lot().cloned())
    }

    pub fn get(&self, key: DeviceKey) -> Option<Device> {
        self.devices.read().get(&key).cloned()
    }

    /// Keys of all devices assigned to a lot, ascending
    pub fn devices_of(&self, lot: &LotId) -> Vec<DeviceKey> {
        let mut keys: Vec<DeviceKey> = self
            .devices
            .read()
            .values()
            .filter(|d| d.lot() == Some(lot))
            .map(|d| d.key)
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Every lot with its device keys, one read-lock pass
    pub fn devices_by_lot(&self) -> FxHashMap<LotId, Vec<DeviceKey>> {
        let mut by_lot: FxHashMap<LotId, Vec<DeviceKey>> = FxHashMap::default();
        for device in self.devices.read().values() {
            if let Some(lot) = device.lot() {
                by_lot.entry(lot.clone()).or_default().push(device.key);
            }
        }
        for keys in by_lot.values_mut() {
            keys.sort_unstable();
        }
        by_lot
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_policy(KeyPolicy::CollisionChecked)
    }
}
