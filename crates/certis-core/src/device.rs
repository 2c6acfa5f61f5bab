//! Voting devices and device kits.

use serde::{Deserialize, Serialize};

pub type DeviceId = i64;
pub type KitId = i64;

/// Name given to the synthetic kit that mirrors every known device.
pub const GLOBAL_KIT_NAME: &str = "All devices";

/// A physical voting handset. `serial_number` is its durable identity; `id`
/// is only a surrogate key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingDevice {
  pub id:            DeviceId,
  pub name:          Option<String>,
  pub serial_number: String,
}

#[derive(Debug, Clone)]
pub struct NewVotingDevice {
  pub name:          Option<String>,
  pub serial_number: String,
}

impl NewVotingDevice {
  pub fn new(name: impl Into<String>, serial_number: impl Into<String>) -> Self {
    Self { name: Some(name.into()), serial_number: serial_number.into() }
  }
}

#[derive(Debug, Clone, Default)]
pub struct VotingDeviceUpdate {
  pub name:          Option<Option<String>>,
  pub serial_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKit {
  pub id:         KitId,
  pub name:       String,
  pub is_default: bool,
  /// Set only on the kit maintained by global-kit reconciliation.
  pub is_global:  bool,
}

/// Input to `add_device_kit`. The global flag is never accepted from callers.
#[derive(Debug, Clone)]
pub struct NewDeviceKit {
  pub name:       String,
  pub is_default: bool,
}

/// Renaming is the only plain update; defaults go through
/// `set_default_device_kit`.
#[derive(Debug, Clone, Default)]
pub struct DeviceKitUpdate {
  pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKitAssignment {
  pub id:               i64,
  pub kit_id:           KitId,
  pub voting_device_id: DeviceId,
}

/// What one global-kit reconciliation pass changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalKitSync {
  pub kit_id:  KitId,
  pub created: bool,
  pub added:   usize,
  pub removed: usize,
}
