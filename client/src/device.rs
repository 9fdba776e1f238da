//! Device identity.
//!
//! A device ID is generated once per storage origin and persisted alongside
//! the data. It tags published versions and breaks version ties; it is never a
//! credential.

use codex_sync_engine::DeviceId;

use crate::error::Result;
use crate::now_millis;
use crate::store::LocalStore;

/// Metadata entry holding the device ID.
pub const DEVICE_ID_META: &str = "device_id";

/// Generate a fresh `device_{millis}_{9 random chars}` identifier.
pub fn generate_device_id() -> DeviceId {
    let entropy = uuid::Uuid::new_v4().simple().to_string();
    format!("device_{}_{}", now_millis(), &entropy[..9])
}

/// Load the persisted device ID, creating and persisting one on first use.
pub fn load_or_create(store: &LocalStore) -> Result<DeviceId> {
    if let Some(existing) = store.get_meta(DEVICE_ID_META).filter(|id| !id.is_empty()) {
        return Ok(existing);
    }

    let device_id = generate_device_id();
    store.set_meta(DEVICE_ID_META, &device_id)?;
    tracing::info!(device_id = %device_id, "Generated device ID");
    Ok(device_id)
}
