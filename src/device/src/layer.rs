use std::sync::Arc;

use bfs_config::{ConfigError, DeviceConfig, DeviceKind, DeviceLayerConfig};
use secomm::SecAssociation;
use tracing::info;

use crate::{BlockDevice, DeviceError, LocalDevice, RemoteDevice};

/// Build every configured device: local entries map their image in-process,
/// remote entries attach over the network and learn their geometry from
/// `GET_TOPO`.
pub fn attach_devices(
    cfg: &DeviceLayerConfig,
) -> Result<Vec<Arc<dyn BlockDevice>>, DeviceError> {
    let mut devices: Vec<Arc<dyn BlockDevice>> = Vec::with_capacity(cfg.devices.len());
    for dev in &cfg.devices {
        devices.push(attach_device(dev, cfg.user_id)?);
    }
    info!(count = devices.len(), "device layer attached");
    Ok(devices)
}

pub fn attach_device(
    dev: &DeviceConfig,
    user_id: u64,
) -> Result<Arc<dyn BlockDevice>, DeviceError> {
    match dev.kind {
        DeviceKind::Local => {
            let path = dev.path.as_ref().ok_or_else(|| {
                ConfigError::Invalid(format!("device {}: missing path", dev.did))
            })?;
            Ok(Arc::new(LocalDevice::open(dev.did, path, dev.num_blocks)?))
        }
        DeviceKind::Remote => {
            let ip = dev.ip.as_deref().ok_or_else(|| {
                ConfigError::Invalid(format!("device {}: missing address", dev.did))
            })?;
            let port = dev.port.ok_or_else(|| {
                ConfigError::Invalid(format!("device {}: missing port", dev.did))
            })?;
            let sa_cfg = dev.sa.as_ref().ok_or_else(|| {
                ConfigError::Invalid(format!("device {}: missing security association", dev.did))
            })?;
            let sa = SecAssociation::new(
                sa_cfg.initiator.clone(),
                sa_cfg.responder.clone(),
                &sa_cfg.key()?,
            )?;
            Ok(Arc::new(RemoteDevice::connect(ip, port, dev.did, user_id, sa)?))
        }
    }
}
