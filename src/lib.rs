//! droidpilot drives an Android device from the host to complete
//! natural-language and fixed-form tasks. It talks to the device only
//! through a shell bridge (input events + screenshots), locates UI elements
//! with a hybrid pixel/model pipeline, and executes declarative per-app
//! workflows with retries, AI-assisted recovery and a mandatory reset to
//! the app's home screen.

pub mod apps;
pub mod assets;
pub mod classifier;
pub mod config;
pub mod device;
pub mod errors;
pub mod llm;
pub mod locator;
pub mod planner;
pub mod registry;
pub mod runner;
pub mod workflow;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::device::adb::AdbDevice;
use crate::device::mock::MockDevice;
use crate::device::DeviceSurface;
use crate::errors::AgentResult;

/// Build the device binding for a run: the mock backend in debug mode,
/// otherwise adb against the chosen serial.
pub async fn open_device(config: &AppConfig, requested: Option<&str>) -> AgentResult<Arc<dyn DeviceSurface>> {
    if config.device.debug_mode {
        tracing::info!("debug mode: using mock device");
        return Ok(Arc::new(MockDevice::new(&config.device)));
    }

    let serial = match requested {
        Some(serial) => serial.to_string(),
        None if !config.device.default_device.is_empty() => config.device.default_device.clone(),
        None => {
            let devices = AdbDevice::list_devices(&config.device.adb_path).await?;
            devices.into_iter().next().ok_or_else(|| {
                errors::AgentError::DeviceUnavailable("no device connected".into())
            })?
        }
    };

    let device = AdbDevice::new(serial, &config.device);
    if !device.is_connected().await? && !device.connect().await? {
        return Err(errors::AgentError::DeviceUnavailable(format!(
            "cannot connect to device '{}'",
            device.name()
        )));
    }
    Ok(Arc::new(device))
}
