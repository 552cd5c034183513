/*!
Devices.

A [`Device`] is where the kernels of a [queue](crate::queue) run, and how
they are run: inline on the submitting thread, or on a detached thread per
task.

[`Device::host()`] is always available. Accelerator devices are opened from a
[`Platform`], which hands out the same device for the same index while it is
in use:
```
# use syclrt::device::{Device, ExecutionMode, Platform};
# fn main() -> syclrt::result::Result<()> {
let platform = Platform::new(2);
let a = Device::builder().index(1).build(&platform)?;
let b = Device::builder().index(1).build(&platform)?;
assert_eq!(a, b);
let sync = Device::builder()
    .execution_mode(ExecutionMode::Synchronous)
    .build(&platform)?;
assert_eq!(sync.execution_mode(), ExecutionMode::Synchronous);
assert!(Device::builder().index(2).build(&platform).is_err());
# Ok(())
# }
```
*/

use crate::{cache::Cache, result::Result};
use std::{
    fmt::{self, Debug},
    sync::Arc,
};
use tracing::debug;

/// Errors.
pub mod error {
    /// The device index is greater than or equal to the number of devices.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Device index {index} is out of range 0..{devices}!")]
    pub struct DeviceIndexOutOfRange {
        pub(super) index: usize,
        pub(super) devices: usize,
    }
}
use error::*;

/** How tasks are executed.

Defaults to [`Synchronous`](Self::Synchronous), or to
[`Asynchronous`](Self::Asynchronous) with the "async" feature. */
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ExecutionMode {
    /// Tasks run to completion inside `submit`.
    Synchronous,
    /// Each task runs on its own detached thread.
    Asynchronous,
}

impl ExecutionMode {
    const DEFAULT: Self = if cfg!(feature = "async") {
        Self::Asynchronous
    } else {
        Self::Synchronous
    };
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Device`].
    pub struct DeviceBuilder {
        pub(super) index: usize,
        pub(super) execution_mode: ExecutionMode,
    }

    impl DeviceBuilder {
        /// Index of the device, defaults to 0.
        pub fn index(self, index: usize) -> Self {
            Self { index, ..self }
        }
        /// Execution mode, defaults to [`ExecutionMode::default()`].
        pub fn execution_mode(self, execution_mode: ExecutionMode) -> Self {
            Self {
                execution_mode,
                ..self
            }
        }
        /// Opens the device from `platform`.
        ///
        /// **errors**
        ///
        /// - [`DeviceIndexOutOfRange`](super::error::DeviceIndexOutOfRange)
        pub fn build(self, platform: &Platform) -> Result<Device> {
            let info = platform.device_info(self.index)?;
            Ok(Device {
                inner: DeviceInner::Accelerator(RawDevice { info }),
                execution_mode: self.execution_mode,
            })
        }
    }
}
use builder::*;

/// Info about an accelerator device.
#[derive(Debug)]
pub struct DeviceInfo {
    index: usize,
    name: String,
}

impl DeviceInfo {
    pub fn index(&self) -> usize {
        self.index
    }
    pub fn name(&self) -> &str {
        &self.name
    }
}

/** A set of accelerator devices.

Device infos are cached weakly, so devices opened with the same index share
them, and compare equal, while any of them is alive. */
pub struct Platform {
    devices: usize,
    cache: Cache<usize, DeviceInfo>,
}

impl Platform {
    /// A platform with `devices` accelerators.
    pub fn new(devices: usize) -> Self {
        Self {
            devices,
            cache: Cache::new(),
        }
    }
    /// Number of accelerators.
    pub fn device_count(&self) -> usize {
        self.devices
    }
    fn device_info(&self, index: usize) -> Result<Arc<DeviceInfo>, DeviceIndexOutOfRange> {
        if index >= self.devices {
            return Err(DeviceIndexOutOfRange {
                index,
                devices: self.devices,
            });
        }
        Ok(self.cache.get_or_register(index, || {
            debug!(index, "opening device");
            DeviceInfo {
                index,
                name: format!("accelerator{index}"),
            }
        }))
    }
}

impl Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("devices", &self.devices)
            .finish()
    }
}

/** A device.

Devices can be cloned, which is equivalent to [`Arc::clone()`].
*/
#[derive(Clone, Eq, PartialEq)]
pub struct Device {
    inner: DeviceInner,
    execution_mode: ExecutionMode,
}

impl Device {
    /// The host.
    pub const fn host() -> Self {
        Self {
            inner: DeviceInner::Host,
            execution_mode: ExecutionMode::DEFAULT,
        }
    }
    /// A builder for opening an accelerator.
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder {
            index: 0,
            execution_mode: ExecutionMode::default(),
        }
    }
    /// The same device with another execution mode.
    pub fn with_execution_mode(self, execution_mode: ExecutionMode) -> Self {
        Self {
            execution_mode,
            ..self
        }
    }
    /// Is the host.
    pub fn is_host(&self) -> bool {
        matches!(self.inner, DeviceInner::Host)
    }
    /// Is an accelerator.
    pub fn is_accelerator(&self) -> bool {
        !self.is_host()
    }
    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }
    /** Device info.

    The host returns None. */
    pub fn info(&self) -> Option<&Arc<DeviceInfo>> {
        match &self.inner {
            DeviceInner::Host => None,
            DeviceInner::Accelerator(raw) => Some(&raw.info),
        }
    }
}

/// See [`Device::host()`].
impl Default for Device {
    fn default() -> Self {
        Self::host()
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            DeviceInner::Host => write!(f, "Host({:?})", self.execution_mode),
            DeviceInner::Accelerator(raw) => {
                write!(f, "Device({}, {:?})", raw.info.index, self.execution_mode)
            }
        }
    }
}

#[derive(Clone, Eq, PartialEq)]
enum DeviceInner {
    Host,
    Accelerator(RawDevice),
}

#[derive(Clone)]
struct RawDevice {
    info: Arc<DeviceInfo>,
}

impl PartialEq for RawDevice {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.info, &other.info)
    }
}

impl Eq for RawDevice {}
