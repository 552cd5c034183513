/*!
Access modes and targets.

An access is a pair of an [`AccessMode`] and an [`AccessTarget`]. The
pair is validated once, at construction, so the rest of the runtime only
has to ask [`Access::is_write_access()`] to decide whether a buffer
generation must be versioned.
*/

use std::fmt::{self, Debug, Display};

/// Errors.
pub mod error {
    use super::*;

    /// The mode can not be used with the target.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("{mode:?} access is not allowed on a {target:?} target!")]
    pub struct InvalidAccess {
        pub(super) mode: AccessMode,
        pub(super) target: AccessTarget,
    }
}
use error::*;

/// How an accessor uses the data.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
    /// Write without reading the previous content.
    DiscardWrite,
    /// Read and write without reading the previous content.
    DiscardReadWrite,
    Atomic,
}

impl AccessMode {
    /// Whether the mode may modify the data, and so produces a new generation.
    pub const fn is_write_access(self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// Where the accessed data lives.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AccessTarget {
    GlobalBuffer,
    ConstantBuffer,
    Local,
    HostBuffer,
    Pipe,
    BlockingPipe,
}

impl AccessTarget {
    pub const fn is_pipe(self) -> bool {
        matches!(self, Self::Pipe | Self::BlockingPipe)
    }
    /// Pipe operations wait instead of failing.
    pub const fn is_blocking(self) -> bool {
        matches!(self, Self::BlockingPipe)
    }
    pub const fn is_host(self) -> bool {
        matches!(self, Self::HostBuffer)
    }
}

impl Default for AccessTarget {
    fn default() -> Self {
        Self::GlobalBuffer
    }
}

/** A validated access.

Pipes are read or written exclusively, constant buffers are read only and
local memory is private scratch space read and written by the work group:
```
# use syclrt::access::{Access, AccessMode, AccessTarget};
assert!(Access::new(AccessMode::Read, AccessTarget::BlockingPipe).is_ok());
assert!(Access::new(AccessMode::ReadWrite, AccessTarget::Pipe).is_err());
assert!(Access::new(AccessMode::Write, AccessTarget::ConstantBuffer).is_err());
```
*/
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Access {
    mode: AccessMode,
    target: AccessTarget,
}

impl Access {
    /// Creates an access.
    ///
    /// **errors**
    ///
    /// - [`InvalidAccess`](error::InvalidAccess) if the mode is not allowed on the target.
    pub fn new(mode: AccessMode, target: AccessTarget) -> Result<Self, InvalidAccess> {
        use AccessMode::*;
        use AccessTarget::*;
        let valid = match target {
            GlobalBuffer | HostBuffer => true,
            ConstantBuffer => matches!(mode, Read),
            Local => matches!(mode, ReadWrite | Atomic),
            Pipe | BlockingPipe => matches!(mode, Read | Write),
        };
        if valid {
            Ok(Self { mode, target })
        } else {
            Err(InvalidAccess { mode, target })
        }
    }
    /// An access to a global buffer.
    pub const fn global(mode: AccessMode) -> Self {
        Self {
            mode,
            target: AccessTarget::GlobalBuffer,
        }
    }
    /// An access from the host.
    pub const fn host(mode: AccessMode) -> Self {
        Self {
            mode,
            target: AccessTarget::HostBuffer,
        }
    }
    pub fn mode(&self) -> AccessMode {
        self.mode
    }
    pub fn target(&self) -> AccessTarget {
        self.target
    }
    pub fn is_write_access(&self) -> bool {
        self.mode.is_write_access()
    }
}

impl From<AccessMode> for Access {
    fn from(mode: AccessMode) -> Self {
        Self::global(mode)
    }
}

impl Debug for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Access({:?}, {:?})", self.mode, self.target)
    }
}

impl Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODES: [AccessMode; 6] = [
        AccessMode::Read,
        AccessMode::Write,
        AccessMode::ReadWrite,
        AccessMode::DiscardWrite,
        AccessMode::DiscardReadWrite,
        AccessMode::Atomic,
    ];

    #[test]
    fn only_read_is_not_write_access() {
        for mode in MODES {
            assert_eq!(mode.is_write_access(), mode != AccessMode::Read);
        }
    }

    #[test]
    fn pipe_targets_are_read_or_write() {
        for target in [AccessTarget::Pipe, AccessTarget::BlockingPipe] {
            for mode in MODES {
                let ok = Access::new(mode, target).is_ok();
                assert_eq!(ok, matches!(mode, AccessMode::Read | AccessMode::Write));
            }
        }
    }

    #[test]
    fn global_accepts_every_mode() {
        for mode in MODES {
            let access = Access::new(mode, AccessTarget::GlobalBuffer).unwrap();
            assert_eq!(access, Access::global(mode));
        }
    }

    #[test]
    fn invalid_access_message() {
        let e = Access::new(AccessMode::Write, AccessTarget::ConstantBuffer).unwrap_err();
        assert_eq!(
            e.to_string(),
            "Write access is not allowed on a ConstantBuffer target!"
        );
    }
}
