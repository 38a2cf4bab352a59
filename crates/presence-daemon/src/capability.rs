//! Platform capability detection, done once at startup.

use nix::unistd::geteuid;
use presence_core::Capabilities;

/// Detect what this process and machine can do.
pub fn detect() -> Capabilities {
    Capabilities {
        privileged: geteuid().is_root(),
        motion_sensor: motion_sensor_supported(),
    }
}

/// A sensor pin can be watched only on Raspberry Pi class hardware with
/// the `gpio` feature.
const fn motion_sensor_supported() -> bool {
    cfg!(all(feature = "gpio", any(target_arch = "arm", target_arch = "aarch64")))
}
