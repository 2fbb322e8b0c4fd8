//! Alarm relay output line.

use std::fs;
use std::io;
use std::path::PathBuf;

/// One output line toggled on alarm edges.
pub trait Relay: Send {
    fn set_level(&mut self, on: bool) -> io::Result<()>;
}

/// Used when no relay pin is configured.
pub struct NoRelay;

impl Relay for NoRelay {
    fn set_level(&mut self, _on: bool) -> io::Result<()> {
        Ok(())
    }
}

/// Relay on a sysfs GPIO line.
pub struct SysfsRelay {
    value_path: PathBuf,
}

impl SysfsRelay {
    /// Export the pin if needed and configure it as an output.
    pub fn open(pin: u32) -> io::Result<Self> {
        let base = PathBuf::from("/sys/class/gpio");
        let dir = base.join(format!("gpio{pin}"));
        if !dir.exists() {
            fs::write(base.join("export"), pin.to_string())?;
        }
        fs::write(dir.join("direction"), "out")?;
        Ok(Self {
            value_path: dir.join("value"),
        })
    }
}

impl Relay for SysfsRelay {
    fn set_level(&mut self, on: bool) -> io::Result<()> {
        fs::write(&self.value_path, if on { "1" } else { "0" })
    }
}
