use log::debug;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::config::Direction;
use crate::error::GpioError;
use crate::gpio::GpioBackend;
use crate::watch::ValueStamp;

/// Backend talking to the kernel's sysfs GPIO class directory.
pub struct SysfsBackend {
    root: PathBuf,
}

impl SysfsBackend {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{pin}"))
    }

    async fn write_control(
        &self,
        path: PathBuf,
        contents: &str,
        op: &str,
    ) -> Result<(), GpioError> {
        debug!("sysfs write {} <- {contents}", path.display());
        fs::write(&path, contents)
            .await
            .map_err(|e| GpioError::io(format!("{op} ({})", path.display()), e))
    }
}

impl GpioBackend for SysfsBackend {
    async fn is_exported(&self, pin: u32) -> bool {
        fs::try_exists(self.pin_dir(pin)).await.unwrap_or(false)
    }

    async fn export(&self, pin: u32) -> Result<(), GpioError> {
        self.write_control(
            self.root.join("export"),
            &pin.to_string(),
            &format!("export pin {pin}"),
        )
        .await
    }

    async fn unexport(&self, pin: u32) -> Result<(), GpioError> {
        self.write_control(
            self.root.join("unexport"),
            &pin.to_string(),
            &format!("unexport pin {pin}"),
        )
        .await
    }

    async fn set_direction(&self, pin: u32, direction: Direction) -> Result<(), GpioError> {
        self.write_control(
            self.pin_dir(pin).join("direction"),
            direction.as_sysfs(),
            &format!("set direction of pin {pin}"),
        )
        .await
    }

    async fn read_value(&self, pin: u32) -> Result<String, GpioError> {
        let path = self.pin_dir(pin).join("value");
        let raw = fs::read_to_string(&path)
            .await
            .map_err(|e| GpioError::io(format!("read pin {pin} ({})", path.display()), e))?;
        Ok(raw.trim_end().to_string())
    }

    async fn write_value(&self, pin: u32, value: bool) -> Result<(), GpioError> {
        self.write_control(
            self.pin_dir(pin).join("value"),
            if value { "1" } else { "0" },
            &format!("write pin {pin}"),
        )
        .await
    }

    async fn value_stamp(&self, pin: u32) -> Option<ValueStamp> {
        let meta = fs::metadata(self.pin_dir(pin).join("value")).await.ok()?;
        #[cfg(unix)]
        let inode = std::os::unix::fs::MetadataExt::ino(&meta);
        #[cfg(not(unix))]
        let inode = 0;

        Some(ValueStamp {
            modified: meta.modified().ok(),
            len: meta.len(),
            inode,
        })
    }
}
