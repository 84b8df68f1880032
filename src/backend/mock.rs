use std::io::{self, ErrorKind};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;

use crate::config::Direction;
use crate::error::GpioError;
use crate::gpio::GpioBackend;

/// In-memory stand-in for the sysfs GPIO directory. Mirrors the kernel's
/// refusals (busy export, access to unexported pins, writes to inputs) and
/// records every mutating call in order. Every write to a value, external or
/// not, is pushed to the pin's watchers.
#[derive(Default)]
pub struct MockGpioBackend {
    pins: Mutex<FxHashMap<u32, MockPinState>>, // keyed by hardware pin
    operations: Mutex<Vec<MockOperation>>,
    failing: Mutex<FxHashSet<u32>>,
    failing_direction: Mutex<FxHashSet<u32>>,
    watchers: Mutex<FxHashMap<u32, Vec<mpsc::UnboundedSender<String>>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOperation {
    Export(u32),
    Unexport(u32),
    SetDirection(u32, Direction),
    Write(u32, bool),
}

#[derive(Clone)]
struct MockPinState {
    direction: Direction,
    value: String,
}

impl Default for MockPinState {
    fn default() -> Self {
        Self {
            direction: Direction::Input,
            value: "0".into(),
        }
    }
}

impl MockGpioBackend {
    /// Pretend `pin` was left exported by an earlier process.
    pub fn preexport(&self, pin: u32) {
        self.pins.lock().entry(pin).or_default();
    }

    /// Every following operation on `pin` fails with `PermissionDenied`.
    pub fn fail_pin(&self, pin: u32) {
        self.failing.lock().insert(pin);
    }

    pub fn restore_pin(&self, pin: u32) {
        self.failing.lock().remove(&pin);
        self.failing_direction.lock().remove(&pin);
    }

    /// Only direction writes on `pin` fail, as for a line the kernel keeps
    /// fixed.
    pub fn fail_direction(&self, pin: u32) {
        self.failing_direction.lock().insert(pin);
    }

    /// Change the value file from outside the controller, as wiring would.
    pub fn set_external_value(&self, pin: u32, value: &str) -> bool {
        let written = match self.pins.lock().get_mut(&pin) {
            Some(state) => {
                state.value = value.to_string();
                true
            }
            None => false,
        };
        if written {
            self.notify(pin, value);
        }
        written
    }

    pub fn value(&self, pin: u32) -> Option<String> {
        self.pins.lock().get(&pin).map(|p| p.value.clone())
    }

    pub fn direction(&self, pin: u32) -> Option<Direction> {
        self.pins.lock().get(&pin).map(|p| p.direction)
    }

    pub fn operations(&self) -> Vec<MockOperation> {
        self.operations.lock().clone()
    }

    pub fn export_count(&self, pin: u32) -> usize {
        self.operations
            .lock()
            .iter()
            .filter(|op| **op == MockOperation::Export(pin))
            .count()
    }

    fn notify(&self, pin: u32, value: &str) {
        if let Some(senders) = self.watchers.lock().get_mut(&pin) {
            senders.retain(|tx| tx.send(value.to_string()).is_ok());
        }
    }

    fn record(&self, op: MockOperation) {
        self.operations.lock().push(op);
    }

    fn check_available(&self, pin: u32, op: &str) -> Result<(), GpioError> {
        if self.failing.lock().contains(&pin) {
            return Err(GpioError::io(
                format!("{op} pin {pin}"),
                io::Error::new(ErrorKind::PermissionDenied, "permission denied"),
            ));
        }
        Ok(())
    }

    fn with_pin<T>(
        &self,
        pin: u32,
        op: &str,
        f: impl FnOnce(&mut MockPinState) -> Result<T, GpioError>,
    ) -> Result<T, GpioError> {
        self.check_available(pin, op)?;
        let mut pins = self.pins.lock();
        let state = pins.get_mut(&pin).ok_or_else(|| {
            GpioError::io(
                format!("{op} pin {pin}"),
                io::Error::new(ErrorKind::NotFound, "no such file or directory"),
            )
        })?;
        f(state)
    }
}

impl GpioBackend for MockGpioBackend {
    async fn is_exported(&self, pin: u32) -> bool {
        self.pins.lock().contains_key(&pin)
    }

    async fn export(&self, pin: u32) -> Result<(), GpioError> {
        self.check_available(pin, "export")?;
        self.record(MockOperation::Export(pin));
        let mut pins = self.pins.lock();
        if pins.contains_key(&pin) {
            return Err(GpioError::io(
                format!("export pin {pin}"),
                io::Error::new(ErrorKind::ResourceBusy, "device or resource busy"),
            ));
        }
        pins.insert(pin, MockPinState::default());
        Ok(())
    }

    async fn unexport(&self, pin: u32) -> Result<(), GpioError> {
        self.check_available(pin, "unexport")?;
        self.record(MockOperation::Unexport(pin));
        self.watchers.lock().remove(&pin);
        match self.pins.lock().remove(&pin) {
            Some(_) => Ok(()),
            None => Err(GpioError::io(
                format!("unexport pin {pin}"),
                io::Error::new(ErrorKind::InvalidInput, "invalid argument"),
            )),
        }
    }

    async fn set_direction(&self, pin: u32, direction: Direction) -> Result<(), GpioError> {
        if self.failing_direction.lock().contains(&pin) {
            return Err(GpioError::io(
                format!("set direction of pin {pin}"),
                io::Error::new(ErrorKind::PermissionDenied, "operation not permitted"),
            ));
        }
        self.with_pin(pin, "set direction of", |state| {
            state.direction = direction;
            Ok(())
        })?;
        self.record(MockOperation::SetDirection(pin, direction));
        Ok(())
    }

    async fn read_value(&self, pin: u32) -> Result<String, GpioError> {
        self.with_pin(pin, "read", |state| Ok(state.value.clone()))
    }

    async fn write_value(&self, pin: u32, value: bool) -> Result<(), GpioError> {
        self.with_pin(pin, "write", |state| {
            if state.direction != Direction::Output {
                return Err(GpioError::io(
                    format!("write pin {pin}"),
                    io::Error::new(ErrorKind::PermissionDenied, "pin is not an output"),
                ));
            }
            state.value = if value { "1" } else { "0" }.to_string();
            Ok(())
        })?;
        self.record(MockOperation::Write(pin, value));
        self.notify(pin, if value { "1" } else { "0" });
        Ok(())
    }

    fn watch_value(&self, pin: u32) -> Option<mpsc::UnboundedReceiver<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().entry(pin).or_default().push(tx);
        Some(rx)
    }
}
