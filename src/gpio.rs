use log::{debug, info, warn};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, mpsc};

use crate::backend::SysfsBackend;
use crate::config::{ControllerConfig, Direction, NamingMode};
use crate::error::{GpioError, Result};
use crate::pins::PinMapping;
use crate::watch::{ChangeDispatcher, ChangeEvent, ChangeListener, ChangeStream, ValueStamp};

/// File-level GPIO operations, keyed by hardware pin number.
pub trait GpioBackend: Send + Sync + 'static {
    /// Whether the pin's control directory currently exists.
    fn is_exported(&self, pin: u32) -> impl Future<Output = bool> + Send;
    fn export(&self, pin: u32) -> impl Future<Output = Result<()>> + Send;
    fn unexport(&self, pin: u32) -> impl Future<Output = Result<()>> + Send;
    fn set_direction(
        &self,
        pin: u32,
        direction: Direction,
    ) -> impl Future<Output = Result<()>> + Send;
    /// Value file contents without the trailing newline.
    fn read_value(&self, pin: u32) -> impl Future<Output = Result<String>> + Send;
    fn write_value(&self, pin: u32, value: bool) -> impl Future<Output = Result<()>> + Send;

    /// Push source delivering the new value text on every write to the
    /// pin's value file. `None` makes the controller poll instead.
    fn watch_value(&self, _pin: u32) -> Option<mpsc::UnboundedReceiver<String>> {
        None
    }

    /// Write identity of the value file, compared between polls so a
    /// rewrite of the same text still counts as a change.
    fn value_stamp(&self, _pin: u32) -> impl Future<Output = Option<ValueStamp>> + Send {
        async { None }
    }
}

struct ExportedPin {
    channel: u32,
    listener: Option<ChangeListener>, // stopped before the pin is unexported
}

/// Owns the naming mode, the set of exported pins and their change watches.
///
/// All I/O goes through the backend asynchronously. Locks are only held
/// between await points, so the controller can be shared behind an `Arc`.
pub struct PinController<B: GpioBackend> {
    backend: Arc<B>,
    mapping: PinMapping,
    mode: RwLock<NamingMode>,
    exported: Mutex<FxHashMap<u32, ExportedPin>>, // keyed by hardware pin
    dispatcher: Arc<ChangeDispatcher>,
    poll_interval: Duration,
}

impl PinController<SysfsBackend> {
    /// Controller over the sysfs tree at `config.sysfs_root`.
    pub fn sysfs(config: &ControllerConfig) -> Result<Self> {
        Self::new(config, Arc::new(SysfsBackend::new(&config.sysfs_root)))
    }
}

impl<B: GpioBackend> PinController<B> {
    pub fn new(config: &ControllerConfig, backend: Arc<B>) -> Result<Self> {
        config.validate()?;

        let mapping = config
            .pin_mapping
            .clone()
            .map(PinMapping::new)
            .unwrap_or_default();
        let dispatcher = Arc::new(ChangeDispatcher::new(
            config.broadcast_capacity,
            config.event_history_capacity,
        ));

        Ok(Self {
            backend,
            mapping,
            mode: RwLock::new(config.naming_mode),
            exported: Mutex::new(FxHashMap::default()),
            dispatcher,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        })
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn naming_mode(&self) -> NamingMode {
        *self.mode.read()
    }

    /// Applies to channels referenced from now on. Pins already exported
    /// keep the hardware number they were set up with.
    pub fn set_naming_mode(&self, mode: NamingMode) {
        let mut current = self.mode.write();
        if *current != mode {
            info!("naming mode {} -> {}", *current, mode);
            *current = mode;
        }
    }

    /// Like `set_naming_mode`, parsing the mode name first. An unknown name
    /// leaves the current mode untouched.
    pub fn set_naming_mode_by_name(&self, name: &str) -> Result<()> {
        let mode = name.parse::<NamingMode>()?;
        self.set_naming_mode(mode);
        Ok(())
    }

    /// Translates a channel into the hardware pin number under the current
    /// naming mode.
    pub fn get_pin(&self, channel: u32) -> Result<u32> {
        match self.naming_mode() {
            NamingMode::Hardware => Ok(channel),
            NamingMode::Logical => self
                .mapping
                .lookup(channel)
                .ok_or(GpioError::UnmappedPin(channel)),
        }
    }

    /// Exports the channel's pin, starts watching its value file and sets
    /// its direction, in that order. A pin that is already exported is
    /// released first so no stale direction, watch or change history
    /// survives. If the direction cannot be set the pin is released again.
    pub async fn setup(&self, channel: u32, direction: Direction) -> Result<()> {
        let pin = self.get_pin(channel)?;

        let tracked = self.exported.lock().contains_key(&pin);
        if tracked || self.backend.is_exported(pin).await {
            debug!("pin {pin} already exported, releasing before setup");
            if let Err(e) = self.release_pin(pin).await {
                warn!("release of pin {pin} before setup failed: {e}");
            }
        }

        self.backend.export(pin).await.inspect_err(|e| {
            warn!("setup channel {channel}: {e}");
        })?;

        let listener = ChangeListener::start(
            channel,
            pin,
            self.backend.clone(),
            self.dispatcher.clone(),
            self.poll_interval,
        )
        .await;
        self.exported.lock().insert(
            pin,
            ExportedPin {
                channel,
                listener: Some(listener),
            },
        );

        if let Err(e) = self.backend.set_direction(pin, direction).await {
            warn!("setup channel {channel}: {e}");
            if let Err(release) = self.release_pin(pin).await {
                warn!("release of pin {pin} after failed setup: {release}");
            }
            return Err(e);
        }

        info!("channel {channel} (pin {pin}) set up as {direction}");
        Ok(())
    }

    /// Drives the channel high for `true`, low for `false`.
    pub async fn write(&self, channel: u32, value: bool) -> Result<()> {
        let pin = self.get_pin(channel)?;

        match self.backend.write_value(pin, value).await {
            Ok(()) => {
                debug!("channel {channel} (pin {pin}) <- {}", u8::from(value));
                Ok(())
            }
            Err(e) => {
                warn!("write channel {channel}: {e}");
                Err(e)
            }
        }
    }

    pub async fn output(&self, channel: u32, value: bool) -> Result<()> {
        self.write(channel, value).await
    }

    /// Raw text of the channel's value file, normally `"0"` or `"1"`.
    pub async fn read(&self, channel: u32) -> Result<String> {
        let pin = self.get_pin(channel)?;

        match self.backend.read_value(pin).await {
            Ok(value) => {
                debug!("channel {channel} (pin {pin}) -> {value}");
                Ok(value)
            }
            Err(e) => {
                warn!("read channel {channel}: {e}");
                Err(e)
            }
        }
    }

    pub async fn input(&self, channel: u32) -> Result<String> {
        self.read(channel).await
    }

    pub async fn read_level(&self, channel: u32) -> Result<bool> {
        let value = self.read(channel).await?;
        match value.as_str() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(GpioError::io(
                format!("read channel {channel}"),
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected value '{other}'"),
                ),
            )),
        }
    }

    /// Stops the channel's change watch and releases its pin. I/O failures
    /// are logged and otherwise ignored; only translation errors are
    /// returned.
    pub async fn unexport(&self, channel: u32) -> Result<()> {
        let pin = self.get_pin(channel)?;

        match self.release_pin(pin).await {
            Ok(()) => info!("channel {channel} (pin {pin}) unexported"),
            Err(e) => warn!("unexport channel {channel}: {e}"),
        }
        Ok(())
    }

    /// Best-effort release of every pin this controller exported. Returns
    /// how many unexports were attempted. The kernel may still leave pin
    /// directories behind.
    pub async fn release_all(&self) -> usize {
        let pins: Vec<(u32, ExportedPin)> = self.exported.lock().drain().collect();
        let attempted = pins.len();

        for (pin, entry) in pins {
            if let Some(listener) = entry.listener {
                listener.stop().await;
            }
            self.dispatcher.clear(entry.channel);
            if let Err(e) = self.backend.unexport(pin).await {
                warn!("release channel {} (pin {pin}): {e}", entry.channel);
            }
        }

        info!("released {attempted} exported pins");
        attempted
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.dispatcher.subscribe()
    }

    /// Stream of change events for one channel.
    pub fn changes(&self, channel: u32) -> ChangeStream {
        ChangeStream::new(self.dispatcher.subscribe(), channel)
    }

    pub fn recent_changes(&self, channel: u32, limit: Option<usize>) -> Vec<ChangeEvent> {
        self.dispatcher.recent(channel, limit)
    }

    pub fn last_change(&self, channel: u32) -> Option<ChangeEvent> {
        self.dispatcher.last(channel)
    }

    /// Hardware pins currently exported by this controller, ascending.
    pub fn exported_pins(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self.exported.lock().keys().copied().collect();
        pins.sort_unstable();
        pins
    }

    pub fn is_exported(&self, channel: u32) -> Result<bool> {
        let pin = self.get_pin(channel)?;
        Ok(self.exported.lock().contains_key(&pin))
    }

    async fn release_pin(&self, pin: u32) -> Result<()> {
        let entry = self.exported.lock().remove(&pin);
        if let Some(entry) = entry {
            if let Some(listener) = entry.listener {
                listener.stop().await;
            }
            self.dispatcher.clear(entry.channel);
        }
        self.backend.unexport(pin).await
    }
}

impl<B: GpioBackend> Drop for PinController<B> {
    fn drop(&mut self) {
        let pins: Vec<u32> = self.exported.get_mut().drain().map(|(pin, _)| pin).collect();
        if pins.is_empty() {
            return;
        }

        // fire and forget, the runtime may shut down before this finishes
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let backend = self.backend.clone();
                handle.spawn(async move {
                    for pin in pins {
                        if let Err(e) = backend.unexport(pin).await {
                            warn!("release pin {pin} on drop: {e}");
                        }
                    }
                });
            }
            Err(_) => {
                warn!("controller dropped outside a runtime, {} pins left exported", pins.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockGpioBackend;

    fn controller(mode: NamingMode) -> PinController<MockGpioBackend> {
        let config = ControllerConfig {
            naming_mode: mode,
            ..ControllerConfig::default()
        };
        PinController::new(&config, Arc::new(MockGpioBackend::default())).unwrap()
    }

    #[test]
    fn logical_mode_uses_mapping() {
        let ctl = controller(NamingMode::Logical);
        assert_eq!(ctl.get_pin(7).unwrap(), 4);
        assert_eq!(ctl.get_pin(12).unwrap(), 18);
        assert!(matches!(ctl.get_pin(6), Err(GpioError::UnmappedPin(6))));
        assert!(matches!(ctl.get_pin(99), Err(GpioError::UnmappedPin(99))));
    }

    #[test]
    fn hardware_mode_is_identity() {
        let ctl = controller(NamingMode::Hardware);
        for channel in [0, 6, 17, 99, 512] {
            assert_eq!(ctl.get_pin(channel).unwrap(), channel);
        }
    }

    #[test]
    fn unknown_mode_name_keeps_current_mode() {
        let ctl = controller(NamingMode::Hardware);
        let err = ctl.set_naming_mode_by_name("wiring-pi").unwrap_err();
        assert!(matches!(err, GpioError::InvalidArgument(_)));
        assert_eq!(ctl.naming_mode(), NamingMode::Hardware);

        ctl.set_naming_mode_by_name("mode_rpi").unwrap();
        assert_eq!(ctl.naming_mode(), NamingMode::Logical);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ControllerConfig {
            broadcast_capacity: 0,
            ..ControllerConfig::default()
        };
        let result = PinController::new(&config, Arc::new(MockGpioBackend::default()));
        assert!(matches!(result, Err(GpioError::Config(_))));
    }

    #[test]
    fn custom_mapping_replaces_header_table() {
        let mut table = FxHashMap::default();
        table.insert(1, Some(200));
        let config = ControllerConfig {
            pin_mapping: Some(table),
            ..ControllerConfig::default()
        };
        let ctl = PinController::new(&config, Arc::new(MockGpioBackend::default())).unwrap();
        assert_eq!(ctl.get_pin(1).unwrap(), 200);
        assert!(matches!(ctl.get_pin(7), Err(GpioError::UnmappedPin(7))));
    }
}
