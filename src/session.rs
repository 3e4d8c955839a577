//! Session supervisor: takes one accepted RFCOMM connection through
//! handshake, capability-surface seeding, bus publication, and teardown
//!.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_stream::StreamExt;

use crate::{
    address::Address,
    bus::{Bus, DeviceHandle},
    dispatcher::Dispatcher,
    error::Error,
    io::Connection,
    link::Link,
    registry::{self, CapabilitySet},
    surface::kinds,
};

/// Lifecycle state of one device session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum State {
    Handshaking,
    Ready,
    Draining,
    Closed,
}

/// A running session's state, observable by the device table so a second
/// connection attempt for an address already in [State::Handshaking] or
/// [State::Ready] can be told apart from a stale, fully [State::Closed] one.
pub(crate) struct Handle {
    pub state: watch::Receiver<State>,
    pub task: tokio::task::JoinHandle<()>,
}

/// Spawns a session task for a newly accepted connection.
pub(crate) fn spawn(address: Address, connection: Connection, bus: Arc<Bus>) -> Handle {
    let (state_tx, state_rx) = watch::channel(State::Handshaking);
    let task = tokio::spawn(run(address, connection, bus, state_tx));
    Handle { state: state_rx, task }
}

/// Runs a session end to end: performs the handshake, seeds every
/// capability the device advertises, publishes the aggregate object, and
/// keeps every live surface's cache in sync with device notifications until
/// the link goes down.
async fn run(address: Address, connection: Connection, bus: Arc<Bus>, state_tx: watch::Sender<State>) {
    let path = dbus::Path::new(format!("/org/mdr/{}", address.path_component())).unwrap();

    log::info!("{address}: session starting");

    match handshake_and_seed(connection, bus.clone(), &path).await {
        Ok((handle, link)) => {
            let _ = state_tx.send(State::Ready);
            log::info!("{address}: connected");
            bus.publish_device(path.clone(), handle).await;
            bus.emit_connected(&path);

            link.closed().await;

            let _ = state_tx.send(State::Draining);
            log::info!("{address}: disconnected");
            bus.emit_disconnected(&path);
            bus.unpublish_device(&path).await;
        }
        Err(err) => {
            log::warn!("{address}: handshake failed, capability silently absent where applicable: {err}");
        }
    }

    let _ = state_tx.send(State::Closed);
}

async fn handshake_and_seed(
    connection: Connection, bus: Arc<Bus>, path: &dbus::Path<'static>,
) -> Result<(Arc<DeviceHandle>, Arc<Link>), Error> {
    let (link, inbound) = Link::spawn(connection);
    let link = Arc::new(link);
    let dispatcher = Arc::new(Dispatcher::new(link.clone()));

    let dispatcher_task = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let mut inbound = inbound;
            while let Some(payload) = inbound.next().await {
                dispatcher.handle_inbound(payload).await;
            }
            dispatcher.on_link_down().await;
        })
    };

    let caps = registry::discover(&dispatcher).await;
    let caps = match caps {
        Ok(caps) => caps,
        Err(err) => {
            dispatcher_task.abort();
            return Err(err);
        }
    };

    let handle = Arc::new(seed_surfaces(dispatcher, &caps, bus, path).await);
    Ok((handle, link))
}

/// Seeds every surface the registry reported as supported. A surface whose
/// initial get-request fails is left absent rather than failing the whole
/// session.
async fn seed_surfaces(
    dispatcher: Arc<Dispatcher>, caps: &CapabilitySet, bus: Arc<Bus>, path: &dbus::Path<'static>,
) -> DeviceHandle {
    let mut handle = DeviceHandle::default();

    handle.identity = try_seed("identity", kinds::Identity::seed(dispatcher.clone())).await;
    if caps.power {
        handle.power = try_seed("power", kinds::Power::seed(dispatcher.clone())).await;
    }
    if caps.battery {
        handle.battery = try_seed("battery", kinds::Battery::seed(dispatcher.clone())).await;
    }
    if caps.lr_battery {
        handle.lr_battery = try_seed("left/right battery", kinds::LrBattery::seed(dispatcher.clone())).await;
    }
    if caps.cradle_battery {
        handle.cradle_battery = try_seed("cradle battery", kinds::CradleBattery::seed(dispatcher.clone())).await;
    }
    if caps.lr_connection {
        handle.lr_connection =
            try_seed("left/right connection", kinds::LrConnectionSurface::seed(dispatcher.clone())).await;
    }

    if caps.nc_and_asm_combined {
        match kinds::seed_combined_nc_asm(dispatcher.clone()).await {
            Ok((nc, asm)) => {
                handle.noise_cancelling = Some(nc);
                handle.ambient_sound_mode = Some(asm);
            }
            Err(err) => log::warn!("combined noise cancelling/ambient sound mode seed failed: {err}"),
        }
    } else {
        if caps.noise_cancelling {
            handle.noise_cancelling = try_seed("noise cancelling", kinds::seed_noise_cancelling(dispatcher.clone())).await;
        }
        if caps.ambient_sound_mode {
            handle.ambient_sound_mode =
                try_seed("ambient sound mode", kinds::seed_ambient_sound_mode(dispatcher.clone())).await;
        }
    }

    if caps.equalizer {
        handle.equalizer = try_seed(
            "equalizer",
            kinds::Equalizer::seed(dispatcher.clone(), caps.eq_band_count, caps.eq_level_steps, caps.eq_presets.clone()),
        )
        .await;
    }
    if caps.auto_power_off {
        handle.auto_power_off =
            try_seed("auto power off", kinds::AutoPowerOff::seed(dispatcher.clone(), caps.auto_power_off_timeouts.clone()))
                .await;
    }
    if caps.assignable_keys {
        handle.assignable_keys = try_seed(
            "assignable keys",
            kinds::AssignableKeys::seed(dispatcher.clone(), caps.assignable_key_presets.clone()),
        )
        .await;
    }
    if caps.playback_volume {
        handle.playback = try_seed("playback volume", kinds::Playback::seed(dispatcher.clone())).await;
    }

    spawn_change_forwarders(&handle, bus, path.clone());
    handle
}

async fn try_seed<T>(name: &'static str, fut: impl std::future::Future<Output = Result<T, Error>>) -> Option<T> {
    match fut.await {
        Ok(value) => Some(value),
        Err(err) => {
            log::warn!("{name} capability absent: initial get-request failed: {err}");
            None
        }
    }
}

/// Spawns one task per live surface that forwards cache updates onto the
/// bus as `PropertiesChanged` signals.
fn spawn_change_forwarders(handle: &DeviceHandle, bus: Arc<Bus>, path: dbus::Path<'static>) {
    macro_rules! forward {
        ($surface:expr, $interface:expr, $project:expr) => {
            if let Some(surface) = &$surface {
                let mut cache = surface.cache.clone();
                let bus = bus.clone();
                let path = path.clone();
                tokio::spawn(async move {
                    while let Some(value) = cache.changed().await {
                        bus.emit_changed_many(&path, $interface, $project(value));
                    }
                });
            }
        };
    }

    use dbus::arg::{RefArg, Variant};
    fn prop(name: &str, value: impl RefArg + 'static) -> (String, Variant<Box<dyn RefArg>>) {
        (name.to_string(), Variant(Box::new(value) as Box<dyn RefArg>))
    }

    forward!(handle.battery, "org.mdr.Battery1", |v: kinds::BatteryStatus| {
        [prop("Level", v.level), prop("Charging", v.charging)].into_iter().collect()
    });
    forward!(handle.lr_battery, "org.mdr.LeftRightBattery1", |v: kinds::LrBatteryStatus| {
        [
            prop("LeftLevel", v.left.level),
            prop("LeftCharging", v.left.charging),
            prop("RightLevel", v.right.level),
            prop("RightCharging", v.right.charging),
        ]
        .into_iter()
        .collect()
    });
    forward!(handle.cradle_battery, "org.mdr.CradleBattery1", |v: kinds::BatteryStatus| {
        [prop("Level", v.level), prop("Charging", v.charging)].into_iter().collect()
    });
    forward!(handle.lr_connection, "org.mdr.LeftRightConnection1", |v: kinds::LrConnection| {
        [prop("LeftConnected", v.left_connected), prop("RightConnected", v.right_connected)].into_iter().collect()
    });
    forward!(handle.noise_cancelling, "org.mdr.NoiseCancelling1", |v: bool| [prop("Enabled", v)].into_iter().collect());
    forward!(handle.ambient_sound_mode, "org.mdr.AmbientSoundMode1", |v: (u8, kinds::AmbientMode)| {
        [prop("Amount", v.0), prop("Mode", v.1.name().to_string())].into_iter().collect()
    });
    forward!(handle.equalizer, "org.mdr.Equalizer1", |v: kinds::EqualizerState| {
        [
            prop("Preset", kinds::eq_preset_name(v.preset).to_string()),
            prop("Levels", v.levels.iter().map(|&l| l as i32).collect::<Vec<_>>()),
        ]
        .into_iter()
        .collect()
    });
    forward!(handle.auto_power_off, "org.mdr.AutoPowerOff1", |v: registry::AutoPowerOffTimeout| {
        [prop("Timeout", v.name().to_string())].into_iter().collect()
    });
    forward!(handle.playback, "org.mdr.Playback1", |v: u8| [prop("Volume", v)].into_iter().collect());
}
