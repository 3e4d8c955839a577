//! D-Bus surface: connects to the system bus, claims `org.mdr`, and exports
//! one object per connected device with one interface per live capability
//! surface.
//!
//! A device's full interface set is inserted into [Crossroads] atomically,
//! once every surface has finished seeding, so that the single
//! `InterfacesAdded` signal `dbus-crossroads`'s object-manager support emits
//! doubles as the aggregate connected notification. Tearing the device back
//! down is a single `cr.remove`, producing the matching `InterfacesRemoved`.

use std::{collections::HashMap, marker::PhantomData, sync::Arc};

use dbus::{
    arg::{AppendAll, PropMap, RefArg, Variant},
    channel::Sender,
    message::MatchRule,
    nonblock::SyncConnection,
};
use dbus_crossroads::{Context, Crossroads, IfaceBuilder, IfaceToken};
use futures::{Future, StreamExt};
use tokio::{
    sync::Mutex,
    task::{spawn_blocking, JoinHandle},
};

use crate::{
    error::{Error, ErrorKind},
    profile::{self, ProfileHandle, RegisteredProfile},
    registry::AssignableKey,
    surface::kinds,
};

pub(crate) const BLUEZ_SERVICE_NAME: &str = "org.bluez";
pub(crate) const TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

type DbusResult<T> = std::result::Result<T, dbus::MethodErr>;

/// Runs a method call against the `Arc<T>` registered at the call's object
/// path, logging the call at trace level.
pub(crate) fn method_call<T, R, F>(
    mut ctx: Context, cr: &mut Crossroads, f: impl FnOnce(Arc<T>) -> F,
) -> impl Future<Output = PhantomData<R>>
where
    T: Send + Sync + 'static,
    R: AppendAll + std::fmt::Debug,
    F: Future<Output = DbusResult<R>> + Send + 'static,
{
    let data_ref: &mut Arc<T> = cr.data_mut(ctx.path()).unwrap();
    let data: Arc<T> = data_ref.clone();
    async move {
        let result = f(data).await;
        log::trace!("{}: {}.{} -> {:?}", ctx.path(), ctx.interface().map(|i| i.to_string()).unwrap_or_default(), ctx.method(), &result);
        ctx.reply(result)
    }
}

macro_rules! cr_property {
    ($ib:expr, $dbus_name:expr, $obj:ident => $get:block) => {
        $ib.property($dbus_name).get(|ctx, $obj| {
            let value = $get;
            match value {
                Some(v) => Ok(v),
                None => Err(dbus_crossroads::MethodErr::no_property($dbus_name)),
            }
        })
    };
}

/// The set of live capability surfaces for one connected device, and the
/// D-Bus presentation of them.
#[derive(Default)]
pub(crate) struct DeviceHandle {
    pub identity: Option<kinds::Identity>,
    pub power: Option<kinds::Power>,
    pub battery: Option<kinds::Battery>,
    pub lr_battery: Option<kinds::LrBattery>,
    pub cradle_battery: Option<kinds::CradleBattery>,
    pub lr_connection: Option<kinds::LrConnectionSurface>,
    pub noise_cancelling: Option<kinds::NoiseCancelling>,
    pub ambient_sound_mode: Option<kinds::AmbientSoundMode>,
    pub equalizer: Option<kinds::Equalizer>,
    pub auto_power_off: Option<kinds::AutoPowerOff>,
    pub assignable_keys: Option<kinds::AssignableKeys>,
    pub playback: Option<kinds::Playback>,
}

/// Interface tokens registered once at startup, reused for every device
/// object we export.
pub(crate) struct InterfaceTokens {
    identity: IfaceToken<Arc<DeviceHandle>>,
    power: IfaceToken<Arc<DeviceHandle>>,
    battery: IfaceToken<Arc<DeviceHandle>>,
    lr_battery: IfaceToken<Arc<DeviceHandle>>,
    cradle_battery: IfaceToken<Arc<DeviceHandle>>,
    lr_connection: IfaceToken<Arc<DeviceHandle>>,
    noise_cancelling: IfaceToken<Arc<DeviceHandle>>,
    ambient_sound_mode: IfaceToken<Arc<DeviceHandle>>,
    equalizer: IfaceToken<Arc<DeviceHandle>>,
    auto_power_off: IfaceToken<Arc<DeviceHandle>>,
    assignable_keys: IfaceToken<Arc<DeviceHandle>>,
    playback: IfaceToken<Arc<DeviceHandle>>,
    profile: IfaceToken<Arc<RegisteredProfile>>,
}

fn register_identity(cr: &mut Crossroads) -> IfaceToken<Arc<DeviceHandle>> {
    cr.register("org.mdr.Identity1", |ib: &mut IfaceBuilder<Arc<DeviceHandle>>| {
        cr_property!(ib, "Name", obj => { obj.identity.as_ref().map(|i| i.cache.get()) });
        ib.signal::<(), _>("Connected", ());
        ib.signal::<(), _>("Disconnected", ());
    })
}

fn register_power(cr: &mut Crossroads) -> IfaceToken<Arc<DeviceHandle>> {
    cr.register("org.mdr.Power1", |ib: &mut IfaceBuilder<Arc<DeviceHandle>>| {
        ib.method_with_cr_async("PowerOff", (), (), |ctx, cr, ()| {
            method_call(ctx, cr, |obj: Arc<DeviceHandle>| async move {
                match &obj.power {
                    Some(power) => power.power_off().await.map_err(Into::into),
                    None => Err(dbus::MethodErr::no_interface("org.mdr.Power1")),
                }
            })
        });
    })
}

fn register_battery(cr: &mut Crossroads) -> IfaceToken<Arc<DeviceHandle>> {
    cr.register("org.mdr.Battery1", |ib: &mut IfaceBuilder<Arc<DeviceHandle>>| {
        cr_property!(ib, "Level", obj => { obj.battery.as_ref().map(|b| b.cache.get().level) });
        cr_property!(ib, "Charging", obj => { obj.battery.as_ref().map(|b| b.cache.get().charging) });
    })
}

fn register_lr_battery(cr: &mut Crossroads) -> IfaceToken<Arc<DeviceHandle>> {
    cr.register("org.mdr.LeftRightBattery1", |ib: &mut IfaceBuilder<Arc<DeviceHandle>>| {
        cr_property!(ib, "LeftLevel", obj => { obj.lr_battery.as_ref().map(|b| b.cache.get().left.level) });
        cr_property!(ib, "LeftCharging", obj => { obj.lr_battery.as_ref().map(|b| b.cache.get().left.charging) });
        cr_property!(ib, "RightLevel", obj => { obj.lr_battery.as_ref().map(|b| b.cache.get().right.level) });
        cr_property!(ib, "RightCharging", obj => { obj.lr_battery.as_ref().map(|b| b.cache.get().right.charging) });
    })
}

fn register_cradle_battery(cr: &mut Crossroads) -> IfaceToken<Arc<DeviceHandle>> {
    cr.register("org.mdr.CradleBattery1", |ib: &mut IfaceBuilder<Arc<DeviceHandle>>| {
        cr_property!(ib, "Level", obj => { obj.cradle_battery.as_ref().map(|b| b.cache.get().level) });
        cr_property!(ib, "Charging", obj => { obj.cradle_battery.as_ref().map(|b| b.cache.get().charging) });
    })
}

fn register_lr_connection(cr: &mut Crossroads) -> IfaceToken<Arc<DeviceHandle>> {
    cr.register("org.mdr.LeftRightConnection1", |ib: &mut IfaceBuilder<Arc<DeviceHandle>>| {
        cr_property!(ib, "LeftConnected", obj => { obj.lr_connection.as_ref().map(|c| c.cache.get().left_connected) });
        cr_property!(ib, "RightConnected", obj => { obj.lr_connection.as_ref().map(|c| c.cache.get().right_connected) });
    })
}

fn register_noise_cancelling(cr: &mut Crossroads) -> IfaceToken<Arc<DeviceHandle>> {
    cr.register("org.mdr.NoiseCancelling1", |ib: &mut IfaceBuilder<Arc<DeviceHandle>>| {
        cr_property!(ib, "Enabled", obj => { obj.noise_cancelling.as_ref().map(|nc| nc.cache.get()) });
        ib.method_with_cr_async("Enable", (), (), |ctx, cr, ()| {
            method_call(ctx, cr, |obj: Arc<DeviceHandle>| async move {
                match &obj.noise_cancelling {
                    Some(nc) => nc.enable().await.map_err(Into::into),
                    None => Err(dbus::MethodErr::no_interface("org.mdr.NoiseCancelling1")),
                }
            })
        });
        ib.method_with_cr_async("Disable", (), (), |ctx, cr, ()| {
            method_call(ctx, cr, |obj: Arc<DeviceHandle>| async move {
                match &obj.noise_cancelling {
                    Some(nc) => nc.disable().await.map_err(Into::into),
                    None => Err(dbus::MethodErr::no_interface("org.mdr.NoiseCancelling1")),
                }
            })
        });
    })
}

fn register_ambient_sound_mode(cr: &mut Crossroads) -> IfaceToken<Arc<DeviceHandle>> {
    cr.register("org.mdr.AmbientSoundMode1", |ib: &mut IfaceBuilder<Arc<DeviceHandle>>| {
        cr_property!(ib, "Amount", obj => { obj.ambient_sound_mode.as_ref().map(|a| a.cache.get().0) });
        cr_property!(ib, "Mode", obj => { obj.ambient_sound_mode.as_ref().map(|a| a.cache.get().1.name().to_string()) });
        ib.method_with_cr_async("SetAmount", ("amount",), (), |ctx, cr, (amount,): (u32,)| {
            method_call(ctx, cr, move |obj: Arc<DeviceHandle>| async move {
                match &obj.ambient_sound_mode {
                    Some(asm) => asm.set_amount(amount).await.map_err(Into::into),
                    None => Err(dbus::MethodErr::no_interface("org.mdr.AmbientSoundMode1")),
                }
            })
        });
        ib.method_with_cr_async("SetMode", ("mode",), (), |ctx, cr, (mode,): (String,)| {
            method_call(ctx, cr, move |obj: Arc<DeviceHandle>| async move {
                match &obj.ambient_sound_mode {
                    Some(asm) => asm.set_mode(&mode).await.map_err(Into::into),
                    None => Err(dbus::MethodErr::no_interface("org.mdr.AmbientSoundMode1")),
                }
            })
        });
    })
}

fn register_equalizer(cr: &mut Crossroads) -> IfaceToken<Arc<DeviceHandle>> {
    cr.register("org.mdr.Equalizer1", |ib: &mut IfaceBuilder<Arc<DeviceHandle>>| {
        cr_property!(ib, "BandCount", obj => { obj.equalizer.as_ref().map(|eq| eq.band_count) });
        cr_property!(ib, "LevelSteps", obj => { obj.equalizer.as_ref().map(|eq| eq.level_steps) });
        cr_property!(ib, "AvailablePresets", obj => {
            obj.equalizer.as_ref().map(|eq| eq.available_presets.iter().map(|&id| kinds::eq_preset_name(id).to_string()).collect::<Vec<_>>())
        });
        cr_property!(ib, "Preset", obj => { obj.equalizer.as_ref().map(|eq| kinds::eq_preset_name(eq.cache.get().preset).to_string()) });
        cr_property!(ib, "Levels", obj => { obj.equalizer.as_ref().map(|eq| eq.cache.get().levels.iter().map(|&l| l as i32).collect::<Vec<_>>()) });
        ib.method_with_cr_async("SetPreset", ("name",), (), |ctx, cr, (name,): (String,)| {
            method_call(ctx, cr, move |obj: Arc<DeviceHandle>| async move {
                match &obj.equalizer {
                    Some(eq) => eq.set_preset(&name).await.map_err(Into::into),
                    None => Err(dbus::MethodErr::no_interface("org.mdr.Equalizer1")),
                }
            })
        });
        ib.method_with_cr_async("SetLevels", ("levels",), (), |ctx, cr, (levels,): (Vec<i32>,)| {
            method_call(ctx, cr, move |obj: Arc<DeviceHandle>| async move {
                match &obj.equalizer {
                    Some(eq) => {
                        let levels: Vec<i8> = levels.iter().map(|&l| l as i8).collect();
                        eq.set_levels(&levels).await.map_err(Into::into)
                    }
                    None => Err(dbus::MethodErr::no_interface("org.mdr.Equalizer1")),
                }
            })
        });
    })
}

fn register_auto_power_off(cr: &mut Crossroads) -> IfaceToken<Arc<DeviceHandle>> {
    cr.register("org.mdr.AutoPowerOff1", |ib: &mut IfaceBuilder<Arc<DeviceHandle>>| {
        cr_property!(ib, "Timeout", obj => { obj.auto_power_off.as_ref().map(|a| a.cache.get().name().to_string()) });
        ib.method_with_cr_async("SetTimeout", ("name",), (), |ctx, cr, (name,): (String,)| {
            method_call(ctx, cr, move |obj: Arc<DeviceHandle>| async move {
                match &obj.auto_power_off {
                    Some(apo) => apo.set_timeout(&name).await.map_err(Into::into),
                    None => Err(dbus::MethodErr::no_interface("org.mdr.AutoPowerOff1")),
                }
            })
        });
    })
}

fn register_assignable_keys(cr: &mut Crossroads) -> IfaceToken<Arc<DeviceHandle>> {
    cr.register("org.mdr.AssignableKeys1", |ib: &mut IfaceBuilder<Arc<DeviceHandle>>| {
        cr_property!(ib, "AvailablePresets", obj => {
            obj.assignable_keys.as_ref().map(|ak| {
                ak.available_presets
                    .iter()
                    .map(|(key, info)| {
                        let presets: HashMap<u8, HashMap<u8, u8>> = info
                            .presets
                            .iter()
                            .map(|p| {
                                let bindings: HashMap<u8, u8> =
                                    p.bindings.iter().map(|(action, function)| (action.0, *function)).collect();
                                (p.preset, bindings)
                            })
                            .collect();
                        (key.0, (info.key_type, info.default_preset, presets))
                    })
                    .collect::<HashMap<u8, (u8, u8, HashMap<u8, HashMap<u8, u8>>)>>()
            })
        });
        cr_property!(ib, "Presets", obj => {
            obj.assignable_keys.as_ref().map(|ak| {
                ak.cache.get().into_iter().map(|(key, preset)| (key.0, preset)).collect::<HashMap<u8, u8>>()
            })
        });
        ib.method_with_cr_async("SetPresets", ("presets",), (), |ctx, cr, (presets,): (HashMap<u8, u8>,)| {
            method_call(ctx, cr, move |obj: Arc<DeviceHandle>| async move {
                match &obj.assignable_keys {
                    Some(ak) => {
                        let wanted: HashMap<AssignableKey, u8> =
                            presets.into_iter().map(|(key, preset)| (AssignableKey(key), preset)).collect();
                        ak.set_presets(&wanted).await.map_err(Into::into)
                    }
                    None => Err(dbus::MethodErr::no_interface("org.mdr.AssignableKeys1")),
                }
            })
        });
    })
}

fn register_playback(cr: &mut Crossroads) -> IfaceToken<Arc<DeviceHandle>> {
    cr.register("org.mdr.Playback1", |ib: &mut IfaceBuilder<Arc<DeviceHandle>>| {
        cr_property!(ib, "Volume", obj => { obj.playback.as_ref().map(|p| p.cache.get()) });
        ib.method_with_cr_async("SetVolume", ("volume",), (), |ctx, cr, (volume,): (u32,)| {
            method_call(ctx, cr, move |obj: Arc<DeviceHandle>| async move {
                match &obj.playback {
                    Some(p) => p.set_volume(volume).await.map_err(Into::into),
                    None => Err(dbus::MethodErr::no_interface("org.mdr.Playback1")),
                }
            })
        });
    })
}

/// A live connection to the system bus, the token set for every capability
/// interface, and the profile object we registered on it.
pub struct Bus {
    connection: Arc<SyncConnection>,
    crossroads: Arc<Mutex<Crossroads>>,
    tokens: InterfaceTokens,
    _dbus_task: JoinHandle<()>,
}

impl Bus {
    /// Connects to the system bus, claims `org.mdr`, and registers the
    /// MDR RFCOMM profile.
    pub async fn connect() -> Result<(Self, ProfileHandle), Error> {
        let (resource, connection) = spawn_blocking(dbus_tokio::connection::new_system_sync)
            .await
            .map_err(Error::from)?
            .map_err(Error::from)?;
        let dbus_task = tokio::spawn(async move {
            let err = resource.await;
            log::error!("D-Bus connection lost: {err}");
        });

        connection
            .request_name(profile::SERVICE_NAME, false, true, false)
            .await
            .map_err(Error::from)?;

        let mut crossroads = Crossroads::new();
        crossroads.set_async_support(Some((connection.clone(), Box::new(|x| { tokio::spawn(x); }))));
        crossroads.set_object_manager_support(Some(connection.clone()));

        let tokens = InterfaceTokens {
            identity: register_identity(&mut crossroads),
            power: register_power(&mut crossroads),
            battery: register_battery(&mut crossroads),
            lr_battery: register_lr_battery(&mut crossroads),
            cradle_battery: register_cradle_battery(&mut crossroads),
            lr_connection: register_lr_connection(&mut crossroads),
            noise_cancelling: register_noise_cancelling(&mut crossroads),
            ambient_sound_mode: register_ambient_sound_mode(&mut crossroads),
            equalizer: register_equalizer(&mut crossroads),
            auto_power_off: register_auto_power_off(&mut crossroads),
            assignable_keys: register_assignable_keys(&mut crossroads),
            playback: register_playback(&mut crossroads),
            profile: RegisteredProfile::register_interface(&mut crossroads),
        };

        let crossroads = Arc::new(Mutex::new(crossroads));
        let mc_callback = connection.add_match(MatchRule::new_method_call()).await.map_err(Error::from)?;
        let mc_crossroads = crossroads.clone();
        let mc_connection = connection.clone();
        tokio::spawn(async move {
            let (_mc_callback, mut mc_stream) = mc_callback.msg_stream();
            while let Some(msg) = mc_stream.next().await {
                let mut cr = mc_crossroads.lock().await;
                let _ = cr.handle_message(msg, &*mc_connection);
            }
        });

        let profile_handle = profile::register(connection.clone(), &crossroads, tokens.profile.clone()).await?;

        Ok((Self { connection, crossroads, tokens, _dbus_task: dbus_task }, profile_handle))
    }

    /// Exports every interface `handle` has a live surface for at `path`,
    /// in one atomic insert.
    pub(crate) async fn publish_device(&self, path: dbus::Path<'static>, handle: Arc<DeviceHandle>) {
        let mut ifaces = vec![self.tokens.identity];
        if handle.power.is_some() {
            ifaces.push(self.tokens.power);
        }
        if handle.battery.is_some() {
            ifaces.push(self.tokens.battery);
        }
        if handle.lr_battery.is_some() {
            ifaces.push(self.tokens.lr_battery);
        }
        if handle.cradle_battery.is_some() {
            ifaces.push(self.tokens.cradle_battery);
        }
        if handle.lr_connection.is_some() {
            ifaces.push(self.tokens.lr_connection);
        }
        if handle.noise_cancelling.is_some() {
            ifaces.push(self.tokens.noise_cancelling);
        }
        if handle.ambient_sound_mode.is_some() {
            ifaces.push(self.tokens.ambient_sound_mode);
        }
        if handle.equalizer.is_some() {
            ifaces.push(self.tokens.equalizer);
        }
        if handle.auto_power_off.is_some() {
            ifaces.push(self.tokens.auto_power_off);
        }
        if handle.assignable_keys.is_some() {
            ifaces.push(self.tokens.assignable_keys);
        }
        if handle.playback.is_some() {
            ifaces.push(self.tokens.playback);
        }

        let mut cr = self.crossroads.lock().await;
        cr.insert(path, &ifaces, handle);
    }

    /// Unpublishes a device, emitting the matching `InterfacesRemoved`.
    pub(crate) async fn unpublish_device(&self, path: &dbus::Path<'static>) {
        let mut cr = self.crossroads.lock().await;
        let _: Option<Arc<DeviceHandle>> = cr.remove(path);
    }

    /// Emits the `Connected` signal on the Identity interface.
    pub(crate) fn emit_connected(&self, path: &dbus::Path<'static>) {
        self.emit_identity_signal(path, "Connected");
    }

    /// Emits the `Disconnected` signal on the Identity interface.
    pub(crate) fn emit_disconnected(&self, path: &dbus::Path<'static>) {
        self.emit_identity_signal(path, "Disconnected");
    }

    fn emit_identity_signal(&self, path: &dbus::Path<'static>, member: &'static str) {
        match dbus::Message::new_signal(path.clone(), "org.mdr.Identity1", member) {
            Ok(msg) => {
                if self.connection.send(msg).is_err() {
                    log::warn!("failed to emit {member} for {path}");
                }
            }
            Err(err) => log::warn!("failed to build {member} signal for {path}: {err}"),
        }
    }

    /// Emits a `PropertiesChanged` signal for one property on one interface.
    pub fn emit_changed(&self, path: &dbus::Path<'static>, interface: &str, name: &str, value: impl RefArg + 'static) {
        let mut changed = PropMap::new();
        changed.insert(name.to_string(), Variant(Box::new(value) as Box<dyn RefArg>));
        self.emit_changed_many(path, interface, changed);
    }

    /// Emits a `PropertiesChanged` signal covering several properties of one
    /// interface at once.
    pub fn emit_changed_many(&self, path: &dbus::Path<'static>, interface: &str, changed: PropMap) {
        use dbus::nonblock::stdintf::org_freedesktop_dbus::PropertiesPropertiesChanged;
        let ppc = PropertiesPropertiesChanged {
            interface_name: interface.to_string(),
            changed_properties: changed,
            invalidated_properties: Vec::new(),
        };
        if self.connection.send(ppc.to_emit_message(path)).is_err() {
            log::warn!("failed to emit PropertiesChanged for {interface} at {path}");
        }
    }
}
