//! The twelve capability surfaces, each instantiating the generic engine in
//! [super] with its own wire shape and client-facing commands.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{watch, Mutex};
use tokio_stream::StreamExt;

use crate::{
    dispatcher::Dispatcher,
    error::{Error, ErrorKind},
    registry::{wire, wire::func, AssignableKey, AssignableKeyInfo, AutoPowerOffTimeout},
    surface::{self, Cache},
};

fn bad_frame(reason: &str) -> Error {
    Error::with_message(ErrorKind::BadFrame(reason.to_string()), "")
}

/// Device identity. Read-only; no notify channel.
pub struct Identity {
    pub cache: Cache<String>,
}

impl Identity {
    pub async fn seed(dispatcher: Arc<Dispatcher>) -> Result<Self, Error> {
        let cache = surface::seed_once(dispatcher, wire::get_key(func::IDENTITY), Vec::new(), |body| {
            Ok(String::from_utf8_lossy(body).into_owned())
        })
        .await?;
        Ok(Self { cache })
    }
}

/// Power control. No cached state; seeding only confirms the device answers.
pub struct Power {
    dispatcher: Arc<Dispatcher>,
}

impl Power {
    pub async fn seed(dispatcher: Arc<Dispatcher>) -> Result<Self, Error> {
        let _: Cache<()> =
            surface::seed_once(dispatcher.clone(), wire::get_key(func::POWER), Vec::new(), |_| Ok(())).await?;
        Ok(Self { dispatcher })
    }

    pub async fn power_off(&self) -> Result<(), Error> {
        self.dispatcher.call(wire::set_key(func::POWER), vec![0x01]).await?;
        Ok(())
    }
}

/// Battery level and charging state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BatteryStatus {
    pub level: u8,
    pub charging: bool,
}

fn decode_battery(body: &[u8]) -> Result<BatteryStatus, Error> {
    if body.len() < 2 {
        return Err(bad_frame("battery reply too short"));
    }
    Ok(BatteryStatus { level: body[0].min(100), charging: body[1] != 0 })
}

pub struct Battery {
    pub cache: Cache<BatteryStatus>,
}

impl Battery {
    pub async fn seed(dispatcher: Arc<Dispatcher>) -> Result<Self, Error> {
        let cache =
            surface::seed(dispatcher, wire::get_key(func::BATTERY), wire::notify_key(func::BATTERY), Vec::new(), decode_battery)
                .await?;
        Ok(Self { cache })
    }
}

/// Left/right earbud battery level and charging state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LrBatteryStatus {
    pub left: BatteryStatus,
    pub right: BatteryStatus,
}

fn decode_lr_battery(body: &[u8]) -> Result<LrBatteryStatus, Error> {
    if body.len() < 4 {
        return Err(bad_frame("left/right battery reply too short"));
    }
    Ok(LrBatteryStatus {
        left: BatteryStatus { level: body[0].min(100), charging: body[1] != 0 },
        right: BatteryStatus { level: body[2].min(100), charging: body[3] != 0 },
    })
}

pub struct LrBattery {
    pub cache: Cache<LrBatteryStatus>,
}

impl LrBattery {
    pub async fn seed(dispatcher: Arc<Dispatcher>) -> Result<Self, Error> {
        let cache = surface::seed(
            dispatcher,
            wire::get_key(func::LR_BATTERY),
            wire::notify_key(func::LR_BATTERY),
            Vec::new(),
            decode_lr_battery,
        )
        .await?;
        Ok(Self { cache })
    }
}

/// Charging cradle battery level and charging state.
pub struct CradleBattery {
    pub cache: Cache<BatteryStatus>,
}

impl CradleBattery {
    pub async fn seed(dispatcher: Arc<Dispatcher>) -> Result<Self, Error> {
        let cache = surface::seed(
            dispatcher,
            wire::get_key(func::CRADLE_BATTERY),
            wire::notify_key(func::CRADLE_BATTERY),
            Vec::new(),
            decode_battery,
        )
        .await?;
        Ok(Self { cache })
    }
}

/// Left/right earbud connection state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LrConnection {
    pub left_connected: bool,
    pub right_connected: bool,
}

fn decode_lr_connection(body: &[u8]) -> Result<LrConnection, Error> {
    if body.len() < 2 {
        return Err(bad_frame("left/right connection reply too short"));
    }
    Ok(LrConnection { left_connected: body[0] != 0, right_connected: body[1] != 0 })
}

pub struct LrConnectionSurface {
    pub cache: Cache<LrConnection>,
}

impl LrConnectionSurface {
    pub async fn seed(dispatcher: Arc<Dispatcher>) -> Result<Self, Error> {
        let cache = surface::seed(
            dispatcher,
            wire::get_key(func::LR_CONNECTION),
            wire::notify_key(func::LR_CONNECTION),
            Vec::new(),
            decode_lr_connection,
        )
        .await?;
        Ok(Self { cache })
    }
}

/// Ambient sound mode's reduction amount and pass-through mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AmbientMode {
    Normal,
    Voice,
}

impl AmbientMode {
    fn to_wire(self) -> u8 {
        match self {
            Self::Normal => 0x00,
            Self::Voice => 0x01,
        }
    }

    fn from_wire(byte: u8) -> Self {
        if byte == 0x01 {
            Self::Voice
        } else {
            Self::Normal
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Voice => "voice",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "normal" => Some(Self::Normal),
            "voice" => Some(Self::Voice),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct CombinedState {
    nc_enabled: bool,
    asm_amount: u8,
    asm_voice: bool,
}

fn decode_combined(body: &[u8]) -> Result<CombinedState, Error> {
    if body.len() < 3 {
        return Err(bad_frame("combined noise-cancelling/ambient-sound reply too short"));
    }
    Ok(CombinedState { nc_enabled: body[0] != 0, asm_amount: body[1], asm_voice: body[2] != 0 })
}

fn encode_combined(state: CombinedState) -> Vec<u8> {
    vec![state.nc_enabled as u8, state.asm_amount, state.asm_voice as u8]
}

/// Shared translator for devices that expose noise cancelling and ambient
/// sound mode under one wire opcode.
/// Enabling either implicitly disables the other.
#[derive(Clone)]
struct NcAsmLink {
    dispatcher: Arc<Dispatcher>,
    state: Arc<Mutex<CombinedState>>,
}

impl NcAsmLink {
    async fn set_nc(&self, enabled: bool) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.nc_enabled = enabled;
        if enabled {
            state.asm_amount = 0;
        }
        let payload = encode_combined(*state);
        drop(state);
        self.dispatcher.call(wire::set_key(func::NC_AND_ASM), payload).await?;
        Ok(())
    }

    async fn set_asm(&self, amount: u8, voice: bool) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.asm_amount = amount;
        state.asm_voice = voice;
        state.nc_enabled = false;
        let payload = encode_combined(*state);
        drop(state);
        self.dispatcher.call(wire::set_key(func::NC_AND_ASM), payload).await?;
        Ok(())
    }
}

/// Noise cancelling, split-opcode variant.
pub struct NoiseCancelling {
    dispatcher: Arc<Dispatcher>,
    combined: Option<NcAsmLink>,
    pub cache: Cache<bool>,
}

impl NoiseCancelling {
    pub async fn enable(&self) -> Result<(), Error> {
        self.set(true).await
    }

    pub async fn disable(&self) -> Result<(), Error> {
        self.set(false).await
    }

    async fn set(&self, enabled: bool) -> Result<(), Error> {
        match &self.combined {
            Some(link) => link.set_nc(enabled).await,
            None => {
                self.dispatcher.call(wire::set_key(func::NOISE_CANCELLING), vec![enabled as u8]).await?;
                Ok(())
            }
        }
    }
}

/// Ambient sound mode, split-opcode variant.
pub struct AmbientSoundMode {
    dispatcher: Arc<Dispatcher>,
    combined: Option<NcAsmLink>,
    pub cache: Cache<(u8, AmbientMode)>,
}

impl AmbientSoundMode {
    pub async fn set_amount(&self, amount: u32) -> Result<(), Error> {
        let amount = amount.min(u8::MAX as u32) as u8;
        let mode = self.cache.get().1;
        self.apply(amount, mode).await
    }

    pub async fn set_mode(&self, name: &str) -> Result<(), Error> {
        let mode = AmbientMode::from_name(name).ok_or_else(|| Error::new(ErrorKind::InvalidValue))?;
        let amount = self.cache.get().0;
        self.apply(amount, mode).await
    }

    async fn apply(&self, amount: u8, mode: AmbientMode) -> Result<(), Error> {
        match &self.combined {
            Some(link) => link.set_asm(amount, matches!(mode, AmbientMode::Voice)).await,
            None => {
                self.dispatcher
                    .call(wire::set_key(func::AMBIENT_SOUND_MODE), vec![amount, mode.to_wire()])
                    .await?;
                Ok(())
            }
        }
    }
}

/// Seeds noise cancelling and ambient sound mode jointly, sharing one
/// subscription to the combined opcode's notify channel and fanning its
/// decoded state out into two independently observable caches.
pub async fn seed_combined_nc_asm(
    dispatcher: Arc<Dispatcher>,
) -> Result<(NoiseCancelling, AmbientSoundMode), Error> {
    let reply = dispatcher.call(wire::get_key(func::NC_AND_ASM), Vec::new()).await?;
    let initial = decode_combined(&reply)?;

    let link =
        NcAsmLink { dispatcher: dispatcher.clone(), state: Arc::new(Mutex::new(initial)) };

    let (nc_tx, nc_rx) = watch::channel(initial.nc_enabled);
    let (asm_tx, asm_rx) = watch::channel((initial.asm_amount, AmbientMode::from_wire(initial.asm_voice as u8)));

    let mut notifications = dispatcher.subscribe(wire::notify_key(func::NC_AND_ASM)).await;
    tokio::spawn(async move {
        while let Some(body) = notifications.next().await {
            match decode_combined(&body) {
                Ok(state) => {
                    let nc_alive = nc_tx.send(state.nc_enabled).is_ok();
                    let asm_alive =
                        asm_tx.send((state.asm_amount, AmbientMode::from_wire(state.asm_voice as u8))).is_ok();
                    if !nc_alive && !asm_alive {
                        break;
                    }
                }
                Err(err) => log::warn!("dropping unparsable combined nc/asm notification: {err}"),
            }
        }
    });

    Ok((
        NoiseCancelling { dispatcher: dispatcher.clone(), combined: Some(link.clone()), cache: Cache::from_receiver(nc_rx) },
        AmbientSoundMode { dispatcher, combined: Some(link), cache: Cache::from_receiver(asm_rx) },
    ))
}

/// Seeds noise cancelling alone (split-opcode devices with no ambient
/// sound mode support).
pub async fn seed_noise_cancelling(dispatcher: Arc<Dispatcher>) -> Result<NoiseCancelling, Error> {
    let cache = surface::seed(
        dispatcher.clone(),
        wire::get_key(func::NOISE_CANCELLING),
        wire::notify_key(func::NOISE_CANCELLING),
        Vec::new(),
        |body| body.first().copied().map(|b| b != 0).ok_or_else(|| bad_frame("noise cancelling reply empty")),
    )
    .await?;
    Ok(NoiseCancelling { dispatcher, combined: None, cache })
}

/// Seeds ambient sound mode alone (split-opcode devices with no noise
/// cancelling support).
pub async fn seed_ambient_sound_mode(dispatcher: Arc<Dispatcher>) -> Result<AmbientSoundMode, Error> {
    let cache = surface::seed(
        dispatcher.clone(),
        wire::get_key(func::AMBIENT_SOUND_MODE),
        wire::notify_key(func::AMBIENT_SOUND_MODE),
        Vec::new(),
        |body| {
            if body.len() < 2 {
                return Err(bad_frame("ambient sound mode reply too short"));
            }
            Ok((body[0], AmbientMode::from_wire(body[1])))
        },
    )
    .await?;
    Ok(AmbientSoundMode { dispatcher, combined: None, cache })
}

const EQ_PRESET_NAMES: &[&str] = &[
    "Off",
    "Rock",
    "Pop",
    "Jazz",
    "Dance",
    "EDM",
    "R&B/Hip-Hop",
    "Acoustic",
    "Bright",
    "Excited",
    "Mellow",
    "Relaxed",
    "Vocal",
    "Treble",
    "Bass",
    "Speech",
    "Custom",
    "User Setting 1",
    "User Setting 2",
    "User Setting 3",
    "User Setting 4",
    "User Setting 5",
    "Unspecified",
];

/// Maps a wire preset id to its human name, `"<Unknown>"` if out of range
///.
pub fn eq_preset_name(id: u8) -> &'static str {
    EQ_PRESET_NAMES.get(id as usize).copied().unwrap_or("<Unknown>")
}

/// Maps a human preset name back to its wire id. `"<Unknown>"` never
/// resolves: it is read-only.
pub fn eq_preset_id(name: &str) -> Option<u8> {
    EQ_PRESET_NAMES.iter().position(|&n| n == name).map(|i| i as u8)
}

#[derive(Clone, Debug, Default)]
pub struct EqualizerState {
    pub preset: u8,
    pub levels: Vec<i8>,
}

fn decode_equalizer(body: &[u8]) -> Result<EqualizerState, Error> {
    if body.is_empty() {
        return Err(bad_frame("equalizer reply empty"));
    }
    Ok(EqualizerState { preset: body[0], levels: body[1..].iter().map(|&b| b as i8).collect() })
}

pub struct Equalizer {
    dispatcher: Arc<Dispatcher>,
    pub band_count: u8,
    pub level_steps: u8,
    pub available_presets: Vec<u8>,
    pub cache: Cache<EqualizerState>,
}

impl Equalizer {
    pub async fn seed(
        dispatcher: Arc<Dispatcher>, band_count: u8, level_steps: u8, available_presets: Vec<u8>,
    ) -> Result<Self, Error> {
        let cache = surface::seed(
            dispatcher.clone(),
            wire::get_key(func::EQUALIZER),
            wire::notify_key(func::EQUALIZER),
            Vec::new(),
            decode_equalizer,
        )
        .await?;
        Ok(Self { dispatcher, band_count, level_steps, available_presets, cache })
    }

    /// `SetPreset(name)` — `InvalidValue` on an unknown or unadvertised preset.
    pub async fn set_preset(&self, name: &str) -> Result<(), Error> {
        let id = eq_preset_id(name)
            .filter(|id| self.available_presets.contains(id))
            .ok_or_else(|| Error::new(ErrorKind::InvalidValue))?;
        self.dispatcher.call(wire::set_key(func::EQUALIZER), vec![0x01, id]).await?;
        Ok(())
    }

    /// `SetLevels(levels)` — `InvalidValue` on a wrong band count or a level
    /// outside the device's half-range, checked before any wire traffic.
    /// Levels mirror the signed representation [EqualizerState::levels] is
    /// read back in.
    pub async fn set_levels(&self, levels: &[i8]) -> Result<(), Error> {
        if levels.len() != self.band_count as usize {
            return Err(Error::new(ErrorKind::InvalidValue));
        }
        let half_range = (self.level_steps as i16) / 2;
        if levels.iter().any(|&l| (l as i16).abs() > half_range) {
            return Err(Error::new(ErrorKind::InvalidValue));
        }
        let mut payload = vec![0x02];
        payload.extend(levels.iter().map(|&l| l as u8));
        self.dispatcher.call(wire::set_key(func::EQUALIZER), payload).await?;
        Ok(())
    }
}

pub struct AutoPowerOff {
    dispatcher: Arc<Dispatcher>,
    available: Vec<AutoPowerOffTimeout>,
    pub cache: Cache<AutoPowerOffTimeout>,
}

impl AutoPowerOff {
    pub async fn seed(dispatcher: Arc<Dispatcher>, available: Vec<AutoPowerOffTimeout>) -> Result<Self, Error> {
        let cache = surface::seed(
            dispatcher.clone(),
            wire::get_key(func::AUTO_POWER_OFF),
            wire::notify_key(func::AUTO_POWER_OFF),
            Vec::new(),
            |body| {
                body.first()
                    .copied()
                    .map(AutoPowerOffTimeout::from_wire)
                    .ok_or_else(|| bad_frame("auto power off reply empty"))
            },
        )
        .await?;
        Ok(Self { dispatcher, available, cache })
    }

    /// `SetTimeout(name)` — `InvalidValue` on an unrecognised or unadvertised timeout.
    pub async fn set_timeout(&self, name: &str) -> Result<(), Error> {
        let timeout = AutoPowerOffTimeout::from_name(name).ok_or_else(|| Error::new(ErrorKind::InvalidValue))?;
        if !self.available.contains(&timeout) {
            return Err(Error::new(ErrorKind::InvalidValue));
        }
        let byte = timeout.to_wire().ok_or_else(|| Error::new(ErrorKind::InvalidValue))?;
        self.dispatcher.call(wire::set_key(func::AUTO_POWER_OFF), vec![byte]).await?;
        Ok(())
    }
}

fn decode_current_presets(body: &[u8]) -> Result<HashMap<AssignableKey, u8>, Error> {
    let mut out = HashMap::new();
    let mut i = 0;
    while i + 1 < body.len() {
        out.insert(AssignableKey(body[i]), body[i + 1]);
        i += 2;
    }
    Ok(out)
}

pub struct AssignableKeys {
    dispatcher: Arc<Dispatcher>,
    pub available_presets: HashMap<AssignableKey, AssignableKeyInfo>,
    pub cache: Cache<HashMap<AssignableKey, u8>>,
}

impl AssignableKeys {
    pub async fn seed(
        dispatcher: Arc<Dispatcher>, available_presets: HashMap<AssignableKey, AssignableKeyInfo>,
    ) -> Result<Self, Error> {
        let cache = surface::seed(
            dispatcher.clone(),
            wire::get_key(func::ASSIGNABLE_KEYS),
            wire::notify_key(func::ASSIGNABLE_KEYS),
            Vec::new(),
            decode_current_presets,
        )
        .await?;
        Ok(Self { dispatcher, available_presets, cache })
    }

    /// `SetPresets(map)` — `InvalidValue` on a missing key or a preset not
    /// advertised for that key, checked before any wire traffic.
    pub async fn set_presets(&self, wanted: &HashMap<AssignableKey, u8>) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(wanted.len() * 2);
        for (key, preset) in wanted {
            let info = self.available_presets.get(key).ok_or_else(|| Error::new(ErrorKind::InvalidValue))?;
            if !info.presets.iter().any(|p| p.preset == *preset) {
                return Err(Error::new(ErrorKind::InvalidValue));
            }
            payload.push(key.0);
            payload.push(*preset);
        }
        self.dispatcher.call(wire::set_key(func::ASSIGNABLE_KEYS), payload).await?;
        Ok(())
    }
}

pub struct Playback {
    dispatcher: Arc<Dispatcher>,
    pub cache: Cache<u8>,
}

impl Playback {
    pub async fn seed(dispatcher: Arc<Dispatcher>) -> Result<Self, Error> {
        let cache = surface::seed(
            dispatcher.clone(),
            wire::get_key(func::PLAYBACK_VOLUME),
            wire::notify_key(func::PLAYBACK_VOLUME),
            Vec::new(),
            |body| body.first().copied().ok_or_else(|| bad_frame("volume reply empty")),
        )
        .await?;
        Ok(Self { dispatcher, cache })
    }

    /// `SetVolume(u)` — `InvalidValue` if the value does not fit a byte.
    pub async fn set_volume(&self, volume: u32) -> Result<(), Error> {
        let volume: u8 = volume.try_into().map_err(|_| Error::new(ErrorKind::InvalidValue))?;
        self.dispatcher.call(wire::set_key(func::PLAYBACK_VOLUME), vec![volume]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eq_preset_names_round_trip() {
        for (id, name) in EQ_PRESET_NAMES.iter().enumerate() {
            assert_eq!(eq_preset_name(id as u8), *name);
            assert_eq!(eq_preset_id(name), Some(id as u8));
        }
    }

    #[test]
    fn unknown_eq_preset_id_is_read_only() {
        assert_eq!(eq_preset_name(0xFE), "<Unknown>");
        assert_eq!(eq_preset_id("<Unknown>"), None);
    }

    #[test]
    fn decodes_lr_battery() {
        let status = decode_lr_battery(&[80, 1, 60, 0]).unwrap();
        assert_eq!(status.left, BatteryStatus { level: 80, charging: true });
        assert_eq!(status.right, BatteryStatus { level: 60, charging: false });
    }

    #[test]
    fn battery_level_clamped_to_100() {
        let status = decode_battery(&[255, 0]).unwrap();
        assert_eq!(status.level, 100);
    }

    #[test]
    fn combined_enabling_nc_clears_asm_amount() {
        let mut state = CombinedState { nc_enabled: false, asm_amount: 40, asm_voice: false };
        state.nc_enabled = true;
        state.asm_amount = 0;
        assert_eq!(encode_combined(state), vec![1, 0, 0]);
    }
}
