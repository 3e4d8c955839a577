//! Capability registry: handshake discovery of a device's supported feature
//! set and the ancillary parameters each surface needs to seed itself.

use std::collections::{HashMap, HashSet};

use crate::{
    dispatcher::Dispatcher,
    error::{Error, ErrorKind},
};

/// Wire opcodes used during handshake, capability discovery, and by every
/// capability surface's get/set/notify traffic.
///
/// This daemon's own concrete numbering: the upstream MDR opcode catalogue
/// was not part of the retained source material, so these constants are this
/// codebase's own assignment (see DESIGN.md). What matters for correctness is
/// only that get/set/notify keys for the same function share an inquiry type
/// and that notify keys live in a distinct opcode family.
pub mod wire {
    use crate::dispatcher::Key;

    pub const INIT: Key = Key::new(0x00, 0x00);
    pub const GET_PROTOCOL_INFO: Key = Key::new(0x01, 0x00);
    pub const GET_CAPABILITY_INFO: Key = Key::new(0x02, 0x00);

    /// Function codes: both a supported-capability bit and the inquiry type
    /// shared by a capability's get/set/notify keys.
    pub mod func {
        pub const IDENTITY: u8 = 0x01;
        pub const POWER: u8 = 0x02;
        pub const BATTERY: u8 = 0x03;
        pub const LR_BATTERY: u8 = 0x04;
        pub const CRADLE_BATTERY: u8 = 0x05;
        pub const LR_CONNECTION: u8 = 0x06;
        pub const NOISE_CANCELLING: u8 = 0x07;
        pub const AMBIENT_SOUND_MODE: u8 = 0x08;
        pub const NC_AND_ASM: u8 = 0x09;
        pub const EQUALIZER: u8 = 0x0A;
        pub const AUTO_POWER_OFF: u8 = 0x0B;
        pub const ASSIGNABLE_KEYS: u8 = 0x0C;
        pub const PLAYBACK_VOLUME: u8 = 0x0D;
    }

    const GET: u8 = 0x20;
    const SET: u8 = 0x21;
    const NOTIFY: u8 = 0x22;
    const INFO: u8 = 0x23;

    /// Key for "get the current value" of `func`.
    pub const fn get_key(func: u8) -> Key {
        Key::new(GET, func)
    }

    /// Key for "set a new value" of `func`.
    pub const fn set_key(func: u8) -> Key {
        Key::new(SET, func)
    }

    /// Key a device pushes unsolicited updates for `func` on.
    pub const fn notify_key(func: u8) -> Key {
        Key::new(NOTIFY, func)
    }

    /// Key for "describe the parameters of" `func` (EQ band count, available
    /// auto-power-off timeouts, assignable key presets, ...), queried once
    /// during handshake.
    pub const fn info_key(func: u8) -> Key {
        Key::new(INFO, func)
    }
}

/// An auto-power-off timeout setting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AutoPowerOffTimeout {
    Off,
    FiveMin,
    ThirtyMin,
    SixtyMin,
    OneEightyMin,
    Unknown(u8),
}

impl AutoPowerOffTimeout {
    pub fn from_wire(byte: u8) -> Self {
        match byte {
            0x00 => Self::Off,
            0x01 => Self::FiveMin,
            0x02 => Self::ThirtyMin,
            0x03 => Self::SixtyMin,
            0x04 => Self::OneEightyMin,
            other => Self::Unknown(other),
        }
    }

    pub fn to_wire(self) -> Option<u8> {
        match self {
            Self::Off => Some(0x00),
            Self::FiveMin => Some(0x01),
            Self::ThirtyMin => Some(0x02),
            Self::SixtyMin => Some(0x03),
            Self::OneEightyMin => Some(0x04),
            Self::Unknown(_) => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Off => "Off",
            Self::FiveMin => "5 min",
            Self::ThirtyMin => "30 min",
            Self::SixtyMin => "60 min",
            Self::OneEightyMin => "180 min",
            Self::Unknown(_) => "<Unknown>",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Off" => Some(Self::Off),
            "5 min" => Some(Self::FiveMin),
            "30 min" => Some(Self::ThirtyMin),
            "60 min" => Some(Self::SixtyMin),
            "180 min" => Some(Self::OneEightyMin),
            _ => None,
        }
    }
}

/// An assignable physical key (e.g. a headphone's single multi-function
/// button, or a left/right pair). Modelled as an opaque device-defined id:
/// the wire protocol does not name keys, only numbers them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AssignableKey(pub u8);

/// An action a key can be bound to within a preset (single press, double
/// press, press-and-hold, ...), as the device numbers it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AssignableAction(pub u8);

/// One preset a key can be set to: its id plus the action→function bindings
/// it assigns.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AssignablePreset {
    pub preset: u8,
    pub bindings: HashMap<AssignableAction, u8>,
}

/// Everything a device reports about one assignable key: its type, the
/// preset it defaults to, and the presets it can be switched between.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AssignableKeyInfo {
    pub key_type: u8,
    pub default_preset: u8,
    pub presets: Vec<AssignablePreset>,
}

/// Result of the handshake: the device's supported function set plus every
/// ancillary parameter a surface needs to seed itself. Immutable once handshake completes.
#[derive(Clone, Debug, Default)]
pub struct CapabilitySet {
    pub identity: bool,
    pub power: bool,
    pub battery: bool,
    pub lr_battery: bool,
    pub cradle_battery: bool,
    pub lr_connection: bool,
    pub noise_cancelling: bool,
    pub ambient_sound_mode: bool,
    pub equalizer: bool,
    pub auto_power_off: bool,
    pub assignable_keys: bool,
    pub playback_volume: bool,

    /// Whether noise cancelling and ambient sound mode share one wire opcode
    /// on this device.
    pub nc_and_asm_combined: bool,

    pub eq_band_count: u8,
    pub eq_level_steps: u8,
    /// Numeric preset ids this device advertises, in device-reported order.
    pub eq_presets: Vec<u8>,

    pub auto_power_off_timeouts: Vec<AutoPowerOffTimeout>,

    /// Type, default preset, and available presets per assignable key.
    pub assignable_key_presets: HashMap<AssignableKey, AssignableKeyInfo>,
}

/// Runs the handshake (`INIT` → `GET_PROTOCOL_INFO` → `GET_CAPABILITY_INFO`)
/// and the ancillary parameter queries it unlocks, producing a fully
/// populated [CapabilitySet].
pub async fn discover(dispatcher: &Dispatcher) -> Result<CapabilitySet, Error> {
    dispatcher.call(wire::INIT, Vec::new()).await?;

    let protocol_info = dispatcher.call(wire::GET_PROTOCOL_INFO, Vec::new()).await?;
    log::debug!("peer protocol info: {} bytes", protocol_info.len());

    let capability_info = dispatcher.call(wire::GET_CAPABILITY_INFO, Vec::new()).await?;
    let supported: HashSet<u8> = capability_info.iter().copied().collect();

    let mut set = CapabilitySet {
        identity: true,
        power: supported.contains(&wire::func::POWER),
        battery: supported.contains(&wire::func::BATTERY),
        lr_battery: supported.contains(&wire::func::LR_BATTERY),
        cradle_battery: supported.contains(&wire::func::CRADLE_BATTERY),
        lr_connection: supported.contains(&wire::func::LR_CONNECTION),
        equalizer: supported.contains(&wire::func::EQUALIZER),
        auto_power_off: supported.contains(&wire::func::AUTO_POWER_OFF),
        assignable_keys: supported.contains(&wire::func::ASSIGNABLE_KEYS),
        playback_volume: supported.contains(&wire::func::PLAYBACK_VOLUME),
        nc_and_asm_combined: supported.contains(&wire::func::NC_AND_ASM),
        ..Default::default()
    };
    set.noise_cancelling = set.nc_and_asm_combined || supported.contains(&wire::func::NOISE_CANCELLING);
    set.ambient_sound_mode = set.nc_and_asm_combined || supported.contains(&wire::func::AMBIENT_SOUND_MODE);

    if set.equalizer {
        let info = dispatcher.call(wire::info_key(wire::func::EQUALIZER), Vec::new()).await?;
        let (band_count, level_steps, presets) = parse_equalizer_info(&info)?;
        set.eq_band_count = band_count;
        set.eq_level_steps = level_steps;
        set.eq_presets = presets;
    }

    if set.auto_power_off {
        let info = dispatcher.call(wire::info_key(wire::func::AUTO_POWER_OFF), Vec::new()).await?;
        set.auto_power_off_timeouts = info.iter().copied().map(AutoPowerOffTimeout::from_wire).collect();
    }

    if set.assignable_keys {
        let info = dispatcher.call(wire::info_key(wire::func::ASSIGNABLE_KEYS), Vec::new()).await?;
        set.assignable_key_presets = parse_assignable_key_info(&info)?;
    }

    Ok(set)
}

/// Parses an `EQUALIZER` info reply: `band_count(1) | level_steps(1) | preset_ids...`.
fn parse_equalizer_info(body: &[u8]) -> Result<(u8, u8, Vec<u8>), Error> {
    if body.len() < 2 {
        return Err(Error::with_message(
            ErrorKind::Internal(crate::error::InternalErrorKind::PayloadTooLarge(0)),
            "equalizer info reply too short",
        ));
    }
    Ok((body[0], body[1], body[2..].to_vec()))
}

/// Parses an `ASSIGNABLE_KEYS` info reply: a sequence of
/// `key_id(1) key_type(1) default_preset(1) preset_count(1)
/// [preset_id(1) action_count(1) [action_id(1) function_id(1)]...]...` records.
fn parse_assignable_key_info(body: &[u8]) -> Result<HashMap<AssignableKey, AssignableKeyInfo>, Error> {
    fn truncated() -> Error {
        Error::with_message(ErrorKind::BadFrame("truncated assignable-key info".to_string()), "")
    }

    let mut out = HashMap::new();
    let mut i = 0;
    while i < body.len() {
        if i + 3 >= body.len() {
            return Err(truncated());
        }
        let key = AssignableKey(body[i]);
        let key_type = body[i + 1];
        let default_preset = body[i + 2];
        let preset_count = body[i + 3] as usize;
        i += 4;

        let mut presets = Vec::with_capacity(preset_count);
        for _ in 0..preset_count {
            if i + 1 >= body.len() {
                return Err(truncated());
            }
            let preset = body[i];
            let action_count = body[i + 1] as usize;
            i += 2;

            let mut bindings = HashMap::with_capacity(action_count);
            for _ in 0..action_count {
                if i + 1 >= body.len() {
                    return Err(truncated());
                }
                bindings.insert(AssignableAction(body[i]), body[i + 1]);
                i += 2;
            }
            presets.push(AssignablePreset { preset, bindings });
        }

        out.insert(key, AssignableKeyInfo { key_type, default_preset, presets });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_power_off_round_trips_known_values() {
        for (byte, name) in [
            (0x00, "Off"),
            (0x01, "5 min"),
            (0x02, "30 min"),
            (0x03, "60 min"),
            (0x04, "180 min"),
        ] {
            let t = AutoPowerOffTimeout::from_wire(byte);
            assert_eq!(t.name(), name);
            assert_eq!(AutoPowerOffTimeout::from_name(name), Some(t));
            assert_eq!(t.to_wire(), Some(byte));
        }
    }

    #[test]
    fn unknown_auto_power_off_is_read_only() {
        let t = AutoPowerOffTimeout::from_wire(0xFE);
        assert_eq!(t.name(), "<Unknown>");
        assert_eq!(t.to_wire(), None);
        assert_eq!(AutoPowerOffTimeout::from_name("<Unknown>"), None);
    }

    #[test]
    fn parses_equalizer_info() {
        let body = vec![5, 21, 0x00, 0x01, 0xFF];
        let (bands, steps, presets) = parse_equalizer_info(&body).unwrap();
        assert_eq!(bands, 5);
        assert_eq!(steps, 21);
        assert_eq!(presets, vec![0x00, 0x01, 0xFF]);
    }

    #[test]
    fn parses_assignable_key_info_with_multiple_keys() {
        let body = vec![0x01, 0x00, 0x10, 1, 0x10, 1, 0x01, 0x30, 0x02, 0x01, 0x20, 0];
        let parsed = parse_assignable_key_info(&body).unwrap();

        let a = parsed.get(&AssignableKey(0x01)).unwrap();
        assert_eq!(a.key_type, 0x00);
        assert_eq!(a.default_preset, 0x10);
        assert_eq!(a.presets.len(), 1);
        assert_eq!(a.presets[0].preset, 0x10);
        assert_eq!(a.presets[0].bindings.get(&AssignableAction(0x01)), Some(&0x30));

        let b = parsed.get(&AssignableKey(0x02)).unwrap();
        assert_eq!(b.key_type, 0x01);
        assert_eq!(b.default_preset, 0x20);
        assert!(b.presets.is_empty());
    }

    #[test]
    fn rejects_truncated_assignable_key_info() {
        let body = vec![0x01, 0x00, 0x10, 1, 0x10];
        assert!(parse_assignable_key_info(&body).is_err());
    }
}
