use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SECTION_CONTROL: &str = "control";
pub const SECTION_STATUS: &str = "status";
pub const SECTION_CONFIG: &str = "config";
pub const SECTION_SESSION: &str = "session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Boolean,
    Number,
    Text,
}

impl ValueKind {
    /// Converts a payload or user value to this kind. Returns `None` when the
    /// value cannot be represented.
    pub fn coerce(self, value: &Value) -> Option<Value> {
        if value.is_null() {
            return Some(Value::Null);
        }
        match self {
            ValueKind::Boolean => match value {
                Value::Bool(b) => Some(Value::Bool(*b)),
                Value::Number(n) => n.as_f64().map(|n| Value::Bool(n != 0.0)),
                Value::String(s) => match s.trim() {
                    "true" | "1" => Some(Value::Bool(true)),
                    "false" | "0" => Some(Value::Bool(false)),
                    _ => None,
                },
                _ => None,
            },
            ValueKind::Number => match value {
                Value::Number(_) => Some(value.clone()),
                Value::Bool(b) => Some(Value::from(u8::from(*b))),
                Value::String(s) => {
                    let s = s.trim();
                    s.parse::<i64>()
                        .map(Value::from)
                        .ok()
                        .or_else(|| s.parse::<f64>().ok().and_then(|f| serde_json::Number::from_f64(f).map(Value::Number)))
                }
                _ => None,
            },
            ValueKind::Text => match value {
                Value::String(_) => Some(value.clone()),
                Value::Bool(_) | Value::Number(_) => Some(Value::String(value.to_string())),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Vendor payload key, also used as the state name.
    pub key: &'static str,
    pub name: &'static str,
    pub kind: ValueKind,
    pub role: &'static str,
    pub unit: Option<&'static str>,
}

const fn field(
    key: &'static str,
    name: &'static str,
    kind: ValueKind,
    role: &'static str,
    unit: Option<&'static str>,
) -> FieldSpec {
    FieldSpec {
        key,
        name,
        kind,
        role,
        unit,
    }
}

use ValueKind::{Boolean, Number, Text};

pub const STATUS_FIELDS: &[FieldSpec] = &[
    field("cableLocked", "Cable lock state", Boolean, "sensor.lock", None),
    field("chargerOpMode", "Charger operation mode", Number, "value", None),
    field("totalPower", "Total power", Number, "value.power", Some("kW")),
    field("sessionEnergy", "Energy of the current session", Number, "value.power.consumption", Some("kWh")),
    field("energyPerHour", "Accumulated energy per hour", Number, "value.power.consumption", Some("kWh")),
    field("wiFiRSSI", "WiFi signal strength", Number, "value", Some("dBm")),
    field("cellRSSI", "Cellular signal strength", Number, "value", Some("dBm")),
    field("chargerFirmware", "Charger firmware version", Number, "info.firmware", None),
    field("latestFirmware", "Latest available firmware version", Number, "info.firmware", None),
    field("reasonForNoCurrent", "Reason for not offering current to the car", Number, "value", None),
    field("voltage", "Voltage", Number, "value.voltage", Some("V")),
    field("outputCurrent", "Output current to the car", Number, "value.current", Some("A")),
    field("outputPhase", "Active output phases", Number, "value", None),
    field("isOnline", "Charger is online", Boolean, "indicator.reachable", None),
    field("wiFiAPEnabled", "WiFi access point enabled", Boolean, "indicator", None),
    field("ledMode", "Charger LED mode", Number, "value", None),
    field("lifetimeEnergy", "Accumulated lifetime energy", Number, "value.power.consumption", Some("kWh")),
    field("inCurrentT2", "Current RMS for input T2", Number, "value.current", Some("A")),
    field("inCurrentT3", "Current RMS for input T3", Number, "value.current", Some("A")),
    field("inCurrentT4", "Current RMS for input T4", Number, "value.current", Some("A")),
    field("inCurrentT5", "Current RMS for input T5", Number, "value.current", Some("A")),
    field("inVoltageT1T2", "Voltage between inputs T1 and T2", Number, "value.voltage", Some("V")),
    field("inVoltageT1T3", "Voltage between inputs T1 and T3", Number, "value.voltage", Some("V")),
    field("inVoltageT1T4", "Voltage between inputs T1 and T4", Number, "value.voltage", Some("V")),
    field("inVoltageT1T5", "Voltage between inputs T1 and T5", Number, "value.voltage", Some("V")),
    field("inVoltageT2T3", "Voltage between inputs T2 and T3", Number, "value.voltage", Some("V")),
    field("inVoltageT2T4", "Voltage between inputs T2 and T4", Number, "value.voltage", Some("V")),
    field("inVoltageT2T5", "Voltage between inputs T2 and T5", Number, "value.voltage", Some("V")),
    field("inVoltageT3T4", "Voltage between inputs T3 and T4", Number, "value.voltage", Some("V")),
    field("inVoltageT3T5", "Voltage between inputs T3 and T5", Number, "value.voltage", Some("V")),
    field("inVoltageT4T5", "Voltage between inputs T4 and T5", Number, "value.voltage", Some("V")),
    field("TempMax", "Maximum temperature of all sensors", Number, "value.temperature.max", Some("°C")),
];

/// Config-section states whose values only ever arrive in the status payload.
pub const STATUS_CONFIG_FIELDS: &[FieldSpec] = &[
    field("dynamicChargerCurrent", "Dynamic max current offered to the car", Number, "level.current", Some("A")),
    field("dynamicCircuitCurrentP1", "Dynamic circuit max current phase 1", Number, "level.current", Some("A")),
    field("dynamicCircuitCurrentP2", "Dynamic circuit max current phase 2", Number, "level.current", Some("A")),
    field("dynamicCircuitCurrentP3", "Dynamic circuit max current phase 3", Number, "level.current", Some("A")),
    field("smartCharging", "Smart charging enabled", Boolean, "switch.enable", None),
];

pub const CONFIG_FIELDS: &[FieldSpec] = &[
    field("isEnabled", "Charger enabled", Boolean, "switch.enable", None),
    field("phaseMode", "Phase mode (1 single, 2 auto, 3 three-phase)", Number, "level", None),
    field("ledStripBrightness", "LED strip brightness", Number, "level.brightness", Some("%")),
    field("smartButtonEnabled", "Smart button enabled", Boolean, "switch.enable", None),
    field("wiFiSSID", "WiFi SSID", Text, "text", None),
    field("maxChargerCurrent", "Max charger current", Number, "level.current", Some("A")),
    field("lockCablePermanently", "Lock cable permanently", Boolean, "switch.lock", None),
    field("circuitMaxCurrentP1", "Circuit max current phase 1", Number, "level.current", Some("A")),
    field("circuitMaxCurrentP2", "Circuit max current phase 2", Number, "level.current", Some("A")),
    field("circuitMaxCurrentP3", "Circuit max current phase 3", Number, "level.current", Some("A")),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChargerCommand {
    Start,
    Stop,
    Pause,
    Resume,
    Reboot,
}

impl ChargerCommand {
    pub const ALL: [ChargerCommand; 5] = [
        ChargerCommand::Start,
        ChargerCommand::Stop,
        ChargerCommand::Pause,
        ChargerCommand::Resume,
        ChargerCommand::Reboot,
    ];

    pub fn from_state_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|command| command.state_name() == name)
    }

    pub fn state_name(self) -> &'static str {
        match self {
            ChargerCommand::Start => "start",
            ChargerCommand::Stop => "stop",
            ChargerCommand::Pause => "pause",
            ChargerCommand::Resume => "resume",
            ChargerCommand::Reboot => "reboot",
        }
    }

    pub fn endpoint(self) -> &'static str {
        match self {
            ChargerCommand::Start => "start_charging",
            ChargerCommand::Stop => "stop_charging",
            ChargerCommand::Pause => "pause_charging",
            ChargerCommand::Resume => "resume_charging",
            ChargerCommand::Reboot => "reboot",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ChargerCommand::Start => "Start charging",
            ChargerCommand::Stop => "Stop charging",
            ChargerCommand::Pause => "Pause charging",
            ChargerCommand::Resume => "Resume charging",
            ChargerCommand::Reboot => "Reboot charger",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    P1,
    P2,
    P3,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::P1, Phase::P2, Phase::P3];

    pub fn index(self) -> usize {
        match self {
            Phase::P1 => 0,
            Phase::P2 => 1,
            Phase::P3 => 2,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Phase::P1 => "P1",
            Phase::P2 => "P2",
            Phase::P3 => "P3",
        }
    }
}

/// Configuration states the user may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigField {
    IsEnabled,
    PhaseMode,
    LedStripBrightness,
    SmartButtonEnabled,
    SmartCharging,
    MaxChargerCurrent,
    DynamicChargerCurrent,
    LockCablePermanently,
    CircuitMaxCurrent(Phase),
    DynamicCircuitCurrent(Phase),
}

impl ConfigField {
    const SIMPLE: [ConfigField; 8] = [
        ConfigField::IsEnabled,
        ConfigField::PhaseMode,
        ConfigField::LedStripBrightness,
        ConfigField::SmartButtonEnabled,
        ConfigField::SmartCharging,
        ConfigField::MaxChargerCurrent,
        ConfigField::DynamicChargerCurrent,
        ConfigField::LockCablePermanently,
    ];

    pub fn from_state_name(name: &str) -> Option<Self> {
        if let Some(field) = Self::SIMPLE.into_iter().find(|f| f.state_name() == name) {
            return Some(field);
        }
        Phase::ALL.into_iter().find_map(|phase| {
            if name == format!("circuitMaxCurrent{}", phase.suffix()) {
                Some(ConfigField::CircuitMaxCurrent(phase))
            } else if name == format!("dynamicCircuitCurrent{}", phase.suffix()) {
                Some(ConfigField::DynamicCircuitCurrent(phase))
            } else {
                None
            }
        })
    }

    pub fn state_name(self) -> String {
        match self {
            ConfigField::IsEnabled => "isEnabled".into(),
            ConfigField::PhaseMode => "phaseMode".into(),
            ConfigField::LedStripBrightness => "ledStripBrightness".into(),
            ConfigField::SmartButtonEnabled => "smartButtonEnabled".into(),
            ConfigField::SmartCharging => "smartCharging".into(),
            ConfigField::MaxChargerCurrent => "maxChargerCurrent".into(),
            ConfigField::DynamicChargerCurrent => "dynamicChargerCurrent".into(),
            ConfigField::LockCablePermanently => "lockCablePermanently".into(),
            ConfigField::CircuitMaxCurrent(phase) => format!("circuitMaxCurrent{}", phase.suffix()),
            ConfigField::DynamicCircuitCurrent(phase) => {
                format!("dynamicCircuitCurrent{}", phase.suffix())
            }
        }
    }

    /// Field name expected by the settings endpoints.
    pub fn upstream_name(self) -> String {
        match self {
            ConfigField::IsEnabled => "enabled".into(),
            ConfigField::CircuitMaxCurrent(phase) => format!("maxCircuitCurrent{}", phase.suffix()),
            other => other.state_name(),
        }
    }

    pub fn kind(self) -> ValueKind {
        match self {
            ConfigField::IsEnabled
            | ConfigField::SmartButtonEnabled
            | ConfigField::SmartCharging
            | ConfigField::LockCablePermanently => ValueKind::Boolean,
            _ => ValueKind::Number,
        }
    }
}

pub fn is_writable_config(key: &str) -> bool {
    ConfigField::from_state_name(key).is_some()
}

/// Push observation ids and the charger-relative state they update.
pub const PUSH_FIELDS: &[(u16, &str)] = &[
    (22, "config.circuitMaxCurrentP1"),
    (23, "config.circuitMaxCurrentP2"),
    (24, "config.circuitMaxCurrentP3"),
    (30, "config.lockCablePermanently"),
    (31, "config.isEnabled"),
    (36, "config.wiFiSSID"),
    (38, "config.phaseMode"),
    (40, "config.ledStripBrightness"),
    (44, "config.smartButtonEnabled"),
    (46, "status.ledMode"),
    (47, "config.maxChargerCurrent"),
    (48, "config.dynamicChargerCurrent"),
    (68, "status.wiFiAPEnabled"),
    (96, "status.reasonForNoCurrent"),
    (102, "config.smartCharging"),
    (103, "status.cableLocked"),
    (109, "status.chargerOpMode"),
    (110, "status.outputPhase"),
    (111, "config.dynamicCircuitCurrentP1"),
    (112, "config.dynamicCircuitCurrentP2"),
    (113, "config.dynamicCircuitCurrentP3"),
    (114, "status.outputCurrent"),
    (120, "status.totalPower"),
    (121, "status.sessionEnergy"),
    (122, "status.energyPerHour"),
    (124, "status.lifetimeEnergy"),
    (132, "status.wiFiRSSI"),
    (182, "status.inCurrentT2"),
    (183, "status.inCurrentT3"),
    (184, "status.inCurrentT4"),
    (185, "status.inCurrentT5"),
    (186, "status.inVoltageT1T2"),
    (187, "status.inVoltageT1T3"),
    (188, "status.inVoltageT1T4"),
    (189, "status.inVoltageT1T5"),
    (190, "status.inVoltageT2T3"),
    (191, "status.inVoltageT2T4"),
    (192, "status.inVoltageT2T5"),
    (193, "status.inVoltageT3T4"),
    (194, "status.inVoltageT3T5"),
    (195, "status.inVoltageT4T5"),
    (197, "status.TempMax"),
];

pub fn push_field_path(observation_id: u16) -> Option<&'static str> {
    PUSH_FIELDS
        .iter()
        .find(|(id, _)| *id == observation_id)
        .map(|(_, path)| *path)
}
