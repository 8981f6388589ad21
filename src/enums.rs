//! Victron enumerations
//!
//! Device types and the value enums referenced by the topic table. The codes
//! mirror what Venus OS publishes on the wire; the labels are what callers
//! see in formatted values and enum pick lists.

use std::fmt;

/// Type of Victron device, as encoded in the topic's device-type segment.
///
/// `from_code` accepts the raw segment and applies the alias mapping some
/// firmware versions use (`platform`, `CGwacs`, `Relay` and `DynamicEss`
/// topics all belong to the system device).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    System,
    SolarCharger,
    Inverter,
    Battery,
    Grid,
    VeBus,
    EvCharger,
    PvInverter,
    Temperature,
    Generator,
    Tank,
    MultiRsSolar,
    DcLoad,
    DcSystem,
    Alternator,
    Switch,
    Gps,
    DigitalInput,
    HeatPump,
    AcLoad,
    Unknown,
}

impl DeviceType {
    /// Map a raw topic segment to a device type, applying alias mapping.
    pub fn from_code(code: &str) -> DeviceType {
        match code {
            "system" | "platform" | "CGwacs" | "Relay" | "DynamicEss" => DeviceType::System,
            "solarcharger" => DeviceType::SolarCharger,
            "inverter" => DeviceType::Inverter,
            "battery" => DeviceType::Battery,
            "grid" => DeviceType::Grid,
            "vebus" => DeviceType::VeBus,
            "evcharger" => DeviceType::EvCharger,
            "pvinverter" => DeviceType::PvInverter,
            "temperature" => DeviceType::Temperature,
            "generator" => DeviceType::Generator,
            "tank" => DeviceType::Tank,
            "multi" => DeviceType::MultiRsSolar,
            "dcload" => DeviceType::DcLoad,
            "dcsystem" => DeviceType::DcSystem,
            "alternator" => DeviceType::Alternator,
            "switch" => DeviceType::Switch,
            "gps" => DeviceType::Gps,
            "digitalinput" => DeviceType::DigitalInput,
            "heatpump" => DeviceType::HeatPump,
            "acload" => DeviceType::AcLoad,
            _ => DeviceType::Unknown,
        }
    }

    /// The canonical topic segment for this device type.
    pub fn code(&self) -> &'static str {
        match self {
            DeviceType::System => "system",
            DeviceType::SolarCharger => "solarcharger",
            DeviceType::Inverter => "inverter",
            DeviceType::Battery => "battery",
            DeviceType::Grid => "grid",
            DeviceType::VeBus => "vebus",
            DeviceType::EvCharger => "evcharger",
            DeviceType::PvInverter => "pvinverter",
            DeviceType::Temperature => "temperature",
            DeviceType::Generator => "generator",
            DeviceType::Tank => "tank",
            DeviceType::MultiRsSolar => "multi",
            DeviceType::DcLoad => "dcload",
            DeviceType::DcSystem => "dcsystem",
            DeviceType::Alternator => "alternator",
            DeviceType::Switch => "switch",
            DeviceType::Gps => "gps",
            DeviceType::DigitalInput => "digitalinput",
            DeviceType::HeatPump => "heatpump",
            DeviceType::AcLoad => "acload",
            DeviceType::Unknown => "unknown",
        }
    }

    /// Human-readable display string.
    pub fn label(&self) -> &'static str {
        match self {
            DeviceType::System => "System",
            DeviceType::SolarCharger => "Solar Charger",
            DeviceType::Inverter => "Inverter",
            DeviceType::Battery => "Battery",
            DeviceType::Grid => "Grid",
            DeviceType::VeBus => "VE.Bus",
            DeviceType::EvCharger => "EV Charging Station",
            DeviceType::PvInverter => "PV Inverter",
            DeviceType::Temperature => "Temperature",
            DeviceType::Generator => "Generator",
            DeviceType::Tank => "Liquid Tank",
            DeviceType::MultiRsSolar => "Multi RS Solar",
            DeviceType::DcLoad => "DC Load",
            DeviceType::DcSystem => "DC System",
            DeviceType::Alternator => "Charger (Orion/Alternator)",
            DeviceType::Switch => "Switch",
            DeviceType::Gps => "Gps",
            DeviceType::DigitalInput => "Digital Input",
            DeviceType::HeatPump => "Heat Pump",
            DeviceType::AcLoad => "AC Load",
            DeviceType::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single member of a wire enum: numeric code plus display label.
#[derive(Debug, PartialEq, Eq)]
pub struct EnumMember {
    pub code: i64,
    pub label: &'static str,
}

/// A wire enum definition, referenced by topic descriptors.
///
/// For bitmask value types the member codes are bit values and a decoded
/// payload is the joined labels of all set bits.
#[derive(Debug, PartialEq, Eq)]
pub struct EnumDef {
    pub name: &'static str,
    pub members: &'static [EnumMember],
}

impl EnumDef {
    /// Look up a member by its wire code.
    pub fn member_by_code(&self, code: i64) -> Option<&'static EnumMember> {
        self.members.iter().find(|m| m.code == code)
    }

    /// Look up a member by its display label.
    pub fn member_by_label(&self, label: &str) -> Option<&'static EnumMember> {
        self.members.iter().find(|m| m.label == label)
    }

    /// All display labels, in declaration order.
    pub fn labels(&self) -> Vec<&'static str> {
        self.members.iter().map(|m| m.label).collect()
    }
}

macro_rules! enum_def {
    ($ident:ident, $name:literal, [$(($code:literal, $label:literal)),+ $(,)?]) => {
        pub static $ident: EnumDef = EnumDef {
            name: $name,
            members: &[$(EnumMember { code: $code, label: $label }),+],
        };
    };
}

enum_def!(GENERIC_ON_OFF, "GenericOnOff", [(0, "Off"), (1, "On")]);

enum_def!(
    GENERIC_ALARM,
    "GenericAlarm",
    [(0, "No Alarm"), (1, "Warning"), (2, "Alarm")]
);

enum_def!(
    SYSTEM_STATE,
    "SystemState",
    [
        (0, "Off"),
        (1, "Low Power"),
        (2, "Fault"),
        (3, "Bulk"),
        (4, "Absorption"),
        (5, "Float"),
        (6, "Storage"),
        (7, "Equalize"),
        (8, "Passthrough"),
        (9, "Inverting"),
        (10, "Power Assist"),
        (11, "Power Supply"),
        (244, "Sustain"),
        (245, "Starting Up"),
        (246, "Repeated Absorption"),
        (247, "Auto Equalize / Recondition"),
        (248, "Battery Safe"),
        (252, "External Control"),
        (256, "Discharging"),
        (258, "Recharging"),
        (259, "Scheduled Recharging"),
    ]
);

enum_def!(
    INVERTER_MODE,
    "InverterMode",
    [
        (1, "Charger Only"),
        (2, "Inverter Only"),
        (3, "On"),
        (4, "Off"),
    ]
);

enum_def!(
    EV_CHARGER_MODE,
    "EvChargerMode",
    [(0, "Manual"), (1, "Auto"), (2, "Scheduled Charge")]
);

enum_def!(
    MPP_OPERATION_MODE,
    "MppOperationMode",
    [
        (0, "Off"),
        (1, "Voltage/current limited"),
        (2, "MPPT active"),
        (255, "Not available"),
    ]
);

enum_def!(
    FLUID_TYPE,
    "FluidType",
    [
        (0, "Fuel"),
        (1, "Fresh Water"),
        (2, "Waste Water"),
        (3, "Live Well"),
        (4, "Oil"),
        (5, "Black water (sewage)"),
        (6, "Gasoline"),
        (7, "Diesel"),
        (8, "Liquid Petroleum Gas (LPG)"),
        (9, "Liquid Natural Gas (LNG)"),
        (10, "Hydraulic oil"),
        (11, "Raw water"),
    ]
);

enum_def!(
    TEMPERATURE_TYPE,
    "TemperatureType",
    [
        (0, "Battery"),
        (1, "Fridge"),
        (2, "Generic"),
        (3, "Room"),
        (4, "Outdoor"),
        (5, "Water Heater"),
        (6, "Freezer"),
    ]
);

enum_def!(
    DIGITAL_INPUT_STATE,
    "DigitalInputState",
    [
        (0, "Low"),
        (1, "High"),
        (2, "Off"),
        (3, "On"),
        (4, "No"),
        (5, "Yes"),
        (6, "Open"),
        (7, "Closed"),
        (8, "Ok"),
        (9, "Alarm"),
        (10, "Running"),
        (11, "Stopped"),
    ]
);

// Bit values, not sequential codes: decoded payloads are bitmasks.
enum_def!(
    BATTERY_ALARM,
    "BatteryAlarm",
    [
        (1, "Low voltage"),
        (2, "High voltage"),
        (4, "Low SOC"),
        (8, "Low temperature"),
        (16, "High temperature"),
        (32, "Internal failure"),
        (64, "Cell imbalance"),
    ]
);
