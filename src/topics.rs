//! Topic descriptors and the built-in topic table
//!
//! A [`TopicDescriptor`] declares how one family of MQTT topics maps onto
//! metrics: the pattern with `{placeholder}` segments, the message kind, how
//! to decode the payload, and display metadata. The table itself is plain
//! data; all matching logic lives in `topic_map`.

use crate::enums::{
    BATTERY_ALARM, DIGITAL_INPUT_STATE, EV_CHARGER_MODE, EnumDef, FLUID_TYPE, GENERIC_ON_OFF,
    INVERTER_MODE, MPP_OPERATION_MODE, SYSTEM_STATE, TEMPERATURE_TYPE,
};
use std::collections::HashMap;

/// Kind of MQTT message a descriptor produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Device-level attribute (model, serial, ...), no metric is created
    Attribute,
    Sensor,
    BinarySensor,
    Switch,
    Select,
    Number,
    /// Write-only command topic, addressed by short id via `Hub::publish`
    Service,
}

impl MetricKind {
    /// Whether metrics of this kind accept write-back.
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            MetricKind::Switch | MetricKind::Select | MetricKind::Number
        )
    }
}

/// Nature of the metric over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricNature {
    #[default]
    None,
    Instantaneous,
    Cumulative,
    Delta,
}

/// Physical quantity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricType {
    #[default]
    None,
    Power,
    ApparentPower,
    Energy,
    Voltage,
    Current,
    Temperature,
    Frequency,
    Time,
    Percentage,
    ElectricStorageCapacity,
    ElectricStoragePercentage,
    LiquidVolume,
}

/// How a payload's `value` field is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    Int,
    /// Integer where a null payload decodes to 0 instead of no value
    IntDefaultZero,
    Float,
    String,
    Enum,
    /// Integer interpreted as a bitmask of enum member codes
    Bitmask,
    /// Epoch seconds decoded to a UTC timestamp
    Epoch,
    IntSecondsToHours,
    IntSecondsToMinutes,
}

impl ValueType {
    /// Value types whose decoded form carries a fractional component, and
    /// for which a precision therefore makes sense.
    pub fn is_float_like(&self) -> bool {
        matches!(
            self,
            ValueType::Float | ValueType::IntSecondsToHours | ValueType::IntSecondsToMinutes
        )
    }
}

/// Whether a writable entity's bounds come from the table or the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangeType {
    #[default]
    Static,
    /// `min`/`max` fields of the first payload override the table bounds
    Dynamic,
}

/// Declarative description of one topic family.
#[derive(Debug, Clone)]
pub struct TopicDescriptor {
    /// Topic pattern, `N/{installation_id}/<type>/{device_id}/...` with
    /// `{placeholder}` segments; formula entries start with `$$func/`
    pub topic: String,
    pub message_kind: MetricKind,
    /// Device-local short id template (may contain `{placeholder}`s)
    pub short_id: String,
    /// Human-readable name template; required for all non-attribute kinds
    pub name: Option<String>,
    pub unit_of_measurement: Option<&'static str>,
    pub metric_type: MetricType,
    pub metric_nature: MetricNature,
    pub value_type: ValueType,
    /// Decimal places applied on decode; only set for float-like value types
    pub precision: Option<u32>,
    pub enum_def: Option<&'static EnumDef>,
    pub min_max_range: RangeType,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Increment for writable numeric kinds
    pub step: Option<f64>,
    /// Last segment of a companion boolean topic gating writability
    pub is_adjustable_suffix: Option<&'static str>,
    /// Short ids this entry depends on (templates for regular topics,
    /// concrete ids for formulas)
    pub depends_on: Vec<String>,
    pub experimental: bool,
    /// Captured values seeded by range expansion (e.g. `output` -> `"2"`)
    pub key_values: HashMap<String, String>,
}

impl TopicDescriptor {
    /// Start a descriptor; unit and precision defaults follow the value type.
    pub fn new(topic: &str, kind: MetricKind, short_id: &str, value_type: ValueType) -> Self {
        let (unit, precision) = match value_type {
            ValueType::Float => (None, Some(2)),
            ValueType::IntSecondsToHours => (Some("h"), Some(1)),
            ValueType::IntSecondsToMinutes => (Some("min"), Some(0)),
            _ => (None, None),
        };
        TopicDescriptor {
            topic: topic.to_string(),
            message_kind: kind,
            short_id: short_id.to_string(),
            name: None,
            unit_of_measurement: unit,
            metric_type: MetricType::None,
            metric_nature: MetricNature::None,
            value_type,
            precision,
            enum_def: None,
            min_max_range: RangeType::Static,
            min: None,
            max: None,
            step: None,
            is_adjustable_suffix: None,
            depends_on: Vec::new(),
            experimental: false,
            key_values: HashMap::new(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn unit(mut self, unit: &'static str) -> Self {
        self.unit_of_measurement = Some(unit);
        self
    }

    pub fn metric_type(mut self, metric_type: MetricType) -> Self {
        self.metric_type = metric_type;
        self
    }

    pub fn nature(mut self, nature: MetricNature) -> Self {
        self.metric_nature = nature;
        self
    }

    pub fn precision(mut self, precision: u32) -> Self {
        self.precision = self.value_type.is_float_like().then_some(precision);
        self
    }

    pub fn enum_def(mut self, def: &'static EnumDef) -> Self {
        self.enum_def = Some(def);
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn dynamic_range(mut self) -> Self {
        self.min_max_range = RangeType::Dynamic;
        self
    }

    pub fn adjustable_suffix(mut self, suffix: &'static str) -> Self {
        self.is_adjustable_suffix = Some(suffix);
        self
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn experimental(mut self) -> Self {
        self.experimental = true;
        self
    }

    /// Formula entries carry a `$$func/` prefix instead of a topic namespace.
    pub fn is_formula(&self) -> bool {
        self.topic.starts_with("$$func/")
    }
}

use MetricKind::{Attribute, Number, Select, Sensor, Service, Switch};
use MetricNature::{Cumulative, Instantaneous};
use ValueType::{
    Bool, Bitmask, Enum, Epoch, Float, Int, IntDefaultZero, IntSecondsToHours,
    IntSecondsToMinutes, String as Str,
};

/// The built-in topic table.
///
/// Attribute entries first, then value entries sorted by topic, then
/// formulas. Kept in the same shape as the Venus OS dbus-flashmq topic
/// namespace so new entries slot in alphabetically.
pub fn topic_table() -> Vec<TopicDescriptor> {
    vec![
        // --- Device attributes -------------------------------------------
        TopicDescriptor::new(
            "N/{installation_id}/+/{device_id}/CustomName",
            Attribute,
            "custom_name",
            Str,
        ),
        TopicDescriptor::new(
            "N/{installation_id}/+/{device_id}/FirmwareVersion",
            Attribute,
            "firmware_version",
            Str,
        ),
        TopicDescriptor::new(
            "N/{installation_id}/+/{device_id}/Manufacturer",
            Attribute,
            "manufacturer",
            Str,
        ),
        TopicDescriptor::new(
            "N/{installation_id}/+/{device_id}/ProductId",
            Attribute,
            "victron_productid",
            Str,
        ),
        TopicDescriptor::new(
            "N/{installation_id}/+/{device_id}/ProductName",
            Attribute,
            "model",
            Str,
        ),
        TopicDescriptor::new(
            "N/{installation_id}/+/{device_id}/Serial",
            Attribute,
            "serial_number",
            Str,
        ),
        // --- Value topics ------------------------------------------------
        TopicDescriptor::new(
            "N/{installation_id}/battery/{device_id}/Alarms/Flags",
            Sensor,
            "battery_alarm_flags",
            Bitmask,
        )
        .name("Battery alarms")
        .enum_def(&BATTERY_ALARM),
        TopicDescriptor::new(
            "N/{installation_id}/battery/{device_id}/Dc/0/Current",
            Sensor,
            "battery_current",
            Float,
        )
        .name("Battery current")
        .unit("A")
        .metric_type(MetricType::Current)
        .nature(Instantaneous),
        TopicDescriptor::new(
            "N/{installation_id}/battery/{device_id}/Dc/0/Power",
            Sensor,
            "battery_power",
            Float,
        )
        .name("Battery power")
        .unit("W")
        .metric_type(MetricType::Power)
        .nature(Instantaneous)
        .precision(0),
        TopicDescriptor::new(
            "N/{installation_id}/battery/{device_id}/Dc/0/Voltage",
            Sensor,
            "battery_voltage",
            Float,
        )
        .name("Battery voltage")
        .unit("V")
        .metric_type(MetricType::Voltage)
        .nature(Instantaneous),
        TopicDescriptor::new(
            "N/{installation_id}/battery/{device_id}/Soc",
            Sensor,
            "battery_soc",
            Float,
        )
        .name("Battery charge")
        .unit("%")
        .metric_type(MetricType::ElectricStoragePercentage)
        .precision(1),
        TopicDescriptor::new(
            "N/{installation_id}/battery/{device_id}/TimeToGo",
            Sensor,
            "battery_time_to_go",
            IntSecondsToHours,
        )
        .name("Battery time to go")
        .metric_type(MetricType::Time),
        TopicDescriptor::new(
            "N/{installation_id}/digitalinput/{device_id}/Count",
            Sensor,
            "digitalinput_count",
            IntDefaultZero,
        )
        .name("Digital input count")
        .nature(Cumulative),
        TopicDescriptor::new(
            "N/{installation_id}/digitalinput/{device_id}/State",
            Sensor,
            "digitalinput_state",
            Enum,
        )
        .name("Digital input state")
        .enum_def(&DIGITAL_INPUT_STATE),
        TopicDescriptor::new(
            "N/{installation_id}/evcharger/{device_id}/ChargingTime",
            Sensor,
            "evcharger_charging_time",
            IntSecondsToMinutes,
        )
        .name("EV charger charging time")
        .metric_type(MetricType::Time),
        TopicDescriptor::new(
            "N/{installation_id}/evcharger/{device_id}/Mode",
            Select,
            "evcharger_mode",
            Enum,
        )
        .name("EV charger mode")
        .enum_def(&EV_CHARGER_MODE),
        TopicDescriptor::new(
            "N/{installation_id}/evcharger/{device_id}/SetCurrent",
            Number,
            "evcharger_set_current",
            Float,
        )
        .name("EV charger charging current")
        .unit("A")
        .metric_type(MetricType::Current)
        .precision(0)
        .range(0.0, 32.0)
        .step(1.0),
        TopicDescriptor::new(
            "N/{installation_id}/grid/{device_id}/Ac/Power",
            Sensor,
            "grid_power",
            Float,
        )
        .name("Grid power")
        .unit("W")
        .metric_type(MetricType::Power)
        .nature(Instantaneous)
        .precision(0),
        TopicDescriptor::new(
            "N/{installation_id}/grid/{device_id}/Ac/{phase}/Energy/Forward",
            Sensor,
            "grid_energy_forward_{phase}",
            Float,
        )
        .name("Grid consumption on {phase}")
        .unit("kWh")
        .metric_type(MetricType::Energy)
        .nature(Cumulative)
        .precision(1),
        TopicDescriptor::new(
            "N/{installation_id}/grid/{device_id}/Ac/{phase}/Energy/Reverse",
            Sensor,
            "grid_energy_reverse_{phase}",
            Float,
        )
        .name("Grid feed-in on {phase}")
        .unit("kWh")
        .metric_type(MetricType::Energy)
        .nature(Cumulative)
        .precision(1),
        TopicDescriptor::new(
            "N/{installation_id}/grid/{device_id}/Ac/{phase}/Power",
            Sensor,
            "grid_power_{phase}",
            Float,
        )
        .name("Grid power on {phase}")
        .unit("W")
        .metric_type(MetricType::Power)
        .nature(Instantaneous)
        .precision(0),
        TopicDescriptor::new(
            "N/{installation_id}/grid/{device_id}/Ac/{phase}/VoltageLineToLine",
            Sensor,
            "grid_voltage_{phase}_{next_phase}",
            Float,
        )
        .name("Grid voltage {phase} to {next_phase}")
        .unit("V")
        .metric_type(MetricType::Voltage)
        .nature(Instantaneous)
        .precision(1),
        TopicDescriptor::new("N/{installation_id}/heartbeat", Sensor, "venus_heartbeat", Epoch)
            .name("Venus heartbeat"),
        TopicDescriptor::new(
            "N/{installation_id}/platform/{device_id}/Firmware/Installed/Version",
            Sensor,
            "platform_venus_firmware_installed_version",
            Str,
        )
        .name("Venus firmware version"),
        TopicDescriptor::new(
            "N/{installation_id}/settings/{device_id}/Settings/CGwacs/AcPowerSetPoint",
            Number,
            "cgwacs_ac_power_set_point",
            Float,
        )
        .name("CGwacs AC power setpoint")
        .unit("W")
        .metric_type(MetricType::Power)
        .precision(0)
        .dynamic_range(),
        TopicDescriptor::new(
            "N/{installation_id}/solarcharger/{device_id}/History/Daily/0/MaxPower",
            Sensor,
            "solarcharger_max_power_today",
            Float,
        )
        .name("Max charge power today")
        .unit("W")
        .metric_type(MetricType::Power)
        .precision(0),
        TopicDescriptor::new(
            "N/{installation_id}/solarcharger/{device_id}/History/Daily/1/MaxPower",
            Sensor,
            "solarcharger_max_power_yesterday",
            Float,
        )
        .name("Max charge power yesterday")
        .unit("W")
        .metric_type(MetricType::Power)
        .precision(0),
        TopicDescriptor::new(
            "N/{installation_id}/solarcharger/{device_id}/MppOperationMode",
            Sensor,
            "solarcharger_mpp_operation_mode",
            Enum,
        )
        .name("MPP operation mode")
        .enum_def(&MPP_OPERATION_MODE),
        TopicDescriptor::new(
            "N/{installation_id}/solarcharger/{device_id}/Yield/Power",
            Sensor,
            "solarcharger_yield_power",
            Float,
        )
        .name("PV yield power")
        .unit("W")
        .metric_type(MetricType::Power)
        .nature(Instantaneous)
        .precision(0),
        TopicDescriptor::new(
            "N/{installation_id}/switch/{device_id}/SwitchableOutput/output_{output(1-4)}/Dimming",
            Number,
            "switch_{output}_dimming",
            Float,
        )
        .name("Switch {output:switch_{output}_custom_name} Dimming")
        .unit("%")
        .metric_type(MetricType::Percentage)
        .precision(0)
        .range(0.0, 100.0)
        .depends_on(&["switch_{output}_custom_name"]),
        TopicDescriptor::new(
            "N/{installation_id}/switch/{device_id}/SwitchableOutput/output_{output(1-4)}/Settings/CustomName",
            Sensor,
            "switch_{output}_custom_name",
            Str,
        )
        .name("Switch {output} Custom Name"),
        TopicDescriptor::new(
            "N/{installation_id}/switch/{device_id}/SwitchableOutput/output_{output(1-4)}/State",
            Switch,
            "switch_{output}_state",
            Enum,
        )
        .name("Switch {output} State")
        .enum_def(&GENERIC_ON_OFF),
        TopicDescriptor::new(
            "N/{installation_id}/system/{device_id}/Ac/Genset/{phase}/Power",
            Sensor,
            "system_generator_load_{phase}",
            Float,
        )
        .name("Genset Load {phase}")
        .unit("W")
        .metric_type(MetricType::Power)
        .nature(Instantaneous)
        .precision(0),
        TopicDescriptor::new(
            "N/{installation_id}/system/{device_id}/Dc/Battery/Power",
            Sensor,
            "system_dc_battery_power",
            Float,
        )
        .name("System battery power")
        .unit("W")
        .metric_type(MetricType::Power)
        .nature(Instantaneous)
        .precision(0),
        TopicDescriptor::new(
            "N/{installation_id}/system/{device_id}/Dc/Battery/Soc",
            Sensor,
            "system_dc_battery_soc",
            Float,
        )
        .name("System battery charge")
        .unit("%")
        .metric_type(MetricType::ElectricStoragePercentage)
        .precision(1),
        TopicDescriptor::new(
            "N/{installation_id}/system/{device_id}/Relay/{relay}/State",
            Switch,
            "system_relay_{relay}",
            Enum,
        )
        .name("Relay {relay} state")
        .enum_def(&GENERIC_ON_OFF),
        TopicDescriptor::new(
            "N/{installation_id}/system/{device_id}/SystemState/State",
            Sensor,
            "system_state",
            Enum,
        )
        .name("System state")
        .enum_def(&SYSTEM_STATE),
        TopicDescriptor::new(
            "N/{installation_id}/tank/{device_id}/FluidType",
            Sensor,
            "tank_fluid_type",
            Enum,
        )
        .name("Tank fluid type")
        .enum_def(&FLUID_TYPE),
        TopicDescriptor::new(
            "N/{installation_id}/tank/{device_id}/Level",
            Sensor,
            "tank_level",
            Float,
        )
        .name("Tank level")
        .unit("%")
        .metric_type(MetricType::Percentage)
        .precision(0),
        TopicDescriptor::new(
            "N/{installation_id}/temperature/{device_id}/Temperature",
            Sensor,
            "temperature_temperature",
            Float,
        )
        .name("Temperature")
        .unit("°C")
        .metric_type(MetricType::Temperature)
        .nature(Instantaneous)
        .precision(1),
        TopicDescriptor::new(
            "N/{installation_id}/temperature/{device_id}/TemperatureType",
            Sensor,
            "temperature_type",
            Enum,
        )
        .name("Temperature sensor type")
        .enum_def(&TEMPERATURE_TYPE),
        TopicDescriptor::new(
            "N/{installation_id}/vebus/{device_id}/Ac/ActiveIn/CurrentLimit",
            Number,
            "inverter_current_limit",
            Float,
        )
        .name("Inverter AC input current limit")
        .unit("A")
        .metric_type(MetricType::Current)
        .precision(0)
        .range(0.0, 100.0)
        .adjustable_suffix("CurrentLimitIsAdjustable"),
        TopicDescriptor::new(
            "N/{installation_id}/vebus/{device_id}/Ac/Out/{phase}/P",
            Sensor,
            "inverter_output_power_{phase}",
            Float,
        )
        .name("Inverter output power on {phase}")
        .unit("W")
        .metric_type(MetricType::Power)
        .nature(Instantaneous)
        .precision(0),
        TopicDescriptor::new(
            "N/{installation_id}/vebus/{device_id}/Mode",
            Select,
            "inverter_mode",
            Enum,
        )
        .name("Inverter mode")
        .enum_def(&INVERTER_MODE),
        TopicDescriptor::new(
            "N/{installation_id}/vebus/{device_id}/State",
            Sensor,
            "inverter_state",
            Enum,
        )
        .name("Inverter state")
        .enum_def(&SYSTEM_STATE),
        TopicDescriptor::new(
            "N/{installation_id}/vebus/{device_id}/SystemReset",
            Sensor,
            "inverter_system_reset",
            Bool,
        )
        .name("Inverter system reset")
        .experimental(),
        // --- Services ----------------------------------------------------
        TopicDescriptor::new(
            "W/{installation_id}/evcharger/{device_id}/StartStop",
            Service,
            "evcharger_start_stop",
            Int,
        )
        .name("EV charger start/stop"),
        // --- Formulas ----------------------------------------------------
        TopicDescriptor::new(
            "$$func/system/0/Energy/battery_charged_energy",
            Sensor,
            "system_battery_charged_energy",
            Float,
        )
        .name("Battery charged energy")
        .unit("Wh")
        .metric_type(MetricType::Energy)
        .nature(Cumulative)
        .precision(1)
        .depends_on(&["system_dc_battery_power"]),
        TopicDescriptor::new(
            "$$func/system/0/Energy/battery_discharged_energy",
            Sensor,
            "system_battery_discharged_energy",
            Float,
        )
        .name("Battery discharged energy")
        .unit("Wh")
        .metric_type(MetricType::Energy)
        .nature(Cumulative)
        .precision(1)
        .depends_on(&["system_dc_battery_power"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_attribute_descriptors_have_names() {
        for desc in topic_table() {
            if desc.message_kind != MetricKind::Attribute {
                assert!(desc.name.is_some(), "missing name for {}", desc.topic);
            }
        }
    }

    #[test]
    fn test_no_duplicate_short_ids() {
        let mut seen = std::collections::HashMap::new();
        for desc in topic_table() {
            if desc.message_kind == MetricKind::Attribute {
                continue;
            }
            if let Some(prev) = seen.insert(desc.short_id.clone(), desc.topic.clone()) {
                panic!(
                    "duplicate short_id '{}' in '{}' and '{}'",
                    desc.short_id, prev, desc.topic
                );
            }
        }
    }

    #[test]
    fn test_enum_value_types_carry_enum_defs() {
        for desc in topic_table() {
            match desc.value_type {
                ValueType::Enum | ValueType::Bitmask => {
                    assert!(desc.enum_def.is_some(), "missing enum for {}", desc.topic)
                }
                _ => assert!(
                    desc.enum_def.is_none(),
                    "unexpected enum for {}",
                    desc.topic
                ),
            }
        }
    }

    #[test]
    fn test_precision_only_for_float_like() {
        for desc in topic_table() {
            if !desc.value_type.is_float_like() {
                assert!(
                    desc.precision.is_none(),
                    "precision set for non-float {}",
                    desc.topic
                );
            }
        }
    }

    #[test]
    fn test_formula_entries_declare_dependencies() {
        for desc in topic_table() {
            if desc.is_formula() {
                assert!(
                    !desc.depends_on.is_empty(),
                    "formula {} has no dependencies",
                    desc.topic
                );
            }
        }
    }

    #[test]
    fn test_topic_structure() {
        for desc in topic_table() {
            if desc.is_formula() {
                continue;
            }
            if desc.message_kind == MetricKind::Service {
                assert!(desc.topic.starts_with("W/{installation_id}/"), "{}", desc.topic);
            } else {
                assert!(desc.topic.starts_with("N/{installation_id}/"), "{}", desc.topic);
            }
            assert!(!desc.topic.contains("//"), "{}", desc.topic);
            for part in desc.topic.split('/') {
                assert!(
                    !matches!(part, "L1" | "L2" | "L3"),
                    "literal phase in {}",
                    desc.topic
                );
            }
        }
    }

    #[test]
    fn test_name_references_exist() {
        let short_ids: Vec<String> = topic_table().iter().map(|d| d.short_id.clone()).collect();
        let moniker = regex::Regex::new(r"\{[^:{}]+:([^{}]*(?:\{[^{}]*\}[^{}]*)*)\}").unwrap();
        for desc in topic_table() {
            let Some(name) = &desc.name else { continue };
            for cap in moniker.captures_iter(name) {
                let referenced = &cap[1];
                assert!(
                    short_ids.iter().any(|s| s == referenced),
                    "{} references unknown short_id {}",
                    desc.topic,
                    referenced
                );
            }
        }
    }
}
