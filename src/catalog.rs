//! The register catalog: which registers exist, how to decode them and where to publish them.

use crate::derived::Derived;
use crate::discovery::{Component, Discovery};
use crate::registers::{
    FieldType, KeyError, RegisterDescriptor, RegisterGroup, RegisterKey, Render,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

macro_rules! field_type {
    (_) => {
        None
    };
    ($ty: ident) => {
        Some(FieldType::$ty)
    };
}

macro_rules! param {
    (_) => {
        None
    };
    ($param: literal) => {
        Some($param.to_string())
    };
}

macro_rules! group {
    (_) => {
        None
    };
    ($group: ident) => {
        Some(RegisterGroup::$group)
    };
}

macro_rules! register_key {
    ($address: literal) => {
        RegisterKey::Address($address)
    };
    ($derived: ident) => {
        RegisterKey::Derived(Derived::$derived)
    };
}

macro_rules! register_options {
    ($d: ident;) => {};
    ($d: ident; rw $($rest: tt)*) => {
        $d.writable = true;
        register_options!($d; $($rest)*);
    };
    ($d: ident; render $render: ident $($rest: tt)*) => {
        $d.render = Render::$render;
        register_options!($d; $($rest)*);
    };
    ($d: ident; items { $($code: literal => $text: literal),* $(,)? } $($rest: tt)*) => {
        $d.value_items = BTreeMap::from([$(($code, $text.to_string())),*]);
        register_options!($d; $($rest)*);
    };
    ($d: ident; hass $component: ident $($rest: tt)*) => {
        $d.discovery = Some(Discovery::new(Component::$component));
        register_options!($d; $($rest)*);
    };
    ($d: ident; class $class: literal $($rest: tt)*) => {
        if let Some(discovery) = $d.discovery.as_mut() {
            discovery.device_class = Some($class.to_string());
        }
        register_options!($d; $($rest)*);
    };
    ($d: ident; state $class: literal $($rest: tt)*) => {
        if let Some(discovery) = $d.discovery.as_mut() {
            discovery.state_class = Some($class.to_string());
        }
        register_options!($d; $($rest)*);
    };
    ($d: ident; template $template: literal $($rest: tt)*) => {
        if let Some(discovery) = $d.discovery.as_mut() {
            discovery.value_template = Some($template.to_string());
        }
        register_options!($d; $($rest)*);
    };
    ($d: ident; payload $on: literal / $off: literal $($rest: tt)*) => {
        if let Some(discovery) = $d.discovery.as_mut() {
            discovery.payload_on = Some($on.to_string());
            discovery.payload_off = Some($off.to_string());
        }
        register_options!($d; $($rest)*);
    };
}

// key: group, type, words, scale, unit, param, name, [options];
macro_rules! for_each_builtin_register {
    ($m: ident) => {
        $m! {
            10000: Static, Str, 8, 1, "", "serial_no", "Inverter serial number", [];
            10008: Static, Byte, 1, 1, "", "equipment_info", "Equipment info", [render Equipment];
            10011: Static, Byte, 4, 1, "", "firmware_version", "Firmware version", [render Firmware];

            10100: Base, Dat, 3, 1, "", "inverter_date", "Inverter date", [];
            10105: Base, U16, 1, 1, "", "inverter_status", "Inverter status", [
                items { 0 => "wait for on-grid", 1 => "self-check", 2 => "on-grid", 3 => "fault", 4 => "firmware update", 5 => "off grid" }
                hass Sensor class "enum"
            ];
            10112: Inverter, Bit, 2, 1, "", "fault_flag1", "Fault flag 1", [
                items { 0 => "Mains lost", 1 => "Grid voltage fault", 2 => "Grid frequency fault", 3 => "DCI fault", 4 => "ISO over limitation", 5 => "GFCI fault", 6 => "PV over voltage", 7 => "Bus voltage fault", 8 => "Inverter over temperature" }
                hass Sensor class "enum"
            ];
            10114: Inverter, Bit, 2, 1, "", "fault_flag2", "Fault flag 2", [
                items { 1 => "SPI fault", 2 => "E2 fault", 3 => "GFCI device fault", 4 => "AC transducer fault", 5 => "Relay check fail", 6 => "Internal fan fault", 7 => "External fan fault" }
                hass Sensor class "enum"
            ];
            10994: Grid, I32, 2, 1, "W", "grid_power_a", "Grid power phase A", [hass Sensor class "power" state "measurement"];
            10996: Grid, I32, 2, 1, "W", "grid_power_b", "Grid power phase B", [hass Sensor class "power" state "measurement"];
            10998: Grid, I32, 2, 1, "W", "grid_power_c", "Grid power phase C", [hass Sensor class "power" state "measurement"];
            11000: Base, I32, 2, 1, "W", "grid_power", "Grid power", [hass Sensor class "power" state "measurement"];
            11006: Inverter, U16, 1, 10, "V", "inverter_voltage_a", "Inverter voltage phase A", [hass Sensor class "voltage" state "measurement"];
            11007: Inverter, I16, 1, 10, "A", "inverter_current_a", "Inverter current phase A", [hass Sensor class "current" state "measurement"];
            11008: Inverter, U16, 1, 10, "V", "inverter_voltage_b", "Inverter voltage phase B", [hass Sensor class "voltage" state "measurement"];
            11009: Inverter, I16, 1, 10, "A", "inverter_current_b", "Inverter current phase B", [hass Sensor class "current" state "measurement"];
            11010: Inverter, U16, 1, 10, "V", "inverter_voltage_c", "Inverter voltage phase C", [hass Sensor class "voltage" state "measurement"];
            11011: Inverter, I16, 1, 10, "A", "inverter_current_c", "Inverter current phase C", [hass Sensor class "current" state "measurement"];
            11015: Grid, U16, 1, 100, "Hz", "grid_frequency", "Grid frequency", [hass Sensor class "frequency" state "measurement"];
            11016: Base, I32, 2, 1, "W", "inverter", "Inverter AC power", [hass Sensor class "power" state "measurement"];
            11028: Base, U32, 2, 1, "W", "pv", "PV power", [hass Sensor class "power" state "measurement"];
            11032: Inverter, I16, 1, 10, "°C", "inverter_temp1", "Inverter temperature 1", [hass Sensor class "temperature" state "measurement"];
            11033: Inverter, I16, 1, 10, "°C", "inverter_temp2", "Inverter temperature 2", [hass Sensor class "temperature" state "measurement"];
            11034: Inverter, I16, 1, 10, "°C", "inverter_temp3", "Inverter temperature 3", [hass Sensor class "temperature" state "measurement"];
            11035: Inverter, I16, 1, 10, "°C", "inverter_temp4", "Inverter temperature 4", [hass Sensor class "temperature" state "measurement"];
            11038: Pv, U16, 1, 10, "V", "pv_voltage_1", "PV1 voltage", [hass Sensor class "voltage" state "measurement"];
            11039: Pv, U16, 1, 10, "A", "pv_current_1", "PV1 current", [hass Sensor class "current" state "measurement"];
            11040: Pv, U16, 1, 10, "V", "pv_voltage_2", "PV2 voltage", [hass Sensor class "voltage" state "measurement"];
            11041: Pv, U16, 1, 10, "A", "pv_current_2", "PV2 current", [hass Sensor class "current" state "measurement"];
            11062: Pv, U32, 2, 1, "W", "pv_power_1", "PV1 power", [hass Sensor class "power" state "measurement"];
            11064: Pv, U32, 2, 1, "W", "pv_power_2", "PV2 power", [hass Sensor class "power" state "measurement"];

            25100: Config, U16, 1, 1, "", "grid_inject_switch", "Grid injection limit switch", [
                rw hass Switch payload "1" / "0"
            ];
            25103: Config, U16, 1, 10, "%", "grid_inject_limit", "Grid injection power limit", [rw hass Sensor];

            30230: Backup, U16, 1, 10, "V", "backup_voltage_a", "Backup voltage phase A", [hass Sensor class "voltage" state "measurement"];
            30231: Backup, U16, 1, 10, "A", "backup_current_a", "Backup current phase A", [hass Sensor class "current" state "measurement"];
            30232: Backup, U16, 1, 100, "Hz", "backup_frequency_a", "Backup frequency phase A", [hass Sensor class "frequency" state "measurement"];
            30233: Backup, _, 1, 1, "", _, "Reserved", [];
            30234: Backup, I32, 2, 1, "W", "backup_power_a", "Backup power phase A", [hass Sensor class "power" state "measurement"];
            30236: Backup, U16, 1, 10, "V", "backup_voltage_b", "Backup voltage phase B", [hass Sensor class "voltage" state "measurement"];
            30237: Backup, U16, 1, 10, "A", "backup_current_b", "Backup current phase B", [hass Sensor class "current" state "measurement"];
            30238: Backup, U16, 1, 100, "Hz", "backup_frequency_b", "Backup frequency phase B", [hass Sensor class "frequency" state "measurement"];
            30239: Backup, _, 1, 1, "", _, "Reserved", [];
            30240: Backup, I32, 2, 1, "W", "backup_power_b", "Backup power phase B", [hass Sensor class "power" state "measurement"];
            30242: Backup, U16, 1, 10, "V", "backup_voltage_c", "Backup voltage phase C", [hass Sensor class "voltage" state "measurement"];
            30243: Backup, U16, 1, 10, "A", "backup_current_c", "Backup current phase C", [hass Sensor class "current" state "measurement"];
            30244: Backup, U16, 1, 100, "Hz", "backup_frequency_c", "Backup frequency phase C", [hass Sensor class "frequency" state "measurement"];
            30245: Backup, _, 1, 1, "", _, "Reserved", [];
            30246: Backup, I32, 2, 1, "W", "backup_power_c", "Backup power phase C", [hass Sensor class "power" state "measurement"];
            30254: Battery, U16, 1, 10, "V", "battery_voltage", "Battery voltage", [hass Sensor class "voltage" state "measurement"];
            30255: Battery, I16, 1, 10, "A", "battery_current", "Battery current", [hass Sensor class "current" state "measurement"];
            30256: Battery, U16, 1, 1, "", "battery_mode", "Battery mode", [
                items { 0 => "Discharge", 1 => "Charge" }
                hass Sensor class "enum"
            ];
            30258: Base, I32, 2, 1, "W", "battery", "Battery power", [hass Sensor class "power" state "measurement"];

            31000: Day, U16, 1, 10, "kWh", "grid_feed_day", "Grid injection energy (day)", [hass Sensor class "energy" state "total_increasing"];
            31001: Day, U16, 1, 10, "kWh", "grid_purchase_day", "Grid purchased energy (day)", [hass Sensor class "energy" state "total_increasing"];
            31002: Day, U16, 1, 10, "kWh", "backup_day", "Backup energy (day)", [hass Sensor class "energy" state "total_increasing"];
            31003: Day, U16, 1, 10, "kWh", "battery_charge_day", "Battery charge energy (day)", [hass Sensor class "energy" state "total_increasing"];
            31004: Day, U16, 1, 10, "kWh", "battery_discharge_day", "Battery discharge energy (day)", [hass Sensor class "energy" state "total_increasing"];
            31005: Day, U16, 1, 10, "kWh", "pv_day", "PV energy generated (day)", [hass Sensor class "energy" state "total_increasing"];
            31102: Total, U32, 2, 10, "kWh", "grid_feed_total", "Grid energy injected (total)", [hass Sensor class "energy" state "total_increasing"];
            31104: Total, U32, 2, 10, "kWh", "grid_purchase_total", "Grid energy purchased (total)", [hass Sensor class "energy" state "total_increasing"];
            31106: Total, U32, 2, 10, "kWh", "backup_total", "Backup energy (total)", [hass Sensor class "energy" state "total_increasing"];
            31108: Total, U32, 2, 10, "kWh", "battery_charge_total", "Battery energy charged (total)", [hass Sensor class "energy" state "total_increasing"];
            31110: Total, U32, 2, 10, "kWh", "battery_discharge_total", "Battery energy discharged (total)", [hass Sensor class "energy" state "total_increasing"];
            31112: Total, U32, 2, 10, "kWh", "pv_total", "PV energy generated (total)", [hass Sensor class "energy" state "total_increasing"];

            33000: Base, U16, 1, 100, "%", "battery_soc", "Battery SOC", [hass Sensor class "battery" state "measurement"];
            33003: Battery, I16, 1, 10, "°C", "battery_temp", "Battery temperature", [hass Sensor class "temperature" state "measurement"];
            33016: Battery, Bit, 1, 1, "", "bms_fault", "BMS fault", [
                items { 0 => "Cell over voltage", 1 => "Cell under voltage", 2 => "Over temperature", 3 => "Under temperature", 4 => "Charge over current", 5 => "Discharge over current", 6 => "Communication fault" }
                hass Sensor class "enum"
            ];

            50000: Config, U16, 1, 1, "", "mode", "Inverter operation mode", [
                rw items { 257 => "General mode", 258 => "Economic mode", 259 => "UPS mode", 512 => "Off grid", 771 => "Manual mode" }
                hass Select
            ];
            52502: Config, U16, 1, 1, "%", "on_grid_soc_limit_switch", "On-grid SOC limit switch", [rw hass Switch payload "1" / "0"];
            52503: Config, U16, 1, 1, "%", "on_grid_soc_limit", "On-grid SOC limit", [rw hass Sensor class "battery"];
            52504: Config, U16, 1, 1, "%", "off_grid_soc_limit_switch", "Off-grid SOC limit switch", [rw hass Switch payload "1" / "0"];
            52505: Config, U16, 1, 1, "%", "off_grid_soc_limit", "Off-grid SOC limit", [rw hass Sensor class "battery"];

            Consumption: Base, _, 0, 1, "W", "consumption", "Household consumption", [hass Sensor class "power" state "measurement"];
            ApiDate: Base, _, 0, 1, "", "api_date", "Local time of the bridge", [hass Sensor];
            ConsumptionDay: Day, _, 0, 1, "kWh", "consumption_day", "Household consumption (day)", [hass Sensor class "energy" state "total_increasing"];
            AutarkyDay: Day, _, 0, 1, "%", "autarky_rate_day", "Household autarky (day)", [hass Sensor state "measurement"];
            OwnConsumptionDay: Day, _, 0, 1, "%", "own_consumption_day", "Own consumption rate (day)", [hass Sensor state "measurement"];
            ConsumptionTotal: Total, _, 0, 1, "kWh", "consumption_total", "Household consumption (total)", [hass Sensor class "energy" state "total_increasing"];
            AutarkyTotal: Total, _, 0, 1, "%", "autarky_rate_total", "Household autarky (total)", [hass Sensor state "measurement"];
            OwnConsumptionTotal: Total, _, 0, 1, "%", "own_consumption_total", "Own consumption rate (total)", [hass Sensor state "measurement"];
        }
    };
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read the register map from {1:?}")]
    Read(#[source] std::io::Error, PathBuf),
    #[error("could not parse the register map")]
    Parse(#[source] serde_json::Error),
    #[error("register map key is not usable")]
    Key(#[source] KeyError),
    #[error("register {0} has a field type but a zero word length")]
    ZeroLength(RegisterKey),
    #[error("register {0} has a zero scale factor")]
    ZeroScale(RegisterKey),
    #[error("parameter name `{0}` is used by more than one register")]
    DuplicateParam(String),
    #[error("register {0} is declared more than once")]
    DuplicateKey(RegisterKey),
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "catalog::Args")]
pub struct Args {
    /// JSON register map to use instead of the built-in M-TEC register map.
    #[arg(long, env = "MTEC_MQTT_REGISTERS")]
    registers: Option<PathBuf>,
}

impl Args {
    pub async fn load(&self) -> Result<Catalog, Error> {
        match &self.registers {
            None => Ok(Catalog::builtin()),
            Some(path) => {
                let catalog = Catalog::load(path).await?;
                tracing::info!(message = "loaded register map", path = %path.display(), registers = catalog.entries().len());
                Ok(catalog)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct Entry {
    pub key: RegisterKey,
    pub descriptor: Arc<RegisterDescriptor>,
}

impl Entry {
    pub fn address(&self) -> Option<u16> {
        match self.key {
            RegisterKey::Address(a) => Some(a),
            RegisterKey::Derived(_) => None,
        }
    }
}

/// Immutable mapping from register keys to their descriptors, ordered by key.
#[derive(Debug)]
pub struct Catalog {
    entries: Vec<Entry>,
}

impl Catalog {
    pub fn new(entries: impl IntoIterator<Item = (RegisterKey, RegisterDescriptor)>) -> Result<Self, Error> {
        let mut entries = entries
            .into_iter()
            .map(|(key, descriptor)| {
                if descriptor.field_type.is_some() && descriptor.length == 0 {
                    return Err(Error::ZeroLength(key));
                }
                if descriptor.scale == 0 {
                    return Err(Error::ZeroScale(key));
                }
                Ok(Entry {
                    key,
                    descriptor: Arc::new(descriptor),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.key);
        if let Some(pair) = entries.windows(2).find(|pair| pair[0].key == pair[1].key) {
            return Err(Error::DuplicateKey(pair[0].key));
        }
        let mut params = std::collections::HashSet::new();
        for entry in &entries {
            if let Some(param) = &entry.descriptor.param {
                if !params.insert(param.as_str()) {
                    return Err(Error::DuplicateParam(param.clone()));
                }
            }
        }
        Ok(Self { entries })
    }

    /// Parse a JSON object keyed by register address or pseudo-register name.
    pub fn from_json(bytes: &[u8]) -> Result<Self, Error> {
        let map: BTreeMap<String, RegisterDescriptor> =
            serde_json::from_slice(bytes).map_err(Error::Parse)?;
        let mut entries = Vec::with_capacity(map.len());
        for (key, descriptor) in map {
            match key.parse::<RegisterKey>() {
                Ok(key) => entries.push((key, descriptor)),
                Err(KeyError::UnknownDerived(name)) => {
                    tracing::warn!(register.key = name, "unknown pseudo-register, skipping");
                }
                Err(e) => return Err(Error::Key(e)),
            }
        }
        Self::new(entries)
    }

    pub async fn load(path: &Path) -> Result<Self, Error> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Read(e, path.to_path_buf()))?;
        Self::from_json(&bytes)
    }

    pub fn builtin() -> Self {
        let mut entries = Vec::new();
        macro_rules! push_entries {
            ($($key: tt: $group: tt, $ty: tt, $len: literal, $scale: literal, $unit: literal, $param: tt, $name: literal, [$($options: tt)*];)+) => {
                $(
                    let mut descriptor = RegisterDescriptor::new($name, field_type!($ty), $len);
                    descriptor.scale = $scale;
                    descriptor.unit = $unit.to_string();
                    descriptor.param = param!($param);
                    descriptor.group = group!($group);
                    register_options!(descriptor; $($options)*);
                    entries.push((register_key!($key), descriptor));
                )+
            };
        }
        for_each_builtin_register!(push_entries);
        Self {
            entries: {
                let mut entries = entries
                    .into_iter()
                    .map(|(key, descriptor)| Entry {
                        key,
                        descriptor: Arc::new(descriptor),
                    })
                    .collect::<Vec<_>>();
                entries.sort_by_key(|e| e.key);
                entries
            },
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn get(&self, key: RegisterKey) -> Option<&Entry> {
        let index = self.entries.partition_point(|e| e.key < key);
        self.entries.get(index).filter(|e| e.key == key)
    }

    pub fn by_address(&self, address: u16) -> Option<&Arc<RegisterDescriptor>> {
        self.get(RegisterKey::Address(address)).map(|e| &e.descriptor)
    }

    pub fn by_param(&self, param: &str) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| e.descriptor.param.as_deref() == Some(param))
    }

    pub fn group(&self, group: RegisterGroup) -> impl Iterator<Item = &Entry> + '_ {
        self.entries
            .iter()
            .filter(move |e| e.descriptor.group == Some(group))
    }

    /// All keys tagged with `group`, in catalog order.
    pub fn group_keys(&self, group: RegisterGroup) -> Vec<RegisterKey> {
        self.group(group).map(|e| e.key).collect()
    }
}
