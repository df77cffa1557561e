use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub path: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveredEnvironment {
    pub name: String,
    pub extends: Option<String>,
    pub platform: String,
    pub board: Option<String>,
    pub framework: Option<String>,
    pub build_flags: Vec<String>,
    pub lib_deps: Vec<String>,
    pub is_hardware_target: bool,
    pub can_upload: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumValue {
    pub value: String,
    pub label: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Integer,
    Float,
    Boolean,
    String,
    Enum,
    Pin,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDefine {
    pub name: String,
    pub default_value: String,
    pub value_type: ValueType,
    #[serde(default)]
    pub enum_values: Option<Vec<EnumValue>>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfigSchema {
    pub has_config: bool,
    pub defines: Vec<ConfigDefine>,
    pub platform_conditional: BTreeMap<String, Vec<ConfigDefine>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppInfo {
    pub name: String,
    pub path: String,
    pub has_config: bool,
    pub environments: Vec<DiscoveredEnvironment>,
    pub config_schema: AppConfigSchema,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedProfile {
    pub name: String,
    pub app_name: String,
    pub environment: String,
    pub defines: IndexMap<String, String>,
    pub created_at: String,
    pub updated_at: String,
}
