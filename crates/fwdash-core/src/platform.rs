use crate::types::DiscoveredEnvironment;

pub fn platform_from_environment(env: &DiscoveredEnvironment) -> String {
    let platform = env.platform.as_str();
    if platform.contains("espressif32") || platform == "esp32" {
        return "esp32".into();
    }
    if platform.contains("espressif8266") || platform == "esp8266" {
        return "esp8266".into();
    }
    if platform.contains("atmelavr") || platform == "avr" {
        return "avr".into();
    }
    platform.to_string()
}

/// Key under which a schema lists platform-conditional defines.
pub fn platform_key(platform: &str) -> String {
    let upper = platform.to_uppercase();
    if upper == "AVR" {
        "__AVR__".into()
    } else {
        upper.replace("ESPRESSIF", "ESP")
    }
}

pub fn platform_label(platform: &str) -> String {
    let value = platform.to_lowercase();
    if value.contains("espressif32") || value == "esp32" {
        "ESP32".into()
    } else if value.contains("espressif8266") || value == "esp8266" {
        "ESP8266".into()
    } else if value.contains("atmelavr") || value == "avr" {
        "AVR".into()
    } else if value == "native" {
        "Native".into()
    } else {
        platform.to_string()
    }
}
