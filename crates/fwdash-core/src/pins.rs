use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::gateway::CommandGateway;
use crate::notify::{Notifier, Severity};
use crate::platform::platform_label;

pub const PIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinPurpose {
    Output,
    Input,
    Adc,
    I2c,
    Spi,
    I2s,
    Pwm,
}

impl std::str::FromStr for PinPurpose {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "output" => Ok(Self::Output),
            "input" => Ok(Self::Input),
            "adc" => Ok(Self::Adc),
            "i2c" => Ok(Self::I2c),
            "spi" => Ok(Self::Spi),
            "i2s" => Ok(Self::I2s),
            "pwm" => Ok(Self::Pwm),
            other => Err(CoreError::Validation(format!("Unknown pin purpose: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinSeverity {
    Ok,
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinValidation {
    pub valid: bool,
    pub severity: PinSeverity,
    pub message: String,
}

impl PinValidation {
    fn ok() -> Self {
        Self {
            valid: true,
            severity: PinSeverity::Ok,
            message: String::new(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            severity: PinSeverity::Error,
            message: message.into(),
        }
    }
}

/// Parses a GPIO number typed by the user. Only plain decimal digits pass.
pub fn parse_pin(pin: &str) -> CoreResult<u32> {
    let trimmed = pin.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CoreError::Validation(format!("Invalid pin value: {pin}")));
    }
    trimmed
        .parse()
        .map_err(|_| CoreError::Validation(format!("Invalid pin value: {pin}")))
}

#[derive(Clone)]
pub struct PinValidator {
    gateway: CommandGateway,
    notifier: Notifier,
}

impl PinValidator {
    pub fn new(gateway: CommandGateway, notifier: Notifier) -> Self {
        Self { gateway, notifier }
    }

    /// Returns a verdict for `pin`; this never fails.
    pub async fn validate_pin(
        &self,
        pin: &str,
        purpose: PinPurpose,
        platform: &str,
        module: Option<&str>,
    ) -> PinValidation {
        if pin.trim().eq_ignore_ascii_case("A0") && platform_label(platform) == "ESP8266" {
            return if purpose == PinPurpose::Adc {
                PinValidation::ok()
            } else {
                PinValidation::error("A0 on ESP8266 can only be used for ADC input")
            };
        }

        let number = match parse_pin(pin) {
            Ok(number) => number,
            Err(err) => return PinValidation::error(err.to_string()),
        };

        self.gateway
            .call::<PinValidation>(
                "validate_pin",
                json!({
                    "pin": number,
                    "purpose": purpose,
                    "platform": platform,
                    "module": module,
                }),
                PIN_TIMEOUT,
            )
            .await
            .unwrap_or_else(|err| PinValidation::error(format!("Validation failed: {err}")))
    }

    pub async fn safe_pins(&self, platform: &str, module: Option<&str>) -> Vec<u8> {
        match self
            .gateway
            .call::<Vec<u8>>(
                "get_safe_pins",
                json!({ "platform": platform, "module": module }),
                PIN_TIMEOUT,
            )
            .await
        {
            Ok(pins) => pins,
            Err(err) => {
                warn!("get_safe_pins for {platform} failed: {err}");
                self.notifier
                    .notify("Failed to load suggested pins", Severity::Error);
                Vec::new()
            }
        }
    }
}
