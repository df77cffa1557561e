use std::{sync::Arc, time::Duration};

use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::gateway::CommandGateway;
use crate::notify::{Notifier, Severity};
use crate::platform::{platform_from_environment, platform_key};
use crate::types::{AppInfo, DiscoveredEnvironment, SavedProfile};

pub const PROFILE_TIMEOUT: Duration = Duration::from_secs(10);

/// Quotes a define value for use on a compiler command line.
pub fn quote_build_flag_value(value: &str) -> String {
    if value.is_empty() {
        return "\"\"".into();
    }

    let trimmed = value.trim();
    let quoted_with = |quote: char| {
        trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote)
    };
    if quoted_with('"') || quoted_with('\'') {
        return trimmed.to_string();
    }

    if !value.chars().any(|c| c.is_whitespace() || c == '"') {
        return value.to_string();
    }

    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('"');
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('"');
    escaped
}

/// One `-DNAME=value` flag per define, in define order.
pub fn build_flags_from_defines(defines: &IndexMap<String, String>) -> Vec<String> {
    defines
        .iter()
        .map(|(name, value)| format!("-D{name}={}", quote_build_flag_value(value)))
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConfigState {
    pub app_name: String,
    pub environment: String,
    pub defines: IndexMap<String, String>,
    pub is_dirty: bool,
}

/// Define values for the selected app and environment, plus the saved
/// profiles of that app.
#[derive(Clone)]
pub struct ProfileState {
    inner: Arc<ProfileInner>,
}

struct ProfileInner {
    gateway: CommandGateway,
    notifier: Notifier,
    config: watch::Sender<ConfigState>,
    profiles: watch::Sender<Vec<String>>,
}

impl ProfileState {
    pub fn new(gateway: CommandGateway, notifier: Notifier) -> Self {
        Self {
            inner: Arc::new(ProfileInner {
                gateway,
                notifier,
                config: watch::Sender::new(ConfigState::default()),
                profiles: watch::Sender::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConfigState> {
        self.inner.config.subscribe()
    }

    pub fn subscribe_profiles(&self) -> watch::Receiver<Vec<String>> {
        self.inner.profiles.subscribe()
    }

    pub fn config(&self) -> ConfigState {
        self.inner.config.borrow().clone()
    }

    pub fn profiles(&self) -> Vec<String> {
        self.inner.profiles.borrow().clone()
    }

    /// Seeds the defines from the app's schema defaults for this environment.
    pub fn init_config(&self, app: &AppInfo, environment: &DiscoveredEnvironment) {
        let platform = platform_from_environment(environment);
        let key = platform_key(&platform);
        let schema = &app.config_schema;

        let conditional = [key.as_str(), platform.as_str()]
            .into_iter()
            .filter_map(|name| schema.platform_conditional.get(name))
            .flatten();
        let defines = schema
            .defines
            .iter()
            .chain(conditional)
            .map(|define| (define.name.clone(), define.default_value.clone()))
            .collect();

        self.inner.config.send_replace(ConfigState {
            app_name: app.name.clone(),
            environment: environment.name.clone(),
            defines,
            is_dirty: false,
        });
    }

    pub fn update_define(&self, name: &str, value: &str) {
        self.inner.config.send_modify(|config| {
            config.defines.insert(name.to_string(), value.to_string());
            config.is_dirty = true;
        });
    }

    pub fn reset_dirty(&self) {
        self.inner.config.send_if_modified(|config| {
            std::mem::replace(&mut config.is_dirty, false)
        });
    }

    pub fn apply_profile(&self, profile: &SavedProfile) {
        self.inner.config.send_replace(ConfigState {
            app_name: profile.app_name.clone(),
            environment: profile.environment.clone(),
            defines: profile.defines.clone(),
            is_dirty: false,
        });
    }

    pub fn generate_build_flags(&self) -> Vec<String> {
        build_flags_from_defines(&self.inner.config.borrow().defines)
    }

    /// Refreshes the profile list. Failures leave an empty list behind.
    pub async fn load_profiles(&self, app_name: &str) -> Vec<String> {
        let names = match self
            .inner
            .gateway
            .call::<Vec<String>>(
                "list_profiles",
                json!({ "appName": app_name }),
                PROFILE_TIMEOUT,
            )
            .await
        {
            Ok(names) => names,
            Err(err) => {
                warn!("list_profiles for {app_name} failed: {err}");
                self.inner
                    .notifier
                    .notify("Failed to load profiles", Severity::Error);
                Vec::new()
            }
        };
        self.inner.profiles.send_replace(names.clone());
        names
    }

    pub async fn save_profile(&self, name: &str) -> CoreResult<SavedProfile> {
        let config = self.config();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let profile = SavedProfile {
            name: name.to_string(),
            app_name: config.app_name.clone(),
            environment: config.environment.clone(),
            defines: config.defines,
            created_at: now.clone(),
            updated_at: now,
        };

        self.inner
            .gateway
            .call_raw("save_profile", json!({ "profile": &profile }), PROFILE_TIMEOUT)
            .await
            .map_err(|err| CoreError::profile("save", err))?;
        info!("saved profile {name} for {}", config.app_name);

        self.load_profiles(&config.app_name).await;
        self.reset_dirty();
        Ok(profile)
    }

    pub async fn load_profile(&self, app_name: &str, name: &str) -> CoreResult<SavedProfile> {
        self.inner
            .gateway
            .call(
                "load_profile",
                json!({ "appName": app_name, "profileName": name }),
                PROFILE_TIMEOUT,
            )
            .await
            .map_err(|err| CoreError::profile("load", err))
    }

    pub async fn delete_profile(&self, app_name: &str, name: &str) -> CoreResult<()> {
        self.inner
            .gateway
            .call_raw(
                "delete_profile",
                json!({ "appName": app_name, "profileName": name }),
                PROFILE_TIMEOUT,
            )
            .await
            .map_err(|err| CoreError::profile("delete", err))?;
        info!("deleted profile {name} for {app_name}");
        self.load_profiles(app_name).await;
        Ok(())
    }
}
