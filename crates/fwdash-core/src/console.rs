use std::sync::Arc;

use crate::backend::Backend;
use crate::build::BuildOrchestrator;
use crate::events::EventRouter;
use crate::gateway::CommandGateway;
use crate::notify::Notifier;
use crate::pins::PinValidator;
use crate::prefs::PreferenceStore;
use crate::profile::ProfileState;
use crate::selection::AppSelection;
use crate::serial::SerialSessions;

/// One instance of every component, wired to a single backend.
#[derive(Clone)]
pub struct Console {
    gateway: CommandGateway,
    notifier: Notifier,
    serial: SerialSessions,
    build: BuildOrchestrator,
    profiles: ProfileState,
    pins: PinValidator,
    selection: AppSelection,
}

impl Console {
    pub fn new(backend: Arc<dyn Backend>, prefs: Arc<dyn PreferenceStore>) -> Self {
        let gateway = CommandGateway::new(backend);
        let notifier = Notifier::new();
        let serial = SerialSessions::new(gateway.clone(), notifier.clone());
        let build = BuildOrchestrator::new(gateway.clone(), serial.clone(), notifier.clone());
        let profiles = ProfileState::new(gateway.clone(), notifier.clone());
        let pins = PinValidator::new(gateway.clone(), notifier.clone());
        let selection = AppSelection::new(prefs);
        Self {
            gateway,
            notifier,
            serial,
            build,
            profiles,
            pins,
            selection,
        }
    }

    pub fn gateway(&self) -> &CommandGateway {
        &self.gateway
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn serial(&self) -> &SerialSessions {
        &self.serial
    }

    pub fn build(&self) -> &BuildOrchestrator {
        &self.build
    }

    pub fn profiles(&self) -> &ProfileState {
        &self.profiles
    }

    pub fn pins(&self) -> &PinValidator {
        &self.pins
    }

    pub fn selection(&self) -> &AppSelection {
        &self.selection
    }

    pub fn router(&self) -> EventRouter {
        EventRouter::new(self.build.clone(), self.serial.clone())
    }
}
