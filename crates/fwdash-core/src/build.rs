use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::CoreError;
use crate::events::BuildEvent;
use crate::gateway::CommandGateway;
use crate::notify::{Notifier, Severity};
use crate::serial::SerialSessions;

pub const MAX_LOG_LINES: usize = 5000;
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const CLEAN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildPhase {
    Idle,
    Running,
    Completed { success: bool },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BuildState {
    pub is_building: bool,
    pub app_name: Option<String>,
    pub environment: Option<String>,
    pub success: Option<bool>,
    pub duration_ms: Option<u64>,
    pub lines: VecDeque<String>,
    /// Lines appended since the log was last emptied, evicted ones included.
    pub appended: u64,
}

impl BuildState {
    pub fn phase(&self) -> BuildPhase {
        match (self.is_building, self.success) {
            (true, _) => BuildPhase::Running,
            (false, Some(success)) => BuildPhase::Completed { success },
            (false, None) => BuildPhase::Idle,
        }
    }

    fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        self.appended += 1;
        while self.lines.len() > MAX_LOG_LINES {
            self.lines.pop_front();
        }
    }

    fn clear_lines(&mut self) {
        self.lines.clear();
        self.appended = 0;
    }
}

/// Drives build, upload, test and clean jobs and folds their pushed
/// progress into a single observable [`BuildState`].
///
/// The invoking call only reports the final verdict. Progress arrives
/// separately through [`BuildOrchestrator::handle_event`].
#[derive(Clone)]
pub struct BuildOrchestrator {
    inner: Arc<BuildInner>,
}

struct BuildInner {
    gateway: CommandGateway,
    serial: SerialSessions,
    notifier: Notifier,
    state: watch::Sender<BuildState>,
    in_flight: AtomicBool,
}

struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct BuildingFlag<'a>(&'a watch::Sender<BuildState>);

impl Drop for BuildingFlag<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|state| state.is_building = false);
    }
}

impl BuildOrchestrator {
    pub fn new(gateway: CommandGateway, serial: SerialSessions, notifier: Notifier) -> Self {
        let (state, _) = watch::channel(BuildState::default());
        Self {
            inner: Arc::new(BuildInner {
                gateway,
                serial,
                notifier,
                state,
                in_flight: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<BuildState> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> BuildState {
        self.inner.state.borrow().clone()
    }

    pub fn handle_event(&self, event: BuildEvent) {
        match event {
            BuildEvent::Started {
                app_name,
                environment,
            } => {
                info!(
                    "build started: {} ({})",
                    app_name.as_deref().unwrap_or("?"),
                    environment.as_deref().unwrap_or("?")
                );
                self.inner.state.send_modify(|state| {
                    state.is_building = true;
                    state.app_name = app_name;
                    state.environment = environment;
                    state.success = None;
                    state.duration_ms = None;
                    state.clear_lines();
                });
            }
            BuildEvent::Output { line } => {
                if let Some(line) = line.filter(|line| !line.is_empty()) {
                    self.add_build_line(line);
                }
            }
            BuildEvent::Error { message } => {
                if let Some(message) = message.filter(|message| !message.is_empty()) {
                    self.add_build_line(format!("ERROR: {message}"));
                }
            }
            BuildEvent::Complete {
                success,
                duration_ms,
            } => {
                let success = success.unwrap_or(false);
                info!("build complete: success={success}");
                self.inner.state.send_modify(|state| {
                    state.is_building = false;
                    state.success = Some(success);
                    state.duration_ms = duration_ms;
                });
            }
        }
    }

    pub fn add_build_line(&self, line: impl Into<String>) {
        let line = line.into();
        self.inner.state.send_modify(|state| state.push_line(line));
    }

    pub fn clear_log(&self) {
        self.inner.state.send_modify(BuildState::clear_lines);
    }

    pub fn clear_status(&self) {
        self.inner.state.send_modify(|state| {
            state.success = None;
            state.duration_ms = None;
        });
    }

    /// Back to idle with an empty log. The last app and environment are kept.
    pub fn reset(&self) {
        self.inner.state.send_modify(|state| {
            state.is_building = false;
            state.success = None;
            state.duration_ms = None;
            state.clear_lines();
        });
    }

    pub async fn run_build(&self, app_name: &str, environment: &str, build_flags: &[String]) -> bool {
        let Some(_flight) = self.begin("build") else {
            return false;
        };
        let result = self
            .inner
            .gateway
            .call::<bool>(
                "run_build",
                json!({
                    "appName": app_name,
                    "environment": environment,
                    "buildFlags": build_flags,
                }),
                BUILD_TIMEOUT,
            )
            .await;
        self.verdict("Build failed", result)
    }

    /// Flashes the target. When `upload_port` is given the port is reserved
    /// for the duration and released on every exit path.
    pub async fn run_upload(
        &self,
        app_name: &str,
        environment: &str,
        build_flags: &[String],
        upload_port: Option<&str>,
    ) -> bool {
        let Some(_flight) = self.begin("upload") else {
            return false;
        };

        let lock = match upload_port {
            Some(port) => match self.inner.serial.acquire_upload_lock(port).await {
                Ok(lock) => Some(lock),
                Err(err) => return self.fail("Upload failed", &err),
            },
            None => None,
        };

        let result = self
            .inner
            .gateway
            .call::<bool>(
                "run_upload",
                json!({
                    "appName": app_name,
                    "environment": environment,
                    "buildFlags": build_flags,
                    "uploadPort": upload_port,
                }),
                BUILD_TIMEOUT,
            )
            .await;

        if let Some(lock) = lock {
            let port = lock.port_path().to_string();
            if let Err(err) = lock.release().await {
                warn!("failed to release upload lock on {port}: {err}");
                self.inner.notifier.notify(
                    format!("Failed to release upload lock on {port}: {err}"),
                    Severity::Warning,
                );
            }
        }

        self.verdict("Upload failed", result)
    }

    pub async fn run_tests(&self, app_name: &str, environment: &str) -> bool {
        let Some(_flight) = self.begin("test") else {
            return false;
        };
        let result = self
            .inner
            .gateway
            .call::<bool>(
                "run_tests",
                json!({ "appName": app_name, "environment": environment }),
                BUILD_TIMEOUT,
            )
            .await;
        self.verdict("Tests failed", result)
    }

    /// Clean emits no progress events, so the busy flag is set here and
    /// cleared when the call finishes however it ends.
    pub async fn clean_build(&self, app_name: &str, environment: Option<&str>) -> bool {
        let Some(_flight) = self.begin("clean") else {
            return false;
        };
        self.inner.state.send_modify(|state| state.is_building = true);
        let _building = BuildingFlag(&self.inner.state);

        match self
            .inner
            .gateway
            .call::<bool>(
                "clean_build",
                json!({ "appName": app_name, "environment": environment }),
                CLEAN_TIMEOUT,
            )
            .await
        {
            Ok(success) => success,
            Err(err) => {
                warn!("clean failed: {err}");
                self.add_build_line(format!("Clean failed: {err}"));
                false
            }
        }
    }

    fn begin(&self, operation: &str) -> Option<FlightGuard<'_>> {
        if self.inner.in_flight.swap(true, Ordering::AcqRel) {
            warn!("{operation} rejected: another build operation is in flight");
            self.inner.notifier.notify(
                "A build operation is already in progress",
                Severity::Warning,
            );
            return None;
        }
        Some(FlightGuard(&self.inner.in_flight))
    }

    fn verdict(&self, prefix: &str, result: Result<bool, CoreError>) -> bool {
        match result {
            Ok(success) => success,
            Err(err) => self.fail(prefix, &err),
        }
    }

    fn fail(&self, prefix: &str, err: &CoreError) -> bool {
        warn!("{prefix}: {err}");
        self.inner.state.send_modify(|state| {
            state.push_line(format!("{prefix}: {err}"));
            state.is_building = false;
            state.success = Some(false);
        });
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, Reply};

    fn orchestrator() -> (Arc<FakeBackend>, BuildOrchestrator, Notifier) {
        let backend = FakeBackend::new();
        let gateway = CommandGateway::new(backend.clone());
        let notifier = Notifier::new();
        let serial = SerialSessions::new(gateway.clone(), notifier.clone());
        let build = BuildOrchestrator::new(gateway, serial, notifier.clone());
        (backend, build, notifier)
    }

    fn started(app: &str, env: &str) -> BuildEvent {
        BuildEvent::Started {
            app_name: Some(app.into()),
            environment: Some(env.into()),
        }
    }

    fn output(line: &str) -> BuildEvent {
        BuildEvent::Output {
            line: Some(line.into()),
        }
    }

    #[tokio::test]
    async fn event_sequence_drives_phase() {
        let (_, build, _) = orchestrator();
        assert_eq!(build.snapshot().phase(), BuildPhase::Idle);

        build.handle_event(started("blink", "esp32"));
        build.handle_event(output("Compiling main.cpp"));
        build.handle_event(output(""));
        build.handle_event(BuildEvent::Error {
            message: Some("undefined reference".into()),
        });
        let state = build.snapshot();
        assert_eq!(state.phase(), BuildPhase::Running);
        assert_eq!(state.app_name.as_deref(), Some("blink"));
        assert_eq!(state.lines, ["Compiling main.cpp", "ERROR: undefined reference"]);

        build.handle_event(BuildEvent::Complete {
            success: None,
            duration_ms: Some(1200),
        });
        let state = build.snapshot();
        assert_eq!(state.phase(), BuildPhase::Completed { success: false });
        assert_eq!(state.duration_ms, Some(1200));
    }

    #[tokio::test]
    async fn started_clears_previous_log() {
        let (_, build, _) = orchestrator();
        build.handle_event(started("a", "native"));
        build.handle_event(output("old"));
        build.handle_event(started("b", "native"));
        let state = build.snapshot();
        assert!(state.lines.is_empty());
        assert_eq!(state.appended, 0);
        assert_eq!(state.success, None);
    }

    #[tokio::test]
    async fn log_is_bounded() {
        let (_, build, _) = orchestrator();
        for i in 0..5010 {
            build.add_build_line(format!("line {i}"));
        }
        let state = build.snapshot();
        assert_eq!(state.lines.len(), MAX_LOG_LINES);
        assert_eq!(state.lines.front().map(String::as_str), Some("line 10"));
        assert_eq!(state.lines.back().map(String::as_str), Some("line 5009"));
        assert_eq!(state.appended, 5010);
    }

    #[tokio::test]
    async fn error_event_without_message_is_ignored() {
        let (_, build, _) = orchestrator();
        build.handle_event(BuildEvent::Error { message: None });
        build.handle_event(BuildEvent::Error {
            message: Some(String::new()),
        });
        assert!(build.snapshot().lines.is_empty());
    }

    #[tokio::test]
    async fn clear_log_and_clear_status_are_independent() {
        let (_, build, _) = orchestrator();
        build.handle_event(started("blink", "esp32"));
        build.handle_event(output("linking"));
        build.handle_event(BuildEvent::Complete {
            success: Some(true),
            duration_ms: Some(1000),
        });

        build.clear_log();
        let state = build.snapshot();
        assert!(state.lines.is_empty());
        assert_eq!(state.success, Some(true));
        assert_eq!(state.duration_ms, Some(1000));

        build.add_build_line("again");
        build.clear_status();
        let state = build.snapshot();
        assert_eq!(state.lines, ["again"]);
        assert_eq!(state.success, None);
        assert_eq!(state.duration_ms, None);
    }

    #[tokio::test]
    async fn reset_keeps_app_and_environment() {
        let (_, build, _) = orchestrator();
        build.handle_event(started("blink", "esp32"));
        build.handle_event(output("x"));
        build.reset();
        let state = build.snapshot();
        assert_eq!(state.phase(), BuildPhase::Idle);
        assert!(state.lines.is_empty());
        assert_eq!(state.app_name.as_deref(), Some("blink"));
        assert_eq!(state.environment.as_deref(), Some("esp32"));
    }

    #[tokio::test]
    async fn run_build_sends_flags_and_returns_verdict() {
        let (backend, build, _) = orchestrator();
        backend.on("run_build", Reply::Value(json!(true)));

        let flags = vec!["-DLED_PIN=2".to_string()];
        assert!(build.run_build("blink", "esp32", &flags).await);

        let (command, args) = &backend.calls()[0];
        assert_eq!(command, "run_build");
        assert_eq!(
            args,
            &json!({ "appName": "blink", "environment": "esp32", "buildFlags": ["-DLED_PIN=2"] })
        );
    }

    #[tokio::test]
    async fn run_build_failure_logs_and_marks_failed() {
        let (backend, build, _) = orchestrator();
        backend.on("run_build", Reply::Fail("toolchain missing".into()));

        assert!(!build.run_build("blink", "esp32", &[]).await);
        let state = build.snapshot();
        assert_eq!(state.lines, ["Build failed: toolchain missing"]);
        assert_eq!(state.phase(), BuildPhase::Completed { success: false });
    }

    #[tokio::test(start_paused = true)]
    async fn run_build_times_out_after_ten_minutes() {
        let (backend, build, _) = orchestrator();
        backend.on("run_build", Reply::Never);

        assert!(!build.run_build("blink", "esp32", &[]).await);
        let state = build.snapshot();
        assert_eq!(
            state.lines,
            ["Build failed: Command 'run_build' timed out after 600000ms"]
        );
    }

    #[tokio::test]
    async fn upload_locks_and_releases_the_port() {
        let (backend, build, _) = orchestrator();
        backend.on("run_upload", Reply::Value(json!(true)));

        assert!(build.run_upload("blink", "esp32", &[], Some("/dev/ttyUSB0")).await);
        assert_eq!(
            backend.commands(),
            ["acquire_port_for_upload", "run_upload", "release_upload_lock"]
        );
        assert_eq!(backend.calls()[1].1["uploadPort"], json!("/dev/ttyUSB0"));
    }

    #[tokio::test]
    async fn upload_failure_still_releases_the_port() {
        let (backend, build, _) = orchestrator();
        backend.on("run_upload", Reply::Fail("no device".into()));

        assert!(!build.run_upload("blink", "esp32", &[], Some("/dev/ttyUSB0")).await);
        assert_eq!(
            backend.commands(),
            ["acquire_port_for_upload", "run_upload", "release_upload_lock"]
        );
        assert_eq!(build.snapshot().lines, ["Upload failed: no device"]);
    }

    #[tokio::test]
    async fn upload_aborts_when_lock_is_refused() {
        let (backend, build, _) = orchestrator();
        backend.on("acquire_port_for_upload", Reply::Fail("port in use".into()));

        assert!(!build.run_upload("blink", "esp32", &[], Some("/dev/ttyUSB0")).await);
        assert_eq!(backend.commands(), ["acquire_port_for_upload"]);
        assert_eq!(build.snapshot().lines, ["Upload failed: port in use"]);
    }

    #[tokio::test]
    async fn upload_without_port_skips_locking() {
        let (backend, build, _) = orchestrator();
        backend.on("run_upload", Reply::Value(json!(true)));

        assert!(build.run_upload("blink", "esp32", &[], None).await);
        assert_eq!(backend.commands(), ["run_upload"]);
        assert_eq!(backend.calls()[0].1["uploadPort"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn release_failure_warns_but_keeps_verdict() {
        let (backend, build, notifier) = orchestrator();
        backend.on("run_upload", Reply::Value(json!(true)));
        backend.on("release_upload_lock", Reply::Fail("stale".into()));

        assert!(build.run_upload("blink", "esp32", &[], Some("/dev/ttyUSB0")).await);
        let list = notifier.snapshot();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn tests_failure_uses_its_own_prefix() {
        let (backend, build, _) = orchestrator();
        backend.on("run_tests", Reply::Fail("2 failed".into()));

        assert!(!build.run_tests("blink", "native").await);
        assert_eq!(build.snapshot().lines, ["Tests failed: 2 failed"]);
    }

    #[tokio::test]
    async fn clean_sets_and_clears_busy_flag() {
        let (backend, build, _) = orchestrator();
        backend.on(
            "clean_build",
            Reply::After(Duration::from_millis(20), Box::new(Reply::Value(json!(true)))),
        );
        let mut rx = build.subscribe();

        let task = tokio::spawn({
            let build = build.clone();
            async move { build.clean_build("blink", None).await }
        });
        rx.wait_for(|state| state.is_building).await.unwrap();
        assert!(task.await.unwrap());
        assert!(!build.snapshot().is_building);
        assert_eq!(backend.calls()[0].1, json!({ "appName": "blink", "environment": null }));
    }

    #[tokio::test]
    async fn clean_failure_logs_and_clears_busy_flag() {
        let (backend, build, _) = orchestrator();
        backend.on("clean_build", Reply::Fail("locked".into()));

        assert!(!build.clean_build("blink", Some("esp32")).await);
        let state = build.snapshot();
        assert!(!state.is_building);
        assert_eq!(state.lines, ["Clean failed: locked"]);
    }

    #[tokio::test]
    async fn concurrent_operation_is_rejected() {
        let (backend, build, notifier) = orchestrator();
        backend.on(
            "run_build",
            Reply::After(Duration::from_millis(50), Box::new(Reply::Value(json!(true)))),
        );

        let first = tokio::spawn({
            let build = build.clone();
            async move { build.run_build("blink", "esp32", &[]).await }
        });
        while backend.calls().is_empty() {
            tokio::task::yield_now().await;
        }

        assert!(!build.run_tests("blink", "native").await);
        assert!(first.await.unwrap());
        assert_eq!(backend.commands(), ["run_build"]);
        assert_eq!(notifier.snapshot()[0].severity, Severity::Warning);

        backend.on("run_tests", Reply::Value(json!(true)));
        assert!(build.run_tests("blink", "native").await);
    }
}
