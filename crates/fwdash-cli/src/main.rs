mod config;

use std::{future::Future, sync::Arc};

use clap::{Args, Parser, Subcommand};
use fwdash_core::{
    pins::PinPurpose,
    platform::platform_label,
    pump_events,
    types::{AppInfo, DiscoveredEnvironment},
    BuildState, Console, EventRouter, GrpcBackend, JsonPreferences, PreferenceStore,
};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::CliConfig;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "fwdash", version, about = "Firmware console CLI")]
struct Cli {
    /// Bridge address (defaults to FWDASH_BRIDGE_ADDR or the saved config)
    #[arg(long, global = true)]
    addr: Option<String>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Args)]
struct Target {
    /// App name; falls back to the last selected app
    #[arg(long)]
    app: Option<String>,
    #[arg(long = "env")]
    environment: String,
}

#[derive(Args)]
struct Defines {
    /// Start from a saved profile
    #[arg(long)]
    profile: Option<String>,
    /// Define override, NAME=VALUE
    #[arg(short = 'D', long = "define", value_parser = parse_define)]
    defines: Vec<(String, String)>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Build an app and stream the log
    Build {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        defines: Defines,
    },
    /// Build and flash an app
    Upload {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        defines: Defines,
        /// Serial port to flash through; falls back to the last used port
        #[arg(long)]
        port: Option<String>,
    },
    /// Run an app's tests
    Test {
        #[command(flatten)]
        target: Target,
    },
    /// Remove build output
    Clean {
        #[arg(long)]
        app: Option<String>,
        #[arg(long = "env")]
        environment: Option<String>,
    },
    /// List serial ports
    Ports,
    /// Open a serial port and print its output until Ctrl-C
    Monitor {
        #[arg(long)]
        port: Option<String>,
        #[arg(long)]
        baud: Option<u32>,
    },
    /// Saved define profiles
    Profiles {
        #[command(subcommand)]
        cmd: ProfilesCmd,
    },
    /// GPIO pin checks
    Pins {
        #[command(subcommand)]
        cmd: PinsCmd,
    },
}

#[derive(Subcommand)]
enum ProfilesCmd {
    List {
        #[arg(long)]
        app: Option<String>,
    },
    Show {
        #[arg(long)]
        app: Option<String>,
        name: String,
    },
    /// Save the given defines as a profile
    Save {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        defines: Defines,
        name: String,
    },
    Delete {
        #[arg(long)]
        app: Option<String>,
        name: String,
    },
}

#[derive(Subcommand)]
enum PinsCmd {
    /// Check whether a pin suits a purpose
    Validate {
        pin: String,
        #[arg(long)]
        purpose: PinPurpose,
        #[arg(long)]
        platform: String,
        #[arg(long)]
        module: Option<String>,
    },
    /// List pins that are safe to use
    Safe {
        #[arg(long)]
        platform: String,
        #[arg(long)]
        module: Option<String>,
    },
}

fn parse_define(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> CliResult<()> {
    fwdash_util::init_tracing()?;
    let cli = Cli::parse();
    let mut cfg = CliConfig::load();

    let addr = cli.addr.clone().unwrap_or_else(|| cfg.bridge_addr.clone());
    let backend = GrpcBackend::connect(&addr).await?;
    let prefs: Arc<dyn PreferenceStore> = Arc::new(JsonPreferences::open_default());
    let console = Console::new(Arc::new(backend.clone()), prefs);

    let result = run(cli.cmd, &console, &backend, &mut cfg).await;
    for notification in console.notifier().snapshot() {
        eprintln!("[{:?}] {}", notification.severity, notification.message);
    }
    result
}

async fn run(
    cmd: Cmd,
    console: &Console,
    backend: &GrpcBackend,
    cfg: &mut CliConfig,
) -> CliResult<()> {
    match cmd {
        Cmd::Build { target, defines } => {
            let app = resolve_app(console, target.app.as_deref())?;
            let flags = prepare_flags(console, &app, &target.environment, &defines).await?;
            let job = console.build().run_build(&app, &target.environment, &flags);
            expect_success("build", stream_job(console, backend, job).await?)
        }

        Cmd::Upload {
            target,
            defines,
            port,
        } => {
            let app = resolve_app(console, target.app.as_deref())?;
            let flags = prepare_flags(console, &app, &target.environment, &defines).await?;
            let port = port.or_else(|| cfg.last_port().map(str::to_string));
            let job = console
                .build()
                .run_upload(&app, &target.environment, &flags, port.as_deref());
            let ok = stream_job(console, backend, job).await?;
            if let (true, Some(port)) = (ok, port) {
                cfg.last_port = port;
                cfg.save()?;
            }
            expect_success("upload", ok)
        }

        Cmd::Test { target } => {
            let app = resolve_app(console, target.app.as_deref())?;
            let job = console.build().run_tests(&app, &target.environment);
            expect_success("test", stream_job(console, backend, job).await?)
        }

        Cmd::Clean { app, environment } => {
            let app = resolve_app(console, app.as_deref())?;
            let job = console.build().clean_build(&app, environment.as_deref());
            expect_success("clean", stream_job(console, backend, job).await?)
        }

        Cmd::Ports => {
            for port in console.serial().refresh_ports().await {
                println!(
                    "{}\t{}\t{}",
                    port.path,
                    port.port_type,
                    port.manufacturer.unwrap_or_default()
                );
            }
            Ok(())
        }

        Cmd::Monitor { port, baud } => {
            let port = port
                .or_else(|| cfg.last_port().map(str::to_string))
                .ok_or("no --port given and no port used before")?;
            let baud = baud.unwrap_or(cfg.default_baud);
            monitor(console, backend, &port, baud).await?;
            cfg.last_port = port;
            cfg.save()?;
            Ok(())
        }

        Cmd::Profiles { cmd } => match cmd {
            ProfilesCmd::List { app } => {
                let app = resolve_app(console, app.as_deref())?;
                for name in console.profiles().load_profiles(&app).await {
                    println!("{name}");
                }
                Ok(())
            }
            ProfilesCmd::Show { app, name } => {
                let app = resolve_app(console, app.as_deref())?;
                let profile = console.profiles().load_profile(&app, &name).await?;
                println!("{}", serde_json::to_string_pretty(&profile)?);
                Ok(())
            }
            ProfilesCmd::Save {
                target,
                defines,
                name,
            } => {
                let app = resolve_app(console, target.app.as_deref())?;
                prepare_flags(console, &app, &target.environment, &defines).await?;
                let profile = console.profiles().save_profile(&name).await?;
                println!("saved {} ({} defines)", profile.name, profile.defines.len());
                Ok(())
            }
            ProfilesCmd::Delete { app, name } => {
                let app = resolve_app(console, app.as_deref())?;
                console.profiles().delete_profile(&app, &name).await?;
                println!("deleted {name}");
                Ok(())
            }
        },

        Cmd::Pins { cmd } => match cmd {
            PinsCmd::Validate {
                pin,
                purpose,
                platform,
                module,
            } => {
                let verdict = console
                    .pins()
                    .validate_pin(&pin, purpose, &platform, module.as_deref())
                    .await;
                println!(
                    "valid={} severity={:?} {}",
                    verdict.valid, verdict.severity, verdict.message
                );
                Ok(())
            }
            PinsCmd::Safe { platform, module } => {
                let pins = console.pins().safe_pins(&platform, module.as_deref()).await;
                let list: Vec<String> = pins.iter().map(u8::to_string).collect();
                println!("{}: {}", platform_label(&platform), list.join(", "));
                Ok(())
            }
        },
    }
}

/// Uses the given app and remembers it, or falls back to the remembered one.
fn resolve_app(console: &Console, app: Option<&str>) -> CliResult<String> {
    let selection = console.selection();
    if let Some(app) = app {
        selection.select(Some(app));
        selection.flush();
        return Ok(app.to_string());
    }
    selection
        .stored()
        .ok_or_else(|| "no --app given and no app selected before".into())
}

async fn prepare_flags(
    console: &Console,
    app: &str,
    environment: &str,
    defines: &Defines,
) -> CliResult<Vec<String>> {
    let profiles = console.profiles();
    profiles.init_config(
        &AppInfo {
            name: app.to_string(),
            ..AppInfo::default()
        },
        &DiscoveredEnvironment {
            name: environment.to_string(),
            ..DiscoveredEnvironment::default()
        },
    );
    if let Some(name) = &defines.profile {
        let profile = profiles.load_profile(app, name).await?;
        profiles.apply_profile(&profile);
    }
    for (name, value) in &defines.defines {
        profiles.update_define(name, value);
    }
    Ok(profiles.generate_build_flags())
}

fn expect_success(what: &str, ok: bool) -> CliResult<()> {
    if ok {
        Ok(())
    } else {
        Err(format!("{what} failed").into())
    }
}

/// Runs a build-like job while printing its log as events arrive.
async fn stream_job<F>(console: &Console, backend: &GrpcBackend, job: F) -> CliResult<bool>
where
    F: Future<Output = bool>,
{
    let stream = backend.subscribe(&EventRouter::channels()).await?;
    let pump = tokio::spawn(pump_events(stream, console.router()));

    let mut rx = console.build().subscribe();
    let mut printed = 0;
    tokio::pin!(job);
    let ok = loop {
        tokio::select! {
            ok = &mut job => break ok,
            Ok(()) = rx.changed() => print_new_lines(&rx.borrow_and_update(), &mut printed),
        }
    };
    print_new_lines(&console.build().snapshot(), &mut printed);
    pump.abort();
    Ok(ok)
}

fn print_new_lines(state: &BuildState, printed: &mut u64) {
    if state.appended < *printed {
        *printed = 0;
    }
    let fresh = (state.appended - *printed) as usize;
    let skip = state.lines.len().saturating_sub(fresh);
    for line in state.lines.iter().skip(skip) {
        println!("{line}");
    }
    *printed = state.appended;
}

async fn monitor(
    console: &Console,
    backend: &GrpcBackend,
    port: &str,
    baud: u32,
) -> CliResult<()> {
    let stream = backend.subscribe(&EventRouter::channels()).await?;
    let pump = tokio::spawn(pump_events(stream, console.router()));

    let serial = console.serial();
    let connection_id = serial.open(port, baud).await?;
    eprintln!("connected to {port} at {baud} baud, Ctrl-C to quit");

    let mut buffers = serial.subscribe_buffers();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut printed = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = buffers.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = buffers.borrow_and_update().get(&connection_id).cloned();
                let Some(buffer) = snapshot else {
                    eprintln!("connection closed");
                    break;
                };
                let fresh = (buffer.received - printed) as usize;
                let skip = buffer.lines.len().saturating_sub(fresh);
                for line in buffer.lines.iter().skip(skip) {
                    println!("{line}");
                }
                printed = buffer.received;
            }
            line = stdin.next_line() => match line? {
                Some(line) => {
                    if let Err(err) = serial.write(&connection_id, &format!("{line}\n")).await {
                        eprintln!("write failed: {err}");
                    }
                }
                None => break,
            },
        }
    }

    if serial.buffer(&connection_id).is_some() {
        if let Err(err) = serial.close(&connection_id).await {
            eprintln!("close failed: {err}");
        }
    }
    pump.abort();
    Ok(())
}
