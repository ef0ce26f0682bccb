//! Defensiq entry point.
//!
//! `gui` (the default) opens the dashboard; `service` runs the filter
//! headless until interrupted; `install-service` and `uninstall-service`
//! register or remove the Windows service that runs `--mode service`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::runtime::Runtime;
use tracing::{info, warn};

use defensiq::app::{Paths, Services, spawn_feed_refresher, spawn_sampler};
use defensiq::events::EventType;
use defensiq::platform::ServiceManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Gui,
    Service,
    InstallService,
    UninstallService,
}

#[derive(Debug, Parser)]
#[command(name = "defensiq", version, about = "Network security monitor and filter")]
struct Args {
    #[arg(long, value_enum, default_value_t = Mode::Gui)]
    mode: Mode,

    /// Verbose diagnostic logging.
    #[arg(long)]
    debug: bool,

    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = defensiq::config::configured_log_level(&args.config_dir);
    defensiq::logging::init(args.debug, level, Some(&args.log_dir))
        .context("Failed to initialize logging")?;

    let runtime = Runtime::new().context("Failed to start async runtime")?;
    match args.mode {
        Mode::InstallService => runtime.block_on(install_service()),
        Mode::UninstallService => runtime.block_on(uninstall_service()),
        Mode::Service => {
            let services = open_services(&args, &runtime)?;
            runtime.block_on(run_service(services, args.debug))
        }
        Mode::Gui => {
            let services = open_services(&args, &runtime)?;
            run_gui(services, &runtime)
        }
    }
}

fn open_services(args: &Args, runtime: &Runtime) -> Result<Arc<Services>> {
    let paths = Paths {
        config_dir: args.config_dir.clone(),
        log_dir: args.log_dir.clone(),
    };
    let services = Services::open(paths).context("Failed to load configuration")?;

    let metrics = services.config.read(|s| s.metrics.clone());
    defensiq::metrics::init(&metrics).context("Failed to initialize metrics")?;
    if metrics.enabled {
        info!("Metrics enabled on {}", metrics.listen);
    }
    if !services.config.integrity_ok() {
        warn!("settings file changed outside the application");
    }

    runtime
        .block_on(services.initialize())
        .context("Failed to initialize blocklist")?;
    Ok(Arc::new(services))
}

async fn run_service(services: Arc<Services>, debug: bool) -> Result<()> {
    if !services.config.read(|s| s.filtering.enabled) {
        services.events.log(
            EventType::ServiceStarted,
            "Service started in monitoring-only mode (filtering disabled)",
        );
        info!("filtering disabled in settings, nothing to do");
        return Ok(());
    }

    services
        .engine
        .start()
        .context("Failed to start filtering engine")?;
    let sampler = spawn_sampler(Arc::clone(&services));
    let refresher = spawn_feed_refresher(Arc::clone(&services));

    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down...");
        }
    };
    services.supervise(ctrl_c, debug).await;

    sampler.abort();
    refresher.abort();
    services.engine.stop().await;
    services.events.log(EventType::ServiceStopped, "Service stopped");
    info!("Shutdown complete.");
    Ok(())
}

#[cfg(feature = "gui")]
fn run_gui(services: Arc<Services>, runtime: &Runtime) -> Result<()> {
    let _guard = runtime.enter();

    if services.config.read(|s| s.filtering.enabled)
        && let Err(err) = services.engine.start()
    {
        warn!(error = %err, "filtering enabled in settings but the engine did not start");
    }
    let sampler = spawn_sampler(Arc::clone(&services));
    let refresher = spawn_feed_refresher(Arc::clone(&services));

    let result = defensiq::dashboard::gui::run(Arc::clone(&services), runtime.handle().clone());

    sampler.abort();
    refresher.abort();
    runtime.block_on(services.engine.stop());
    services.events.log(EventType::ServiceStopped, "GUI closed");
    result.map_err(|err| anyhow::anyhow!("Dashboard failed: {err}"))
}

#[cfg(not(feature = "gui"))]
fn run_gui(_services: Arc<Services>, _runtime: &Runtime) -> Result<()> {
    anyhow::bail!("this build has no dashboard; rebuild with the `gui` feature or use --mode service")
}

async fn install_service() -> Result<()> {
    let executable = std::env::current_exe().context("Failed to locate executable")?;
    ServiceManager::new()
        .install(&executable)
        .await
        .context("Failed to install service (run as Administrator)")?;
    info!("Service installed: {}", executable.display());
    Ok(())
}

async fn uninstall_service() -> Result<()> {
    ServiceManager::new()
        .uninstall()
        .await
        .context("Failed to uninstall service (run as Administrator)")?;
    info!("Service uninstalled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_default_to_gui_mode() {
        let args = Args::parse_from(["defensiq"]);

        assert_eq!(args.mode, Mode::Gui);
        assert!(!args.debug);
        assert_eq!(args.config_dir, PathBuf::from("config"));
    }

    #[test]
    fn should_parse_service_modes() {
        let args = Args::parse_from(["defensiq", "--mode", "install-service", "--debug"]);

        assert_eq!(args.mode, Mode::InstallService);
        assert!(args.debug);
        assert_eq!(
            Args::parse_from(["defensiq", "--mode", "uninstall-service"]).mode,
            Mode::UninstallService
        );
    }

    #[test]
    fn should_reject_unknown_mode() {
        assert!(Args::try_parse_from(["defensiq", "--mode", "daemon"]).is_err());
    }
}
