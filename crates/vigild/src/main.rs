//! vigild - controlled-failure and recovery daemon.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vigil_common::{ExitCode, ModuleCriticality};
use vigild::config::{DaemonConfig, CONFIG_PATH};
use vigild::guardian::{HealthCheckable, HealthFuture, ModuleRegistry};
use vigild::monitor::ProcessExit;
use vigild::supervision::SupervisionAdapter;
use vigild::{DaemonContext, IdleCycle};

#[derive(Parser, Debug)]
#[command(name = "vigild", version, about = "Controlled-failure and recovery daemon")]
struct Args {
    /// Configuration file path.
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Override the control socket path from configuration.
    #[arg(long)]
    socket: Option<String>,
}

/// Built-in decision authority. Real deployments register their own
/// modules; the always-healthy core keeps the single-authority
/// invariant satisfied for the bare daemon.
struct CoreModule;

impl HealthCheckable for CoreModule {
    fn check_health(&self) -> HealthFuture<'_> {
        Box::pin(async { Ok(()) })
    }
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("vigild v{} starting", env!("CARGO_PKG_VERSION"));

    let supervision = SupervisionAdapter::from_env();

    let mut config = match DaemonConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            supervision.exit_with(ExitCode::ConfigError, &e.to_string());
        }
    };
    if let Some(socket) = args.socket {
        config.control.socket_path = socket;
    }

    let mut modules = ModuleRegistry::new();
    modules.register("core", ModuleCriticality::Critical, 5.0, true, Arc::new(CoreModule));

    let ctx = DaemonContext::build(config, modules, supervision);

    // Single-threaded on purpose: a blocking operation anywhere in the
    // business cycle genuinely stalls the scheduler, so the chaos
    // patterns exercise the same failure the monitors exist to catch.
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            ctx.supervision
                .exit_with(ExitCode::Critical, &format!("runtime construction failed: {}", e));
        }
    };

    let mut cycle = IdleCycle;
    let code = runtime.block_on(vigild::daemon::run(&ctx, &mut cycle, Arc::new(ProcessExit)));
    ctx.supervision.exit_with(code, "daemon loop ended");
}
