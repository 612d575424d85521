//! Zone host: loads the configured modules, waits for a shutdown signal and
//! then takes the modules down again in reverse order.

mod builtins;
mod cli;
mod config;
mod logging;
mod signals;

use anyhow::Context;
use cli::CliArgs;
use config::{AppConfig, LoaderSettings};
use module_system::{Broker, ConfigSource, ModuleLoader, UnitResolver};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

struct Application {
    config: AppConfig,
    broker: Arc<Broker>,
    loader: ModuleLoader,
}

impl Application {
    fn new(config: AppConfig) -> Self {
        let mut resolver = UnitResolver::new(builtins::builtin_unit());
        if let Some(directory) = &config.loader.unit_directory {
            resolver = resolver.with_unit_directory(directory);
        }

        let broker = Arc::new(Broker::new());
        let loader = ModuleLoader::new(broker.clone(), Arc::new(resolver));
        Self {
            config,
            broker,
            loader,
        }
    }

    async fn run(self) -> anyhow::Result<()> {
        let source = ConfigSource::file(&self.config.loader.modules_file);
        info!("🔌 Loading modules from {}", source);

        let loaded = self
            .loader
            .load_from_config(&source)
            .await
            .with_context(|| format!("loading modules from {source}"))?;
        let attached = self.loader.do_post_load_stage().await?;
        info!(
            "✅ Zone host running with {} modules ({} attached)",
            loaded.len(),
            attached
        );
        for module in self.loader.modules().await {
            info!(
                "  - {} v{} [{}] provides {:?}",
                module.name, module.version, module.unit, module.capabilities
            );
        }
        info!(
            "📊 {} interfaces, {} advisors registered",
            self.broker.interfaces().len(),
            self.broker.advisors().len()
        );
        info!("🛑 Press Ctrl+C to shut down");

        signals::wait_for_shutdown().await?;

        info!("🛑 Shutdown signal received, detaching modules...");
        self.loader.do_pre_unload_stage().await?;
        shutdown(&self.loader, &self.config.loader).await
    }
}

/// Unloads everything, retrying while a module still holds references.
async fn shutdown(loader: &ModuleLoader, settings: &LoaderSettings) -> anyhow::Result<()> {
    let mut attempt = 1;
    loop {
        match loader.unload_all().await {
            Ok(unloaded) => {
                info!("👋 Unloaded {} modules", unloaded.len());
                return Ok(());
            }
            Err(e) if e.is_busy() && attempt < settings.unload_attempts => {
                warn!(
                    "⏳ Unload attempt {}/{} refused: {}",
                    attempt, settings.unload_attempts, e
                );
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(settings.unload_retry_ms)).await;
            }
            Err(e) => return Err(e).context("unloading modules"),
        }
    }
}

async fn start(args: CliArgs) -> anyhow::Result<Application> {
    let (mut config, created) = AppConfig::load_from_file(&args.config_path)
        .await
        .with_context(|| format!("reading {}", args.config_path.display()))?;
    config.apply_cli(&args);
    config.validate().map_err(anyhow::Error::msg)?;

    logging::setup_logging(&config.logging)?;
    info!("🚀 Zone host v{} starting", env!("CARGO_PKG_VERSION"));
    if created {
        info!(
            "Created default configuration file: {}",
            args.config_path.display()
        );
    }

    Ok(Application::new(config))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = CliArgs::parse();

    let app = match start(args).await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("❌ Failed to start zone host: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = app.run().await {
        error!("❌ Zone host error: {:#}", e);
        std::process::exit(1);
    }
}
