// =============================================================================
// XR RENDERER - session lifecycle and frame submission for head-mounted displays
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  XrApp (startup sequence + main loop)                            │
// │    ├── SessionStateMachine (runtime-driven lifecycle)           │
// │    └── FrameCoordinator (wait -> begin -> compose -> end)       │
// │          ├── SwapchainPool per view (acquire/wait/release)      │
// │          └── GraphicsBackend (headless or Vulkan)               │
// │  Runtime: simulated (default) or OpenXR (feature "openxr")     │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Poll one runtime event, advance the session state
// 2. Wait for the next frame slot, begin the frame
// 3. Locate views; for each view acquire, wait, draw, release
// 4. End the frame with one projection layer (or none)
//
// =============================================================================

mod app;
mod backend;
mod config;
mod error;
mod runtime;
mod session;

use anyhow::Result;
use std::fs::OpenOptions;
use std::io::Write;

use app::XrApp;
use backend::device::DeviceRequirements;
use backend::vulkan::VulkanTargets;
use backend::{GraphicsBackend, HeadlessBackend, VulkanBackend, VulkanDevice};
use config::Config;
use runtime::simulated::SimulatedRuntime;
use runtime::Runtime;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let (config, source) = Config::load();

    // Initialize logging, then report how the configuration was found
    init_logging(&config);
    source.report(&config);
    log::info!("Starting {}", config.app.name);
    log::info!(
        "Runtime: {}, view configuration: {:?}",
        config.runtime.backend,
        config.view_configuration()
    );

    match config.runtime.backend.as_str() {
        "openxr" => run_openxr(&config),
        other => {
            if other != "simulated" {
                log::warn!("Unknown runtime backend '{}', using simulated", other);
            }
            run_simulated(&config)
        }
    }
}

fn run_app<R: Runtime, B: GraphicsBackend>(runtime: R, backend: B, config: &Config) -> Result<()> {
    let mut app = XrApp::new(runtime, backend, config)?;
    app.run()?;
    Ok(())
}

fn run_simulated(config: &Config) -> Result<()> {
    let simulation = config.simulation.clone();
    match config.graphics.backend.as_str() {
        "vulkan" => {
            let requirements = DeviceRequirements::standalone(&config.app.name, config.graphics.validation_layers);
            let device = VulkanDevice::new(&requirements)?;
            let runtime = SimulatedRuntime::with_targets(simulation, Box::new(VulkanTargets::new(device.clone())));
            run_app(runtime, VulkanBackend::new(device, config.graphics.clear_color), config)
        }
        other => {
            if other != "headless" {
                log::warn!("Unknown graphics backend '{}', using headless", other);
            }
            run_app(SimulatedRuntime::new(simulation), HeadlessBackend::new(), config)
        }
    }
}

#[cfg(feature = "openxr")]
fn run_openxr(config: &Config) -> Result<()> {
    let (runtime, device) =
        runtime::openxr::OpenXrRuntime::new(&config.app.name, config.graphics.validation_layers)?;
    run_app(runtime, VulkanBackend::new(device, config.graphics.clear_color), config)
}

#[cfg(not(feature = "openxr"))]
fn run_openxr(_config: &Config) -> Result<()> {
    Err(error::XrError::Unsupported("built without the \"openxr\" feature".to_string()).into())
}

// =============================================================================
// LOGGING
// =============================================================================

fn init_logging(config: &Config) {
    use env_logger::Builder;

    // RUST_LOG still wins over the configured level
    let level = config.log_level();
    let mut builder = Builder::new();
    builder.filter_level(level.unwrap_or(log::LevelFilter::Info));
    builder.parse_default_env();
    builder.init();

    if level.is_none() {
        log::warn!("Unknown log level '{}', defaulting to info", config.debug.log_level);
    }

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== XR Renderer Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}
