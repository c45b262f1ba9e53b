use anyhow::{Context, Result};
use asic_tuner::audit::{AuditSink, FanoutAuditSink, JsonlAuditSink, TracingAuditSink};
use asic_tuner::benchmark::{BenchmarkListener, BenchmarkProgress, CancelHandle};
use asic_tuner::config::{Args, Command, Config, DeviceEntry};
use asic_tuner::device::virtual_device::VirtualDeviceConfig;
use asic_tuner::device::with_timeout;
use asic_tuner::logging::{init_logging, LogConfig};
use asic_tuner::tuner::manager::DeviceHandle;
use asic_tuner::{
    aggregate, BenchmarkEngine, BenchmarkMode, BenchmarkSummary, DeviceClient, HttpDeviceClient, JsonFileStore,
    ProfileResolver, ProfileStore, TunerControl, TunerManager, VirtualDevice,
};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // 解析命令行参数
    let args = Args::parse();

    // 不需要配置文件的命令
    match &args.command {
        Some(Command::InitConfig { force }) => {
            if let Err(e) = init_config(&args.config, *force) {
                eprintln!("❌ {:#}", e);
                std::process::exit(1);
            }
            return;
        }
        Some(Command::Profile { chip, device }) => {
            print_profile(chip.as_deref(), device.as_deref());
            return;
        }
        _ => {}
    }

    // 加载配置
    let config = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("❌ Failed to load config: {:#}", e);
            std::process::exit(1);
        }
    };

    // 初始化日志系统
    let level = if args.debug { Some("debug") } else { args.log_level.as_deref() };
    let _log_guard = match LogConfig::from_general(&config.general, level, args.json_logs).and_then(init_logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };

    info!("🚀 Starting {} v{}", asic_tuner::NAME, asic_tuner::VERSION);
    info!("📋 Configuration loaded from: {}", args.config);

    let result = match args.command {
        Some(Command::Benchmark { device, mode, simulate }) => {
            let mode = mode.unwrap_or(config.benchmark.mode);
            run_benchmark(&config, &device, mode, simulate).await
        }
        Some(Command::Run { simulate }) => run_tuner(&config, simulate).await,
        None => run_tuner(&config, false).await,
        Some(Command::InitConfig { .. }) | Some(Command::Profile { .. }) => Ok(()),
    };

    if let Err(e) = result {
        error!("❌ {:#}", e);
        std::process::exit(1);
    }
}

fn init_config(path: &str, force: bool) -> Result<()> {
    if Path::new(path).exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path);
    }
    Config::default().save(path)?;
    println!("✅ Wrote default configuration to {}", path);
    Ok(())
}

fn print_profile(chip: Option<&str>, device: Option<&str>) {
    let resolved = ProfileResolver::default().resolve(chip, device);
    match serde_json::to_string_pretty(&resolved) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("❌ Failed to render profile: {}", e),
    }
}

fn build_audit(config: &Config) -> Result<Arc<dyn AuditSink>> {
    let mut fanout = FanoutAuditSink::new().with(Arc::new(TracingAuditSink));
    if let Some(path) = &config.general.audit_log {
        let sink = JsonlAuditSink::open(path).context("Failed to open audit log")?;
        fanout = fanout.with(Arc::new(sink));
    }
    Ok(Arc::new(fanout))
}

/// 调优进程和基准测试进程共用数据目录下的暂停标记
fn build_control(config: &Config) -> TunerControl {
    TunerControl::new().with_marker_dir(config.general.data_dir.join("control"))
}

fn build_client(entry: &DeviceEntry, timeout: Duration, simulate: bool) -> Result<Arc<dyn DeviceClient>> {
    if simulate {
        info!("🧪 Using simulated device for {}", entry.id);
        return Ok(Arc::new(VirtualDevice::new(entry.id.clone(), VirtualDeviceConfig::default())));
    }
    let client = HttpDeviceClient::with_timeout(entry.id.clone(), &entry.address, timeout)
        .with_context(|| format!("Invalid address for device {}", entry.id))?;
    Ok(Arc::new(client))
}

async fn run_tuner(config: &Config, simulate: bool) -> Result<()> {
    let timeout = Duration::from_secs(config.http.timeout_secs);
    let store = JsonFileStore::new(&config.general.data_dir).context("Failed to open data directory")?;
    let mut manager = TunerManager::new(
        config.tuner.clone(),
        ProfileResolver::default(),
        build_control(config),
        build_audit(config)?,
    )
    .with_store(Arc::new(store))
    .with_io_timeout(timeout);

    for entry in config.devices.iter().filter(|d| d.auto_tune) {
        let client = build_client(entry, timeout, simulate)?;
        manager.spawn_device(
            DeviceHandle {
                device_id: entry.id.clone(),
                chip_model: entry.chip_model.clone(),
                device_model: entry.device_model.clone(),
            },
            client,
        );
    }

    if manager.device_count() == 0 {
        anyhow::bail!("No devices have auto_tune enabled");
    }
    info!("✅ Tuning {} device(s)", manager.device_count());

    wait_for_shutdown().await;
    info!("🛑 Received shutdown signal");

    for report in manager.stop().await {
        info!(
            "📊 {}: {} ticks, {} adjustments, {} errors",
            report.device_id, report.ticks, report.adjustments, report.errors.total_errors
        );
    }
    info!("👋 Tuner stopped gracefully");
    Ok(())
}

async fn run_benchmark(config: &Config, device_id: &str, mode: BenchmarkMode, simulate: bool) -> Result<()> {
    let entry = config
        .device(device_id)
        .with_context(|| format!("Device '{}' is not configured", device_id))?;
    let timeout = Duration::from_secs(config.http.timeout_secs);
    let client = build_client(entry, timeout, simulate)?;
    let store = JsonFileStore::new(&config.general.data_dir).context("Failed to open data directory")?;

    // 配置中的型号优先，其次设备上报
    let info = match with_timeout(device_id, timeout, client.get_info()).await {
        Ok(info) => Some(info),
        Err(e) => {
            warn!("Could not identify {}: {}", device_id, e);
            None
        }
    };
    let chip = entry
        .chip_model
        .clone()
        .or_else(|| info.as_ref().and_then(|i| i.asic_model.clone()));
    let device = entry
        .device_model
        .clone()
        .or_else(|| info.as_ref().and_then(|i| i.device_descriptor().map(str::to_string)));
    let mut resolved = ProfileResolver::default().resolve(chip.as_deref(), device.as_deref());
    if let Some(info) = &info {
        resolved = resolved.with_reported_topology(info);
    }
    if let Some(warning) = &resolved.warning {
        warn!("⚠️ {}", warning);
    }

    let cancel = CancelHandle::new();
    let engine = BenchmarkEngine::new(device_id, client, resolved.bounds, config.benchmark.clone())
        .with_audit(build_audit(config)?)
        .with_listener(Arc::new(LogListener))
        .with_cancel(cancel.clone())
        .with_control(build_control(config))
        .with_io_timeout(timeout);

    // Ctrl+C 只取消扫描，设置仍会被写回
    tokio::spawn(async move {
        wait_for_shutdown().await;
        warn!("🛑 Cancelling benchmark, restoring settings...");
        cancel.cancel();
    });

    let summary = engine.run(mode).await;
    report_summary(&summary);

    let profile = aggregate(&summary, device_id);
    store.save_profile(&profile).context("Failed to save benchmark profile")?;
    info!("💾 Benchmark profile saved for {}", device_id);

    if let Some(e) = &summary.restore_error {
        anyhow::bail!("Benchmark finished but settings could not be restored: {}", e);
    }
    Ok(())
}

fn report_summary(summary: &BenchmarkSummary) {
    info!(
        "🏁 {} benchmark: {} ({} results)",
        summary.mode,
        summary.stop_reason,
        summary.results.len()
    );
    if let Some(detail) = &summary.stop_detail {
        info!("   {}", detail);
    }
    for (rank, result) in summary.top_by_hashrate.iter().enumerate() {
        info!(
            "   #{} {}: {:.1} GH/s, {} {}",
            rank + 1,
            result.settings(),
            result.hashrate,
            result.efficiency.map(|e| format!("{:.2} J/TH", e)).unwrap_or_else(|| "-".to_string()),
            if result.stable { "stable" } else { "unstable" }
        );
    }
    if let Some(applied) = summary.applied_settings {
        info!("✅ Device left at {}", applied);
    }
}

/// 进度写入日志
struct LogListener;

impl BenchmarkListener for LogListener {
    fn on_progress(&self, progress: &BenchmarkProgress) {
        info!("⏳ [{}] #{} {}", progress.device_id, progress.iteration, progress.message);
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to create SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Error waiting for signal: {}", e);
    }
}
