//! counterd - visitor counting daemon
//!
//! This daemon:
//! 1. Loads configuration (file, then environment, then command line)
//! 2. Opens the visitor database and serves the status API
//! 3. Replays the detection source at the configured frame rate
//! 4. Counts right-to-left line crossings, persisting each one
//! 5. Exports count events periodically and once more on shutdown

use anyhow::{anyhow, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use visitor_counter::{
    api::{ApiConfig, ApiServer},
    config::CounterConfig,
    Clock, CountingEngine, DetectorBackend, Exporter, FeatureExtractor, HistogramExtractor,
    ReplayBackend, SqliteEventStore, SystemClock,
};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "COUNTER_CONFIG")]
    config: Option<PathBuf>,
    /// Detection log to replay (JSON lines).
    #[arg(long)]
    source: Option<PathBuf>,
    /// Detection confidence threshold.
    #[arg(long = "conf-thres")]
    conf_thres: Option<f32>,
    /// Export artifact path.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Visitor database path.
    #[arg(long)]
    db: Option<String>,
    /// Status API port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = load_config(&args)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = SqliteEventStore::open(&cfg.db_path)?;
    let extractor: Option<Box<dyn FeatureExtractor>> = if cfg.reid.enabled {
        Some(Box::new(HistogramExtractor::new()))
    } else {
        None
    };
    let mut engine = CountingEngine::new(cfg.engine_config(), Box::new(store), clock.clone(), extractor);

    let exporter = Arc::new(Mutex::new(Exporter::new(
        Box::new(SqliteEventStore::open(&cfg.db_path)?),
        cfg.export.path.clone(),
        clock,
    )));

    let api_handle = if cfg.api.enabled {
        let api_config = ApiConfig {
            addr: cfg.api.addr.clone(),
        };
        let handle = ApiServer::new(api_config, engine.status_handle(), exporter.clone()).spawn()?;
        log::info!("status api listening on {}", handle.addr);
        Some(handle)
    } else {
        None
    };

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!(
        "counterd running. source={} db={} reid={}",
        cfg.source_path.display(),
        cfg.db_path,
        cfg.reid.enabled
    );

    let outcome = run(&cfg, &mut engine, &exporter, &rx);
    if let Err(e) = &outcome {
        log::error!("counting loop stopped: {}", e);
    }

    // Every exit path lands here.
    if let Err(e) = engine.shutdown() {
        log::error!("shutdown flush incomplete: {}", e);
    }
    if cfg.export.enabled {
        export_now(&exporter);
    }
    let stats = engine.stats();
    log::info!(
        "final count: total={} left={} right={} frames={}",
        stats.total,
        stats.total_left,
        stats.total_right,
        engine.frames_processed()
    );
    if let Some(handle) = api_handle {
        handle.stop()?;
    }
    outcome
}

fn load_config(args: &Args) -> Result<CounterConfig> {
    let mut cfg = CounterConfig::load_from(args.config.as_deref())?;
    if let Some(source) = &args.source {
        cfg.source_path = source.clone();
    }
    if let Some(conf) = args.conf_thres {
        cfg.detection.conf_threshold = conf;
    }
    if let Some(output) = &args.output {
        cfg.export.path = output.clone();
    }
    if let Some(db) = &args.db {
        cfg.db_path = db.clone();
    }
    if let Some(port) = args.port {
        let mut addr: SocketAddr = cfg
            .api
            .addr
            .parse()
            .map_err(|e| anyhow!("invalid api address '{}': {}", cfg.api.addr, e))?;
        addr.set_port(port);
        cfg.api.addr = addr.to_string();
    }
    cfg.validate()?;
    Ok(cfg)
}

fn run(
    cfg: &CounterConfig,
    engine: &mut CountingEngine,
    exporter: &Mutex<Exporter>,
    shutdown: &mpsc::Receiver<()>,
) -> Result<()> {
    let mut source = ReplayBackend::open(&cfg.source_path)?;
    source.warm_up()?;
    log::info!("detector backend: {}", source.name());

    let frame_interval = Duration::from_secs_f64(1.0 / f64::from(cfg.camera.fps));
    let mut last_export = Instant::now();
    let mut last_health_log = Instant::now();

    loop {
        if shutdown.try_recv().is_ok() {
            log::info!("shutdown signal received");
            return Ok(());
        }
        let frame_start = Instant::now();

        let Some(output) = source.next_output()? else {
            log::info!("end of detection stream");
            return Ok(());
        };

        match engine.process_frame(&output.detections, output.frame.as_ref()) {
            Ok(report) => {
                for event in &report.events {
                    log::info!("{} (total {})", event.note(), event.total);
                }
                if report.held_events > 0 && !report.events.is_empty() {
                    log::warn!(
                        "{} count event(s) held in memory; export deferred",
                        report.held_events
                    );
                }
            }
            Err(e) => log::error!("frame skipped: {}", e),
        }

        if cfg.export.enabled && last_export.elapsed() >= cfg.export.auto_save_interval {
            if engine.held_events() == 0 {
                export_now(exporter);
            } else {
                log::warn!("auto-export deferred: {} event(s) held", engine.held_events());
            }
            last_export = Instant::now();
        }

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            let stats = engine.stats();
            log::info!(
                "health frames={} total={} active={} held={}",
                engine.frames_processed(),
                stats.total,
                engine.tracker().len(),
                engine.held_events()
            );
            last_health_log = Instant::now();
        }

        if let Some(rest) = frame_interval.checked_sub(frame_start.elapsed()) {
            std::thread::sleep(rest);
        }
    }
}

fn export_now(exporter: &Mutex<Exporter>) {
    let result = match exporter.lock() {
        Ok(mut exporter) => exporter.export(),
        Err(_) => Err(anyhow!("exporter lock poisoned")),
    };
    if let Err(e) = result {
        log::error!("export failed: {}", e);
    }
}
