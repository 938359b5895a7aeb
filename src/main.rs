use animcache::cli::Args;
use animcache::config::{self, AppConfig};
use animcache::core::cache_events::{CacheChangedEvent, PopulatorStateChangedEvent};
use animcache::core::color::SrgbConverter;
use animcache::core::workers::Workers;
use animcache::sim::{SimEngine, SimEngineConfig, SimHost, SimImage};
use animcache::{
    downcast_event, AnimatedImage, Bounds, CachePopulator, CacheRegistry, EventBus, FrameCache, KeyframeChannel,
    TimeRange,
};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::bounded;
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Main loop period: bus polling and playback simulation
const FRAME_PERIOD: Duration = Duration::from_millis(40);
/// How long a simulated stroke keeps the host busy
const STROKE_TIME: Duration = Duration::from_millis(60);

struct Document {
    image: Arc<SimImage>,
    cache: Arc<FrameCache>,
}

#[derive(Default)]
struct EventCounts {
    cache_changes: usize,
    state_changes: usize,
}

fn init_logging(args: &Args, path_config: &config::PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| config::data_file(config::LOG_FILE, path_config));

        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging (respects RUST_LOG if set)
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn drain_bus(bus: &EventBus, counts: &mut EventCounts) {
    for event in bus.poll() {
        if let Some(e) = downcast_event::<CacheChangedEvent>(&event) {
            counts.cache_changes += 1;
            debug!("Cache {} changed: {:?}", e.image, e.change);
        } else if let Some(e) = downcast_event::<PopulatorStateChangedEvent>(&event) {
            counts.state_changes += 1;
            debug!("Populator {:?} -> {:?}", e.old, e.new);
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path_config = config::PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = config::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }

    init_logging(&args, &path_config)?;
    info!("animcache v{} starting...", env!("CARGO_PKG_VERSION"));
    debug!("Command-line args: {:?}", args);

    let config_path = config::config_file(config::CONFIG_FILE, &path_config);
    info!("Config path: {}", config_path.display());
    let app_config = AppConfig::load(&config_path)?;

    if args.write_config {
        app_config.save(&config_path)?;
        println!("Configuration written to {}", config_path.display());
        return Ok(());
    }

    if args.frames < 1 {
        anyhow::bail!("--frames must be at least 1, got {}", args.frames);
    }

    // Shared infrastructure
    let bus = EventBus::new();
    let registry = CacheRegistry::new(bus.emitter());
    let workers = Arc::new(Workers::new(app_config.worker_threads()).context("Failed to spawn conversion workers")?);
    let host = SimHost::new();

    let populator = CachePopulator::new(
        app_config.populator.clone(),
        Arc::clone(&registry),
        host.clone(),
        Arc::new(SrgbConverter),
        Arc::clone(&workers),
        &bus,
        Instant::now(),
    );

    let engine = SimEngine::start(
        SimEngineConfig {
            render_time: Duration::from_millis(args.render_ms),
            lose_every: args.lose_every,
        },
        Arc::clone(&registry),
        populator.notifier(),
    )
    .context("Failed to start render engine")?;

    // Open documents
    let clip = TimeRange::new(0, args.frames - 1);
    let documents: Vec<Document> = (0..args.documents)
        .map(|_| {
            let image = engine.create_image(Bounds::new(0, 0, args.width(), args.height()), clip);
            let cache = registry.get_cache_for(image.clone());
            Document { image, cache }
        })
        .collect();
    info!(
        "{} documents, {} frames each at {}x{}, {} conversion threads",
        documents.len(),
        args.frames,
        args.width(),
        args.height(),
        workers.num_threads()
    );

    if let Some(first) = documents.first() {
        host.set_active_image(Some(first.image.uuid()));
    }
    host.set_active_node(vec![KeyframeChannel::with_keys("content", [0, args.frames / 2])]);

    // Controller thread
    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
    let controller = thread::Builder::new()
        .name("animcache-populator".into())
        .spawn(move || populator.run(shutdown_rx))
        .context("Failed to spawn populator thread")?;

    // Simulated user: playback on the active document plus periodic strokes
    let started = Instant::now();
    let run_for = Duration::from_secs_f64(args.duration.max(0.0));
    let stroke_every = Duration::from_millis(args.stroke_every);
    let mut next_stroke = started + stroke_every;
    let mut strokes = 0usize;
    let mut counts = EventCounts::default();
    let mut playhead = 0;

    while started.elapsed() < run_for {
        thread::sleep(FRAME_PERIOD);
        drain_bus(&bus, &mut counts);

        if documents.is_empty() {
            continue;
        }
        let active = &documents[strokes % documents.len()];

        playhead = (playhead + 1) % args.frames;
        host.set_current_time(playhead);
        let _ = active.cache.fetch(playhead);

        if args.stroke_every > 0 && Instant::now() >= next_stroke {
            next_stroke += stroke_every;
            strokes += 1;
            let target = &documents[strokes % documents.len()];
            host.set_active_image(Some(target.image.uuid()));

            let at = ((strokes * 7) as i32).rem_euclid(args.frames);
            host.set_stroke_active(true);
            thread::sleep(STROKE_TIME);
            target.cache.invalidate(TimeRange::new(at, at + 2));
            host.set_stroke_active(false);
            info!("Stroke #{} on {} at frame {}", strokes, target.image.uuid(), at);
        }
    }

    let _ = shutdown_tx.send(());
    let stats = match controller.join() {
        Ok(stats) => stats,
        Err(_) => {
            warn!("Populator thread panicked");
            Default::default()
        }
    };
    let rendered = engine.stop();
    drain_bus(&bus, &mut counts);

    println!("animcache: {:.1}s, {} strokes, {} frames rendered", run_for.as_secs_f64(), strokes, rendered);
    for (i, doc) in documents.iter().enumerate() {
        println!(
            "  doc {}: {}/{} frames cached, {:.1} MB, hit rate {:.0}%",
            i,
            doc.cache.len(),
            args.frames,
            doc.cache.mem() as f64 / (1024.0 * 1024.0),
            doc.cache.stats().hit_rate() * 100.0
        );
    }
    println!(
        "  populator: {} requests, {} commits ({} on demand), {} timeouts, {} conversion failures, {} unrequested",
        stats.requests,
        stats.commits,
        stats.on_demand_commits,
        stats.timeouts,
        stats.conversion_failures,
        stats.stale_notifications
    );
    println!(
        "  events: {} cache changes, {} populator transitions",
        counts.cache_changes, counts.state_changes
    );

    Ok(())
}
