//! `playout` demo: a synthetic decoder feeds a presentation session on the
//! soft backend while a consumer thread samples the shared surfaces.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use log::{debug, info, warn};

use playout::backend::{SoftDevice, SoftInterop};
use playout::cli::Args;
use playout::config::{CONFIG_FILE, EngineConfig};
use playout::core::{
    Device, EngineEvent, InteropApi, MediaTime, PixelFormat, PresentationSession, SurfaceDesc,
    SystemClock, frame_duration,
};
use playout::paths::{self, PathConfig};

fn main() -> Result<()> {
    let args = Args::parse();

    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = paths::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }

    init_logging(&args, &path_config)?;
    info!("playout v{} starting", env!("CARGO_PKG_VERSION"));
    debug!("Command-line args: {:?}", args);

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_or_default(&paths::config_file(CONFIG_FILE, &path_config))?,
    };
    if let Some(pool) = args.pool {
        config.frame_pool_capacity = pool;
    }
    if let Some(bound) = args.ready_bound {
        config.ready_bound = bound;
    }
    config.nominal_frame_rate = args.fps;
    config.validate();

    run(&args, config)
}

fn init_logging(args: &Args, path_config: &PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .clone()
            .unwrap_or_else(|| paths::data_file("playout.log", path_config));
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

fn run(args: &Args, config: EngineConfig) -> Result<()> {
    let device = Arc::new(SoftDevice::with_target(args.size));
    let interop = (!args.no_consumer).then(|| Arc::new(SoftInterop::new()) as Arc<dyn InteropApi>);
    let session = Arc::new(PresentationSession::new(config, device.clone(), interop));

    // NeedInput → wake the decoder
    let (need_tx, need_rx) = crossbeam_channel::bounded::<()>(1);
    let resets = Arc::new(AtomicU64::new(0));
    {
        let resets = Arc::clone(&resets);
        session.events().subscribe(move |ev| match &ev.event {
            EngineEvent::NeedInput => {
                let _ = need_tx.try_send(());
            }
            EngineEvent::DeviceReset { generation } => {
                resets.fetch_add(1, Ordering::Relaxed);
                warn!("Device reset, pools now at generation {}", generation);
            }
            _ => {}
        });
    }

    let duration = frame_duration(args.fps);
    let frames = args.frames;
    let clock = Arc::new(SystemClock::new());
    if args.rate < 0.0 {
        clock.seek(frames.saturating_sub(1) as MediaTime * duration);
    }
    clock.set_rate(args.rate);
    session.set_clock(Some(clock.clone()));

    let desc = SurfaceDesc {
        size: args.size,
        format: PixelFormat::Bgra8,
    };
    session.open(desc)?;
    session.resize_target(args.size)?;
    session.start(args.rate)?;
    clock.start();
    let started = Instant::now();
    info!(
        "Session {} started: {} frames @ {} fps, rate {}",
        session.id(),
        frames,
        args.fps,
        args.rate
    );

    let done = Arc::new(AtomicBool::new(false));

    let consumer = (!args.no_consumer).then(|| {
        let session = Arc::clone(&session);
        let done = Arc::clone(&done);
        thread::Builder::new()
            .name("playout-consumer".into())
            .spawn(move || -> Result<u64> {
                let mut consumed = 0u64;
                while !done.load(Ordering::Acquire) {
                    if session.is_frame_ready()
                        && let Some(handle) = session.acquire_latest_frame()?
                    {
                        consumed += 1;
                        debug!(
                            "Consumer: frame {} @ {} us",
                            handle.serial(),
                            handle.timestamp()
                        );
                        // simulated render on the secondary API
                        thread::sleep(Duration::from_millis(4));
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(consumed)
            })
    });
    let consumer = consumer.transpose().context("Failed to spawn consumer thread")?;

    let decoder = {
        let session = Arc::clone(&session);
        let device = device.clone();
        let reset_at = args.inject_reset_at;
        let reverse = args.rate < 0.0;
        thread::Builder::new()
            .name("playout-decoder".into())
            .spawn(move || -> Result<u64> {
                let mut submitted = 0u64;
                for i in 0..frames {
                    let index = if reverse { frames - 1 - i } else { i };
                    let mut frame = loop {
                        if let Some(frame) = session.acquire_frame()? {
                            break frame;
                        }
                        // backpressure: wait for a release
                        let _ = need_rx.recv_timeout(Duration::from_millis(50));
                    };
                    device.upload(frame.surface(), &(index + 1).to_le_bytes())?;
                    frame.set_timing(index as MediaTime * duration, duration);
                    session.submit_frame(frame)?;
                    submitted += 1;

                    if reset_at == Some(i) {
                        info!("Injecting device reset after frame {}", i);
                        device.inject_reset();
                    }
                }
                Ok(submitted)
            })
            .context("Failed to spawn decoder thread")?
    };

    let submitted = decoder
        .join()
        .map_err(|_| anyhow!("decoder thread panicked"))??;

    // Let the scheduler drain
    let deadline = Instant::now()
        + Duration::from_micros((frames as MediaTime * duration) as u64)
        + Duration::from_secs(1);
    while session.pending_frames() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_micros(duration as u64));

    done.store(true, Ordering::Release);
    let consumed = match consumer {
        Some(handle) => handle
            .join()
            .map_err(|_| anyhow!("consumer thread panicked"))??,
        None => 0,
    };

    let stats = session.scheduler_stats().unwrap_or_default();
    let status = session.close()?;
    let elapsed = started.elapsed();
    let dev = device.stats();

    println!("playout: {} frames in {:.2} s", submitted, elapsed.as_secs_f64());
    println!(
        "  presented: {}  late: {}  early waits: {}  failures: {}",
        stats.presented, stats.late, stats.early_waits, stats.failures
    );
    println!(
        "  consumed:  {}  device resets: {}",
        consumed,
        resets.load(Ordering::Relaxed)
    );
    println!(
        "  device:    {} surfaces created, {} blits, {} presents, {} recreates",
        dev.created, dev.blits, dev.presents, dev.recreates
    );
    println!("  close:     {:?}", status);
    Ok(())
}
