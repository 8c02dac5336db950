use clap::Parser;
use dpi::PhysicalSize;
use std::path::PathBuf;

// Build version with backend info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Device:  soft (in-memory)\n",
    "Interop: soft (registration table)\n",
    "Target:  ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Timed video-frame presentation demo: synthetic decoder → scheduler → consumer
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Number of frames to decode and present
    #[arg(short = 'n', long = "frames", value_name = "N", default_value_t = 120)]
    pub frames: u64,

    /// Stream frame rate (frame timestamps and durations)
    #[arg(long = "fps", value_name = "FPS", default_value_t = 30.0)]
    pub fps: f64,

    /// Playback rate (negative: reverse, 0: scrub)
    #[arg(short = 'r', long = "rate", value_name = "RATE", default_value_t = 1.0, allow_hyphen_values = true)]
    pub rate: f32,

    /// Frame size
    #[arg(short = 's', long = "size", value_name = "WxH", default_value = "1280x720", value_parser = parse_size)]
    pub size: PhysicalSize<u32>,

    /// Max published-but-unread shared surfaces (overrides config)
    #[arg(long = "ready-bound", value_name = "N")]
    pub ready_bound: Option<usize>,

    /// Frame pool capacity (overrides config)
    #[arg(long = "pool", value_name = "N")]
    pub pool: Option<usize>,

    /// Engine config file (JSON); default: playout.json in the config dir
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Simulate a device reset after N presented frames
    #[arg(long = "inject-reset-at", value_name = "N")]
    pub inject_reset_at: Option<u64>,

    /// Run without the consumer (no shared surfaces)
    #[arg(long = "no-consumer")]
    pub no_consumer: bool,

    /// Enable debug logging to file (default: playout.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

/// Parse `WIDTHxHEIGHT`
pub fn parse_size(s: &str) -> Result<PhysicalSize<u32>, String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", s))?;
    let width: u32 = w.trim().parse().map_err(|_| format!("bad width '{}'", w))?;
    let height: u32 = h.trim().parse().map_err(|_| format!("bad height '{}'", h))?;
    if width == 0 || height == 0 {
        return Err(format!("size must be non-zero, got {}x{}", width, height));
    }
    Ok(PhysicalSize::new(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1920x1080").unwrap(), PhysicalSize::new(1920, 1080));
        assert_eq!(parse_size("64X32").unwrap(), PhysicalSize::new(64, 32));
        assert!(parse_size("1920").is_err());
        assert!(parse_size("0x10").is_err());
        assert!(parse_size("axb").is_err());
    }

    #[test]
    fn test_args_defaults_and_overrides() {
        let args = Args::parse_from(["playout"]);
        assert_eq!(args.frames, 120);
        assert_eq!(args.size, PhysicalSize::new(1280, 720));
        assert!(args.inject_reset_at.is_none());

        let args = Args::parse_from([
            "playout", "--frames", "10", "--rate", "-1", "--size", "320x240", "--pool", "6", "-vv",
        ]);
        assert_eq!(args.frames, 10);
        assert_eq!(args.rate, -1.0);
        assert_eq!(args.pool, Some(6));
        assert_eq!(args.verbosity, 2);
    }
}
