use clap::Parser;
use std::path::PathBuf;

const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Animation frame cache populator demo: renders synthetic documents in the
/// background while a simulated user paints and edits.
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Number of open documents
    #[arg(short = 'd', long = "documents", value_name = "N", default_value_t = 2)]
    pub documents: usize,

    /// Frames per document (clip range 0..N-1)
    #[arg(short = 'n', long = "frames", value_name = "N", default_value_t = 24)]
    pub frames: i32,

    /// Frame size in pixels
    #[arg(long = "size", value_names = ["W", "H"], num_args = 2, default_values_t = [320, 180])]
    pub size: Vec<u32>,

    /// Simulated render time per frame (ms)
    #[arg(long = "render-ms", value_name = "MS", default_value_t = 15)]
    pub render_ms: u64,

    /// Every Nth render never reports back (exercises the timeout path, 0 = never)
    #[arg(long = "lose-every", value_name = "N", default_value_t = 0)]
    pub lose_every: u32,

    /// Run time of the simulation (seconds)
    #[arg(short = 't', long = "duration", value_name = "SECS", default_value_t = 3.0)]
    pub duration: f64,

    /// Simulate a brush stroke (busy, then invalidate) every N ms (0 = never)
    #[arg(long = "stroke-every", value_name = "MS", default_value_t = 700)]
    pub stroke_every: u64,

    /// Enable debug logging to file (default: animcache.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Write the effective configuration to the config file and exit
    #[arg(long = "write-config")]
    pub write_config: bool,
}

impl Args {
    pub fn width(&self) -> u32 {
        self.size.first().copied().unwrap_or(320)
    }

    pub fn height(&self) -> u32 {
        self.size.get(1).copied().unwrap_or(180)
    }
}
