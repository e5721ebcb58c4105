use std::{fs, path::PathBuf};

#[cfg(feature = "ffmpeg")]
use std::{path::Path, sync::Arc};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use serde_json::json;
use upscaler::{MediaKind, MovieInfo, Track, TrackParams, capacity};

#[cfg(feature = "ffmpeg")]
use indicatif::{ProgressBar, ProgressStyle};
#[cfg(feature = "ffmpeg")]
use upscaler::{
    ContentStyle, ConversionJob, FfmpegDecoder, FfmpegEncoder, FfmpegLogLevel, FileDestination,
    FrameRenderer, JobEvent, NetworkSelection, NetworkSize, PipelineConfig, ResampleRenderer,
    StatusListener,
};

const CLI_AFTER_HELP: &str = "Examples:\n  upscaler probe input.mp4 --json\n  upscaler upscale input.mp4 --size large --style an --progress\n  upscaler upscale input.mp4 -o big.mp4 --quota 4GiB\n  upscaler completions zsh > _upscaler";

#[derive(Debug, Parser)]
#[command(
    name = "upscaler",
    version,
    about = "Upscale MP4 videos 2x and inspect their tracks",
    after_help = CLI_AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Parser, Clone, Default)]
struct GlobalOptions {
    /// Show additional output.
    #[arg(long)]
    verbose: bool,

    /// Allow overwriting existing output files.
    #[arg(long)]
    overwrite: bool,

    /// FFmpeg log level (quiet, panic, fatal, error, warning, info, verbose, debug, trace).
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show tracks and the output plan of an MP4 file.
    Probe {
        /// Input MP4 file.
        input: PathBuf,
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Upscale the video of an MP4 file 2x.
    #[cfg(feature = "ffmpeg")]
    Upscale {
        /// Input MP4 file.
        input: PathBuf,
        /// Output path (default: `<stem>-upscaled.mp4` next to the input).
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Network size (small, medium, large).
        #[arg(long, default_value = "medium")]
        size: String,
        /// Content style (rl, an, 3d).
        #[arg(long, default_value = "rl")]
        style: String,
        /// Directory holding network weight files.
        #[arg(long)]
        weights_dir: Option<PathBuf>,
        /// Storage available for the output, e.g. `512MiB` or `4GiB`.
        #[arg(long)]
        quota: Option<String>,
        /// Maximum frames in flight.
        #[arg(long)]
        window: Option<usize>,
        /// Show a progress bar.
        #[arg(long)]
        progress: bool,
    },
    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

/// Parse a byte count with an optional binary (`KiB`) or decimal (`KB`)
/// suffix.
fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "k" | "kib" => 1024.0,
        "kb" => 1e3,
        "m" | "mib" => 1024.0 * 1024.0,
        "mb" => 1e6,
        "g" | "gib" => 1024.0 * 1024.0 * 1024.0,
        "gb" => 1e9,
        "t" | "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "tb" => 1e12,
        _ => return None,
    };
    Some((number * multiplier).round() as u64)
}

#[cfg(feature = "ffmpeg")]
fn parse_log_level(value: &str) -> Option<FfmpegLogLevel> {
    match value.to_ascii_lowercase().as_str() {
        "quiet" => Some(FfmpegLogLevel::Quiet),
        "panic" => Some(FfmpegLogLevel::Panic),
        "fatal" => Some(FfmpegLogLevel::Fatal),
        "error" => Some(FfmpegLogLevel::Error),
        "warning" | "warn" => Some(FfmpegLogLevel::Warning),
        "info" => Some(FfmpegLogLevel::Info),
        "verbose" => Some(FfmpegLogLevel::Verbose),
        "debug" => Some(FfmpegLogLevel::Debug),
        "trace" => Some(FfmpegLogLevel::Trace),
        _ => None,
    }
}

#[cfg(feature = "ffmpeg")]
fn ensure_writable_path(path: &Path, overwrite: bool) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        if overwrite {
            eprintln!(
                "{} {}",
                "warning:".yellow().bold(),
                format!("overwriting {}", path.display()).yellow()
            );
        } else {
            return Err(format!(
                "output already exists: {} (use --overwrite to replace)",
                path.display()
            )
            .into());
        }
    }
    Ok(())
}

fn apply_global_options(global: &GlobalOptions) -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(feature = "ffmpeg")]
    if let Some(level) = &global.log_level {
        let parsed = parse_log_level(level).ok_or(format!("unsupported --log-level: {level}"))?;
        upscaler::set_ffmpeg_log_level(parsed);
    }

    #[cfg(not(feature = "ffmpeg"))]
    if global.log_level.is_some() {
        eprintln!(
            "{} {}",
            "warning:".yellow().bold(),
            "--log-level requires building with the `ffmpeg` feature".yellow()
        );
    }

    Ok(())
}

fn track_json(track: &Track) -> serde_json::Value {
    let mut value = json!({
        "id": track.id,
        "kind": track.kind.to_string(),
        "codec": track.codec,
        "timescale": track.timescale,
        "duration_seconds": track.duration().as_secs_f64(),
        "sample_count": track.sample_count,
    });
    match &track.params {
        TrackParams::Video { width, height, .. } => {
            value["width"] = json!(width);
            value["height"] = json!(height);
        }
        TrackParams::Audio {
            sample_rate,
            channel_count,
            ..
        } => {
            value["sample_rate"] = json!(sample_rate);
            value["channels"] = json!(channel_count);
        }
    }
    value
}

fn print_probe(info: &MovieInfo, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let plan = info
        .first(MediaKind::Video)
        .and_then(Track::dimensions)
        .map(|(w, h)| capacity::plan(w, h, info.duration, None))
        .transpose()?;

    if json {
        let payload = json!({
            "duration_seconds": info.duration.as_secs_f64(),
            "tracks": info.tracks.iter().map(track_json).collect::<Vec<_>>(),
            "plan": plan.as_ref().map(|plan| json!({
                "codec": plan.codec,
                "bitrate": plan.bitrate.round(),
                "estimated_bytes": plan.estimated_bytes,
                "output_width": plan.output_width,
                "output_height": plan.output_height,
                "target": format!("{:?}", plan.target).to_ascii_lowercase(),
            })),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("{} {:.3}s", "Duration:".bold(), info.duration.as_secs_f64());
    for track in &info.tracks {
        let detail = match &track.params {
            TrackParams::Video { width, height, .. } => format!("{width}x{height}"),
            TrackParams::Audio {
                sample_rate,
                channel_count,
                ..
            } => format!("{sample_rate} Hz, {channel_count} ch"),
        };
        println!(
            "{} #{} {} {} ({} samples)",
            track.kind.to_string().cyan().bold(),
            track.id,
            track.codec.green(),
            detail,
            track.sample_count
        );
    }
    if let Some(plan) = plan {
        println!(
            "{} {}x{} {} at {:.0} kbit/s, about {} ({:?})",
            "Output:".bold(),
            plan.output_width,
            plan.output_height,
            plan.codec,
            plan.bitrate / 1000.0,
            upscaler::human_file_size(plan.estimated_bytes as f64),
            plan.target
        );
    }
    Ok(())
}

/// Feeds job events into a terminal progress bar.
#[cfg(feature = "ffmpeg")]
struct TerminalStatus {
    bar: Option<ProgressBar>,
}

#[cfg(feature = "ffmpeg")]
impl StatusListener for TerminalStatus {
    fn on_event(&self, event: &JobEvent) {
        let Some(bar) = &self.bar else {
            return;
        };
        match event {
            JobEvent::Progress(percent) => bar.set_position(u64::from(*percent)),
            JobEvent::Eta(eta) => bar.set_message(format!("eta {eta}")),
            JobEvent::Error(_) => bar.abandon(),
            JobEvent::Finished(_) => bar.finish_with_message("done"),
        }
    }
}

#[cfg(feature = "ffmpeg")]
#[allow(clippy::too_many_arguments)]
fn upscale(
    global: &GlobalOptions,
    input: PathBuf,
    output: Option<PathBuf>,
    size: &str,
    style: &str,
    weights_dir: Option<PathBuf>,
    quota: Option<String>,
    window: Option<usize>,
    progress: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let selection = NetworkSelection::new(size.parse::<NetworkSize>()?, style.parse::<ContentStyle>()?);
    let output = output.unwrap_or_else(|| input.with_file_name(upscaler::upscaled_file_name(&input)));
    ensure_writable_path(&output, global.overwrite)?;

    let mut renderer = ResampleRenderer::with_network(&selection.network_name())?;
    if let Some(dir) = weights_dir {
        let weights = fs::read(dir.join(selection.weights_file()))?;
        renderer.switch_network(&selection.network_name(), &weights)?;
    }

    let bar = if progress {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::with_template("{spinner:.green} {bar:40.cyan/blue} {pos}% {msg}")?;
        bar.set_style(style.progress_chars("##-"));
        Some(bar)
    } else {
        None
    };

    let mut config = PipelineConfig::new()
        .with_listener(Arc::new(TerminalStatus { bar }))
        .with_storage_quota(quota.as_deref().map(|q| parse_size(q).ok_or(format!("unsupported --quota: {q}"))).transpose()?);
    if let Some(window) = window {
        config = config.with_window(window);
    }

    let data = fs::read(&input)?;
    let duration = upscaler::probe(data.clone())?.duration;
    if global.verbose {
        eprintln!("{} {} with {selection}", "upscaling".cyan().bold(), input.display());
    }

    let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build()?;
    let job = ConversionJob::new(FfmpegDecoder::new(), FfmpegEncoder::new(), renderer, config)
        .with_output_name(upscaler::upscaled_file_name(&input));
    let mut destination = FileDestination(output.clone());
    let buffer = runtime.block_on(job.run(data.into(), duration, &mut destination))?;
    if let Some(buffer) = buffer {
        fs::write(&output, buffer)?;
    }

    println!("{} {}", "wrote".green().bold(), output.display());
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    apply_global_options(&cli.global)?;

    match cli.command {
        Commands::Probe { input, json } => {
            let data = fs::read(&input)?;
            if cli.global.verbose {
                eprintln!(
                    "{} {} ({})",
                    "probing".cyan().bold(),
                    input.display(),
                    upscaler::human_file_size(data.len() as f64)
                );
            }
            let info = upscaler::probe(data)?;
            print_probe(&info, json)?;
        }
        #[cfg(feature = "ffmpeg")]
        Commands::Upscale {
            input,
            output,
            size,
            style,
            weights_dir,
            quota,
            window,
            progress,
        } => upscale(&cli.global, input, output, &size, &style, weights_dir, quota, window, progress)?,
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "upscaler", &mut std::io::stdout());
        }
    }

    Ok(())
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::parse_size;

    #[test]
    fn parse_size_units() {
        assert_eq!(parse_size("1024"), Some(1024));
        assert_eq!(parse_size("1.5KiB"), Some(1536));
        assert_eq!(parse_size("2 GiB"), Some(2 << 30));
        assert_eq!(parse_size("3MB"), Some(3_000_000));
        assert_eq!(parse_size("ten"), None);
        assert_eq!(parse_size("5 parsecs"), None);
    }

    #[cfg(feature = "ffmpeg")]
    #[test]
    fn parse_log_level_aliases() {
        use super::parse_log_level;

        assert!(parse_log_level("warn").is_some());
        assert!(parse_log_level("QUIET").is_some());
        assert!(parse_log_level("loud").is_none());
    }
}
