//! wavstream command-line host.
//!
//! ```text
//! wavstream play <file.wav> [--chunk <secs>|--whole] [--loop] [--channel <n>]
//!                           [--null-output] [--max-seconds <s>] [--settings <file.json>]
//! wavstream info <file.wav> [--chunk <secs>|--whole]
//! wavstream tone <out.wav> [--seconds <s>] [--rate <hz>] [--stereo] [--bits 8|16] [--freq <hz>]
//! wavstream settings [--settings <file.json>] [--write]
//! ```

mod settings;
mod tone;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use settings::{default_settings_path, load_settings, save_settings, AppSettings};
use tone::ToneSpec;
use tracing::{info, warn};
use wavstream_core::{
    format::parse_header, AllocatorHandle, ChunkPlan, ChunkSize, ClockDriver, Engine,
    EngineConfig, LinearPool, OutputDevice, OutputHandle, PlaybackEvent, PlaybackEventKind,
    SoftMixer, MAX_CHANNELS,
};

/// Rate and width the silent clock renders at.
const NULL_OUTPUT_RATE: u32 = 48_000;
const NULL_OUTPUT_CHANNELS: u16 = 2;
const IDLE_POLL: Duration = Duration::from_millis(50);

const USAGE: &str = "Usage:
  wavstream play <file.wav> [--chunk <secs>|--whole] [--loop] [--channel <n>]
                            [--null-output] [--max-seconds <s>] [--settings <file.json>]
  wavstream info <file.wav> [--chunk <secs>|--whole] [--settings <file.json>]
  wavstream tone <out.wav> [--seconds <s>] [--rate <hz>] [--stereo] [--bits 8|16] [--freq <hz>]
  wavstream settings [--settings <file.json>] [--write]";

#[derive(Debug)]
enum Command {
    Play(PlayArgs),
    Info {
        file: PathBuf,
        chunk: Option<ChunkSize>,
        settings: Option<PathBuf>,
    },
    Tone {
        out: PathBuf,
        spec: ToneSpec,
    },
    Settings {
        settings: Option<PathBuf>,
        write: bool,
    },
}

#[derive(Debug, Default)]
struct PlayArgs {
    file: PathBuf,
    chunk: Option<ChunkSize>,
    looping: bool,
    channel: Option<usize>,
    null_output: bool,
    max_seconds: Option<f64>,
    settings: Option<PathBuf>,
}

fn next_value<I: Iterator<Item = String>>(it: &mut I, flag: &str) -> Result<String> {
    it.next()
        .with_context(|| format!("missing value for {flag}"))
}

fn parse_value<T, I>(it: &mut I, flag: &str) -> Result<T>
where
    T: std::str::FromStr,
    I: Iterator<Item = String>,
{
    let raw = next_value(it, flag)?;
    raw.parse::<T>()
        .map_err(|_| anyhow::anyhow!("invalid value for {flag}: {raw}"))
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Command> {
    let mut it = args.into_iter();
    let Some(sub) = it.next() else {
        bail!("missing command\n{USAGE}");
    };

    match sub.as_str() {
        "play" => {
            let mut play = PlayArgs::default();
            let mut file = None;
            while let Some(arg) = it.next() {
                match arg.as_str() {
                    "--chunk" => {
                        play.chunk = Some(ChunkSize::from_seconds(parse_value(&mut it, "--chunk")?))
                    }
                    "--whole" => play.chunk = Some(ChunkSize::WholeFile),
                    "--loop" => play.looping = true,
                    "--channel" => play.channel = Some(parse_value(&mut it, "--channel")?),
                    "--null-output" => play.null_output = true,
                    "--max-seconds" => play.max_seconds = Some(parse_value(&mut it, "--max-seconds")?),
                    "--settings" => play.settings = Some(PathBuf::from(next_value(&mut it, "--settings")?)),
                    other if other.starts_with("--") => bail!("unknown argument: {other}"),
                    other => file = Some(PathBuf::from(other)),
                }
            }
            play.file = file.context("play needs a WAV file")?;
            Ok(Command::Play(play))
        }
        "info" => {
            let mut file = None;
            let mut chunk = None;
            let mut settings = None;
            while let Some(arg) = it.next() {
                match arg.as_str() {
                    "--chunk" => chunk = Some(ChunkSize::from_seconds(parse_value(&mut it, "--chunk")?)),
                    "--whole" => chunk = Some(ChunkSize::WholeFile),
                    "--settings" => settings = Some(PathBuf::from(next_value(&mut it, "--settings")?)),
                    other if other.starts_with("--") => bail!("unknown argument: {other}"),
                    other => file = Some(PathBuf::from(other)),
                }
            }
            Ok(Command::Info {
                file: file.context("info needs a WAV file")?,
                chunk,
                settings,
            })
        }
        "tone" => {
            let mut spec = ToneSpec::default();
            let mut out = None;
            while let Some(arg) = it.next() {
                match arg.as_str() {
                    "--seconds" => spec.seconds = parse_value(&mut it, "--seconds")?,
                    "--rate" => spec.sample_rate = parse_value(&mut it, "--rate")?,
                    "--stereo" => spec.channels = 2,
                    "--bits" => spec.bits = parse_value(&mut it, "--bits")?,
                    "--freq" => spec.frequency = parse_value(&mut it, "--freq")?,
                    other if other.starts_with("--") => bail!("unknown argument: {other}"),
                    other => out = Some(PathBuf::from(other)),
                }
            }
            Ok(Command::Tone {
                out: out.context("tone needs an output path")?,
                spec,
            })
        }
        "settings" => {
            let mut settings = None;
            let mut write = false;
            while let Some(arg) = it.next() {
                match arg.as_str() {
                    "--settings" => settings = Some(PathBuf::from(next_value(&mut it, "--settings")?)),
                    "--write" => write = true,
                    other => bail!("unknown argument: {other}"),
                }
            }
            Ok(Command::Settings { settings, write })
        }
        "--help" | "-h" | "help" => {
            println!("{USAGE}");
            std::process::exit(0);
        }
        other => bail!("unknown command: {other}\n{USAGE}"),
    }
}

fn settings_from(path: Option<&Path>) -> (PathBuf, AppSettings) {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_settings_path);
    let settings = load_settings(&path);
    (path, settings)
}

// ── Playback ─────────────────────────────────────────────────────────────────

/// Whatever is pulling samples out of the mixer.
enum Renderer {
    Device(OutputDevice),
    Clock(ClockDriver),
}

impl Renderer {
    fn start(mixer: &Arc<SoftMixer>, null_output: bool) -> Result<Self> {
        if !null_output {
            match OutputDevice::open_default(Arc::clone(mixer)) {
                Ok(device) => return Ok(Renderer::Device(device)),
                Err(e) => warn!("output device unavailable, falling back to null output: {e}"),
            }
        }
        let clock = ClockDriver::spawn(Arc::clone(mixer), NULL_OUTPUT_RATE, NULL_OUTPUT_CHANNELS)?;
        Ok(Renderer::Clock(clock))
    }

    fn name(&self) -> &'static str {
        match self {
            Renderer::Device(_) => "device",
            Renderer::Clock(_) => "null",
        }
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventTally {
    chunks_queued: usize,
    bytes_queued: usize,
    underruns: usize,
    read_errors: usize,
    loops: usize,
    finished: bool,
}

impl EventTally {
    fn record(&mut self, event: &PlaybackEvent) {
        match &event.kind {
            PlaybackEventKind::ChunkQueued { bytes, .. } => {
                self.chunks_queued += 1;
                self.bytes_queued += bytes;
            }
            PlaybackEventKind::Underrun => self.underruns += 1,
            PlaybackEventKind::ReadError { .. } => self.read_errors += 1,
            PlaybackEventKind::Looped => self.loops += 1,
            PlaybackEventKind::Finished | PlaybackEventKind::Stopped => self.finished = true,
            PlaybackEventKind::Started { .. } => {}
        }
    }
}

/// Log every event until the engine drops its sender.
fn spawn_event_logger(engine: &Engine, tally: Arc<Mutex<EventTally>>) -> Result<JoinHandle<()>> {
    let mut rx = engine.subscribe_events();
    let handle = thread::Builder::new()
        .name("wavstream-events".into())
        .spawn(move || loop {
            match rx.blocking_recv() {
                Ok(event) => {
                    info!(
                        channel = event.channel,
                        seq = event.seq,
                        kind = ?event.kind,
                        "playback event"
                    );
                    tally.lock().record(&event);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        })
        .context("spawning event logger")?;
    Ok(handle)
}

fn run_play(args: PlayArgs) -> Result<()> {
    let (settings_path, mut settings) = settings_from(args.settings.as_deref());
    info!(path = %settings_path.display(), "settings loaded");

    if let Some(ChunkSize::Seconds(secs)) = args.chunk {
        settings.chunk_seconds = secs;
    } else if let Some(ChunkSize::WholeFile) = args.chunk {
        settings.chunk_seconds = -1.0;
    }
    if args.looping {
        settings.loop_playback = true;
    }
    if let Some(channel) = args.channel {
        if channel >= MAX_CHANNELS {
            bail!("channel {channel} out of range (0..{MAX_CHANNELS})");
        }
        settings.channel = channel;
    }
    if args.null_output {
        settings.output = "null".into();
    }

    let mixer = Arc::new(SoftMixer::new(MAX_CHANNELS));
    let engine = Engine::new(
        EngineConfig {
            channel_count: MAX_CHANNELS,
            poll_interval: settings.poll_interval(),
        },
        OutputHandle(mixer.clone()),
        AllocatorHandle::new(LinearPool::new(settings.pool_capacity_bytes)),
    )?;
    let renderer = Renderer::start(&mixer, settings.null_output())?;
    info!(output = renderer.name(), "renderer started");

    let tally = Arc::new(Mutex::new(EventTally::default()));
    let logger = spawn_event_logger(&engine, Arc::clone(&tally))?;

    engine
        .load_file(&args.file, settings.chunk_size())
        .with_context(|| format!("loading {}", args.file.display()))?;
    if let Some(text) = engine.describe_loaded() {
        println!("{text}");
    }

    let channel = settings.channel;
    engine.play(channel, settings.loop_playback)?;

    let started = Instant::now();
    let limit = args.max_seconds.filter(|s| s.is_finite() && *s > 0.0);
    while !engine.is_idle() {
        if let Some(limit) = limit {
            if started.elapsed().as_secs_f64() >= limit {
                info!(limit, "time limit reached, stopping");
                engine.stop(channel)?;
                break;
            }
        }
        thread::sleep(IDLE_POLL);
    }

    let diagnostics = engine.diagnostics();
    engine.shutdown();
    drop(engine);
    drop(renderer);
    if logger.join().is_err() {
        warn!("event logger panicked");
    }

    println!(
        "played {:.2}s on channel {channel}",
        started.elapsed().as_secs_f64()
    );
    println!("{}", serde_json::to_string_pretty(&diagnostics)?);
    println!("{}", serde_json::to_string_pretty(&*tally.lock())?);
    Ok(())
}

// ── Info / tone / settings ───────────────────────────────────────────────────

fn run_info(file: &Path, chunk: Option<ChunkSize>, settings: Option<&Path>) -> Result<()> {
    let (_, settings) = settings_from(settings);
    let size = chunk.unwrap_or_else(|| settings.chunk_size());

    let mut reader = File::open(file).with_context(|| format!("opening {}", file.display()))?;
    let format = parse_header(&mut reader)?;
    let plan = ChunkPlan::new(&format, size)?;

    println!("{format}");
    println!("{plan}");
    println!("Duration:           {:.3} s", format.duration_secs());
    println!("Chunk reads:        {}", plan.reads_for(format.data_size));
    println!("Streamed:           {}", !plan.whole_file);
    Ok(())
}

fn run_settings(path: Option<&Path>, write: bool) -> Result<()> {
    let (path, settings) = settings_from(path);
    if write {
        save_settings(&path, &settings)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "settings written");
    }
    println!("{}", path.display());
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

fn main() {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("wavstream=info,wavstream_core=info")),
        )
        .init();

    let result = parse_args(std::env::args().skip(1)).and_then(|command| match command {
        Command::Play(args) => run_play(args),
        Command::Info {
            file,
            chunk,
            settings,
        } => run_info(&file, chunk, settings.as_deref()),
        Command::Tone { out, spec } => tone::write_tone(&out, &spec).map(|frames| {
            println!("wrote {frames} frames to {}", out.display());
        }),
        Command::Settings { settings, write } => run_settings(settings.as_deref(), write),
    });

    if let Err(e) = result {
        eprintln!("wavstream failed: {e:#}");
        std::process::exit(1);
    }
}
