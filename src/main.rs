//! cubeb-lw - 回调驱动的音频播放引擎命令行工具
//!
//! - `info`：显示后端能力和默认配置
//! - `play`：用内置信号发生器播放一段音频，结束后自然 drain
//! - `sanity`：跑一遍上下文/流生命周期自检

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cubeb_lw::{
    ClockConfig, Context, ContextConfig, SampleFormat, StateEvent, StreamInfo, StreamParams,
    StreamState,
};

/// cubeb-lw - Callback-driven audio playback engine
#[derive(Parser)]
#[command(name = "cubeb-lw")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show backend capabilities and default configuration
    Info,

    /// Play a generated signal and drain
    Play(PlayArgs),

    /// Run the lifecycle self-check
    Sanity,
}

#[derive(clap::Args)]
struct PlayArgs {
    /// Sample rate in Hz
    #[arg(short, long, default_value = "48000")]
    rate: u32,

    /// Channel count
    #[arg(short, long, default_value = "2")]
    channels: u16,

    /// Sample encoding
    #[arg(short, long, value_enum, default_value = "s16le")]
    format: FormatArg,

    /// Stream latency in milliseconds (1-2000)
    #[arg(short, long, default_value = "100")]
    latency_ms: u32,

    /// Device period in milliseconds
    #[arg(short, long, default_value = "10")]
    period_ms: u32,

    /// Signal length in seconds
    #[arg(short, long, default_value = "3")]
    seconds: f64,

    /// Signal to generate
    #[arg(long, value_enum, default_value = "sine")]
    signal: Signal,

    /// Sine frequency in Hz
    #[arg(long, default_value = "440")]
    frequency: f32,

    /// Raise device thread priority
    #[arg(long)]
    realtime: bool,

    /// Lock stream buffers in memory
    #[arg(long)]
    lock_memory: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    S16le,
    S16be,
    F32le,
    F32be,
}

impl From<FormatArg> for SampleFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::S16le => SampleFormat::S16LE,
            FormatArg::S16be => SampleFormat::S16BE,
            FormatArg::F32le => SampleFormat::Float32LE,
            FormatArg::F32be => SampleFormat::Float32BE,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Signal {
    Silence,
    Sine,
    Noise,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Commands::Info => show_info(),
        Commands::Play(ref args) => play(args),
        Commands::Sanity => sanity(),
    }
}

/// 显示后端信息
fn show_info() -> anyhow::Result<()> {
    let ctx = Context::init("cubeb-lw-info")?;
    let caps = ctx.capabilities();
    let clock = &ctx.config().clock;

    println!("=== Backend ===\n");
    println!("Name:        {}", ctx.backend_name());
    let formats: Vec<String> = caps.formats.iter().map(|f| f.to_string()).collect();
    println!("Formats:     {}", formats.join(", "));
    println!("Rates:       {} - {} Hz", caps.min_rate, caps.max_rate);
    println!("Channels:    1 - {}", caps.max_channels);
    println!();
    println!("Period:      {} ms", clock.period_ms);
    println!("FIFO depth:  {} periods", clock.device_latency_periods);
    println!("Latency:     1 - 2000 ms");

    Ok(())
}

/// 信号发生器，样本缓冲在第一次回调（预填充）时分配
struct SignalGenerator {
    signal: Signal,
    format: SampleFormat,
    channels: usize,
    phase: f32,
    step: f32,
    remaining: u64,
    rng: StdRng,
    samples: Vec<f32>,
}

impl SignalGenerator {
    const AMPLITUDE: f32 = 0.2;

    fn new(signal: Signal, params: StreamParams, frequency: f32, total_frames: u64) -> Self {
        Self {
            signal,
            format: params.format,
            channels: params.channels as usize,
            phase: 0.0,
            step: std::f32::consts::TAU * frequency / params.rate as f32,
            remaining: total_frames,
            rng: StdRng::from_entropy(),
            samples: Vec::new(),
        }
    }

    fn render(&mut self, buffer: &mut [u8], nframes: usize) -> usize {
        let frames = (nframes as u64).min(self.remaining) as usize;
        let needed = frames * self.channels;
        if self.samples.len() < needed {
            self.samples.resize(needed, 0.0);
        }

        for frame in self.samples[..needed].chunks_exact_mut(self.channels) {
            let value = match self.signal {
                Signal::Silence => 0.0,
                Signal::Sine => {
                    let v = self.phase.sin() * Self::AMPLITUDE;
                    self.phase = (self.phase + self.step) % std::f32::consts::TAU;
                    v
                }
                Signal::Noise => self.rng.gen_range(-1.0f32..1.0) * Self::AMPLITUDE,
            };
            frame.fill(value);
        }

        self.format.write_f32(&self.samples[..needed], buffer);
        self.remaining -= frames as u64;
        frames
    }
}

/// 状态回调把事件转发到主线程
fn forward_events() -> (
    impl FnMut(&StreamInfo, StateEvent) + Send + 'static,
    Receiver<StateEvent>,
) {
    let (tx, rx) = unbounded();
    let callback = move |_: &StreamInfo, event: StateEvent| {
        let _ = tx.send(event);
    };
    (callback, rx)
}

/// 播放生成的信号，信号结束后等待 drain
fn play(args: &PlayArgs) -> anyhow::Result<()> {
    if args.seconds.is_nan() || args.seconds <= 0.0 {
        bail!("--seconds must be positive");
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let config = ContextConfig {
        clock: ClockConfig {
            period_ms: args.period_ms,
            realtime_priority: args.realtime,
            ..Default::default()
        },
        lock_memory: args.lock_memory,
    };
    let ctx = Context::with_config("cubeb-lw", config)?;

    let params = StreamParams::new(args.format.into(), args.rate, args.channels);
    let total_frames = (args.seconds * args.rate as f64).round() as u64;
    let mut generator = SignalGenerator::new(args.signal, params, args.frequency, total_frames);

    let (state_cb, events) = forward_events();
    let stream = ctx
        .stream_init(
            "play",
            params,
            args.latency_ms,
            move |_: &StreamInfo, buffer: &mut [u8], nframes: usize| {
                generator.render(buffer, nframes)
            },
            state_cb,
        )
        .context("failed to create stream")?;

    let info = stream.info();
    println!(
        "cubeb-lw - Playing '{}' #{}: {} ({} ms latency)",
        info.name(),
        info.id(),
        info.params(),
        info.latency_ms()
    );
    println!("Press Ctrl+C to stop.\n");

    stream.start()?;
    let started = Instant::now();

    loop {
        if !running.load(Ordering::SeqCst) {
            println!("\nPlayback interrupted.");
            stream.stop()?;
            break;
        }

        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(StateEvent::Drained) => {
                println!("\nDrained.");
                break;
            }
            Ok(StateEvent::Error(e)) => {
                println!();
                bail!("device error: {}", e);
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let stats = stream.stats();
        let position_secs = stream.position()? as f64 / params.rate as f64;
        print!(
            "\r  {:02}:{:05.2}  |  {:?}  |  Buffer: {:5.1}%  |  Underruns: {}  ",
            (position_secs / 60.0) as u32,
            position_secs % 60.0,
            stream.state(),
            stats.buffer_fill_ratio * 100.0,
            stats.underrun_count
        );
        io::stdout().flush()?;
    }

    println!("Wall time: {:.2} s\n", started.elapsed().as_secs_f64());
    println!("{}", stream.stats());
    Ok(())
}

/// 生命周期自检
fn sanity() -> anyhow::Result<()> {
    let checks: [(&str, fn() -> anyhow::Result<()>); 5] = [
        ("init/destroy multiple contexts", check_contexts),
        ("create/destroy 16 streams", check_many_streams),
        ("start/stop cycles", check_start_stop),
        ("position freezes on stop", check_position_frozen),
        ("drain", check_drain),
    ];

    let mut failed = 0;
    for (name, check) in checks {
        match check() {
            Ok(()) => println!("[ OK ]  {}", name),
            Err(e) => {
                failed += 1;
                println!("[FAIL]  {}: {:#}", name, e);
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} checks failed", failed, checks.len());
    }
    println!("\nAll checks passed.");
    Ok(())
}

fn sanity_params() -> StreamParams {
    StreamParams::new(SampleFormat::S16NE, 16000, 1)
}

fn silence(info: &StreamInfo, buffer: &mut [u8], nframes: usize) -> usize {
    buffer[..nframes * info.params().bytes_per_frame()].fill(0);
    nframes
}

fn ignore_state(_: &StreamInfo, _: StateEvent) {}

fn check_contexts() -> anyhow::Result<()> {
    let contexts = (0..4)
        .map(|i| Context::init(&format!("sanity-{}", i)))
        .collect::<Result<Vec<_>, _>>()?;
    for ctx in contexts {
        ctx.destroy();
    }
    Ok(())
}

fn check_many_streams() -> anyhow::Result<()> {
    let ctx = Context::init("sanity")?;
    let streams = (0..16)
        .map(|i| ctx.stream_init(&format!("s{}", i), sanity_params(), 250, silence, ignore_state))
        .collect::<Result<Vec<_>, _>>()?;
    if ctx.stream_count() != 16 {
        bail!("expected 16 live streams, found {}", ctx.stream_count());
    }
    for stream in streams.into_iter().rev() {
        stream.destroy();
    }
    Ok(())
}

fn check_start_stop() -> anyhow::Result<()> {
    let ctx = Context::init("sanity")?;
    let stream = ctx.stream_init("cycles", sanity_params(), 250, silence, ignore_state)?;
    for _ in 0..5 {
        stream.start()?;
        std::thread::sleep(Duration::from_millis(20));
        stream.stop()?;
    }
    Ok(())
}

fn check_position_frozen() -> anyhow::Result<()> {
    let ctx = Context::init("sanity")?;
    let stream = ctx.stream_init("position", sanity_params(), 250, silence, ignore_state)?;
    stream.start()?;
    std::thread::sleep(Duration::from_millis(300));
    stream.stop()?;

    let stopped_at = stream.position()?;
    if stopped_at == 0 {
        bail!("position did not advance while running");
    }
    std::thread::sleep(Duration::from_millis(100));
    if stream.position()? != stopped_at {
        bail!("position moved after stop");
    }
    Ok(())
}

fn check_drain() -> anyhow::Result<()> {
    let ctx = Context::init("sanity")?;
    let params = sanity_params();
    let mut remaining = params.frames_for_ms(200);
    let total = remaining as u64;

    let (state_cb, events) = forward_events();
    let stream = ctx.stream_init(
        "drain",
        params,
        250,
        move |info: &StreamInfo, buffer: &mut [u8], nframes: usize| {
            let frames = nframes.min(remaining);
            buffer[..frames * info.params().bytes_per_frame()].fill(0);
            remaining -= frames;
            frames
        },
        state_cb,
    )?;

    stream.start()?;
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(timeout) {
            Ok(StateEvent::Drained) => break,
            Ok(StateEvent::Error(e)) => bail!("device error: {}", e),
            Ok(_) => {}
            Err(_) => bail!("no drain notification"),
        }
    }

    if stream.state() != StreamState::Stopped {
        bail!("stream not stopped after drain: {:?}", stream.state());
    }
    let position = stream.position()?;
    if position != total {
        bail!("drained at frame {}, expected {}", position, total);
    }
    Ok(())
}
