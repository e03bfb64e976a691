//! rampout - 无爆音实时音频输出
//!
//! 演示程序：列出输出设备，或播放正弦测试音，
//! 空格键暂停/继续（50 ms 渐变），r 重置输出，q / Ctrl+C 退出。

use std::io::{self, Read as IoRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};

use rampout::audio::{AudioBackend, AudioSystem, Fader, SampleFormat, VirtualBackend};
use rampout::pipeline::ToneSource;
use rampout::player::{Player, PlayerConfig};

/// 退出时等待淡出的最长时间
const STOP_TIMEOUT: Duration = Duration::from_millis(500);

/// 终端原始模式 RAII 守卫
struct RawModeGuard {
    original: libc::termios,
}

impl RawModeGuard {
    /// 进入原始模式，返回守卫（离开作用域自动恢复）
    fn enter() -> Option<Self> {
        unsafe {
            let mut original: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut original) != 0 {
                return None;
            }

            let mut raw = original;
            // 关闭 canonical 模式和回显，非阻塞读取
            raw.c_lflag &= !(libc::ICANON | libc::ECHO);
            raw.c_cc[libc::VMIN] = 0;
            raw.c_cc[libc::VTIME] = 0;

            if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw) != 0 {
                return None;
            }

            Some(Self { original })
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.original);
        }
    }
}

/// 非阻塞读取一个字符
fn read_char_nonblocking() -> Option<u8> {
    let mut buf = [0u8; 1];
    match io::stdin().lock().read(&mut buf) {
        Ok(1) => Some(buf[0]),
        _ => None,
    }
}

/// rampout - click-free real-time audio output
#[derive(Parser)]
#[command(name = "rampout")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use the in-process virtual device instead of real hardware
    #[arg(long = "virtual", global = true)]
    use_virtual: bool,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List output devices
    Devices,

    /// Play a test tone
    Play(PlayArgs),
}

#[derive(Args)]
struct PlayArgs {
    /// Output device name (exact match, then case-insensitive prefix)
    #[arg(short, long)]
    device: Option<String>,

    /// Output sample rate in Hz
    #[arg(short = 'r', long, default_value_t = 44100)]
    sample_rate: u32,

    /// Output channel count
    #[arg(short, long, default_value_t = 2)]
    channels: u16,

    /// Output sample format (f32 or i16)
    #[arg(long, default_value_t = SampleFormat::F32)]
    format: SampleFormat,

    /// Tone frequency in Hz
    #[arg(long, default_value_t = 440.0)]
    frequency: f32,

    /// Tone amplitude (0.0 - 1.0)
    #[arg(long, default_value_t = 0.2)]
    amplitude: f32,

    /// Stop after this many seconds
    #[arg(long)]
    seconds: Option<f64>,

    /// Run without opening any sound device
    #[arg(long)]
    no_sound: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    let default_filter = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let system = Arc::new(AudioSystem::new(make_backend(cli.use_virtual)));

    match cli.command {
        Commands::Devices => show_devices(&system),
        Commands::Play(ref args) => play_tone(system, args),
    }
}

#[cfg(feature = "cpal")]
fn make_backend(force_virtual: bool) -> Arc<dyn AudioBackend> {
    if force_virtual {
        Arc::new(VirtualBackend::new())
    } else {
        Arc::new(rampout::audio::CpalBackend::new())
    }
}

#[cfg(not(feature = "cpal"))]
fn make_backend(force_virtual: bool) -> Arc<dyn AudioBackend> {
    if !force_virtual {
        log::warn!("Built without the `cpal` feature, using the virtual output device");
    }
    Arc::new(VirtualBackend::new())
}

/// 显示设备列表
fn show_devices(system: &AudioSystem) -> anyhow::Result<()> {
    println!("=== Audio Output Devices ({}) ===\n", system.backend().name());

    system.refresh_if_idle()?;
    let default_index = system.backend().default_output_device();
    let devices = system.output_devices()?;
    if devices.is_empty() {
        println!("No output devices found.");
        return Ok(());
    }

    for device in &devices {
        let default_mark = if Some(device.index) == default_index { " *" } else { "" };
        println!("{}{}", device, default_mark);
    }
    println!();
    println!("* = system default");
    println!("Select device: rampout play -d <NAME>");
    Ok(())
}

/// 播放测试音
fn play_tone(system: Arc<AudioSystem>, args: &PlayArgs) -> anyhow::Result<()> {
    let config = PlayerConfig {
        sample_rate: args.sample_rate,
        channels: args.channels,
        sample_format: args.format,
        preferred_device: args.device.clone(),
        sound_output_enabled: !args.no_sound,
    };

    let fader = Arc::new(Fader::new());
    let tone = Arc::new(ToneSource::new(
        Arc::clone(&fader),
        args.frequency,
        args.amplitude,
        config.sample_rate,
        config.channels,
    ));
    let player = Player::with_producer(config, system, fader, tone);
    player.set_on_playing_state_change(|change| {
        log::info!(
            "Playing state: {} -> {}",
            change.old_state,
            change.new_state
        );
        Ok(())
    });

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    player.set_playing(true)?;
    println!(
        "rampout - {} Hz tone on '{}'",
        args.frequency,
        player.sound_device()
    );
    println!("Controls: [Space] pause/resume | [r] reset output | [q] quit | [Ctrl+C] quit\n");

    let _raw_guard = RawModeGuard::enter();
    let started = Instant::now();
    let deadline = args.seconds.map(Duration::from_secs_f64);

    while running.load(Ordering::SeqCst) {
        if deadline.is_some_and(|d| started.elapsed() >= d) {
            break;
        }

        match read_char_nonblocking() {
            Some(b' ') => {
                let playing = !player.is_playing();
                if let Err(e) = player.set_playing(playing) {
                    eprintln!("\nCannot resume: {}", e);
                }
            }
            Some(b'r') => {
                player.reset_playing()?;
                player.set_playing(true)?;
            }
            Some(b'q') => break,
            _ => {}
        }

        let (callbacks, underflows) = player
            .output_stream()
            .map(|s| (s.stats().callback_count(), s.stats().underflow_count()))
            .unwrap_or((0, 0));
        let state = if player.is_playing() { "▶" } else { "⏸" };
        print!(
            "\r{} {:6.1}s | gain {:4.2} | callbacks: {} | underflows: {}   ",
            state,
            started.elapsed().as_secs_f64(),
            player.fader().gain(),
            callbacks,
            underflows
        );
        io::stdout().flush()?;
        std::thread::sleep(Duration::from_millis(50));
    }
    println!();

    let report = player
        .output_stream()
        .map(|s| s.stats().report(s.format().sample_rate));
    player.stop_smoothly(STOP_TIMEOUT)?;

    if let Some(report) = report {
        println!("\n{}", report);
    }
    Ok(())
}
