use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use owo_colors::OwoColorize;
use razor_voice::audio::{
    AudioSource, Capture, CommandDeviceController, MuteGate, Vad, VadEvent, wav,
};
use razor_voice::bluetooth::{BlueutilController, LinkEvent, LinkMonitor};
use razor_voice::cli::{Cli, Commands, ConfigAction};
use razor_voice::config::Config;
use razor_voice::events::{AssistantEvent, EventBus};
use razor_voice::interrupt::InterruptMonitor;
use razor_voice::playback::{CommandAudioSink, PlaybackEngine, PlaybackOutcome, SynthesizedAudio};
use razor_voice::system::SystemCommandExecutor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    match cli.command {
        Commands::Listen { wav, duration } => {
            let mut config = load_config(cli.config.as_deref())?;
            if cli.device.is_some() {
                config.audio.input_device = cli.device;
            }
            config.validate()?;
            run_listen(&config, wav.as_deref(), duration, cli.quiet).await?;
        }
        Commands::Devices => {
            list_audio_devices()?;
        }
        Commands::Play { file, output } => {
            let mut config = load_config(cli.config.as_deref())?;
            if output.is_some() {
                config.playback.output_device = output;
            }
            config.validate()?;
            run_play(&config, &file).await?;
        }
        Commands::Bluetooth { name } => {
            let mut config = load_config(cli.config.as_deref())?;
            if name.is_some() {
                config.bluetooth.device = name;
            }
            run_bluetooth(&config).await?;
        }
        Commands::Config { action } => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "razor-voice",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

/// Installs the `tracing` subscriber. `RUST_LOG` overrides the `-v`/`-q` flags.
fn init_logging(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration with the following priority:
/// 1. Custom config path (if provided via --config)
/// 2. Default config path (~/.config/razor-voice/config.toml)
/// 3. Built-in defaults with environment variable overrides
fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        Config::load(path).with_context(|| format!("failed to load {}", path.display()))?
    } else {
        Config::load_or_default(&Config::default_path()?)?
    };

    Ok(config.with_env_overrides())
}

fn config_path(custom_path: Option<&Path>) -> Result<PathBuf> {
    match custom_path {
        Some(path) => Ok(path.to_path_buf()),
        None => Config::default_path(),
    }
}

#[cfg(feature = "cpal-audio")]
fn open_microphone(config: &Config) -> Result<Box<dyn AudioSource>> {
    use razor_voice::audio::AudioSourceConfig;
    use razor_voice::audio::microphone::CpalAudioSource;

    let source = CpalAudioSource::new(&AudioSourceConfig {
        sample_rate: config.audio.sample_rate,
        device: config.audio.input_device.clone(),
    })?;
    tracing::info!(device = %source.device_name(), "Using input device");
    Ok(Box::new(source))
}

#[cfg(not(feature = "cpal-audio"))]
fn open_microphone(_config: &Config) -> Result<Box<dyn AudioSource>> {
    anyhow::bail!("built without microphone support; use --wav or enable the cpal-audio feature")
}

/// Capture, VAD and barge-in level check, without wake or playback.
async fn run_listen(
    config: &Config,
    wav_path: Option<&Path>,
    duration: Option<Duration>,
    quiet: bool,
) -> Result<()> {
    let source: Box<dyn AudioSource> = match wav_path {
        Some(path) if path == Path::new("-") => Box::new(wav::WavAudioSource::from_stdin()?),
        Some(path) => Box::new(
            wav::WavAudioSource::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?,
        ),
        None => open_microphone(config)?,
    };

    let events = EventBus::new();
    let event_rx = events.subscribe();
    let (capture, mut frames) =
        Capture::spawn(source, config.capture_config(), MuteGate::new(), events)?;

    let mut vad = Vad::new(config.vad_config());
    let mut monitor = InterruptMonitor::new(config.interrupt_config());
    monitor.arm();

    if !quiet {
        eprintln!("{}", "Listening... (Ctrl-C to stop)".green());
    }

    let deadline = duration.map(|d| tokio::time::Instant::now() + d);
    let mut segments = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sleep_until_deadline(deadline) => break,
            captured = frames.recv() => {
                let Some(captured) = captured else {
                    if let Some(VadEvent::SpeechEnd(segment)) = vad.flush() {
                        segments += 1;
                        report_segment(segments, segment.speech_ms, quiet);
                    }
                    break;
                };
                if monitor.process(&captured.frame) {
                    if !quiet {
                        println!("{}", "  barge-in level reached".yellow());
                    }
                    monitor.arm();
                }
                match vad.process(&captured.frame) {
                    Some(VadEvent::SpeechStart { .. }) if !quiet => println!("{}", "speech".cyan()),
                    Some(VadEvent::SpeechEnd(segment)) => {
                        segments += 1;
                        report_segment(segments, segment.speech_ms, quiet);
                    }
                    _ => {}
                }
            }
        }

        for event in event_rx.try_iter() {
            if let AssistantEvent::CaptureNoAudio { timeout_ms } = event {
                eprintln!(
                    "{}",
                    format!("No audio received for {}ms, check the input device", timeout_ms).red()
                );
            }
        }
    }

    capture.stop();
    if !quiet {
        eprintln!("{} speech segment(s)", segments);
    }
    Ok(())
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn report_segment(index: usize, speech_ms: u32, quiet: bool) {
    if !quiet {
        println!("  segment {}: {}ms", index, speech_ms);
    }
}

/// List available audio input devices.
#[cfg(feature = "cpal-audio")]
fn list_audio_devices() -> Result<()> {
    let devices = razor_voice::audio::microphone::list_devices()?;

    if devices.is_empty() {
        eprintln!("No audio input devices found");
        std::process::exit(1);
    }

    println!("Available audio input devices:");
    for (idx, device) in devices.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }

    Ok(())
}

#[cfg(not(feature = "cpal-audio"))]
fn list_audio_devices() -> Result<()> {
    anyhow::bail!("built without microphone support; enable the cpal-audio feature")
}

/// Plays a WAV file with the same device enforcement replies get.
async fn run_play(config: &Config, file: &Path) -> Result<()> {
    let reader = std::fs::File::open(file)
        .with_context(|| format!("failed to open {}", file.display()))?;
    let (samples, sample_rate) = wav::decode_mono(std::io::BufReader::new(reader))?;
    let label = file.display().to_string();
    let audio = SynthesizedAudio::new(samples, sample_rate, &label);

    let executor = Arc::new(SystemCommandExecutor::new());
    let engine = PlaybackEngine::new(
        Arc::new(CommandAudioSink::new(&config.playback.player)),
        Arc::new(CommandDeviceController::new(executor)),
        config.playback_config(),
        EventBus::new(),
    );

    eprintln!(
        "Playing {} ({:.1}s){}",
        label,
        audio.duration().as_secs_f32(),
        config
            .playback
            .output_device
            .as_deref()
            .map(|d| format!(" on {}", d))
            .unwrap_or_default()
    );

    let playback = engine.play(audio);
    tokio::pin!(playback);
    let outcome = tokio::select! {
        outcome = &mut playback => outcome,
        _ = tokio::signal::ctrl_c() => {
            engine.interrupt();
            playback.await
        }
    };

    match outcome {
        PlaybackOutcome::Finished => println!("{}", "Finished".green()),
        PlaybackOutcome::Interrupted => println!("{}", "Interrupted".yellow()),
        PlaybackOutcome::Failed(error) => anyhow::bail!("playback failed: {}", error),
    }
    Ok(())
}

/// Runs the headset link monitor and prints its events until Ctrl-C.
async fn run_bluetooth(config: &Config) -> Result<()> {
    let Some(link_config) = config.link_monitor_config() else {
        anyhow::bail!("no Bluetooth device configured; set bluetooth.device or pass --name");
    };

    let executor = Arc::new(SystemCommandExecutor::new());
    let events = EventBus::new();
    let rx = events.subscribe();
    let monitor = LinkMonitor::new(
        Arc::new(BlueutilController::new(executor.clone())),
        Arc::new(CommandDeviceController::new(executor)),
        link_config.clone(),
        events,
    );
    monitor.start().await?;

    eprintln!(
        "{}",
        format!("Monitoring {} (Ctrl-C to stop)", link_config.device_name).green()
    );

    let mut tick = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tick.tick() => {
                for event in rx.try_iter() {
                    if let AssistantEvent::Link { link } = event {
                        print_link_event(&link);
                    }
                }
            }
        }
    }

    monitor.stop();
    Ok(())
}

fn print_link_event(event: &LinkEvent) {
    let line = serde_json::to_string(event).unwrap_or_else(|_| format!("{:?}", event));
    match event {
        LinkEvent::Connected { .. } | LinkEvent::Reconnected { .. } => println!("{}", line.green()),
        LinkEvent::Disconnected { .. } | LinkEvent::ReconnectFailed { .. } => {
            println!("{}", line.red())
        }
        _ => println!("{}", line),
    }
}

fn handle_config_command(action: ConfigAction, config_path_override: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(config_path_override)?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Path => {
            println!("{}", config_path(config_path_override)?.display());
        }
        ConfigAction::Init { force } => {
            let path = config_path(config_path_override)?;
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            std::fs::write(&path, toml::to_string_pretty(&Config::default())?)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("{} {}", "Wrote".green(), path.display());
        }
    }
    Ok(())
}
