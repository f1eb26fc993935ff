use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::{oneshot, watch};
use tracing_subscriber::EnvFilter;

use seer_voice::vision::{CommandCamera, FillerClips};
use seer_voice::voice::{
    AudioClip, CaptureConfig, CpalInput, DevicePlayback, PlaybackQueue, samples_to_wav,
    start_capture,
};
use seer_voice::{BackendClient, CardSpotter, Config, ReadingPoller, SpeechStream, Watcher};

/// Seer - voice-driven conversational front end
#[derive(Parser)]
#[command(name = "seer", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Hold a spoken conversation with the server
    Listen,
    /// Watch the camera and play readings as they complete
    Watch,
    /// Watch the camera until a hand is verified
    Spot,
    /// Speak text through the streaming TTS voice
    Speak {
        /// Text to speak
        #[arg(default_value = "The cards are listening. Ask your question.")]
        text: String,
    },
    /// Reset the conversation
    Reset {
        /// System message (defaults to the configured one)
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Check the server status
    Status,
    /// Test microphone input and silence detection
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,seer_voice=info",
        1 => "info,seer_voice=debug,seer=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Command::Listen => listen(config).await,
        Command::Watch => watch_readings(config).await,
        Command::Spot => spot(config).await,
        Command::Speak { text } => speak(&config, &text).await,
        Command::Reset { message } => reset(&config, message).await,
        Command::Status => status(&config).await,
        Command::TestMic { duration } => test_mic(&config, duration).await,
        Command::TestSpeaker => test_speaker().await,
    }
}

/// How long to wait after an upload for the reply to start playing
const REPLY_WAIT: Duration = Duration::from_secs(3);

/// Conversation loop: capture, gate, upload, play replies; capture pauses while
/// replies play
async fn listen(config: Config) -> anyhow::Result<()> {
    let settings = config.settings.clone();
    let backend = BackendClient::new(&config.api_url);
    let input = CpalInput::new(config.input_device.clone());

    if let Err(e) = backend.reset_conversation(&settings.system_message).await {
        tracing::warn!(error = %e, "could not reset conversation");
    }

    let (paused_tx, mut paused) = watch::channel(false);
    let paused_tx = Arc::new(paused_tx);
    let queue = PlaybackQueue::builder(Arc::new(DevicePlayback::default()))
        .on_start({
            let tx = Arc::clone(&paused_tx);
            move || {
                tracing::debug!("reply playing, pausing capture");
                tx.send_replace(true);
            }
        })
        .on_empty({
            let tx = Arc::clone(&paused_tx);
            move || {
                tracing::debug!("reply finished, resuming capture");
                tx.send_replace(false);
            }
        })
        .build();

    let mut events: Option<tokio::task::JoinHandle<()>> = None;
    println!("Listening. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = paused.wait_for(|p| !*p) => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        let (utterance_tx, utterance_rx) = oneshot::channel();
        let mut capture = start_capture(&input, CaptureConfig::from(&settings), move |u| {
            let _ = utterance_tx.send(u);
        })?;

        let utterance = tokio::select! {
            u = utterance_rx => u.ok(),
            _ = paused.wait_for(|p| *p) => {
                capture.cancel();
                None
            }
            _ = tokio::signal::ctrl_c() => {
                capture.cancel();
                capture.finished().await;
                break;
            }
        };
        let Some(utterance) = utterance else {
            continue;
        };

        if !utterance.is_loud_enough(settings.send_volume_threshold) {
            tracing::debug!(peak = utterance.peak_volume, "utterance too quiet, dropped");
            continue;
        }

        tracing::info!(
            peak = utterance.peak_volume,
            bytes = utterance.audio.len(),
            reason = ?utterance.reason,
            "sending utterance"
        );
        if let Err(e) = backend.upload_audio(utterance.audio, &settings).await {
            tracing::error!(error = %e, "utterance upload failed");
            continue;
        }

        if events.as_ref().is_none_or(tokio::task::JoinHandle::is_finished) {
            let backend = backend.clone();
            let queue = queue.clone();
            events = Some(tokio::spawn(async move {
                let pushed = backend
                    .response_events(|bytes| queue.push(AudioClip::from(bytes)))
                    .await;
                if let Err(e) = pushed {
                    tracing::error!(error = %e, "response events failed");
                }
            }));
        }

        // hold the microphone until the reply starts or the wait runs out
        tokio::select! {
            started = queue.wait_busy(REPLY_WAIT) => {
                if !started {
                    tracing::debug!("no reply yet, listening again");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Some(events) = events {
        events.abort();
    }
    Ok(())
}

/// Reading recognizer until Ctrl+C
async fn watch_readings(config: Config) -> anyhow::Result<()> {
    let backend = Arc::new(BackendClient::new(&config.api_url));
    let camera = Arc::new(CommandCamera::new(config.camera_command.clone())?);
    let queue = PlaybackQueue::new(Arc::new(DevicePlayback::default()));
    let (_settings_tx, settings) = watch::channel(config.settings.clone());

    let watcher = Watcher::new(ReadingPoller::new(backend, camera, queue.clone(), settings));
    let mut status = watcher.subscribe();
    watcher.set_watch_mode(true);
    println!("Watching for cards. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = status.borrow_and_update().clone();
                println!("stage: {} (task: {})", state.stage, state.task_id.as_deref().unwrap_or("-"));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    watcher.set_watch_mode(false);
    watcher.wait_stopped().await;
    queue.wait_idle().await;
    Ok(())
}

/// Card spotter until a hand is verified or Ctrl+C
async fn spot(config: Config) -> anyhow::Result<()> {
    let backend = Arc::new(BackendClient::new(&config.api_url));
    let camera = Arc::new(CommandCamera::new(config.camera_command.clone())?);
    let queue = PlaybackQueue::new(Arc::new(DevicePlayback::default()));
    let filler = match &config.filler_dir {
        Some(dir) => FillerClips::load_dir(dir)?,
        None => FillerClips::default(),
    };
    let (_settings_tx, settings) = watch::channel(config.settings.clone());

    let spotter = CardSpotter::new(backend, camera, queue.clone(), filler, settings, |hand| {
        match serde_json::to_string_pretty(&hand) {
            Ok(json) => println!("Hand verified:\n{json}"),
            Err(e) => tracing::error!(error = %e, "could not print hand"),
        }
    });
    let watcher = Watcher::new(spotter);
    watcher.set_watch_mode(true);
    println!("Looking for a hand. Press Ctrl+C to stop.");

    tokio::select! {
        () = watcher.wait_stopped() => {}
        _ = tokio::signal::ctrl_c() => {
            watcher.set_watch_mode(false);
            watcher.wait_stopped().await;
        }
    }

    queue.wait_idle().await;
    Ok(())
}

/// Stream text word by word through the TTS voice
async fn speak(config: &Config, text: &str) -> anyhow::Result<()> {
    if config.tts.api_key.is_none() {
        anyhow::bail!("ELEVENLABS_API_KEY is not set");
    }

    let queue = PlaybackQueue::new(Arc::new(DevicePlayback::default()));
    let tts = SpeechStream::with_queue(&config.tts, queue.clone());
    tts.online();

    for word in text.split_inclusive(' ') {
        tts.send_text(word).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
    }
    tts.send_text_done().await;

    // audio trickles in after the end marker; stop once it has been quiet a while
    let mut quiet = Duration::ZERO;
    while quiet < Duration::from_secs(3) {
        tokio::time::sleep(Duration::from_millis(250)).await;
        if queue.is_playing() {
            quiet = Duration::ZERO;
        } else {
            quiet += Duration::from_millis(250);
        }
    }

    tracing::info!(state = %tts.ready_state(), "speech finished");
    tts.offline().await;
    Ok(())
}

async fn reset(config: &Config, message: Option<String>) -> anyhow::Result<()> {
    let backend = BackendClient::new(&config.api_url);
    let message = message.unwrap_or_else(|| config.settings.system_message.clone());
    let status = backend.reset_conversation(&message).await?;
    println!("Reset: {status:?}");
    Ok(())
}

async fn status(config: &Config) -> anyhow::Result<()> {
    let backend = BackendClient::new(&config.api_url);
    match backend.server_status().await {
        Ok(status) => println!("Server: {status}"),
        Err(e) => {
            tracing::debug!(error = %e, "status check failed");
            println!("Server: offline");
        }
    }
    Ok(())
}

/// Test microphone input with the live volume meter
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for up to {duration} seconds...");
    println!("Speak, then stay quiet to end the utterance.\n");

    let input = CpalInput::new(config.input_device.clone());
    let (utterance_tx, mut utterance_rx) = oneshot::channel();
    let mut capture = start_capture(&input, CaptureConfig::from(&config.settings), move |u| {
        let _ = utterance_tx.send(u);
    })?;
    let volume = capture.volume();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    let mut ticker = tokio::time::interval(Duration::from_millis(200));

    let utterance = loop {
        tokio::select! {
            u = &mut utterance_rx => break u.ok(),
            _ = ticker.tick() => {
                let level = *volume.borrow();
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let width = (level / 255.0 * 50.0).clamp(0.0, 50.0) as usize;
                println!("[{:>5.1}] [{}{}]", level, "#".repeat(width), " ".repeat(50 - width));
            }
            () = tokio::time::sleep_until(deadline) => {
                capture.finish();
                break (&mut utterance_rx).await.ok();
            }
        }
    };

    match utterance {
        Some(u) => println!(
            "\nUtterance: {} bytes, peak volume {:.1}, ended by {:?}",
            u.audio.len(),
            u.peak_volume,
            u.reason
        ),
        None => println!("\nNo utterance captured"),
    }
    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    use seer_voice::voice::AudioSink;

    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24000_u32;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (std::f32::consts::TAU * 440.0 * t).sin() * 0.3
        })
        .collect();

    let clip = AudioClip::from(samples_to_wav(&samples, sample_rate)?);
    DevicePlayback::default().play(&clip).await?;

    println!("If you heard the tone, your speakers are working!");
    Ok(())
}
