use chrono::Local;
use echoflow::conversation::{LifecycleState, SessionSnapshot};
use echoflow::session::{Collaborators, SessionConfig, SessionHandle};
use echoflow::settings::{self, Settings};
use echoflow::transport::Transport;
use echoflow::usage;
use std::io::BufRead;
use tokio::sync::mpsc;

fn main() {
    env_logger::init();

    let mut settings = settings::load();
    if let Some(url) = std::env::args().nth(1) {
        settings.server_url = url;
    }
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("[echoflow] failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };
    runtime.block_on(run(settings));
}

fn print_help() {
    println!("[echoflow] commands: l=listen s=stop listening i=interrupt e=end conversation");
    println!("[echoflow]           c=reconnect v <0-1>=volume d=list microphones");
    println!("[echoflow]           u=recent sessions q=quit");
}

/// What has already been printed, so only changes are reported.
#[derive(Default)]
struct Printed {
    lifecycle: Option<LifecycleState>,
    partial: String,
    response: Option<String>,
    turns: usize,
    error: Option<String>,
}

fn report(printed: &mut Printed, snap: &SessionSnapshot) {
    let ts = Local::now().format("%H:%M:%S");
    if printed.lifecycle != Some(snap.lifecycle) {
        println!("[{}] state: {}", ts, snap.lifecycle);
        printed.lifecycle = Some(snap.lifecycle);
    }
    if !snap.transcript.partial.is_empty() && snap.transcript.partial != printed.partial {
        println!("[{}] you (partial): {}", ts, snap.transcript.partial);
    }
    printed.partial = snap.transcript.partial.clone();
    if snap.response_text.is_some() && snap.response_text != printed.response {
        let label = if snap.has_final_response { "final" } else { "reply" };
        println!(
            "[{}] assistant ({}): {}",
            ts,
            label,
            snap.response_text.as_deref().unwrap_or("")
        );
    }
    printed.response = snap.response_text.clone();
    if let Some(note) = &snap.response.patience_note {
        log::debug!("[echoflow] patience: {}", note);
    }
    if snap.history.len() > printed.turns {
        for turn in &snap.history[printed.turns..] {
            println!(
                "[{}] turn: \"{}\" -> \"{}\" ({} ms)",
                ts, turn.user_input, turn.ai_response, turn.duration_ms
            );
        }
    }
    printed.turns = snap.history.len();
    let error = snap
        .active_error
        .as_ref()
        .map(|e| format!("{}: {}{}", e.code, e.message, if e.retryable { " (retryable)" } else { "" }));
    if error.is_some() && error != printed.error {
        println!("[{}] error {}", ts, error.as_deref().unwrap_or(""));
    }
    printed.error = error;
}

/// Persist a volume change without writing back command-line overrides.
fn remember_volume(volume: f32) {
    let mut stored = settings::load();
    stored.volume = volume.clamp(0.0, 1.0);
    if let Err(e) = settings::save(&stored) {
        log::warn!("[echoflow] {}", e);
    }
}

fn print_recent_sessions() {
    let path = match usage::session_usage_path() {
        Ok(path) => path,
        Err(e) => {
            println!("[usage] {}", e);
            return;
        }
    };
    let recent = usage::load_recent_sessions(&path, 5);
    if recent.is_empty() {
        println!("[usage] no completed sessions yet");
    }
    for session in recent {
        let started = chrono::DateTime::from_timestamp_millis(session.started_ms)
            .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "[usage] {} turns={} utterances={} sent={:.1}s errors={}",
            started,
            session.turns,
            session.utterances,
            session.ms_sent as f64 / 1000.0,
            session.errors
        );
    }
}

async fn run(settings: Settings) {
    let transport = Transport::websocket(settings.transport_config());
    let endpoint = transport.endpoint();
    let session = SessionHandle::spawn(
        transport,
        Collaborators::system(&settings),
        SessionConfig::from_settings(&settings),
    );

    println!("[echoflow] connecting to {}", endpoint);
    match session.connect().await {
        Ok(()) => session.start_conversation(),
        Err(e) => eprintln!("[echoflow] connect failed: {} (press c to retry)", e),
    }

    // Stdin is blocking; read it on a plain thread.
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    print_help();
    let mut snapshots = session.subscribe();
    let mut printed = Printed::default();
    loop {
        tokio::select! {
            line = line_rx.recv() => match line.as_deref().map(str::trim) {
                None | Some("q") => break,
                Some("") => {}
                Some("l") => session.start_listening(),
                Some("s") => session.stop_listening(),
                Some("i") => session.interrupt(),
                Some("e") => session.stop_conversation(),
                Some("c") => match session.connect().await {
                    Ok(()) => session.start_conversation(),
                    Err(e) => eprintln!("[echoflow] connect failed: {}", e),
                },
                Some("d") => {
                    for name in echoflow::audio::list_input_devices() {
                        println!("[echoflow] mic: {}", name);
                    }
                }
                Some("u") => print_recent_sessions(),
                Some(cmd) if cmd.starts_with("v ") => match cmd[2..].trim().parse::<f32>() {
                    Ok(volume) => {
                        session.set_volume(volume);
                        remember_volume(volume);
                    }
                    Err(_) => println!("[echoflow] volume must be a number between 0 and 1"),
                },
                Some(other) => {
                    println!("[echoflow] unknown command '{}'", other);
                    print_help();
                }
            },
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snap = snapshots.borrow_and_update().clone();
                report(&mut printed, &snap);
            }
        }
    }

    session.stop_conversation();
    if let Some(usage) = session.shutdown().await {
        println!(
            "[usage] turns={} utterances={} sent={:.1}s bytes={:.1}KB interrupts={} reconnects={}",
            usage.turns,
            usage.utterances,
            usage.ms_sent as f64 / 1000.0,
            usage.bytes_sent as f64 / 1024.0,
            usage.interrupts,
            usage.reconnects
        );
    }
}
