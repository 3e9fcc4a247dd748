use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use duet_core::call::CallStatus;
use duet_core::config::Config;
use duet_core::content::{ChatGenerator, GeminiGenerator, QuestionSource, TextGenerator};
use duet_core::media::UnavailableMedia;
use duet_core::persistence::{FileSnapshotStore, SnapshotStore};
use duet_core::supervisor::Status;
use duet_core::{telemetry, Command, Event, ParticipantConfig, ParticipantHandle, Services};
use duet_proto::{ChallengeKind, GameMode, Intensity, Role};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use transport_bus::ws::WsConnector;

#[derive(Parser, Debug)]
#[command(name = "duet", about = "Two-player truth or dare over a shared relay")]
struct Cli {
    /// Relay WebSocket endpoint; overrides DUET_RELAY_URL.
    #[arg(long, global = true)]
    relay: Option<String>,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Create a session and wait for a partner.
    Host {
        #[arg(long)]
        code: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "friendly")]
        intensity: Intensity,
        #[arg(long, default_value = "fixed")]
        mode: GameMode,
    },
    /// Join a session created by the host.
    Join {
        #[arg(long)]
        code: String,
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = Config::from_env().context("invalid environment configuration")?;
    if let Some(relay) = cli.relay {
        config = config.with_relay_url(relay).context("invalid --relay")?;
    }
    telemetry::init_tracing(&config.log_filter);

    let participant = match cli.command {
        Mode::Host {
            code,
            name,
            intensity,
            mode,
        } => ParticipantConfig::new(code, Role::Host, name).with_game(intensity, mode),
        Mode::Join { code, name } => ParticipantConfig::new(code, Role::Guest, name),
    }
    .with_timings(&config);

    let services = services(&config)?;
    if let Ok(recent) = services.store.recent() {
        if let Some(last) = recent.first() {
            info!(code = %last.game_code, host = %last.host_name, guest = %last.guest_name, "most recent session");
        }
    }

    info!(relay = %config.relay_url, code = %participant.code, "starting participant");
    let (handle, events) = duet_core::spawn(participant, services);
    run(handle, events).await
}

fn services(config: &Config) -> anyhow::Result<Services> {
    let data_dir = config
        .data_dir
        .clone()
        .or_else(FileSnapshotStore::default_dir)
        .context("unable to determine a data directory; set DUET_DATA_DIR")?;
    let generator: Option<Arc<dyn TextGenerator>> = match (&config.gemini_api_key, &config.chat_url) {
        (Some(key), _) => Some(Arc::new(
            GeminiGenerator::new(key.clone(), config.gemini_model.clone())
                .context("failed to build question generator")?,
        )),
        (None, Some(url)) => Some(Arc::new(
            ChatGenerator::new(url, config.chat_api_key.clone(), config.chat_model.clone())
                .context("failed to build chat question generator")?,
        )),
        (None, None) => None,
    };
    let media = Arc::new(UnavailableMedia::default());
    Ok(Services {
        connector: Arc::new(WsConnector::new(config.relay_url.clone())),
        devices: media.clone(),
        transport: media,
        store: Arc::new(FileSnapshotStore::new(data_dir)) as Arc<dyn SnapshotStore>,
        questions: QuestionSource::new(generator),
    })
}

async fn run(
    handle: ParticipantHandle,
    mut events: tokio::sync::mpsc::UnboundedReceiver<Event>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print_help();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match parse_command(&line) {
                    Ok(Some(Command::Leave)) => break,
                    Ok(Some(command)) => {
                        if !handle.send(command) {
                            warn!("participant stopped");
                            return Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(message) => println!("! {message}"),
                }
            }
            event = events.recv() => match event {
                Some(event) => print_event(&handle, &event),
                None => return Ok(()),
            },
        }
    }
    handle.leave().await;
    Ok(())
}

fn print_help() {
    println!(
        "commands: /truth /dare /ask <secs> <text> /answer <text> /accept /love /reject \
         /auto /intensity <level> /allow /deny /ping /call /pickup /decline /hangup \
         /mute /camera /suggest [keywords] /react /retry /quit; anything else is chat"
    );
}

/// Maps one line of input to a command. `Ok(None)` means nothing to do.
fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::SendChat {
            text: line.to_string(),
            media: None,
        }));
    };
    let (verb, arg) = match rest.split_once(char::is_whitespace) {
        Some((verb, arg)) => (verb, arg.trim()),
        None => (rest, ""),
    };
    let command = match verb {
        "truth" => Command::StartTurn(ChallengeKind::Truth),
        "dare" => Command::StartTurn(ChallengeKind::Dare),
        "ask" => {
            let (limit, text) = match arg.split_once(char::is_whitespace) {
                Some((limit, text)) => (limit, text.trim()),
                None => (arg, ""),
            };
            let time_limit = match limit.parse::<u32>() {
                Ok(secs) => Some(secs),
                Err(_) if limit.is_empty() => None,
                // No number given: the whole argument is the challenge.
                Err(_) => {
                    return Ok(Some(Command::SubmitChallenge {
                        text: arg.to_string(),
                        time_limit: None,
                    }))
                }
            };
            Command::SubmitChallenge {
                text: text.to_string(),
                time_limit,
            }
        }
        "answer" => Command::SubmitResponse {
            text: arg.to_string(),
            media: None,
        },
        "accept" => Command::CompleteTurn {
            accepted: true,
            loved: false,
        },
        "love" => Command::CompleteTurn {
            accepted: true,
            loved: true,
        },
        "reject" => Command::CompleteTurn {
            accepted: false,
            loved: false,
        },
        "auto" => Command::ToggleAutoSelect,
        "intensity" => Command::RequestIntensity(arg.parse::<Intensity>()?),
        "allow" => Command::RespondIntensity(true),
        "deny" => Command::RespondIntensity(false),
        "ping" => Command::Ping,
        "call" => Command::StartCall,
        "pickup" => Command::AcceptCall,
        "decline" => Command::RejectCall,
        "hangup" => Command::EndCall,
        "mute" => Command::ToggleMute,
        "camera" => Command::ToggleVideo,
        "suggest" => Command::Suggest {
            kind: ChallengeKind::Truth,
            keywords: (!arg.is_empty()).then(|| arg.to_string()),
        },
        "react" => Command::React,
        "retry" => Command::Retry,
        "quit" | "exit" => Command::Leave,
        "help" => {
            print_help();
            return Ok(None);
        }
        other => return Err(format!("unknown command /{other}")),
    };
    Ok(Some(command))
}

fn print_event(handle: &ParticipantHandle, event: &Event) {
    match event {
        Event::StateChanged => {}
        Event::PartnerJoined { name, role } => println!("* {name} joined as {role}"),
        Event::PartnerDisconnected { name } => println!("* {name} left"),
        Event::ChatReceived(message) => println!("{}: {}", message.sender_name, message.text),
        Event::Typing(text) if !text.is_empty() => println!("  (typing: {text})"),
        Event::Typing(_) => {}
        Event::MessageRead(_) => {}
        Event::Ping(emoji) => println!("* {emoji}"),
        Event::IntensityRequested(level) => {
            println!("* partner asks for {}; /allow or /deny", level.label())
        }
        Event::IntensityChanged(level) => println!("* intensity is now {}", level.label()),
        Event::IntensityDenied => println!("* intensity change declined"),
        Event::TurnRejected => println!("* answer rejected; try again"),
        Event::LevelUp(level) => println!("* level up: {}", level.label()),
        Event::AutoSelectToggled(enabled) => {
            println!("* auto-select {}", if *enabled { "on" } else { "off" })
        }
        Event::Call(state) => match state.status {
            CallStatus::Idle => println!("* call ended"),
            CallStatus::Offering => println!("* calling..."),
            CallStatus::Ringing => {}
            CallStatus::Connected => println!("* call connected"),
        },
        Event::IncomingCall => println!("* incoming call; /pickup or /decline"),
        Event::CallFailed(reason) => println!("* call failed: {reason:?}"),
        Event::CallDeclined => println!("* call declined"),
        Event::Connectivity(state) => match (state.status, &state.last_error) {
            (Status::Error, Some(error)) => println!("! {error} Type /retry to try again."),
            _ => println!("* connection: {:?}", state.connectivity),
        },
        Event::Suggestion { kind, text } => println!("* {kind} idea: {text}"),
        Event::Reaction(text) => println!("* {text}"),
    }
    if matches!(event, Event::StateChanged) {
        print_turn(handle);
    }
}

fn print_turn(handle: &ParticipantHandle) {
    let state = handle.state();
    let Some(turn) = state.active_turn.as_ref() else {
        return;
    };
    let owner = state.name_of(turn.owner);
    let limit = turn
        .time_limit
        .map(|secs| format!(" ({secs}s)"))
        .unwrap_or_default();
    println!(
        "[{} {}/{}] {owner}'s {}: {:?}{limit} {}",
        state.game_code,
        state.scores.host,
        state.scores.guest,
        turn.kind,
        turn.status,
        turn.challenge
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_chat() {
        assert!(matches!(
            parse_command("hello there"),
            Ok(Some(Command::SendChat { text, .. })) if text == "hello there"
        ));
        assert!(matches!(parse_command("   "), Ok(None)));
    }

    #[test]
    fn ask_takes_optional_time_limit() {
        assert!(matches!(
            parse_command("/ask 30 Sing a song"),
            Ok(Some(Command::SubmitChallenge { text, time_limit: Some(30) })) if text == "Sing a song"
        ));
        assert!(matches!(
            parse_command("/ask Sing a song"),
            Ok(Some(Command::SubmitChallenge { text, time_limit: None })) if text == "Sing a song"
        ));
        assert!(matches!(
            parse_command("/ask"),
            Ok(Some(Command::SubmitChallenge { text, time_limit: None })) if text.is_empty()
        ));
    }

    #[test]
    fn intensity_argument_is_validated() {
        assert!(matches!(
            parse_command("/intensity very hot"),
            Ok(Some(Command::RequestIntensity(Intensity::VeryHot)))
        ));
        assert!(parse_command("/intensity lukewarm").is_err());
        assert!(parse_command("/nope").is_err());
    }
}
