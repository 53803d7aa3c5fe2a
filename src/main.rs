use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use vita_intake::bridge::{self, AudioSession, BridgeConfig, BridgeHandle, SessionContext};
use vita_intake::config::IntakeConfig;
use vita_intake::external::{EnvIdentity, Identity};
use vita_intake::routes::{RouteState, intake_routes};
use vita_intake::runner::{IntakeRunner, UiCommand, UserInput};
use vita_intake::session::WidgetType;
use vita_intake::store::{LibSqlStore, ProgressStore, RetryPolicy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // Fatal: no useful session can start without configuration or identity.
    let cfg = IntakeConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export VITA_AGENT_WS_URL=wss://...");
        std::process::exit(1);
    });
    let identity = EnvIdentity::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export VITA_PATIENT_ID=... VITA_AUTH_TOKEN=...");
        std::process::exit(1);
    });

    eprintln!("🩺 Vita Intake v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Agent: {}", cfg.agent_ws_url);
    eprintln!("   Status API: http://0.0.0.0:{}/api/intake/status", cfg.http_port);
    eprintln!("   Commands: submit <widget> <json> | edit <stage> | say <text> | /quit\n");

    // Fatal: unreachable backend at startup.
    let store: Arc<dyn ProgressStore> =
        Arc::new(LibSqlStore::new_local(&cfg.db_path).await.unwrap_or_else(|e| {
            eprintln!("Error: Failed to open database at {}: {e}", cfg.db_path.display());
            std::process::exit(1);
        }));
    eprintln!("   Database: {}", cfg.db_path.display());

    let retry = RetryPolicy {
        attempts: cfg.save_retry_attempts,
        ..RetryPolicy::default()
    };
    let (runner, snapshot_rx, mut ui_rx) = IntakeRunner::start(
        identity.current_user_id(),
        Arc::clone(&store),
        cfg.fallback_timeout,
        retry,
    )
    .await?;

    // Status server
    let app = intake_routes(RouteState {
        snapshot: snapshot_rx,
        store: Arc::clone(&store),
    });
    let http_port = cfg.http_port;
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{http_port}"))
            .await
            .expect("Failed to bind status server port");
        tracing::info!(port = http_port, "Status server started");
        axum::serve(listener, app).await.ok();
    });

    // Audio playback consumer. A real client hands chunks to the output
    // device; headless, we drain and drop stale generations.
    let (audio, mut playback) = AudioSession::new(32);
    let audio_for_playback = Arc::clone(&audio);
    tokio::spawn(async move {
        while let Some(chunk) = playback.recv().await {
            if audio_for_playback.is_current(&chunk) {
                tracing::trace!(bytes = chunk.pcm.len(), "Playing agent audio");
            }
        }
        audio_for_playback.mark_idle();
    });

    // Agent channel. Failure here is not fatal: intake proceeds locally and
    // the fallback drives stage transitions.
    let bridge_cfg = BridgeConfig {
        ws_url: cfg.agent_ws_url.clone(),
        auth_token: identity.auth_token().clone(),
        connect_timeout: cfg.connect_timeout,
        sample_rate_hz: cfg.sample_rate_hz,
    };
    let ctx = SessionContext::for_patient(identity.current_user_id());
    let (handle, events) = match bridge::open(&bridge_cfg, &ctx, Arc::clone(&audio)).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!("Agent unavailable, continuing without it: {e}");
            eprintln!("⚠️  Your guide is unavailable right now — continuing without it.");
            let (tx, rx) = mpsc::channel(1);
            drop(tx);
            (BridgeHandle::disconnected(), rx)
        }
    };

    // UI consumer
    tokio::spawn(async move {
        while let Some(command) = ui_rx.recv().await {
            match command {
                UiCommand::AgentSpeech { text } => println!("\n{text}\n"),
                UiCommand::ShowWidget { widget } => eprintln!("📋 Please fill in: {widget}"),
                UiCommand::HighlightField { widget, field } => {
                    eprintln!("👉 {widget}: check the {field} field")
                }
                UiCommand::StageChanged { stage_id, synthetic } => {
                    if synthetic {
                        eprintln!("⏭  Moved to {stage_id} (local fallback)");
                    } else {
                        eprintln!("➡️  Moved to {stage_id}");
                    }
                }
                UiCommand::ValidationFailed { widget, message } => {
                    eprintln!("❌ {widget}: {message}")
                }
                UiCommand::Warning { message } => eprintln!("⚠️  {message}"),
                UiCommand::Completed => eprintln!("✅ Intake complete"),
            }
            eprint!("> ");
        }
    });

    // Stdin input loop
    let (input_tx, input_rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let stdin = tokio::io::stdin();
        let reader = BufReader::new(stdin);
        let mut lines = reader.lines();
        eprint!("> ");
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        eprint!("> ");
                        continue;
                    }
                    match parse_input(line) {
                        Some(input) => {
                            let quit = matches!(input, UserInput::Quit);
                            if input_tx.send(input).await.is_err() || quit {
                                break;
                            }
                        }
                        None => {
                            eprintln!("Unrecognized command");
                            eprint!("> ");
                        }
                    }
                }
                Ok(None) => break, // EOF
                Err(e) => {
                    tracing::error!("Error reading stdin: {e}");
                    break;
                }
            }
        }
    });

    let outcome = runner.run(handle, events, input_rx).await?;
    if outcome.complete {
        eprintln!("\nSession complete.");
    }
    if !outcome.unresolved.is_empty() {
        eprintln!(
            "Stages needing another look: {}",
            outcome.unresolved.join(", ")
        );
    }
    Ok(())
}

fn parse_input(line: &str) -> Option<UserInput> {
    if line == "/quit" || line == "/exit" {
        return Some(UserInput::Quit);
    }
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "say" if !rest.is_empty() => Some(UserInput::Text(rest.to_string())),
        "edit" if !rest.is_empty() => Some(UserInput::Edit {
            stage_id: rest.trim().to_string(),
        }),
        "submit" => {
            let (widget_name, json) = rest.split_once(' ')?;
            let widget = WidgetType::parse(widget_name.trim())?;
            let fields = serde_json::from_str::<serde_json::Value>(json.trim())
                .ok()?
                .as_object()?
                .clone();
            Some(UserInput::Submission { widget, fields })
        }
        _ => None,
    }
}
