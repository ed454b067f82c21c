//! Softphone CLI
//!
//! Verbindet den Agent, ruft das konfigurierte Ziel an und wartet auf
//! Eingaben: `a` startet blockiertes Audio, `h` legt auf, `c` ruft erneut
//! an, `r` verbindet über die alternativen Endpunkte, `q` oder Ctrl-C beendet.

use anyhow::Context;
use softphone_lib::{PhoneConfig, PhoneEvent, Softphone, StatusSink};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Schreibt Status-Texte auf die Konsole
struct ConsoleStatus;

impl StatusSink for ConsoleStatus {
    fn report_status(&self, text: &str) {
        println!("» {}", text);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    softphone_lib::init_logging();

    let config = PhoneConfig::load().context("Failed to load configuration")?;
    tracing::info!("Dial target: {}", config.target_address());

    let phone = Arc::new(Softphone::from_config(config, Arc::new(ConsoleStatus)));

    let mut events = phone.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if event == PhoneEvent::AudioBlocked {
                println!("» press 'a' + Enter to start audio");
            }
        }
    });

    phone.initialize().await;
    if let Err(e) = phone.place_call().await {
        tracing::warn!("Call not started: {}", e);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "a" => {
                        phone.resume_audio();
                    }
                    "h" => phone.hangup().await,
                    "c" => {
                        if let Err(e) = phone.place_call().await {
                            tracing::warn!("Call not started: {}", e);
                        }
                    }
                    "r" => {
                        let mode = phone.reconnect().await;
                        tracing::info!("Agent mode after reconnect: {:?}", mode);
                    }
                    "q" => break,
                    "" => {}
                    other => println!("» unknown command: {}", other),
                },
                Ok(None) => {
                    // stdin geschlossen, auf Ctrl-C warten
                    tokio::signal::ctrl_c().await?;
                    break;
                }
                Err(e) => return Err(e).context("Failed to read stdin"),
            }
        }
    }

    tracing::info!("Shutting down...");
    phone.shutdown().await;
    Ok(())
}
