use anyhow::{Context, Result};
use colored::Colorize;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use triage_chat::TriageService;
use triage_chat::config::Config;
use triage_chat::dispatcher::Dispatcher;
use triage_chat::models::{TriageVerdict, Urgency};
use triage_chat::session::{ChatSession, Language};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so the repl's stdout stays clean
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load();
    let service = TriageService::new(&config)?;

    let mode = std::env::var("TRIAGE_MODE").unwrap_or_else(|_| "http".to_string());
    match mode.as_str() {
        "repl" => {
            let dispatcher = service.dispatcher();
            run_repl(&dispatcher).await
        }
        _ => {
            let bind: SocketAddr = config
                .server
                .bind
                .parse()
                .with_context(|| format!("Invalid bind address {}", config.server.bind))?;
            let router = service.router(config.server.bearer_token.clone());

            let listener = tokio::net::TcpListener::bind(bind).await?;
            tracing::info!(
                %bind,
                auth = %config.server.bearer_token.as_deref().map(|_| "bearer").unwrap_or("none"),
                "Starting chat HTTP server"
            );
            axum::serve(listener, router).await?;
            Ok(())
        }
    }
}

async fn run_repl(dispatcher: &Dispatcher) -> Result<()> {
    let language = std::env::var("TRIAGE_LANGUAGE")
        .ok()
        .and_then(|l| l.parse().ok())
        .unwrap_or(Language::Ua);
    let mut session = ChatSession::new(language);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("{}", "Type a message. Commands: /reset, /save <path>, /lang <ua|en>, /quit".dimmed());
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/reset", _) => {
                session.reset();
                println!("{}", "Session cleared.".dimmed());
            }
            ("/save", path) => {
                let path = if path.trim().is_empty() {
                    session.transcript_file_name()
                } else {
                    path.trim().to_string()
                };
                tokio::fs::write(&path, session.transcript()).await?;
                println!("{} {}", "Transcript written to".dimmed(), path);
            }
            ("/lang", lang) => match lang.parse::<Language>() {
                Ok(l) => session.set_language(l),
                Err(e) => println!("{}", e.red()),
            },
            _ => match session.send(dispatcher, line).await {
                Ok(result) => {
                    println!("{}", result.text);
                    if let Some(verdict) = &result.triage {
                        println!("{}", verdict_line(verdict, &result.model_used));
                    }
                }
                Err(e) => {
                    let notice = session
                        .turns()
                        .last()
                        .map(|t| t.text.clone())
                        .unwrap_or_default();
                    println!("{}", notice.yellow());
                    tracing::debug!("Dispatch error detail: {:?}", e);
                }
            },
        }
    }
    Ok(())
}

fn verdict_line(verdict: &TriageVerdict, model: &str) -> String {
    let urgency = match verdict.urgency {
        Urgency::Low => verdict.urgency.as_str().green(),
        Urgency::Medium => verdict.urgency.as_str().yellow(),
        Urgency::High => verdict.urgency.as_str().bright_red(),
        Urgency::Critical => verdict.urgency.as_str().red().bold(),
    };
    format!(
        "[{}] {} | {} | {}",
        urgency,
        verdict.topic,
        verdict.suggested_action,
        model.dimmed()
    )
}
