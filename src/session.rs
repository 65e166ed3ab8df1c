use chrono::{Local, Utc};
use std::fmt::Write;

use crate::dispatcher::Dispatcher;
use crate::error::{ErrorKind, Result};
use crate::models::{ConversationTurn, DispatchResult, TriageVerdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Language {
    #[default]
    Ua,
    En,
}

impl std::str::FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ua" | "uk" => Ok(Language::Ua),
            "en" => Ok(Language::En),
            other => Err(format!("unsupported language '{other}'")),
        }
    }
}

/// Message shown in place of a reply when dispatch fails.
pub fn notice_for(kind: ErrorKind, lang: Language) -> &'static str {
    match (kind, lang) {
        (ErrorKind::Exhausted, Language::Ua) => {
            "Дуже багато запитів одночасно :( Будь ласка, спробуйте звернутися трошки пізніше."
        }
        (ErrorKind::Exhausted, Language::En) => {
            "The service is receiving too many requests. Please try again in a little while."
        }
        (ErrorKind::Configuration, Language::Ua) => {
            "Сервіс тимчасово налаштовується. Будь ласка, спробуйте пізніше."
        }
        (ErrorKind::Configuration, Language::En) => {
            "The service is misconfigured. Please try again later."
        }
        (ErrorKind::Fatal, Language::Ua) => "Щось пішло не так. Будь ласка, спробуйте ще раз.",
        (ErrorKind::Fatal, Language::En) => "Something went wrong. Please try again.",
    }
}

/// The turn log of one conversation, plus the most recent verdict and the model that produced it.
#[derive(Debug, Default)]
pub struct ChatSession {
    turns: Vec<ConversationTurn>,
    latest: Option<(TriageVerdict, String)>,
    language: Language,
}

impl ChatSession {
    pub fn new(language: Language) -> Self {
        Self {
            language,
            ..Self::default()
        }
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn latest_triage(&self) -> Option<&TriageVerdict> {
        self.latest.as_ref().map(|(verdict, _)| verdict)
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn set_language(&mut self, language: Language) {
        self.language = language;
    }

    /// Send one user message. The user turn is recorded even on failure, followed
    /// by a localized notice turn; the error is still returned to the caller.
    pub async fn send(&mut self, dispatcher: &Dispatcher, text: &str) -> Result<DispatchResult> {
        let snapshot = self.turns.clone();
        self.turns.push(ConversationTurn::user(text));

        match dispatcher.dispatch(&snapshot, text).await {
            Ok(result) => {
                if let Some(verdict) = &result.triage {
                    self.latest = Some((verdict.clone(), result.model_used.clone()));
                }
                self.turns.push(ConversationTurn::assistant(
                    result.text.clone(),
                    result.triage.clone(),
                ));
                Ok(result)
            }
            Err(e) => {
                tracing::warn!("Message dispatch failed: {}", e);
                self.turns.push(ConversationTurn::assistant(
                    notice_for(e.kind(), self.language),
                    None,
                ));
                Err(e)
            }
        }
    }

    pub fn reset(&mut self) {
        self.turns.clear();
        self.latest = None;
    }

    /// Plain-text session report.
    pub fn transcript(&self) -> String {
        let now = Utc::now();
        let mut out = String::new();
        let _ = writeln!(out, "=== SESSION REPORT ===");
        let _ = writeln!(out, "Date: {}", now.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"));
        if let Some((verdict, model)) = &self.latest {
            let _ = writeln!(out);
            let _ = writeln!(out, "Urgency: {}", verdict.urgency);
            let _ = writeln!(out, "Topic: {}", verdict.topic);
            let _ = writeln!(out, "Model: {model}");
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "--- TRANSCRIPT ---");
        for turn in &self.turns {
            let _ = writeln!(
                out,
                "[{}] {}: {}",
                turn.timestamp.with_timezone(&Local).format("%H:%M:%S"),
                turn.role.to_string().to_uppercase(),
                turn.text
            );
            let _ = writeln!(out);
        }
        out
    }

    /// Suggested download name, e.g. `Session_2026-10-17_14-05-09.txt`.
    pub fn transcript_file_name(&self) -> String {
        format!("Session_{}.txt", Local::now().format("%Y-%m-%d_%H-%M-%S"))
    }
}
