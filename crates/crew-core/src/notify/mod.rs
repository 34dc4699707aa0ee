//! Best-effort Telegram notifications for finished team runs.
//!
//! Reports use the small subset of HTML Telegram accepts (`b`, `i`,
//! `code`). Sending is fire-and-forget: no retries, and a missing bot
//! configuration silently disables the notifier.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::protocol::TeamResult;

/// Environment variable holding the bot token.
pub const BOT_TOKEN_ENV: &str = "TELEGRAM_BOT_TOKEN";
/// Environment variable holding the destination chat id.
pub const CHAT_ID_ENV: &str = "TELEGRAM_CHAT_ID";

const BAR_WIDTH: usize = 10;
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Render a width-10 progress bar like `[█████░░░░░] 50%`.
///
/// A non-positive total yields 0%; `done > total` caps at 100%. Monotone in
/// `done` for a fixed total.
pub fn format_progress_bar(done: i64, total: i64) -> String {
    let percent = if total <= 0 {
        0
    } else {
        (done.clamp(0, total) * 100 / total) as usize
    };
    let filled = percent * BAR_WIDTH / 100;
    format!(
        "[{}{}] {percent}%",
        "\u{2588}".repeat(filled),
        "\u{2591}".repeat(BAR_WIDTH - filled)
    )
}

/// Format the end-of-run summary as Telegram HTML.
pub fn format_run_summary(team: &str, result: &TeamResult) -> String {
    let mut lines = vec![
        format!("<b>Team {team} run complete</b>"),
        String::new(),
        format_progress_bar(result.completed as i64, result.total() as i64),
        String::new(),
        format!("Completed: {}", result.completed),
        format!("Failed: {}", result.failed),
        format!("Duration: {:.1} min", result.duration_seconds / 60.0),
    ];

    if !result.worker_results.is_empty() {
        lines.push(String::new());
        for worker in &result.worker_results {
            lines.push(format!(
                "<code>worker-{}</code>: {} done, {} failed",
                worker.worker_id, worker.tasks_completed, worker.tasks_failed
            ));
        }
    }

    lines.join("\n")
}

/// Fire-and-forget Telegram Bot API client.
pub struct TelegramNotifier {
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Option<Self> {
        let bot_token = bot_token.into();
        let chat_id = chat_id.into();
        if bot_token.is_empty() || chat_id.is_empty() {
            return None;
        }
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .ok()?;
        Some(Self {
            bot_token,
            chat_id,
            client,
        })
    }

    /// Build from `TELEGRAM_BOT_TOKEN` / `TELEGRAM_CHAT_ID`; `None` when
    /// either is absent.
    pub fn from_env() -> Option<Self> {
        let bot_token = std::env::var(BOT_TOKEN_ENV).ok()?;
        let chat_id = std::env::var(CHAT_ID_ENV).ok()?;
        Self::new(bot_token, chat_id)
    }

    /// Send one HTML message. Failures are logged and swallowed.
    pub async fn send_message(&self, text: &str) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let body = json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });

        match self.client.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("telegram notification sent");
            }
            Ok(response) => {
                warn!(status = %response.status(), "telegram rejected notification");
            }
            Err(e) => {
                warn!(error = %e, "failed to send telegram notification");
            }
        }
    }

    pub async fn send_run_summary(&self, team: &str, result: &TeamResult) {
        self.send_message(&format_run_summary(team, result)).await;
    }
}
