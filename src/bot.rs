use crate::ledger::UsageLedger;
use crate::pipeline::TranscriptionPipeline;
use crate::telegram::{Message, TelegramClient};
use crate::types::{GlobalReport, PipelineOutcome, UserReport, VoiceRequest};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// チャットボットのフロントエンド
///
/// コマンド（/start, /help, /stats, /globalstats）と音声メッセージを
/// ディスパッチする薄い層。音声1件ごとに独立したタスクを起動し、
/// パイプラインの終端状態をユーザー向けメッセージに整形して返す。
pub struct Bot {
    client: Arc<TelegramClient>,
    pipeline: Arc<TranscriptionPipeline>,
    ledger: Arc<UsageLedger>,
}

impl Bot {
    pub fn new(
        client: Arc<TelegramClient>,
        pipeline: Arc<TranscriptionPipeline>,
        ledger: Arc<UsageLedger>,
    ) -> Self {
        Self {
            client,
            pipeline,
            ledger,
        }
    }

    /// ロングポーリングのメインループ
    ///
    /// `running` が false になるまで更新を取得し続ける。取得エラーは
    /// ログに残して少し待ってから再試行する。
    pub async fn run(&self, running: Arc<AtomicBool>) -> Result<()> {
        let mut offset = 0i64;

        log::info!("ボットのポーリングを開始します");

        while running.load(Ordering::SeqCst) {
            let updates = match self.client.get_updates(offset).await {
                Ok(updates) => updates,
                Err(e) => {
                    log::error!("更新の取得に失敗: {}", e);
                    tokio::time::sleep(tokio::time::Duration::from_secs(3)).await;
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                if let Some(message) = update.message {
                    self.dispatch(message).await;
                }
            }
        }

        log::info!("ボットのポーリングを終了しました");
        Ok(())
    }

    async fn dispatch(&self, message: Message) {
        if message.voice.is_some() {
            self.handle_voice(message);
            return;
        }

        let Some(text) = message.text.clone() else {
            return;
        };

        // "/stats@botname" 形式も受け付ける
        let command = text
            .split_whitespace()
            .next()
            .map(|c| c.split('@').next().unwrap_or(c))
            .unwrap_or("");

        let reply = match command {
            "/start" => Some(start_text().to_string()),
            "/help" => Some(help_text().to_string()),
            "/stats" => Some(self.stats_reply(&message).await),
            "/globalstats" => Some(self.global_stats_reply().await),
            _ => None,
        };

        if let Some(reply) = reply {
            if let Err(e) = self.client.send_message(message.chat.id, &reply, true).await {
                log::error!("返信の送信に失敗: {}", e);
            }
        }
    }

    /// 音声メッセージの処理タスクを起動
    ///
    /// 各クリップは独立した並行タスク。遅い文字起こしが他の
    /// コマンドや受付を塞がないようにする。
    fn handle_voice(&self, message: Message) {
        let client = Arc::clone(&self.client);
        let pipeline = Arc::clone(&self.pipeline);
        let max_minutes = self.ledger.max_minutes();

        let Some(voice) = message.voice.clone() else {
            return;
        };
        let user = message.from.clone();
        let chat_id = message.chat.id;

        tokio::spawn(async move {
            let request = VoiceRequest {
                user_id: user.as_ref().map(|u| u.id).unwrap_or(chat_id),
                display_name: user.as_ref().and_then(|u| u.display_name()),
                file_id: voice.file_id.clone(),
            };

            // 処理中であることを先に伝え、結果で編集する
            let placeholder = match client
                .send_message(chat_id, "Processing your voice message...", false)
                .await
            {
                Ok(m) => m,
                Err(e) => {
                    log::error!("処理中メッセージの送信に失敗: {}", e);
                    return;
                }
            };

            let outcome = pipeline.process(request, client.as_ref()).await;
            let reply = outcome_text(&outcome, max_minutes);

            if let Err(e) = client
                .edit_message_text(chat_id, placeholder.message_id, &reply)
                .await
            {
                log::error!("結果メッセージの編集に失敗: {}", e);
            }
        });
    }

    async fn stats_reply(&self, message: &Message) -> String {
        let user_id = message
            .from
            .as_ref()
            .map(|u| u.id)
            .unwrap_or(message.chat.id);
        let display_name = message
            .from
            .as_ref()
            .and_then(|u| u.display_name())
            .unwrap_or_else(|| "Unknown".to_string());

        let ledger = Arc::clone(&self.ledger);
        let result = tokio::task::spawn_blocking(move || {
            let report = ledger.user_report(user_id)?;
            let admission = ledger.check_admission()?;
            Ok::<_, crate::error::PipelineError>((report, admission))
        })
        .await;

        match result {
            Ok(Ok((report, admission))) => stats_text(
                &display_name,
                &report,
                admission.used_minutes,
                admission.limit_reached,
                self.ledger.max_minutes(),
            ),
            Ok(Err(e)) => {
                log::error!("ユーザー統計の取得に失敗: {}", e);
                "Sorry, statistics are unavailable right now.".to_string()
            }
            Err(e) => {
                log::error!("統計タスクの合流に失敗: {}", e);
                "Sorry, statistics are unavailable right now.".to_string()
            }
        }
    }

    async fn global_stats_reply(&self) -> String {
        let ledger = Arc::clone(&self.ledger);
        let result = tokio::task::spawn_blocking(move || ledger.global_report()).await;

        match result {
            Ok(Ok(report)) => global_stats_text(&report, self.ledger.max_minutes()),
            Ok(Err(e)) => {
                log::error!("グローバル統計の取得に失敗: {}", e);
                "Sorry, statistics are unavailable right now.".to_string()
            }
            Err(e) => {
                log::error!("統計タスクの合流に失敗: {}", e);
                "Sorry, statistics are unavailable right now.".to_string()
            }
        }
    }
}

/// /start への応答
pub fn start_text() -> &'static str {
    "Hi! I am a voice message transcription bot. \
     Forward me voice messages, and I will transcribe them to text. \
     I specialize in Serbian language transcription."
}

/// /help への応答
pub fn help_text() -> &'static str {
    "Forward me a voice message and I will transcribe it to text. \
     Currently optimized for Serbian language.\n\n\
     Use /stats to see your usage statistics.\n\
     Use /globalstats to see global usage statistics."
}

/// /stats への応答
pub fn stats_text(
    display_name: &str,
    report: &UserReport,
    global_used_minutes: f64,
    limit_reached: bool,
    max_minutes: f64,
) -> String {
    let mut message = format!("📊 *Usage Statistics for {}*\n\n", display_name);
    message.push_str(&format!(
        "🎤 Your total audio processed: {:.2} minutes\n",
        report.total_minutes
    ));

    if let Some(last) = &report.last_activity {
        message.push_str(&format!("🕒 Your last activity: {}\n\n", last));
    }

    message.push_str(&format!(
        "🌐 Global usage: {:.2}/{:.0} minutes",
        global_used_minutes, max_minutes
    ));

    if limit_reached {
        message.push_str("\n⚠️ Global limit reached. No more transcriptions available.");
    }

    message
}

/// /globalstats への応答
pub fn global_stats_text(report: &GlobalReport, max_minutes: f64) -> String {
    let mut message = String::from("🌐 *Global Usage Statistics*\n\n");
    message.push_str(&format!(
        "🎤 Total audio processed: {:.2} minutes\n",
        report.total_minutes
    ));
    message.push_str(&format!(
        "⏳ Remaining quota: {:.2} minutes\n",
        (max_minutes - report.total_minutes).max(0.0)
    ));

    if let Some(last) = &report.last_activity {
        message.push_str(&format!("🕒 Last activity: {}\n\n", last));
    }

    message.push_str(&format!(
        "Maximum allowed audio processing is {:.0} minutes in total.\n\n",
        max_minutes
    ));

    if !report.top_users.is_empty() {
        message.push_str("*Top users:*\n");
        for (i, user) in report.top_users.iter().enumerate() {
            message.push_str(&format!(
                "{}. {}: {:.2} minutes\n",
                i + 1,
                user.display_name.as_deref().unwrap_or("Unknown"),
                user.minutes
            ));
        }
    }

    message
}

/// パイプラインの終端状態をユーザー向けメッセージに整形
///
/// どの終端状態もちょうど1つのテンプレートに対応する。
pub fn outcome_text(outcome: &PipelineOutcome, max_minutes: f64) -> String {
    match outcome {
        PipelineOutcome::Completed {
            transcript,
            limit_reached,
            used_minutes,
        } => {
            let mut message = if transcript.is_empty() {
                "Sorry, I couldn't transcribe that voice message.".to_string()
            } else {
                format!("Transcript: {}", transcript)
            };
            if *limit_reached {
                message.push_str(&format!(
                    "\n\n⚠️ Global limit reached: {:.2}/{:.0} minutes used.",
                    used_minutes, max_minutes
                ));
            }
            message
        }
        PipelineOutcome::Rejected {
            used_minutes,
            max_minutes,
        } => format!(
            "⚠️ Sorry, the global audio processing limit has been reached \
             ({:.2}/{:.0} minutes). No more transcriptions are available.",
            used_minutes, max_minutes
        ),
        PipelineOutcome::Failed { message } => message.clone(),
    }
}
