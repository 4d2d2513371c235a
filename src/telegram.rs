use crate::pipeline::VoiceSource;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Telegram Bot API の薄いクライアント
///
/// ロングポーリングでの更新取得、メッセージ送信・編集、音声ファイルの
/// ダウンロードのみを提供する。コアの契約外の薄いI/Oラッパーであり、
/// 状態は持たない。
pub struct TelegramClient {
    token: String,
    poll_timeout_seconds: u64,
    client: reqwest::Client,
}

/// Bot APIの共通レスポンス
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<User>,
    pub chat: Chat,
    pub text: Option<String>,
    pub voice: Option<Voice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
}

impl User {
    /// 表示名（ユーザー名がなければファーストネーム）
    pub fn display_name(&self) -> Option<String> {
        self.username.clone().or_else(|| self.first_name.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Voice {
    pub file_id: String,
    pub duration: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    file_path: Option<String>,
}

impl TelegramClient {
    pub fn new(token: &str, poll_timeout_seconds: u64) -> Result<Self> {
        if token.is_empty() {
            bail!("Telegramトークンが設定されていません（TELEGRAM_TOKEN）");
        }

        // ロングポーリングがタイムアウトより先に切れないよう余裕を持たせる
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(poll_timeout_seconds + 30))
            .build()
            .context("Telegram HTTPクライアント作成失敗")?;

        Ok(Self {
            token: token.to_string(),
            poll_timeout_seconds,
            client,
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("https://api.telegram.org/file/bot{}/{}", self.token, file_path)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let response = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Telegram API呼び出し失敗: {}", method))?;

        let api: ApiResponse<T> = response
            .json()
            .await
            .with_context(|| format!("Telegram APIレスポンスのパース失敗: {}", method))?;

        if !api.ok {
            bail!(
                "Telegram APIエラー ({}): {}",
                method,
                api.description.unwrap_or_else(|| "詳細なし".to_string())
            );
        }

        api.result
            .ok_or_else(|| anyhow::anyhow!("Telegram APIが結果を返しませんでした: {}", method))
    }

    /// 更新をロングポーリングで取得
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        self.call(
            "getUpdates",
            &serde_json::json!({
                "offset": offset,
                "timeout": self.poll_timeout_seconds,
                "allowed_updates": ["message"],
            }),
        )
        .await
    }

    /// テキストメッセージを送信
    pub async fn send_message(&self, chat_id: i64, text: &str, markdown: bool) -> Result<Message> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        if markdown {
            body["parse_mode"] = serde_json::json!("Markdown");
        }
        self.call("sendMessage", &body).await
    }

    /// 送信済みメッセージのテキストを編集
    pub async fn edit_message_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
        });
        let _: Message = self.call("editMessageText", &body).await?;
        Ok(())
    }
}

/// `file_path` から拡張子ヒントを取り出す
///
/// ボイスノートは通常 `.oga`。拡張子が無ければ None。
fn extension_hint(file_path: &str) -> Option<String> {
    Path::new(file_path)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

#[async_trait]
impl VoiceSource for TelegramClient {
    /// 音声ファイルをダウンロードして `dest` に書き込む
    ///
    /// getFileでファイルパスを解決し、ファイルAPIから実体を取得する。
    /// 戻り値はファイルパス由来の拡張子ヒント。
    async fn download_to(&self, file_id: &str, dest: &Path) -> Result<Option<String>> {
        let info: FileInfo = self
            .call("getFile", &serde_json::json!({ "file_id": file_id }))
            .await?;

        let file_path = info
            .file_path
            .ok_or_else(|| anyhow::anyhow!("getFileがfile_pathを返しませんでした"))?;

        let response = self
            .client
            .get(self.file_url(&file_path))
            .send()
            .await
            .context("音声ファイルのダウンロード失敗")?;

        if !response.status().is_success() {
            bail!("音声ファイルのダウンロード失敗: {}", response.status());
        }

        let bytes = response
            .bytes()
            .await
            .context("音声ファイルの読み取り失敗")?;

        tokio::fs::write(dest, &bytes)
            .await
            .with_context(|| format!("一時ファイルへの書き込み失敗: {:?}", dest))?;

        log::debug!("音声をダウンロード: {} ({}バイト)", file_path, bytes.len());

        Ok(extension_hint(&file_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_voice_update() {
        let json = r#"{
            "ok": true,
            "result": [{
                "update_id": 100,
                "message": {
                    "message_id": 5,
                    "from": {"id": 42, "username": "ana", "first_name": "Ana"},
                    "chat": {"id": 42},
                    "voice": {"file_id": "AwACAgIAAxkBAAM", "duration": 12}
                }
            }]
        }"#;

        let response: ApiResponse<Vec<Update>> = serde_json::from_str(json).unwrap();
        assert!(response.ok);
        let updates = response.result.unwrap();
        assert_eq!(updates.len(), 1);

        let message = updates[0].message.as_ref().unwrap();
        let voice = message.voice.as_ref().unwrap();
        assert_eq!(voice.file_id, "AwACAgIAAxkBAAM");
        assert_eq!(voice.duration, Some(12));
        assert_eq!(
            message.from.as_ref().unwrap().display_name().as_deref(),
            Some("ana")
        );
    }

    #[test]
    fn test_parse_command_update() {
        let json = r#"{
            "ok": true,
            "result": [{
                "update_id": 101,
                "message": {
                    "message_id": 6,
                    "from": {"id": 42, "first_name": "Ana"},
                    "chat": {"id": 42},
                    "text": "/stats"
                }
            }]
        }"#;

        let response: ApiResponse<Vec<Update>> = serde_json::from_str(json).unwrap();
        let updates = response.result.unwrap();
        let message = updates[0].message.as_ref().unwrap();
        assert_eq!(message.text.as_deref(), Some("/stats"));
        assert!(message.voice.is_none());
        // ユーザー名がない場合はファーストネームが表示名になる
        assert_eq!(
            message.from.as_ref().unwrap().display_name().as_deref(),
            Some("Ana")
        );
    }

    #[test]
    fn test_parse_api_error() {
        let json = r#"{"ok": false, "description": "Unauthorized"}"#;
        let response: ApiResponse<Vec<Update>> = serde_json::from_str(json).unwrap();
        assert!(!response.ok);
        assert_eq!(response.description.as_deref(), Some("Unauthorized"));
    }

    #[test]
    fn test_client_rejects_empty_token() {
        assert!(TelegramClient::new("", 30).is_err());
    }

    #[test]
    fn test_extension_hint_from_file_path() {
        // ボイスノートの典型的なパス
        assert_eq!(
            extension_hint("voice/file_123.oga").as_deref(),
            Some("oga")
        );
        assert_eq!(extension_hint("voice/file_123.OGA").as_deref(), Some("oga"));
        assert_eq!(extension_hint("voice/file_123"), None);
    }
}
