use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub transcribe: TranscribeConfig,
    pub assembly: Option<AssemblyConfig>,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub flac: FlacConfig,
}

/// チャットボット設定
///
/// 外部チャット基盤（Telegram Bot API）への接続設定。
///
/// # デフォルト値
///
/// - `token`: 空（環境変数 `TELEGRAM_TOKEN` で上書き可能）
/// - `poll_timeout_seconds`: 30 秒（ロングポーリング待機時間）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BotConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_poll_timeout_seconds")]
    pub poll_timeout_seconds: u64,
}

/// 文字起こしバックエンドの種類
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TranscribeBackendType {
    /// Amazon Transcribe（ストリーミング認識型）
    Aws,
    /// AssemblyAI（ジョブ投入・取得型）
    Assembly,
}

/// 文字起こし設定
///
/// どちらのバックエンドを使う場合も言語は固定（メッセージ毎の
/// 言語検出は行わない）。送信する音声は常に正規形（16kHz）なので、
/// サンプリングレートは設定項目にしない。
///
/// # デフォルト値
///
/// - `backend`: "aws" (Amazon Transcribe)
/// - `region`: "eu-central-1"
/// - `language_code`: "sr-RS" (セルビア語)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranscribeConfig {
    #[serde(default = "default_backend")]
    pub backend: TranscribeBackendType,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_language_code")]
    pub language_code: String,
}

/// AssemblyAI 設定
///
/// ジョブ投入後、終端ステータスに達するまでポーリングする。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssemblyConfig {
    /// AssemblyAI API Key（環境変数 `ASSEMBLYAI_API_KEY` で上書き可能）
    #[serde(default)]
    pub api_key: String,
    /// APIベースURL
    #[serde(default = "default_assembly_base_url")]
    pub base_url: String,
    /// ポーリング間隔（秒）
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// ジョブ完了待ちの上限（秒）
    #[serde(default = "default_job_timeout_seconds")]
    pub job_timeout_seconds: u64,
}

/// クォータ設定
///
/// # デフォルト値
///
/// - `max_minutes`: 50.0 分（グローバル上限）
/// - `record_failed_attempts`: true
///
/// # record_failed_attempts
///
/// バックエンドがエラーを返した場合でも、プロバイダ側では処理時間を
/// 消費している可能性がある。このフラグが true のとき、正規化時に
/// 確定した音声長を失敗した試行についても台帳に記録する。
/// キャンセルされた試行も同じ扱い（音声長が確定済みの場合のみ記録）。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotaConfig {
    #[serde(default = "default_max_minutes")]
    pub max_minutes: f64,
    #[serde(default = "default_record_failed_attempts")]
    pub record_failed_attempts: bool,
}

/// ストレージ設定
///
/// 使用量台帳（SQLite）のファイル配置。初回起動時に
/// 親ディレクトリごと作成される。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

/// FLAC圧縮設定
///
/// バックエンドに送信する音声データのFLAC再エンコードに関する設定。
/// 圧縮元は常に正規化済み音声であり、元の入力ファイルからは
/// 再エンコードしない。
///
/// # デフォルト値
///
/// - `enabled`: true (FLAC圧縮を使用)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlacConfig {
    #[serde(default = "default_flac_enabled")]
    pub enabled: bool,
}

// Default functions
fn default_poll_timeout_seconds() -> u64 {
    30
}

fn default_backend() -> TranscribeBackendType {
    TranscribeBackendType::Aws
}

fn default_region() -> String {
    "eu-central-1".to_string()
}

fn default_language_code() -> String {
    "sr-RS".to_string()
}

fn default_assembly_base_url() -> String {
    "https://api.assemblyai.com/v2".to_string()
}

fn default_poll_interval_seconds() -> u64 {
    3
}

fn default_job_timeout_seconds() -> u64 {
    600
}

fn default_max_minutes() -> f64 {
    50.0
}

fn default_record_failed_attempts() -> bool {
    true
}

fn default_db_path() -> String {
    "data/stats.db".to_string()
}

fn default_flac_enabled() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot: BotConfig::default(),
            transcribe: TranscribeConfig::default(),
            assembly: None, // デフォルトではAssemblyAI設定なし
            quota: QuotaConfig::default(),
            storage: StorageConfig::default(),
            flac: FlacConfig::default(),
        }
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            poll_timeout_seconds: default_poll_timeout_seconds(),
        }
    }
}

impl Default for TranscribeConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            region: default_region(),
            language_code: default_language_code(),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_minutes: default_max_minutes(),
            record_failed_attempts: default_record_failed_attempts(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for FlacConfig {
    fn default() -> Self {
        Self {
            enabled: default_flac_enabled(),
        }
    }
}

impl Config {
    /// 設定ファイルから読み込み
    ///
    /// TOML形式の設定ファイルをパースしてConfig構造体を生成する。
    ///
    /// # Errors
    ///
    /// ファイルの読み込みまたはパースに失敗した場合にエラーを返す。
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "設定ファイルのパースに失敗")?;
        Ok(config)
    }

    /// デフォルト設定をファイルに書き出し
    ///
    /// 既存のファイルは上書きされる。
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).with_context(|| "設定のシリアライズに失敗")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("設定ファイルの書き込みに失敗: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 設定ファイルがあれば読み込み、なければデフォルトを使用
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            log::warn!(
                "設定ファイルが見つかりません。デフォルト設定を使用します: {:?}",
                path.as_ref()
            );
            Ok(Config::default())
        }
    }

    /// 環境変数による認証情報の上書き
    ///
    /// 資格情報は設定ファイルに書かず環境変数で渡す運用を想定。
    /// 環境変数が設定されている場合のみ上書きする。
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("TELEGRAM_TOKEN") {
            if !token.is_empty() {
                self.bot.token = token;
            }
        }
        if let Ok(key) = std::env::var("ASSEMBLYAI_API_KEY") {
            if !key.is_empty() {
                let assembly = self.assembly.get_or_insert_with(|| AssemblyConfig {
                    api_key: String::new(),
                    base_url: default_assembly_base_url(),
                    poll_interval_seconds: default_poll_interval_seconds(),
                    job_timeout_seconds: default_job_timeout_seconds(),
                });
                assembly.api_key = key;
            }
        }
    }

    /// 起動時の設定サマリをログ出力
    ///
    /// 資格情報はマスクして出力する。
    pub fn log_summary(&self) {
        log::info!("設定サマリ:");
        log::info!("  bot.token: {}", mask_secret(&self.bot.token));
        log::info!("  transcribe.backend: {:?}", self.transcribe.backend);
        log::info!("  transcribe.language_code: {}", self.transcribe.language_code);
        log::info!("  quota.max_minutes: {:.1}", self.quota.max_minutes);
        log::info!(
            "  quota.record_failed_attempts: {}",
            self.quota.record_failed_attempts
        );
        log::info!("  storage.db_path: {}", self.storage.db_path);
        if let Some(assembly) = &self.assembly {
            log::info!("  assembly.api_key: {}", mask_secret(&assembly.api_key));
            log::info!("  assembly.base_url: {}", assembly.base_url);
        }
    }
}

/// 機密値のマスク表示
///
/// 先頭4文字と末尾4文字のみ残す。短すぎる値は全体をマスクする。
pub fn mask_secret(value: &str) -> String {
    if value.len() < 8 {
        return "****".to_string();
    }
    format!("{}...{}", &value[..4], &value[value.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transcribe.backend, TranscribeBackendType::Aws);
        assert_eq!(config.transcribe.language_code, "sr-RS");
        assert_eq!(config.quota.max_minutes, 50.0);
        assert!(config.quota.record_failed_attempts);
        assert_eq!(config.storage.db_path, "data/stats.db");
        assert!(config.assembly.is_none());
        assert!(config.flac.enabled);
    }

    #[test]
    fn test_write_and_read_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        // デフォルト設定を書き込み
        Config::write_default(path).unwrap();

        // 読み込み
        let config = Config::from_file(path).unwrap();
        assert_eq!(config.transcribe.language_code, "sr-RS");
        assert_eq!(config.quota.max_minutes, 50.0);
    }

    #[test]
    fn test_custom_config() {
        let toml_content = r#"
[bot]
token = "123456:test-token"
poll_timeout_seconds = 10

[transcribe]
backend = "assembly"
language_code = "en-US"

[assembly]
api_key = "test-key-0123456789"
poll_interval_seconds = 1
job_timeout_seconds = 120

[quota]
max_minutes = 10.5
record_failed_attempts = false

[storage]
db_path = "/tmp/test/stats.db"

[flac]
enabled = false
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::from_file(temp_file.path()).unwrap();

        assert_eq!(config.bot.token, "123456:test-token");
        assert_eq!(config.bot.poll_timeout_seconds, 10);
        assert_eq!(config.transcribe.backend, TranscribeBackendType::Assembly);
        assert_eq!(config.transcribe.language_code, "en-US");
        let assembly = config.assembly.unwrap();
        assert_eq!(assembly.api_key, "test-key-0123456789");
        assert_eq!(assembly.poll_interval_seconds, 1);
        assert_eq!(assembly.base_url, "https://api.assemblyai.com/v2");
        assert_eq!(config.quota.max_minutes, 10.5);
        assert!(!config.quota.record_failed_attempts);
        assert_eq!(config.storage.db_path, "/tmp/test/stats.db");
        assert!(!config.flac.enabled);
    }

    #[test]
    fn test_load_or_default_nonexistent() {
        let config = Config::load_or_default("nonexistent_file.toml").unwrap();
        // デフォルト設定が返されることを確認
        assert_eq!(config.quota.max_minutes, 50.0);
    }

    #[test]
    fn test_partial_config() {
        // 一部の設定のみ記述した場合、残りはデフォルト値が使われる
        let toml_content = r#"
[quota]
max_minutes = 5.0
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::from_file(temp_file.path()).unwrap();

        // 指定した値
        assert_eq!(config.quota.max_minutes, 5.0);

        // デフォルト値
        assert_eq!(config.transcribe.language_code, "sr-RS");
        assert!(config.quota.record_failed_attempts);
        assert_eq!(config.bot.poll_timeout_seconds, 30);
    }

    #[test]
    fn test_apply_env_overrides() {
        let mut config = Config::default();

        std::env::set_var("TELEGRAM_TOKEN", "999999:env-token");
        std::env::set_var("ASSEMBLYAI_API_KEY", "env-assembly-key");
        config.apply_env_overrides();
        std::env::remove_var("TELEGRAM_TOKEN");
        std::env::remove_var("ASSEMBLYAI_API_KEY");

        assert_eq!(config.bot.token, "999999:env-token");
        // [assembly] セクションが無ければデフォルト値で補完される
        let assembly = config.assembly.unwrap();
        assert_eq!(assembly.api_key, "env-assembly-key");
        assert_eq!(assembly.base_url, "https://api.assemblyai.com/v2");
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "****");
        assert_eq!(mask_secret("short"), "****");
        assert_eq!(mask_secret("1234567890abcdef"), "1234...cdef");
    }
}
