use crate::config::{AssemblyConfig, FlacConfig};
use crate::error::PipelineError;
use crate::flac_encoder::FlacEncoder;
use crate::transcribe_backend::TranscribeBackend;
use crate::types::CanonicalAudio;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};

/// アップロードAPIのレスポンス
#[derive(Debug, Deserialize)]
struct UploadResponse {
    upload_url: String,
}

/// ジョブの終端／中間ステータス
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum JobStatus {
    Queued,
    Processing,
    Completed,
    Error,
}

/// 文字起こしジョブのレスポンス
#[derive(Debug, Deserialize)]
struct TranscriptJob {
    id: String,
    status: JobStatus,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// AssemblyAI バックエンド
///
/// ジョブ投入・取得型のバリアント。正規音声を圧縮コンテナに
/// 再エンコードしてアップロードし、非同期ジョブを作成して
/// 終端ステータスに達するまでポーリングする。ジョブが `error` で
/// 終わった場合はプロバイダの報告理由を `BackendError` として返す。
pub struct AssemblyBackend {
    config: AssemblyConfig,
    language_code: String,
    flac: FlacConfig,
    client: reqwest::Client,
}

impl AssemblyBackend {
    pub fn new(config: AssemblyConfig, language_code: String, flac: FlacConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("AssemblyAI HTTPクライアント作成失敗")?;

        Ok(Self {
            config,
            language_code,
            flac,
            client,
        })
    }

    /// アップロードする音声ペイロードを生成
    ///
    /// FLAC圧縮が有効ならFLAC、無効ならWAVコンテナ。
    /// いずれも正規音声からの再エンコードで、元ファイルは使わない。
    fn build_payload(&self, audio: &CanonicalAudio) -> Result<Vec<u8>, PipelineError> {
        if self.flac.enabled {
            let mut encoder = FlacEncoder::for_canonical();
            encoder
                .encode_canonical(audio)
                .map_err(|e| PipelineError::Backend(format!("FLAC再エンコード失敗: {}", e)))
        } else {
            audio
                .to_wav_bytes()
                .map_err(|e| PipelineError::Backend(format!("WAV生成失敗: {}", e)))
        }
    }

    /// 音声データをアップロードしてURLを得る
    async fn upload(&self, payload: Vec<u8>) -> Result<String, PipelineError> {
        let response = self
            .client
            .post(format!("{}/upload", self.config.base_url))
            .header("authorization", &self.config.api_key)
            .header("content-type", "application/octet-stream")
            .body(payload)
            .send()
            .await
            .map_err(|e| PipelineError::Backend(format!("アップロードリクエスト失敗: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Backend(format!(
                "アップロードエラー: {} - {}",
                status, error_text
            )));
        }

        let upload: UploadResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Backend(format!("アップロードレスポンスのパース失敗: {}", e)))?;

        Ok(upload.upload_url)
    }

    /// 文字起こしジョブを作成
    async fn submit_job(&self, audio_url: &str) -> Result<TranscriptJob, PipelineError> {
        let body = serde_json::json!({
            "audio_url": audio_url,
            "language_code": self.language_code,
        });

        let response = self
            .client
            .post(format!("{}/transcript", self.config.base_url))
            .header("authorization", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Backend(format!("ジョブ作成リクエスト失敗: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Backend(format!(
                "ジョブ作成エラー: {} - {}",
                status, error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| PipelineError::Backend(format!("ジョブレスポンスのパース失敗: {}", e)))
    }

    /// ジョブの現在状態を取得
    async fn fetch_job(&self, job_id: &str) -> Result<TranscriptJob, PipelineError> {
        let response = self
            .client
            .get(format!("{}/transcript/{}", self.config.base_url, job_id))
            .header("authorization", &self.config.api_key)
            .send()
            .await
            .map_err(|e| PipelineError::Backend(format!("ジョブ取得リクエスト失敗: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Backend(format!(
                "ジョブ取得エラー: {} - {}",
                status, error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| PipelineError::Backend(format!("ジョブレスポンスのパース失敗: {}", e)))
    }
}

#[async_trait]
impl TranscribeBackend for AssemblyBackend {
    async fn transcribe(&self, audio: &CanonicalAudio) -> Result<String, PipelineError> {
        let payload = self.build_payload(audio)?;

        log::debug!("AssemblyAI: {}バイトをアップロード", payload.len());
        let audio_url = self.upload(payload).await?;

        let mut job = self.submit_job(&audio_url).await?;
        log::debug!("AssemblyAI: ジョブ {} を作成 ({:?})", job.id, job.status);

        let deadline = Instant::now() + Duration::from_secs(self.config.job_timeout_seconds);

        // 終端ステータスに達するまでポーリング
        loop {
            match job.status {
                JobStatus::Completed => {
                    return Ok(job.text.unwrap_or_default());
                }
                JobStatus::Error => {
                    let reason = job
                        .error
                        .unwrap_or_else(|| "プロバイダが理由を報告しませんでした".to_string());
                    return Err(PipelineError::Backend(format!(
                        "AssemblyAI ジョブ失敗: {}",
                        reason
                    )));
                }
                JobStatus::Queued | JobStatus::Processing => {
                    if Instant::now() >= deadline {
                        return Err(PipelineError::Backend(format!(
                            "AssemblyAI ジョブ {} が{}秒以内に完了しませんでした",
                            job.id, self.config.job_timeout_seconds
                        )));
                    }
                    tokio::time::sleep(Duration::from_secs(self.config.poll_interval_seconds))
                        .await;
                    job = self.fetch_job(&job.id).await?;
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "assemblyai"
    }
}
