use crate::assembly_api::AssemblyBackend;
use crate::aws_transcribe::AwsTranscribeBackend;
use crate::config::{Config, TranscribeBackendType};
use crate::error::PipelineError;
use crate::types::CanonicalAudio;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// 文字起こしバックエンドの共通トレイト
///
/// 正規化済み音声を1クリップ受け取り、完全な文字起こしテキストを返す
/// （バッチ型。ストリーミング逐次結果は扱わない）。実装は設定で
/// 選択され、内容による実行時の切り替えは行わない。
#[async_trait]
pub trait TranscribeBackend: Send + Sync {
    /// 正規化済み音声を文字起こし
    ///
    /// # Errors
    ///
    /// 通信・認証・プロバイダ側の処理エラーは
    /// `PipelineError::Backend` として返す。
    async fn transcribe(&self, audio: &CanonicalAudio) -> Result<String, PipelineError>;

    /// バックエンド名（ログ用）
    fn name(&self) -> &'static str;
}

/// 設定に応じたバックエンドを構築
///
/// # Errors
///
/// AssemblyAIが選択されているのに `[assembly]` 設定が無い場合など、
/// 構成不備でエラーを返す。
pub async fn create_backend(config: &Config) -> Result<Arc<dyn TranscribeBackend>> {
    match config.transcribe.backend {
        TranscribeBackendType::Aws => {
            let backend =
                AwsTranscribeBackend::new(config.transcribe.clone(), config.flac.clone()).await?;
            Ok(Arc::new(backend))
        }
        TranscribeBackendType::Assembly => {
            let assembly = config
                .assembly
                .clone()
                .ok_or_else(|| anyhow::anyhow!("backend = \"assembly\" には [assembly] 設定が必要です"))?;
            let backend = AssemblyBackend::new(
                assembly,
                config.transcribe.language_code.clone(),
                config.flac.clone(),
            )?;
            Ok(Arc::new(backend))
        }
    }
}
