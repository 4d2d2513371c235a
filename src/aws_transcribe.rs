use crate::config::{FlacConfig, TranscribeConfig};
use crate::error::PipelineError;
use crate::flac_encoder::FlacEncoder;
use crate::transcribe_backend::TranscribeBackend;
use crate::types::{CanonicalAudio, CANONICAL_SAMPLE_RATE};
use anyhow::Result;
use async_stream::stream;
use async_trait::async_trait;
use aws_sdk_transcribestreaming::types::{AudioEvent, AudioStream, LanguageCode, MediaEncoding};
use aws_sdk_transcribestreaming::Client as AwsTranscribeClient;
use aws_smithy_types::Blob;

/// 1チャンクあたりのサンプル数（約0.5秒分 @ 16kHz）
const CHUNK_SAMPLES: usize = 8000;

/// AWS Transcribe Streaming API バックエンド
///
/// ストリーミング認識型のバリアント。1クリップ分の正規音声を
/// チャンクに分割してストリーミングセッションに流し込み、
/// 確定（非partial）セグメントを到着順に連結して文字起こしを得る。
pub struct AwsTranscribeBackend {
    config: TranscribeConfig,
    flac: FlacConfig,
    client: AwsTranscribeClient,
}

impl AwsTranscribeBackend {
    pub async fn new(config: TranscribeConfig, flac: FlacConfig) -> Result<Self> {
        // AWS SDKクライアント初期化
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = AwsTranscribeClient::new(&aws_config);

        Ok(Self {
            config,
            flac,
            client,
        })
    }

    fn language_code(&self) -> LanguageCode {
        LanguageCode::from(self.config.language_code.as_str())
    }

    fn media_encoding(&self) -> MediaEncoding {
        if self.flac.enabled {
            MediaEncoding::Flac
        } else {
            MediaEncoding::Pcm
        }
    }

    /// 正規音声を送信用チャンク列に変換
    ///
    /// FLAC圧縮が有効ならチャンク毎にエンコードし、
    /// 無効ならリトルエンディアンのPCM16バイト列にする。
    fn prepare_chunks(&self, audio: &CanonicalAudio) -> Result<Vec<Vec<u8>>, PipelineError> {
        let mut chunks = Vec::new();

        if self.flac.enabled {
            // 送信音声は常に正規形。レートのラベルもそれに一致させる
            let mut encoder = FlacEncoder::for_canonical();
            for window in audio.samples.chunks(CHUNK_SAMPLES) {
                let flac_data = encoder
                    .encode(window)
                    .map_err(|e| PipelineError::Backend(format!("FLACエンコード失敗: {}", e)))?;
                chunks.push(flac_data);
            }
        } else {
            for window in audio.samples.chunks(CHUNK_SAMPLES) {
                let mut bytes = Vec::with_capacity(window.len() * 2);
                for &sample in window {
                    bytes.extend_from_slice(&sample.to_le_bytes());
                }
                chunks.push(bytes);
            }
        }

        Ok(chunks)
    }
}

#[async_trait]
impl TranscribeBackend for AwsTranscribeBackend {
    async fn transcribe(&self, audio: &CanonicalAudio) -> Result<String, PipelineError> {
        // クリップ全体を先にエンコードしてからストリームに流す。
        // バッチ処理なので送信と受信を並行させる必要はない
        let chunks = self.prepare_chunks(audio)?;

        log::debug!(
            "Amazon Transcribe: {}サンプルを{}チャンクで送信",
            audio.samples.len(),
            chunks.len()
        );

        let input_stream = stream! {
            for chunk in chunks {
                let blob = Blob::new(chunk);
                yield Ok(AudioStream::AudioEvent(AudioEvent::builder().audio_chunk(blob).build()));
            }
        };

        let mut resp = self
            .client
            .start_stream_transcription()
            .language_code(self.language_code())
            .media_sample_rate_hertz(CANONICAL_SAMPLE_RATE as i32)
            .media_encoding(self.media_encoding())
            .audio_stream(input_stream.into())
            .send()
            .await
            .map_err(|e| {
                PipelineError::Backend(format!("Amazon Transcribe API開始失敗: {}", e))
            })?;

        let mut transcript_text = String::new();

        loop {
            let event = resp
                .transcript_result_stream
                .recv()
                .await
                .map_err(|e| {
                    PipelineError::Backend(format!("Amazon Transcribe ストリーム受信失敗: {}", e))
                })?;

            let Some(event) = event else {
                break;
            };

            match event {
                aws_sdk_transcribestreaming::types::TranscriptResultStream::TranscriptEvent(
                    transcript_event,
                ) => {
                    if let Some(transcript) = transcript_event.transcript {
                        for result in transcript.results.unwrap_or_default() {
                            // 部分結果は破棄し、確定セグメントのみ連結する
                            if result.is_partial {
                                continue;
                            }
                            for alt in result.alternatives.unwrap_or_default() {
                                if let Some(text) = alt.transcript {
                                    transcript_text.push_str(&text);
                                }
                            }
                        }
                    }
                }
                other => {
                    log::debug!("Amazon Transcribe イベント: {:?}", other);
                }
            }
        }

        Ok(transcript_text)
    }

    fn name(&self) -> &'static str {
        "aws-transcribe"
    }
}
