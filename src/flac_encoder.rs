use crate::types::{CanonicalAudio, SampleI16, CANONICAL_SAMPLE_RATE};
use anyhow::Result;
use flacenc::bitsink::ByteSink;
use flacenc::component::BitRepr;
use flacenc::error::Verify;
use flacenc::source::MemSource;

/// FLAC エンコーダー
///
/// 正規化済みPCM音声をFLAC形式に再エンコードする。
/// バックエンドへ送信する音声データを圧縮することで帯域を削減する。
/// 圧縮元は常に正規音声であり、元の入力ファイルは使わない。
///
/// # 圧縮効果
///
/// FLAC（Free Lossless Audio Codec）は可逆圧縮形式で、
/// 通常30-50%程度のサイズ削減が期待できる。
pub struct FlacEncoder {
    sample_rate: u32,
}

impl FlacEncoder {
    /// 新しいFLACエンコーダーを作成
    ///
    /// # Arguments
    ///
    /// * `sample_rate` - サンプリングレート (Hz)
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    /// 正規音声用のエンコーダーを作成（16kHz）
    pub fn for_canonical() -> Self {
        Self::new(CANONICAL_SAMPLE_RATE)
    }

    /// PCM音声データをFLAC形式にエンコード
    ///
    /// # Arguments
    ///
    /// * `samples` - PCM音声サンプル（16bit符号付き整数、モノラル）
    ///
    /// # Errors
    ///
    /// エンコードに失敗した場合にエラーを返す
    pub fn encode(&mut self, samples: &[SampleI16]) -> Result<Vec<u8>> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }

        // i16からi32に変換（flacencの要求）
        let samples_i32: Vec<i32> = samples.iter().map(|&s| s as i32).collect();

        let source = MemSource::from_samples(
            &samples_i32,
            1,  // チャンネル数（モノラル）
            16, // ビット深度
            self.sample_rate as usize,
        );

        let config = flacenc::config::Encoder::default();

        let verified_config = config
            .into_verified()
            .map_err(|e| anyhow::anyhow!("FLAC設定の検証に失敗: {:?}", e))?;

        let flac_stream = flacenc::encode_with_fixed_block_size(
            &verified_config,
            source,
            verified_config.block_size,
        )
        .map_err(|e| anyhow::anyhow!("FLACエンコードに失敗: {:?}", e))?;

        // バイト列に変換（ByteSinkを使用）
        let mut sink = ByteSink::new();
        flac_stream
            .write(&mut sink)
            .map_err(|e| anyhow::anyhow!("FLACストリームの書き込みに失敗: {:?}", e))?;

        Ok(sink.into_inner())
    }

    /// 正規化済み音声を丸ごとエンコード
    pub fn encode_canonical(&mut self, audio: &CanonicalAudio) -> Result<Vec<u8>> {
        self.encode(&audio.samples)
    }

    /// サンプリングレートを取得
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
