use anyhow::{Context, Result};
use std::io::Cursor;

/// 16ビット整数型のオーディオサンプル
///
/// PCM形式の音声データを表現するための型エイリアス。
/// -32768 から 32767 の範囲の値を取る。
pub type SampleI16 = i16;

/// 正規音声のサンプリングレート (Hz)
///
/// ストリーミング系音声認識バックエンドが共通して受け付ける
/// 最小公倍数的なフォーマット（モノラル・16kHz・16bit）の一部。
pub const CANONICAL_SAMPLE_RATE: u32 = 16_000;

/// 正規化済み音声
///
/// 任意の入力フォーマットをデコードして得られる単一の正規形
/// （モノラル・16kHz・16bit PCM）。すべての下流処理はこの形式を
/// 消費し、音声長の計測もこのバッファから行う（元ファイルの
/// メタデータは欠落・不正の可能性があるため使わない）。
#[derive(Clone, Debug)]
pub struct CanonicalAudio {
    /// PCM音声サンプルの配列（モノラル・16kHz）
    pub samples: Vec<SampleI16>,
}

impl CanonicalAudio {
    pub fn new(samples: Vec<SampleI16>) -> Self {
        Self { samples }
    }

    /// 音声長（秒）
    ///
    /// デコード済みバッファのサンプル数から計算する。
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / CANONICAL_SAMPLE_RATE as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// WAVコンテナに書き出し（インメモリ）
    ///
    /// 非圧縮入力を要求するバックエンドへの送信用。
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: CANONICAL_SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer =
                hound::WavWriter::new(&mut cursor, spec).context("WAVライター作成失敗")?;

            for &sample in &self.samples {
                writer.write_sample(sample).context("WAV書き込み失敗")?;
            }

            writer.finalize().context("WAV finalize失敗")?;
        }

        Ok(cursor.into_inner())
    }
}

/// 受信した音声メッセージの処理要求
///
/// 外部チャット基盤から届く1件のボイスクリップを表す。
#[derive(Clone, Debug)]
pub struct VoiceRequest {
    /// 外部基盤上のユーザーID
    pub user_id: i64,
    /// 表示名（取得できない場合もある）
    pub display_name: Option<String>,
    /// トランスポート経由で実体を取得するためのファイル参照
    pub file_id: String,
}

/// 受付判定の結果
#[derive(Clone, Copy, Debug)]
pub struct Admission {
    /// グローバル上限に到達しているか
    pub limit_reached: bool,
    /// 現在のグローバル使用量（分）
    pub used_minutes: f64,
}

/// ユーザー別の使用量レポート
#[derive(Clone, Debug, Default)]
pub struct UserReport {
    /// 累計音声長（分）
    pub total_minutes: f64,
    /// 最終利用時刻（RFC 3339、利用実績がなければ None）
    pub last_activity: Option<String>,
}

/// 上位ユーザーの1エントリ
#[derive(Clone, Debug)]
pub struct TopUser {
    pub display_name: Option<String>,
    pub minutes: f64,
}

/// グローバル使用量レポート
#[derive(Clone, Debug, Default)]
pub struct GlobalReport {
    /// 累計音声長（分）
    pub total_minutes: f64,
    /// 最終更新時刻（RFC 3339）
    pub last_activity: Option<String>,
    /// 累計の大きい順・上位5名（同値は表示名の昇順で安定）
    pub top_users: Vec<TopUser>,
}

/// パイプライン1実行の終端状態
///
/// すべてのエラーはオーケストレーター境界で捕捉され、
/// このいずれかの状態に写像される。呼び出し側には必ず
/// 確定した結果が返る（黙って落とさない）。
#[derive(Clone, Debug)]
pub enum PipelineOutcome {
    /// 文字起こし完了
    Completed {
        transcript: String,
        /// この処理でグローバル上限に到達したか（警告表示用）
        limit_reached: bool,
        used_minutes: f64,
    },
    /// 受付時点で拒否（副作用なし）
    Rejected {
        used_minutes: f64,
        max_minutes: f64,
    },
    /// 処理失敗。ユーザー向けの短いメッセージを保持する
    Failed { message: String },
}
