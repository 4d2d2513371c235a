use thiserror::Error;

/// パイプラインのエラー分類
///
/// 終端状態への遷移とクォータ計上の扱いがエラー種別ごとに異なるため、
/// オーケストレーターが分類できる形で保持する。
///
/// - `Decode`: 音声長が不明のため使用量は記録しない
/// - `Backend`: プロバイダ側で処理時間を消費した可能性があるため、
///   正規化時に確定した音声長を記録する
/// - `QuotaExceeded`: 処理開始前の拒否。リソース消費なし
/// - `Persistence`: 受付判定ではフェイルオープン（上限未到達扱い）
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 入力を音声としてデコードできなかった
    #[error("音声のデコードに失敗: {0}")]
    Decode(String),

    /// 文字起こしプロバイダの失敗（通信・認証・処理エラー）
    #[error("文字起こしバックエンドのエラー: {0}")]
    Backend(String),

    /// グローバル上限到達により受付を拒否
    #[error("グローバル上限に到達: {used_minutes:.2}/{max_minutes:.2} 分")]
    QuotaExceeded {
        used_minutes: f64,
        max_minutes: f64,
    },

    /// 使用量台帳ストアへのアクセス失敗
    #[error("台帳ストアのエラー: {0}")]
    Persistence(#[from] rusqlite::Error),
}
