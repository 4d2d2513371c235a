//! vmsg-transcribe - 音声メッセージの文字起こしボット
//!
//! このクレートは、チャット経由で届くボイスクリップを正規音声
//! （モノラル・16kHz・16bit PCM）に正規化し、設定で選択した
//! 音声認識バックエンドで文字起こしを行い、使用量を台帳に
//! 記録するパイプラインを提供します。
//!
//! # 主な機能
//!
//! - **音声正規化**: 任意のコンテナ/コーデックをデコードして単一の正規形に変換
//! - **バックエンド切り替え**: ストリーミング型 (Amazon Transcribe) とジョブ投入型 (AssemblyAI)
//! - **FLAC再エンコード**: 送信バイト数を削減する可逆圧縮（設定で無効化可能）
//! - **使用量台帳**: ユーザー別・全体の累計をSQLiteに記録し、グローバル上限で受付を制御
//! - **Telegramフロントエンド**: ロングポーリングでのコマンド/音声ディスパッチ
//!
//! # アーキテクチャ
//!
//! ```text
//! [Telegram] → [Bot] → [TranscriptionPipeline]
//!                            ↓
//!                     ┌──────┴──────┐
//!                     │             │
//!                [admission]    [normalize]
//!                     │             │
//!                     │             ↓
//!                     │      [TranscribeBackend]
//!                     │       (aws | assembly)
//!                     │             │
//!                     └──────┬──────┘
//!                            ↓
//!                      [UsageLedger]
//!                        (SQLite)
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use vmsg_transcribe::config::Config;
//!
//! // 設定ファイルを読み込み
//! let config = Config::load_or_default("config.toml").unwrap();
//!
//! // またはデフォルト設定を生成
//! Config::write_default("config.toml").unwrap();
//! ```

pub mod assembly_api;
pub mod audio;
pub mod aws_transcribe;
pub mod bot;
pub mod config;
pub mod error;
pub mod flac_encoder;
pub mod ledger;
pub mod pipeline;
pub mod telegram;
pub mod transcribe_backend;
pub mod types;
