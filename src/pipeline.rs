use crate::audio;
use crate::config::QuotaConfig;
use crate::ledger::UsageLedger;
use crate::transcribe_backend::TranscribeBackend;
use crate::types::{Admission, PipelineOutcome, VoiceRequest};
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// 音声ファイルの取得元（外部トランスポートの境界）
///
/// チャット基盤のファイルダウンロードAPIなど、生バイト列の入手手段を
/// 抽象化する。実装は `dest` に実体を書き込むだけで、一時ファイルの
/// 寿命管理はパイプライン側が持つ。
#[async_trait]
pub trait VoiceSource: Send + Sync {
    /// ファイル参照の実体を `dest` にダウンロード
    ///
    /// 戻り値はトランスポートが知っている拡張子ヒント（"oga" など）。
    /// デコーダのプローブに渡される。不明なら None。
    async fn download_to(&self, file_id: &str, dest: &Path) -> Result<Option<String>>;
}

/// ユーザー向けの失敗メッセージ（終端状態ごとに1テンプレート）
const MSG_DOWNLOAD_FAILED: &str = "Error: could not download the voice message.";
const MSG_DECODE_FAILED: &str =
    "Sorry, I couldn't read that audio. Please send a regular voice message.";
const MSG_BACKEND_FAILED: &str = "Sorry, transcription failed. Please try again later.";
const MSG_INTERNAL: &str = "Sorry, something went wrong while processing your message.";

/// パイプラインオーケストレーター
///
/// 1件のボイスクリップを 受付判定 → 取得 → 正規化 → 文字起こし →
/// 記録 の順で処理し、必ず終端状態（Completed / Rejected / Failed）を
/// 返す。エラーはこの境界より外へ伝播しない。
///
/// # 一時リソース
///
/// ダウンロードした生ファイルはスコープ付き一時ファイルとして確保し、
/// 成功・失敗・キャンセルのどの経路でもドロップ時に削除される。
/// 中間の再エンコードはすべてインメモリで行う。
///
/// # 並行性
///
/// 各クリップは独立したタスクとして処理される。受付判定と記録は
/// 同一の排他区間に入れない（ソフトキャップ、`UsageLedger` 参照）。
/// CPU負荷の高いデコードとブロッキングするストアアクセスは
/// `spawn_blocking` に隔離し、遅い文字起こしが他ユーザーの受付を
/// 妨げないようにする。
pub struct TranscriptionPipeline {
    ledger: Arc<UsageLedger>,
    backend: Arc<dyn TranscribeBackend>,
    record_failed_attempts: bool,
    temp_dir: PathBuf,
}

impl TranscriptionPipeline {
    pub fn new(
        ledger: Arc<UsageLedger>,
        backend: Arc<dyn TranscribeBackend>,
        quota: &QuotaConfig,
    ) -> Self {
        Self {
            ledger,
            backend,
            record_failed_attempts: quota.record_failed_attempts,
            temp_dir: std::env::temp_dir(),
        }
    }

    /// 一時ファイルの置き場所を変更（主にテスト用）
    pub fn with_temp_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// 1件のボイスクリップを処理
    pub async fn process(&self, request: VoiceRequest, source: &dyn VoiceSource) -> PipelineOutcome {
        // 1. 受付判定（助言的。ここで拒否なら副作用なし）
        let admission = self.check_admission_fail_open().await;
        if admission.limit_reached {
            log::info!(
                "受付拒否: user_id={}, 使用量 {:.2}/{:.2} 分",
                request.user_id,
                admission.used_minutes,
                self.ledger.max_minutes()
            );
            return PipelineOutcome::Rejected {
                used_minutes: admission.used_minutes,
                max_minutes: self.ledger.max_minutes(),
            };
        }

        // 2. トランスポートから一時ファイルへ取得。
        //    この束縛のドロップで、どの終了経路でもファイルが消える
        let temp_file = match NamedTempFile::new_in(&self.temp_dir) {
            Ok(f) => f,
            Err(e) => {
                log::error!("一時ファイルの作成に失敗: {}", e);
                return PipelineOutcome::Failed {
                    message: MSG_INTERNAL.to_string(),
                };
            }
        };

        let extension_hint = match source.download_to(&request.file_id, temp_file.path()).await {
            Ok(hint) => hint,
            Err(e) => {
                log::error!("音声のダウンロードに失敗: file_id={}: {}", request.file_id, e);
                return PipelineOutcome::Failed {
                    message: MSG_DOWNLOAD_FAILED.to_string(),
                };
            }
        };

        let raw = match tokio::fs::read(temp_file.path()).await {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("一時ファイルの読み込みに失敗: {}", e);
                return PipelineOutcome::Failed {
                    message: MSG_INTERNAL.to_string(),
                };
            }
        };

        // 3. 正規化（CPU負荷が高いためブロッキングプールへ）
        let normalized = tokio::task::spawn_blocking(move || {
            audio::normalize(&raw, extension_hint.as_deref())
        })
        .await;
        let canonical = match normalized {
            Ok(Ok(audio)) => audio,
            Ok(Err(e)) => {
                // 音声長が不明なため何も記録しない
                log::warn!("正規化に失敗: user_id={}: {}", request.user_id, e);
                return PipelineOutcome::Failed {
                    message: MSG_DECODE_FAILED.to_string(),
                };
            }
            Err(e) => {
                log::error!("正規化タスクの合流に失敗: {}", e);
                return PipelineOutcome::Failed {
                    message: MSG_INTERNAL.to_string(),
                };
            }
        };

        let duration_seconds = canonical.duration_seconds();
        log::debug!(
            "正規化完了: user_id={}, {:.2}秒, backend={}",
            request.user_id,
            duration_seconds,
            self.backend.name()
        );

        // 4. 文字起こし
        match self.backend.transcribe(&canonical).await {
            Ok(transcript) => {
                // 5. 記録（ベストエフォート。失敗はログのみ）
                self.record_best_effort(&request, duration_seconds).await;

                // 6. 警告表示用に再判定（遡及的な拒否はしない）
                let after = self.check_admission_fail_open().await;
                PipelineOutcome::Completed {
                    transcript,
                    limit_reached: after.limit_reached,
                    used_minutes: after.used_minutes,
                }
            }
            Err(e) => {
                log::error!(
                    "文字起こしに失敗: user_id={}, backend={}: {}",
                    request.user_id,
                    self.backend.name(),
                    e
                );
                // プロバイダ側では処理時間を消費している可能性があるため、
                // 正規化時に確定した音声長を記録する（設定で無効化可能）
                if self.record_failed_attempts {
                    self.record_best_effort(&request, duration_seconds).await;
                }
                PipelineOutcome::Failed {
                    message: MSG_BACKEND_FAILED.to_string(),
                }
            }
        }
    }

    /// 受付判定。ストア障害時はフェイルオープン（上限未到達扱い）
    async fn check_admission_fail_open(&self) -> Admission {
        let ledger = Arc::clone(&self.ledger);
        match tokio::task::spawn_blocking(move || ledger.check_admission()).await {
            Ok(Ok(admission)) => admission,
            Ok(Err(e)) => {
                log::error!("受付判定に失敗。フェイルオープンで続行: {}", e);
                Admission {
                    limit_reached: false,
                    used_minutes: 0.0,
                }
            }
            Err(e) => {
                log::error!("受付判定タスクの合流に失敗: {}", e);
                Admission {
                    limit_reached: false,
                    used_minutes: 0.0,
                }
            }
        }
    }

    /// 使用記録の書き込み（ベストエフォート）
    async fn record_best_effort(&self, request: &VoiceRequest, duration_seconds: f64) {
        let ledger = Arc::clone(&self.ledger);
        let user_id = request.user_id;
        let display_name = request.display_name.clone();

        let result = tokio::task::spawn_blocking(move || {
            ledger.record_usage(user_id, display_name.as_deref(), duration_seconds)
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::error!(
                    "使用記録の書き込みに失敗（処理は継続）: user_id={}: {}",
                    user_id,
                    e
                );
            }
            Err(e) => {
                log::error!("記録タスクの合流に失敗: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuotaConfig;
    use crate::error::PipelineError;
    use crate::types::CanonicalAudio;
    use rusqlite::Connection;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// 16kHzモノラルWAVのバイト列を生成
    fn wav_fixture(seconds: f64) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let count = (16000.0 * seconds) as usize;
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..count {
                writer
                    .write_sample(((i as f32 * 0.05).sin() * 8000.0) as i16)
                    .unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    /// OGG/Opusのバイト列を生成（Telegramボイスノート相当）
    fn ogg_opus_fixture(seconds: f32) -> Vec<u8> {
        use ogg::{PacketWriteEndInfo, PacketWriter};

        let mut head = Vec::new();
        head.extend_from_slice(b"OpusHead");
        head.push(1);
        head.push(1);
        head.extend_from_slice(&312u16.to_le_bytes()); // プリスキップ
        head.extend_from_slice(&48000u32.to_le_bytes());
        head.extend_from_slice(&0u16.to_le_bytes());
        head.push(0);

        let mut tags = Vec::new();
        tags.extend_from_slice(b"OpusTags");
        tags.extend_from_slice(&0u32.to_le_bytes());
        tags.extend_from_slice(&0u32.to_le_bytes());

        let mut encoder =
            opus::Encoder::new(48000, opus::Channels::Mono, opus::Application::Voip).unwrap();
        let pcm: Vec<i16> = (0..(48000.0 * seconds) as usize)
            .map(|i| ((i as f32 * 0.02).sin() * 8000.0) as i16)
            .collect();
        let serial = 0x7e1e;

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = PacketWriter::new(&mut cursor);
            writer
                .write_packet(
                    head,
                    serial,
                    PacketWriteEndInfo::EndPage,
                    0,
                )
                .unwrap();
            writer
                .write_packet(
                    tags,
                    serial,
                    PacketWriteEndInfo::EndPage,
                    0,
                )
                .unwrap();

            let frames: Vec<&[i16]> = pcm.chunks(960).filter(|c| c.len() == 960).collect();
            let mut granule = 0u64;
            for (i, frame) in frames.iter().enumerate() {
                let packet = encoder.encode_vec(frame, 4000).unwrap();
                granule += 960;
                let info = if i == frames.len() - 1 {
                    PacketWriteEndInfo::EndStream
                } else {
                    PacketWriteEndInfo::NormalPacket
                };
                writer
                    .write_packet(packet, serial, info, granule)
                    .unwrap();
            }
        }
        cursor.into_inner()
    }

    struct StaticSource {
        data: Vec<u8>,
        hint: Option<String>,
        called: AtomicBool,
    }

    impl StaticSource {
        fn new(data: Vec<u8>) -> Self {
            Self {
                data,
                hint: None,
                called: AtomicBool::new(false),
            }
        }

        fn with_hint(mut self, hint: &str) -> Self {
            self.hint = Some(hint.to_string());
            self
        }
    }

    #[async_trait]
    impl VoiceSource for StaticSource {
        async fn download_to(&self, _file_id: &str, dest: &Path) -> Result<Option<String>> {
            self.called.store(true, Ordering::SeqCst);
            tokio::fs::write(dest, &self.data).await?;
            Ok(self.hint.clone())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl VoiceSource for FailingSource {
        async fn download_to(&self, _file_id: &str, _dest: &Path) -> Result<Option<String>> {
            anyhow::bail!("simulated transport failure")
        }
    }

    struct OkBackend;

    #[async_trait]
    impl TranscribeBackend for OkBackend {
        async fn transcribe(&self, _audio: &CanonicalAudio) -> Result<String, PipelineError> {
            Ok("zdravo svete".to_string())
        }

        fn name(&self) -> &'static str {
            "mock-ok"
        }
    }

    struct ErrBackend;

    #[async_trait]
    impl TranscribeBackend for ErrBackend {
        async fn transcribe(&self, _audio: &CanonicalAudio) -> Result<String, PipelineError> {
            Err(PipelineError::Backend("simulated provider error".to_string()))
        }

        fn name(&self) -> &'static str {
            "mock-err"
        }
    }

    /// 文字起こしに入ったことを通知してから永遠に完了しないバックエンド
    struct HangingBackend {
        entered: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl TranscribeBackend for HangingBackend {
        async fn transcribe(&self, _audio: &CanonicalAudio) -> Result<String, PipelineError> {
            self.entered.notify_one();
            std::future::pending::<()>().await;
            unreachable!()
        }

        fn name(&self) -> &'static str {
            "mock-hanging"
        }
    }

    /// 全タスクが受付を通過するまで文字起こしを完了させないバックエンド
    struct BarrierBackend {
        barrier: Arc<tokio::sync::Barrier>,
    }

    #[async_trait]
    impl TranscribeBackend for BarrierBackend {
        async fn transcribe(&self, _audio: &CanonicalAudio) -> Result<String, PipelineError> {
            self.barrier.wait().await;
            Ok("ok".to_string())
        }

        fn name(&self) -> &'static str {
            "mock-barrier"
        }
    }

    struct TestEnv {
        _dir: TempDir,
        temp_dir: PathBuf,
        ledger: Arc<UsageLedger>,
    }

    fn setup(max_minutes: f64) -> TestEnv {
        let dir = TempDir::new().unwrap();
        let temp_dir = dir.path().join("tmp");
        std::fs::create_dir_all(&temp_dir).unwrap();
        let ledger =
            Arc::new(UsageLedger::open(dir.path().join("stats.db"), max_minutes).unwrap());
        TestEnv {
            _dir: dir,
            temp_dir,
            ledger,
        }
    }

    fn pipeline(env: &TestEnv, backend: Arc<dyn TranscribeBackend>) -> TranscriptionPipeline {
        TranscriptionPipeline::new(
            Arc::clone(&env.ledger),
            backend,
            &QuotaConfig {
                max_minutes: env.ledger.max_minutes(),
                record_failed_attempts: true,
            },
        )
        .with_temp_dir(&env.temp_dir)
    }

    fn request() -> VoiceRequest {
        VoiceRequest {
            user_id: 42,
            display_name: Some("ana".to_string()),
            file_id: "file-1".to_string(),
        }
    }

    fn temp_dir_is_empty(env: &TestEnv) -> bool {
        std::fs::read_dir(&env.temp_dir).unwrap().next().is_none()
    }

    fn record_count(ledger: &UsageLedger) -> i64 {
        let conn = Connection::open(ledger.db_path()).unwrap();
        conn.query_row("SELECT COUNT(*) FROM usage", [], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn test_successful_run_records_and_cleans_up() {
        let env = setup(50.0);
        let pipeline = pipeline(&env, Arc::new(OkBackend));
        let source = StaticSource::new(wav_fixture(12.0));

        let outcome = pipeline.process(request(), &source).await;

        match outcome {
            PipelineOutcome::Completed {
                transcript,
                limit_reached,
                ..
            } => {
                assert_eq!(transcript, "zdravo svete");
                assert!(!limit_reached);
            }
            other => panic!("Completed以外の終端状態: {:?}", other),
        }

        let report = env.ledger.global_report().unwrap();
        assert!((report.total_minutes - 0.20).abs() < 1e-6);
        assert_eq!(record_count(&env.ledger), 1);
        assert!(temp_dir_is_empty(&env));
    }

    #[tokio::test]
    async fn test_backend_error_still_records_duration() {
        // シナリオ: 30秒のクリップでプロバイダがエラーを返す
        let env = setup(50.0);
        let pipeline = pipeline(&env, Arc::new(ErrBackend));
        let source = StaticSource::new(wav_fixture(30.0));

        let outcome = pipeline.process(request(), &source).await;

        assert!(matches!(outcome, PipelineOutcome::Failed { .. }));

        // 試行した音声長は記録されている
        let report = env.ledger.global_report().unwrap();
        assert!((report.total_minutes * 60.0 - 30.0).abs() < 0.1);
        assert_eq!(record_count(&env.ledger), 1);
        assert!(temp_dir_is_empty(&env));
    }

    #[tokio::test]
    async fn test_backend_error_not_recorded_when_disabled() {
        let env = setup(50.0);
        let pipeline = TranscriptionPipeline::new(
            Arc::clone(&env.ledger),
            Arc::new(ErrBackend),
            &QuotaConfig {
                max_minutes: 50.0,
                record_failed_attempts: false,
            },
        )
        .with_temp_dir(&env.temp_dir);
        let source = StaticSource::new(wav_fixture(10.0));

        let outcome = pipeline.process(request(), &source).await;

        assert!(matches!(outcome, PipelineOutcome::Failed { .. }));
        assert_eq!(record_count(&env.ledger), 0);
    }

    #[tokio::test]
    async fn test_decode_failure_records_nothing() {
        let env = setup(50.0);
        let pipeline = pipeline(&env, Arc::new(OkBackend));
        let source = StaticSource::new(vec![0xFF; 64]);

        let outcome = pipeline.process(request(), &source).await;

        match outcome {
            PipelineOutcome::Failed { message } => {
                assert!(message.contains("couldn't read"));
            }
            other => panic!("Failed以外の終端状態: {:?}", other),
        }

        // 音声長が不明なので何も記録されない
        assert_eq!(record_count(&env.ledger), 0);
        assert!(temp_dir_is_empty(&env));
    }

    #[tokio::test]
    async fn test_download_failure_cleans_up() {
        let env = setup(50.0);
        let pipeline = pipeline(&env, Arc::new(OkBackend));

        let outcome = pipeline.process(request(), &FailingSource).await;

        assert!(matches!(outcome, PipelineOutcome::Failed { .. }));
        assert_eq!(record_count(&env.ledger), 0);
        assert!(temp_dir_is_empty(&env));
    }

    #[tokio::test]
    async fn test_voice_note_ogg_opus_end_to_end() {
        // 実際に届く形式（OGG/Opus、拡張子 .oga）で完走すること
        let env = setup(50.0);
        let pipeline = pipeline(&env, Arc::new(OkBackend));
        let source = StaticSource::new(ogg_opus_fixture(6.0)).with_hint("oga");

        let outcome = pipeline.process(request(), &source).await;

        assert!(matches!(outcome, PipelineOutcome::Completed { .. }));

        // 音声長はデコード済みバッファから計上される（約6秒）
        let report = env.ledger.global_report().unwrap();
        assert!((report.total_minutes * 60.0 - 6.0).abs() < 0.2);
        assert!(temp_dir_is_empty(&env));
    }

    #[tokio::test]
    async fn test_abort_during_transcription_cleans_up() {
        // 文字起こし中にタスクが中断されても一時ファイルは残らない
        let env = setup(50.0);
        let entered = Arc::new(tokio::sync::Notify::new());
        let pipeline = Arc::new(pipeline(
            &env,
            Arc::new(HangingBackend {
                entered: Arc::clone(&entered),
            }),
        ));

        let wav = wav_fixture(5.0);
        let task_pipeline = Arc::clone(&pipeline);
        let handle = tokio::spawn(async move {
            let source = StaticSource::new(wav);
            task_pipeline.process(request(), &source).await
        });

        // バックエンドに到達した時点で中断する
        entered.notified().await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        assert!(temp_dir_is_empty(&env));
        assert_eq!(record_count(&env.ledger), 0);
    }

    #[tokio::test]
    async fn test_rejection_has_no_side_effects() {
        let env = setup(1.0);
        env.ledger.record_usage(1, Some("ana"), 120.0).unwrap();

        let pipeline = pipeline(&env, Arc::new(OkBackend));
        let source = StaticSource::new(wav_fixture(5.0));

        let outcome = pipeline.process(request(), &source).await;

        match outcome {
            PipelineOutcome::Rejected {
                used_minutes,
                max_minutes,
            } => {
                assert!((used_minutes - 2.0).abs() < 1e-9);
                assert!((max_minutes - 1.0).abs() < 1e-9);
            }
            other => panic!("Rejected以外の終端状態: {:?}", other),
        }

        // トランスポートにも触れていない
        assert!(!source.called.load(Ordering::SeqCst));
        assert_eq!(record_count(&env.ledger), 1);
        assert!(temp_dir_is_empty(&env));
    }

    #[tokio::test]
    async fn test_completion_annotates_limit_reached() {
        let env = setup(0.1); // 上限6秒
        let pipeline = pipeline(&env, Arc::new(OkBackend));
        let source = StaticSource::new(wav_fixture(12.0));

        let outcome = pipeline.process(request(), &source).await;

        // 処理自体は完了し、警告フラグだけが立つ（遡及的拒否はしない）
        match outcome {
            PipelineOutcome::Completed { limit_reached, .. } => assert!(limit_reached),
            other => panic!("Completed以外の終端状態: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_soft_cap_overshoot() {
        // シナリオ: 残量12秒のところへ11秒のクリップが5本同時に届く。
        // 全件が受付を通過してよい（ソフトキャップ）。完了後の6件目は拒否
        let env = setup(0.2); // 上限12秒
        let barrier = Arc::new(tokio::sync::Barrier::new(5));
        let pipeline = Arc::new(pipeline(
            &env,
            Arc::new(BarrierBackend {
                barrier: Arc::clone(&barrier),
            }),
        ));

        let wav = wav_fixture(11.0);
        let mut handles = Vec::new();
        for i in 0..5 {
            let pipeline = Arc::clone(&pipeline);
            let wav = wav.clone();
            handles.push(tokio::spawn(async move {
                let source = StaticSource::new(wav);
                let req = VoiceRequest {
                    user_id: i,
                    display_name: Some(format!("user{}", i)),
                    file_id: format!("file-{}", i),
                };
                pipeline.process(req, &source).await
            }));
        }

        for handle in handles {
            let outcome = handle.await.unwrap();
            assert!(matches!(outcome, PipelineOutcome::Completed { .. }));
        }

        // 超過分まで記録されている
        let report = env.ledger.global_report().unwrap();
        assert!((report.total_minutes * 60.0 - 55.0).abs() < 0.5);

        // 超過が永続化された後のリクエストは拒否される
        let source = StaticSource::new(wav_fixture(1.0));
        let outcome = pipeline.process(request(), &source).await;
        assert!(matches!(outcome, PipelineOutcome::Rejected { .. }));
        assert!(temp_dir_is_empty(&env));
    }

    #[tokio::test]
    async fn test_admission_fails_open_on_store_outage() {
        let env = setup(50.0);

        // ストア障害をシミュレート
        {
            let conn = Connection::open(env.ledger.db_path()).unwrap();
            conn.execute("DROP TABLE global_counter", []).unwrap();
        }

        let pipeline = pipeline(&env, Arc::new(OkBackend));
        let source = StaticSource::new(wav_fixture(3.0));

        // 受付判定はフェイルオープンし、パイプラインは完走する
        let outcome = pipeline.process(request(), &source).await;
        assert!(matches!(outcome, PipelineOutcome::Completed { .. }));
        assert!(temp_dir_is_empty(&env));
    }
}
