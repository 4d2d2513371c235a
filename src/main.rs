use anyhow::Result;
use env_logger::Env;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use vmsg_transcribe::bot::Bot;
use vmsg_transcribe::config::Config;
use vmsg_transcribe::ledger::UsageLedger;
use vmsg_transcribe::pipeline::TranscriptionPipeline;
use vmsg_transcribe::telegram::TelegramClient;
use vmsg_transcribe::transcribe_backend::create_backend;

#[tokio::main]
async fn main() -> Result<()> {
    // ロガーを初期化
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .filter_module("flacenc", log::LevelFilter::Off)
        .init();

    // コマンドライン引数をパース
    let args: Vec<String> = std::env::args().collect();

    // 設定ファイル生成モード
    if args.len() > 1 && args[1] == "--generate-config" {
        let config_path = if args.len() > 2 {
            &args[2]
        } else {
            "config.toml"
        };
        Config::write_default(config_path)?;
        println!("設定ファイルを生成しました: {}", config_path);
        return Ok(());
    }

    // 設定ファイルのパス
    let config_path = if args.len() > 1 && !args[1].starts_with("--") {
        &args[1]
    } else {
        "config.toml"
    };

    // 設定を読み込み（資格情報は環境変数を優先）
    let mut config = Config::load_or_default(config_path)?;
    config.apply_env_overrides();

    log::info!("vmsg-transcribe を起動します");
    config.log_summary();

    // Ctrl+C ハンドラを設定
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc::set_handler(move || {
        log::info!("停止シグナルを受信しました...");
        running_clone.store(false, Ordering::SeqCst);
    })?;

    // 使用量台帳を開く（テーブルは初回に作成される）
    let ledger = Arc::new(UsageLedger::open(
        &config.storage.db_path,
        config.quota.max_minutes,
    )?);

    // 文字起こしバックエンドを構築
    let backend = create_backend(&config).await?;
    log::info!("文字起こしバックエンド: {}", backend.name());

    let pipeline = Arc::new(TranscriptionPipeline::new(
        Arc::clone(&ledger),
        backend,
        &config.quota,
    ));

    let client = Arc::new(TelegramClient::new(
        &config.bot.token,
        config.bot.poll_timeout_seconds,
    )?);

    let bot = Bot::new(client, pipeline, Arc::clone(&ledger));
    bot.run(running).await?;

    log::info!("vmsg-transcribe を終了しました");

    Ok(())
}
