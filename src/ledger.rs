use crate::error::PipelineError;
use crate::types::{Admission, GlobalReport, TopUser, UserReport};
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// グローバルカウンタ行の固定ID
const GLOBAL_COUNTER_ID: i64 = 1;

/// 使用量台帳
///
/// ユーザー別の使用記録（usage）とグローバル累計（global_counter）を
/// SQLiteに保持する。両エンティティと永続ストアはこのコンポーネントが
/// 専有し、他のコンポーネントは直接読み書きしない。
///
/// # 不変条件
///
/// - `global_counter.total_seconds` == usage全行の `duration_seconds` の総和。
///   `record_usage` が挿入と加算を単一トランザクションで行うことで維持する。
/// - `total_seconds` は減少しない（リセット操作は提供しない。運用上の
///   リセットはこのコンポーネントの契約外で、ストアを直接操作する）。
///
/// # 受付判定とソフトキャップ
///
/// `check_admission` と `record_usage` は意図的に同一の排他区間に
/// 入れていない。並行に受け付けた複数リクエストが揃って上限を
/// 超過することは許容し、超過が永続化された後に到着する
/// リクエストに対してのみ拒否を保証する。
pub struct UsageLedger {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    max_minutes: f64,
}

impl UsageLedger {
    /// 台帳を開く（なければ作成）
    ///
    /// 親ディレクトリとテーブルを初回に作成し、グローバルカウンタの
    /// 初期行を投入する。
    pub fn open<P: AsRef<Path>>(db_path: P, max_minutes: f64) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("データディレクトリの作成に失敗: {:?}", parent))?;
            }
        }

        let conn = Connection::open(&db_path)
            .with_context(|| format!("台帳データベースを開けません: {:?}", db_path))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                display_name TEXT,
                duration_seconds REAL NOT NULL,
                recorded_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS global_counter (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                total_seconds REAL DEFAULT 0,
                last_updated TIMESTAMP
            );",
        )
        .context("台帳スキーマの初期化に失敗")?;

        conn.execute(
            "INSERT OR IGNORE INTO global_counter (id, total_seconds, last_updated)
             VALUES (?1, 0, ?2)",
            rusqlite::params![GLOBAL_COUNTER_ID, Utc::now().to_rfc3339()],
        )
        .context("グローバルカウンタの初期化に失敗")?;

        log::info!("使用量台帳を初期化: {:?}", db_path);

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            max_minutes,
        })
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        // パニックしたスレッドが握っていてもDB接続自体は壊れていないため
        // ポイズニングは無視して回収する
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 受付判定
    ///
    /// グローバル累計が上限に達していれば `limit_reached = true`。
    /// 処理開始前に1回だけ評価される助言的な判定であり、並行する
    /// リクエスト群の合計超過は防がない（ソフトキャップ）。
    pub fn check_admission(&self) -> Result<Admission, PipelineError> {
        let conn = self.lock_conn();

        let total_seconds: f64 = conn.query_row(
            "SELECT total_seconds FROM global_counter WHERE id = ?1",
            [GLOBAL_COUNTER_ID],
            |row| row.get(0),
        )?;

        let used_minutes = total_seconds / 60.0;

        Ok(Admission {
            limit_reached: used_minutes >= self.max_minutes,
            used_minutes,
        })
    }

    /// 使用記録を追加
    ///
    /// usage への挿入と global_counter の加算を単一トランザクションで
    /// 実行する。片方だけが適用されることはない。
    pub fn record_usage(
        &self,
        user_id: i64,
        display_name: Option<&str>,
        duration_seconds: f64,
    ) -> Result<(), PipelineError> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.lock_conn();

        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO usage (user_id, display_name, duration_seconds, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![user_id, display_name, duration_seconds, now],
        )?;

        tx.execute(
            "UPDATE global_counter
             SET total_seconds = total_seconds + ?1, last_updated = ?2
             WHERE id = ?3",
            rusqlite::params![duration_seconds, now, GLOBAL_COUNTER_ID],
        )?;

        tx.commit()?;

        log::info!(
            "使用記録: user_id={}, {:.2}秒 ({})",
            user_id,
            duration_seconds,
            display_name.unwrap_or("不明")
        );

        Ok(())
    }

    /// ユーザー別レポート
    ///
    /// 記録のないユーザーはゼロ・Noneを返す。
    pub fn user_report(&self, user_id: i64) -> Result<UserReport, PipelineError> {
        let conn = self.lock_conn();

        let row: Option<(Option<f64>, Option<String>)> = conn
            .query_row(
                "SELECT SUM(duration_seconds), MAX(recorded_at)
                 FROM usage WHERE user_id = ?1",
                [user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (total_seconds, last_activity) = match row {
            Some((Some(total), last)) => (total, last),
            _ => (0.0, None),
        };

        Ok(UserReport {
            total_minutes: total_seconds / 60.0,
            last_activity,
        })
    }

    /// グローバルレポート
    ///
    /// 累計・最終更新時刻に加え、累計の大きい順の上位5ユーザーを返す。
    /// 同値の場合は表示名の昇順で安定に並ぶ。
    pub fn global_report(&self) -> Result<GlobalReport, PipelineError> {
        let conn = self.lock_conn();

        let (total_seconds, last_activity): (f64, Option<String>) = conn.query_row(
            "SELECT total_seconds, last_updated FROM global_counter WHERE id = ?1",
            [GLOBAL_COUNTER_ID],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut stmt = conn.prepare(
            "SELECT display_name, SUM(duration_seconds) AS total
             FROM usage
             GROUP BY display_name
             ORDER BY total DESC, display_name ASC
             LIMIT 5",
        )?;

        let top_users = stmt
            .query_map([], |row| {
                let display_name: Option<String> = row.get(0)?;
                let total: f64 = row.get(1)?;
                Ok(TopUser {
                    display_name,
                    minutes: total / 60.0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(GlobalReport {
            total_minutes: total_seconds / 60.0,
            last_activity,
            top_users,
        })
    }

    /// 設定されたグローバル上限（分）
    pub fn max_minutes(&self) -> f64 {
        self.max_minutes
    }

    /// 台帳データベースのパス
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}
