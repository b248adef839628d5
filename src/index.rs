//! 媒体索引
//!
//! 嵌入式关系存储（SQLite）。索引独占底层连接，所有访问都经由这里的方法；
//! `checksum` 上的唯一索引是并发去重的最终仲裁。

use crate::error::{Result, SortError};
use crate::media::{MediaRecord, WIRE_TIME_FORMAT};
use rusqlite::{Connection, params};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// 批量插入时每个事务的最大行数
pub const BATCH_SIZE: usize = 100;

/// 打开数据库的重试次数
const OPEN_RETRIES: u32 = 3;

const SQL_EXISTS_CHECKSUM: &str = "SELECT count(*) FROM media WHERE checksum = ?1";
const SQL_EXISTS_CHECKSUM100K: &str = "SELECT count(*) FROM media WHERE checksum100k = ?1";
const SQL_INSERT: &str =
    "INSERT INTO media (filename, checksum, checksum100k, size, create_date) VALUES (?1, ?2, ?3, ?4, ?5)";
const SQL_INSERT_OR_IGNORE: &str =
    "INSERT OR IGNORE INTO media (filename, checksum, checksum100k, size, create_date) VALUES (?1, ?2, ?3, ?4, ?5)";

/// 单写者索引句柄
///
/// 连接不是 `Sync`，放在互斥锁后面；语句通过连接的语句缓存复用，
/// 不必每次查询重新编译。
pub struct MediaIndex {
    conn: Mutex<Option<Connection>>,
}

impl MediaIndex {
    /// 打开（或创建）索引数据库并初始化表结构
    ///
    /// 连接失败按指数退避重试（100ms、200ms、400ms），仍失败则返回错误。
    pub async fn open(path: &Path) -> Result<Self> {
        let conn = Self::open_with_retry(path).await?;
        init_schema(&conn)?;
        info!("索引已打开: {}", path.display());
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    async fn open_with_retry(path: &Path) -> Result<Connection> {
        let mut delay = Duration::from_millis(100);
        let mut last_err = None;
        for attempt in 1..=OPEN_RETRIES {
            match Connection::open(path) {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    if attempt < OPEN_RETRIES {
                        warn!(
                            "打开索引失败（第 {}/{} 次）: {}，{}ms 后重试",
                            attempt,
                            OPEN_RETRIES,
                            e,
                            delay.as_millis()
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(SortError::Index(format!(
            "打开索引失败（已重试 {} 次）: {}",
            OPEN_RETRIES,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// 全量哈希是否已收录
    ///
    /// 查询出错时按「不存在」处理并记录警告，调用方会在写入路径上再次确认。
    pub async fn exists_full(&self, checksum: &str) -> bool {
        self.exists_by(SQL_EXISTS_CHECKSUM, checksum).await
    }

    /// 前缀哈希是否已收录（非权威，仅作廉价过滤）
    pub async fn exists_prefix(&self, checksum: &str) -> bool {
        self.exists_by(SQL_EXISTS_CHECKSUM100K, checksum).await
    }

    async fn exists_by(&self, sql: &str, checksum: &str) -> bool {
        let guard = self.conn.lock().await;
        let Some(conn) = guard.as_ref() else {
            warn!("索引已关闭，存在性查询返回不存在");
            return false;
        };
        let result = conn
            .prepare_cached(sql)
            .and_then(|mut stmt| stmt.query_row(params![checksum], |row| row.get::<_, i64>(0)));
        match result {
            Ok(count) => count > 0,
            Err(e) => {
                warn!("存在性查询失败: {}", e);
                false
            }
        }
    }

    /// 插入单条记录
    ///
    /// 撞上唯一约束会直接报错；并发场景请走 `insert_batch` 的幂等路径。
    pub async fn insert(&self, record: &MediaRecord) -> Result<()> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(SortError::IndexClosed)?;
        let mut stmt = conn.prepare_cached(SQL_INSERT)?;
        stmt.execute(params![
            record.filename,
            record.checksum,
            record.checksum100k,
            record.size as i64,
            record.creation_time.format(WIRE_TIME_FORMAT).to_string(),
        ])?;
        Ok(())
    }

    /// 批量插入，按每事务至多 100 行分批
    ///
    /// 使用 INSERT OR IGNORE：并发写入同一哈希时输家静默跳过（0 行生效），
    /// 不会让整个事务回滚。单行错误记录警告后继续；整批全部失败才回滚报错。
    /// 返回值与输入一一对应，标记该行是否为新插入。
    pub async fn insert_batch(&self, records: &[MediaRecord]) -> Result<Vec<bool>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(SortError::IndexClosed)?;

        let mut inserted = Vec::with_capacity(records.len());
        for chunk in records.chunks(BATCH_SIZE) {
            let tx = conn
                .transaction()
                .map_err(|e| SortError::Index(format!("开启事务失败: {}", e)))?;
            let mut chunk_inserted = 0usize;
            let mut chunk_failed = 0usize;
            let mut first_err: Option<rusqlite::Error> = None;
            {
                let mut stmt = tx.prepare_cached(SQL_INSERT_OR_IGNORE)?;
                for record in chunk {
                    let result = stmt.execute(params![
                        record.filename,
                        record.checksum,
                        record.checksum100k,
                        record.size as i64,
                        record.creation_time.format(WIRE_TIME_FORMAT).to_string(),
                    ]);
                    match result {
                        // 0 行生效说明撞上了已有哈希，属预期情况
                        Ok(0) => inserted.push(false),
                        Ok(_) => {
                            chunk_inserted += 1;
                            inserted.push(true);
                        }
                        Err(e) => {
                            warn!("插入记录失败: {} - {}", record.filename, e);
                            if first_err.is_none() {
                                first_err = Some(e);
                            }
                            chunk_failed += 1;
                            inserted.push(false);
                        }
                    }
                }
            }
            if chunk_inserted == 0 && chunk_failed > 0 {
                tx.rollback()
                    .map_err(|e| SortError::Index(format!("回滚事务失败: {}", e)))?;
                return Err(SortError::Index(format!(
                    "整批插入失败: {}",
                    first_err.map(|e| e.to_string()).unwrap_or_default()
                )));
            }
            tx.commit()
                .map_err(|e| SortError::Index(format!("提交事务失败: {}", e)))?;
        }
        Ok(inserted)
    }

    /// 关闭索引，之后的操作将失败
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            conn.close()
                .map_err(|(_, e)| SortError::Index(format!("关闭索引失败: {}", e)))?;
        }
        Ok(())
    }
}

/// 建表、建索引、设置运行参数
fn init_schema(conn: &Connection) -> Result<()> {
    // WAL 带来崩溃后的原子恢复和更好的并发读；NORMAL 同步在 WAL 下仍然持久
    match conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0)) {
        Ok(mode) if mode.eq_ignore_ascii_case("wal") => {}
        Ok(mode) => warn!("未能启用 WAL 模式，当前: {}", mode),
        Err(e) => warn!("设置日志模式失败: {}", e),
    }
    if let Err(e) = conn.execute_batch("PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;") {
        warn!("设置 PRAGMA 失败: {}", e);
    }

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS settings (
            setting CHAR UNIQUE,
            value CHAR
        );
        CREATE TABLE IF NOT EXISTS media (
            filename CHAR,
            checksum CHAR UNIQUE,
            checksum100k CHAR,
            size INT,
            create_date TIMESTAMP
        );",
    )?;

    // checksum 上的唯一索引是并发去重的关键约束
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_checksum_unique ON media(checksum)",
        [],
    )?;
    // 高频查询列的普通索引，建失败不致命
    for (name, sql) in [
        (
            "idx_checksum100k",
            "CREATE INDEX IF NOT EXISTS idx_checksum100k ON media(checksum100k)",
        ),
        (
            "idx_create_date",
            "CREATE INDEX IF NOT EXISTS idx_create_date ON media(create_date)",
        ),
    ] {
        if let Err(e) = conn.execute(sql, []) {
            warn!("创建索引 {} 失败: {}", name, e);
        }
    }

    // 预热语句缓存，后续所有查询复用同一批已编译语句
    conn.prepare_cached(SQL_EXISTS_CHECKSUM)?;
    conn.prepare_cached(SQL_EXISTS_CHECKSUM100K)?;
    conn.prepare_cached(SQL_INSERT)?;
    Ok(())
}
