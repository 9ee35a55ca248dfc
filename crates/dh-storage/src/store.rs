//! SQLite match store: one connection behind one lock, switchable between file and memory.

use std::path::{Path, PathBuf};

use dh_core::{DraftPage, MatchRecord, Team};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const CREATE_MATCH_INFO: &str = r#"CREATE TABLE IF NOT EXISTS match_info (
    match_id INTEGER PRIMARY KEY NOT NULL,
    match_time INTEGER,
    winner INTEGER,
    duration INTEGER,
    r_score INTEGER,
    d_score INTEGER,
    skill INTEGER,
    region INTEGER,
    salt INTEGER,
    replay TEXT,
    throw INTEGER,
    loss INTEGER )"#;

const CREATE_HERO_PICKS: &str = r#"CREATE TABLE IF NOT EXISTS hero_picks (
    match_id INTEGER NOT NULL,
    team INTEGER,
    hero INTEGER,
    PRIMARY KEY (match_id, hero),
    FOREIGN KEY (match_id) REFERENCES match_info(match_id) ON DELETE CASCADE )"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    File,
    Memory,
}

#[derive(Debug)]
struct StoreState {
    conn: SqliteConnection,
    mode: StoreMode,
    /// File currently backing the connection, or last backing it while in memory.
    file_path: PathBuf,
}

/// Thread-safe match store. Every call holds the single store lock for its whole duration.
#[derive(Debug)]
pub struct MatchStore {
    path: PathBuf,
    mem_only: bool,
    state: Mutex<StoreState>,
}

impl MatchStore {
    /// Opens (creating if needed) the database file. `mem_only` moves it into memory right away
    /// and never writes it back.
    pub async fn open(path: impl Into<PathBuf>, mem_only: bool) -> Result<Self, StoreError> {
        let path = path.into();
        info!(path = %path.display(), "connecting to match store");
        let conn = connect_file(&path).await?;
        info!(path = %path.display(), "match store initialized");

        let store = Self {
            path: path.clone(),
            mem_only,
            state: Mutex::new(StoreState {
                conn,
                mode: StoreMode::File,
                file_path: path,
            }),
        };
        if mem_only {
            store.to_memory().await?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn mode(&self) -> StoreMode {
        self.state.lock().await.mode
    }

    /// Upserts a match and its ten picks in one transaction.
    ///
    /// Returns `Ok(false)` without touching storage when the record is invalid. Storage failures
    /// roll back and are returned to the caller.
    pub async fn commit(&self, record: &MatchRecord) -> Result<bool, StoreError> {
        if let Err(reason) = record.check() {
            warn!(match_id = record.match_id, %reason, "invalid match submitted to the store");
            return Ok(false);
        }

        let mut state = self.state.lock().await;
        let mut tx = state.conn.begin().await?;
        match write_match(&mut tx, record).await {
            Ok(()) => tx.commit().await?,
            Err(err) => {
                error!(
                    match_id = record.match_id,
                    error = %err,
                    "match insert failed, rolling back"
                );
                tx.rollback().await?;
                return Err(err);
            }
        }
        Ok(true)
    }

    /// Returns up to `limit` matches with `match_id >= starting_from`, in ascending id order,
    /// with picks split by whether the pick's side won.
    pub async fn get_drafts(
        &self,
        starting_from: i64,
        limit: i64,
    ) -> Result<DraftPage, StoreError> {
        let limit = limit.max(1);
        let starting_from = starting_from.max(0);

        let rows = {
            let mut state = self.state.lock().await;
            sqlx::query(
                r#"SELECT m.match_id, m.winner, h.hero, h.team
                   FROM match_info m
                   INNER JOIN hero_picks h ON m.match_id = h.match_id
                   WHERE m.match_id IN (
                       SELECT match_id FROM match_info
                       WHERE match_id >= ?
                       ORDER BY match_id
                       LIMIT ?
                   )
                   ORDER BY m.match_id, h.rowid"#,
            )
            .bind(starting_from)
            .bind(limit)
            .fetch_all(&mut state.conn)
            .await?
        };

        let mut page = DraftPage::default();
        for row in rows {
            let match_id: i64 = row.try_get(0)?;
            let winner: i64 = row.try_get(1)?;
            let hero: i64 = row.try_get(2)?;
            let team: i64 = row.try_get(3)?;

            let picks = page.drafts.entry(match_id).or_default();
            if team == winner {
                picks.win_picks.push(hero);
            } else {
                picks.loss_picks.push(hero);
            }
            page.max_id = page.max_id.max(match_id);
        }
        page.count = page.drafts.len();
        Ok(page)
    }

    pub async fn get_total_examples(&self) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM match_info")
            .fetch_one(&mut state.conn)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Match id sitting at `fraction` of the ordered id space, used to split train and validation.
    pub async fn get_percentile_id(&self, fraction: f64) -> Result<Option<i64>, StoreError> {
        let total = self.get_total_examples().await?;
        if total == 0 {
            return Ok(None);
        }
        let fraction = fraction.clamp(0.0, 1.0);
        let offset = ((total as f64 * fraction).floor() as i64 - 1).clamp(0, total as i64 - 1);

        let mut state = self.state.lock().await;
        let id: Option<i64> =
            sqlx::query_scalar("SELECT match_id FROM match_info ORDER BY match_id LIMIT 1 OFFSET ?")
                .bind(offset)
                .fetch_optional(&mut state.conn)
                .await?;
        Ok(id)
    }

    /// Reloads the whole database into an in-memory connection.
    pub async fn to_memory(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.mode == StoreMode::Memory {
            error!("match store is already in memory");
            return Ok(());
        }

        info!(path = %state.file_path.display(), "moving match store into memory");
        let mut memory = connect_memory().await?;
        copy_from_file(&mut memory, &state.file_path).await?;

        let file_conn = std::mem::replace(&mut state.conn, memory);
        file_conn.close().await?;
        state.mode = StoreMode::Memory;
        info!("match store now working from memory");
        Ok(())
    }

    /// Writes the in-memory database to `<path>.mem`; with `overwrite` that file then atomically
    /// replaces the original. The store continues on the written file.
    pub async fn to_file(&self, overwrite: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.mode == StoreMode::File || self.mem_only {
            error!("match store is already file backed or restricted to memory");
            return Ok(());
        }

        let staged = staging_path(&self.path);
        info!(path = %staged.display(), overwrite, "moving match store from memory to a file");
        match tokio::fs::remove_file(&staged).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let sql = format!("VACUUM INTO {}", sql_string_literal(&staged));
        sqlx::query(&sql).execute(&mut state.conn).await?;

        let target = if overwrite {
            tokio::fs::rename(&staged, &self.path).await?;
            self.path.clone()
        } else {
            staged
        };

        let file_conn = connect_file(&target).await?;
        let memory = std::mem::replace(&mut state.conn, file_conn);
        memory.close().await?;
        state.mode = StoreMode::File;
        state.file_path = target;
        info!("match store now working from file");
        Ok(())
    }

    /// Flushes an in-memory store back over the original file, then closes the connection.
    pub async fn close(self) -> Result<(), StoreError> {
        if !self.mem_only && self.mode().await == StoreMode::Memory {
            self.to_file(true).await?;
        }
        let state = self.state.into_inner();
        state.conn.close().await?;
        Ok(())
    }
}

/// Restartable batch iterator over [`MatchStore::get_drafts`].
#[derive(Debug)]
pub struct DraftCursor<'a> {
    store: &'a MatchStore,
    batch_size: i64,
    next_id: i64,
}

impl<'a> DraftCursor<'a> {
    pub fn new(store: &'a MatchStore, batch_size: i64) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            next_id: 0,
        }
    }

    pub fn starting_at(mut self, match_id: i64) -> Self {
        self.next_id = match_id.max(0);
        self
    }

    pub fn position(&self) -> i64 {
        self.next_id
    }

    pub fn reset(&mut self) {
        self.next_id = 0;
    }

    /// Next page, or `None` once the cursor has passed the highest stored match.
    pub async fn next_batch(&mut self) -> Result<Option<DraftPage>, StoreError> {
        let page = self.store.get_drafts(self.next_id, self.batch_size).await?;
        if page.count == 0 {
            return Ok(None);
        }
        self.next_id = page.max_id + 1;
        Ok(Some(page))
    }
}

/// Stored `team` value for a side. Radiant is stored as 1 so that `team == winner` holds for
/// the winning side, since `winner` is 1 on a radiant victory.
fn stored_team(team: Team) -> i64 {
    match team {
        Team::Radiant => 1,
        Team::Dire => 0,
    }
}

async fn write_match(conn: &mut SqliteConnection, record: &MatchRecord) -> Result<(), StoreError> {
    let replay = record.replay.as_ref();
    sqlx::query(
        r#"INSERT INTO match_info (
               match_id, match_time, winner, duration, r_score, d_score,
               skill, region, salt, replay, throw, loss
           ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(match_id) DO UPDATE SET
               match_time = excluded.match_time,
               winner = excluded.winner,
               duration = excluded.duration,
               r_score = excluded.r_score,
               d_score = excluded.d_score,
               skill = excluded.skill,
               region = excluded.region,
               salt = excluded.salt,
               replay = excluded.replay,
               throw = excluded.throw,
               loss = excluded.loss"#,
    )
    .bind(record.match_id)
    .bind(record.match_time)
    .bind(record.winner)
    .bind(record.duration)
    .bind(record.radiant_score)
    .bind(record.dire_score)
    .bind(record.skill)
    .bind(record.region)
    .bind(replay.map(|r| r.salt))
    .bind(replay.map(|r| r.url.clone()))
    .bind(replay.map(|r| r.throw))
    .bind(replay.map(|r| r.loss))
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM hero_picks WHERE match_id = ?")
        .bind(record.match_id)
        .execute(&mut *conn)
        .await?;

    let picks = record
        .radiant_picks
        .iter()
        .map(|&hero| (Team::Radiant, hero))
        .chain(record.dire_picks.iter().map(|&hero| (Team::Dire, hero)));
    for (team, hero) in picks {
        sqlx::query("INSERT INTO hero_picks (match_id, team, hero) VALUES (?, ?, ?)")
            .bind(record.match_id)
            .bind(stored_team(team))
            .bind(hero)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn init_schema(conn: &mut SqliteConnection) -> Result<(), StoreError> {
    sqlx::query("PRAGMA foreign_keys = 1").execute(&mut *conn).await?;
    sqlx::query(CREATE_MATCH_INFO).execute(&mut *conn).await?;
    sqlx::query(CREATE_HERO_PICKS).execute(&mut *conn).await?;
    Ok(())
}

async fn connect_file(path: &Path) -> Result<SqliteConnection, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut conn = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete)
        .foreign_keys(true)
        .connect()
        .await?;
    init_schema(&mut conn).await?;
    Ok(conn)
}

/// Private in-memory database opened by plain `:memory:` filename. The `sqlite::memory:` URL sets
/// `SQLITE_OPEN_MEMORY`, which attached databases inherit, hiding the file being copied in.
async fn connect_memory() -> Result<SqliteConnection, StoreError> {
    let mut conn = SqliteConnectOptions::new()
        .filename(":memory:")
        .foreign_keys(true)
        .connect()
        .await?;
    init_schema(&mut conn).await?;
    Ok(conn)
}

async fn copy_from_file(conn: &mut SqliteConnection, path: &Path) -> Result<(), StoreError> {
    let attach = format!("ATTACH DATABASE {} AS src", sql_string_literal(path));
    sqlx::query(&attach).execute(&mut *conn).await?;
    sqlx::query("INSERT INTO main.match_info SELECT * FROM src.match_info")
        .execute(&mut *conn)
        .await?;
    sqlx::query("INSERT INTO main.hero_picks SELECT * FROM src.hero_picks")
        .execute(&mut *conn)
        .await?;
    sqlx::query("DETACH DATABASE src").execute(&mut *conn).await?;
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".mem");
    PathBuf::from(name)
}

fn sql_string_literal(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', "''"))
}
