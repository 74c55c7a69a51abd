//! Embedded relational store backing the queue.
//!
//! Schema, pragmas and connection handling follow the pattern this
//! codebase's other embedded-store component uses: WAL journaling,
//! `synchronous=NORMAL`, and prepared statements reused across calls. Unlike
//! that component, two independent connections to the same file are kept
//! open at once so a producer's `put_many` never blocks a
//! consumer's selection query, or vice versa, beyond SQLite's own write
//! serialization.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::{params, Connection, OpenFlags, Row};

use crate::config::QueueOpts;
use crate::error::QueueResult;
use crate::job::Job;
use crate::time::now;

const SQL_CREATE: &str = r#"
CREATE TABLE "queue" (
    "index" INTEGER PRIMARY KEY,
    "status" INTEGER NOT NULL DEFAULT 0,
    "id" TEXT NOT NULL,
    "url" TEXT NOT NULL,
    "group" TEXT,
    "depth" INTEGER NOT NULL,
    "spider" TEXT,
    "priority" INTEGER NOT NULL,
    "data" BLOB,
    "parent" TEXT,
    "attempts" INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX "idx_queue_priority_index" ON "queue" ("priority", "index");
CREATE INDEX "idx_queue_status" ON "queue" ("status");

CREATE TABLE "throttle" (
    "group" TEXT PRIMARY KEY,
    "timestamp" REAL NOT NULL
) WITHOUT ROWID;
CREATE INDEX "idx_throttle_timestamp" ON "throttle" ("timestamp");

CREATE TABLE "parallelism" (
    "group" TEXT PRIMARY KEY,
    "count" INTEGER NOT NULL
) WITHOUT ROWID;
"#;

static NEXT_MEMORY_ID: AtomicU64 = AtomicU64::new(0);

/// The two connections and the starting `index` counter a freshly opened or
/// resumed store hands back to the scheduler.
pub(crate) struct Opened {
    pub put_conn: Connection,
    pub task_conn: Connection,
    pub counter: i64,
}

fn apply_pragmas(conn: &Connection, persistent: bool) -> QueueResult<()> {
    conn.pragma_update(None, "foreign_keys", true)?;
    if persistent {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
    }
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(())
}

fn create_tables(conn: &Connection) -> QueueResult<()> {
    conn.execute_batch(SQL_CREATE)?;
    Ok(())
}

fn open_file(path: &Path) -> QueueResult<Connection> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
    apply_pragmas(&conn, true)?;
    Ok(conn)
}

fn create_file(path: &Path) -> QueueResult<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
    )?;
    apply_pragmas(&conn, true)?;
    create_tables(&conn)?;
    Ok(conn)
}

/// Reset bookkeeping that only makes sense for a single process lifetime,
/// for crash recovery on resume: in-flight rows go back to ready, parallelism
/// is cleared, and stale throttles are pruned.
fn resume_and_clean(conn: &Connection) -> QueueResult<i64> {
    let max_index: Option<i64> = conn.query_row(
        r#"SELECT MAX("index") FROM "queue";"#,
        [],
        |row| row.get(0),
    )?;
    let counter = max_index.map(|m| m + 1).unwrap_or(0);

    conn.execute(r#"UPDATE "queue" SET "status" = 0 WHERE "status" <> 0;"#, [])?;
    conn.execute(r#"DELETE FROM "parallelism";"#, [])?;
    conn.execute(
        r#"DELETE FROM "throttle" WHERE "timestamp" < ?1;"#,
        params![now()],
    )?;
    conn.execute("VACUUM;", [])?;

    Ok(counter)
}

fn open_in_memory() -> QueueResult<Opened> {
    let id = NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed);
    let uri = format!("file:crawlqueue-{id}?mode=memory&cache=shared");
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI;

    let put_conn = Connection::open_with_flags(&uri, flags)?;
    apply_pragmas(&put_conn, false)?;
    create_tables(&put_conn)?;

    let task_conn = Connection::open_with_flags(&uri, flags)?;
    apply_pragmas(&task_conn, false)?;

    Ok(Opened {
        put_conn,
        task_conn,
        counter: 0,
    })
}

/// Opens (or creates, or resumes) the store described by `opts`.
pub(crate) fn open(opts: &QueueOpts) -> QueueResult<Opened> {
    let Some(dir) = &opts.path else {
        return open_in_memory();
    };
    let db_path = dir.join(&opts.db_name);

    let mut resuming = false;
    if !opts.resume {
        let _ = fs::remove_dir_all(dir);
    } else if db_path.exists() {
        resuming = true;
    }
    fs::create_dir_all(dir)?;

    if resuming {
        let put_conn = open_file(&db_path)?;
        let task_conn = open_file(&db_path)?;
        let counter = resume_and_clean(&task_conn)?;
        tracing::info!(path = %db_path.display(), counter, "resumed queue store");
        Ok(Opened {
            put_conn,
            task_conn,
            counter,
        })
    } else {
        let put_conn = create_file(&db_path)?;
        let task_conn = open_file(&db_path)?;
        tracing::info!(path = %db_path.display(), "created queue store");
        Ok(Opened {
            put_conn,
            task_conn,
            counter: 0,
        })
    }
}

pub(crate) fn insert_one(conn: &Connection, index: i64, job: &Job) -> QueueResult<()> {
    conn.execute(
        r#"
        INSERT INTO "queue"
            ("index", "id", "url", "group", "depth", "spider", "priority", "data", "parent", "attempts")
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);
        "#,
        params![
            index,
            job.id,
            job.url,
            job.group,
            job.depth,
            job.spider,
            job.priority,
            job.data,
            job.parent,
            job.attempts,
        ],
    )?;
    Ok(())
}

fn row_to_job(row: &Row) -> rusqlite::Result<(i64, Job)> {
    let index: i64 = row.get(0)?;
    let id: String = row.get(1)?;
    let url: String = row.get(2)?;

    let mut job = Job::new(id, url);
    job.group = row.get(3)?;
    job.depth = row.get::<_, i64>(4)? as u32;
    job.spider = row.get(5)?;
    job.priority = row.get(6)?;
    job.data = row.get(7)?;
    job.parent = row.get(8)?;
    job.attempts = row.get::<_, i64>(9)? as u32;

    Ok((index, job))
}

/// The single eligibility statement: joins `queue` against `throttle` and
/// `parallelism` on `group`, keeps only unconstrained-or-eligible rows, and
/// returns the winner by `(priority, index)` in the configured direction.
pub(crate) fn select_eligible(
    conn: &Connection,
    now_ts: f64,
    group_parallelism: usize,
    lifo: bool,
) -> QueueResult<Option<(i64, Job)>> {
    let direction = if lifo { "DESC" } else { "ASC" };
    let sql = format!(
        r#"
        SELECT
            q."index", q."id", q."url", q."group", q."depth",
            q."spider", q."priority", q."data", q."parent", q."attempts"
        FROM "queue" q
        LEFT JOIN "throttle" t ON q."group" = t."group"
        LEFT JOIN "parallelism" p ON q."group" = p."group"
        WHERE
            q."status" = 0
            AND (t."timestamp" IS NULL OR t."timestamp" <= ?1)
            AND (p."count" IS NULL OR p."count" < ?2)
        ORDER BY q."priority" ASC, q."index" {direction}
        LIMIT 1;
        "#
    );

    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt.query(params![now_ts, group_parallelism as i64])?;

    match rows.next()? {
        Some(row) => Ok(Some(row_to_job(row)?)),
        None => Ok(None),
    }
}

pub(crate) fn mark_in_flight(conn: &Connection, index: i64) -> QueueResult<()> {
    conn.execute(
        r#"UPDATE "queue" SET "status" = 1 WHERE "index" = ?1;"#,
        params![index],
    )?;
    Ok(())
}

pub(crate) fn increment_parallelism(conn: &Connection, group: &str) -> QueueResult<()> {
    conn.execute(
        r#"
        INSERT OR REPLACE INTO "parallelism" ("group", "count") VALUES (
            ?1,
            COALESCE((SELECT ("count" + 1) FROM "parallelism" WHERE "group" = ?1 LIMIT 1), 1)
        );
        "#,
        params![group],
    )?;
    Ok(())
}

pub(crate) fn decrement_parallelism(conn: &Connection, group: &str) -> QueueResult<()> {
    conn.execute(
        r#"UPDATE "parallelism" SET "count" = "count" - 1 WHERE "group" = ?1;"#,
        params![group],
    )?;
    Ok(())
}

pub(crate) fn upsert_throttle(conn: &Connection, group: &str, timestamp: f64) -> QueueResult<()> {
    conn.execute(
        r#"INSERT OR REPLACE INTO "throttle" ("group", "timestamp") VALUES (?1, ?2);"#,
        params![group, timestamp],
    )?;
    Ok(())
}

pub(crate) fn delete_row(conn: &Connection, index: i64) -> QueueResult<()> {
    conn.execute(r#"DELETE FROM "queue" WHERE "index" = ?1;"#, params![index])?;
    Ok(())
}

pub(crate) fn count_ready(conn: &Connection) -> QueueResult<i64> {
    Ok(conn.query_row(
        r#"SELECT COUNT(*) FROM "queue" WHERE "status" = 0;"#,
        [],
        |row| row.get(0),
    )?)
}

pub(crate) fn min_throttle_timestamp(conn: &Connection) -> QueueResult<Option<f64>> {
    Ok(conn.query_row(r#"SELECT MIN("timestamp") FROM "throttle";"#, [], |row| {
        row.get(0)
    })?)
}

pub(crate) fn worked_groups(conn: &Connection) -> QueueResult<Vec<(String, i64)>> {
    let mut stmt =
        conn.prepare_cached(r#"SELECT "group", "count" FROM "parallelism" WHERE "count" > 0;"#)?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub(crate) fn cleanup(conn: &Connection) -> QueueResult<()> {
    conn.execute(r#"DELETE FROM "parallelism" WHERE "count" < 1;"#, [])?;
    conn.execute(
        r#"DELETE FROM "throttle" WHERE "timestamp" < ?1;"#,
        params![now()],
    )?;
    conn.execute("VACUUM;", [])?;
    Ok(())
}

pub(crate) fn clear(conn: &Connection) -> QueueResult<()> {
    conn.execute(r#"DELETE FROM "parallelism";"#, [])?;
    conn.execute(r#"DELETE FROM "throttle";"#, [])?;
    conn.execute("VACUUM;", [])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueOpts;
    use tempfile::tempdir;

    #[test]
    fn create_then_reopen_without_resume_wipes_directory() {
        let dir = tempdir().unwrap();
        let opts = QueueOpts::default().with_path(dir.path());

        let opened = open(&opts).unwrap();
        insert_one(&opened.put_conn, 0, &Job::new("1", "https://example.com")).unwrap();
        drop(opened);

        let opened = open(&opts).unwrap();
        assert_eq!(count_ready(&opened.task_conn).unwrap(), 0);
    }

    #[test]
    fn resume_restores_counter_and_resets_in_flight() {
        let dir = tempdir().unwrap();
        let opts = QueueOpts::default().with_path(dir.path());

        {
            let opened = open(&opts).unwrap();
            insert_one(&opened.put_conn, 0, &Job::new("a", "https://example.com")).unwrap();
            insert_one(&opened.put_conn, 1, &Job::new("b", "https://example.com")).unwrap();
            mark_in_flight(&opened.task_conn, 0).unwrap();
        }

        let resumed = open(&opts.clone().resuming()).unwrap();
        assert_eq!(resumed.counter, 2);
        assert_eq!(count_ready(&resumed.task_conn).unwrap(), 2);
    }
}
