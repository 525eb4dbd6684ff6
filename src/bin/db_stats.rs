use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension};

fn main() -> Result<()> {
    let db_path = std::env::var("TRAILWATCH_DB_PATH").unwrap_or_else(|_| "data/trailwatch.db".to_string());
    let conn = Connection::open_with_flags(&db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("open db at {db_path}"))?;

    let tables = [
        "matches",
        "odds_snapshots",
        "notification_records",
        "notification_deliveries",
        "subscriptions",
        "cycle_heartbeat",
    ];

    println!("db_path={db_path}");
    for t in tables {
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(1) FROM {t}"), [], |r| r.get(0))
            .with_context(|| format!("count {t}"))?;
        println!("{t}: {count}");
    }

    let mut stmt = conn.prepare("SELECT status, COUNT(1) FROM matches GROUP BY status ORDER BY status")?;
    let by_status = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("matches by status")?;
    for (status, n) in by_status {
        println!("matches[{status}]: {n}");
    }

    let mut stmt = conn.prepare(
        "SELECT surface, rule, COUNT(1) FROM notification_records GROUP BY surface, rule ORDER BY surface, rule",
    )?;
    let by_surface = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, i64>(2)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("notifications by surface")?;
    for (surface, rule, n) in by_surface {
        println!("notifications[{surface}/{rule}]: {n}");
    }

    let failed: i64 = conn
        .query_row("SELECT COUNT(1) FROM notification_deliveries WHERE ok = 0", [], |r| r.get(0))
        .context("count failed deliveries")?;
    println!("failed_deliveries: {failed}");

    let last_hb: Option<(String, i64, i64, i64, i64, i64)> = conn
        .query_row(
            "SELECT ts, cycle, tracked, live, alerts, duration_ms FROM cycle_heartbeat ORDER BY id DESC LIMIT 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
        )
        .optional()
        .context("read last heartbeat")?;

    if let Some((ts, cycle, tracked, live, alerts, duration_ms)) = last_hb {
        println!("last_heartbeat: ts={ts} cycle={cycle} tracked={tracked} live={live} alerts={alerts} duration_ms={duration_ms}");
    } else {
        println!("last_heartbeat: <none>");
    }

    Ok(())
}
