use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("casework.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS divisions(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            is_default INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teams(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            division_id TEXT,
            FOREIGN KEY(division_id) REFERENCES divisions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teams_division ON teams(division_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            team_id TEXT,
            FOREIGN KEY(team_id) REFERENCES teams(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_team ON users(team_id)",
        [],
    )?;

    // Early workspaces created users without a contact column. Add if needed.
    ensure_users_email(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS case_statuses(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS case_priorities(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            student_no TEXT,
            email TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS prospects(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            email TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cases(
            id TEXT PRIMARY KEY,
            respondent_type TEXT NOT NULL,
            respondent_id TEXT NOT NULL,
            division_id TEXT NOT NULL,
            status_id TEXT NOT NULL,
            priority_id TEXT NOT NULL,
            close_details TEXT,
            res_details TEXT,
            created_by_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(division_id) REFERENCES divisions(id),
            FOREIGN KEY(status_id) REFERENCES case_statuses(id),
            FOREIGN KEY(priority_id) REFERENCES case_priorities(id),
            FOREIGN KEY(created_by_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cases_respondent ON cases(respondent_type, respondent_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cases_division ON cases(division_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cases_status ON cases(status_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS case_assignments(
            id TEXT PRIMARY KEY,
            case_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            assigned_by_id TEXT NOT NULL,
            assigned_at TEXT NOT NULL,
            status TEXT NOT NULL,
            FOREIGN KEY(case_id) REFERENCES cases(id),
            FOREIGN KEY(user_id) REFERENCES users(id),
            FOREIGN KEY(assigned_by_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_case_assignments_case ON case_assignments(case_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_case_assignments_user ON case_assignments(user_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_users_email(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "users", "email")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE users ADD COLUMN email TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
