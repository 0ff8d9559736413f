use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "gradebook.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.to_string_lossy()))?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            grade_level TEXT NOT NULL DEFAULT '',
            section TEXT NOT NULL DEFAULT '',
            school_year TEXT,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;
    ensure_classes_columns(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            student_no TEXT,
            birth_date TEXT,
            status TEXT NOT NULL DEFAULT 'enrolled',
            sort_order INTEGER NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_students_status(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS guardians(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            slot INTEGER NOT NULL,
            name TEXT NOT NULL,
            relation TEXT,
            phone TEXT,
            email TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, slot)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_guardians_student ON guardians(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            weekly_hours REAL NOT NULL DEFAULT 0,
            coefficient REAL NOT NULL DEFAULT 1,
            grade_level TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_level ON subjects(grade_level)",
        [],
    )?;

    let legacy_grades = stash_classless_grade_entries(&conn)?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_entries(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            semester INTEGER NOT NULL,
            evaluation_type TEXT NOT NULL,
            score REAL NOT NULL,
            remark TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(student_id, class_id, subject_id, semester, evaluation_type)
        )",
        [],
    )?;
    if legacy_grades {
        restore_classless_grade_entries(&conn)?;
    }
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_entries_student ON grade_entries(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_entries_subject ON grade_entries(subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_entries_class ON grade_entries(class_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_classes_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "classes", "grade_level")? {
        conn.execute(
            "ALTER TABLE classes ADD COLUMN grade_level TEXT NOT NULL DEFAULT ''",
            [],
        )?;
    }
    if !table_has_column(conn, "classes", "section")? {
        conn.execute(
            "ALTER TABLE classes ADD COLUMN section TEXT NOT NULL DEFAULT ''",
            [],
        )?;
    }
    if !table_has_column(conn, "classes", "school_year")? {
        conn.execute("ALTER TABLE classes ADD COLUMN school_year TEXT", [])?;
    }
    if !table_has_column(conn, "classes", "active")? {
        conn.execute(
            "ALTER TABLE classes ADD COLUMN active INTEGER NOT NULL DEFAULT 1",
            [],
        )?;
    }
    Ok(())
}

fn ensure_students_status(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "status")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE students ADD COLUMN status TEXT NOT NULL DEFAULT 'enrolled'",
        [],
    )?;
    Ok(())
}

const LEGACY_GRADES_TABLE: &str = "grade_entries_classless";

/// Renames a grade_entries table that predates `class_id` so it can be
/// rebuilt with the class-scoped unique key.
fn stash_classless_grade_entries(conn: &Connection) -> anyhow::Result<bool> {
    if !table_exists(conn, "grade_entries")?
        || table_has_column(conn, "grade_entries", "class_id")?
    {
        return Ok(false);
    }
    conn.execute_batch(&format!(
        "DROP INDEX IF EXISTS idx_grade_entries_student;
         DROP INDEX IF EXISTS idx_grade_entries_subject;
         ALTER TABLE grade_entries RENAME TO {};",
        LEGACY_GRADES_TABLE
    ))
    .context("failed to set aside grade_entries for migration")?;
    Ok(true)
}

/// Old entries are attributed to the class the student is in now.
fn restore_classless_grade_entries(conn: &Connection) -> anyhow::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        &format!(
            "INSERT INTO grade_entries(
               id, student_id, class_id, subject_id, semester, evaluation_type,
               score, remark, updated_at
             )
             SELECT g.id, g.student_id, s.class_id, g.subject_id, g.semester,
                    g.evaluation_type, g.score, g.remark, g.updated_at
             FROM {} g
             JOIN students s ON s.id = g.student_id
             JOIN subjects sub ON sub.id = g.subject_id",
            LEGACY_GRADES_TABLE
        ),
        [],
    )
    .context("failed to copy grade entries into the class-scoped table")?;
    tx.execute(&format!("DROP TABLE {}", LEGACY_GRADES_TABLE), [])?;
    tx.commit()?;
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> anyhow::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            [table],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
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

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| r.get(0))
        .optional()?;
    match raw {
        Some(text) => {
            let v = serde_json::from_str(&text)
                .with_context(|| format!("setting {} is not valid JSON", key))?;
            Ok(Some(v))
        }
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, text),
    )?;
    Ok(())
}
