use crate::calc::{
    self, CalcError, EvaluationType, EvaluationWeights, GradeScore, SubjectAverage,
};
use crate::query::StudentRow;
use crate::transfer::{self, StudentStatus, TransferRules};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

pub const SEMESTERS: [i64; 2] = [1, 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Semester(i64),
    Annual,
}

impl Period {
    pub fn parse(v: Option<&serde_json::Value>) -> Result<Self, CalcError> {
        match v {
            None => Ok(Self::Annual),
            Some(v) if v.is_null() => Ok(Self::Annual),
            Some(v) if v.as_str() == Some("annual") => Ok(Self::Annual),
            Some(v) => match v.as_i64() {
                Some(n @ (1 | 2)) => Ok(Self::Semester(n)),
                _ => Err(CalcError::new(
                    "bad_params",
                    "period must be 1, 2 or 'annual'",
                )),
            },
        }
    }

    fn label(self) -> String {
        match self {
            Self::Semester(n) => n.to_string(),
            Self::Annual => "annual".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub id: String,
    pub name: String,
    pub grade_level: String,
    pub section: String,
    pub school_year: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone)]
struct SubjectInfo {
    id: String,
    name: String,
    coefficient: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryView {
    pub id: String,
    pub evaluation_type: EvaluationType,
    pub score: f64,
    pub remark: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectLine {
    pub subject_id: String,
    pub name: String,
    pub coefficient: f64,
    pub entries: Vec<EntryView>,
    pub average: Option<f64>,
    pub average_display: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SemesterReport {
    pub semester: i64,
    pub subjects: Vec<SubjectLine>,
    pub average: Option<f64>,
    pub average_display: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentBulletin {
    pub student_id: String,
    pub display_name: String,
    pub class_id: String,
    pub class_name: String,
    pub status: StudentStatus,
    pub semesters: Vec<SemesterReport>,
    pub annual_average: Option<f64>,
    pub annual_average_display: Option<f64>,
    pub transfer: transfer::Evaluation,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassBulletinRow {
    pub student_id: String,
    pub display_name: String,
    pub status: StudentStatus,
    pub average: Option<f64>,
    pub average_display: Option<f64>,
    pub rank: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassBulletin {
    pub class_id: String,
    pub class_name: String,
    pub school_year: Option<String>,
    pub period: String,
    pub rows: Vec<ClassBulletinRow>,
    pub class_average: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub graded_count: usize,
}

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

pub fn load_class(conn: &Connection, class_id: &str) -> Result<ClassInfo, CalcError> {
    let row = conn
        .query_row(
            "SELECT id, name, grade_level, section, school_year, active FROM classes WHERE id = ?",
            [class_id],
            |r| {
                Ok(ClassInfo {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    grade_level: r.get(2)?,
                    section: r.get(3)?,
                    school_year: r.get(4)?,
                    active: r.get::<_, i64>(5)? != 0,
                })
            },
        )
        .optional()
        .map_err(db_err)?;
    row.ok_or_else(|| CalcError::new("not_found", "class not found"))
}

pub fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRow> {
    let status_raw: String = r.get(6)?;
    let status = StudentStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown student status: {}", status_raw).into(),
        )
    })?;
    Ok(StudentRow {
        id: r.get(0)?,
        class_id: r.get(1)?,
        last_name: r.get(2)?,
        first_name: r.get(3)?,
        student_no: r.get(4)?,
        birth_date: r.get(5)?,
        status,
        sort_order: r.get(7)?,
    })
}

pub const STUDENT_COLUMNS: &str =
    "id, class_id, last_name, first_name, student_no, birth_date, status, sort_order";

pub fn load_student(conn: &Connection, student_id: &str) -> Result<StudentRow, CalcError> {
    let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS);
    conn.query_row(&sql, [student_id], student_from_row)
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| CalcError::new("not_found", "student not found"))
}

pub fn load_class_students(
    conn: &Connection,
    class_id: &str,
) -> Result<Vec<StudentRow>, CalcError> {
    let sql = format!(
        "SELECT {} FROM students WHERE class_id = ? ORDER BY sort_order",
        STUDENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map([class_id], student_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(rows)
}

/// Subjects applicable to a grade level, in name order. Level-less subjects
/// apply everywhere.
fn load_level_subjects(conn: &Connection, grade_level: &str) -> Result<Vec<SubjectInfo>, CalcError> {
    let mut stmt = conn
        .prepare("SELECT id, name, coefficient, grade_level FROM subjects ORDER BY name, id")
        .map_err(db_err)?;
    let all = stmt
        .query_map([], |r| {
            Ok((
                SubjectInfo {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    coefficient: r.get(2)?,
                },
                r.get::<_, Option<String>>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(all
        .into_iter()
        .filter(|(_, level)| match level.as_deref() {
            None => true,
            Some(l) if l.trim().is_empty() => true,
            Some(l) => transfer::same_label(l, grade_level),
        })
        .map(|(s, _)| s)
        .collect())
}

/// (subject_id, semester) -> entries
type EntryMap = HashMap<(String, i64), Vec<EntryView>>;

/// Entries recorded while the student belonged to `class_id`.
fn load_student_entries(
    conn: &Connection,
    student_id: &str,
    class_id: &str,
) -> Result<(EntryMap, Vec<SubjectInfo>), CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT g.id, g.subject_id, g.semester, g.evaluation_type, g.score, g.remark,
                    s.name, s.coefficient
             FROM grade_entries g
             JOIN subjects s ON s.id = g.subject_id
             WHERE g.student_id = ? AND g.class_id = ?
             ORDER BY g.semester, g.subject_id, g.evaluation_type",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([student_id, class_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, f64>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, f64>(7)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut map: EntryMap = HashMap::new();
    let mut graded_subjects: Vec<SubjectInfo> = Vec::new();
    for (id, subject_id, semester, eval_raw, score, remark, name, coefficient) in rows {
        let Some(evaluation_type) = EvaluationType::parse(&eval_raw) else {
            continue;
        };
        if !graded_subjects.iter().any(|s| s.id == subject_id) {
            graded_subjects.push(SubjectInfo {
                id: subject_id.clone(),
                name,
                coefficient,
            });
        }
        map.entry((subject_id, semester)).or_default().push(EntryView {
            id,
            evaluation_type,
            score,
            remark,
        });
    }
    Ok((map, graded_subjects))
}

fn semester_report(
    semester: i64,
    subjects: &[SubjectInfo],
    entries: &EntryMap,
    weights: Option<&EvaluationWeights>,
) -> SemesterReport {
    let mut lines = Vec::with_capacity(subjects.len());
    let mut averages = Vec::with_capacity(subjects.len());
    for subject in subjects {
        let list = entries
            .get(&(subject.id.clone(), semester))
            .cloned()
            .unwrap_or_default();
        let scores: Vec<GradeScore> = list
            .iter()
            .map(|e| GradeScore {
                evaluation_type: e.evaluation_type,
                score: e.score,
            })
            .collect();
        let average = calc::subject_average_with(&scores, weights);
        averages.push(SubjectAverage {
            average,
            coefficient: subject.coefficient,
        });
        lines.push(SubjectLine {
            subject_id: subject.id.clone(),
            name: subject.name.clone(),
            coefficient: subject.coefficient,
            entries: list,
            average,
            average_display: average.map(calc::round_2),
        });
    }
    let average = calc::compute_semester_average(&averages);
    SemesterReport {
        semester,
        subjects: lines,
        average,
        average_display: average.map(calc::round_2),
    }
}

/// Semester reports plus the annual average for one student.
fn compute_student_semesters(
    conn: &Connection,
    student: &StudentRow,
    grade_level: &str,
    weights: Option<&EvaluationWeights>,
) -> Result<(Vec<SemesterReport>, Option<f64>), CalcError> {
    let mut subjects = load_level_subjects(conn, grade_level)?;
    let (entries, graded) = load_student_entries(conn, &student.id, &student.class_id)?;
    for g in graded {
        if !subjects.iter().any(|s| s.id == g.id) {
            subjects.push(g);
        }
    }
    let semesters: Vec<SemesterReport> = SEMESTERS
        .iter()
        .map(|&n| semester_report(n, &subjects, &entries, weights))
        .collect();
    let annual = calc::compute_annual_average(semesters[0].average, semesters[1].average);
    Ok((semesters, annual))
}

pub fn annual_average_for(
    conn: &Connection,
    student: &StudentRow,
    grade_level: &str,
    weights: Option<&EvaluationWeights>,
) -> Result<Option<f64>, CalcError> {
    Ok(compute_student_semesters(conn, student, grade_level, weights)?.1)
}

pub fn student_bulletin(
    conn: &Connection,
    student_id: &str,
    weights: Option<&EvaluationWeights>,
    rules: &TransferRules,
) -> Result<StudentBulletin, CalcError> {
    let student = load_student(conn, student_id)?;
    let class = load_class(conn, &student.class_id)?;
    let (semesters, annual) = compute_student_semesters(conn, &student, &class.grade_level, weights)?;
    Ok(StudentBulletin {
        student_id: student.id.clone(),
        display_name: student.display_name(),
        class_id: class.id,
        class_name: class.name,
        status: student.status,
        semesters,
        annual_average: annual,
        annual_average_display: annual.map(calc::round_2),
        transfer: transfer::evaluate_annual(student.status, annual, rules),
    })
}

pub fn class_bulletin(
    conn: &Connection,
    class_id: &str,
    period: Period,
    weights: Option<&EvaluationWeights>,
) -> Result<ClassBulletin, CalcError> {
    let class = load_class(conn, class_id)?;
    let students = load_class_students(conn, class_id)?;

    let mut averages: Vec<Option<f64>> = Vec::with_capacity(students.len());
    for s in &students {
        let (semesters, annual) =
            compute_student_semesters(conn, s, &class.grade_level, weights)?;
        let avg = match period {
            Period::Annual => annual,
            Period::Semester(n) => semesters
                .iter()
                .find(|r| r.semester == n)
                .and_then(|r| r.average),
        };
        averages.push(avg);
    }

    let ranks = calc::rank_descending(&averages);
    let graded: Vec<f64> = averages.iter().flatten().copied().collect();
    let class_average = if graded.is_empty() {
        None
    } else {
        Some(graded.iter().sum::<f64>() / (graded.len() as f64))
    };
    let min = graded.iter().copied().reduce(f64::min);
    let max = graded.iter().copied().reduce(f64::max);

    let rows = students
        .iter()
        .zip(averages.iter().zip(ranks))
        .map(|(s, (avg, rank))| ClassBulletinRow {
            student_id: s.id.clone(),
            display_name: s.display_name(),
            status: s.status,
            average: *avg,
            average_display: avg.map(calc::round_2),
            rank,
        })
        .collect();

    Ok(ClassBulletin {
        class_id: class.id,
        class_name: class.name,
        school_year: class.school_year,
        period: period.label(),
        rows,
        class_average: class_average.map(calc::round_2),
        min: min.map(calc::round_2),
        max: max.map(calc::round_2),
        graded_count: graded.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn open(prefix: &str) -> (std::path::PathBuf, Connection) {
        let dir = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
        let conn = db::open_db(&dir).expect("open db");
        conn.execute_batch(
            "INSERT INTO classes(id, name, grade_level, section) VALUES
               ('c6a', '6ème A', '6ème', 'A'),
               ('c5a', '5ème A', '5ème', 'A');
             INSERT INTO subjects(id, name, coefficient) VALUES('maths', 'Maths', 2);",
        )
        .expect("seed");
        (dir, conn)
    }

    #[test]
    fn unknown_status_surfaces_as_query_failure() {
        let (dir, conn) = open("gradebook-bulletin-status");
        conn.execute(
            "INSERT INTO students(id, class_id, last_name, first_name, status, sort_order)
             VALUES('s1', 'c6a', 'Martin', 'Léa', 'graduated', 0)",
            [],
        )
        .expect("student");

        let err = load_student(&conn, "s1").expect_err("unknown status");
        assert_eq!(err.code, "db_query_failed");
        assert!(err.message.contains("graduated"));
        let err = class_bulletin(&conn, "c6a", Period::Annual, None).expect_err("class listing fails too");
        assert_eq!(err.code, "db_query_failed");

        drop(conn);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn only_entries_from_the_current_class_count() {
        let (dir, conn) = open("gradebook-bulletin-scope");
        conn.execute_batch(
            "INSERT INTO students(id, class_id, last_name, first_name, sort_order)
               VALUES('s1', 'c5a', 'Martin', 'Léa', 0);
             INSERT INTO grade_entries(id, student_id, class_id, subject_id, semester, evaluation_type, score)
             VALUES
               ('old', 's1', 'c6a', 'maths', 1, 'exam', 18),
               ('new', 's1', 'c5a', 'maths', 1, 'exam', 8);",
        )
        .expect("grades");

        let student = load_student(&conn, "s1").expect("student");
        let annual = annual_average_for(&conn, &student, "5ème", None).expect("annual");
        assert_eq!(annual, Some(8.0));

        conn.execute("DELETE FROM grade_entries WHERE id = 'new'", [])
            .expect("delete");
        let annual = annual_average_for(&conn, &student, "5ème", None).expect("annual");
        assert_eq!(annual, None);

        drop(conn);
        let _ = std::fs::remove_dir_all(dir);
    }
}
