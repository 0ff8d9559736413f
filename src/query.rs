use crate::transfer::StudentStatus;
use std::cmp::Ordering;

#[derive(Debug, Clone)]
pub struct StudentRow {
    pub id: String,
    pub class_id: String,
    pub last_name: String,
    pub first_name: String,
    pub student_no: Option<String>,
    pub birth_date: Option<String>,
    pub status: StudentStatus,
    pub sort_order: i64,
}

impl StudentRow {
    pub fn display_name(&self) -> String {
        format!("{}, {}", self.last_name, self.first_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StudentSort {
    #[default]
    SortOrder,
    LastName,
    FirstName,
}

#[derive(Debug, Clone, Default)]
pub struct StudentQuery {
    pub search: Option<String>,
    pub status: Option<StudentStatus>,
    pub sort_by: StudentSort,
}

pub fn parse_student_query(raw: Option<&serde_json::Value>) -> Result<StudentQuery, String> {
    let Some(raw) = raw else {
        return Ok(StudentQuery::default());
    };
    if raw.is_null() {
        return Ok(StudentQuery::default());
    }
    let Some(obj) = raw.as_object() else {
        return Err("query must be an object".into());
    };

    let search = match obj.get("search") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err("query.search must be string or null".into());
            };
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_lowercase())
            }
        }
    };

    let status = match obj.get("status") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) if v.as_str().map(|s| s.eq_ignore_ascii_case("ALL")).unwrap_or(false) => None,
        Some(v) => {
            let parsed = v.as_str().and_then(StudentStatus::parse);
            let Some(st) = parsed else {
                return Err(
                    "query.status must be one of: enrolled, transferred, withdrawn, completed"
                        .into(),
                );
            };
            Some(st)
        }
    };

    let sort_by = match obj.get("sortBy").and_then(|v| v.as_str()) {
        None => StudentSort::SortOrder,
        Some("sortOrder") => StudentSort::SortOrder,
        Some("lastName") => StudentSort::LastName,
        Some("firstName") => StudentSort::FirstName,
        Some(_) => return Err("query.sortBy must be one of: sortOrder, lastName, firstName".into()),
    };

    Ok(StudentQuery {
        search,
        status,
        sort_by,
    })
}

fn matches_search(row: &StudentRow, needle: &str) -> bool {
    row.last_name.to_lowercase().contains(needle)
        || row.first_name.to_lowercase().contains(needle)
        || row
            .student_no
            .as_deref()
            .map(|n| n.to_lowercase().contains(needle))
            .unwrap_or(false)
}

pub fn select_students<'a>(rows: &'a [StudentRow], query: &StudentQuery) -> Vec<&'a StudentRow> {
    let mut out: Vec<&StudentRow> = rows
        .iter()
        .filter(|r| query.status.map(|s| r.status == s).unwrap_or(true))
        .filter(|r| {
            query
                .search
                .as_deref()
                .map(|n| matches_search(r, n))
                .unwrap_or(true)
        })
        .collect();

    let by_name = |a: &str, b: &str| a.to_lowercase().cmp(&b.to_lowercase());
    out.sort_by(|a, b| match query.sort_by {
        StudentSort::SortOrder => a.sort_order.cmp(&b.sort_order),
        StudentSort::LastName => by_name(&a.last_name, &b.last_name)
            .then_with(|| by_name(&a.first_name, &b.first_name))
            .then(a.sort_order.cmp(&b.sort_order)),
        StudentSort::FirstName => match by_name(&a.first_name, &b.first_name) {
            Ordering::Equal => by_name(&a.last_name, &b.last_name),
            o => o,
        },
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str, last: &str, first: &str, status: StudentStatus, order: i64) -> StudentRow {
        StudentRow {
            id: id.to_string(),
            class_id: "c1".to_string(),
            last_name: last.to_string(),
            first_name: first.to_string(),
            student_no: Some(format!("N-{}", id)),
            birth_date: None,
            status,
            sort_order: order,
        }
    }

    fn rows() -> Vec<StudentRow> {
        vec![
            row("1", "Martin", "Léa", StudentStatus::Enrolled, 2),
            row("2", "Bernard", "Hugo", StudentStatus::Withdrawn, 0),
            row("3", "Durand", "Inès", StudentStatus::Enrolled, 1),
        ]
    }

    #[test]
    fn default_query_keeps_sort_order() {
        let rows = rows();
        let q = parse_student_query(None).expect("query");
        let ids: Vec<&str> = select_students(&rows, &q).iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3", "1"]);
    }

    #[test]
    fn filters_by_status_and_search() {
        let rows = rows();
        let q = parse_student_query(Some(&json!({ "status": "enrolled", "search": "MART" })))
            .expect("query");
        let ids: Vec<&str> = select_students(&rows, &q).iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1"]);

        let q = parse_student_query(Some(&json!({ "search": "n-3" }))).expect("query");
        assert_eq!(select_students(&rows, &q).len(), 1);
    }

    #[test]
    fn sorts_by_last_name() {
        let rows = rows();
        let q = parse_student_query(Some(&json!({ "sortBy": "lastName", "status": "ALL" })))
            .expect("query");
        let ids: Vec<&str> = select_students(&rows, &q).iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3", "1"]);
    }

    #[test]
    fn rejects_unknown_status() {
        assert!(parse_student_query(Some(&json!({ "status": "graduated" }))).is_err());
        assert!(parse_student_query(Some(&json!("x"))).is_err());
    }
}
