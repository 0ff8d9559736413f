use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Teacher,
    Eleve,
    Parent,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Self::Admin),
            "teacher" => Some(Self::Teacher),
            "eleve" => Some(Self::Eleve),
            "parent" => Some(Self::Parent),
            _ => None,
        }
    }

    pub fn capabilities(self) -> &'static [Capability] {
        match self {
            Self::Admin => &[
                Capability::ManageSchool,
                Capability::RecordGrades,
                Capability::ViewCourses,
                Capability::ViewGuardians,
            ],
            Self::Teacher => &[Capability::RecordGrades, Capability::ViewCourses],
            Self::Eleve => &[Capability::ViewCourses],
            Self::Parent => &[Capability::ViewCourses, Capability::ViewGuardians],
        }
    }

    pub fn has(self, cap: Capability) -> bool {
        self.capabilities().contains(&cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ManageSchool,
    RecordGrades,
    ViewCourses,
    ViewGuardians,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Carries no reason. A missing session and a wrong role look the same to
/// the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessDenied;

pub const DENIED_MESSAGE: &str = "access denied";
pub const DENIED_HTTP_STATUS: u16 = 403;

pub fn required_capability(method: &str) -> Option<Capability> {
    match method {
        "health" | "workspace.select" => None,
        "classes.list" | "students.list" | "subjects.list" | "grades.list"
        | "bulletin.student" | "bulletin.class" => Some(Capability::ViewCourses),
        "students.guardians.list" => Some(Capability::ViewGuardians),
        "grades.upsert" | "grades.delete" => Some(Capability::RecordGrades),
        _ => Some(Capability::ManageSchool),
    }
}

pub fn authorize(auth: Option<&AuthContext>, method: &str) -> Result<(), AccessDenied> {
    let Some(cap) = required_capability(method) else {
        return Ok(());
    };
    let role = auth
        .and_then(|a| a.role.as_deref())
        .and_then(Role::parse)
        .ok_or(AccessDenied)?;
    if role.has(cap) {
        Ok(())
    } else {
        Err(AccessDenied)
    }
}
