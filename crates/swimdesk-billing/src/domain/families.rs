use crate::domain::types::{FamilyId, StudentId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Family {
    pub id: FamilyId,
    pub name: String,
}

impl Family {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: FamilyId::new(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    pub family_id: FamilyId,
    pub first_name: String,
    pub last_name: String,
}

impl Student {
    pub fn new(
        family_id: FamilyId,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
    ) -> Self {
        Self {
            id: StudentId::new(),
            family_id,
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}
