use serde::{Deserialize, Serialize};

use crate::firestore::model::DocumentKey;

pub const DEFAULT_DATABASE_ID: &str = "(default)";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn is_default_database(&self) -> bool {
        self.database == DEFAULT_DATABASE_ID
    }

    /// Fully qualified resource name of a document, as used by existence filter
    /// membership tests.
    pub fn document_name(&self, key: &DocumentKey) -> String {
        format!(
            "projects/{}/databases/{}/documents/{}",
            self.project_id,
            self.database,
            key.path().canonical_string()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_document_name() {
        let db = DatabaseId::default("project");
        let key = DocumentKey::from_string("rooms/eros").unwrap();
        assert!(db.is_default_database());
        assert_eq!(
            db.document_name(&key),
            "projects/project/databases/(default)/documents/rooms/eros"
        );
    }
}
