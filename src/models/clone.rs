use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClonePhase {
    Starting,
    Introspecting,
    CreatingSchema,
    CreatingTables,
    CreatingConstraints,
    CreatingIndexes,
    CopyingData,
    CreatingForeignKeys,
    Completed,
    Failed,
}

impl fmt::Display for ClonePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClonePhase::Starting => "starting",
            ClonePhase::Introspecting => "introspecting",
            ClonePhase::CreatingSchema => "creating_schema",
            ClonePhase::CreatingTables => "creating_tables",
            ClonePhase::CreatingConstraints => "creating_constraints",
            ClonePhase::CreatingIndexes => "creating_indexes",
            ClonePhase::CopyingData => "copying_data",
            ClonePhase::CreatingForeignKeys => "creating_foreign_keys",
            ClonePhase::Completed => "completed",
            ClonePhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloneProgress {
    pub table: String,
    /// 1-based position within the phase.
    pub progress: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableCopyResult {
    pub table: String,
    pub rows: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloneResult {
    pub source_schema: String,
    pub target_schema: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last phase reached.
    pub phase: ClonePhase,
    /// Tables created in the target, in creation order.
    pub tables: Vec<String>,
    /// Copy results in copy order. Empty without `include_data`.
    pub copied: Vec<TableCopyResult>,
    pub rows_copied: u64,
    /// Non-fatal problems, e.g. foreign keys that could not be added.
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}
