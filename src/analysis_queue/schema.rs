//! Database schema for analysis_queue.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Analysis Queue Table - Version 0
// =============================================================================

const ANALYSIS_QUEUE_TABLE_V0: Table = Table {
    name: "analysis_queue",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("report_id", &SqlType::Text, non_null = true),
        sqlite_column!("visit_id", &SqlType::Text, non_null = true),
        sqlite_column!("patient_id", &SqlType::Text, non_null = true),
        sqlite_column!("doctor_id", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("priority", &SqlType::Integer, non_null = true),
        sqlite_column!("queued_at", &SqlType::Integer, non_null = true),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("completed_at", &SqlType::Integer),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!(
            "attempt_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[
        ("idx_analysis_queue_dispatch", "status, priority, queued_at"),
        ("idx_analysis_queue_report", "report_id, doctor_id"),
    ],
};

// =============================================================================
// Analysis Results Table - Version 0
// =============================================================================

const ANALYSIS_RESULTS_TABLE_V0: Table = Table {
    name: "analysis_results",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("report_id", &SqlType::Text, non_null = true),
        sqlite_column!("visit_id", &SqlType::Text, non_null = true),
        sqlite_column!("patient_id", &SqlType::Text, non_null = true),
        sqlite_column!("doctor_id", &SqlType::Text, non_null = true),
        sqlite_column!("model_used", &SqlType::Text, non_null = true),
        sqlite_column!("confidence_score", &SqlType::Real, non_null = true),
        sqlite_column!("raw_analysis", &SqlType::Text, non_null = true),
        sqlite_column!("structured_analysis", &SqlType::Text),
        sqlite_column!("key_findings", &SqlType::Text),
        sqlite_column!("success", &SqlType::Integer, non_null = true),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("processing_time_ms", &SqlType::Integer, non_null = true),
        sqlite_column!("analyzed_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_analysis_results_report", "report_id, doctor_id, success")],
};

pub const ANALYSIS_QUEUE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[ANALYSIS_QUEUE_TABLE_V0, ANALYSIS_RESULTS_TABLE_V0],
    migration: None,
}];
