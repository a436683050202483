use sqlx::Type;

/// Database enum mirroring the pipeline status machine.
///
/// Maps to the `sqp.pipeline_status` Postgres enum type.
#[derive(Debug, Clone, Copy, Type, PartialEq, Eq)]
#[sqlx(type_name = "sqp.pipeline_status", rename_all = "snake_case")]
pub enum PipelineStatusType {
    Idle,
    Locked,
    Running,
    Completed,
    Failed,
    Cancelled,
}
