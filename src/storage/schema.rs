//! Database schema constants.
//!
//! This module contains all SQL schema definitions for the PostgreSQL
//! storage backend.

/// SQL schema for the llm_requests table.
///
/// A request is routed to at most one of a job or a batch.
pub const CREATE_LLM_REQUESTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS llm_requests (
    id UUID PRIMARY KEY,
    model VARCHAR(255) NOT NULL,
    provider VARCHAR(50) NOT NULL,
    system_prompt TEXT,
    user_prompt TEXT NOT NULL,
    request_key VARCHAR(255) NOT NULL,
    process_kind VARCHAR(50) NOT NULL,
    process_id UUID NOT NULL,
    target_id UUID NOT NULL,
    stage VARCHAR(50) NOT NULL,
    status VARCHAR(50) NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_attempt_at TIMESTAMPTZ,
    job_id UUID,
    batch_id UUID,
    input_tokens BIGINT,
    output_tokens BIGINT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CHECK (job_id IS NULL OR batch_id IS NULL)
)
"#;

/// SQL schema for the llm_jobs table.
pub const CREATE_LLM_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS llm_jobs (
    id UUID PRIMARY KEY,
    provider VARCHAR(50) NOT NULL,
    model VARCHAR(255) NOT NULL,
    process_key VARCHAR(255) NOT NULL,
    status VARCHAR(50) NOT NULL,
    next_run_at TIMESTAMPTZ,
    last_error TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for the llm_batches table.
pub const CREATE_LLM_BATCHES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS llm_batches (
    id UUID PRIMARY KEY,
    provider VARCHAR(50) NOT NULL,
    model VARCHAR(255) NOT NULL,
    process_key VARCHAR(255) NOT NULL,
    process_kind VARCHAR(50) NOT NULL,
    process_id UUID NOT NULL,
    status VARCHAR(50) NOT NULL,
    provider_batch_ref VARCHAR(255),
    locked_until TIMESTAMPTZ,
    next_poll_at TIMESTAMPTZ,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for the processes table.
pub const CREATE_PROCESSES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS processes (
    id UUID PRIMARY KEY,
    kind VARCHAR(50) NOT NULL,
    status VARCHAR(50) NOT NULL,
    desired_state VARCHAR(50) NOT NULL,
    current_stage VARCHAR(50) NOT NULL,
    stop_at_stage VARCHAR(50),
    policy JSONB NOT NULL,
    last_error TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for the single-row scheduler_state table.
pub const CREATE_SCHEDULER_STATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS scheduler_state (
    key VARCHAR(50) PRIMARY KEY,
    locked_until TIMESTAMPTZ,
    next_tick_at TIMESTAMPTZ,
    updated_at TIMESTAMPTZ
)
"#;

/// SQL schema for the windows table.
pub const CREATE_WINDOWS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS windows (
    id UUID PRIMARY KEY,
    model VARCHAR(255) NOT NULL
)
"#;

/// SQL schema for the evidences table.
pub const CREATE_EVIDENCES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS evidences (
    id UUID PRIMARY KEY,
    window_id UUID NOT NULL REFERENCES windows(id) ON DELETE CASCADE,
    raw_content TEXT NOT NULL,
    cleaned_content TEXT,
    neutralized_content TEXT,
    abstracted_content TEXT,
    last_error TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for the experiments table.
pub const CREATE_EXPERIMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS experiments (
    id UUID PRIMARY KEY,
    concept TEXT NOT NULL,
    scale_size INTEGER NOT NULL,
    rubric_model VARCHAR(255) NOT NULL,
    scoring_model VARCHAR(255) NOT NULL,
    evidence_view VARCHAR(50) NOT NULL,
    evidence_window_id UUID NOT NULL
)
"#;

/// SQL schema for the runs table.
pub const CREATE_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id UUID PRIMARY KEY,
    experiment_id UUID NOT NULL REFERENCES experiments(id) ON DELETE CASCADE
)
"#;

/// SQL schema for the samples table.
pub const CREATE_SAMPLES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS samples (
    id UUID PRIMARY KEY,
    run_id UUID NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    seed INTEGER NOT NULL,
    rubric TEXT,
    rubric_critique TEXT,
    score TEXT,
    score_critique TEXT,
    last_error TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL for creating indexes on frequently queried columns.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_llm_requests_key ON llm_requests(request_key);
CREATE INDEX IF NOT EXISTS idx_llm_requests_job ON llm_requests(job_id);
CREATE INDEX IF NOT EXISTS idx_llm_requests_batch ON llm_requests(batch_id);
CREATE INDEX IF NOT EXISTS idx_llm_requests_process ON llm_requests(process_kind, process_id);
CREATE INDEX IF NOT EXISTS idx_llm_jobs_status ON llm_jobs(status);
CREATE INDEX IF NOT EXISTS idx_llm_batches_status ON llm_batches(status);
CREATE INDEX IF NOT EXISTS idx_llm_batches_process ON llm_batches(process_kind, process_id);
CREATE INDEX IF NOT EXISTS idx_processes_status ON processes(status);
CREATE INDEX IF NOT EXISTS idx_evidences_window ON evidences(window_id);
CREATE INDEX IF NOT EXISTS idx_samples_run ON samples(run_id);
"#;

/// Returns all schema creation statements in order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_LLM_REQUESTS_TABLE,
        CREATE_LLM_JOBS_TABLE,
        CREATE_LLM_BATCHES_TABLE,
        CREATE_PROCESSES_TABLE,
        CREATE_SCHEDULER_STATE_TABLE,
        CREATE_WINDOWS_TABLE,
        CREATE_EVIDENCES_TABLE,
        CREATE_EXPERIMENTS_TABLE,
        CREATE_RUNS_TABLE,
        CREATE_SAMPLES_TABLE,
        CREATE_INDEXES,
    ]
}

/// Table names, in creation order.
pub mod tables {
    pub const LLM_REQUESTS: &str = "llm_requests";
    pub const LLM_JOBS: &str = "llm_jobs";
    pub const LLM_BATCHES: &str = "llm_batches";
    pub const PROCESSES: &str = "processes";
    pub const SCHEDULER_STATE: &str = "scheduler_state";
    pub const WINDOWS: &str = "windows";
    pub const EVIDENCES: &str = "evidences";
    pub const EXPERIMENTS: &str = "experiments";
    pub const RUNS: &str = "runs";
    pub const SAMPLES: &str = "samples";

    /// All tables, in creation order.
    pub const ALL: [&str; 10] = [
        LLM_REQUESTS,
        LLM_JOBS,
        LLM_BATCHES,
        PROCESSES,
        SCHEDULER_STATE,
        WINDOWS,
        EVIDENCES,
        EXPERIMENTS,
        RUNS,
        SAMPLES,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_table_has_a_statement() {
        let statements = all_schema_statements();
        for table in tables::ALL {
            let needle = format!("CREATE TABLE IF NOT EXISTS {} ", table);
            assert!(
                statements.iter().any(|s| s.contains(&needle)),
                "missing schema for {}",
                table
            );
        }
    }

    #[test]
    fn test_route_exclusivity_constraint() {
        assert!(CREATE_LLM_REQUESTS_TABLE.contains("CHECK (job_id IS NULL OR batch_id IS NULL)"));
    }
}
