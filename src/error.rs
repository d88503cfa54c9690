//! Structured error types for scanning, scheduler start-up and CLI output.
//!
//! Transport errors live in [`crate::transport::DispatchError`]; store
//! errors travel as `anyhow::Error`.

use crate::transport::DispatchError;
use serde::Serialize;
use thiserror::Error;

/// Error codes for machine-readable CLI output.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidSpec,
    DependencyCycle,
    UnknownDependency,
    AlreadyRunning,
    EmptyProject,
    TransportError,
    InternalError,
}

/// Error as printed by `--format json`.
#[derive(Debug, Serialize)]
pub struct CliError {
    pub code: ErrorCode,
    pub message: String,
}

impl CliError {
    /// Classify an error chain by the first typed error found in it.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let code = if let Some(e) = err.downcast_ref::<ScheduleError>() {
            e.code()
        } else if err.downcast_ref::<SpecError>().is_some() {
            ErrorCode::InvalidSpec
        } else if err.downcast_ref::<DispatchError>().is_some() {
            ErrorCode::TransportError
        } else {
            ErrorCode::InternalError
        };
        Self {
            code,
            message: format!("{:#}", err),
        }
    }
}

/// A spec file that cannot become a task.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("{file}: `modifies` is missing or empty; every task must declare its write-set")]
    EmptyModifies { file: String },

    #[error("{file}: no task id in front-matter or file name")]
    MissingId { file: String },

    #[error("{file}: front-matter is not valid YAML: {reason}")]
    InvalidFrontMatter { file: String, reason: String },

    #[error("{file}: no front-matter block")]
    NoFrontMatter { file: String },

    #[error("{file}: task id {id} already defined by {first}")]
    DuplicateId { file: String, id: String, first: String },

    #[error("{file}: unreadable: {reason}")]
    Unreadable { file: String, reason: String },
}

/// Structural conditions that stop a project from being scheduled at all.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("task {task} depends on unknown task(s): {}", .missing.join(", "))]
    UnknownDependency { task: String, missing: Vec<String> },

    #[error("project {project} is already being scheduled by pid {pid}")]
    AlreadyRunning { project: String, pid: u32 },

    #[error("project {project} has no tasks")]
    EmptyProject { project: String },
}

impl ScheduleError {
    /// Process exit code for a refused start.
    pub fn exit_code(&self) -> i32 {
        2
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ScheduleError::DependencyCycle { .. } => ErrorCode::DependencyCycle,
            ScheduleError::UnknownDependency { .. } => ErrorCode::UnknownDependency,
            ScheduleError::AlreadyRunning { .. } => ErrorCode::AlreadyRunning,
            ScheduleError::EmptyProject { .. } => ErrorCode::EmptyProject,
        }
    }
}
