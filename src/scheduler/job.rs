use std::fmt;

use crate::identity::ServerIdentity;

/// How a job left the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Completed,
    Cancelled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One job taken out of a claimed package, waiting in the local queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub job_id: String,
    pub owner: ServerIdentity,
    /// Reference of the package hash this job came from.
    pub package: String,
    /// Assignment terms: number of simulated cycles.
    pub cycles: u32,
    /// Position of the job in its package's enumeration.
    pub index: usize,
}

impl WorkItem {
    pub fn new(
        job_id: impl Into<String>,
        owner: ServerIdentity,
        package: impl Into<String>,
        cycles: u32,
        index: usize,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            owner,
            package: package.into(),
            cycles,
            index,
        }
    }

    /// Field of this job in its owner's progress hash.
    pub fn progress_field(&self) -> String {
        progress_field(&self.package, &self.job_id)
    }
}

/// Job ids are only unique within a package, so progress fields carry both.
pub fn progress_field(package: &str, job_id: &str) -> String {
    format!("{}:{}", package, job_id)
}

/// Result of running one work item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub job_id: String,
    pub package: String,
    pub status: JobStatus,
    pub steps_completed: u32,
    pub remaining: u32,
}

/// Parse a package field value into a cycle count.
pub fn parse_assignment_terms(raw: &str) -> Option<u32> {
    raw.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_display() {
        assert_eq!(JobStatus::Completed.to_string(), "completed");
        assert_eq!(JobStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn progress_field_is_package_scoped() {
        let owner = ServerIdentity::generate("test");
        let a = WorkItem::new("job-a", owner.clone(), "package-1", 3, 0);
        let b = WorkItem::new("job-a", owner, "package-2", 3, 0);
        assert_eq!(a.progress_field(), "package-1:job-a");
        assert_ne!(a.progress_field(), b.progress_field());
    }

    #[test]
    fn assignment_terms_parsing() {
        assert_eq!(parse_assignment_terms("30"), Some(30));
        assert_eq!(parse_assignment_terms(" 7 "), Some(7));
        assert_eq!(parse_assignment_terms("0"), Some(0));
        assert_eq!(parse_assignment_terms("-3"), None);
        assert_eq!(parse_assignment_terms("many"), None);
        assert_eq!(parse_assignment_terms(""), None);
    }
}
