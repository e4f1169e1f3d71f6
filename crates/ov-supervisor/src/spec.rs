//! Job specifications
//!
//! Callers submit a loose [`JobRequest`]; it is validated into a [`JobSpec`]
//! whose [`Workflow`] variant carries exactly the fields that kind needs.
//! Nothing is spawned for a request that fails validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ov_core::router::{ExecutionTier, TaskSpec};
use ov_core::{Error, Result};

/// Submission as it arrives from the API or the command line
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRequest {
    pub team: Option<String>,
    pub workflow_kind: Option<String>,
    pub target_repository: Option<String>,
    pub model_override: Option<String>,
    pub branch_name: Option<String>,
    pub priority_file: Option<String>,
    /// Free-text summary used for routing
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    RepositoryEdit,
    ContentWriting,
    Research,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::RepositoryEdit => "repository_edit",
            WorkflowKind::ContentWriting => "content_writing",
            WorkflowKind::Research => "research",
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "repository_edit" | "repo_edit" | "code" => Ok(WorkflowKind::RepositoryEdit),
            "content_writing" | "content" | "marketing" => Ok(WorkflowKind::ContentWriting),
            "research" => Ok(WorkflowKind::Research),
            other => Err(Error::Validation(format!("unknown workflow kind '{}'", other))),
        }
    }
}

/// Workflow-specific inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Workflow {
    RepositoryEdit {
        target_repository: PathBuf,
        priority_file: Option<PathBuf>,
        branch_name: Option<String>,
    },
    ContentWriting {
        /// The brief to write from
        priority_file: PathBuf,
        target_repository: Option<PathBuf>,
    },
    Research {
        /// The question to research
        priority_file: PathBuf,
        target_repository: Option<PathBuf>,
    },
}

impl Workflow {
    pub fn kind(&self) -> WorkflowKind {
        match self {
            Workflow::RepositoryEdit { .. } => WorkflowKind::RepositoryEdit,
            Workflow::ContentWriting { .. } => WorkflowKind::ContentWriting,
            Workflow::Research { .. } => WorkflowKind::Research,
        }
    }

    pub fn target_repository(&self) -> Option<&Path> {
        match self {
            Workflow::RepositoryEdit {
                target_repository, ..
            } => Some(target_repository),
            Workflow::ContentWriting {
                target_repository, ..
            }
            | Workflow::Research {
                target_repository, ..
            } => target_repository.as_deref(),
        }
    }

    pub fn priority_file(&self) -> Option<&Path> {
        match self {
            Workflow::RepositoryEdit { priority_file, .. } => priority_file.as_deref(),
            Workflow::ContentWriting { priority_file, .. } | Workflow::Research { priority_file, .. } => {
                Some(priority_file)
            }
        }
    }

    pub fn branch_name(&self) -> Option<&str> {
        match self {
            Workflow::RepositoryEdit { branch_name, .. } => branch_name.as_deref(),
            _ => None,
        }
    }

    /// Positional worker arguments: repository, priority input, branch.
    /// Absent values are passed as empty strings.
    pub fn worker_args(&self) -> [String; 3] {
        let path = |p: Option<&Path>| p.map(|p| p.display().to_string()).unwrap_or_default();
        [
            path(self.target_repository()),
            path(self.priority_file()),
            self.branch_name().unwrap_or_default().to_string(),
        ]
    }
}

/// Validated job specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub team: String,
    pub model_override: Option<ExecutionTier>,
    pub description: Option<String>,
    pub workflow: Workflow,
}

impl JobSpec {
    pub fn from_request(request: JobRequest) -> Result<Self> {
        let team = non_empty(request.team)
            .ok_or_else(|| Error::Validation("team is required".to_string()))?;
        let kind: WorkflowKind = non_empty(request.workflow_kind)
            .ok_or_else(|| Error::Validation("workflow_kind is required".to_string()))?
            .parse()?;
        let model_override = non_empty(request.model_override)
            .map(|tier| {
                tier.parse::<ExecutionTier>()
                    .map_err(|_| Error::Validation(format!("unknown model tier '{}'", tier)))
            })
            .transpose()?;

        let target_repository = non_empty(request.target_repository).map(PathBuf::from);
        let priority_file = non_empty(request.priority_file).map(PathBuf::from);
        let branch_name = non_empty(request.branch_name);

        if let Some(repo) = &target_repository {
            if !repo.is_dir() {
                return Err(Error::Validation(format!(
                    "target repository {} is not a directory",
                    repo.display()
                )));
            }
        }
        if let Some(file) = &priority_file {
            if !file.is_file() {
                return Err(Error::Validation(format!(
                    "priority file {} does not exist",
                    file.display()
                )));
            }
        }

        let workflow = match kind {
            WorkflowKind::RepositoryEdit => {
                let target_repository = target_repository.ok_or_else(|| {
                    Error::Validation("repository_edit requires target_repository".to_string())
                })?;
                if let Some(branch) = &branch_name {
                    validate_branch(branch)?;
                }
                Workflow::RepositoryEdit {
                    target_repository,
                    priority_file,
                    branch_name,
                }
            }
            WorkflowKind::ContentWriting => Workflow::ContentWriting {
                priority_file: priority_file.ok_or_else(|| {
                    Error::Validation("content_writing requires a priority_file brief".to_string())
                })?,
                target_repository,
            },
            WorkflowKind::Research => Workflow::Research {
                priority_file: priority_file.ok_or_else(|| {
                    Error::Validation("research requires a priority_file question".to_string())
                })?,
                target_repository,
            },
        };

        Ok(Self {
            team,
            model_override,
            description: non_empty(request.description),
            workflow,
        })
    }

    /// Text the router classifies
    pub fn routing_description(&self) -> String {
        if let Some(description) = &self.description {
            return description.clone();
        }
        match &self.workflow {
            Workflow::RepositoryEdit {
                target_repository, ..
            } => format!("code change in {}", target_repository.display()),
            Workflow::ContentWriting { priority_file, .. } => {
                format!("write content from {}", priority_file.display())
            }
            Workflow::Research { priority_file, .. } => {
                format!("research {}", priority_file.display())
            }
        }
    }

    pub fn task_spec(&self) -> TaskSpec {
        let mut spec = TaskSpec::new(self.routing_description()).with_team(&self.team);
        spec.creativity = self.workflow.kind() == WorkflowKind::ContentWriting;
        spec
    }
}

impl TryFrom<JobRequest> for JobSpec {
    type Error = Error;

    fn try_from(request: JobRequest) -> Result<Self> {
        Self::from_request(request)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn validate_branch(branch: &str) -> Result<()> {
    if branch.starts_with('-')
        || branch.contains("..")
        || branch.chars().any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c))
    {
        return Err(Error::Validation(format!("invalid branch name '{}'", branch)));
    }
    Ok(())
}
