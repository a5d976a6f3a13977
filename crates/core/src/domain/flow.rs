// Flow Domain Model - parent job plus dependent children

use crate::domain::error::Result;
use crate::domain::job::{JobId, JobOptions, NewJob};
use serde::{Deserialize, Serialize};

/// One node of a job dependency graph
///
/// A node with children is held back by the broker until every child completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    #[serde(flatten)]
    pub job: NewJob,

    #[serde(default)]
    pub children: Vec<FlowNode>,
}

impl FlowNode {
    pub fn new(job: NewJob) -> Self {
        Self {
            job,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: FlowNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = FlowNode>) -> Self {
        self.children.extend(children);
        self
    }

    /// Validate every job in the graph (depth-first)
    pub fn validate(&self) -> Result<()> {
        self.job.validate()?;
        self.children.iter().try_for_each(FlowNode::validate)
    }

    /// Number of jobs in the graph, this node included
    pub fn job_count(&self) -> usize {
        1 + self.children.iter().map(FlowNode::job_count).sum::<usize>()
    }
}

/// Child declaration in the flat `submit_flow` form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildJob {
    pub name: String,
    pub queue_name: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub options: Option<JobOptions>,
}

impl ChildJob {
    pub fn new(
        name: impl Into<String>,
        queue_name: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            queue_name: queue_name.into(),
            data,
            options: None,
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = Some(options);
        self
    }
}

impl From<ChildJob> for FlowNode {
    fn from(child: ChildJob) -> Self {
        let job = NewJob::new(child.name, child.queue_name, child.data)
            .with_options(child.options.unwrap_or_default());
        FlowNode::new(job)
    }
}

/// Persisted flow: broker-assigned IDs in the submitted tree shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowJob {
    pub id: JobId,
    pub name: String,
    pub queue: String,
    pub children: Vec<FlowJob>,
}

impl FlowJob {
    /// All job IDs in the tree, parent first
    pub fn ids(&self) -> Vec<JobId> {
        let mut ids = vec![self.id.clone()];
        for child in &self.children {
            ids.extend(child.ids());
        }
        ids
    }
}
