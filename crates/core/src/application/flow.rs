// Flow Composer - submits a parent job and its children as one graph

use crate::domain::{ChildJob, FlowJob, FlowNode, JobOptions, NewJob};
use crate::error::{AppError, Result};
use crate::port::Broker;
use std::sync::Arc;
use tracing::{error, info};

pub struct FlowComposer {
    broker: Arc<dyn Broker>,
}

impl FlowComposer {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Submit one parent with flat children, in declared order
    ///
    /// # Errors
    /// - AppError::FlowSubmission if the graph is malformed or the broker
    ///   rejects it. Nothing is persisted in that case.
    pub async fn submit_flow(
        &self,
        parent_name: impl Into<String>,
        parent_queue: impl Into<String>,
        parent_payload: serde_json::Value,
        children: Vec<ChildJob>,
        parent_options: Option<JobOptions>,
    ) -> Result<FlowJob> {
        let parent = NewJob::new(parent_name, parent_queue, parent_payload)
            .with_options(parent_options.unwrap_or_default());
        let flow = FlowNode::new(parent).with_children(children.into_iter().map(FlowNode::from));
        self.add(flow).await
    }

    /// Submit a graph of any depth
    pub async fn add(&self, flow: FlowNode) -> Result<FlowJob> {
        flow.validate()
            .map_err(|e| AppError::FlowSubmission(e.to_string()))?;

        let job_count = flow.job_count();
        let parent_name = flow.job.name.clone();

        match self.broker.add_flow(flow).await {
            Ok(flow_job) => {
                info!(
                    flow_id = %flow_job.id,
                    parent = %parent_name,
                    jobs = job_count,
                    "Flow submitted"
                );
                Ok(flow_job)
            }
            Err(e) => {
                error!(parent = %parent_name, error = %e, "Flow rejected by broker");
                Err(AppError::FlowSubmission(e.to_string()))
            }
        }
    }
}
