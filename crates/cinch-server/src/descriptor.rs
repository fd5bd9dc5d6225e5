//! Builds the `JobDescriptor` handed to an executor in `JOB_ASSIGN`
//! (`spec.md` §4.4 step 5, §4.5). Kept outside `cinch-dispatcher` so the
//! Dispatcher never depends on a `Forge` implementation directly.

use async_trait::async_trait;
use serde_json::json;

use cinch_core::job::Job;
use cinch_core::repository::Repository;
use cinch_core::Result;
use cinch_dispatcher::DescriptorFactory;
use cinch_protocol::JobDescriptor;

use crate::state::ForgeRegistry;

pub struct ServerDescriptorFactory {
    forges: ForgeRegistry,
}

impl ServerDescriptorFactory {
    pub fn new(forges: ForgeRegistry) -> Self {
        Self { forges }
    }
}

#[async_trait]
impl DescriptorFactory for ServerDescriptorFactory {
    async fn build(&self, job: &Job, repo: &Repository) -> Result<JobDescriptor> {
        let clone_token = if let Some(forge) = self.forges.get(job.forge) {
            forge
                .mint_clone_token(&json!({ "repository_id": repo.id.to_string() }))
                .await?
        } else {
            None
        };

        Ok(JobDescriptor {
            job_id: job.id,
            clone_url: repo.clone_url.clone(),
            clone_token,
            head_sha: job.commit_sha.clone(),
            branch: job.branch.clone(),
            tag: job.tag.clone(),
            pr_base: job.pr_base_branch.clone(),
            forge: job.forge,
            command: job.command.clone(),
            timeout_secs: job.timeout.as_secs(),
            env: job.env.clone(),
            trust_level: job.trust_level,
        })
    }
}
