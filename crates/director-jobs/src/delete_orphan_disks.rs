//! `delete_orphan_disks`: destroy orphaned persistent disks through their CPI.

use async_trait::async_trait;
use director_cloud::CloudError;
use director_core::DirectorError;
use director_tasks::{EventState, Job, JobContext};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::env::JobEnv;
use crate::error::JobResult;

pub const JOB_TYPE: &str = "delete_orphan_disks";

const STAGE: &str = "Deleting orphaned disks";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteOrphanDisksArgs {
    /// Disk cids to delete; every orphan disk when empty.
    #[serde(default)]
    pub cids: Vec<String>,
}

pub struct DeleteOrphanDisks {
    env: JobEnv,
    args: DeleteOrphanDisksArgs,
}

impl DeleteOrphanDisks {
    pub fn new(env: JobEnv, args: DeleteOrphanDisksArgs) -> Self {
        Self { env, args }
    }

    async fn run(&self, ctx: &JobContext) -> JobResult<String> {
        let store = &self.env.store;
        let cids: Vec<String> = if self.args.cids.is_empty() {
            store.list_orphan_disks()?.into_iter().map(|d| d.cid).collect()
        } else {
            self.args.cids.clone()
        };

        let total = cids.len();
        let mut deleted = 0;
        for (position, cid) in cids.iter().enumerate() {
            ctx.check_cancelled()?;
            let Some(orphan) = store.get_orphan_disk(cid)? else {
                warn!(disk_cid = %cid, "orphan disk not found, skipping");
                ctx.logger().warning(&format!("Orphan disk '{cid}' not found"));
                continue;
            };
            ctx.logger().event(STAGE, cid, position + 1, total, EventState::Started);
            let cpi = self.env.cpis.get(&orphan.cpi)?;
            match cpi.delete_disk(cid).await {
                Ok(()) | Err(CloudError::DiskNotFound(_)) => {}
                Err(e) => {
                    ctx.logger()
                        .event_failed(STAGE, cid, position + 1, total, &e.to_string());
                    return Err(e.into());
                }
            }
            store.delete_orphan_disk(cid)?;
            ctx.logger().event(STAGE, cid, position + 1, total, EventState::Finished);
            deleted += 1;
        }

        info!(deleted, "orphan disks deleted");
        Ok(format!("orphaned disk(s) deleted: {deleted}"))
    }
}

#[async_trait]
impl Job for DeleteOrphanDisks {
    fn job_type(&self) -> &'static str {
        JOB_TYPE
    }

    async fn perform(&mut self, ctx: &JobContext) -> Result<String, DirectorError> {
        self.run(ctx).await.map_err(DirectorError::from)
    }
}
