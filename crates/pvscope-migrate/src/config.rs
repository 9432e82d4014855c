//! Migration tuning: wait budgets per operation and the step retry policy

use pvscope_common::{Error, PollSpec, RetryConfig};

use crate::copy::CopyConfig;
use crate::scale::SCALE_POLL;
use crate::volume::{BIND_POLL, DELETE_POLL, POLICY_POLL, UNLINK_POLL};

/// Configuration for one migration run
#[derive(Clone, Debug, PartialEq)]
pub struct MigrateConfig {
    /// Wait for a reclaim-policy change
    pub policy_poll: PollSpec,
    /// Wait for a claim reference to clear
    pub unlink_poll: PollSpec,
    /// Wait for a new claim to bind
    pub bind_poll: PollSpec,
    /// Wait for a deleted claim to disappear
    pub delete_poll: PollSpec,
    /// Wait for the workload to settle after scaling
    pub scale_poll: PollSpec,
    /// Copy Job settings
    pub copy: CopyConfig,
    /// Retry policy applied to every saga step
    pub retry: RetryConfig,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            policy_poll: POLICY_POLL,
            unlink_poll: UNLINK_POLL,
            bind_poll: BIND_POLL,
            delete_poll: DELETE_POLL,
            scale_poll: SCALE_POLL,
            copy: CopyConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl MigrateConfig {
    /// Check every wait budget and the retry policy
    pub fn validate(&self) -> Result<(), Error> {
        self.policy_poll.validate("reclaim policy")?;
        self.unlink_poll.validate("unlink")?;
        self.bind_poll.validate("bind")?;
        self.delete_poll.validate("delete")?;
        self.scale_poll.validate("scale")?;
        self.copy.poll.validate("copy")?;
        self.retry.validate()
    }
}
