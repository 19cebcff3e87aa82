use std::time::{Duration, Instant};

use derive_more::{Display, Error, From};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{ApiClient, ApiError, Deployment};
use crate::interrupt::{Cancelled, Interrupt, SleepError};

/// Lifecycle status of a deployment.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum DeploymentStatus {
    #[display(fmt = "Waiting for upload")]
    WaitingUpload,
    #[display(fmt = "Ready for build")]
    ReadyForBuild,
    #[display(fmt = "Building")]
    Building,
    #[display(fmt = "Extracting")]
    Extracting,
    #[display(fmt = "Extracting failed")]
    ExtractingFailed,
    #[display(fmt = "Building image")]
    BuildingImage,
    #[display(fmt = "Build failed")]
    BuildingImageFailed,
    #[display(fmt = "Deploying")]
    Deploying,
    #[display(fmt = "Deploying failed")]
    DeployingFailed,
    #[display(fmt = "Verifying")]
    Verifying,
    #[display(fmt = "Verifying failed")]
    VerifyingFailed,
    #[display(fmt = "Verification skipped")]
    VerifyingSkipped,
    #[display(fmt = "Success")]
    Success,
    #[display(fmt = "Failed")]
    Failed,
}

impl DeploymentStatus {
    /// Whether the deployment may still change its status.
    pub(crate) fn is_in_progress(self) -> bool {
        matches!(
            self,
            DeploymentStatus::WaitingUpload
                | DeploymentStatus::ReadyForBuild
                | DeploymentStatus::Building
                | DeploymentStatus::Extracting
                | DeploymentStatus::BuildingImage
                | DeploymentStatus::Deploying
                | DeploymentStatus::Verifying
        )
    }

    /// Whether the deployment is live.
    pub(crate) fn is_success(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success | DeploymentStatus::VerifyingSkipped
        )
    }
}

/// Status polling parameters.
#[derive(Debug, Clone)]
pub(crate) struct StatusPolicy {
    /// Delay between two status requests.
    pub interval: Duration,

    /// Time after which polling gives up.
    pub timeout: Duration,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Status polling errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum StatusPollError {
    Api(ApiError),

    #[from(ignore)]
    #[display(fmt = "deployment status polling timed out after {} seconds", seconds)]
    TimedOut { seconds: u64 },

    Cancelled(Cancelled),
}

impl ApiClient {
    /// Wait until a deployment leaves the in-progress statuses.
    ///
    /// Returns the deployment in its final status, which may be a failure. Transient
    /// request errors are retried on the next tick. `on_status` is called with every
    /// observed status.
    pub(crate) fn poll_deployment_status(
        &self,
        app_id: &str,
        deployment_id: &str,
        policy: &StatusPolicy,
        interrupt: &Interrupt,
        mut on_status: impl FnMut(DeploymentStatus),
    ) -> Result<Deployment, StatusPollError> {
        let deadline = Instant::now() + policy.timeout;

        loop {
            interrupt.check()?;

            match self.get_deployment(app_id, deployment_id) {
                Ok(deployment) if !deployment.status.is_in_progress() => {
                    debug!(status = ?deployment.status, "deployment reached final status");
                    on_status(deployment.status);
                    return Ok(deployment);
                }
                Ok(deployment) => on_status(deployment.status),
                Err(error) if error.is_transient() => {
                    warn!(%error, "unable to fetch deployment status, retrying");
                }
                Err(error) => return Err(error.into()),
            }

            match interrupt.sleep_until(policy.interval, Some(deadline)) {
                Ok(()) => {}
                Err(SleepError::Cancelled(cancelled)) => return Err(cancelled.into()),
                Err(SleepError::DeadlineExceeded) => {
                    return Err(StatusPollError::TimedOut {
                        seconds: policy.timeout.as_secs(),
                    })
                }
            }
        }
    }
}
