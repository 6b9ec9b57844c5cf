//! Run settings built once from CLI flags and threaded into every component.
use crate::cli::{CloudArgs, RegistryArgs, RetryArgs};
use crate::cloud::{AwsCliSettings, SettleSettings};
use crate::desired::DesiredState;
use crate::error::{ReconcileError, ReconcileResult};
use crate::registry::{RegistryConnection, RegistryCredential};
use crate::retry::RetryPolicy;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RegistryRunSettings {
    pub api_base_url: String,
    pub ingest_base_url: String,
    pub credential: Option<RegistryCredential>,
    pub http_timeout: Duration,
}

impl RegistryRunSettings {
    pub fn from_args(args: &RegistryArgs) -> Self {
        let non_empty = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let credential = match (
            non_empty(&args.token),
            non_empty(&args.client_id),
            non_empty(&args.client_secret),
        ) {
            (Some(token), _, _) => Some(RegistryCredential::Bearer(token)),
            (None, Some(client_id), Some(client_secret)) => {
                Some(RegistryCredential::ClientCredentials {
                    client_id,
                    client_secret,
                })
            }
            _ => None,
        };
        RegistryRunSettings {
            api_base_url: args.api_base_url.trim_end_matches('/').to_string(),
            ingest_base_url: args.ingest_base_url.trim_end_matches('/').to_string(),
            credential,
            http_timeout: Duration::from_secs(args.http_timeout_secs.max(1)),
        }
    }

    /// Connection parameters; a missing credential is an auth failure.
    pub fn connection(&self, retry: RetryPolicy) -> ReconcileResult<RegistryConnection> {
        let credential = self.credential.clone().ok_or_else(|| {
            ReconcileError::Auth(
                "no registry credential: set PORT_API_TOKEN, or PORT_CLIENT_ID and PORT_CLIENT_SECRET"
                    .to_string(),
            )
        })?;
        Ok(RegistryConnection {
            api_base_url: self.api_base_url.clone(),
            credential,
            timeout: self.http_timeout,
            retry,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CloudRunSettings {
    pub aws_command: String,
    pub region_override: Option<String>,
    pub settle: SettleSettings,
    pub max_concurrency: Option<usize>,
}

impl CloudRunSettings {
    pub fn from_args(args: &CloudArgs) -> Self {
        CloudRunSettings {
            aws_command: args.aws_command.clone(),
            region_override: args
                .region
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string),
            settle: SettleSettings {
                poll_interval: Duration::from_secs(args.poll_interval_secs),
                target_timeout: Duration::from_secs(args.target_timeout_secs.max(1)),
            },
            max_concurrency: args.max_concurrency,
        }
    }

    pub fn region<'a>(&'a self, desired: &'a DesiredState) -> &'a str {
        self.region_override
            .as_deref()
            .unwrap_or(desired.region_default.as_str())
    }

    pub fn aws_cli(&self, desired: &DesiredState) -> AwsCliSettings {
        AwsCliSettings {
            command: self.aws_command.clone(),
            region: self.region(desired).to_string(),
        }
    }

    /// Apply CLI overrides that change the desired state itself.
    pub fn apply_overrides(&self, desired: &mut DesiredState) {
        if let Some(region) = &self.region_override {
            desired.region_default = region.clone();
        }
        if let (Some(bound), Some(fanout)) = (self.max_concurrency, desired.fanout_targets.as_mut())
        {
            fanout.max_concurrency = bound;
        }
    }
}

pub fn retry_policy(args: &RetryArgs) -> RetryPolicy {
    RetryPolicy {
        max_attempts: args.max_attempts.max(1),
        ..RetryPolicy::default()
    }
}
