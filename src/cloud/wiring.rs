//! Post-deploy wiring check for a standalone stack: the queue must feed the
//! function through an enabled event-source mapping.
use super::{CloudApi, StackLocator};
use crate::desired::{PARAM_FUNCTION_NAME, PARAM_QUEUE_NAME};
use crate::error::{ReconcileError, ReconcileResult};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Stack output naming the event-bus rule, when the template exports it.
pub const RULE_NAME_OUTPUT: &str = "EventRuleName";

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MappingAction {
    Present,
    Created,
    Enabled,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct WiringReport {
    pub queue_arn: String,
    pub function_arn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_state: Option<String>,
    pub mapping: MappingAction,
}

pub struct WiringChecker<'a> {
    cloud: &'a dyn CloudApi,
    retry: RetryPolicy,
}

impl<'a> WiringChecker<'a> {
    pub fn new(cloud: &'a dyn CloudApi, retry: RetryPolicy) -> Self {
        WiringChecker { cloud, retry }
    }

    /// Check the wiring of a deployed stack. Queue and function names come
    /// from the stack's live parameters, so a kept operator value is honored;
    /// the desired names fill in for parameters the stack does not report.
    pub fn check_stack(
        &self,
        locator: &StackLocator,
        desired_queue: &str,
        desired_function: &str,
        rule_name: Option<&str>,
    ) -> ReconcileResult<WiringReport> {
        let live = self
            .retry
            .run(&format!("describe {locator}"), None, || self.cloud.describe_stack(locator))?
            .ok_or_else(|| ReconcileError::Fatal(format!("{locator} not found")))?;
        let queue_name = live
            .parameters
            .get(PARAM_QUEUE_NAME)
            .map_or(desired_queue, String::as_str);
        let function_name = live
            .parameters
            .get(PARAM_FUNCTION_NAME)
            .map_or(desired_function, String::as_str);
        if queue_name != desired_queue || function_name != desired_function {
            tracing::info!(queue = queue_name, function = function_name, "checking live resource names");
        }
        self.check(queue_name, function_name, &locator.target().region, rule_name)
    }

    pub fn check(
        &self,
        queue_name: &str,
        function_name: &str,
        region: &str,
        rule_name: Option<&str>,
    ) -> ReconcileResult<WiringReport> {
        let queue_arn = self
            .retry
            .run("read queue attributes", None, || self.cloud.queue_arn(queue_name, region))?
            .ok_or_else(|| ReconcileError::Fatal(format!("queue {queue_name} not found in {region}")))?;
        let function_arn = self
            .retry
            .run("get function", None, || self.cloud.function_arn(function_name, region))?
            .ok_or_else(|| {
                ReconcileError::Fatal(format!("function {function_name} not found in {region}"))
            })?;

        let rule_state = match rule_name {
            Some(rule) => {
                let state = self
                    .retry
                    .run("describe rule", None, || self.cloud.event_rule_state(rule, region))?;
                match state.as_deref() {
                    Some("ENABLED") => {}
                    Some(other) => tracing::warn!(rule, state = other, "event rule is not enabled"),
                    None => tracing::warn!(rule, "event rule not found"),
                }
                state
            }
            None => {
                tracing::debug!("stack exports no rule name, skipping rule check");
                None
            }
        };

        let mappings = self.retry.run("list event source mappings", None, || {
            self.cloud.event_source_mappings(function_name, region)
        })?;
        let existing = mappings.iter().find(|mapping| mapping.source_arn == queue_arn);
        let mapping = match existing {
            Some(mapping) if mapping.enabled => MappingAction::Present,
            Some(mapping) => {
                self.cloud.enable_event_source_mapping(&mapping.uuid, region)?;
                tracing::info!(uuid = %mapping.uuid, "re-enabled event source mapping");
                MappingAction::Enabled
            }
            None => {
                self.cloud
                    .create_event_source_mapping(function_name, &queue_arn, region)?;
                tracing::info!(queue = %queue_arn, function = function_name, "created event source mapping");
                MappingAction::Created
            }
        };

        Ok(WiringReport {
            queue_arn,
            function_arn,
            rule_state,
            mapping,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::EventSourceMapping;
    use crate::desired::StackTarget;
    use crate::test_support::{FakeCloud, FakeStack};
    use std::collections::BTreeMap;

    const QUEUE_ARN: &str = "arn:aws:sqs:us-east-1:111111111111:q";

    fn wired_cloud() -> FakeCloud {
        let cloud = FakeCloud::new();
        {
            let mut state = cloud.state();
            state.queues.insert("q".to_string(), QUEUE_ARN.to_string());
            state.functions.insert(
                "f".to_string(),
                "arn:aws:lambda:us-east-1:111111111111:function:f".to_string(),
            );
            state.rules.insert("r".to_string(), "ENABLED".to_string());
        }
        cloud
    }

    #[test]
    fn missing_mapping_is_created_once() {
        let cloud = wired_cloud();
        let checker = WiringChecker::new(&cloud, RetryPolicy::immediate(1));
        let first = checker.check("q", "f", "us-east-1", Some("r")).expect("first");
        assert_eq!(first.mapping, MappingAction::Created);
        assert_eq!(first.rule_state.as_deref(), Some("ENABLED"));
        let second = checker.check("q", "f", "us-east-1", Some("r")).expect("second");
        assert_eq!(second.mapping, MappingAction::Present);
        assert_eq!(cloud.mutation_count(), 1);
    }

    #[test]
    fn disabled_mapping_is_enabled() {
        let cloud = wired_cloud();
        cloud.state().mappings.push(EventSourceMapping {
            uuid: "u-1".to_string(),
            source_arn: QUEUE_ARN.to_string(),
            enabled: false,
        });
        let checker = WiringChecker::new(&cloud, RetryPolicy::immediate(1));
        let report = checker.check("q", "f", "us-east-1", None).expect("check");
        assert_eq!(report.mapping, MappingAction::Enabled);
        assert!(cloud.state().mappings[0].enabled);
    }

    #[test]
    fn live_stack_names_win_over_desired() {
        let cloud = wired_cloud();
        let target = StackTarget::new("111111111111", "us-east-1");
        let live = BTreeMap::from([
            (PARAM_QUEUE_NAME.to_string(), "q".to_string()),
            (PARAM_FUNCTION_NAME.to_string(), "f".to_string()),
        ]);
        cloud.insert_stack("port-aws-serverless", &target, FakeStack::complete(live));
        let locator = StackLocator::Stack {
            stack_name: "port-aws-serverless".to_string(),
            target,
        };
        let checker = WiringChecker::new(&cloud, RetryPolicy::immediate(1));
        let report = checker
            .check_stack(&locator, "installer-default-queue", "installer-default-function", None)
            .expect("check");
        assert_eq!(report.queue_arn, QUEUE_ARN);
        assert_eq!(report.mapping, MappingAction::Created);
    }

    #[test]
    fn missing_stack_fails_wiring() {
        let cloud = wired_cloud();
        let locator = StackLocator::Stack {
            stack_name: "absent".to_string(),
            target: StackTarget::new("111111111111", "us-east-1"),
        };
        let err = WiringChecker::new(&cloud, RetryPolicy::immediate(1))
            .check_stack(&locator, "q", "f", None)
            .expect_err("no stack");
        assert!(err.message().contains("not found"));
    }

    #[test]
    fn missing_queue_fails() {
        let cloud = FakeCloud::new();
        let checker = WiringChecker::new(&cloud, RetryPolicy::immediate(1));
        let err = checker.check("q", "f", "us-east-1", None).expect_err("no queue");
        assert!(err.message().contains("queue q"));
    }
}
