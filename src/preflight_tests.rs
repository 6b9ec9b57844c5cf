use super::*;
use crate::cloud::StackSetDescription;
use crate::desired::StackParameterKey;
use crate::test_support::{
    fanout_desired_state, sample_desired_state, FakeCloud, FakeStack, STACK_SET_NAME,
};

const WEBHOOK_URL: &str = "https://ingest.example/aws_ingest";

fn ou(id: &str) -> AccountSelector {
    AccountSelector::OrganizationalUnit(id.to_string())
}

fn account(id: &str) -> AccountSelector {
    AccountSelector::Account(id.to_string())
}

fn cloud_with_ou(ou_id: &str, accounts: &[&str]) -> FakeCloud {
    let cloud = FakeCloud::new();
    cloud.state().organizational_units.insert(
        ou_id.to_string(),
        accounts.iter().map(|a| a.to_string()).collect(),
    );
    cloud
}

fn validate(cloud: &FakeCloud, desired: &DesiredState) -> PreflightReport {
    PreflightValidator::new(cloud, RetryPolicy::immediate(1)).validate(desired, WEBHOOK_URL)
}

fn messages(report: &PreflightReport) -> Vec<String> {
    report.all_issues().map(|issue| issue.message.clone()).collect()
}

#[test]
fn clean_report_grants_matching_clearance() {
    let cloud = cloud_with_ou("ou-1", &["222222222222", "333333333333"]);
    let desired = fanout_desired_state(
        PermissionModel::ServiceManaged,
        &[ou("ou-1")],
        &["us-east-1", "us-west-2"],
    );
    let report = validate(&cloud, &desired);

    assert!(messages(&report).is_empty(), "{}", report.render());
    assert_eq!(report.targets.len(), 2);
    assert_eq!(report.targets[0].accounts, vec!["222222222222", "333333333333"]);
    let clearance = report.clearance().expect("clearance");
    let targets = desired.fanout_targets.as_ref().expect("fanout").targets();
    assert_eq!(clearance.fingerprint(), desired.stack_fingerprint(&targets));
    assert_eq!(cloud.mutation_count(), 0);
}

#[test]
fn non_admin_caller_is_blocking() {
    let cloud = cloud_with_ou("ou-1", &["222222222222"]);
    cloud.state().management_account = Some("999999999999".to_string());
    let desired = fanout_desired_state(PermissionModel::ServiceManaged, &[ou("ou-1")], &["us-east-1"]);
    let report = validate(&cloud, &desired);

    assert!(report.has_blocking());
    assert!(report.clearance().is_none());
    let text = report.render();
    assert!(text.contains("[ERROR] account 111111111111 is neither the management account"));
    assert!(text.contains("    Action: Run from the management account"));
}

#[test]
fn delegated_admin_passes() {
    let cloud = cloud_with_ou("ou-1", &["222222222222"]);
    {
        let mut state = cloud.state();
        state.management_account = Some("999999999999".to_string());
        state.delegated_admins.insert("111111111111".to_string());
    }
    let desired = fanout_desired_state(PermissionModel::ServiceManaged, &[ou("ou-1")], &["us-east-1"]);
    assert!(!validate(&cloud, &desired).has_blocking());
}

#[test]
fn trusted_access_and_direct_accounts_block_service_managed() {
    let cloud = FakeCloud::new();
    cloud.state().trusted_access = false;
    let desired = fanout_desired_state(
        PermissionModel::ServiceManaged,
        &[account("222222222222")],
        &["us-east-1"],
    );
    let report = validate(&cloud, &desired);
    assert_eq!(report.error_count(), 2, "{}", report.render());
    assert!(messages(&report)
        .iter()
        .any(|message| message.contains("trusted access")));
}

#[test]
fn missing_admin_role_is_only_a_warning() {
    let cloud = FakeCloud::new();
    let desired = fanout_desired_state(
        PermissionModel::SelfManaged,
        &[account("222222222222")],
        &["us-east-1"],
    );
    let report = validate(&cloud, &desired);
    assert_eq!(report.error_count(), 0, "{}", report.render());
    assert_eq!(report.warning_count(), 1);
    assert!(report.clearance().is_some());
}

#[test]
fn disabled_region_and_inactive_account_are_target_issues() {
    let cloud = FakeCloud::new();
    cloud.state().inactive_accounts.insert("333333333333".to_string());
    let desired = fanout_desired_state(
        PermissionModel::SelfManaged,
        &[account("222222222222"), account("333333333333")],
        &["ap-south-2"],
    );
    let report = validate(&cloud, &desired);

    let by_account: Vec<(String, usize)> = report
        .targets
        .iter()
        .map(|target| (target.accounts.join(","), target.issues.len()))
        .collect();
    assert_eq!(
        by_account,
        vec![
            ("222222222222".to_string(), 1),
            ("333333333333".to_string(), 2),
        ]
    );
    assert!(report.targets[0].issues[0].message.contains("ap-south-2"));
}

#[test]
fn unknown_organizational_unit_is_reported_not_raised() {
    let cloud = FakeCloud::new();
    let desired = fanout_desired_state(PermissionModel::ServiceManaged, &[ou("ou-missing")], &["us-east-1"]);
    let report = validate(&cloud, &desired);
    let issue = &report.targets[0].issues[0];
    assert_eq!(issue.severity, Severity::Error);
    assert!(issue.message.contains("cannot resolve organizational unit ou-missing"));
}

#[test]
fn template_parameter_gaps_are_blocking() {
    let cloud = cloud_with_ou("ou-1", &["222222222222"]);
    {
        let mut state = cloud.state();
        state.template_parameters.retain(|param| param.key != "LambdaFunctionName");
        for param in state.template_parameters.iter_mut() {
            if param.key == "QueueName" {
                param.has_default = false;
            }
        }
    }
    let mut desired = fanout_desired_state(PermissionModel::ServiceManaged, &[ou("ou-1")], &["us-east-1"]);
    desired.keep_previous.insert(StackParameterKey::QueueName);
    let report = validate(&cloud, &desired);
    let found = messages(&report);
    assert!(found
        .iter()
        .any(|m| m == "template does not declare parameter LambdaFunctionName"));
    assert!(found
        .iter()
        .any(|m| m.starts_with("parameter QueueName keeps its previous value")));
}

#[test]
fn invalid_template_is_blocking() {
    let cloud = cloud_with_ou("ou-1", &["222222222222"]);
    cloud.state().template_error = Some("Template format error: unsupported structure".to_string());
    let desired = fanout_desired_state(PermissionModel::ServiceManaged, &[ou("ou-1")], &["us-east-1"]);
    let report = validate(&cloud, &desired);
    assert!(messages(&report)
        .iter()
        .any(|m| m.contains("Template format error")));
}

#[test]
fn existing_stack_set_collisions_are_flagged() {
    let cloud = cloud_with_ou("ou-1", &["222222222222"]);
    cloud.state().stack_sets.insert(
        STACK_SET_NAME.to_string(),
        StackSetDescription {
            permission_model: PermissionModel::SelfManaged,
            template_digest: None,
            parameters: Default::default(),
        },
    );
    let mut broken = FakeStack::complete(Default::default());
    broken.status = "OUTDATED/FAILED".to_string();
    broken.phase = StackPhase::Failed;
    cloud.insert_stack(
        STACK_SET_NAME,
        &StackTarget::new("222222222222", "us-east-1"),
        broken,
    );

    let desired = fanout_desired_state(PermissionModel::ServiceManaged, &[ou("ou-1")], &["us-east-1"]);
    let report = validate(&cloud, &desired);
    assert!(report.general.iter().any(|issue| issue
        .message
        .contains("already exists with permission model SELF_MANAGED")));
    assert!(report.targets[0].issues[0].message.contains("OUTDATED/FAILED"));
}

#[test]
fn bad_webhook_url_is_blocking() {
    let cloud = cloud_with_ou("ou-1", &["222222222222"]);
    let desired = fanout_desired_state(PermissionModel::ServiceManaged, &[ou("ou-1")], &["us-east-1"]);
    let report = PreflightValidator::new(&cloud, RetryPolicy::immediate(1)).validate(&desired, "aws_ingest");
    assert_eq!(report.error_count(), 1);
}

#[test]
fn missing_fanout_section_is_blocking() {
    let cloud = FakeCloud::new();
    let report = validate(&cloud, &sample_desired_state());
    assert!(report.has_blocking());
    assert_eq!(cloud.read_count(), 0);
}

#[test]
fn denied_reads_block_instead_of_warning() {
    for operation in ["ListStackSets", "DescribeStackSet", "DescribeRegions", "DescribeAccount"] {
        let cloud = cloud_with_ou("ou-1", &["222222222222"]);
        cloud.state().denied_reads.insert(operation.to_string());
        let desired = fanout_desired_state(PermissionModel::ServiceManaged, &[ou("ou-1")], &["us-east-1"]);
        let report = validate(&cloud, &desired);
        assert!(report.has_blocking(), "{operation}: {}", report.render());
        assert!(report.clearance().is_none(), "{operation}");
    }
}

#[test]
fn denied_role_lookup_blocks_self_managed() {
    let cloud = FakeCloud::new();
    cloud.state().denied_reads.insert("GetRole".to_string());
    let desired = fanout_desired_state(PermissionModel::SelfManaged, &[account("222222222222")], &["us-east-1"]);
    let report = validate(&cloud, &desired);
    assert!(report.has_blocking(), "{}", report.render());
    assert!(messages(&report).iter().any(|message| message.contains("AccessDenied")));
}
