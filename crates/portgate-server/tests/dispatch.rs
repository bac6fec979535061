//! End-to-end dispatch tests over in-memory transports

mod common;

use common::{harness, wait_for, CommandBehavior, FakeClient, FakeClientConfig};
use portgate_proto::JobStatus;
use portgate_server::{ErrorKind, ExecuteInput, MultiDispatchRequest, User};
use portgate_store::{ClientGroup, GroupParams, ListOptions};

fn user() -> User {
    User {
        username: "admin".to_string(),
        groups: vec!["ops".to_string()],
    }
}

fn exec(command: &str) -> ExecuteInput {
    ExecuteInput {
        command: command.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_single_command_roundtrip() {
    let h = harness();
    let client = FakeClient::connect(
        &h,
        "203.0.113.10:40000",
        FakeClientConfig::named(0xa1, "web-01"),
    )
    .await
    .unwrap();

    let jid = h
        .dispatcher
        .execute_command(&client.client_id, exec("uptime"), &user())
        .await
        .unwrap();

    // the job is persisted once the client accepted it
    let job = h.jobs.get_by_jid(&client.client_id, &jid).unwrap().unwrap();
    assert_eq!(job.created_by, "admin");
    assert_eq!(job.pid, Some(4242));
    assert_eq!(client.received_commands(), vec!["uptime".to_string()]);

    // the pushed cmd_result flips it to successful
    {
        let jobs = h.jobs.clone();
        let client_id = client.client_id.clone();
        let jid = jid.clone();
        wait_for(
            move || {
                jobs.get_by_jid(&client_id, &jid)
                    .unwrap()
                    .map(|j| j.status == JobStatus::Successful)
                    .unwrap_or(false)
            },
            "job to finish",
        )
        .await;
    }

    let job = h.jobs.get_by_jid(&client.client_id, &jid).unwrap().unwrap();
    assert!(job.finished_at.is_some());
    assert_eq!(job.result.unwrap().stdout, "done");
}

#[tokio::test]
async fn test_single_command_enforces_user_access() {
    let h = harness();
    let client = FakeClient::connect(
        &h,
        "203.0.113.10:40013",
        FakeClientConfig::named(0xa4, "restricted"),
    )
    .await
    .unwrap();

    // the caller is in `ops`; the client only admits `secops`
    h.registry
        .set_acl(&client.client_id, vec!["secops".to_string()])
        .await
        .unwrap();

    let err = h
        .dispatcher
        .execute_command(&client.client_id, exec("uptime"), &user())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert!(client.received_jobs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_single_command_requires_active_client() {
    let h = harness();
    let err = h
        .dispatcher
        .execute_command(&"ff".repeat(32), exec("uptime"), &user())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_dispatch_rejected_by_client_maps_to_client_error() {
    let h = harness();
    let mut config = FakeClientConfig::named(0xa2, "web-02");
    config.command = CommandBehavior::RejectDispatch;
    let client = FakeClient::connect(&h, "203.0.113.10:40001", config)
        .await
        .unwrap();

    let err = h
        .dispatcher
        .execute_command(&client.client_id, exec("uptime"), &user())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ClientError);
}

#[tokio::test]
async fn test_multi_needs_two_clients() {
    let h = harness();
    let client = FakeClient::connect(
        &h,
        "203.0.113.10:40002",
        FakeClientConfig::named(0xa3, "solo"),
    )
    .await
    .unwrap();

    let err = h
        .dispatcher
        .execute_multi(
            MultiDispatchRequest {
                client_ids: vec![client.client_id.clone()],
                execute: exec("uptime"),
                ..Default::default()
            },
            &user(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn test_multi_unknown_group_and_client() {
    let h = harness();

    let err = h
        .dispatcher
        .execute_multi(
            MultiDispatchRequest {
                group_ids: vec!["missing".to_string()],
                execute: exec("uptime"),
                ..Default::default()
            },
            &user(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = h
        .dispatcher
        .execute_multi(
            MultiDispatchRequest {
                client_ids: vec!["aa".repeat(32), "bb".repeat(32)],
                execute: exec("uptime"),
                ..Default::default()
            },
            &user(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_concurrent_multi_runs_all_children() {
    let h = harness();
    let a = FakeClient::connect(
        &h,
        "203.0.113.10:40003",
        FakeClientConfig::named(0xb1, "node-a"),
    )
    .await
    .unwrap();
    let b = FakeClient::connect(
        &h,
        "203.0.113.10:40004",
        FakeClientConfig::named(0xb2, "node-b"),
    )
    .await
    .unwrap();

    let jid = h
        .dispatcher
        .execute_multi(
            MultiDispatchRequest {
                client_ids: vec![a.client_id.clone(), b.client_id.clone()],
                execute: exec("uptime"),
                execute_concurrently: true,
                ..Default::default()
            },
            &user(),
        )
        .await
        .unwrap();

    {
        let jobs = h.jobs.clone();
        let jid = jid.clone();
        wait_for(
            move || {
                let children = jobs.get_by_multi_job_id(&jid).unwrap();
                children.len() == 2 && children.iter().all(|j| j.status == JobStatus::Successful)
            },
            "both children to finish",
        )
        .await;
    }

    let multi = h.jobs.get_multi_job(&jid).unwrap().unwrap();
    assert!(multi.concurrent);
    assert_eq!(multi.jobs.len(), 2);
    assert!(multi
        .jobs
        .iter()
        .all(|j| j.multi_job_id.as_deref() == Some(jid.as_str())));
}

#[tokio::test]
async fn test_sequential_abort_on_first_failure() {
    let h = harness();
    let mut failing = FakeClientConfig::named(0xc1, "first");
    failing.command = CommandBehavior::FinishWith(JobStatus::Failed);
    let a = FakeClient::connect(&h, "203.0.113.10:40005", failing)
        .await
        .unwrap();
    let b = FakeClient::connect(
        &h,
        "203.0.113.10:40006",
        FakeClientConfig::named(0xc2, "second"),
    )
    .await
    .unwrap();

    let jid = h
        .dispatcher
        .execute_multi(
            MultiDispatchRequest {
                client_ids: vec![a.client_id.clone(), b.client_id.clone()],
                execute: exec("deploy"),
                execute_concurrently: false,
                abort_on_error: None,
                ..Default::default()
            },
            &user(),
        )
        .await
        .unwrap();

    {
        let jobs = h.jobs.clone();
        let jid = jid.clone();
        wait_for(
            move || {
                jobs.get_by_multi_job_id(&jid)
                    .unwrap()
                    .iter()
                    .any(|j| j.status == JobStatus::Failed)
            },
            "first child to fail",
        )
        .await;
    }
    // give the sequential loop room to (wrongly) dispatch further children
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;

    let children = h.jobs.get_by_multi_job_id(&jid).unwrap();
    assert_eq!(children.len(), 1, "no child after the failed one may exist");
    assert_eq!(children[0].client_id, a.client_id);
    assert!(b.received_jobs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_sequential_without_abort_continues() {
    let h = harness();
    let mut failing = FakeClientConfig::named(0xd1, "first");
    failing.command = CommandBehavior::FinishWith(JobStatus::Failed);
    let a = FakeClient::connect(&h, "203.0.113.10:40007", failing)
        .await
        .unwrap();
    let b = FakeClient::connect(
        &h,
        "203.0.113.10:40008",
        FakeClientConfig::named(0xd2, "second"),
    )
    .await
    .unwrap();

    let jid = h
        .dispatcher
        .execute_multi(
            MultiDispatchRequest {
                client_ids: vec![a.client_id.clone(), b.client_id.clone()],
                execute: exec("deploy"),
                execute_concurrently: false,
                abort_on_error: Some(false),
                ..Default::default()
            },
            &user(),
        )
        .await
        .unwrap();

    let jobs = h.jobs.clone();
    let jid_clone = jid.clone();
    wait_for(
        move || jobs.get_by_multi_job_id(&jid_clone).unwrap().len() == 2,
        "both children despite the failure",
    )
    .await;
}

#[tokio::test]
async fn test_group_resolution_and_ordering() {
    let h = harness();
    // explicit client listed first must stay first even when the group
    // also matches it
    let a = FakeClient::connect(
        &h,
        "203.0.113.10:40009",
        FakeClientConfig::named(0xe1, "web-01"),
    )
    .await
    .unwrap();
    let _b = FakeClient::connect(
        &h,
        "203.0.113.10:40010",
        FakeClientConfig::named(0xe2, "web-02"),
    )
    .await
    .unwrap();

    h.groups
        .save(&ClientGroup {
            id: "web".to_string(),
            description: String::new(),
            params: GroupParams {
                name: vec!["web-*".to_string()],
                ..Default::default()
            },
        })
        .unwrap();

    let jid = h
        .dispatcher
        .execute_multi(
            MultiDispatchRequest {
                client_ids: vec![a.client_id.clone()],
                group_ids: vec!["web".to_string()],
                execute: exec("uptime"),
                execute_concurrently: true,
                ..Default::default()
            },
            &user(),
        )
        .await
        .unwrap();

    let jobs = h.jobs.clone();
    let jid_clone = jid.clone();
    wait_for(
        move || jobs.get_by_multi_job_id(&jid_clone).unwrap().len() == 2,
        "group fan-out to both clients",
    )
    .await;

    // deduplicated: the explicit client ran exactly once
    assert_eq!(a.received_jobs.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_script_dispatch_pushes_file_first() {
    let h = harness();
    let client = FakeClient::connect(
        &h,
        "203.0.113.10:40011",
        FakeClientConfig::named(0xf1, "scripted"),
    )
    .await
    .unwrap();

    let input = ExecuteInput {
        script: Some(base64_encode(b"#!/bin/sh\necho hi\n")),
        interpreter: "/bin/sh".to_string(),
        ..Default::default()
    };
    let jid = h
        .dispatcher
        .execute_command(&client.client_id, input, &user())
        .await
        .unwrap();

    let job = h.jobs.get_by_jid(&client.client_id, &jid).unwrap().unwrap();
    assert!(job.is_script);
    assert!(job.has_shebang);
    assert_eq!(job.command, "/tmp/portgate-script.sh");
}

#[tokio::test]
async fn test_job_summaries_after_results() {
    let h = harness();
    let client = FakeClient::connect(
        &h,
        "203.0.113.10:40012",
        FakeClientConfig::named(0xf2, "listing"),
    )
    .await
    .unwrap();

    let jid = h
        .dispatcher
        .execute_command(&client.client_id, exec("uptime"), &user())
        .await
        .unwrap();

    let jobs = h.jobs.clone();
    let client_id = client.client_id.clone();
    let jid_clone = jid.clone();
    wait_for(
        move || {
            jobs.get_by_jid(&client_id, &jid_clone)
                .unwrap()
                .map(|j| j.status.is_terminal())
                .unwrap_or(false)
        },
        "result to land",
    )
    .await;

    let summaries = h
        .jobs
        .get_summaries_by_client_id(&client.client_id, &ListOptions::default())
        .unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].jid, jid);
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(data)
}
