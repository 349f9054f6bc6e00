//! block / rescue / always

mod common;

use ansirun::connection::CommandResult;
use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;

fn failing(harness: &Harness) {
    harness
        .connector
        .on("/bin/false", CommandResult::failure(1, "", "false failed"));
}

#[tokio::test]
async fn test_block_success_skips_rescue() {
    let harness = Harness::single();

    let stats = harness
        .run(
            r#"
- hosts: all
  tasks:
    - block:
        - debug: msg=one
        - debug: msg=two
      rescue:
        - debug: msg=rescue
      always:
        - debug: msg=always
"#,
        )
        .await;

    assert_eq!(harness.callback.messages("h1"), vec!["one", "two", "always"]);
    let s = stats.get("h1").unwrap();
    assert_eq!((s.ok, s.rescued, s.failed), (3, 0, 0));
}

#[tokio::test]
async fn test_block_stops_at_first_failure() {
    let harness = Harness::single();
    failing(&harness);

    harness
        .run(
            r#"
- hosts: all
  tasks:
    - block:
        - command: /bin/false
        - debug: msg=unreached
      rescue:
        - debug:
            msg: "rescuing {{ ansible_failed_task.name }}: {{ ansible_failed_result.stderr }}"
"#,
        )
        .await;

    assert_eq!(
        harness.callback.messages("h1"),
        vec!["rescuing command: false failed"]
    );
}

#[tokio::test]
async fn test_failed_rescue_fails_host() {
    let harness = Harness::single();
    failing(&harness);

    let stats = harness
        .run(
            r#"
- hosts: all
  tasks:
    - block:
        - command: /bin/false
      rescue:
        - fail:
            msg: cannot recover
      always:
        - debug: msg=cleanup
    - debug: msg=next task
"#,
        )
        .await;

    assert_eq!(harness.callback.messages("h1"), vec!["cleanup"]);
    let s = stats.get("h1").unwrap();
    assert_eq!((s.failed, s.rescued), (1, 0));
}

#[tokio::test]
async fn test_always_runs_without_rescue() {
    let harness = Harness::new("[web]\nweb1\nweb2\n");
    harness
        .connector
        .on_host("web2", "migrate", CommandResult::failure(1, "", ""));

    let stats = harness
        .run(
            r#"
- hosts: web
  tasks:
    - block:
        - command: migrate
      always:
        - debug: msg=always
    - debug: msg=after
"#,
        )
        .await;

    assert_eq!(harness.callback.messages("web1"), vec!["always", "after"]);
    assert_eq!(harness.callback.messages("web2"), vec!["always"]);
    assert_eq!(stats.get("web2").unwrap().failed, 1);
}

#[tokio::test]
async fn test_always_failure_fails_host() {
    let harness = Harness::single();
    failing(&harness);

    let stats = harness
        .run(
            r#"
- hosts: all
  tasks:
    - block:
        - debug: msg=fine
      always:
        - command: /bin/false
    - debug: msg=never
"#,
        )
        .await;

    assert_eq!(harness.callback.messages("h1"), vec!["fine"]);
    assert_eq!(stats.get("h1").unwrap().failed, 1);
}

#[tokio::test]
async fn test_block_when_evaluated_once() {
    let harness = Harness::single();

    let stats = harness
        .run(
            r#"
- hosts: all
  vars:
    enabled: false
  tasks:
    - name: optional
      block:
        - debug: msg=inside
      when: enabled
    - debug: msg=outside
"#,
        )
        .await;

    assert_eq!(harness.callback.messages("h1"), vec!["outside"]);
    assert_eq!(stats.get("h1").unwrap().skipped, 1);
}

#[tokio::test]
async fn test_skipped_block_is_reported() {
    let harness = Harness::new("[web]\nweb1 enabled=true\nweb2 enabled=false\n");

    let stats = harness
        .run(
            r#"
- hosts: web
  tasks:
    - name: optional
      block:
        - debug: msg=inside
      when: enabled
"#,
        )
        .await;

    assert_eq!(harness.callback.messages("web1"), vec!["inside"]);
    assert!(harness.callback.messages("web2").is_empty());

    let skipped = harness.callback.result("optional", "web2").unwrap();
    assert!(skipped.skipped);
    assert!(harness.callback.result("optional", "web1").is_none());
    assert_eq!(stats.get("web2").unwrap().skipped, 1);
}

#[tokio::test]
async fn test_block_inherits_ignore_errors() {
    let harness = Harness::single();
    failing(&harness);

    let stats = harness
        .run(
            r#"
- hosts: all
  tasks:
    - block:
        - command: /bin/false
        - debug: msg=continued
      ignore_errors: true
"#,
        )
        .await;

    assert_eq!(harness.callback.messages("h1"), vec!["continued"]);
    assert_eq!(stats.get("h1").unwrap().ignored, 1);
}

#[tokio::test]
async fn test_nested_block_failure_reaches_outer_rescue() {
    let harness = Harness::single();
    failing(&harness);

    let stats = harness
        .run(
            r#"
- hosts: all
  tasks:
    - name: outer
      block:
        - name: inner
          block:
            - command: /bin/false
          always:
            - debug: msg=inner always
      rescue:
        - debug: msg=outer rescue
"#,
        )
        .await;

    assert_eq!(
        harness.callback.messages("h1"),
        vec!["inner always", "outer rescue"]
    );
    let s = stats.get("h1").unwrap();
    assert_eq!((s.failed, s.rescued), (0, 1));
}

#[tokio::test]
async fn test_unreachable_host_is_not_rescued() {
    let harness = Harness::single();
    harness.connector.unreachable("h1");

    let stats = harness
        .run(
            r#"
- hosts: all
  tasks:
    - block:
        - ping:
      rescue:
        - debug: msg=rescue
      always:
        - debug: msg=always
"#,
        )
        .await;

    assert!(harness.callback.messages("h1").is_empty());
    assert_eq!(stats.get("h1").unwrap().unreachable, 1);
}

#[tokio::test]
async fn test_rescue_sees_failed_result() {
    let harness = Harness::single();

    harness
        .run(
            r#"
- hosts: all
  tasks:
    - block:
        - name: explode
          fail:
            msg: kaboom
      rescue:
        - set_fact:
            reason: "{{ ansible_failed_result.msg }}"
    - debug:
        var: reason
"#,
        )
        .await;

    let show = harness.callback.result("debug", "h1").unwrap();
    assert_eq!(show.data["reason"], json!("kaboom"));
}
