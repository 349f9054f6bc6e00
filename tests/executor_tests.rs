//! Play runner behavior: ordering, precedence, dropout, facts, overrides

mod common;

use std::time::Duration;

use ansirun::connection::CommandResult;
use ansirun::executor::FailureKind;
use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn test_tasks_run_in_order_per_host() {
    let harness = Harness::new(WEB_DB_INVENTORY);

    harness
        .run(
            r#"
- hosts: all
  tasks:
    - command: echo first
    - command: echo second
    - command: echo third
"#,
        )
        .await;

    for host in ["web1", "web2", "db1"] {
        assert_eq!(
            harness.connector.commands(host),
            vec!["echo first", "echo second", "echo third"]
        );
    }
}

#[tokio::test]
async fn test_each_task_is_a_barrier() {
    let harness = Harness::new(WEB_DB_INVENTORY);
    harness.connector.delay("echo slow", Duration::from_millis(50));

    harness
        .run(
            r#"
- hosts: all
  tasks:
    - command: echo slow
    - command: echo fast
"#,
        )
        .await;

    let timeline = harness.connector.timeline();
    let last_slow = timeline.iter().rposition(|c| c.ends_with("echo slow")).unwrap();
    let first_fast = timeline.iter().position(|c| c.ends_with("echo fast")).unwrap();
    assert!(last_slow < first_fast, "timeline: {:?}", timeline);
    assert_eq!(timeline.len(), 6);
}

#[tokio::test]
async fn test_forks_bounds_concurrency() {
    let mut harness = Harness::new(
        "[web]\nw1\nw2\nw3\nw4\nw5\nw6\n",
    );
    harness.config.forks = 2;
    harness.connector.delay("sleep", Duration::from_millis(30));

    harness
        .run(
            r#"
- hosts: web
  tasks:
    - command: sleep 1
"#,
        )
        .await;

    assert!(harness.connector.peak_concurrency() <= 2);
    assert_eq!(harness.connector.total_opens(), 6);
}

#[tokio::test]
async fn test_hosts_run_concurrently_without_forks_limit() {
    let harness = Harness::new("[web]\nw1\nw2\nw3\nw4\n");
    harness.connector.delay("sleep", Duration::from_millis(100));

    harness
        .run(
            r#"
- hosts: web
  tasks:
    - command: sleep 1
"#,
        )
        .await;

    assert!(harness.connector.peak_concurrency() > 1);
}

#[tokio::test]
async fn test_variable_precedence() {
    let mut harness = Harness::new(
        "\
[web]
web1 tier=host

[web:vars]
port=8080
tier=group
color=blue

[all:vars]
color=red
",
    );
    harness.extra_vars.insert("override".into(), json!("extra"));

    harness
        .run(
            r#"
- hosts: web
  vars:
    port: 80
    result: play
    override: play
  tasks:
    - name: capture
      command: echo hi
      register: result
    - name: show
      debug:
        msg: "{{ port }} {{ tier }} {{ color }} {{ result.stdout is defined }} {{ override }}"
"#,
        )
        .await;

    // play vars beat group vars, host vars beat group vars, a child group's
    // vars beat `all`, registered beats play vars, extra vars beat everything
    assert_eq!(
        harness.callback.messages("web1"),
        vec!["80 host blue true extra"]
    );
}

#[tokio::test]
async fn test_register_exposes_command_output() {
    let harness = Harness::single();
    harness
        .connector
        .on("uptime", CommandResult::success("up 3 days\nload 0.1\n", ""));

    harness
        .run(
            r#"
- hosts: all
  tasks:
    - command: uptime
      register: up
    - debug:
        msg: "{{ up.rc }}|{{ up.stdout_lines | length }}|{{ up.changed }}"
"#,
        )
        .await;

    assert_eq!(harness.callback.messages("h1"), vec!["0|2|true"]);
}

#[tokio::test]
async fn test_skipped_task_adds_no_notification() {
    let harness = Harness::single();

    harness
        .run(
            r#"
- hosts: all
  tasks:
    - command: touch /tmp/x
      when: false
      notify: restart
  handlers:
    - name: restart
      command: systemctl restart app
"#,
        )
        .await;

    let result = harness.callback.result("command", "h1").unwrap();
    assert!(result.skipped && !result.changed && !result.failed);
    assert!(harness.callback.handler_starts().is_empty());
    assert_eq!(harness.connector.opens("h1"), 0);
}

#[tokio::test]
async fn test_unchanged_task_does_not_notify() {
    let harness = Harness::single();

    harness
        .run(
            r#"
- hosts: all
  tasks:
    - ping:
      notify: restart
  handlers:
    - name: restart
      debug: msg=restarted
"#,
        )
        .await;

    assert!(harness.callback.handler_starts().is_empty());
}

#[tokio::test]
async fn test_loop_item_failures() {
    let harness = Harness::single();
    harness
        .connector
        .on("check 2", CommandResult::failure(1, "", "bad item"));

    let stats = harness
        .run(
            r#"
- hosts: all
  tasks:
    - name: tolerant
      command: "check {{ item }}"
      loop: [1, 2, 3]
      ignore_errors: true
    - name: strict
      command: "check {{ item }}"
      loop: [1, 2, 3]
"#,
        )
        .await;

    let tolerant = harness.callback.result("tolerant", "h1").unwrap();
    assert!(!tolerant.failed);
    let items = tolerant.iteration_results.unwrap();
    assert_eq!(items.len(), 3);
    assert!(items[1].failed && items[1].ignored);
    assert!(!items[2].failed);

    // every item still runs, but the aggregate fails
    let strict = harness.callback.result("strict", "h1").unwrap();
    assert!(strict.failed);
    assert_eq!(strict.iteration_results.unwrap().len(), 3);

    assert_eq!(
        harness.connector.commands("h1"),
        vec!["check 1", "check 2", "check 3", "check 1", "check 2", "check 3"]
    );
    assert_eq!(stats.get("h1").unwrap().failed, 2);
}

#[tokio::test]
async fn test_loop_control() {
    let harness = Harness::single();

    harness
        .run(
            r#"
- hosts: all
  tasks:
    - name: users
      debug:
        msg: "{{ idx }}:{{ user.name }}"
      loop:
        - { name: alice, uid: 1001 }
        - { name: bob, uid: 1002 }
      loop_control:
        loop_var: user
        index_var: idx
        label: "{{ user.name }}"
      register: out
    - debug:
        msg: "{{ out.results | map(attribute='msg') | join(',') }}"
"#,
        )
        .await;

    let users = harness.callback.result("users", "h1").unwrap();
    let labels: Vec<_> = users
        .iteration_results
        .unwrap()
        .into_iter()
        .map(|r| r.label.unwrap())
        .collect();
    assert_eq!(labels, vec!["alice", "bob"]);
    assert_eq!(
        harness.callback.messages("h1"),
        vec!["0:alice", "1:bob", "0:alice,1:bob"]
    );
}

#[tokio::test]
async fn test_loop_over_expression() {
    let harness = Harness::single();

    harness
        .run(
            r#"
- hosts: all
  vars:
    packages: [nginx, redis]
  tasks:
    - command: "install {{ item }}"
      loop: "{{ packages }}"
    - debug: msg=never
      loop: []
"#,
        )
        .await;

    assert_eq!(
        harness.connector.commands("h1"),
        vec!["install nginx", "install redis"]
    );
    let empty = harness.callback.result("debug", "h1").unwrap();
    assert!(empty.skipped);
}

#[tokio::test]
async fn test_failed_host_drops_out_but_stays_in_recap() {
    let harness = Harness::new(WEB_DB_INVENTORY);
    harness
        .connector
        .on_host("web2", "deploy", CommandResult::failure(2, "", "disk full"));

    let stats = harness
        .run(
            r#"
- hosts: all
  tasks:
    - name: deploy
      command: deploy
    - name: verify
      command: verify
"#,
        )
        .await;

    assert_eq!(
        harness.callback.task_hosts("verify"),
        Some(vec!["web1".to_string(), "db1".to_string()])
    );
    assert_eq!(harness.connector.commands("web2"), vec!["deploy"]);

    let web2 = stats.get("web2").unwrap();
    assert_eq!((web2.ok, web2.failed), (0, 1));
    assert_eq!(stats.failed_hosts(), vec!["web2"]);
    assert_eq!(stats.get("db1").unwrap().ok, 2);

    let failure = harness.callback.result("deploy", "web2").unwrap();
    assert_eq!(failure.failure, Some(FailureKind::ModuleFailed));
    assert_eq!(failure.data["stderr"], json!("disk full"));
}

#[tokio::test]
async fn test_unreachable_host() {
    let harness = Harness::new(WEB_DB_INVENTORY);
    harness.connector.unreachable("db1");

    let stats = harness
        .run(
            r#"
- hosts: all
  tasks:
    - ping:
    - name: local only
      debug: msg=still here
"#,
        )
        .await;

    let result = harness.callback.result("ping", "db1").unwrap();
    assert!(result.unreachable);
    assert_eq!(result.failure, Some(FailureKind::Unreachable));
    assert!(harness.callback.result("local only", "db1").is_none());

    let db1 = stats.get("db1").unwrap();
    assert_eq!((db1.unreachable, db1.failed), (1, 0));
    assert!(!stats.is_success());
}

#[tokio::test]
async fn test_ignore_errors_does_not_cover_unreachable() {
    let harness = Harness::single();
    harness.connector.unreachable("h1");

    let stats = harness
        .run(
            r#"
- hosts: all
  tasks:
    - ping:
      ignore_errors: true
    - debug: msg=after
"#,
        )
        .await;

    assert!(harness.callback.messages("h1").is_empty());
    assert_eq!(stats.get("h1").unwrap().unreachable, 1);
}

#[tokio::test]
async fn test_facts_visible_to_later_tasks() {
    let harness = Harness::single();
    harness.connector.on(
        "uname -s",
        CommandResult::success(
            "system=Linux\narchitecture=x86_64\nkernel=6.1.0\nnodename=h1\nhostname=h1\nfqdn=h1.example.com\n--- os-release ---\nID=debian\nVERSION_ID=\"12\"\n",
            "",
        ),
    );

    harness
        .run(
            r#"
- hosts: all
  gather_facts: true
  tasks:
    - set_fact:
        role_name: web
    - debug:
        msg: "{{ ansible_system }} {{ ansible_hostname }} {{ role_name }}"
"#,
        )
        .await;

    assert_eq!(harness.callback.task_starts()[0], "Gathering Facts");
    assert_eq!(harness.callback.messages("h1"), vec!["Linux h1 web"]);
}

#[tokio::test]
async fn test_facts_and_registers_carry_across_plays() {
    let harness = Harness::single();

    harness
        .run(
            r#"
- hosts: all
  tasks:
    - set_fact:
        token: abc
    - command: echo hi
      register: first
- hosts: all
  tasks:
    - debug:
        msg: "{{ token }} {{ first.rc }}"
"#,
        )
        .await;

    assert_eq!(harness.callback.messages("h1"), vec!["abc 0"]);
}

#[tokio::test]
async fn test_registers_dropped_between_plays_when_not_carried() {
    let mut harness = Harness::single();
    harness.config.carry_registered_vars = false;

    harness
        .run(
            r#"
- hosts: all
  tasks:
    - set_fact:
        token: abc
- hosts: all
  tasks:
    - debug:
        msg: "{{ token | default('gone') }}"
"#,
        )
        .await;

    assert_eq!(harness.callback.messages("h1"), vec!["gone"]);
}

#[tokio::test]
async fn test_changed_when_and_failed_when() {
    let harness = Harness::single();
    harness
        .connector
        .on("grep", CommandResult::failure(1, "", ""))
        .on("status", CommandResult::success("ERROR: degraded", ""));

    let stats = harness
        .run(
            r#"
- hosts: all
  tasks:
    - name: search
      command: grep -q foo /etc/app.conf
      register: found
      changed_when: false
      failed_when: found.rc > 1
    - name: status
      command: status
      failed_when: "'ERROR' in stdout"
"#,
        )
        .await;

    let search = harness.callback.result("search", "h1").unwrap();
    assert!(!search.changed);
    assert!(!search.failed);

    let status = harness.callback.result("status", "h1").unwrap();
    assert!(status.failed);
    assert_eq!(status.message, "Failed as requested from task");
    assert_eq!(stats.get("h1").unwrap().failed, 1);
}

#[tokio::test]
async fn test_template_error_fails_host() {
    let harness = Harness::single();

    let stats = harness
        .run(
            r#"
- hosts: all
  tasks:
    - name: broken
      debug:
        msg: "{{ missing_var }}"
    - debug: msg=after
"#,
        )
        .await;

    let result = harness.callback.result("broken", "h1").unwrap();
    assert_eq!(result.failure, Some(FailureKind::TemplateError));
    assert!(result.message.contains("missing_var"), "{}", result.message);
    assert!(harness.callback.messages("h1").is_empty());
    assert_eq!(stats.get("h1").unwrap().failed, 1);
}

#[tokio::test]
async fn test_missing_required_argument_is_config_error() {
    let harness = Harness::single();

    harness
        .run(
            r#"
- hosts: all
  tasks:
    - copy:
        content: x
"#,
        )
        .await;

    let result = harness.callback.result("copy", "h1").unwrap();
    assert_eq!(result.failure, Some(FailureKind::ConfigError));
}

#[tokio::test]
async fn test_task_timeout() {
    let mut harness = Harness::new("[web]\nfast\nstuck\n");
    harness.config.task_timeout = 1;
    // rules are first-match: `fast` answers at once, `stuck` hangs
    harness
        .connector
        .on_host("fast", "work", CommandResult::success("", ""));
    harness.connector.delay("work", Duration::from_secs(5));

    let stats = harness
        .run(
            r#"
- hosts: web
  tasks:
    - command: work
"#,
        )
        .await;

    let stuck = harness.callback.result("command", "stuck").unwrap();
    assert!(stuck.unreachable);
    assert_eq!(stuck.failure, Some(FailureKind::Timeout));
    assert_eq!(stuck.message, "Task timed out after 1 seconds");
    assert_eq!(stats.get("stuck").unwrap().unreachable, 1);
    assert!(stats.get("fast").unwrap().is_success());
    // both channels are closed, the timed out one included
    assert_eq!(harness.connector.closes(), 2);
}

#[tokio::test]
async fn test_become_precedence() {
    let harness = Harness::new(
        "web1 ansible_become=true ansible_become_user=deploy\n",
    );

    harness
        .run(
            r#"
- hosts: all
  become: true
  become_user: admin
  tasks:
    - name: play level
      command: id -u
    - name: task level
      command: id -u
      become_user: postgres
      become_method: su
    - name: disabled
      command: id -u
      become: false
    - name: in block
      block:
        - command: id -u
      become_user: www
"#,
        )
        .await;

    let executed = harness.connector.executed("web1");
    let wrapped: Vec<&str> = executed.iter().map(|c| c.wrapped.as_str()).collect();
    assert_eq!(
        wrapped,
        vec![
            "sudo -n -u admin sh -c 'id -u'",
            "su - postgres -c 'id -u'",
            "id -u",
            "sudo -n -u www sh -c 'id -u'",
        ]
    );
}

#[tokio::test]
async fn test_unsupported_become_method() {
    let harness = Harness::single();

    harness
        .run(
            r#"
- hosts: all
  tasks:
    - command: id
      become: true
      become_method: doas
"#,
        )
        .await;

    let result = harness.callback.result("command", "h1").unwrap();
    assert_eq!(result.failure, Some(FailureKind::ConfigError));
    assert_eq!(harness.connector.opens("h1"), 0);
}

#[tokio::test]
async fn test_no_hosts_matched_aborts() {
    let harness = Harness::single();
    let result = harness
        .try_run(
            r#"
- hosts: nowhere
  tasks:
    - ping:
"#,
        )
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_hosts_pattern_is_templated() {
    let harness = Harness::new(WEB_DB_INVENTORY);

    harness
        .run(
            r#"
- hosts: "{{ target }}"
  vars:
    target: db
  tasks:
    - ping:
"#,
        )
        .await;

    assert_eq!(harness.callback.task_hosts("ping"), Some(vec!["db1".to_string()]));
}

#[tokio::test]
async fn test_hostvars_and_groups() {
    let harness = Harness::new(WEB_DB_INVENTORY);

    harness
        .run(
            r#"
- hosts: web1
  tasks:
    - debug:
        msg: "{{ hostvars['db1']['ansible_host'] }} {{ groups['web'] | join(',') }} {{ inventory_hostname }} {{ group_names | join(',') }}"
"#,
        )
        .await;

    assert_eq!(
        harness.callback.messages("web1"),
        vec!["10.0.0.3 web1,web2 web1 web"]
    );
}

#[tokio::test]
async fn test_copy_and_template_from_playbook_dir() {
    let harness = Harness::single();
    harness.write("files/motd", "welcome\n");
    harness.write("templates/app.conf.j2", "port={{ port }}\n");

    harness
        .run(
            r#"
- hosts: all
  vars:
    port: 8080
  tasks:
    - copy:
        src: motd
        dest: /etc/motd
    - template:
        src: app.conf.j2
        dest: /etc/app.conf
"#,
        )
        .await;

    assert_eq!(harness.connector.file("h1", "/etc/motd").as_deref(), Some("welcome\n"));
    assert_eq!(
        harness.connector.file("h1", "/etc/app.conf").as_deref(),
        Some("port=8080\n")
    );
}

#[tokio::test]
async fn test_debug_var() {
    let harness = Harness::single();

    harness
        .run(
            r#"
- hosts: all
  vars:
    app: { name: shop, port: 80 }
  tasks:
    - debug: var=app.port
    - debug: var=nope
"#,
        )
        .await;

    assert_eq!(
        harness.callback.messages("h1"),
        vec!["app.port: 80", "nope: VARIABLE IS NOT DEFINED!"]
    );
}

#[tokio::test]
async fn test_ignored_failure_is_not_registered() {
    let harness = Harness::single();
    harness
        .connector
        .on("/bin/false", CommandResult::failure(1, "", "nope"));

    let stats = harness
        .run(
            r#"
- hosts: all
  tasks:
    - name: check the service
      command: /bin/false
      register: r
      ignore_errors: true
    - debug: msg="defined={{ r is defined }}"
"#,
        )
        .await;

    assert!(harness.callback.result("check the service", "h1").unwrap().ignored);
    assert_eq!(harness.callback.messages("h1"), vec!["defined=false"]);
    assert_eq!(stats.get("h1").unwrap().ignored, 1);
}

#[tokio::test]
async fn test_free_form_message_keeps_every_word() {
    let harness = Harness::single();

    harness
        .run(
            r#"
- hosts: all
  tasks:
    - debug: msg=hello world
    - debug: msg="quoted {{ 1 + 1 }}"
"#,
        )
        .await;

    assert_eq!(harness.callback.messages("h1"), vec!["hello world", "quoted 2"]);
}
