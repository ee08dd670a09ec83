use std::io::Write;

use switchyard_core::config::{PauseQueuePolicy, RoutePolicy, SwitchyardConfig};
use switchyard_core::error::SwitchyardError;
use switchyard_core::types::Scope;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(content.as_bytes()).expect("write toml");
    tmp
}

#[test]
fn test_load_full_config_from_file() {
    let tmp = write_config(
        r#"
[runtime]
completion_topic = "done"
route_policy = "first_match"
pause_queue = "all"
completion_timeout_secs = 30
event_capacity = 64
max_hops = 8

[[steps]]
name = "deserialize"
description = "Parse JSON text"
inputs = { text = "string" }
outputs = { value = "any" }

[[agents]]
topic = "validate-query"
description = "Checks the user's question"
route_policy = "fan_out"

[[agents.steps]]
step_type = "constant"
name = "fake-model"
outputs = { value = { key = "validation_raw_json", scope = "step" } }
config = { value = '{"is_valid": false, "reason": "math error"}' }

[[agents.steps]]
step_type = "deserialize"
inputs = { text = "validation_raw_json" }
outputs = { value = "validation_result" }

[[agents.routes]]
condition = "validation_result.is_valid = true"
receivers = ["answer-query"]

[[agents.routes]]
condition = "validation_result.is_valid = false"
receivers = ["done"]
transform = "{ response: validation_result.reason }"
"#,
    );

    let config = SwitchyardConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.runtime.completion_topic, "done");
    assert_eq!(config.runtime.route_policy, RoutePolicy::FirstMatch);
    assert_eq!(config.runtime.pause_queue, PauseQueuePolicy::All);
    assert_eq!(config.runtime.completion_timeout_secs, 30);
    assert_eq!(config.runtime.event_capacity, 64);
    assert_eq!(config.runtime.max_hops, 8);
    assert_eq!(config.steps.len(), 1);
    assert_eq!(config.steps[0].inputs.get("text").map(String::as_str), Some("string"));

    let agent = config.agent("validate-query").expect("agent present");
    assert_eq!(agent.route_policy, Some(RoutePolicy::FanOut));
    assert_eq!(agent.steps.len(), 2);
    assert_eq!(agent.steps[0].display_name(), "fake-model");
    let raw = &agent.steps[0].outputs["value"];
    assert_eq!(raw.key, "validation_raw_json");
    assert_eq!(raw.scope, Scope::Step);
    let parsed = &agent.steps[1].outputs["value"];
    assert_eq!(parsed.scope, Scope::Agent);
    assert_eq!(agent.routes.len(), 2);
    assert_eq!(agent.routes[1].receivers, vec!["done"]);
    assert!(agent.routes[1].transform.is_some());
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("SWITCHYARD_TEST_DONE_TOPIC", "finished");

    let tmp = write_config(
        r#"
[runtime]
completion_topic = "${SWITCHYARD_TEST_DONE_TOPIC}"

[[agents]]
topic = "${SWITCHYARD_TEST_UNSET_VAR}"
"#,
    );

    let config = SwitchyardConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.runtime.completion_topic, "finished");
    // unknown variables are kept verbatim
    assert_eq!(config.agents[0].topic, "${SWITCHYARD_TEST_UNSET_VAR}");

    std::env::remove_var("SWITCHYARD_TEST_DONE_TOPIC");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let tmp = write_config(
        r#"
[[agents]]
topic = "echo"

[[agents.routes]]
condition = "true"
receivers = ["workflow-completion"]
"#,
    );

    let config = SwitchyardConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.runtime.completion_topic, "workflow-completion");
    assert_eq!(config.runtime.route_policy, RoutePolicy::FanOut);
    assert_eq!(config.runtime.pause_queue, PauseQueuePolicy::Latest);
    assert_eq!(config.runtime.completion_timeout_secs, 300);
    assert_eq!(config.runtime.event_capacity, 256);
    assert_eq!(config.runtime.max_hops, 64);
    assert!(config.steps.is_empty());

    let agent = config.agent("echo").expect("agent present");
    assert!(agent.steps.is_empty());
    assert!(agent.route_policy.is_none());
    assert!(agent.routes[0].transform.is_none());
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = SwitchyardConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, SwitchyardError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_scope_is_rejected() {
    let tmp = write_config(
        r#"
[[agents]]
topic = "a"

[[agents.steps]]
step_type = "passthrough"
outputs = { value = { key = "x", scope = "global" } }
"#,
    );

    let err = SwitchyardConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, SwitchyardError::Config(_)));
}

#[test]
fn test_loaded_config_builds_a_runtime() {
    let tmp = write_config(
        r#"
[[agents]]
topic = "start"

[[agents.routes]]
condition = "true"
receivers = ["workflow-completion"]
"#,
    );
    let config = SwitchyardConfig::load(tmp.path()).expect("load config");
    let runtime = switchyard_agent::Runtime::from_config(&config).expect("build runtime");
    assert_eq!(runtime.topics(), vec!["start"]);
}
