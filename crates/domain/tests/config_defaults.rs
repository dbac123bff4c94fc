use tiller_domain::config::Config;

#[test]
fn default_host_is_localhost() {
    let config = Config::default();
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.port, 3900);
}

#[test]
fn engine_defaults() {
    let config = Config::default();
    assert_eq!(config.engine.max_turns, 10);
    assert_eq!(config.engine.model_timeout_secs, 30);
    assert_eq!(config.engine.cancel_grace_ms, 500);
    assert_eq!(config.engine.event_buffer, 256);
    assert!(config.engine.tool_timeout_secs.is_none());
}

#[test]
fn partial_toml_fills_defaults() {
    let toml_str = r#"
[server]
port = 4000

[engine]
max_turns = 3
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.server.port, 4000);
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.engine.max_turns, 3);
    assert_eq!(config.engine.cancel_grace_ms, 500);
}

#[test]
fn agents_table_parses() {
    let toml_str = r#"
[agents.helper]
instructions = "Be helpful."
tools = ["clock", "http.get"]
max_turns = 5
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    let helper = config.agents.get("helper").unwrap();
    assert_eq!(helper.instructions, "Be helpful.");
    assert_eq!(helper.tools, vec!["clock", "http.get"]);
    assert_eq!(helper.max_turns, Some(5));
}

#[test]
fn memory_auto_store_defaults_true() {
    let config = Config::default();
    assert!(config.memory.auto_store);
    assert!(config.memory.max_messages.is_none());
}
