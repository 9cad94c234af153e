//! Loading a router config from disk.

use provider_router::config::ProviderKind;
use provider_router::{Error, ProviderRouter, RouterConfig};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn write_temp(contents: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("router-{}.yaml", uuid::Uuid::new_v4()));
    std::fs::write(&path, contents).unwrap();
    path
}

const CONFIG: &str = r#"
providers:
  - id: openai
    kind: openai_compatible
    base_url: https://api.openai.com/v1
    model: gpt-4o-mini
    models: [gpt-4o-mini, gpt-4o]
    priority: 5
  - id: anthropic
    kind: anthropic
    base_url: https://api.anthropic.com/v1
    model: claude-3-5-haiku-latest
    max_context_tokens: 200000
circuit:
  failure_threshold: 5
  cooldown_secs: 30
"#;

#[test]
fn test_load_applies_env_overrides() {
    let path = write_temp(CONFIG);
    std::env::set_var("ROUTER_ATTEMPT_TIMEOUT_MS", "1500");
    let config = RouterConfig::load(&path);
    std::env::remove_var("ROUTER_ATTEMPT_TIMEOUT_MS");
    let _ = std::fs::remove_file(&path);

    let config = assert_ok!(config);
    assert_eq!(config.providers[0].kind, ProviderKind::Openai);
    assert_eq!(config.providers[0].models.len(), 2);
    assert_eq!(config.providers[1].max_context_tokens, Some(200_000));
    assert_eq!(config.attempt_timeout(), Some(Duration::from_millis(1500)));

    let policy = config.circuit.to_policy();
    assert_eq!(policy.failure_threshold, 5);
    assert_eq!(policy.cooldown, Duration::from_secs(30));
}

#[test]
fn test_missing_file_names_the_path() {
    let err = assert_err!(RouterConfig::load("/definitely/not/here.yaml"));
    match &err {
        Error::Configuration { .. } => {}
        other => panic!("expected configuration error, got {:?}", other),
    }
    assert!(err.to_string().contains("/definitely/not/here.yaml"));
}

#[tokio::test]
async fn test_router_from_config_registers_enabled_providers() {
    let config = RouterConfig::from_yaml_str(CONFIG).unwrap();
    let router = ProviderRouter::builder()
        .from_config(&config)
        .unwrap()
        .credentials(std::sync::Arc::new(
            provider_router::credentials::StaticCredentials::new().with("anthropic", "sk-x"),
        ))
        .build()
        .unwrap();

    assert_eq!(router.registry().ids(), vec!["openai", "anthropic"]);
    let caps = router.registry().capabilities("anthropic").unwrap();
    assert_eq!(caps.max_context_tokens, Some(200_000));
    // openai has no key, so only anthropic is eligible
    assert_eq!(router.preview_chain("c").await, vec!["anthropic"]);
}
