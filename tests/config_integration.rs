use actionflow::config::AppConfig;
use serial_test::serial;
use std::env;
use std::io::Write;

// Helper to clear environment variables that might interfere with tests
fn clear_env_vars() {
    unsafe {
        env::remove_var("ACTIONFLOW_SERVER__PORT");
        env::remove_var("ACTIONFLOW_BUS__IGNORE_OWN_ORIGIN");
        env::remove_var("CONFIG_FILE");
        env::remove_var("PORT");
        env::remove_var("SERIALIZE_DISPATCH");
        env::remove_var("AUTO_ENROLL_TEAM_MEMBERS");
    }
}

#[test]
#[serial]
fn test_default_config() {
    clear_env_vars();

    let config = AppConfig::load_from_args(["actionflow"]).expect("defaults should load");
    assert_eq!(config.server.port, 3000);
    assert_eq!(config.dispatch.attempts, 3);
    assert_eq!(config.bus.local_dedup_ms, 250);
}

#[test]
#[serial]
fn test_env_override() {
    clear_env_vars();
    unsafe {
        env::set_var("ACTIONFLOW_SERVER__PORT", "9090");
        env::set_var("ACTIONFLOW_BUS__IGNORE_OWN_ORIGIN", "true");
    }

    let config = AppConfig::load_from_args(["actionflow"]).expect("Failed to load config");
    assert_eq!(config.server.port, 9090);
    assert!(config.bus.ignore_own_origin);

    clear_env_vars();
}

#[test]
#[serial]
fn test_file_load() {
    clear_env_vars();

    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    write!(
        file,
        r#"
server:
  port: 7070
dispatch:
  attempts: 5
seed:
  users:
    - subject: alice
      timezone: Europe/Paris
"#
    )
    .unwrap();

    let path = file.path().to_str().unwrap().to_string();
    let config = AppConfig::load_from_args(["actionflow", "--config", path.as_str()])
        .expect("Failed to load config from file");
    assert_eq!(config.server.port, 7070);
    assert_eq!(config.dispatch.attempts, 5);
    assert_eq!(config.seed.users.len(), 1);
    assert_eq!(config.seed.users[0].timezone.as_deref(), Some("Europe/Paris"));
    // Untouched sections keep their defaults.
    assert_eq!(config.tokens.base_ttl_secs, 900);
}

#[test]
#[serial]
fn test_cli_flags_win_over_env() {
    clear_env_vars();
    unsafe {
        env::set_var("ACTIONFLOW_SERVER__PORT", "9090");
    }

    let config = AppConfig::load_from_args([
        "actionflow",
        "--port",
        "8181",
        "--serialize-dispatch",
        "true",
        "--auto-enroll-team-members",
        "false",
    ])
    .unwrap();
    assert_eq!(config.server.port, 8181);
    assert!(config.dispatch.serialize_per_run);
    assert!(!config.policy.auto_enroll_team_members);

    clear_env_vars();
}

#[test]
#[serial]
fn test_missing_config_file_is_an_error() {
    clear_env_vars();
    let result = AppConfig::load_from_args(["actionflow", "--config", "/nonexistent/actionflow.yaml"]);
    assert!(result.is_err());
}
