//! Environment layering for configuration
//!
//! Lives in its own test binary: it mutates the process environment.

use std::time::Duration;

use depguard::config::Config;
use pretty_assertions::assert_eq;

#[test]
fn test_environment_overrides_file_and_env_files_feed_secrets() {
    let dir = tempfile::tempdir().unwrap();

    let overrides = dir.path().join("overrides.env");
    std::fs::write(
        &overrides,
        "DEPGUARD_SERVER__PORT=9300\nDEPGUARD_AUTH__CACHE_TTL=90s\n",
    )
    .unwrap();
    dotenvy::from_path(&overrides).unwrap();

    let secrets = dir.path().join("secrets.env");
    std::fs::write(&secrets, "DEPGUARD_TEST_CACHE_PASSWORD=p@ss\n").unwrap();

    let path = dir.path().join("depguard.yaml");
    std::fs::write(
        &path,
        format!(
            r"
server:
  port: 9100
env_files:
  - {}
dependencies:
  cache:
    kind: redis
    host: cache.example.internal
    credential: env:DEPGUARD_TEST_CACHE_PASSWORD
    tls_enabled: true
",
            secrets.display()
        ),
    )
    .unwrap();

    let config = Config::load_validated(Some(&path)).unwrap();
    assert_eq!(config.server.port, 9300);
    assert_eq!(config.auth.cache_ttl, Duration::from_secs(90));

    let targets = config.connection_targets().unwrap();
    assert_eq!(
        targets["cache"].connection_string(),
        "rediss://:p%40ss@cache.example.internal:6379"
    );
    assert_eq!(targets["cache"].redacted(), "rediss://:***@cache.example.internal:6379");
}
