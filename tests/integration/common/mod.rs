// Shared helpers for the integration tests. Each [[test]] target pulls
// in the subset it needs.
#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
};

use notifyg::retry::RetryPolicy;

/// Parses a retry script from literal tokens.
pub fn policy(tokens: &[&str]) -> RetryPolicy {
    let raw: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
    RetryPolicy::parse(&raw).expect("test policy should parse")
}

/// Writes a minimal daemon configuration with one contact and one mock
/// provider, pointing at `queuedir`.
pub fn write_config(dir: &Path, queuedir: &Path, retry: &str) -> PathBuf {
    let config_path = dir.join("notifyg.yaml");
    fs::write(
        &config_path,
        format!(
            r#"general:
  queuedir: {}
  retry: [{retry}]
  notify: signal
contacts:
  alice:
    phone: "+491701234567"
providers:
  mock1:
    driver: mock
    failtype: success
    duration: 0
"#,
            queuedir.display()
        ),
    )
    .expect("failed to write config");
    config_path
}
