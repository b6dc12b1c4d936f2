//! Shared helpers for bridge integration tests

use std::path::PathBuf;
use std::time::Duration;
use storyrun_common::StoryrunConfig;
use tempfile::TempDir;

/// Child that signals ready and echoes every received line back as an event
pub const ECHO_CHILD: &str = r#"
echo '{"type":"ready"}'
while read -r line; do
  printf '{"type":"echo","args":[%s]}\n' "$line"
done
"#;

/// Config running `body` with `sh` as the runner process
pub fn script_config(dir: &TempDir, body: &str) -> StoryrunConfig {
    let script = dir.path().join("runner.sh");
    std::fs::write(&script, body).unwrap();

    let mut config = StoryrunConfig::default();
    config.bridge.runner_binary = Some(PathBuf::from("/bin/sh"));
    config.bridge.runner_args = vec![script.to_string_lossy().into_owned()];
    config.bridge.startup_timeout_secs = 5;
    config
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}
