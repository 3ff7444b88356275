use orkestra_orchestrator::OrchestratorConfig;
use std::path::Path;
use tracing::info;

/// Parse an `orkestra.toml` document. Missing sections take their defaults.
pub fn parse_config(raw: &str) -> anyhow::Result<OrchestratorConfig> {
    let config: OrchestratorConfig = toml::from_str(raw)?;
    // Surface a bad strategy name here rather than at session start.
    config
        .cluster
        .strategy
        .parse::<orkestra_orchestrator::BalancingStrategy>()
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(config)
}

/// Load the config file, falling back to defaults when it does not exist.
///
/// A relative ledger path is resolved against the config file's directory.
pub async fn load_config(path: &Path) -> anyhow::Result<OrchestratorConfig> {
    let mut config = match tokio::fs::read_to_string(path).await {
        Ok(raw) => parse_config(&raw).map_err(|e| {
            anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e)
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "config file not found, using defaults");
            return Ok(OrchestratorConfig::default());
        }
        Err(e) => {
            return Err(anyhow::anyhow!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        }
    };

    if config.ledger.path.is_relative() {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            config.ledger.path = dir.join(&config.ledger.path);
        }
    }
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use orkestra_core::TaskType;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.engine.max_concurrency, 4);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert!(config.cluster.workers.is_empty());
        assert!(config.sandbox.allow_dry_run);
    }

    #[test]
    fn test_full_config() {
        let raw = r#"
[engine]
max_concurrency = 8
run_timeout_ms = 120000

[retry]
circuit_threshold = 3

[sandbox]
image = "registry.local/sandbox:1"
allow_dry_run = false

[ledger]
path = "/var/log/orkestra/ledger.jsonl"

[cluster]
strategy = "round_robin"

[[cluster.workers]]
id = "builder-1"
capabilities = ["CODE", "TEST"]
max_concurrency = 2

[[cluster.workers]]
id = "auditor-1"
capabilities = ["AUDIT"]

[cluster.failover]
dispatch_timeout_ms = 5000
"#;
        let config = parse_config(raw).unwrap();
        assert_eq!(config.engine.max_concurrency, 8);
        assert_eq!(config.engine.tick_interval_ms, 50);
        assert_eq!(config.retry.circuit_threshold, 3);
        assert!(!config.sandbox.allow_dry_run);
        assert_eq!(config.cluster.workers.len(), 2);
        assert_eq!(config.cluster.workers[1].max_concurrency, 1);
        assert_eq!(
            config.cluster.workers[0].capabilities,
            vec![TaskType::Code, TaskType::Test]
        );
        assert_eq!(config.cluster.failover.dispatch_timeout_ms, 5000);
        assert_eq!(config.cluster.failover.max_failover_attempts, 3);
    }

    #[test]
    fn test_demo_config_parses() {
        let config = parse_config(include_str!("../../../demos/orkestra.toml")).unwrap();
        assert_eq!(config.cluster.workers.len(), 3);
        assert_eq!(config.sandbox.runtime_binary, "docker");
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let err = parse_config("[cluster]\nstrategy = \"fastest\"\n").unwrap_err();
        assert!(err.to_string().contains("fastest"));
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.ledger.agent_id, "orchestrator");
    }

    #[tokio::test]
    async fn test_relative_ledger_path_follows_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orkestra.toml");
        tokio::fs::write(&path, "[ledger]\npath = \"audit/ledger.jsonl\"\n")
            .await
            .unwrap();
        let config = load_config(&path).await.unwrap();
        assert_eq!(config.ledger.path, dir.path().join("audit/ledger.jsonl"));
    }
}
