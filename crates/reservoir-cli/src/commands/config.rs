//! `reservoir config check`: load a pool configuration, apply the same
//! normalization the pool does and print the result.

use std::path::Path;

use anyhow::{Context, Result};
use reservoir::PoolConfig;

/// Load and normalize `path`, then print it as JSON with the password masked.
pub fn check(path: &Path) -> Result<()> {
    let report = render(path)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn render(path: &Path) -> Result<serde_json::Value> {
    let config = PoolConfig::from_file(path)
        .with_context(|| format!("failed to load pool config from {}", path.display()))?
        .normalized();

    Ok(serde_json::json!({
        "file": path.display().to_string(),
        "sweeper_enabled": config.is_sweeper_enabled(),
        "config": config.redacted(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_masks_password_and_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.toml");
        std::fs::write(
            &path,
            r#"
name = "orders"
max_active = 4
initial_size = 9

[connect]
url = "sim://orders"
password = "hunter2"
"#,
        )
        .unwrap();

        let report = render(&path).unwrap();
        assert_eq!(report["config"]["name"], "orders");
        assert_eq!(report["config"]["initial_size"], 4);
        assert!(!report.to_string().contains("hunter2"));
    }

    #[test]
    fn render_reports_missing_file() {
        let err = render(Path::new("/nonexistent/pool.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to load pool config"));
    }
}
