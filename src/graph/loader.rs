use crate::dsl::Process;
use anyhow::{Context as AnyhowContext, Result};
use std::fs;

pub fn load_process_from_yaml(file_path: &str) -> Result<Process> {
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read YAML file from {}", file_path))?;

    let process: Process = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize YAML content from {}", file_path))?;

    Ok(process)
}
