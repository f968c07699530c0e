use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::dsl::JobDef;

pub fn load_job_from_yaml(file_path: impl AsRef<Path>) -> Result<JobDef> {
    let path = file_path.as_ref();
    let yaml_content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read YAML file from {}", path.display()))?;

    let def: JobDef = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize YAML content from {}", path.display()))?;

    Ok(def)
}
