//! Pipeline loader
//!
//! Load pipeline YAML files from a file or a directory.

use std::path::Path;

use super::Workflow;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error in {file}: {error}")]
    Yaml {
        file: String,
        error: serde_yaml::Error,
    },
}

pub struct WorkflowLoader;

impl WorkflowLoader {
    /// Load every `*.yaml` / `*.yml` pipeline in a directory, sorted by file name
    pub fn load_directory(dir: &Path) -> Result<Vec<Workflow>, LoadError> {
        let mut paths = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();

            if !path.is_file() {
                continue;
            }

            let ext = path.extension().and_then(|e| e.to_str());
            let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

            // runner.yaml is the runner config, not a pipeline
            if filename == "runner.yaml" || filename == "runner.yml" {
                continue;
            }

            if ext == Some("yaml") || ext == Some("yml") {
                paths.push(path);
            }
        }

        paths.sort();
        paths.iter().map(|p| Self::load_file(p)).collect()
    }

    pub fn load_file(path: &Path) -> Result<Workflow, LoadError> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| LoadError::Yaml {
            file: path.display().to_string(),
            error: e,
        })
    }
}
