use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::state::{BatchIndex, Mode};
use crate::services::context::ContextWindow;
use crate::services::llm::LlmConfig;
use crate::services::prompt::default_banned_phrases;
use crate::services::sampling::SamplingProfiles;

const CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_input")]
    pub input_folder: String,

    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_build")]
    pub build_folder: String,

    #[serde(default)]
    pub unattended: bool,

    pub llm: LlmConfig,

    #[serde(default)]
    pub generation: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenerationConfig {
    pub mode: Option<Mode>,

    /// Path to a file whose vocabulary and tone the script should echo.
    pub style_reference: Option<String>,

    /// Path to a file whose brackets and section markers the script should copy.
    pub layout_reference: Option<String>,

    #[serde(default)]
    pub window: ContextWindow,

    #[serde(default)]
    pub sampling: SamplingProfiles,

    #[serde(default = "default_banned_phrases")]
    pub banned_phrases: Vec<String>,

    pub max_batches: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            mode: None,
            style_reference: None,
            layout_reference: None,
            window: ContextWindow::default(),
            sampling: SamplingProfiles::default(),
            banned_phrases: default_banned_phrases(),
            max_batches: None,
        }
    }
}

fn default_input() -> String {
    "input".to_string()
}
fn default_output() -> String {
    "output".to_string()
}
fn default_build() -> String {
    "build".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new(CONFIG_FILE);
        if !path.exists() {
            anyhow::bail!("config.yml not found. Please create one.");
        }
        Self::load_from(path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = serde_yaml_ng::from_str(content)?;
        config.generation.sampling.validate()?;
        if let Some(max) = config.generation.max_batches {
            BatchIndex::new(max).context("generation.max_batches is out of range")?;
        }
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(CONFIG_FILE, content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.input_folder)?;
        fs::create_dir_all(&self.output_folder)?;
        fs::create_dir_all(&self.build_folder)?;
        Ok(())
    }
}
