use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

/// One narrated text and the image shown while it is spoken.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SegmentSpec {
    pub text: String,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub segments: Vec<SegmentSpec>,
    pub subtitle_style: Option<String>,
    pub output_filename: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawScript {
    Segments {
        segments: Vec<SegmentSpec>,
        subtitle_style: Option<String>,
        output_filename: Option<String>,
    },
    Parallel {
        texts: Vec<String>,
        image_urls: Vec<String>,
        subtitle_style: Option<String>,
        output_filename: Option<String>,
    },
}

impl Script {
    pub fn parse(raw: &str) -> Result<Self> {
        let parsed: RawScript = serde_json::from_str(raw).map_err(|e| {
            PipelineError::config(format!(
                "script must hold 'segments' or 'texts' + 'image_urls': {}",
                e
            ))
        })?;
        let script = match parsed {
            RawScript::Segments {
                segments,
                subtitle_style,
                output_filename,
            } => Script {
                segments,
                subtitle_style,
                output_filename,
            },
            RawScript::Parallel {
                texts,
                image_urls,
                subtitle_style,
                output_filename,
            } => {
                if texts.len() != image_urls.len() {
                    return Err(PipelineError::config(format!(
                        "number of texts ({}) must match image URLs ({})",
                        texts.len(),
                        image_urls.len()
                    )));
                }
                let segments = texts
                    .into_iter()
                    .zip(image_urls)
                    .map(|(text, image)| SegmentSpec { text, image })
                    .collect();
                Script {
                    segments,
                    subtitle_style,
                    output_filename,
                }
            }
        };
        script.validate()?;
        Ok(script)
    }

    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading script from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        let script = Self::parse(&raw)?;
        debug!("Script has {} segments", script.segments.len());
        Ok(script)
    }

    fn validate(&self) -> Result<()> {
        if self.segments.is_empty() {
            return Err(PipelineError::config("script has no segments"));
        }
        if let Some(i) = self.segments.iter().position(|s| s.image.trim().is_empty()) {
            return Err(PipelineError::config(format!(
                "segment {} has no image source",
                i
            )));
        }
        if let Some(name) = &self.output_filename {
            if name.trim().is_empty() || Path::new(name).file_name().is_none() {
                return Err(PipelineError::config(format!(
                    "invalid output filename '{}'",
                    name
                )));
            }
        }
        Ok(())
    }
}
