//! Choice between raw source and compressed context.

use crate::compression::{CompressionMode, CompressionSettings};
use crate::errors::PipelineError;
use crate::phase::Phase;
use crate::store::SessionSnapshot;

/// Story material handed to a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMaterial<'a> {
    Raw(&'a str),
    Compressed(&'a str),
}

impl<'a> SourceMaterial<'a> {
    pub fn text(&self) -> &'a str {
        match self {
            Self::Raw(text) | Self::Compressed(text) => text,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Raw(_) => "raw",
            Self::Compressed(_) => "compressed",
        }
    }
}

/// Select the material `phase` works from.
///
/// - `off`: raw source
/// - `on`: compressed context, required
/// - `auto`: compressed context when present, otherwise required only when
///   the source is over the threshold
pub fn select_source<'a>(
    phase: Phase,
    snapshot: &'a SessionSnapshot,
    settings: &CompressionSettings,
) -> Result<SourceMaterial<'a>, PipelineError> {
    let compressed = snapshot.compressed_context();
    match settings.mode {
        CompressionMode::Off => Ok(SourceMaterial::Raw(&snapshot.source_text)),
        CompressionMode::On => compressed
            .map(SourceMaterial::Compressed)
            .ok_or(PipelineError::CompressionRequired { phase }),
        CompressionMode::Auto => match compressed {
            Some(context) => Ok(SourceMaterial::Compressed(context)),
            None if snapshot.source_text.chars().count() > settings.threshold_chars => {
                Err(PipelineError::CompressionRequired { phase })
            }
            None => Ok(SourceMaterial::Raw(&snapshot.source_text)),
        },
    }
}
