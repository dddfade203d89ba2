//! NLP layer: entity extraction only.
//!
//! Intent classification lives in [`crate::intent`]; nothing here selects
//! tools or makes execution decisions.

pub mod entity_extractor;
pub mod tagger;

pub use entity_extractor::{EntityExtractor, EntitySource, ExtractedEntity, ExtractionResult};
