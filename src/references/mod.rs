//! Reference registry and response normalizer

pub mod normalizer;
pub mod resolver;

pub use normalizer::{denormalize, EntityKeyConfig, NormalizedResponse, Normalizer, ENTITIES_KEY, REF_KEY};
pub use resolver::{ReferenceRegistry, ReferenceResolver, ResolveOptions, DEFAULT_MAX_DEPTH};
