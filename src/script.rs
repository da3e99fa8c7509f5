//! Immutable step scripts and the signature catalog derived from them.

pub mod catalog;
pub mod signature;

pub use catalog::{Script, ScriptCatalog, SignatureCatalog, Step};
pub use signature::Signature;
