//! Replacement textures: filename grammars, on-disk discovery/matching, and
//! the dump side that produces those files in the first place.

pub mod name;

pub(crate) mod dump;
pub(crate) mod store;
