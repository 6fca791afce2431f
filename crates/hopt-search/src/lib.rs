//! # hopt-search
//!
//! Parameter declarations and trial generation for hopt.
//!
//! Declared parameters ([`OptList`], [`OptRange`]) are collected in a
//! [`ParameterSpace`], flattened into candidate groups, and expanded into
//! [`Trial`]s by a [`SearchStrategy`] (grid or random). [`build_config`]
//! merges a trial onto the base configuration.

mod namespace;
mod search;
mod space;

pub use namespace::build_config;
pub use search::{generate_trials, GridSearch, RandomSearch, SearchStrategy, Strategy};
pub use space::{
    clean_name, Assignment, FlattenedSpace, OptArg, OptKind, OptList, OptRange, ParameterSpace,
    ParameterValue, Trial,
};
