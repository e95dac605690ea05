//! EPUB backend: opens publications, drives a headless navigator over them
//! and extracts cover images.

pub mod cover;
#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;
pub mod navigator;
pub mod package;
pub mod publication;

pub use cover::{fit_within, CoverService};
pub use navigator::{EpubNavigator, EpubNavigatorFactory, InteractionHandle};
pub use publication::Publication;
