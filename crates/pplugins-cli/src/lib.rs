//! pplugins command line tools
//!
//! The plugins bundled into `pplugins-host`, shared by both binaries.

pub mod plugins;
