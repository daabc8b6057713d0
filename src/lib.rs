//! # Apkinfo
//!
//! A library for extracting instrumentation metadata from Android test APK manifests
//!
use crate::instrumentation::{InstrumentationInfo, InstrumentationResult};
use std::path::Path;

pub mod android;
pub mod instrumentation;
mod tests;

/// Reads a test APK and returns the instrumentation metadata declared in its manifest
///
/// # Examples
///
/// ```no_run
///  use apkinfo::read_instrumentation_info;
///
///  let info = read_instrumentation_info("app-debug-androidTest.apk").unwrap();
///  println!("runner: {}", info.test_runner_class);
/// ```
pub fn read_instrumentation_info(
    apk_path: impl AsRef<Path>,
) -> InstrumentationResult<InstrumentationInfo> {
    InstrumentationInfo::from_apk(apk_path)
}
