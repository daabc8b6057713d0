/* Extraction of instrumentation metadata from a decoded test APK manifest */

use crate::android::binary_xml::{
    AndroidManifest, BinaryXmlError, ManifestElement, ManifestValue, ANDROID_NAMESPACE_URI,
};
use crate::android::zip::{ApkFile, ApkZipError};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::Path;

const MANIFEST_TAG: &str = "manifest";
const USES_SDK_TAG: &str = "uses-sdk";
const INSTRUMENTATION_TAG: &str = "instrumentation";

const PACKAGE_ATTR: &str = "package";
const MIN_SDK_VERSION_ATTR: &str = "minSdkVersion";
const TARGET_PACKAGE_ATTR: &str = "targetPackage";
const NAME_ATTR: &str = "name";

const MANIFEST_ENTRY: &str = "AndroidManifest.xml";

/// Result alias for instrumentation metadata extraction.
pub type InstrumentationResult<T> = Result<T, InstrumentationError>;

/// Errors surfaced while extracting instrumentation metadata.
#[derive(Debug)]
pub enum InstrumentationError {
    /// A required manifest field was absent after the full tree walk.
    MissingField(&'static str),
    /// A recognized attribute's value could not be parsed to its expected type.
    MalformedValue {
        attribute: &'static str,
        value: String,
    },
    /// APK archive access failure, propagated opaquely.
    Apk(ApkZipError),
    /// Manifest decode failure, propagated opaquely.
    Manifest(BinaryXmlError),
}

impl std::fmt::Display for InstrumentationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstrumentationError::MissingField(field) => {
                write!(f, "Could not find {field} in test APK manifest")
            }
            InstrumentationError::MalformedValue { attribute, value } => {
                write!(f, "Manifest attribute {attribute} has malformed value '{value}'")
            }
            InstrumentationError::Apk(err) => write!(f, "Unable to read test APK: {err}"),
            InstrumentationError::Manifest(err) => {
                write!(f, "Unable to parse test APK manifest: {err}")
            }
        }
    }
}

impl std::error::Error for InstrumentationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InstrumentationError::Apk(err) => Some(err),
            InstrumentationError::Manifest(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ApkZipError> for InstrumentationError {
    fn from(value: ApkZipError) -> Self {
        InstrumentationError::Apk(value)
    }
}

impl From<BinaryXmlError> for InstrumentationError {
    fn from(value: BinaryXmlError) -> Self {
        InstrumentationError::Manifest(value)
    }
}

/// Instrumentation metadata extracted from a test APK's manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentationInfo {
    /// The package under test (`android:targetPackage` on `<instrumentation>`).
    pub application_package: String,
    /// The test APK's own package (`package` on the `<manifest>` root).
    pub instrumentation_package: String,
    /// Declared `android:minSdkVersion`, if any.
    pub min_sdk_version: Option<u32>,
    /// Fully-qualified class name of the instrumentation test runner.
    pub test_runner_class: String,
}

impl InstrumentationInfo {
    /// Extract instrumentation metadata straight from a test APK on disk.
    pub fn from_apk(path: impl AsRef<Path>) -> InstrumentationResult<Self> {
        let path = path.as_ref();
        let apk = ApkFile::from_file(path)?;
        let entry = apk.required_entry(MANIFEST_ENTRY)?;
        debug!(
            "Extracting instrumentation info from {} ({} byte manifest)",
            path.display(),
            entry.data.len()
        );
        let manifest = AndroidManifest::from_bytes(&entry.data)?;
        Self::from_manifest(&manifest)
    }

    /// Extract instrumentation metadata from an already-decoded manifest.
    pub fn from_manifest(manifest: &AndroidManifest) -> InstrumentationResult<Self> {
        extract_instrumentation_info(manifest.root())
    }
}

#[derive(Default)]
struct PartialInfo {
    application_package: Option<String>,
    instrumentation_package: Option<String>,
    min_sdk_version: Option<u32>,
    test_runner_class: Option<String>,
}

/// Walk a decoded manifest tree and extract the instrumentation metadata.
///
/// The walk is depth-first in document order over every node, so recognized
/// elements are found at any depth. When a recognized tag occurs more than
/// once the values from the last occurrence win; that is an artifact of the
/// unconditional overwrite during the walk, not a documented guarantee.
pub fn extract_instrumentation_info(
    root: &ManifestElement,
) -> InstrumentationResult<InstrumentationInfo> {
    let mut partial = PartialInfo::default();
    visit(root, &mut partial)?;

    let instrumentation_package = partial
        .instrumentation_package
        .filter(|p| !p.is_empty())
        .ok_or(InstrumentationError::MissingField("test application package"))?;
    let application_package = partial
        .application_package
        .filter(|p| !p.is_empty())
        .ok_or(InstrumentationError::MissingField("application package"))?;
    let test_runner_class = partial
        .test_runner_class
        .filter(|c| !c.is_empty())
        .ok_or(InstrumentationError::MissingField("test runner class"))?;

    Ok(InstrumentationInfo {
        test_runner_class: qualify_runner_class(test_runner_class, &instrumentation_package),
        application_package,
        instrumentation_package,
        min_sdk_version: partial.min_sdk_version,
    })
}

fn visit(node: &ManifestElement, partial: &mut PartialInfo) -> InstrumentationResult<()> {
    match node.tag.as_str() {
        MANIFEST_TAG => {
            if let Some(package) = node.attribute_value(PACKAGE_ATTR).and_then(value_text) {
                partial.instrumentation_package = Some(package);
            }
        }
        USES_SDK_TAG => {
            if let Some(value) =
                node.namespaced_attribute_value(ANDROID_NAMESPACE_URI, MIN_SDK_VERSION_ATTR)
            {
                partial.min_sdk_version = Some(parse_sdk_version(value)?);
            }
        }
        INSTRUMENTATION_TAG => {
            if let Some(target) = node
                .namespaced_attribute_value(ANDROID_NAMESPACE_URI, TARGET_PACKAGE_ATTR)
                .and_then(value_text)
            {
                partial.application_package = Some(target);
            }
            if let Some(runner) = node
                .namespaced_attribute_value(ANDROID_NAMESPACE_URI, NAME_ATTR)
                .and_then(value_text)
            {
                partial.test_runner_class = Some(runner);
            }
        }
        _ => {
            // Unrecognized tag: skip its attributes, still walk its children.
        }
    }
    for child in &node.children {
        visit(child, partial)?;
    }
    Ok(())
}

fn value_text(value: &ManifestValue) -> Option<String> {
    value.as_str().map(|s| s.to_string())
}

fn parse_sdk_version(value: &ManifestValue) -> InstrumentationResult<u32> {
    match value {
        ManifestValue::Integer(n) => {
            u32::try_from(*n).map_err(|_| InstrumentationError::MalformedValue {
                attribute: MIN_SDK_VERSION_ATTR,
                value: n.to_string(),
            })
        }
        ManifestValue::String(s) => {
            s.parse::<u32>()
                .map_err(|_| InstrumentationError::MalformedValue {
                    attribute: MIN_SDK_VERSION_ATTR,
                    value: s.clone(),
                })
        }
        other => Err(InstrumentationError::MalformedValue {
            attribute: MIN_SDK_VERSION_ATTR,
            value: format!("{other:?}"),
        }),
    }
}

/// Support relative declaration of the instrumentation test runner.
///
/// The ordering matters: a value starting with `.` also contains a `.`, so the
/// relative-prefix case must be tested before the bare-name case.
fn qualify_runner_class(raw: String, instrumentation_package: &str) -> String {
    if raw.starts_with('.') {
        format!("{instrumentation_package}{raw}")
    } else if !raw.contains('.') {
        format!("{instrumentation_package}.{raw}")
    } else {
        raw
    }
}
