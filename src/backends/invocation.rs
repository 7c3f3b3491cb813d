//! Invocation manifests
//!
//! The inference shim inside the container reads a manifest that tells it
//! where each input has to be placed under `/input` and where to fetch it
//! from. The manifest for an attempt is written to the input bucket under a
//! key derived from the job descriptor only, so resubmitting the same attempt
//! overwrites the same object and different attempts never collide.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::backends::clients::ObjectStore;
use crate::errors::ExecutorError;
use crate::values::{ComponentInterfaceValue, ValueReference};

/// Where the shim gets the data for one input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum InputSource {
    Inline {
        value: serde_json::Value,
    },
    Object {
        bucket_name: String,
        bucket_key: String,
        decompress: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationInput {
    /// Destination relative to the input directory
    pub relative_path: String,
    #[serde(flatten)]
    pub source: InputSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationManifest {
    /// Remote job name of the attempt
    pub pk: String,
    pub inputs: Vec<InvocationInput>,
    pub output_bucket_name: String,
    pub output_prefix: String,
}

/// Join relative path segments, refusing anything that could escape the
/// input directory
pub fn safe_join(prefix: Option<&str>, relative_path: &str) -> Result<String, ExecutorError> {
    let mut parts = Vec::new();
    for segment in prefix.into_iter().chain(std::iter::once(relative_path)) {
        if segment.starts_with('/') || segment.contains('\\') {
            return Err(ExecutorError::InvalidInput(format!(
                "{:?} is not a relative path",
                segment
            )));
        }
        for part in segment.split('/').filter(|p| !p.is_empty()) {
            if part == "." || part == ".." {
                return Err(ExecutorError::InvalidInput(format!(
                    "{:?} is not a safe path",
                    segment
                )));
            }
            parts.push(part);
        }
    }
    if parts.is_empty() {
        return Err(ExecutorError::InvalidInput(
            "input path must not be empty".to_string(),
        ));
    }
    Ok(parts.join("/"))
}

/// Build the manifest for the given inputs. `input_prefixes` maps an
/// interface value id to a directory the value is nested under.
pub fn build_invocation(
    job_name: &str,
    inputs: &[ComponentInterfaceValue],
    input_prefixes: &BTreeMap<i64, String>,
    output_bucket_name: &str,
    output_prefix: &str,
) -> Result<InvocationManifest, ExecutorError> {
    let inputs = inputs
        .iter()
        .map(|civ| -> Result<InvocationInput, ExecutorError> {
            civ.validate().map_err(ExecutorError::InvalidInput)?;

            let relative_path = safe_join(
                input_prefixes.get(&civ.id).map(String::as_str),
                &civ.relative_path(),
            )?;

            let source = match &civ.value {
                ValueReference::Inline { value } => InputSource::Inline {
                    value: value.clone(),
                },
                ValueReference::File { bucket, key } | ValueReference::Image { bucket, key, .. } => {
                    InputSource::Object {
                        bucket_name: bucket.clone(),
                        bucket_key: key.clone(),
                        decompress: civ.decompress(),
                    }
                }
            };

            Ok(InvocationInput {
                relative_path,
                source,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(InvocationManifest {
        pk: job_name.to_string(),
        inputs,
        output_bucket_name: output_bucket_name.to_string(),
        output_prefix: output_prefix.to_string(),
    })
}

/// Write the manifest to the object store. The shim reads a list of
/// invocations; a batch transform job always carries exactly one.
pub fn upload_invocation(
    storage: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    manifest: &InvocationManifest,
) -> Result<(), ExecutorError> {
    let body = serde_json::to_vec(&[manifest])?;
    debug!(
        "Uploading invocation with {} inputs to s3://{}/{}",
        manifest.inputs.len(),
        bucket,
        key
    );
    storage.put(bucket, key, body)?;
    Ok(())
}
