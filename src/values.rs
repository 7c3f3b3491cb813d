//! Component interface values: the typed inputs bound to a job's slots

use serde::{Deserialize, Serialize};

/// What kind of entity an interface holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    /// A JSON value stored inline
    Json,
    /// A file in the object store
    File,
    /// A zip file that the container expects to be extracted. Only supported
    /// for legacy prediction submissions.
    Zip,
    /// A medical image in the object store
    Image,
}

/// A named input or output slot of a component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInterface {
    pub slug: String,
    pub kind: InterfaceKind,
    /// Location relative to the input or output directory
    pub relative_path: String,
}

/// Where the data of an interface value lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueReference {
    Inline {
        value: serde_json::Value,
    },
    File {
        bucket: String,
        key: String,
    },
    Image {
        bucket: String,
        key: String,
        /// Name of the image file, which the container sees unchanged
        file_name: String,
    },
}

/// A value bound to an interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentInterfaceValue {
    pub id: i64,
    pub interface: ComponentInterface,
    pub value: ValueReference,
}

impl ComponentInterfaceValue {
    pub fn inline(id: i64, interface: ComponentInterface, value: serde_json::Value) -> Self {
        Self {
            id,
            interface,
            value: ValueReference::Inline { value },
        }
    }

    /// Path of the value relative to the input directory. Images keep their
    /// file name inside the interface directory.
    pub fn relative_path(&self) -> String {
        match &self.value {
            ValueReference::Image { file_name, .. } => {
                format!("{}/{}", self.interface.relative_path, file_name)
            }
            _ => self.interface.relative_path.clone(),
        }
    }

    pub fn decompress(&self) -> bool {
        self.interface.kind == InterfaceKind::Zip
    }

    /// Check that the reference kind matches the interface kind
    pub fn validate(&self) -> Result<(), String> {
        let ok = matches!(
            (self.interface.kind, &self.value),
            (InterfaceKind::Json, ValueReference::Inline { .. })
                | (InterfaceKind::File, ValueReference::File { .. })
                | (InterfaceKind::Zip, ValueReference::File { .. })
                | (InterfaceKind::Image, ValueReference::Image { .. })
        );
        if ok {
            Ok(())
        } else {
            Err(format!(
                "value {} does not match the {:?} kind of interface {}",
                self.id, self.interface.kind, self.interface.slug
            ))
        }
    }
}
