// src/params.rs
//! JSON bodies exchanged with clients

use crate::meta::MetaResults;
use crate::reference::EntityReference;
use serde::{Deserialize, Serialize};

/// Reply to a successful archive upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveUploadResponse {
    #[serde(rename = "Id")]
    pub id: EntityReference,
}

/// Reply to `meta/any`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaAnyResponse {
    #[serde(rename = "Id")]
    pub id: EntityReference,
    #[serde(rename = "Meta", default, skip_serializing_if = "MetaResults::is_empty")]
    pub meta: MetaResults,
}

/// One file of the `manifest` facet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Size")]
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_meta_any_omits_empty_meta() {
        let response = MetaAnyResponse {
            id: "cs:precise/wordpress-0".parse().unwrap(),
            meta: MetaResults::new(),
        };
        assert_eq!(serde_json::to_value(&response).unwrap(), json!({"Id": "cs:precise/wordpress-0"}));
    }
}
