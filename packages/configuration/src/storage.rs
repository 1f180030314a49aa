use serde::{Deserialize, Serialize};

/// A platform-managed storage root. The engine treats `root_id` as opaque —
/// it never inspects or constructs it, only passes it back on `FileSystem`
/// calls scoped to this root.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct StorageRoot {
    pub key: String,
    pub label: String,
    pub root_id: String,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Storage {
    #[serde(default = "Storage::default_storage_roots")]
    pub storage_roots: Vec<StorageRoot>,

    #[serde(default = "Storage::default_default_root_key")]
    pub default_root_key: String,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            storage_roots: Self::default_storage_roots(),
            default_root_key: Self::default_default_root_key(),
        }
    }
}

impl Storage {
    fn default_storage_roots() -> Vec<StorageRoot> {
        vec![StorageRoot {
            key: "default".to_string(),
            label: "Default".to_string(),
            root_id: "default".to_string(),
        }]
    }

    fn default_default_root_key() -> String {
        "default".to_string()
    }
}
