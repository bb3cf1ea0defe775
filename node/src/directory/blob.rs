// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::path::{Path, PathBuf};

use anyhow::Result;
use node_data::model::ModelSet;
use node_data::Serializable;

/// Content-addressed model payload files, one `<model_id>.blob` per pushed
/// model.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    fn blob_path(&self, model_id: &str) -> PathBuf {
        self.root.join(format!("{model_id}.blob"))
    }

    /// Persists a payload. Written to a temp file first and renamed into
    /// place, so a reader never observes a half-written blob.
    pub async fn store(&self, model_id: &str, model: &ModelSet) -> Result<()> {
        let mut buf = Vec::new();
        model.write(&mut buf)?;

        let tmp = self.root.join(format!(".{model_id}.tmp"));
        let dst = self.blob_path(model_id);

        tokio::fs::write(&tmp, &buf).await?;
        tokio::fs::rename(&tmp, &dst).await?;

        Ok(())
    }

    pub async fn load(&self, model_id: &str) -> Result<ModelSet> {
        let buf = tokio::fs::read(self.blob_path(model_id)).await?;
        Ok(ModelSet::read(&mut &buf[..])?)
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.blob_path(model_id).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::new(dir.path()).unwrap();

        let mut model = ModelSet::new();
        model.insert("w", vec![1.5, -0.5]);

        blobs.store("agent-a-m1", &model).await.unwrap();
        assert!(blobs.contains("agent-a-m1"));

        let loaded = blobs.load("agent-a-m1").await.unwrap();
        assert_eq!(loaded, model);
    }
}
