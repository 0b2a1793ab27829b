//! Exec directory staging.
//!
//! Each operation executes in `<root>/<operation_name>/`, populated from the
//! cache: files are hard links, and input directories that will receive no
//! outputs are a single symlink to the cached materialization when
//! `link_input_directories` is on. The references acquired while staging are
//! tracked per exec root and released in one call on destroy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use granary_api::{Action, Command, Digest, Directory};
use tracing::debug;

use crate::file_cache::CasFileCache;
use crate::output_directory::OutputDirectory;
use crate::{CacheError, CacheResult};

pub struct ExecFileSystem {
    root: PathBuf,
    file_cache: Arc<CasFileCache>,
    link_input_directories: bool,
    root_inputs: Mutex<HashMap<PathBuf, (Vec<String>, Vec<Digest>)>>,
}

impl ExecFileSystem {
    pub fn new(
        root: PathBuf,
        file_cache: Arc<CasFileCache>,
        link_input_directories: bool,
    ) -> ExecFileSystem {
        ExecFileSystem {
            root,
            file_cache,
            link_input_directories,
            root_inputs: Mutex::new(HashMap::new()),
        }
    }

    pub fn file_cache(&self) -> &Arc<CasFileCache> {
        &self.file_cache
    }

    /// Remove stale exec dirs from a previous run and start the cache.
    /// Returns the digests recovered into the cache.
    pub async fn start(&self) -> CacheResult<Vec<Digest>> {
        tokio::fs::create_dir_all(&self.root).await?;
        let mut dirents = tokio::fs::read_dir(&self.root).await?;
        while let Some(dirent) = dirents.next_entry().await? {
            let path = dirent.path();
            if path == *self.file_cache.root() {
                continue;
            }
            debug!(path = %path.display(), "removing stale exec dir");
            if dirent.metadata().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
        self.file_cache.start().await
    }

    /// Stage the input root for one operation and return the exec dir.
    pub async fn create_exec_dir(
        &self,
        operation_name: &str,
        index: &HashMap<Digest, Directory>,
        action: &Action,
        command: &Command,
    ) -> CacheResult<PathBuf> {
        let outputs = OutputDirectory::parse(&command.output_files, &command.output_directories);
        let exec_dir = self.root.join(operation_name);
        if exec_dir.exists() {
            self.destroy_exec_dir(&exec_dir).await?;
        }
        tokio::fs::create_dir_all(&exec_dir).await?;

        let input_root = action.input_root_digest.clone().unwrap_or_default();
        let mut input_files = Vec::new();
        let mut input_directories = Vec::new();
        let staged = self
            .fetch_inputs(
                &exec_dir,
                &input_root,
                index,
                Some(&outputs),
                &mut input_files,
                &mut input_directories,
            )
            .await;
        if let Err(err) = staged {
            self.file_cache
                .decrement_references(&input_files, &input_directories);
            let _ = tokio::fs::remove_dir_all(&exec_dir).await;
            return Err(err);
        }

        self.root_inputs
            .lock()
            .expect("root inputs poisoned")
            .insert(exec_dir.clone(), (input_files, input_directories));

        if let Err(err) = outputs.stamp(&exec_dir) {
            self.destroy_exec_dir(&exec_dir).await?;
            return Err(err.into());
        }
        Ok(exec_dir)
    }

    fn fetch_inputs<'a>(
        &'a self,
        dir: &'a Path,
        digest: &'a Digest,
        index: &'a HashMap<Digest, Directory>,
        outputs: Option<&'a OutputDirectory>,
        input_files: &'a mut Vec<String>,
        input_directories: &'a mut Vec<Digest>,
    ) -> BoxFuture<'a, CacheResult<()>> {
        Box::pin(async move {
            let empty = Directory::default();
            let directory = if digest.is_empty() {
                &empty
            } else {
                index.get(digest).ok_or_else(|| {
                    CacheError::InvalidEntry(format!(
                        "directory {digest} is not in directories index"
                    ))
                })?
            };

            for file in &directory.files {
                let file_digest = file
                    .digest
                    .clone()
                    .ok_or_else(|| CacheError::InvalidEntry("file node without digest".into()))?;
                let file_path = dir.join(&file.name);
                if file_digest.is_empty() {
                    tokio::fs::File::create(&file_path).await?;
                    continue;
                }
                let key = self
                    .file_cache
                    .put(&file_digest, file.is_executable, None)
                    .await?;
                input_files.push(key.clone());
                tokio::fs::hard_link(self.file_cache.key_path(&key), &file_path).await?;
            }

            for subdirectory in &directory.directories {
                let child_digest = subdirectory.digest.clone().ok_or_else(|| {
                    CacheError::InvalidEntry("directory node without digest".into())
                })?;
                let child_path = dir.join(&subdirectory.name);
                let child_outputs = outputs.and_then(|outputs| outputs.child(&subdirectory.name));
                if child_digest.is_empty() {
                    tokio::fs::create_dir_all(&child_path).await?;
                    continue;
                }
                if child_outputs.is_some() || !self.link_input_directories {
                    tokio::fs::create_dir_all(&child_path).await?;
                    self.fetch_inputs(
                        &child_path,
                        &child_digest,
                        index,
                        child_outputs,
                        input_files,
                        input_directories,
                    )
                    .await?;
                } else {
                    let cache_path = self.file_cache.put_directory(&child_digest, index).await?;
                    tokio::fs::symlink(&cache_path, &child_path).await?;
                    input_directories.push(child_digest);
                }
            }
            Ok(())
        })
    }

    /// Release the exec dir's cache references and remove the tree.
    pub async fn destroy_exec_dir(&self, exec_dir: &Path) -> CacheResult<()> {
        let inputs = self
            .root_inputs
            .lock()
            .expect("root inputs poisoned")
            .remove(exec_dir);
        if let Some((input_files, input_directories)) = inputs {
            self.file_cache
                .decrement_references(&input_files, &input_directories);
        }
        match tokio::fs::remove_dir_all(exec_dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
