//! Output-directory layout parsed from a command.
//!
//! Directories that will receive outputs must be real (not links into the
//! cache) and must exist before the subprocess starts.

use std::collections::HashMap;
use std::path::Path;

#[derive(Clone, Debug, Default)]
pub struct OutputDirectory {
    children: HashMap<String, OutputDirectory>,
}

impl OutputDirectory {
    /// Build the tree of directories that will contain outputs: parents of
    /// every output file plus every output directory subtree root.
    pub fn parse(output_files: &[String], output_directories: &[String]) -> OutputDirectory {
        let mut root = OutputDirectory::default();
        for file in output_files {
            if let Some((parent, _)) = file.rsplit_once('/') {
                root.insert(parent);
            }
        }
        for directory in output_directories {
            root.insert(directory);
        }
        root
    }

    fn insert(&mut self, path: &str) {
        let mut node = self;
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            node = node.children.entry(segment.to_string()).or_default();
        }
    }

    pub fn child(&self, name: &str) -> Option<&OutputDirectory> {
        self.children.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Create every directory in the tree under `root`.
    pub fn stamp(&self, root: &Path) -> std::io::Result<()> {
        for (name, child) in &self.children {
            let path = root.join(name);
            std::fs::create_dir_all(&path)?;
            child.stamp(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_parents_and_directories() {
        let outputs = OutputDirectory::parse(
            &[
                "bin/app".to_string(),
                "bin/debug/app.dbg".to_string(),
                "toplevel".to_string(),
            ],
            &["gen/proto".to_string()],
        );
        let bin = outputs.child("bin").expect("bin");
        assert!(bin.child("debug").is_some());
        // A top-level output file needs no directory entry.
        assert!(outputs.child("toplevel").is_none());
        assert!(outputs
            .child("gen")
            .and_then(|gen| gen.child("proto"))
            .is_some());
    }

    #[test]
    fn stamp_creates_the_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outputs =
            OutputDirectory::parse(&["a/b/file.o".to_string()], &["out/objs".to_string()]);
        outputs.stamp(dir.path()).expect("stamp");
        assert!(dir.path().join("a/b").is_dir());
        assert!(dir.path().join("out/objs").is_dir());
    }
}
