//! Flat file list ⇄ nested mount tree conversion.

use std::collections::BTreeMap;

use crate::errors::ContainerError;

/// A directory level of a mount tree, keyed by entry name.
pub type MountTree = BTreeMap<String, MountNode>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountNode {
    File { contents: Vec<u8>, executable: bool },
    /// Link target as stored on disk, usually relative (`../pkg/cli.js`).
    Symlink { target: String },
    Directory { children: MountTree },
}

impl MountNode {
    pub fn file(contents: impl Into<Vec<u8>>) -> Self {
        Self::File {
            contents: contents.into(),
            executable: false,
        }
    }

    pub fn executable_file(contents: impl Into<Vec<u8>>) -> Self {
        Self::File {
            contents: contents.into(),
            executable: true,
        }
    }

    pub fn symlink(target: impl Into<String>) -> Self {
        Self::Symlink {
            target: target.into(),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory { .. })
    }

    pub fn empty_dir() -> Self {
        Self::Directory {
            children: MountTree::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    File { contents: Vec<u8>, executable: bool },
    Symlink { target: String },
    Directory,
}

/// One entry of a flat file listing, as the editor's file panel holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// `/`-separated path. Leading, trailing and doubled slashes are ignored.
    pub path: String,
    pub kind: FileKind,
}

impl FileEntry {
    pub fn file(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            kind: FileKind::File {
                contents: contents.into(),
                executable: false,
            },
        }
    }

    pub fn symlink(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileKind::Symlink {
                target: target.into(),
            },
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileKind::Directory,
        }
    }
}

pub struct FileTreeConverter;

impl FileTreeConverter {
    /// Build a mount tree from a flat listing.
    ///
    /// Later entries win when the same file path appears twice. A file and a
    /// directory at the same path is a [`ContainerError::ConflictingPath`].
    pub fn convert(entries: &[FileEntry]) -> Result<MountTree, ContainerError> {
        let mut root = MountTree::new();
        for entry in entries {
            insert_entry(&mut root, entry)?;
        }
        Ok(root)
    }

    /// Flatten a mount tree back into `/`-rooted entries in lexical order.
    ///
    /// Files and symlinks are listed individually; a directory only gets its
    /// own entry when it is empty, since non-empty ones are implied by their
    /// files.
    pub fn flatten(tree: &MountTree) -> Vec<FileEntry> {
        let mut out = Vec::new();
        flatten_into(tree, "", &mut out);
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }
}

fn insert_entry(root: &mut MountTree, entry: &FileEntry) -> Result<(), ContainerError> {
    let segments: Vec<&str> = entry.path.split('/').filter(|s| !s.is_empty()).collect();
    let Some((leaf, parents)) = segments.split_last() else {
        // The root directory always exists; a nameless file cannot.
        return match entry.kind {
            FileKind::Directory => Ok(()),
            FileKind::File { .. } | FileKind::Symlink { .. } => Err(ContainerError::ConflictingPath {
                path: entry.path.clone(),
            }),
        };
    };

    let mut level = root;
    let mut walked = String::new();
    for segment in parents {
        walked.push('/');
        walked.push_str(segment);
        let node = level
            .entry((*segment).to_string())
            .or_insert_with(MountNode::empty_dir);
        level = match node {
            MountNode::Directory { children } => children,
            MountNode::File { .. } | MountNode::Symlink { .. } => {
                return Err(ContainerError::ConflictingPath { path: walked });
            }
        };
    }

    walked.push('/');
    walked.push_str(leaf);
    let existing_is_dir = level.get(*leaf).map(MountNode::is_dir);
    match (&entry.kind, existing_is_dir) {
        (FileKind::File { .. } | FileKind::Symlink { .. }, Some(true))
        | (FileKind::Directory, Some(false)) => Err(ContainerError::ConflictingPath { path: walked }),
        (FileKind::File { contents, executable }, _) => {
            let node = MountNode::File {
                contents: contents.clone(),
                executable: *executable,
            };
            level.insert((*leaf).to_string(), node);
            Ok(())
        }
        (FileKind::Symlink { target }, _) => {
            level.insert((*leaf).to_string(), MountNode::symlink(target.clone()));
            Ok(())
        }
        (FileKind::Directory, _) => {
            level
                .entry((*leaf).to_string())
                .or_insert_with(MountNode::empty_dir);
            Ok(())
        }
    }
}

fn flatten_into(tree: &MountTree, prefix: &str, out: &mut Vec<FileEntry>) {
    for (name, node) in tree {
        let path = format!("{}/{}", prefix, name);
        match node {
            MountNode::File { contents, executable } => out.push(FileEntry {
                path,
                kind: FileKind::File {
                    contents: contents.clone(),
                    executable: *executable,
                },
            }),
            MountNode::Symlink { target } => out.push(FileEntry::symlink(path, target.clone())),
            MountNode::Directory { children } if children.is_empty() => {
                out.push(FileEntry::directory(path))
            }
            MountNode::Directory { children } => flatten_into(children, &path, out),
        }
    }
}
