//! Folder hierarchy derived from file records. Never persisted.

use serde::Serialize;

/// One level below the requested folder.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct FolderNode {
    pub full_path: String,
    pub name: String,
    pub file_count_direct: u64,
    pub size_direct: u64,
    /// Files in this folder and every folder below it.
    pub file_count_total: u64,
    pub size_total: u64,
    pub has_children: bool,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Breadcrumb {
    pub label: String,
    pub path: String,
}

/// The requested folder plus its immediate children.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct FolderTree {
    pub path: String,
    pub label: String,
    pub file_count_direct: u64,
    pub size_direct: u64,
    pub file_count_total: u64,
    pub size_total: u64,
    pub has_children: bool,
    pub breadcrumbs: Vec<Breadcrumb>,
    pub children: Vec<FolderNode>,
}
