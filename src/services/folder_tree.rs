//! Folds per-folder aggregates into one level of the virtual folder tree.

use crate::models::{
    file::Category,
    folder::{Breadcrumb, FolderNode, FolderTree},
};
use sqlx::FromRow;
use std::collections::BTreeMap;

/// Live file count and byte total for one exact `folder_path`.
#[derive(FromRow, Clone, Debug, PartialEq)]
pub struct FolderAggregate {
    pub folder_path: String,
    pub file_count: i64,
    pub total_size: i64,
}

#[derive(Default)]
struct Totals {
    count_direct: u64,
    size_direct: u64,
    count_total: u64,
    size_total: u64,
    has_children: bool,
}

/// Build the node for `parent` and its immediate children from `rows`.
/// Rows outside `parent` are ignored.
pub fn build_tree(category: Category, parent: &str, rows: &[FolderAggregate]) -> FolderTree {
    let parent = parent.trim_matches('/');
    let mut root = Totals::default();
    let mut children: BTreeMap<String, Totals> = BTreeMap::new();

    for row in rows {
        let path = row.folder_path.trim_matches('/');
        let count = row.file_count.max(0) as u64;
        let size = row.total_size.max(0) as u64;

        let relative = if parent.is_empty() {
            path
        } else if path == parent {
            ""
        } else {
            match path.strip_prefix(parent).and_then(|rest| rest.strip_prefix('/')) {
                Some(rest) => rest,
                None => continue,
            }
        };

        root.count_total += count;
        root.size_total += size;
        if relative.is_empty() {
            root.count_direct += count;
            root.size_direct += size;
            continue;
        }

        let (name, deeper) = match relative.split_once('/') {
            Some((name, _)) => (name, true),
            None => (relative, false),
        };
        let child = children.entry(name.to_string()).or_default();
        child.count_total += count;
        child.size_total += size;
        if deeper {
            child.has_children = true;
        } else {
            child.count_direct += count;
            child.size_direct += size;
        }
    }

    let children: Vec<FolderNode> = children
        .into_iter()
        .map(|(name, totals)| FolderNode {
            full_path: if parent.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", parent, name)
            },
            name,
            file_count_direct: totals.count_direct,
            size_direct: totals.size_direct,
            file_count_total: totals.count_total,
            size_total: totals.size_total,
            has_children: totals.has_children,
        })
        .collect();

    let label = parent
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(category.label())
        .to_string();

    FolderTree {
        path: parent.to_string(),
        label,
        file_count_direct: root.count_direct,
        size_direct: root.size_direct,
        file_count_total: root.count_total,
        size_total: root.size_total,
        has_children: !children.is_empty(),
        breadcrumbs: breadcrumbs(category, parent),
        children,
    }
}

/// Category root first, then one crumb per segment of `path`.
pub fn breadcrumbs(category: Category, path: &str) -> Vec<Breadcrumb> {
    let mut crumbs = vec![Breadcrumb {
        label: category.label().to_string(),
        path: String::new(),
    }];
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if !current.is_empty() {
            current.push('/');
        }
        current.push_str(segment);
        crumbs.push(Breadcrumb {
            label: segment.to_string(),
            path: current.clone(),
        });
    }
    crumbs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agg(path: &str, count: i64, size: i64) -> FolderAggregate {
        FolderAggregate {
            folder_path: path.into(),
            file_count: count,
            total_size: size,
        }
    }

    fn sample() -> Vec<FolderAggregate> {
        vec![
            agg("", 2, 100),
            agg("photos", 1, 10),
            agg("photos/2024", 3, 30),
            agg("photos/2024/raw", 1, 1000),
            agg("docs", 4, 40),
            agg("docs-old", 1, 5),
        ]
    }

    #[test]
    fn test_root_total_is_sum_of_all_rows() {
        let rows = sample();
        let tree = build_tree(Category::ClientMaterial, "", &rows);
        let sum: i64 = rows.iter().map(|r| r.total_size).sum();
        assert_eq!(tree.size_total, sum as u64);
        assert_eq!(tree.file_count_total, 12);
        assert_eq!(tree.size_direct, 100);
        assert_eq!(tree.label, "Customer Files");

        let names: Vec<&str> = tree.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "docs-old", "photos"]);
        let photos = &tree.children[2];
        assert_eq!(photos.file_count_direct, 1);
        assert_eq!(photos.size_total, 1040);
        assert!(photos.has_children);
        assert!(!tree.children[0].has_children);
    }

    #[test]
    fn test_subtree_ignores_prefix_siblings() {
        let tree = build_tree(Category::ClientMaterial, "/photos/", &sample());
        assert_eq!(tree.path, "photos");
        assert_eq!(tree.label, "photos");
        assert_eq!(tree.size_total, 1040);
        assert_eq!(tree.size_direct, 10);
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].full_path, "photos/2024");
        assert_eq!(tree.children[0].size_direct, 30);
        assert_eq!(tree.children[0].size_total, 1030);

        let docs = build_tree(Category::ClientMaterial, "docs", &sample());
        assert_eq!(docs.file_count_total, 4);
        assert!(!docs.has_children);
    }

    #[test]
    fn test_breadcrumbs() {
        let crumbs = breadcrumbs(Category::InternalSolution, "a/b");
        assert_eq!(
            crumbs,
            vec![
                Breadcrumb {
                    label: "Company Files".into(),
                    path: "".into(),
                },
                Breadcrumb {
                    label: "a".into(),
                    path: "a".into(),
                },
                Breadcrumb {
                    label: "b".into(),
                    path: "a/b".into(),
                },
            ]
        );
    }
}
