//! Path resolution.
//!
//! An MFT entry may be known under several paths (hard links add extra
//! FILE_NAME attributes pointing at different parents), and on a live or
//! damaged volume parent pointers can be stale. The resolver walks every
//! link breadth-wise and every parent chain depth-wise, verifying the
//! parent's sequence number at each level. It never guesses: a broken
//! link gets an explicit sentinel component instead of a silently wrong
//! path, so an investigator can see why a resolution was incomplete.

use std::sync::Arc;

use log::debug;

use crate::context::NtfsContext;
use crate::mft::{MftEntry, FileName, MFT_RECORD_ROOT};
use crate::summary::{FnSummary, MftEntrySummary};

struct Visitor {
    paths: Vec<Vec<String>>,
    max: usize,
    include_short_names: bool,
    prefix: Vec<String>,
}

impl Visitor {
    /// Fork a new path sharing the first `depth` components of `idx`.
    fn fork(&mut self, idx: usize, depth: usize) -> usize {
        let shared: Vec<String> = self.paths[idx][..depth.min(self.paths[idx].len())].to_vec();
        self.paths.push(shared);
        self.paths.len() - 1
    }

    fn add_component(&mut self, idx: usize, component: impl Into<String>) {
        self.paths[idx].push(component.into());
    }

    /// Finished paths in root-to-leaf order, prefix prepended.
    fn components(self) -> Vec<Vec<String>> {
        let mut result = Vec::with_capacity(self.paths.len());
        for mut path in self.paths {
            if path.is_empty() {
                continue;
            }
            path.reverse();
            let mut with_prefix = self.prefix.clone();
            with_prefix.extend(path);
            result.push(with_prefix);
        }
        result
    }
}

/// Resolve every path the entry `(mft_id, sequence)` is known by.
///
/// Paths are vectors of components in root-to-leaf order. `max_links` 0
/// uses the context default. Sentinels: `<DirTooDeep>` past the depth
/// cap, `<Parent i-s need r>` on a parent sequence mismatch,
/// `<UnknownEntry>` for nameless entries, each followed by `<Err>`.
pub fn get_hard_links(
    ntfs: &NtfsContext,
    mft_id: u64,
    sequence: u16,
    max_links: usize,
) -> Vec<Vec<String>> {
    let options = ntfs.options();

    // The root is every path's terminal; it contributes no component of
    // its own beyond the configured prefix.
    if mft_id == MFT_RECORD_ROOT {
        return if options.prefix_components.is_empty() {
            Vec::new()
        } else {
            vec![options.prefix_components.clone()]
        };
    }

    let max = if max_links == 0 {
        options.max_links
    } else {
        max_links
    };

    let mut visitor = Visitor {
        paths: vec![Vec::new()],
        max,
        include_short_names: options.include_short_names,
        prefix: options.prefix_components.clone(),
    };

    let summary = match ntfs.get_summary(mft_id, sequence) {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    visit_names(ntfs, &summary, &mut visitor, 0, 0);

    visitor.components()
}

fn visit_names(
    ntfs: &NtfsContext,
    summary: &MftEntrySummary,
    visitor: &mut Visitor,
    idx: usize,
    depth: usize,
) {
    if depth > ntfs.options().max_directory_depth {
        visitor.add_component(idx, "<DirTooDeep>");
        visitor.add_component(idx, "<Err>");
        return;
    }

    // Prefer long names; DOS aliases only count when nothing else exists.
    let mut filenames: Vec<&FnSummary> = if visitor.include_short_names {
        summary.filenames.iter().collect()
    } else {
        summary
            .filenames
            .iter()
            .filter(|f| matches!(f.name_type.as_str(), "Win32" | "DOS+Win32" | "POSIX"))
            .collect()
    };
    if filenames.is_empty() {
        filenames = summary.filenames.iter().collect();
    }
    if filenames.is_empty() {
        visitor.add_component(idx, "<UnknownEntry>");
        visitor.add_component(idx, "<Err>");
        return;
    }

    // Keep the long name in front so the primary path uses it.
    if filenames.len() > 1 && filenames[0].name_type == "DOS" {
        filenames.swap(0, 1);
    }

    for (i, fnm) in filenames.iter().enumerate() {
        // The first link continues the current path; the rest fork.
        let visitor_idx = if i == 0 { idx } else { visitor.fork(idx, depth) };
        if visitor_idx > visitor.max {
            continue;
        }

        visitor.add_component(visitor_idx, fnm.name.clone());

        // Reached the root (or an unlinked orphan): path complete.
        if fnm.parent_entry == MFT_RECORD_ROOT || fnm.parent_entry == 0 {
            continue;
        }

        let parent = match ntfs.get_summary(fnm.parent_entry, fnm.parent_sequence) {
            Ok(p) => p,
            Err(e) => {
                visitor.add_component(visitor_idx, e.to_string());
                visitor.add_component(visitor_idx, "<Err>");
                continue;
            }
        };

        if fnm.parent_sequence != parent.sequence {
            visitor.add_component(
                visitor_idx,
                format!(
                    "<Parent {}-{} need {}>",
                    fnm.parent_entry, parent.sequence, fnm.parent_sequence
                ),
            );
            visitor.add_component(visitor_idx, "<Err>");
            continue;
        }

        visit_names(ntfs, &parent, visitor, visitor_idx, depth + 1);
    }
}

/// Pick the display name among an entry's FILE_NAMEs: the first long
/// name, falling back to a short alias.
pub fn display_name(file_names: &[FileName]) -> String {
    let mut short_name = String::new();
    for fnm in file_names {
        match fnm.name_type_name() {
            "Win32" | "DOS+Win32" | "POSIX" => return fnm.name(),
            _ => short_name = fnm.name(),
        }
    }
    short_name
}

/// Strict path resolution: the entry's primary components root to leaf,
/// failing outright on broken chains (`DirTooDeep`, `LoopDetected`, a
/// missing parent). Investigative output usually wants the lenient
/// `full_path_components` instead.
pub fn get_components(ntfs: &NtfsContext, mft_entry: &MftEntry) -> crate::error::Result<Vec<String>> {
    let mut seen = Vec::new();
    strict_components(ntfs, mft_entry, &mut seen)
}

fn strict_components(
    ntfs: &NtfsContext,
    mft_entry: &MftEntry,
    seen: &mut Vec<u64>,
) -> crate::error::Result<Vec<String>> {
    use crate::error::NtfsError;

    if seen.len() > ntfs.options().max_directory_depth {
        return Err(NtfsError::DirTooDeep);
    }

    let id = mft_entry.record_number();
    if id == MFT_RECORD_ROOT {
        return Ok(Vec::new());
    }

    let file_names = mft_entry.file_names(ntfs);
    if file_names.is_empty() {
        return Err(NtfsError::NotFound(format!("entry {} has no filename", id)));
    }
    let name = display_name(&file_names);

    let parent_id = file_names[0].mft_reference();
    if seen.contains(&parent_id) {
        return Err(NtfsError::LoopDetected(parent_id));
    }
    seen.push(parent_id);

    let parent = ntfs.get_mft(parent_id)?;
    let mut components = strict_components(ntfs, &parent, seen)?;
    components.push(name);
    Ok(components)
}

/// Eagerly resolve an entry's primary path components, root to leaf.
///
/// Used by the bulk MFT iterator where one path per row is wanted.
/// Directory components are cached. Broken chains produce sentinel
/// components (`<Err>`, `<Loop>`, `<DirTooDeep>`) instead of failing.
pub fn full_path_components(ntfs: &NtfsContext, mft_entry: &MftEntry) -> Vec<String> {
    let mut seen = Vec::new();
    components_inner(ntfs, mft_entry, &mut seen)
}

fn components_inner(ntfs: &NtfsContext, mft_entry: &MftEntry, seen: &mut Vec<u64>) -> Vec<String> {
    if seen.len() > ntfs.options().max_directory_depth {
        return vec!["<DirTooDeep>".to_string()];
    }

    let id = mft_entry.record_number();
    if id == MFT_RECORD_ROOT {
        return Vec::new();
    }

    if let Some(cached) = ntfs.full_path_lru().lock().unwrap().get(&id) {
        return cached.as_ref().clone();
    }

    let file_names = mft_entry.file_names(ntfs);
    if file_names.is_empty() {
        debug!("entry {} has no filename", id);
        return vec!["<Err>".to_string()];
    }
    let name = display_name(&file_names);

    let parent_id = file_names[0].mft_reference();
    if seen.contains(&parent_id) {
        return vec!["<Loop>".to_string(), name];
    }
    seen.push(parent_id);

    let parent = match ntfs.get_mft(parent_id) {
        Ok(p) => p,
        Err(e) => {
            debug!("entry {} has unreadable parent {}: {}", id, parent_id, e);
            return vec!["<Err>".to_string(), name];
        }
    };

    let mut components = components_inner(ntfs, &parent, seen);
    components.push(name);

    // Only directories are worth caching: files are visited once each.
    if mft_entry.is_dir(ntfs) {
        ntfs.full_path_lru()
            .lock()
            .unwrap()
            .insert(id, Arc::new(components.clone()));
    }
    components
}

/// The entry's primary path as one string, `/`-joined from the root.
pub fn full_path(ntfs: &NtfsContext, mft_entry: &MftEntry) -> String {
    let components = full_path_components(ntfs, mft_entry);
    format!("/{}", components.join("/"))
}
