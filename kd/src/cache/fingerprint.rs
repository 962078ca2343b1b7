//! Cache keys and input fingerprints
//!
//! The object id hash names an invocation: it covers the rule, its
//! implementation version and the canonical bytes of its arguments, and
//! selects the destination directory. The input fingerprint additionally
//! covers the contents of every file and directory the arguments reference,
//! and decides whether the inputs changed since the last success.

use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::value::Args;

/// Bumped when the meaning of cached results changes across releases
pub const ENGINE_VERSION: &str = "kiln-engine/1";

fn update_str(hasher: &mut blake3::Hasher, s: &str) {
    update_bytes(hasher, s.as_bytes());
}

fn update_bytes(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn update_args(hasher: &mut blake3::Hasher, args: &Args) {
    hasher.update(&(args.len() as u64).to_le_bytes());
    for (name, value) in args {
        update_str(hasher, name);
        update_bytes(hasher, &value.canonical_bytes());
    }
}

/// Cache key of `rule` at `version` applied to `args`, hex encoded
pub fn object_id_hash(rule: &str, version: &str, args: &Args) -> String {
    let mut hasher = blake3::Hasher::new();
    update_str(&mut hasher, ENGINE_VERSION);
    update_str(&mut hasher, rule);
    update_str(&mut hasher, version);
    update_args(&mut hasher, args);
    hex::encode(hasher.finalize().as_bytes())
}

/// Fingerprint of the invocation inputs, including referenced file contents
///
/// Does blocking IO; call from a blocking context.
pub fn input_fingerprint(object_id_hash: &str, args: &Args) -> String {
    debug!(%object_id_hash, "input_fingerprint: called");
    let mut hasher = blake3::Hasher::new();
    update_str(&mut hasher, object_id_hash);

    let paths: BTreeSet<PathBuf> = args
        .values()
        .flat_map(|value| value.referenced_paths())
        .map(Path::to_path_buf)
        .collect();

    for path in &paths {
        update_str(&mut hasher, &path.to_string_lossy());
        hash_path(&mut hasher, path);
    }
    hex::encode(hasher.finalize().as_bytes())
}

fn hash_path(hasher: &mut blake3::Hasher, path: &Path) {
    let Ok(meta) = std::fs::metadata(path) else {
        hasher.update(b"M");
        return;
    };
    if meta.is_dir() {
        hasher.update(b"D");
        hash_directory(hasher, path);
    } else {
        hasher.update(b"F");
        hash_file(hasher, path);
    }
}

fn hash_file(hasher: &mut blake3::Hasher, path: &Path) {
    let mut file_hasher = blake3::Hasher::new();
    let read = File::open(path).and_then(|mut file| io::copy(&mut file, &mut file_hasher));
    match read {
        Ok(len) => {
            hasher.update(&len.to_le_bytes());
            hasher.update(file_hasher.finalize().as_bytes());
        }
        Err(e) => {
            warn!(?path, error = %e, "hash_file: unreadable, hashing as missing");
            hasher.update(b"M");
        }
    }
}

fn hash_directory(hasher: &mut blake3::Hasher, root: &Path) {
    let walker = WalkDir::new(root).min_depth(1).sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(?root, error = %e, "hash_directory: skipping unreadable entry");
                hasher.update(b"?");
                continue;
            }
        };
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        update_str(hasher, &relative.to_string_lossy());

        let file_type = entry.file_type();
        if file_type.is_dir() {
            hasher.update(b"d");
        } else if file_type.is_symlink() {
            hasher.update(b"l");
            let target = std::fs::read_link(entry.path()).unwrap_or_default();
            update_str(hasher, &target.to_string_lossy());
        } else {
            hasher.update(b"f");
            hash_file(hasher, entry.path());
        }
    }
}
