//! Installation of challenge material and the flag into a workspace.
//!
//! Challenge directories may contain *option directories* (immediate
//! children named `_*`): per-user variants of the challenge. The base
//! material is unpacked first, then one deterministically selected option
//! is unpacked over it.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use sha2::Digest;
use sha2::Sha256;

use crate::catalog::DojoChallenge;
use crate::engine::Engine;

use super::builder::DOJO_BIN_PATH;

/// In-container challenge directory.
const CHALLENGE_DIR: &str = "/challenge";

/// Wrap a flag value in the submission format.
fn wrap_flag(flag: &str) -> String {
    format!("pwn.college{{{flag}}}\n")
}

/// The option directories of a challenge, sorted by path.
pub fn option_dirs(challenge_path: &Path) -> Result<Vec<PathBuf>> {
    let mut options = Vec::new();
    let entries = std::fs::read_dir(challenge_path).with_context(|| {
        format!(
            "failed to read challenge directory `{}`",
            challenge_path.display()
        )
    })?;

    for entry in entries {
        let entry = entry.context("failed to read challenge directory entry")?;
        let path = entry.path();
        if path.is_dir()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('_'))
        {
            options.push(path);
        }
    }

    options.sort();
    Ok(options)
}

/// Select the option index for a user on a challenge.
///
/// The selection hashes `{secret}_{user}_{challenge}` and reduces the
/// first eight digest bytes (little-endian) modulo the option count, so
/// it is stable across runs and uniform across users.
pub fn select_option(secret: &str, as_user_id: i64, challenge_id: i64, count: usize) -> usize {
    let digest = Sha256::digest(format!("{secret}_{as_user_id}_{challenge_id}").as_bytes());
    let prefix = u64::from_le_bytes(digest[..8].try_into().expect("digest should have 8 bytes"));
    (prefix % count as u64) as usize
}

/// Tar up a directory's contents, excluding the named top-level entries.
///
/// Entry paths are relative to `dir` so that unpacking an option archive
/// over the base archive overwrites matching files.
pub fn archive_dir(dir: &Path, exclude_top: &HashSet<OsString>) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(true);

    let walker = walkdir::WalkDir::new(dir)
        .min_depth(1)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() != 1 || !exclude_top.contains(e.file_name()));

    for entry in walker {
        let entry = entry.context("failed to walk challenge directory")?;
        let rel = entry
            .path()
            .strip_prefix(dir)
            .expect("walked paths should be under the root");

        if entry.file_type().is_dir() {
            builder
                .append_dir(rel, entry.path())
                .with_context(|| format!("failed to archive directory `{}`", rel.display()))?;
        } else if entry.file_type().is_file() {
            builder
                .append_path_with_name(entry.path(), rel)
                .with_context(|| format!("failed to archive file `{}`", rel.display()))?;
        }
    }

    builder.into_inner().context("failed to finish archive")
}

/// Install challenge material into a running workspace container.
///
/// # Errors
///
/// Returns an error if archiving, uploading, or the permission sweep
/// fails.
pub async fn install_challenge(
    engine: &Engine,
    container: &str,
    secret: &str,
    as_user_id: i64,
    challenge: &DojoChallenge,
    challenge_path: &Path,
) -> Result<()> {
    engine
        .exec(
            container,
            &[&format!("{DOJO_BIN_PATH}/mkdir"), "-p", CHALLENGE_DIR],
        )
        .await?;

    let options = option_dirs(challenge_path)?;
    let excluded: HashSet<OsString> = options
        .iter()
        .filter_map(|p| p.file_name().map(OsString::from))
        .collect();

    let base = archive_dir(challenge_path, &excluded)?;
    engine.upload_archive(container, CHALLENGE_DIR, base).await?;

    if !options.is_empty() {
        let index = select_option(secret, as_user_id, challenge.challenge_id, options.len());
        let option = archive_dir(&options[index], &HashSet::new())?;
        engine
            .upload_archive(container, CHALLENGE_DIR, option)
            .await?;
    }

    // Setuid root across the challenge tree is intentional for the
    // challenge model; on non-executable files the bit is benign.
    let find = format!("{DOJO_BIN_PATH}/find");
    let chown = format!("{DOJO_BIN_PATH}/chown");
    let chmod = format!("{DOJO_BIN_PATH}/chmod");
    engine
        .exec(
            container,
            &[
                &find,
                "/challenge/",
                "-mindepth",
                "1",
                "-exec",
                &chown,
                "root:root",
                "{}",
                ";",
            ],
        )
        .await?;
    engine
        .exec(
            container,
            &[
                &find, "/challenge/", "-mindepth", "1", "-exec", &chmod, "4755", "{}", ";",
            ],
        )
        .await?;

    Ok(())
}

/// The flag value for a workspace.
pub fn flag_value(
    secret: &str,
    practice: bool,
    impersonating: bool,
    as_user_id: i64,
    challenge_id: i64,
) -> String {
    if practice {
        String::from("practice")
    } else if impersonating {
        String::from("support_flag")
    } else {
        crate::flag::serialize_user_flag(secret, as_user_id, challenge_id)
    }
}

/// Write the wrapped flag to the container's stdin.
pub async fn insert_flag(engine: &Engine, container: &str, flag: &str) -> Result<()> {
    engine
        .write_stdin(container, wrap_flag(flag).as_bytes())
        .await
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;

    /// Build a challenge directory with two option variants.
    fn challenge_tree() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let challenge = root.path().join("module/challenge");
        fs::create_dir_all(challenge.join("bin")).unwrap();
        fs::write(challenge.join("run"), b"#!/bin/sh\n").unwrap();
        fs::write(challenge.join("bin/helper"), b"helper\n").unwrap();
        fs::create_dir_all(challenge.join("_a")).unwrap();
        fs::write(challenge.join("_a/run"), b"variant a\n").unwrap();
        fs::create_dir_all(challenge.join("_b")).unwrap();
        fs::write(challenge.join("_b/run"), b"variant b\n").unwrap();
        // An underscore-prefixed file is not an option directory.
        fs::write(challenge.join("_notes"), b"keep\n").unwrap();
        root
    }

    /// Entry names of a tar archive.
    fn entry_names(archive: &[u8]) -> Vec<String> {
        let mut names: Vec<String> = tar::Archive::new(archive)
            .entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_string()
            })
            .collect();
        names.sort();
        names
    }

    #[test]
    fn option_dirs_are_sorted_directories_only() {
        let root = challenge_tree();
        let challenge = root.path().join("module/challenge");

        let options = option_dirs(&challenge).unwrap();
        let names: Vec<_> = options
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["_a", "_b"]);
    }

    #[test]
    fn base_archive_excludes_option_directories() {
        let root = challenge_tree();
        let challenge = root.path().join("module/challenge");
        let options = option_dirs(&challenge).unwrap();
        let excluded: HashSet<OsString> = options
            .iter()
            .filter_map(|p| p.file_name().map(OsString::from))
            .collect();

        let archive = archive_dir(&challenge, &excluded).unwrap();
        assert_eq!(
            entry_names(&archive),
            vec!["_notes", "bin", "bin/helper", "run"]
        );
    }

    #[test]
    fn option_archive_overlays_base_paths() {
        let root = challenge_tree();
        let option = root.path().join("module/challenge/_a");

        let archive = archive_dir(&option, &HashSet::new()).unwrap();
        assert_eq!(entry_names(&archive), vec!["run"]);
    }

    #[test]
    fn option_selection_is_deterministic_and_in_range() {
        let first = select_option("sk", 1, 2, 4);
        for _ in 0..8 {
            assert_eq!(select_option("sk", 1, 2, 4), first);
        }
        assert!(first < 4);

        // H = SHA-256("sk_1_2"); index = LE-u64(H[0..8]) mod 4.
        let digest = Sha256::digest(b"sk_1_2");
        let expected = (u64::from_le_bytes(digest[..8].try_into().unwrap()) % 4) as usize;
        assert_eq!(first, expected);
    }

    #[test]
    fn option_selection_varies_with_inputs() {
        let base = select_option("sk", 1, 2, 1000);
        let others = [
            select_option("sk", 2, 2, 1000),
            select_option("sk", 1, 3, 1000),
            select_option("other", 1, 2, 1000),
        ];
        assert!(others.iter().any(|o| *o != base));
    }

    #[test]
    fn flag_precedence() {
        assert_eq!(flag_value("sk", true, true, 1, 2), "practice");
        assert_eq!(flag_value("sk", false, true, 1, 2), "support_flag");
        assert_eq!(
            flag_value("sk", false, false, 1, 2),
            crate::flag::serialize_user_flag("sk", 1, 2)
        );
    }

    #[test]
    fn wrapped_flag_format() {
        assert_eq!(wrap_flag("practice"), "pwn.college{practice}\n");
    }
}
