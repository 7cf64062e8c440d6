//! C1 Scanner: enumerate project files, apply gitignore + exclude patterns,
//! detect language/content-type, skip binaries/symlinks/oversize.
//!
//! Grown from the teacher's `scan_repository` (same `ignore::WalkBuilder`
//! parallel walk, same noise-directory pruning and `.codesearchignore`
//! support), extended with the skip/detection contract from spec.md §4.1.

use crate::model::ContentType;
use crossbeam_channel::{Receiver, Sender};
use ignore::gitignore::Gitignore;
use ignore::WalkBuilder;
use lru::LruCache;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Cooperative cancellation flag, cheap to clone and check.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub enum SkipReason {
    Symlink,
    TooLarge,
    Binary,
    CredentialsLike,
    ReadError(String),
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub relative_path: String,
    pub size: u64,
    pub mtime: i64,
    pub language: Option<String>,
    pub content_type: ContentType,
    pub skip_reason: Option<SkipReason>,
}

impl FileRecord {
    pub fn is_skipped(&self) -> bool {
        self.skip_reason.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Default 100 MiB, per spec.md §4.1.
    pub max_file_size: u64,
    pub exclude_globs: Vec<String>,
    pub extra_ignore_file: String,
    /// Bytes probed at the head of a file for the NUL-byte binary check.
    pub binary_probe_bytes: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            exclude_globs: vec![],
            extra_ignore_file: ".codesearchignore".to_string(),
            binary_probe_bytes: 8192,
        }
    }
}

const NOISE_DIRS: &[&str] = &["target", ".git", "node_modules", ".code-search"];

/// Walks `root` depth-first, streaming [`FileRecord`]s over a channel. The
/// scan runs on its own thread; drop the receiver or cancel the token to
/// stop early. Root-level errors (e.g. `root` doesn't exist) return Err
/// before the walk starts; per-file errors are reported on the record.
pub fn scan(
    root: &Path,
    options: ScanOptions,
    cancel: CancellationToken,
) -> anyhow::Result<Receiver<FileRecord>> {
    if !root.exists() {
        anyhow::bail!("scan root does not exist: {}", root.display());
    }

    let (tx, rx) = crossbeam_channel::unbounded();
    let root_owned = root.to_path_buf();
    let opts = options;

    std::thread::spawn(move || {
        run_walk(&root_owned, &opts, &cancel, tx);
    });

    Ok(rx)
}

fn run_walk(root: &Path, options: &ScanOptions, cancel: &CancellationToken, tx: Sender<FileRecord>) {
    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(false)
        .git_ignore(true)
        .add_custom_ignore_filename(&options.extra_ignore_file);

    if !options.exclude_globs.is_empty() {
        let mut overrides = ignore::overrides::OverrideBuilder::new(root);
        for pattern in &options.exclude_globs {
            let p = if let Some(stripped) = pattern.strip_prefix('!') {
                stripped.to_string()
            } else {
                format!("!{pattern}")
            };
            let _ = overrides.add(&p);
        }
        if let Ok(ov) = overrides.build() {
            builder.overrides(ov);
        }
    }

    let root_owned = root.to_path_buf();
    let options = options.clone();
    let cancel = cancel.clone();

    builder.build_parallel().run(|| {
        let tx = tx.clone();
        let root = root_owned.clone();
        let options = options.clone();
        let cancel = cancel.clone();
        Box::new(move |result| {
            if cancel.is_cancelled() {
                return ignore::WalkState::Quit;
            }
            let Ok(entry) = result else {
                return ignore::WalkState::Continue;
            };
            let path = entry.path();
            if path
                .components()
                .any(|c| NOISE_DIRS.iter().any(|d| c.as_os_str() == *d))
            {
                return ignore::WalkState::Continue;
            }

            let is_file = entry.file_type().map(|ft| ft.is_file()).unwrap_or(false);
            let is_symlink = fs::symlink_metadata(path)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);

            if !is_file && !is_symlink {
                return ignore::WalkState::Continue;
            }

            let relative_path = pathdiff::diff_paths(path, &root)
                .unwrap_or_else(|| path.to_path_buf())
                .to_string_lossy()
                .replace('\\', "/");

            if let Some(record) = build_record(path, &relative_path, is_symlink, &options) {
                let _ = tx.send(record);
            }

            ignore::WalkState::Continue
        })
    });
}

fn build_record(
    path: &Path,
    relative_path: &str,
    is_symlink: bool,
    options: &ScanOptions,
) -> Option<FileRecord> {
    let language = detect_language(path);
    let content_type = detect_content_type(path, language.as_deref());

    if is_symlink {
        return Some(skip(relative_path, language, content_type, SkipReason::Symlink));
    }

    if is_credential_like(path) {
        return Some(skip(
            relative_path,
            language,
            content_type,
            SkipReason::CredentialsLike,
        ));
    }

    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) => {
            return Some(skip(
                relative_path,
                language,
                content_type,
                SkipReason::ReadError(e.to_string()),
            ))
        }
    };

    let size = metadata.len();
    let mtime = metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;

    if size > options.max_file_size {
        return Some(skip(relative_path, language, content_type, SkipReason::TooLarge));
    }

    match probe_binary(path, options.binary_probe_bytes) {
        Ok(true) => {
            return Some(skip(relative_path, language, content_type, SkipReason::Binary))
        }
        Ok(false) => {}
        Err(e) => {
            return Some(skip(
                relative_path,
                language,
                content_type,
                SkipReason::ReadError(e.to_string()),
            ))
        }
    }

    Some(FileRecord {
        relative_path: relative_path.to_string(),
        size,
        mtime,
        language,
        content_type,
        skip_reason: None,
    })
}

fn skip(
    relative_path: &str,
    language: Option<String>,
    content_type: ContentType,
    reason: SkipReason,
) -> FileRecord {
    FileRecord {
        relative_path: relative_path.to_string(),
        size: 0,
        mtime: 0,
        language,
        content_type,
        skip_reason: Some(reason),
    }
}

fn probe_binary(path: &Path, probe_bytes: usize) -> std::io::Result<bool> {
    use std::io::Read;
    let mut file = fs::File::open(path)?;
    let mut buf = vec![0u8; probe_bytes];
    let n = file.read(&mut buf)?;
    Ok(buf[..n].contains(&0u8))
}

fn is_credential_like(path: &Path) -> bool {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_lowercase();
    name == ".env"
        || name.starts_with(".env.")
        || name.ends_with(".pem")
        || name.contains("credentials")
}

const LANGUAGE_EXTENSIONS: &[(&str, &str)] = &[
    ("rs", "rust"),
    ("py", "python"),
    ("go", "go"),
    ("js", "javascript"),
    ("jsx", "javascript"),
    ("mjs", "javascript"),
    ("cjs", "javascript"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("java", "java"),
    ("cpp", "cpp"),
    ("cc", "cpp"),
    ("cxx", "cpp"),
    ("h", "cpp"),
    ("hpp", "cpp"),
    ("php", "php"),
    ("rb", "ruby"),
    ("cs", "csharp"),
    ("md", "markdown"),
    ("mdx", "markdown"),
    ("txt", "text"),
    ("json", "json"),
    ("yml", "yaml"),
    ("yaml", "yaml"),
    ("toml", "toml"),
];

const SPECIAL_FILENAMES: &[(&str, &str)] = &[
    ("Dockerfile", "dockerfile"),
    ("Makefile", "makefile"),
    ("go.mod", "go"),
    ("Cargo.toml", "toml"),
];

pub fn detect_language(path: &Path) -> Option<String> {
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if let Some((_, lang)) = SPECIAL_FILENAMES.iter().find(|(f, _)| *f == name) {
            return Some(lang.to_string());
        }
    }
    let ext = path.extension().and_then(|s| s.to_str())?.to_lowercase();
    LANGUAGE_EXTENSIONS
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, lang)| lang.to_string())
}

pub fn detect_content_type(path: &Path, language: Option<&str>) -> ContentType {
    match language {
        Some("markdown") => ContentType::Markdown,
        Some("json") | Some("yaml") | Some("toml") | Some("dockerfile") | Some("makefile") => {
            ContentType::Config
        }
        Some("text") => ContentType::Text,
        Some(_) => ContentType::Code,
        None => {
            let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
            if ext.is_empty() {
                ContentType::Other
            } else {
                ContentType::Text
            }
        }
    }
}

/// Bounded cache of parsed `.gitignore` matchers keyed by directory,
/// invalidated when the underlying file's mtime changes. Used outside the
/// main walk (e.g. by the Coordinator's gitignore-reconciliation phase) to
/// cheaply re-check whether a previously-indexed path is now excluded.
pub struct GitignoreCache {
    inner: Mutex<LruCache<PathBuf, (SystemTime, Arc<Gitignore>)>>,
}

impl GitignoreCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
        }
    }

    /// Returns whether `path` is ignored by the `.gitignore` in `dir`
    /// (parsing and caching it if needed).
    pub fn is_ignored(&self, dir: &Path, path: &Path, is_dir: bool) -> bool {
        let gitignore_path = dir.join(".gitignore");
        let mtime = fs::metadata(&gitignore_path)
            .and_then(|m| m.modified())
            .ok();

        let mut cache = self.inner.lock().unwrap();
        let needs_reload = match (cache.get(&dir.to_path_buf()), mtime) {
            (Some((cached_mtime, _)), Some(current)) => *cached_mtime != current,
            (Some(_), None) => true,
            (None, _) => true,
        };

        if needs_reload {
            let (matcher, _) = Gitignore::new(&gitignore_path);
            let stamp = mtime.unwrap_or(SystemTime::UNIX_EPOCH);
            cache.put(dir.to_path_buf(), (stamp, Arc::new(matcher)));
        }

        let (_, matcher) = cache.get(&dir.to_path_buf()).unwrap();
        matcher.matched(path, is_dir).is_ignore()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn detects_language_by_extension_and_special_filename() {
        assert_eq!(detect_language(Path::new("a.rs")).as_deref(), Some("rust"));
        assert_eq!(
            detect_language(Path::new("Dockerfile")).as_deref(),
            Some("dockerfile")
        );
        assert_eq!(detect_language(Path::new("a.unknownext")), None);
    }

    #[test]
    fn credential_like_filenames_are_flagged() {
        assert!(is_credential_like(Path::new(".env")));
        assert!(is_credential_like(Path::new("key.pem")));
        assert!(is_credential_like(Path::new("aws_credentials.json")));
        assert!(!is_credential_like(Path::new("main.rs")));
    }

    #[test]
    fn scan_skips_oversize_binary_and_symlinked_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("good.rs"), "fn main() {}").unwrap();

        let mut binary = std::fs::File::create(dir.path().join("bin.dat")).unwrap();
        binary.write_all(&[0u8, 1, 2, 3, 0, 4]).unwrap();

        let big_path = dir.path().join("big.txt");
        std::fs::write(&big_path, vec![b'a'; 200]).unwrap();

        let opts = ScanOptions {
            max_file_size: 100,
            ..Default::default()
        };
        let rx = scan(dir.path(), opts, CancellationToken::new()).unwrap();
        let records: Vec<_> = rx.iter().collect();

        let good = records.iter().find(|r| r.relative_path == "good.rs").unwrap();
        assert!(!good.is_skipped());

        let bin = records.iter().find(|r| r.relative_path == "bin.dat").unwrap();
        assert!(matches!(bin.skip_reason, Some(SkipReason::Binary)));

        let big = records.iter().find(|r| r.relative_path == "big.txt").unwrap();
        assert!(matches!(big.skip_reason, Some(SkipReason::TooLarge)));
    }

    #[test]
    fn gitignore_cache_reflects_mtime_changes() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "ignored.txt\n").unwrap();
        let cache = GitignoreCache::new(16);

        let target = dir.path().join("ignored.txt");
        assert!(cache.is_ignored(dir.path(), &target, false));
        assert!(!cache.is_ignored(dir.path(), &dir.path().join("other.txt"), false));

        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(dir.path().join(".gitignore"), "other.txt\n").unwrap();

        // mtime changed, so the stale matcher must be reloaded: the file
        // that used to be ignored no longer is, and vice versa.
        assert!(!cache.is_ignored(dir.path(), &target, false));
        assert!(cache.is_ignored(dir.path(), &dir.path().join("other.txt"), false));
    }
}
