/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Reconciliation: make a remote directory tree match a local one.
//!
//! The engine assumes the sidecar database describes a subset, never a
//! superset, of the files on the device, that recorded sizes match the
//! device, and that recorded mtimes match the *local* sources. Users of
//! fast mode must not touch the mirrored tree by hand: out-of-band
//! changes stay invisible until the next full run.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::debug;

use crate::db::{Database, DbEntry};
use crate::progress::Progress;
use crate::session::SyncSession;
use crate::{
    local_file_mode, local_file_mtime, shell, wire, AdbDevice, AdbError, DirEntry, Result,
    UnixPath, UnixPathBuf,
};

/// Seconds between database checkpoints while pushing.
pub(crate) const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(10);

/// Local and tracked mtimes within this many seconds count as equal.
const MTIME_TOLERANCE_SECS: i64 = 5;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Derive the remote view from the sidecar database instead of
    /// listing the device. Misses changes the database does not know
    /// about.
    pub fast: bool,
    /// Plan and report, but do not touch the device.
    pub trial_run: bool,
    /// Directories are only removed recursively when their path starts
    /// with this prefix; `None` refuses all directory removals.
    pub remove_prefix: Option<String>,
    /// Pair names case-insensitively, as FAT-backed /sdcard builds do.
    pub case_insensitive: bool,
    /// Name of the sidecar database blob at the remote root.
    pub db_name: String,
}

impl Default for SyncOptions {
    fn default() -> SyncOptions {
        SyncOptions {
            fast: false,
            trial_run: false,
            remove_prefix: None,
            case_insensitive: true,
            db_name: crate::db::DB_NAME.to_owned(),
        }
    }
}

/// Counters reported back to the caller. Planned figures are filled in
/// even on a trial run; executed figures only when work was applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub planned_adds: usize,
    pub planned_removes: usize,
    pub planned_rmdirs: usize,
    pub planned_bytes: u64,
    pub files_pushed: usize,
    pub bytes_pushed: u64,
    pub files_removed: usize,
    pub dirs_removed: usize,
}

/// One scheduled upload: push `local_dir/entry.name` to
/// `remote_dir/entry.name`, recording the result under `key`.
#[derive(Debug, Clone)]
pub(crate) struct AddFile {
    pub local_dir: PathBuf,
    pub entry: DirEntry,
    pub remote_dir: UnixPathBuf,
    pub key: String,
}

/// The classified work, in execution order: directory removals, then
/// file removals, then uploads.
#[derive(Debug, Default)]
pub(crate) struct Plan {
    pub to_add: Vec<AddFile>,
    pub to_remove: Vec<UnixPathBuf>,
    pub to_remove_dir: Vec<UnixPathBuf>,
    pub new_db: Database,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty() && self.to_remove_dir.is_empty()
    }
}

/// One tier of a local walk, shaped like [`crate::session::WalkTier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTier {
    pub dir: PathBuf,
    pub dirs: Vec<DirEntry>,
    pub files: Vec<DirEntry>,
}

/// Walks the local tree depth-first, yielding one tier per directory.
/// Unreadable entries are reported through *warning* and skipped.
pub fn walk_local<'a, W: FnMut(&str) + Send + 'a>(root: &Path, warning: W) -> LocalWalk<'a> {
    LocalWalk {
        pending: vec![root.to_path_buf()],
        warning: Box::new(warning),
    }
}

pub struct LocalWalk<'a> {
    pending: Vec<PathBuf>,
    warning: Box<dyn FnMut(&str) + Send + 'a>,
}

impl Iterator for LocalWalk<'_> {
    type Item = LocalTier;

    fn next(&mut self) -> Option<LocalTier> {
        let dir = self.pending.pop()?;
        let (dirs, files) = read_local_tier(&dir, &mut *self.warning);
        for sub in dirs.iter().rev() {
            self.pending.push(dir.join(&sub.name));
        }
        Some(LocalTier { dir, dirs, files })
    }
}

/// Lists one local directory, split into subdirectories and regular
/// files, both sorted by name. Anything unreadable or non-UTF-8 is
/// reported through *warning* and dropped; other specials are dropped
/// silently, matching the remote listing.
pub(crate) fn read_local_tier(
    dir: &Path,
    warning: &mut (dyn FnMut(&str) + Send),
) -> (Vec<DirEntry>, Vec<DirEntry>) {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let reader = match std::fs::read_dir(dir) {
        Ok(reader) => reader,
        Err(e) => {
            warning(&format!("Unreadable: {}: {}", dir.display(), e));
            return (dirs, files);
        }
    };
    for item in reader {
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                warning(&format!("Unreadable entry in {}: {}", dir.display(), e));
                continue;
            }
        };
        let name = match item.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                warning(&format!(
                    "Skipping non-UTF-8 name {:?} in {}",
                    raw,
                    dir.display()
                ));
                continue;
            }
        };
        let full = dir.join(&name);
        // Follows symlinks, so a link to a file mirrors as that file.
        let meta = match std::fs::metadata(&full) {
            Ok(meta) => meta,
            Err(e) => {
                warning(&format!("Unreadable: {}: {}", full.display(), e));
                continue;
            }
        };
        let entry = DirEntry {
            mode: local_file_mode(&meta),
            size: if meta.is_file() { meta.len() } else { 0 },
            mtime: local_file_mtime(&meta),
            name,
        };
        if meta.is_dir() {
            dirs.push(entry);
        } else if meta.is_file() {
            files.push(entry);
        }
    }
    dirs.sort_by(|a, b| a.name.cmp(&b.name));
    files.sort_by(|a, b| a.name.cmp(&b.name));
    (dirs, files)
}

/// The remote tree as the sidecar database describes it, for planning
/// without touching the device.
#[derive(Debug, Default)]
pub(crate) struct DbTree {
    tiers: BTreeMap<String, DbTier>,
}

#[derive(Debug, Default)]
struct DbTier {
    dirs: BTreeSet<String>,
    files: Vec<DirEntry>,
}

impl DbTree {
    pub fn from_db(db: &Database) -> DbTree {
        let mut tree = DbTree::default();
        tree.tiers.entry(String::new()).or_default();
        for (key, entry) in db.iter() {
            let (dir, name) = split_key(key);
            tree.ensure_dir(dir);
            tree.tiers
                .get_mut(dir)
                .expect("tier just ensured")
                .files
                .push(DirEntry {
                    mode: wire::S_IFREG | 0o644,
                    size: entry.size,
                    mtime: entry.mtime,
                    name: name.to_owned(),
                });
        }
        for tier in tree.tiers.values_mut() {
            tier.files.sort_by(|a, b| a.name.cmp(&b.name));
        }
        tree
    }

    fn ensure_dir(&mut self, dir: &str) {
        if dir.is_empty() || self.tiers.contains_key(dir) {
            return;
        }
        self.tiers.insert(dir.to_owned(), DbTier::default());
        let (parent, name) = split_key(dir);
        self.ensure_dir(parent);
        self.tiers
            .get_mut(parent)
            .expect("parent just ensured")
            .dirs
            .insert(name.to_owned());
    }

    pub(crate) fn read_tier(&self, rel: &str) -> (Vec<DirEntry>, Vec<DirEntry>) {
        match self.tiers.get(rel) {
            None => (Vec::new(), Vec::new()),
            Some(tier) => {
                let dirs = tier
                    .dirs
                    .iter()
                    .map(|name| DirEntry {
                        mode: wire::S_IFDIR | 0o755,
                        size: 0,
                        mtime: 0,
                        name: name.clone(),
                    })
                    .collect();
                (dirs, tier.files.clone())
            }
        }
    }
}

fn split_key(key: &str) -> (&str, &str) {
    match key.rfind('/') {
        Some(i) => (&key[..i], &key[i + 1..]),
        None => ("", key),
    }
}

/// Where the planner's right-hand tiers come from: the device itself,
/// or the database when running fast.
pub(crate) enum RemoteView<'a> {
    Live(&'a mut SyncSession),
    Synthetic(DbTree),
}

impl RemoteView<'_> {
    async fn read_tier(
        &mut self,
        dir: &UnixPath,
        rel: &str,
    ) -> Result<(Vec<DirEntry>, Vec<DirEntry>)> {
        match self {
            RemoteView::Live(session) => {
                let (mut dirs, mut files) = session.list_dir(dir).await?;
                dirs.sort_by(|a, b| a.name.cmp(&b.name));
                files.sort_by(|a, b| a.name.cmp(&b.name));
                Ok((dirs, files))
            }
            RemoteView::Synthetic(tree) => Ok(tree.read_tier(rel)),
        }
    }
}

pub(crate) fn fold_name(name: &str, case_insensitive: bool) -> String {
    if case_insensitive {
        name.to_lowercase()
    } else {
        name.to_owned()
    }
}

fn child_key(rel: &str, folded: &str) -> String {
    if rel.is_empty() {
        folded.to_owned()
    } else {
        format!("{}/{}", rel, folded)
    }
}

/// Keys *entries* by folded name. Names that collide after folding are
/// reported and dropped, keeping the first in sorted order.
fn fold_entries(
    entries: Vec<DirEntry>,
    case_insensitive: bool,
    origin: &str,
    warning: &mut (dyn FnMut(&str) + Send),
) -> BTreeMap<String, DirEntry> {
    let mut map: BTreeMap<String, DirEntry> = BTreeMap::new();
    for entry in entries {
        let key = fold_name(&entry.name, case_insensitive);
        if let Some(prev) = map.get(&key) {
            warning(&format!(
                "Names collide after case folding in {}: {:?} and {:?}; keeping {:?}",
                origin, prev.name, entry.name, prev.name
            ));
            continue;
        }
        map.insert(key, entry);
    }
    map
}

/// Whether the pair might hold different content. False negatives
/// would lose data; false positives only cost a re-push. The tracked
/// mtime stands in for the remote one, which lies on many devices.
pub(crate) fn entries_differ(local: &DirEntry, remote: &DirEntry, tracked_mtime: u32) -> bool {
    if local.size != remote.size {
        return true;
    }
    (local.mtime as i64 - tracked_mtime as i64).abs() > MTIME_TOLERANCE_SECS
}

/// Whether the engine may `rm -r` this path.
pub(crate) fn removal_allowed(path: &UnixPath, prefix: Option<&str>) -> bool {
    match prefix {
        Some(p) if !p.is_empty() => format!("{}", path.display()).starts_with(p),
        _ => false,
    }
}

/// Descends the local tree and the remote view in lockstep and
/// classifies every child. Directories missing on the remote side are
/// treated as present and empty: listing a nonexistent remote path
/// yields nothing, so their contents schedule as plain adds. Extra
/// remote entries become removals, except the database blob at the
/// root. Traversal is pre-order over the sorted local names.
pub(crate) async fn build_plan(
    local_root: &Path,
    remote_root: &UnixPath,
    view: &mut RemoteView<'_>,
    db: &Database,
    can_use_mtime: bool,
    options: &SyncOptions,
    warning: &mut (dyn FnMut(&str) + Send),
) -> Result<Plan> {
    let mut plan = Plan::default();
    let mut db_mtimes: BTreeMap<String, u32> =
        db.iter().map(|(k, e)| (k.to_owned(), e.mtime)).collect();
    let db_blob_key = fold_name(&options.db_name, options.case_insensitive);

    let mut stack: Vec<(PathBuf, UnixPathBuf, String)> = vec![(
        local_root.to_path_buf(),
        remote_root.to_path_buf(),
        String::new(),
    )];

    while let Some((l_dir, r_dir, rel)) = stack.pop() {
        let (l_dirs, l_files) = read_local_tier(&l_dir, warning);
        let (r_dirs, r_files) = view.read_tier(&r_dir, &rel).await?;

        let l_origin = l_dir.display().to_string();
        let r_origin = r_dir.display().to_string();
        let l_files = fold_entries(l_files, options.case_insensitive, &l_origin, warning);
        let r_files = fold_entries(r_files, options.case_insensitive, &r_origin, warning);

        for (key, l_entry) in &l_files {
            let db_key = child_key(&rel, key);
            match r_files.get(key) {
                None => plan.to_add.push(AddFile {
                    local_dir: l_dir.clone(),
                    entry: l_entry.clone(),
                    remote_dir: r_dir.clone(),
                    key: db_key,
                }),
                Some(r_entry) => {
                    if can_use_mtime {
                        db_mtimes.insert(db_key.clone(), r_entry.mtime);
                    }
                    let tracked = db_mtimes.get(&db_key).copied().unwrap_or(0);
                    if entries_differ(l_entry, r_entry, tracked) {
                        plan.to_add.push(AddFile {
                            local_dir: l_dir.clone(),
                            entry: l_entry.clone(),
                            remote_dir: r_dir.clone(),
                            key: db_key,
                        });
                    } else {
                        // Identical but untracked files can happen after
                        // a database loss; adopt them rather than
                        // re-pushing.
                        let carried = db.get(&db_key).unwrap_or_else(|| DbEntry {
                            mtime: if can_use_mtime {
                                r_entry.mtime
                            } else {
                                l_entry.mtime
                            },
                            size: r_entry.size,
                        });
                        plan.new_db.insert(db_key, carried);
                    }
                }
            }
        }

        for (key, r_entry) in &r_files {
            if l_files.contains_key(key) {
                continue;
            }
            if rel.is_empty() && *key == db_blob_key {
                // Never schedule our own database for removal.
                continue;
            }
            plan.to_remove.push(r_dir.join(&r_entry.name));
        }

        let l_dirs = fold_entries(l_dirs, options.case_insensitive, &l_origin, warning);
        let r_dirs = fold_entries(r_dirs, options.case_insensitive, &r_origin, warning);

        for (key, r_entry) in &r_dirs {
            if !l_dirs.contains_key(key) {
                plan.to_remove_dir.push(r_dir.join(&r_entry.name));
            }
        }

        let children: Vec<(PathBuf, UnixPathBuf, String)> = l_dirs
            .iter()
            .map(|(key, l_entry)| {
                let r_name = r_dirs
                    .get(key)
                    .map(|e| e.name.clone())
                    .unwrap_or_else(|| l_entry.name.clone());
                (
                    l_dir.join(&l_entry.name),
                    r_dir.join(&r_name),
                    child_key(&rel, key),
                )
            })
            .collect();
        for child in children.into_iter().rev() {
            stack.push(child);
        }
    }

    Ok(plan)
}

/// Makes *remote_root* on *device* match *local_root*.
///
/// Non-fatal conditions (unreadable local files, refused directory
/// removals, case collisions) are reported through *warning* and
/// skipped. Fatal errors abort the run; the database checkpoint
/// written before the first mutation keeps a rerun consistent.
pub async fn sync<W>(
    device: &AdbDevice,
    local_root: &Path,
    remote_root: &UnixPath,
    options: &SyncOptions,
    progress: &Progress,
    mut warning: W,
) -> Result<SyncSummary>
where
    W: FnMut(&str) + Send,
{
    if !local_root.is_dir() {
        return Err(AdbError::LocalIo {
            path: local_root.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
        });
    }

    let mut session = SyncSession::open(device).await?;
    let db = Database::load(&mut session, remote_root, &options.db_name).await;
    session.finish().await;

    let can_use_mtime = device.does_mtime_work().await?;
    debug!(
        "device {}: {} tracked files, mtime support {}",
        device.serial,
        db.len(),
        can_use_mtime
    );

    if options.fast {
        progress.line(&format!("Scanning {}", local_root.display()));
    } else {
        progress.line(&format!(
            "Comparing {} to {}",
            local_root.display(),
            remote_root.display()
        ));
    }

    let mut plan = if options.fast {
        let mut view = RemoteView::Synthetic(DbTree::from_db(&db));
        build_plan(
            local_root,
            remote_root,
            &mut view,
            &db,
            can_use_mtime,
            options,
            &mut warning,
        )
        .await?
    } else {
        let mut session = SyncSession::open(device).await?;
        let result = {
            let mut view = RemoteView::Live(&mut session);
            build_plan(
                local_root,
                remote_root,
                &mut view,
                &db,
                can_use_mtime,
                options,
                &mut warning,
            )
            .await
        };
        session.finish().await;
        result?
    };

    let mut summary = SyncSummary {
        planned_adds: plan.to_add.len(),
        planned_removes: plan.to_remove.len(),
        planned_rmdirs: plan.to_remove_dir.len(),
        planned_bytes: plan.to_add.iter().map(|a| a.entry.size).sum(),
        ..SyncSummary::default()
    };

    if options.trial_run {
        if summary.planned_rmdirs > 0 {
            progress.note(&format!(
                "Would remove {}",
                plural(summary.planned_rmdirs, "dir")
            ));
        }
        if summary.planned_removes > 0 {
            progress.note(&format!(
                "Would remove {}",
                plural(summary.planned_removes, "file")
            ));
        }
        if summary.planned_adds > 0 {
            progress.note(&format!(
                "Would copy {} in {}",
                fmt_bytes(summary.planned_bytes),
                plural(summary.planned_adds, "file")
            ));
        }
        return Ok(summary);
    }

    if plan.is_empty() && plan.new_db == db {
        debug!("{} already up to date", remote_root.display());
        return Ok(summary);
    }

    let mut session = SyncSession::open(device).await?;
    let result = execute(
        device,
        &mut session,
        remote_root,
        options,
        &mut plan,
        &mut summary,
        progress,
        &mut warning,
    )
    .await;
    session.finish().await;
    result?;
    Ok(summary)
}

#[allow(clippy::too_many_arguments)]
async fn execute(
    device: &AdbDevice,
    session: &mut SyncSession,
    remote_root: &UnixPath,
    options: &SyncOptions,
    plan: &mut Plan,
    summary: &mut SyncSummary,
    progress: &Progress,
    warning: &mut (dyn FnMut(&str) + Send),
) -> Result<()> {
    let Plan {
        to_add,
        to_remove,
        to_remove_dir,
        new_db,
    } = plan;

    // Checkpoint before the first mutation. From here on a crash
    // leaves the tree consistent with the stored database, at worst
    // missing the newest pushes.
    new_db.store(session, remote_root, &options.db_name).await?;

    let total = (to_remove_dir.len() + to_remove.len() + to_add.len()).max(1);
    let mut done = 0usize;

    // Removals precede additions: a directory can be in the way of a
    // file of the same name.
    for dir in to_remove_dir.iter() {
        done += 1;
        progress.line(&format!(
            "[{:3}%] Rmdir {}/",
            done * 100 / total,
            display_relative(dir, remote_root)
        ));
        if !removal_allowed(dir, options.remove_prefix.as_deref()) {
            warning(&format!(
                "Refusing to remove directory {} outside the removal prefix; remove it by hand.",
                dir.display()
            ));
            continue;
        }
        device
            .simple_shell(&format!(
                "rm -r {}",
                shell::quote(&dir.display().to_string())
            ))
            .await?;
        summary.dirs_removed += 1;
    }

    for file in to_remove.iter() {
        done += 1;
        progress.line(&format!(
            "[{:3}%] Remove {}",
            done * 100 / total,
            display_relative(file, remote_root)
        ));
        device
            .simple_shell(&format!("rm {}", shell::quote(&file.display().to_string())))
            .await?;
        summary.files_removed += 1;
    }

    let mut estimator = TimeEstimator::new(to_add.iter().map(|a| a.entry.size).sum());
    let mut next_autosave = Instant::now() + AUTOSAVE_INTERVAL;
    if !to_add.is_empty() {
        progress.note(&format!(
            "Copying {} in {}",
            fmt_bytes(estimator.total()),
            plural(to_add.len(), "file")
        ));
    }

    for add in to_add.iter() {
        let local_path = add.local_dir.join(&add.entry.name);
        let remote_path = add.remote_dir.join(&add.entry.name);
        match session.push_file(&local_path, &remote_path).await {
            Ok(()) => {
                new_db.insert(
                    add.key.clone(),
                    DbEntry {
                        mtime: add.entry.mtime,
                        size: add.entry.size,
                    },
                );
                summary.files_pushed += 1;
                summary.bytes_pushed += add.entry.size;
            }
            Err(AdbError::LocalIo { path, source }) => {
                warning(&format!("Unreadable: {}: {}", path.display(), source));
                continue;
            }
            Err(e) => return Err(e),
        }

        let (percent, eta) = estimator.increment(add.entry.size);
        progress.line(&format!(
            "[{:3}%] [{}] {}/s {}",
            percent,
            fmt_seconds(eta),
            fmt_bytes(estimator.rate() as u64),
            local_path.display()
        ));

        if Instant::now() >= next_autosave {
            next_autosave = Instant::now() + AUTOSAVE_INTERVAL;
            new_db.store(session, remote_root, &options.db_name).await?;
        }
    }

    new_db.store(session, remote_root, &options.db_name).await
}

fn display_relative(path: &UnixPath, root: &UnixPath) -> String {
    path.strip_prefix(root)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| path.display().to_string())
}

/// Exponentially smoothed transfer-rate estimate.
#[derive(Debug)]
pub struct TimeEstimator {
    decay_time: f64,
    last: Instant,
    transferred: u64,
    total: u64,
    rate: f64,
}

impl TimeEstimator {
    pub fn new(total: u64) -> TimeEstimator {
        TimeEstimator::with_decay(total, 10.0)
    }

    /// *decay_time* is how long the smoothed rate takes to move 90% of
    /// the way towards the instantaneous rate; think of it as an
    /// averaging window.
    pub fn with_decay(total: u64, decay_time: f64) -> TimeEstimator {
        TimeEstimator {
            decay_time,
            last: Instant::now(),
            transferred: 0,
            total,
            rate: 1.0,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Smoothed bytes per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Records *dv* freshly transferred bytes; returns the completed
    /// percentage and the estimated seconds remaining.
    pub fn increment(&mut self, dv: u64) -> (u64, f64) {
        let now = Instant::now();
        let dt = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.advance(dv, dt)
    }

    pub(crate) fn advance(&mut self, dv: u64, dt: f64) -> (u64, f64) {
        if dv > 0 {
            self.transferred += dv;
            if dt > 0.0 {
                let k = 0.1_f64.powf(dt / self.decay_time);
                self.rate = k * self.rate + (1.0 - k) * (dv as f64 / dt);
            }
        }
        let percent = (1 + self.transferred * 100) / (1 + self.total);
        let eta = self.total.saturating_sub(self.transferred) as f64 / self.rate;
        (percent, eta)
    }
}

pub(crate) fn fmt_seconds(seconds: f64) -> String {
    let seconds = seconds.max(0.0) as u64;
    if seconds < 60 {
        return format!("{}s", seconds);
    }
    let (minutes, seconds) = (seconds / 60, seconds % 60);
    if minutes < 60 {
        return format!("{}m:{:02}s", minutes, seconds);
    }
    "??m:??s".to_owned()
}

pub(crate) fn fmt_bytes(n: u64) -> String {
    let mut value = n as f64;
    if value < 1024.0 {
        return format!("{} bytes", n);
    }
    value /= 1024.0;
    let mut unit = "K";
    for next in ["M", "G"] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{}{}", trim_decimal(value), unit)
}

fn trim_decimal(value: f64) -> String {
    let text = format!("{:.2}", value);
    text.trim_end_matches('0').trim_end_matches('.').to_owned()
}

pub(crate) fn plural(n: usize, noun: &str) -> String {
    if n == 1 {
        format!("1 {}", noun)
    } else {
        format!("{} {}s", n, noun)
    }
}
