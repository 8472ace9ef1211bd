//! Filesystem change tracking for the application root
//!
//! [`WatchState`] records when each app last changed and is what the router
//! consults for staleness. [`Watcher`] feeds it from notify events. Three
//! kinds of timestamps are kept:
//!
//! - app keys (`<app>.<domain>`) for files under `<root>/<domain>/<app>/`
//! - domain names for files directly under `<root>/<domain>/`
//! - one global timestamp bumped when the configuration file changes

use crate::app::app_key;
use crate::error::WatcherError;
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What a changed path invalidates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeScope {
    /// The central configuration file
    Config,
    /// A file directly inside a domain directory
    Domain(String),
    /// A file inside one app, by app key
    App(String),
    /// Outside any tracked tree
    Ignored,
}

#[derive(Debug, Default)]
struct Timestamps {
    entries: HashMap<String, SystemTime>,
    config: Option<SystemTime>,
}

impl Timestamps {
    fn bump(&mut self, key: &str, at: SystemTime) {
        let entry = self.entries.entry(key.to_string()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }
}

pub struct WatchState {
    root: PathBuf,
    config_path: Option<PathBuf>,
    timestamps: Mutex<Timestamps>,
    cnames: RwLock<HashMap<String, String>>,
}

impl WatchState {
    pub fn new(root: PathBuf, config_path: Option<PathBuf>) -> Self {
        let root = root.canonicalize().unwrap_or(root);
        let config_path = config_path.map(|p| p.canonicalize().unwrap_or(p));

        let state = Self {
            root,
            config_path,
            timestamps: Mutex::new(Timestamps::default()),
            cnames: RwLock::new(HashMap::new()),
        };
        state.refresh_cnames();
        state
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Map a path to the timestamp it affects
    pub fn classify(&self, path: &Path) -> ChangeScope {
        if self.config_path.as_deref() == Some(path) {
            return ChangeScope::Config;
        }

        let Ok(relative) = path.strip_prefix(&self.root) else {
            return ChangeScope::Ignored;
        };

        let parts: Vec<&str> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect();

        // Root-level files and reserved entries
        if parts.len() < 2 || is_reserved(parts[0]) {
            return ChangeScope::Ignored;
        }

        if parts.iter().any(|p| *p == ".git") || parts.iter().skip(2).any(|p| is_app_state(p)) {
            return ChangeScope::Ignored;
        }

        if parts.len() == 2 {
            ChangeScope::Domain(parts[0].to_string())
        } else {
            ChangeScope::App(app_key(parts[1], parts[0]))
        }
    }

    /// Record a change to `path` at `at`. Timestamps only move forward.
    /// Configuration changes are returned but not applied; see
    /// [`WatchState::mark_all_changed`].
    pub fn record_change(&self, path: &Path, at: SystemTime) -> ChangeScope {
        let scope = self.classify(path);
        match scope {
            ChangeScope::Domain(ref key) | ChangeScope::App(ref key) => {
                self.timestamps.lock().bump(key, at);
            }
            ChangeScope::Config | ChangeScope::Ignored => {}
        }

        if matches!(scope, ChangeScope::App(_))
            && path.file_name().map(|n| n == "CNAME").unwrap_or(false)
        {
            self.refresh_cnames();
        }

        scope
    }

    /// Invalidate everything, including apps not seen yet
    pub fn mark_all_changed(&self, at: SystemTime) {
        let mut timestamps = self.timestamps.lock();
        for value in timestamps.entries.values_mut() {
            if at > *value {
                *value = at;
            }
        }
        timestamps.config = Some(timestamps.config.map_or(at, |prev| prev.max(at)));
    }

    /// Last recorded change for one app key
    pub fn app_mtime(&self, key: &str) -> Option<SystemTime> {
        self.timestamps.lock().entries.get(key).copied()
    }

    /// Latest change that affects `appname` in `domain`
    pub fn last_change(&self, domain: &str, appname: &str) -> Option<SystemTime> {
        let timestamps = self.timestamps.lock();
        [
            timestamps.entries.get(&app_key(appname, domain)).copied(),
            timestamps.entries.get(domain).copied(),
            timestamps.config,
        ]
        .into_iter()
        .flatten()
        .max()
    }

    /// Hostname aliased by a `CNAME` file, as `<app>.<domain>`
    pub fn resolve_cname(&self, hostname: &str) -> Option<String> {
        self.cnames.read().get(hostname).cloned()
    }

    /// Rebuild the alias map from `<root>/<domain>/<app>/CNAME`. When two apps
    /// claim the same hostname the older file wins.
    pub fn refresh_cnames(&self) {
        let mut cnames: HashMap<String, (String, SystemTime)> = HashMap::new();

        let Ok(domains) = std::fs::read_dir(&self.root) else {
            warn!(root = %self.root.display(), "Could not read app root for CNAME scan");
            return;
        };

        for domain in domains.flatten() {
            let domain_name = domain.file_name().to_string_lossy().into_owned();
            if is_reserved(&domain_name) {
                continue;
            }
            let Ok(apps) = std::fs::read_dir(domain.path()) else {
                continue;
            };

            for app in apps.flatten() {
                let cname_path = app.path().join("CNAME");
                let Ok(meta) = std::fs::metadata(&cname_path) else {
                    continue;
                };
                if !meta.is_file() {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(&cname_path) else {
                    continue;
                };

                let cname = content.trim().to_lowercase();
                if cname.is_empty() {
                    continue;
                }

                let target = app_key(&app.file_name().to_string_lossy(), &domain_name);
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

                match cnames.get(&cname) {
                    Some((_, existing)) if *existing <= mtime => {}
                    _ => {
                        cnames.insert(cname, (target, mtime));
                    }
                }
            }
        }

        debug!(count = cnames.len(), "CNAME map refreshed");
        *self.cnames.write() = cnames
            .into_iter()
            .map(|(cname, (target, _))| (cname, target))
            .collect();
    }
}

/// Dot and underscore prefixed root entries are not apps
pub(crate) fn is_reserved(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_')
}

/// Directories inside an app that hold runtime state, not source
fn is_app_state(name: &str) -> bool {
    name == "data" || name == "node_modules"
}

type ReloadCallback = Arc<dyn Fn() + Send + Sync>;

/// Feeds a [`WatchState`] from filesystem notifications
pub struct Watcher {
    state: Arc<WatchState>,
    inner: Mutex<Option<RecommendedWatcher>>,
}

impl Watcher {
    /// Register the tree and spawn the event loop. `on_config_change` runs on
    /// the blocking pool before the global invalidation is applied.
    pub fn start<F>(state: Arc<WatchState>, on_config_change: F) -> Result<Arc<Self>, WatcherError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let root = state.root().to_path_buf();
        let (tx, rx) = mpsc::unbounded_channel();

        let notify_watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .map_err(|source| WatcherError::WatchSetupFailed {
            path: root.clone(),
            source,
        })?;

        let watcher = Arc::new(Self {
            state: Arc::clone(&state),
            inner: Mutex::new(Some(notify_watcher)),
        });

        watcher.watch_dir(&root)?;
        let dirs = watcher.add_dir(&root);

        // The tree walk skips reserved entries such as `<root>/.smallweb`
        if let Some(config_dir) = state.config_path().and_then(Path::parent) {
            if !config_dir.starts_with(&root) || is_skipped_dir(&root, config_dir) {
                watcher.watch_dir(config_dir)?;
            }
        }

        info!(root = %root.display(), dirs, "Watching app root");

        let on_config_change: ReloadCallback = Arc::new(on_config_change);
        let event_loop = Arc::clone(&watcher);
        tokio::spawn(async move { event_loop.run(rx, on_config_change).await });

        Ok(watcher)
    }

    pub fn state(&self) -> &Arc<WatchState> {
        &self.state
    }

    /// Close the underlying watcher. Safe to call more than once.
    pub fn stop(&self) {
        if self.inner.lock().take().is_some() {
            info!("File watcher stopped");
        }
    }

    /// Watch `dir` and every directory below it that can hold app sources.
    /// Returns how many directories were registered.
    pub fn add_dir(&self, dir: &Path) -> usize {
        if is_skipped_dir(self.state.root(), dir) {
            return 0;
        }

        let root = self.state.root().to_path_buf();
        let walker = jwalk::WalkDir::new(dir)
            .skip_hidden(false)
            .process_read_dir(move |_, _, _, children| {
                children.retain(|entry| match entry {
                    Ok(entry) if entry.file_type().is_dir() => {
                        !is_skipped_dir(&root, &entry.parent_path.join(&entry.file_name))
                    }
                    Ok(_) => false,
                    Err(_) => false,
                });
            });

        let mut count = 0;
        for entry in walker.into_iter().flatten() {
            let path = entry.path();
            match self.watch_dir(&path) {
                Ok(()) => count += 1,
                Err(e) => warn!(error = %e, "Could not watch directory"),
            }
        }
        count
    }

    fn watch_dir(&self, dir: &Path) -> Result<(), WatcherError> {
        let mut inner = self.inner.lock();
        let Some(watcher) = inner.as_mut() else {
            return Ok(());
        };

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatcherError::WatchSetupFailed {
                path: dir.to_path_buf(),
                source,
            })
    }

    async fn run(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
        on_config_change: ReloadCallback,
    ) {
        while let Some(result) = rx.recv().await {
            match result {
                Ok(event) => self.handle_event(event, &on_config_change),
                Err(e) => error!(error = %e, "File watcher error"),
            }
        }
        debug!("File watcher event loop exited");
    }

    fn handle_event(&self, event: notify::Event, on_config_change: &ReloadCallback) {
        // Content edits carry a meaningful mtime; creations, renames and
        // removals are stamped with the time they were observed
        let use_mtime = match event.kind {
            EventKind::Create(_) | EventKind::Remove(_) => false,
            EventKind::Modify(ModifyKind::Metadata(_)) => return,
            EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => true,
            EventKind::Modify(_) => false,
            _ => return,
        };

        for path in event.paths {
            if path.is_dir() {
                if matches!(event.kind, EventKind::Create(_)) {
                    self.add_dir(&path);
                    // Files written before the watch was added produce no event
                    if let ChangeScope::App(_) = self.state.classify(&path) {
                        self.state.record_change(&path, SystemTime::now());
                    }
                }
                continue;
            }

            let at = if use_mtime {
                std::fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .unwrap_or_else(|_| SystemTime::now())
            } else {
                SystemTime::now()
            };

            match self.state.record_change(&path, at) {
                ChangeScope::Config => {
                    info!(path = %path.display(), "Configuration changed");
                    let callback = Arc::clone(on_config_change);
                    let state = Arc::clone(&self.state);
                    tokio::task::spawn_blocking(move || {
                        callback();
                        state.mark_all_changed(SystemTime::now());
                    });
                }
                ChangeScope::App(key) => debug!(app = %key, path = %path.display(), "App changed"),
                ChangeScope::Domain(domain) => {
                    debug!(domain = %domain, path = %path.display(), "Domain changed")
                }
                ChangeScope::Ignored => {}
            }
        }
    }
}

/// Directories never registered: `.git` anywhere, reserved root entries and
/// runtime state below app level
fn is_skipped_dir(root: &Path, dir: &Path) -> bool {
    let Ok(relative) = dir.strip_prefix(root) else {
        return false;
    };

    let parts: Vec<&str> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();

    match parts.first() {
        Some(first) if is_reserved(first) => true,
        _ => parts.iter().any(|p| *p == ".git") || parts.iter().skip(2).any(|p| is_app_state(p)),
    }
}
