//!
//! Owns the on-disk JSON form of the identity list: validated load,
//! atomic+backed-up save, per-user locked read-modify-write, a
//! debounced persist queue with a single flusher task, and a
//! filesystem watch that reloads on external edits while ignoring our
//! own writes.

use crate::error::ConfigError;
use crate::identity::Identity;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

const BACKUP_RING_SIZE: usize = 5;
const DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Serialize, Deserialize)]
struct OnDisk {
    users: Vec<Identity>,
}

/// Legacy single-user form: a flat object carrying `username` directly
/// at the top level instead of wrapped in `{"users": [...]}`.
fn looks_legacy_single_user(value: &serde_json::Value) -> bool {
    value.is_object() && value.get("username").is_some() && value.get("users").is_none()
}

struct PendingEntry {
    identity: Identity,
    enqueued_at: Instant,
}

pub struct ConfigStore {
    path: PathBuf,
    checksum: RwLock<Option<String>>,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    pending: Mutex<HashMap<String, PendingEntry>>,
    suppress_depth: AtomicU64,
    /// Acquired strictly after a per-user lock, never before. Held
    /// across the load-modify-save sequence in `update_user` so two
    /// different usernames' read-modify-writes can't interleave and
    /// lose each other's half of the on-disk list.
    global_lock: Mutex<()>,
}

pub struct SuppressGuard<'a> {
    store: &'a ConfigStore,
}

impl Drop for SuppressGuard<'_> {
    fn drop(&mut self) {
        self.store.suppress_depth.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            checksum: RwLock::new(None),
            user_locks: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            suppress_depth: AtomicU64::new(0),
            global_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scoped guard: while held, `watch()` treats our own concurrent
    /// save as self-originated rather than an external edit.
    pub fn suppress_self_writes(&self) -> SuppressGuard<'_> {
        self.suppress_depth.fetch_add(1, Ordering::SeqCst);
        SuppressGuard { store: self }
    }

    fn is_suppressed(&self) -> bool {
        self.suppress_depth.load(Ordering::SeqCst) > 0
    }

    /// Loads, validates, normalizes, and dedupes the identity list.
    /// Invalid entries are dropped with a diagnostic; the checksum of
    /// the raw bytes read is recorded as this store's "last known
    /// good" checksum.
    pub async fn load(&self) -> Result<Vec<Identity>, ConfigError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "config file absent; starting empty");
                Vec::new()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };

        if bytes.is_empty() {
            *self.checksum.write().await = Some(checksum_of(&bytes));
            return Ok(Vec::new());
        }

        let value: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                path: self.path.display().to_string(),
                source,
            })?;

        let on_disk: OnDisk = if looks_legacy_single_user(&value) {
            info!("legacy single-user config detected; coercing to multi-user form");
            let user: Identity =
                serde_json::from_value(value).map_err(|source| ConfigError::Parse {
                    path: self.path.display().to_string(),
                    source,
                })?;
            OnDisk { users: vec![user] }
        } else {
            serde_json::from_value(value).map_err(|source| ConfigError::Parse {
                path: self.path.display().to_string(),
                source,
            })?
        };

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::with_capacity(on_disk.users.len());
        for mut identity in on_disk.users {
            identity.normalize();
            if let Err(e) = identity.validate() {
                warn!(error = %e, "dropping invalid identity from config");
                continue;
            }
            if !seen.insert(identity.username.clone()) {
                warn!(username = %identity.username, "dropping duplicate identity from config");
                continue;
            }
            out.push(identity);
        }

        *self.checksum.write().await = Some(checksum_of(&bytes));
        Ok(out)
    }

    /// Atomically writes `list`: serialize -> write `<path>.tmp` ->
    /// rename over the real path, plus a ring-buffered timestamped
    /// backup. Updates the in-memory checksum so `watch()` recognizes
    /// this as our own write.
    pub async fn save(&self, list: &[Identity]) -> Result<(), ConfigError> {
        let _guard = self.suppress_self_writes();

        let on_disk = OnDisk {
            users: list.to_vec(),
        };
        let serialized =
            serde_json::to_vec_pretty(&on_disk).expect("Identity serialization cannot fail");

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| ConfigError::Write {
                        path: self.path.display().to_string(),
                        source,
                    })?;
            }
        }

        let mut tmp_name = self.path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        tokio::fs::write(&tmp_path, &serialized)
            .await
            .map_err(|source| ConfigError::Write {
                path: tmp_path.display().to_string(),
                source,
            })?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|source| ConfigError::Write {
                path: self.path.display().to_string(),
                source,
            })?;

        self.write_backup(&serialized).await;
        *self.checksum.write().await = Some(checksum_of(&serialized));
        Ok(())
    }

    async fn write_backup(&self, serialized: &[u8]) {
        let ts = crate::util::now().format("%Y%m%dT%H%M%S%.3f");
        let backup_path = self.backup_path(&ts.to_string());
        if let Err(e) = tokio::fs::write(&backup_path, serialized).await {
            warn!(error = %e, "failed to write config backup");
            return;
        }
        self.prune_backups().await;
    }

    fn backup_path(&self, ts: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".bak.{ts}"));
        PathBuf::from(name)
    }

    async fn prune_backups(&self) {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let prefix = format!(
            "{}.bak.",
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        );

        let mut entries = match tokio::fs::read_dir(&parent).await {
            Ok(r) => r,
            Err(_) => return,
        };

        let mut backups = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(&prefix) {
                    backups.push(entry.path());
                }
            }
        }
        backups.sort();
        if backups.len() > BACKUP_RING_SIZE {
            for old in &backups[..backups.len() - BACKUP_RING_SIZE] {
                let _ = tokio::fs::remove_file(old).await;
            }
        }
    }

    async fn lock_for_user(&self, username: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        locks
            .entry(username.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Read-modify-write a single identity. Lock order is always
    /// per-user lock first, then the store-global lock, never the
    /// reverse: two concurrent callers for *different* usernames would
    /// otherwise both load the list before either saves, and the
    /// second save would silently discard the first caller's patch.
    /// The global lock is held across the full load-modify-save
    /// sequence so that can't happen.
    pub async fn update_user<F>(&self, username: &str, patch: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut Identity),
    {
        let user_lock = self.lock_for_user(username).await;
        let _user_guard = user_lock.lock().await;
        let _global_guard = self.global_lock.lock().await;

        let mut list = self.load().await?;
        let mut found = false;
        for identity in list.iter_mut() {
            if identity.username == username {
                patch(identity);
                found = true;
                break;
            }
        }
        if !found {
            debug!(username, "update_user: no matching identity, no-op");
            return Ok(());
        }
        self.save(&list).await
    }

    /// Enqueues a patch for debounced persistence. The single
    /// background flusher (`run_flusher`) coalesces repeated updates to
    /// the same username within the debounce window into one save. A
    /// second `queue_update` for a username already pending patches the
    /// snapshot already queued rather than starting a fresh one, so a
    /// burst of calls still produces exactly one write.
    pub async fn queue_update<F>(&self, username: &str, patch: F)
    where
        F: FnOnce(&mut Identity),
    {
        let mut pending = self.pending.lock().await;
        if let Some(entry) = pending.get_mut(username) {
            patch(&mut entry.identity);
            entry.enqueued_at = Instant::now();
            return;
        }

        let base = match self.load().await {
            Ok(list) => list.into_iter().find(|i| i.username == username),
            Err(e) => {
                warn!(username, error = %e, "queue_update: failed to load base identity, dropping");
                return;
            }
        };
        let Some(mut identity) = base else {
            debug!(username, "queue_update: no matching identity, no-op");
            return;
        };
        patch(&mut identity);
        pending.insert(
            username.to_string(),
            PendingEntry {
                identity,
                enqueued_at: Instant::now(),
            },
        );
    }

    /// Runs forever, flushing any pending entry whose debounce window
    /// has elapsed. Intended to be spawned once per process.
    pub async fn run_flusher(self: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_millis(200)).await;

            let ready: Vec<Identity> = {
                let mut pending = self.pending.lock().await;
                let now = Instant::now();
                let ready_keys: Vec<String> = pending
                    .iter()
                    .filter(|(_, v)| now.duration_since(v.enqueued_at) >= DEBOUNCE)
                    .map(|(k, _)| k.clone())
                    .collect();
                ready_keys
                    .into_iter()
                    .filter_map(|k| pending.remove(&k))
                    .map(|e| e.identity)
                    .collect()
            };

            for identity in ready {
                let username = identity.username.clone();
                if let Err(e) = self
                    .update_user(&username, |slot| *slot = identity.clone())
                    .await
                {
                    warn!(username = %username, error = %e, "flusher failed to persist queued update");
                }
            }
        }
    }

    /// Spawns a filesystem watch on the config file's parent
    /// directory. Debounces events 1s; on a genuine external change
    /// (checksum differs from our last save, and we're not inside a
    /// `suppress_self_writes` scope) sends `()` on the returned
    /// channel to signal "reload".
    pub fn watch(self: Arc<Self>) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(4);
        let store = self.clone();

        tokio::spawn(async move {
            use notify::{RecursiveMode, Watcher};

            let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
            let watch_dir = store
                .path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));

            let mut watcher = match notify::recommended_watcher(move |res| {
                let _ = raw_tx.send(res);
            }) {
                Ok(w) => w,
                Err(e) => {
                    warn!(error = %e, "failed to create config file watcher");
                    return;
                }
            };

            if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
                warn!(error = %e, dir = %watch_dir.display(), "failed to watch config directory");
                return;
            }

            let mut last_fire = Instant::now() - DEBOUNCE;
            while let Some(res) = raw_rx.recv().await {
                let event = match res {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(error = %e, "config watcher error");
                        continue;
                    }
                };
                if !event.paths.iter().any(|p| p == &store.path) {
                    continue;
                }
                if Instant::now().duration_since(last_fire) < DEBOUNCE {
                    continue;
                }
                last_fire = Instant::now();

                if store.is_suppressed() {
                    debug!("ignoring self-originated config change");
                    continue;
                }

                let bytes = match tokio::fs::read(&store.path).await {
                    Ok(b) => b,
                    Err(_) => continue,
                };
                let new_checksum = checksum_of(&bytes);
                let last_known = store.checksum.read().await.clone();
                if last_known.as_deref() == Some(new_checksum.as_str()) {
                    continue;
                }

                info!("external config edit detected; reloading");
                if tx.send(()).await.is_err() {
                    break;
                }
            }
        });

        rx
    }
}

fn checksum_of(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn sample_identity(username: &str) -> Identity {
        Identity {
            username: username.to_string(),
            client_id: "clientid1234".into(),
            client_secret: "clientsecret1234".into(),
            channels: BTreeSet::from(["somechannel".to_string()]),
            is_prime_or_turbo: true,
            enabled: true,
            access_token: "tok".into(),
            refresh_token: "ref".into(),
            token_expiry: None,
            user_id: None,
            last_color: None,
            hex_rejection_strikes: 0,
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips_after_normalization() {
        let dir = tempdir();
        let store = ConfigStore::new(dir.join("users.json"));
        let list = vec![sample_identity("alice")];
        store.save(&list).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].username, "alice");
    }

    #[tokio::test]
    async fn load_coerces_legacy_single_user_form() {
        let dir = tempdir();
        let path = dir.join("users.json");
        let legacy = serde_json::to_vec(&sample_identity("bob")).unwrap();
        tokio::fs::write(&path, legacy).await.unwrap();

        let store = ConfigStore::new(path);
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].username, "bob");
    }

    #[tokio::test]
    async fn load_drops_duplicate_usernames() {
        let dir = tempdir();
        let path = dir.join("users.json");
        let on_disk = OnDisk {
            users: vec![sample_identity("alice"), sample_identity("Alice")],
        };
        tokio::fs::write(&path, serde_json::to_vec(&on_disk).unwrap())
            .await
            .unwrap();

        let store = ConfigStore::new(path);
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[tokio::test]
    async fn update_user_patches_matching_identity_only() {
        let dir = tempdir();
        let store = ConfigStore::new(dir.join("users.json"));
        store
            .save(&[sample_identity("alice"), sample_identity("bob")])
            .await
            .unwrap();

        store
            .update_user("alice", |id| id.last_color = Some("red".into()))
            .await
            .unwrap();

        let loaded = store.load().await.unwrap();
        let alice = loaded.iter().find(|i| i.username == "alice").unwrap();
        let bob = loaded.iter().find(|i| i.username == "bob").unwrap();
        assert_eq!(alice.last_color.as_deref(), Some("red"));
        assert_eq!(bob.last_color, None);
    }

    #[tokio::test]
    async fn concurrent_update_user_for_different_usernames_does_not_lose_updates() {
        let dir = tempdir();
        let store = Arc::new(ConfigStore::new(dir.join("users.json")));
        store
            .save(&[sample_identity("alice"), sample_identity("bob")])
            .await
            .unwrap();

        let a = store.clone();
        let b = store.clone();
        let (ra, rb) = tokio::join!(
            a.update_user("alice", |id| id.last_color = Some("red".into())),
            b.update_user("bob", |id| id.last_color = Some("blue".into())),
        );
        ra.unwrap();
        rb.unwrap();

        let loaded = store.load().await.unwrap();
        let alice = loaded.iter().find(|i| i.username == "alice").unwrap();
        let bob = loaded.iter().find(|i| i.username == "bob").unwrap();
        assert_eq!(alice.last_color.as_deref(), Some("red"));
        assert_eq!(bob.last_color.as_deref(), Some("blue"));
    }

    #[tokio::test]
    async fn queue_update_patches_pending_entry_without_reloading_from_disk() {
        let dir = tempdir();
        let store = ConfigStore::new(dir.join("users.json"));
        store.save(&[sample_identity("alice")]).await.unwrap();

        store
            .queue_update("alice", |id| id.last_color = Some("red".into()))
            .await;
        store
            .queue_update("alice", |id| id.hex_rejection_strikes = 2)
            .await;

        let pending = store.pending.lock().await;
        let entry = pending.get("alice").expect("pending entry for alice");
        assert_eq!(entry.identity.last_color.as_deref(), Some("red"));
        assert_eq!(entry.identity.hex_rejection_strikes, 2);
    }

    #[tokio::test]
    async fn queue_update_is_noop_for_unknown_username() {
        let dir = tempdir();
        let store = ConfigStore::new(dir.join("users.json"));
        store.save(&[sample_identity("alice")]).await.unwrap();

        store
            .queue_update("bob", |id| id.last_color = Some("red".into()))
            .await;

        assert!(store.pending.lock().await.is_empty());
    }

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "twitch-color-cycler-test-{}-{}",
            std::process::id(),
            rand_suffix()
        ));
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    fn rand_suffix() -> u64 {
        use rand::Rng;
        rand::thread_rng().gen()
    }
}
