//! Session Manager
//!
//! Owns the per-server IRC sessions, the shared transfer registry, the MD5
//! worker and the periodic cleanup loop that idles out sessions, parts stale
//! channels, expires resume offers and prunes old transfer history.

use crate::config::Config;
use crate::irc::{Md5Job, Session, SharedTransfer, TransferRecord, TransferStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use md5::{Digest, Md5};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

/// A DCC SEND arriving within this window of a matching announcement updates
/// the announced record instead of creating a duplicate.
const RECONCILE_WINDOW_SECS: i64 = 30;

const CLEANUP_TICK_SECS: u64 = 1;
const CLEANUP_BACKOFF_SECS: u64 = 10;

/// Snapshot row for one transfer, as served to the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct TransferView {
    pub server: String,
    pub filename: String,
    pub nick: String,
    pub host: String,
    pub size: u64,
    pub received: u64,
    pub speed: f64,
    pub speed_avg: f64,
    pub md5: Option<String>,
    pub file_md5: Option<String>,
    pub status: TransferStatus,
    pub error: Option<String>,
    pub resumed: bool,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub name: String,
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInfo {
    pub server: String,
    pub nickname: String,
    pub channels: Vec<ChannelInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InfoPayload {
    pub networks: Vec<NetworkInfo>,
    pub transfers: Vec<TransferView>,
}

/// Transfer registry shared between sessions, the manager and the MD5
/// worker. Records are individually locked; everyone holds the same `Arc`,
/// so a status update made by a session is immediately visible here.
#[derive(Default)]
pub struct Registry {
    transfers: RwLock<HashMap<String, Vec<SharedTransfer>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when a record with this filename and size is currently connected.
    pub async fn has_connected(&self, filename: &str, size: u64) -> bool {
        let transfers = self.transfers.read().await;
        let Some(records) = transfers.get(filename) else {
            return false;
        };
        for record in records {
            let rec = record.lock().await;
            if rec.size == size && rec.connected {
                return true;
            }
        }
        false
    }

    /// Pre-register a record parsed from an XDCC announcement.
    pub async fn announce(&self, record: TransferRecord) {
        let mut transfers = self.transfers.write().await;
        transfers
            .entry(record.filename.clone())
            .or_default()
            .push(Arc::new(Mutex::new(record)));
    }

    /// Insert a record for a validated offer, reconciling with a recent
    /// announcement record from the same nick and server when one exists.
    pub async fn register(&self, record: TransferRecord) -> SharedTransfer {
        let now = Utc::now();
        let mut transfers = self.transfers.write().await;
        let entries = transfers.entry(record.filename.clone()).or_default();

        let mut matched: Option<SharedTransfer> = None;
        for existing in entries.iter() {
            let rec = existing.lock().await;
            if rec.peer_address.is_none()
                && rec.start_time >= now - ChronoDuration::seconds(RECONCILE_WINDOW_SECS)
                && rec.nick == record.nick
                && rec.server == record.server
            {
                matched = Some(existing.clone());
                break;
            }
        }

        if let Some(existing) = matched {
            let mut rec = existing.lock().await;
            let announced_md5 = rec.md5.take();
            *rec = record;
            if rec.md5.is_none() {
                rec.md5 = announced_md5;
            }
            drop(rec);
            return existing;
        }

        let shared: SharedTransfer = Arc::new(Mutex::new(record));
        entries.push(shared.clone());
        shared
    }

    /// Attach an announced md5 to the most recently completed transfer from
    /// this sender that lacks one, returning the verification job.
    pub async fn attach_completed_md5(
        &self,
        server: &str,
        nick: &str,
        md5: &str,
    ) -> Option<Md5Job> {
        let now = Utc::now();
        let mut best: Option<(DateTime<Utc>, SharedTransfer)> = None;
        {
            let transfers = self.transfers.read().await;
            for records in transfers.values() {
                for record in records {
                    let rec = record.lock().await;
                    if rec.nick != nick || rec.server != server {
                        continue;
                    }
                    if !rec.completed || rec.md5.is_some() {
                        continue;
                    }
                    let Some(at) = rec.completed_at else {
                        continue;
                    };
                    if at < now - ChronoDuration::seconds(RECONCILE_WINDOW_SECS) {
                        continue;
                    }
                    if best.as_ref().map_or(true, |(t, _)| at > *t) {
                        best = Some((at, record.clone()));
                    }
                }
            }
        }

        let (_, record) = best?;
        let mut rec = record.lock().await;
        rec.md5 = Some(md5.to_string());
        let file_path = rec.file_path.clone()?;
        Some(Md5Job {
            id: rec.id,
            filename: rec.filename.clone(),
            file_path,
        })
    }

    /// Store a computed file digest on the matching record.
    pub async fn set_file_md5(&self, filename: &str, id: Uuid, digest: &str) {
        let transfers = self.transfers.read().await;
        let Some(records) = transfers.get(filename) else {
            return;
        };
        for record in records {
            let mut rec = record.lock().await;
            if rec.id == id {
                rec.file_md5 = Some(digest.to_string());
            }
        }
    }

    /// Drop records older than the history retention.
    pub async fn prune(&self, retention_secs: u64) {
        let cutoff = Utc::now() - ChronoDuration::seconds(retention_secs as i64);
        let mut transfers = self.transfers.write().await;
        let mut expired = Vec::new();
        for (filename, records) in transfers.iter_mut() {
            let mut keep = Vec::new();
            for record in records.drain(..) {
                if record.lock().await.start_time >= cutoff {
                    keep.push(record);
                }
            }
            *records = keep;
            if records.is_empty() {
                expired.push(filename.clone());
            }
        }
        for filename in expired {
            transfers.remove(&filename);
        }
    }

    /// Current transfer view for the control surface.
    pub async fn snapshot(&self) -> Vec<TransferView> {
        let now = Utc::now();
        let transfers = self.transfers.read().await;
        let mut snapshot = Vec::new();
        for (filename, records) in transfers.iter() {
            for record in records {
                let rec = record.lock().await;
                let (speed, speed_avg) = rec.speeds(now);
                let host = match &rec.peer_address {
                    Some(address) => format!("{}:{}", address, rec.peer_port),
                    None => String::new(),
                };
                snapshot.push(TransferView {
                    server: rec.server.clone(),
                    filename: filename.clone(),
                    nick: rec.nick.clone(),
                    host,
                    size: rec.size,
                    received: rec.bytes_received + rec.offset,
                    speed: (speed * 100.0).round() / 100.0,
                    speed_avg: (speed_avg * 100.0).round() / 100.0,
                    md5: rec.md5.clone(),
                    file_md5: rec.file_md5.clone(),
                    status: rec.status,
                    error: rec.error.clone(),
                    resumed: rec.offset > 0,
                    connected: rec.connected,
                });
            }
        }
        snapshot
    }
}

/// Manages the IRC sessions for all servers.
pub struct Manager {
    config: Arc<Config>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    registry: Arc<Registry>,
    md5_tx: mpsc::Sender<Md5Job>,
}

impl Manager {
    pub fn new(config: Arc<Config>) -> (Arc<Self>, mpsc::Receiver<Md5Job>) {
        let (md5_tx, md5_rx) = mpsc::channel(64);
        let manager = Arc::new(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            registry: Arc::new(Registry::new()),
            md5_tx,
        });
        (manager, md5_rx)
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Get the session for a server, creating and connecting it on first use.
    pub async fn get_or_create_session(&self, server: &str) -> anyhow::Result<Arc<Session>> {
        if let Some(session) = self.sessions.read().await.get(server) {
            return Ok(session.clone());
        }

        let server_config = self
            .config
            .resolve_server(server)
            .ok_or_else(|| anyhow::anyhow!("No configuration found for server: {}", server))?;

        let session = Session::new(
            server,
            server_config,
            self.config.clone(),
            self.registry.clone(),
            self.md5_tx.clone(),
        );
        self.sessions
            .write()
            .await
            .insert(server.to_string(), session.clone());

        // A failed connect leaves the session registered but inert.
        if let Err(e) = session.connect().await {
            tracing::error!("Connection error to {}: {}", server, e);
        }
        Ok(session)
    }

    /// Cancel a running transfer by server, nick and filename.
    pub async fn cancel_transfer(&self, server: &str, nick: &str, filename: &str) -> bool {
        let session = self.sessions.read().await.get(server).cloned();
        match session {
            Some(session) => session.cancel_transfer(nick, filename).await,
            None => false,
        }
    }

    /// Disconnect every session.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down server...");
        for session in self.sessions.read().await.values() {
            session.disconnect("Shutting down").await;
        }
    }

    /// Current network + transfer view.
    pub async fn snapshot(&self) -> InfoPayload {
        let mut networks = Vec::new();
        for session in self.sessions.read().await.values() {
            let channels = session
                .channel_snapshot()
                .await
                .into_iter()
                .map(|(name, last_active)| ChannelInfo { name, last_active })
                .collect();
            networks.push(NetworkInfo {
                server: session.server().to_string(),
                nickname: session.nick().to_string(),
                channels,
            });
        }
        networks.sort_by(|a, b| a.server.cmp(&b.server));
        InfoPayload {
            networks,
            transfers: self.registry.snapshot().await,
        }
    }

    /// Periodic cleanup loop: 1 s tick, 10 s backoff after an error.
    pub async fn run_cleanup(self: Arc<Self>) {
        loop {
            match self.cleanup_once().await {
                Ok(()) => tokio::time::sleep(Duration::from_secs(CLEANUP_TICK_SECS)).await,
                Err(e) => {
                    tracing::error!("Cleanup error: {:#}", e);
                    tokio::time::sleep(Duration::from_secs(CLEANUP_BACKOFF_SECS)).await;
                }
            }
        }
    }

    async fn cleanup_once(&self) -> anyhow::Result<()> {
        self.sweep_sessions().await;
        self.registry.prune(self.config.transfer_list_timeout).await;
        Ok(())
    }

    /// Disconnect idle sessions; run the per-session sweeps on the rest.
    async fn sweep_sessions(&self) {
        let now = Utc::now();
        let sessions: Vec<(String, Arc<Session>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(server, session)| (server.clone(), session.clone()))
            .collect();

        let mut idle_servers = Vec::new();
        for (server, session) in sessions {
            if self.config.server_idle_timeout > 0
                && session.is_idle(self.config.server_idle_timeout, now).await
            {
                idle_servers.push(server);
            } else {
                session
                    .cleanup(self.config.channel_idle_timeout, self.config.resume_timeout)
                    .await;
            }
        }

        for server in idle_servers {
            let session = self.sessions.write().await.remove(&server);
            if let Some(session) = session {
                session.disconnect("Idle timeout").await;
            }
        }
    }

    /// Drain the MD5 queue, hashing on the blocking pool and posting results
    /// back to the registry. Worker errors are logged and skipped.
    pub async fn run_md5_worker(self: Arc<Self>, mut rx: mpsc::Receiver<Md5Job>) {
        while let Some(job) = rx.recv().await {
            tracing::debug!("Checking MD5 for {}", job.filename);
            let path = job.file_path.clone();
            match tokio::task::spawn_blocking(move || compute_md5(&path)).await {
                Ok(Ok(digest)) => {
                    self.registry.set_file_md5(&job.filename, job.id, &digest).await;
                }
                Ok(Err(e)) => {
                    tracing::error!("MD5 check failed for {}: {}", job.file_path.display(), e);
                }
                Err(e) => {
                    tracing::error!("MD5 worker task failed: {}", e);
                }
            }
        }
    }
}

/// MD5 of a file, read in 8 KiB blocks. Blocking; run on the blocking pool.
pub fn compute_md5(path: &Path) -> std::io::Result<String> {
    use std::io::Read;

    tracing::info!("Calculating MD5 for {}", path.display());
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hex::encode(hasher.finalize());
    tracing::info!("MD5 for {} is {}", path.display(), digest);
    Ok(digest)
}
