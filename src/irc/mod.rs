//! IRC / DCC Engine
//!
//! This module provides the multi-session DCC receive engine:
//! - IRC wire parsing (RFC 1459 lines, CTCP, DCC grammar)
//! - Per-server IRC sessions with channel bookkeeping and a command queue
//! - DCC SEND/SSEND/ACCEPT negotiation, resume and file reception

pub mod dcc;
pub mod session;
pub mod wire;

pub use session::Session;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Status of a single transfer record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Started,
    InProgress,
    Completed,
    Failed,
    Error,
    Cancelled,
}

impl TransferStatus {
    /// Terminal states receive no further chunk updates.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed
                | TransferStatus::Failed
                | TransferStatus::Error
                | TransferStatus::Cancelled
        )
    }
}

/// One inbound file transfer, shared between the owning session and the
/// manager's registry. Both sides hold the same `Arc`, so status updates are
/// visible everywhere at once.
#[derive(Debug, Clone, Serialize)]
pub struct TransferRecord {
    pub id: Uuid,
    pub server: String,
    pub nick: String,
    /// None until a DCC SEND arrives (announcement-only records).
    pub peer_address: Option<String>,
    pub peer_port: u16,
    pub filename: String,
    pub file_path: Option<PathBuf>,
    pub size: u64,
    /// Resume offset; received bytes are counted on top of this.
    pub offset: u64,
    pub bytes_received: u64,
    pub start_time: DateTime<Utc>,
    pub last_progress_update: Option<DateTime<Utc>>,
    pub last_progress_bytes_received: u64,
    pub percent: u8,
    pub ssl: bool,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: TransferStatus,
    pub error: Option<String>,
    /// MD5 announced by the sending bot, if any.
    pub md5: Option<String>,
    /// MD5 computed from the file on disk.
    pub file_md5: Option<String>,
    pub connected: bool,
}

pub type SharedTransfer = Arc<tokio::sync::Mutex<TransferRecord>>;

impl TransferRecord {
    /// Record for a validated DCC SEND offer.
    #[allow(clippy::too_many_arguments)]
    pub fn offered(
        server: &str,
        nick: &str,
        peer_address: IpAddr,
        peer_port: u16,
        filename: &str,
        file_path: PathBuf,
        size: u64,
        offset: u64,
        ssl: bool,
        completed: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            server: server.to_string(),
            nick: nick.to_string(),
            peer_address: Some(peer_address.to_string()),
            peer_port,
            filename: filename.to_string(),
            file_path: Some(file_path),
            size,
            offset,
            bytes_received: 0,
            start_time: Utc::now(),
            last_progress_update: None,
            last_progress_bytes_received: 0,
            percent: 0,
            ssl,
            completed,
            completed_at: None,
            status: TransferStatus::Started,
            error: None,
            md5: None,
            file_md5: None,
            connected: false,
        }
    }

    /// Stub record created from an XDCC bot announcement; filled in by the
    /// matching DCC SEND when it arrives.
    pub fn announced(server: &str, nick: &str, filename: &str, md5: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            server: server.to_string(),
            nick: nick.to_string(),
            peer_address: None,
            peer_port: 0,
            filename: filename.to_string(),
            file_path: None,
            size: 0,
            offset: 0,
            bytes_received: 0,
            start_time: Utc::now(),
            last_progress_update: None,
            last_progress_bytes_received: 0,
            percent: 0,
            ssl: false,
            completed: false,
            completed_at: None,
            status: TransferStatus::Started,
            error: None,
            md5: Some(md5.to_string()),
            file_md5: None,
            connected: false,
        }
    }

    /// Instantaneous and average transfer speed in KB/s.
    pub fn speeds(&self, now: DateTime<Utc>) -> (f64, f64) {
        let elapsed = (now - self.start_time).num_milliseconds() as f64 / 1000.0;
        let speed_avg = if elapsed > 0.0 {
            self.bytes_received as f64 / elapsed / 1024.0
        } else {
            0.0
        };

        let speed = match self.last_progress_update {
            Some(last) => {
                let recent_secs = (now - last).num_milliseconds() as f64 / 1000.0;
                let recent_bytes = self.bytes_received - self.last_progress_bytes_received;
                if recent_secs > 0.0 {
                    recent_bytes as f64 / recent_secs / 1024.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        (speed, speed_avg)
    }
}

/// Control command queued on a session, drained serially by its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Join {
        channels: Vec<String>,
    },
    Part {
        channels: Vec<String>,
        reason: Option<String>,
    },
    Send {
        user: String,
        message: String,
        channels: Vec<String>,
    },
}

/// A pending resume offer: we sent `DCC RESUME` and are waiting for the
/// peer's `DCC ACCEPT`.
#[derive(Debug, Clone)]
pub struct ResumeOffer {
    pub peer_address: IpAddr,
    pub peer_port: u16,
    pub filename: String,
    pub local_path: PathBuf,
    pub size: u64,
    pub offset: u64,
    pub use_ssl: bool,
    pub completed: bool,
    pub offered_at: DateTime<Utc>,
}

/// Job for the MD5 worker pool.
#[derive(Debug, Clone)]
pub struct Md5Job {
    pub id: Uuid,
    pub filename: String,
    pub file_path: PathBuf,
}

/// Errors from the IRC/DCC connect paths.
#[derive(Debug, Clone)]
pub enum SessionError {
    ConnectionFailed(String),
    Timeout(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            SessionError::Timeout(msg) => write!(f, "Timeout: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}
