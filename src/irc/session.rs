//! IRC Session
//!
//! One session per server: owns the IRC socket, the channel bookkeeping,
//! the command queue and every inbound DCC transfer negotiated on it.

use super::dcc::{self, DccStream};
use super::wire::{self, IrcEvent};
use super::{Md5Job, ResumeOffer, SessionCommand, SessionError, SharedTransfer, TransferRecord, TransferStatus};
use crate::config::{Config, ServerConfig};
use crate::manager::Registry;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const IRC_CONNECT_TIMEOUT_SECS: u64 = 15;
const AUTH_WAIT_SECS: u64 = 10;
const JOIN_WAIT_ROUNDS: u32 = 10;

/// Mutable per-session bookkeeping, owned by the session's tasks.
#[derive(Debug)]
pub struct SessionState {
    /// channel -> last active time
    pub joined_channels: HashMap<String, DateTime<Utc>>,
    pub banned_channels: HashSet<String>,
    /// nickname -> channels through which the agent reached that nickname
    pub bot_channel_map: HashMap<String, HashSet<String>>,
    /// sender nick -> pending resume offers awaiting DCC ACCEPT
    pub resume_queue: HashMap<String, Vec<ResumeOffer>>,
    pub last_active: DateTime<Utc>,
}

struct ActiveTransfer {
    record: SharedTransfer,
    cancel: CancellationToken,
}

/// An IRC session for a single server.
pub struct Session {
    weak: Weak<Session>,
    server: String,
    config: ServerConfig,
    global: Arc<Config>,
    nick: String,
    registry: Arc<Registry>,
    md5_tx: mpsc::Sender<Md5Job>,

    state: Mutex<SessionState>,
    current_transfers: Mutex<HashMap<Uuid, ActiveTransfer>>,

    out_tx: mpsc::UnboundedSender<String>,
    out_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    command_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<SessionCommand>>>,
    pending_commands: AtomicUsize,

    authenticated: AtomicBool,
    auth_gate: Notify,
    consumer_started: AtomicBool,
    quit_token: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server", &self.server)
            .field("nick", &self.nick)
            .finish()
    }
}

impl Session {
    pub fn new(
        server: &str,
        config: ServerConfig,
        global: Arc<Config>,
        registry: Arc<Registry>,
        md5_tx: mpsc::Sender<Md5Job>,
    ) -> Arc<Self> {
        let nick = if config.random_nick {
            generate_random_nick(&config.nick)
        } else {
            config.nick.clone()
        };

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            server: server.to_string(),
            config,
            global,
            nick,
            registry,
            md5_tx,
            state: Mutex::new(SessionState {
                joined_channels: HashMap::new(),
                banned_channels: HashSet::new(),
                bot_channel_map: HashMap::new(),
                resume_queue: HashMap::new(),
                last_active: Utc::now(),
            }),
            current_transfers: Mutex::new(HashMap::new()),
            out_tx,
            out_rx: std::sync::Mutex::new(Some(out_rx)),
            command_tx,
            command_rx: std::sync::Mutex::new(Some(command_rx)),
            pending_commands: AtomicUsize::new(0),
            authenticated: AtomicBool::new(false),
            auth_gate: Notify::new(),
            consumer_started: AtomicBool::new(false),
            quit_token: CancellationToken::new(),
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    fn strong(&self) -> Arc<Session> {
        self.weak.upgrade().expect("session dropped while in use")
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn server_config(&self) -> &ServerConfig {
        &self.config
    }

    fn download_path(&self) -> PathBuf {
        PathBuf::from(&self.global.default_download_path)
    }

    /// Establish the connection to the IRC server and start the IO tasks.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let port = self.config.effective_port();
        let stream = timeout(
            Duration::from_secs(IRC_CONNECT_TIMEOUT_SECS),
            TcpStream::connect((self.server.as_str(), port)),
        )
        .await
        .map_err(|_| {
            SessionError::Timeout(format!(
                "Connection to {}:{} timed out after {}s",
                self.server, port, IRC_CONNECT_TIMEOUT_SECS
            ))
        })?
        .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;

        if self.config.use_tls {
            let mut builder = native_tls::TlsConnector::builder();
            if !self.config.verify_ssl {
                builder
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true);
            }
            let connector = builder
                .build()
                .map_err(|e| SessionError::ConnectionFailed(format!("TLS setup failed: {}", e)))?;
            let connector = tokio_native_tls::TlsConnector::from(connector);
            let tls_stream = connector.connect(&self.server, stream).await.map_err(|e| {
                SessionError::ConnectionFailed(format!("TLS handshake failed: {}", e))
            })?;
            let (reader, writer) = tokio::io::split(tls_stream);
            self.start_io(BufReader::new(reader), writer);
        } else {
            let (reader, writer) = stream.into_split();
            self.start_io(BufReader::new(reader), writer);
        }

        self.send_line(format!("NICK {}", self.nick));
        self.send_line(format!("USER {} 0 * :xdccd 1.0", self.nick));
        tracing::info!(
            "Connecting to server: {} with nick: {}",
            self.server,
            self.nick
        );
        Ok(())
    }

    fn start_io<R, W>(&self, reader: BufReader<R>, mut writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Some(mut out_rx) = self.out_rx.lock().unwrap().take() else {
            return;
        };

        let quit = self.quit_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = quit.cancelled() => break,
                    line = out_rx.recv() => match line {
                        Some(line) => {
                            if writer.write_all(format!("{}\r\n", line).as_bytes()).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = writer.shutdown().await;
        });

        let session = self.strong();
        tokio::spawn(session.read_loop(reader));
    }

    async fn read_loop<R: AsyncRead + Unpin>(self: Arc<Self>, mut reader: BufReader<R>) {
        let mut buf = Vec::with_capacity(1024);
        loop {
            buf.clear();
            tokio::select! {
                _ = self.quit_token.cancelled() => break,
                read = reader.read_until(b'\n', &mut buf) => match read {
                    Ok(0) => {
                        tracing::info!("Connection closed by server {}", self.server);
                        break;
                    }
                    Ok(_) => {
                        // lossy: IRC traffic is not reliably UTF-8
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim();
                        tracing::trace!("IRC < {}", line);
                        if let Some(event) = wire::parse_line(line) {
                            self.dispatch(event).await;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Read error on {}: {}", self.server, e);
                        break;
                    }
                }
            }
        }
    }

    /// Queue an outbound IRC line for the writer task.
    fn send_line(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::debug!("IRC > {}", line);
        let _ = self.out_tx.send(line);
    }

    /// Queue a control command for the session's consumer.
    pub fn queue_command(&self, command: SessionCommand) {
        tracing::debug!("Queued command: {:?}", command);
        self.pending_commands.fetch_add(1, Ordering::SeqCst);
        let _ = self.command_tx.send(command);
    }

    /// Disconnect from the IRC server.
    pub async fn disconnect(&self, reason: &str) {
        self.send_line(format!("QUIT :{}", reason));
        self.quit_token.cancel();
        tracing::info!("Disconnected from server {} ({})", self.server, reason);
    }

    // ------------------------------------------------------------------
    // Event dispatch
    // ------------------------------------------------------------------

    async fn dispatch(&self, event: IrcEvent) {
        match event {
            IrcEvent::Welcome => self.on_welcome().await,
            IrcEvent::LoggedIn => self.on_loggedin().await,
            IrcEvent::Ping { token } => self.send_line(format!("PONG :{}", token)),
            IrcEvent::Join { nick, channel } => self.on_join(&nick, &channel).await,
            IrcEvent::Part { nick, channel } => self.on_part(&nick, &channel).await,
            IrcEvent::Kick { channel, target } => self.on_kick(&channel, &target).await,
            IrcEvent::BannedFromChan { channel } => self.on_bannedfromchan(&channel).await,
            IrcEvent::NoChanModes { channel } => self.on_nochanmodes(&channel).await,
            IrcEvent::Ctcp { from, payload } => self.on_ctcp(&from, &payload).await,
            IrcEvent::Privmsg { from, text } => self.on_privmsg(&from, &text).await,
        }
    }

    async fn on_welcome(&self) {
        tracing::info!("Connected to server: {}", self.server);

        if let Some(password) = &self.config.nickserv_password {
            self.send_line(format!("PRIVMSG NickServ :IDENTIFY {}", password));
            tracing::info!("Sent NickServ IDENTIFY command");
        }

        if !self.consumer_started.swap(true, Ordering::SeqCst) {
            if let Some(rx) = self.command_rx.lock().unwrap().take() {
                let session = self.strong();
                tokio::spawn(session.process_command_queue(rx));
            }
        }
    }

    async fn on_loggedin(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
        self.auth_gate.notify_one();
    }

    async fn on_join(&self, nick: &str, channel: &str) {
        if nick != self.nick {
            return;
        }
        let channel = channel.to_lowercase();
        let mut state = self.state.lock().await;
        if !state.joined_channels.contains_key(&channel) {
            tracing::info!("Joined channel {}", channel);
            state.joined_channels.insert(channel.clone(), Utc::now());
            state.banned_channels.remove(&channel);
        }
    }

    async fn on_part(&self, nick: &str, channel: &str) {
        if nick != self.nick {
            return;
        }
        let channel = channel.to_lowercase();
        let mut state = self.state.lock().await;
        if state.joined_channels.remove(&channel).is_some() {
            tracing::info!("Left channel {}", channel);
        }
    }

    async fn on_kick(&self, channel: &str, target: &str) {
        if target != self.nick {
            return;
        }
        let channel = channel.to_lowercase();
        tracing::info!("Kicked from channel {}", channel);
        self.state.lock().await.joined_channels.remove(&channel);
    }

    async fn on_bannedfromchan(&self, channel: &str) {
        let channel = channel.to_lowercase();
        tracing::info!("Banned from channel {}", channel);
        self.state.lock().await.banned_channels.insert(channel);
    }

    async fn on_nochanmodes(&self, channel: &str) {
        let channel = channel.to_lowercase();
        tracing::info!("Not allowed to join channel {}", channel);
        self.state.lock().await.joined_channels.remove(&channel);
    }

    async fn on_ctcp(&self, from: &str, payload: &str) {
        self.state.lock().await.last_active = Utc::now();

        let Some(rest) = payload.strip_prefix("DCC ") else {
            // CTCP PING and friends fall through to the message handler
            self.on_privmsg(from, payload).await;
            return;
        };
        if rest.is_empty() {
            tracing::warn!("Invalid DCC event from {}: {}", from, payload);
            return;
        }

        self.touch_bot_channels(from).await;

        if rest.starts_with("ACCEPT ") {
            self.on_dcc_accept(from, rest).await;
        } else if rest.starts_with("SEND ") {
            self.on_dcc_send(from, rest, false).await;
        } else if rest.starts_with("SSEND ") {
            self.on_dcc_send(from, rest, true).await;
        } else {
            tracing::warn!("Unknown DCC event from {}: {}", from, payload);
        }
    }

    /// Refresh the last-active timestamp of every channel through which we
    /// reached the given nickname.
    async fn touch_bot_channels(&self, nick: &str) {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        if let Some(channels) = state.bot_channel_map.get(&nick.to_lowercase()).cloned() {
            for channel in channels {
                state.joined_channels.insert(channel, now);
            }
        }
    }

    // ------------------------------------------------------------------
    // DCC negotiation
    // ------------------------------------------------------------------

    async fn on_dcc_accept(&self, from: &str, payload: &str) {
        if !self.state.lock().await.resume_queue.contains_key(from) {
            tracing::warn!("DCC ACCEPT not in queue: {} {}", from, payload);
            return;
        }

        let Some((port, resume_position)) = wire::parse_dcc_accept(payload) else {
            tracing::warn!("Invalid DCC ACCEPT command: {}", payload);
            return;
        };
        if !(1024..=65535).contains(&port) {
            tracing::warn!("Invalid DCC ACCEPT command (invalid port): {}", payload);
            return;
        }
        if resume_position < 1 {
            tracing::warn!(
                "Invalid DCC ACCEPT command (invalid resume position): {}",
                payload
            );
            return;
        }
        let port = port as u16;

        let offer = {
            let mut state = self.state.lock().await;
            let Some(queue) = state.resume_queue.get_mut(from) else {
                return;
            };
            let found = queue
                .iter()
                .position(|o| o.peer_port == port && o.offset == resume_position);
            match found {
                Some(idx) => {
                    let offer = queue.remove(idx);
                    if queue.is_empty() {
                        state.resume_queue.remove(from);
                    }
                    offer
                }
                None => {
                    tracing::warn!("DCC ACCEPT command for unknown file: {} {}", from, payload);
                    return;
                }
            }
        };

        self.init_dcc_connection(
            from,
            offer.peer_address,
            port,
            &offer.filename,
            offer.local_path,
            offer.size,
            resume_position,
            offer.use_ssl,
            offer.completed,
        )
        .await;
    }

    async fn on_dcc_send(&self, from: &str, payload: &str, use_ssl: bool) {
        let Some(args) = wire::parse_dcc_send_args(payload) else {
            tracing::warn!("Invalid DCC SEND command (not enough arguments): {}", payload);
            return;
        };
        let filename = args.filename;

        let Some(peer_address) = wire::parse_peer_address(&args.address) else {
            tracing::warn!("Rejected {}: Invalid IP address {}", filename, args.address);
            return;
        };

        if wire::is_private_ip(&peer_address) && !self.global.allow_private_ips {
            tracing::warn!("Rejected {}: Private IP address {}", filename, peer_address);
            return;
        }

        if !wire::is_valid_filename(&self.download_path(), &filename) {
            tracing::warn!(
                "Invalid DCC SEND command (file name contains invalid characters): {}",
                filename
            );
            return;
        }

        let (Ok(peer_port), Ok(size)) = (args.port.parse::<u32>(), args.size.parse::<u64>())
        else {
            tracing::warn!("Invalid DCC SEND command (invalid size or port)");
            return;
        };
        if peer_port == 0 {
            tracing::warn!("Passive DCC transfers are not supported.");
            return;
        }
        if peer_port > 65535 {
            tracing::warn!("Invalid DCC SEND command (invalid port)");
            return;
        }
        let peer_port = peer_port as u16;
        if size < 1 {
            tracing::warn!("Invalid DCC SEND command (invalid size)");
            return;
        }
        if size > self.global.max_file_size {
            tracing::warn!(
                "Rejected {}: File size exceeds limit ({} > {})",
                filename,
                size,
                self.global.max_file_size
            );
            return;
        }

        if self.registry.has_connected(&filename, size).await {
            tracing::warn!("Rejected {}: Download of file already in progress", filename);
            return;
        }

        let base_path = self.download_path().join(&filename);
        let mut local_files = vec![base_path.clone()];
        let mut write_path = base_path.clone();
        if let Some(suffix) = &self.global.incomplete_suffix {
            let suffixed = append_suffix(&base_path, suffix);
            local_files.push(suffixed.clone());
            write_path = suffixed;
        }

        for path in &local_files {
            let Ok(meta) = tokio::fs::metadata(path).await else {
                continue;
            };
            let mut local_size = meta.len();
            if local_size > size {
                tracing::warn!(
                    "Rejected {}: Local file larger than remote file ({} > {})",
                    filename,
                    local_size,
                    size
                );
                return;
            }

            let mut completed = false;
            if local_size == size {
                completed = true;
                tracing::info!(
                    "{}: File already completed, send resume command for last 4096 to complete transfer request.",
                    filename
                );
                local_size = local_size.saturating_sub(4096);
            }

            tracing::info!("Send DCC RESUME {} starting at {} bytes", filename, local_size);
            self.send_line(format!(
                "NOTICE {} :\x01DCC RESUME \"{}\" {} {}\x01",
                from,
                filename.replace('"', ""),
                peer_port,
                local_size
            ));

            self.state
                .lock()
                .await
                .resume_queue
                .entry(from.to_string())
                .or_default()
                .push(ResumeOffer {
                    peer_address,
                    peer_port,
                    filename: filename.clone(),
                    local_path: path.clone(),
                    size,
                    offset: local_size,
                    use_ssl,
                    completed,
                    offered_at: Utc::now(),
                });
            return;
        }

        self.init_dcc_connection(
            from,
            peer_address,
            peer_port,
            &filename,
            write_path,
            size,
            0,
            use_ssl,
            false,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn init_dcc_connection(
        &self,
        nick: &str,
        peer_address: IpAddr,
        peer_port: u16,
        filename: &str,
        download_path: PathBuf,
        size: u64,
        offset: u64,
        use_ssl: bool,
        completed: bool,
    ) {
        let dcc_msg = if use_ssl {
            "Receiving file via SSL DCC"
        } else {
            "Receiving file via DCC"
        };
        tracing::info!(
            "[{}] {} {} from {}:{}, size: {} bytes",
            nick,
            dcc_msg,
            filename,
            peer_address,
            peer_port,
            size
        );

        let record = TransferRecord::offered(
            &self.server,
            nick,
            peer_address,
            peer_port,
            filename,
            download_path,
            size,
            offset,
            use_ssl,
            completed,
        );
        let record = self.registry.register(record).await;

        let id = record.lock().await.id;
        let cancel = CancellationToken::new();
        self.current_transfers.lock().await.insert(
            id,
            ActiveTransfer {
                record: record.clone(),
                cancel: cancel.clone(),
            },
        );

        let session = self.strong();
        tokio::spawn(async move {
            session
                .run_transfer(id, record, peer_address, peer_port, use_ssl, cancel)
                .await;
        });
    }

    // ------------------------------------------------------------------
    // Transfer FSM
    // ------------------------------------------------------------------

    async fn run_transfer(
        self: Arc<Self>,
        id: Uuid,
        record: SharedTransfer,
        peer_address: IpAddr,
        peer_port: u16,
        use_ssl: bool,
        cancel: CancellationToken,
    ) {
        tracing::info!("Connecting to {}:{}", peer_address, peer_port);

        let mut stream = match dcc::connect(peer_address, peer_port, use_ssl).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(
                    "Connection error to {}:{}: {}",
                    peer_address,
                    peer_port,
                    e
                );
                let mut rec = record.lock().await;
                rec.status = TransferStatus::Error;
                rec.error = Some(e.to_string());
                rec.connected = false;
                drop(rec);
                self.current_transfers.lock().await.remove(&id);
                return;
            }
        };

        let mut file: Option<tokio::fs::File> = None;
        let mut buf = [0u8; 16384];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    stream.shutdown().await;
                    self.current_transfers.lock().await.remove(&id);
                    return;
                }
                read = stream.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if !self
                            .handle_chunk(&record, &mut stream, &mut file, &buf[..n])
                            .await
                        {
                            self.current_transfers.lock().await.remove(&id);
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("DCC read error from {}:{}: {}", peer_address, peer_port, e);
                        break;
                    }
                }
            }
        }

        drop(file);
        stream.shutdown().await;
        self.finalize_transfer(&record).await;
        self.current_transfers.lock().await.remove(&id);
    }

    /// Apply the in-progress rules to one received chunk. Returns false when
    /// the transfer was aborted (policy or disk error).
    async fn handle_chunk(
        &self,
        record: &SharedTransfer,
        stream: &mut DccStream,
        file: &mut Option<tokio::fs::File>,
        chunk: &[u8],
    ) -> bool {
        let (is_completed, bytes_received, offset, nick, file_path) = {
            let mut rec = record.lock().await;
            // a cancel may have landed while this chunk was in flight
            if rec.status.is_terminal() {
                drop(rec);
                stream.shutdown().await;
                return false;
            }
            rec.connected = true;
            rec.status = TransferStatus::InProgress;
            (
                rec.completed,
                rec.bytes_received,
                rec.offset,
                rec.nick.clone(),
                rec.file_path.clone(),
            )
        };

        // Past a completed flag, bytes are drained for counting only.
        if !is_completed {
            self.touch_bot_channels(&nick).await;
            self.update_progress(record).await;

            if bytes_received == 0 && offset == 0 && !self.global.allowed_mimetypes.is_empty() {
                let mime = dcc::detect_mime(chunk);
                if !self.global.allowed_mimetypes.iter().any(|m| m == mime) {
                    let mut rec = record.lock().await;
                    tracing::warn!(
                        "[{}] Reject {}: Invalid MIME type ({})",
                        rec.nick,
                        rec.filename,
                        mime
                    );
                    rec.status = TransferStatus::Error;
                    rec.error = Some(format!("Invalid MIME type ({})", mime));
                    rec.connected = false;
                    drop(rec);
                    stream.shutdown().await;
                    return false;
                }
            }

            let path = file_path.unwrap_or_default();
            if file.is_none() {
                match tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                {
                    Ok(f) => *file = Some(f),
                    Err(e) => {
                        return self.abort_on_write_error(record, stream, &path, e).await;
                    }
                }
            }
            if let Some(f) = file.as_mut() {
                if let Err(e) = f.write_all(chunk).await {
                    return self.abort_on_write_error(record, stream, &path, e).await;
                }
            }
        }

        let ack = {
            let mut rec = record.lock().await;
            rec.bytes_received += chunk.len() as u64;
            dcc::encode_ack(rec.size, rec.bytes_received + rec.offset)
        };
        if stream.write_all(&ack).await.is_err() {
            tracing::debug!("Connection reset by peer.");
            stream.shutdown().await;
        }
        true
    }

    async fn abort_on_write_error(
        &self,
        record: &SharedTransfer,
        stream: &mut DccStream,
        path: &Path,
        e: std::io::Error,
    ) -> bool {
        tracing::error!("Error writing to file {}: {}", path.display(), e);
        let mut rec = record.lock().await;
        rec.status = TransferStatus::Error;
        rec.error = Some(format!("Error writing to file {}: {}", path.display(), e));
        rec.connected = false;
        drop(rec);
        stream.shutdown().await;
        false
    }

    async fn update_progress(&self, record: &SharedTransfer) {
        let mut rec = record.lock().await;
        if rec.size == 0 {
            return;
        }
        let now = Utc::now();
        let percent = (100 * (rec.bytes_received + rec.offset) / rec.size).min(100) as u8;
        let due = match rec.last_progress_update {
            None => true,
            Some(last) => (now - last).num_seconds() >= 5,
        };
        if rec.percent + 10 <= percent || due {
            let (speed, speed_avg) = rec.speeds(now);
            tracing::info!(
                "[{}] Downloading {} {}% @ {:.2} KB/s / {:.2} KB/s",
                rec.nick,
                rec.filename,
                percent,
                speed,
                speed_avg
            );
            rec.percent = percent;
            rec.last_progress_update = Some(now);
            rec.last_progress_bytes_received = rec.bytes_received;
        }
    }

    /// Apply the disconnect rules once the peer socket is gone.
    async fn finalize_transfer(&self, record: &SharedTransfer) {
        let nick = {
            let mut rec = record.lock().await;
            rec.connected = false;
            rec.nick.clone()
        };
        self.touch_bot_channels(&nick).await;

        let mut rec = record.lock().await;
        if rec.status == TransferStatus::Cancelled {
            return;
        }

        let file_path = rec.file_path.clone().unwrap_or_default();
        let now = Utc::now();
        let elapsed = (now - rec.start_time).num_milliseconds() as f64 / 1000.0;
        let rate = if elapsed > 0.0 {
            rec.bytes_received as f64 / elapsed / 1024.0
        } else {
            0.0
        };

        match tokio::fs::metadata(&file_path).await {
            Err(_) => {
                tracing::error!(
                    "[{}] Download failed: {} does not exist",
                    rec.nick,
                    file_path.display()
                );
                if rec.status != TransferStatus::Error {
                    rec.status = TransferStatus::Error;
                    rec.error = Some(format!(
                        "Download failed: {} does not exist",
                        file_path.display()
                    ));
                }
            }
            Ok(meta) if meta.len() != rec.size => {
                tracing::error!(
                    "[{}] Download {} failed: size mismatch {} != {}",
                    rec.nick,
                    rec.filename,
                    meta.len(),
                    rec.size
                );
                if rec.status != TransferStatus::Error {
                    rec.status = TransferStatus::Failed;
                    rec.error = Some(format!("size mismatch {} != {}", meta.len(), rec.size));
                }
            }
            Ok(meta) => {
                tracing::info!(
                    "[{}] Download {} complete - size: {} bytes, {:.2} KB/s",
                    rec.nick,
                    rec.filename,
                    meta.len(),
                    rate
                );
                rec.completed = true;
                rec.completed_at = Some(now);
                rec.status = TransferStatus::Completed;

                if let Some(suffix) = &self.global.incomplete_suffix {
                    if file_path.to_string_lossy().ends_with(suffix.as_str()) {
                        let target = strip_suffix(&file_path, suffix);
                        match tokio::fs::rename(&file_path, &target).await {
                            Ok(()) => {
                                tracing::info!("Renamed downloaded file to {}", rec.filename);
                                rec.file_path = Some(target);
                            }
                            Err(e) => {
                                tracing::error!(
                                    "Error renaming {} to {}: {}",
                                    file_path.display(),
                                    target.display(),
                                    e
                                );
                            }
                        }
                    }
                }

                if rec.md5.is_some() {
                    let job = Md5Job {
                        id: rec.id,
                        filename: rec.filename.clone(),
                        file_path: rec.file_path.clone().unwrap_or_default(),
                    };
                    let _ = self.md5_tx.send(job).await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Messages and announcements
    // ------------------------------------------------------------------

    async fn on_privmsg(&self, from: &str, text: &str) {
        self.state.lock().await.last_active = Utc::now();

        if let Some(md5) = wire::parse_transfer_completed(text) {
            if let Some(job) = self
                .registry
                .attach_completed_md5(&self.server, from, &md5)
                .await
            {
                tracing::info!("[{}] MD5 checksum: {}", job.filename, md5);
                let _ = self.md5_tx.send(job).await;
            }
        }

        if let Some((filename, md5)) = wire::parse_pack_announcement(text) {
            self.registry
                .announce(TransferRecord::announced(&self.server, from, &filename, &md5))
                .await;
        }

        if let Some(reason) = wire::parse_send_denied(text) {
            tracing::error!("[{}] XDCC SEND denied: {}", from, reason);
        }

        tracing::info!("[{}] {}", from, text);
    }

    // ------------------------------------------------------------------
    // Command queue consumer
    // ------------------------------------------------------------------

    async fn process_command_queue(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<SessionCommand>,
    ) {
        self.handle_authentication().await;

        for channel in self.config.channels.clone() {
            self.join_channel(&channel).await;
        }

        while let Some(command) = rx.recv().await {
            self.pending_commands.fetch_sub(1, Ordering::SeqCst);
            self.state.lock().await.last_active = Utc::now();

            match command {
                SessionCommand::Join { channels } => {
                    self.join_channels(&channels).await;
                }
                SessionCommand::Part { channels, reason } => {
                    for channel in &channels {
                        self.part_channel(channel, reason.as_deref()).await;
                    }
                }
                SessionCommand::Send {
                    user,
                    message,
                    channels,
                } => {
                    self.handle_send_command(&user, &message, &channels).await;
                }
            }
        }
    }

    async fn handle_authentication(&self) {
        if self.config.nickserv_password.is_some() && !self.authenticated.load(Ordering::SeqCst) {
            tracing::debug!("Waiting for NickServ authentication");
            if timeout(Duration::from_secs(AUTH_WAIT_SECS), self.auth_gate.notified())
                .await
                .is_err()
            {
                tracing::error!("Timed out waiting for NickServ authentication");
            }
        }
    }

    async fn join_channel(&self, channel: &str) {
        if channel.is_empty()
            || self
                .state
                .lock()
                .await
                .joined_channels
                .contains_key(channel)
        {
            return;
        }
        self.send_line(format!("JOIN {}", channel));
        tracing::info!("Try to join channel: {}", channel);
    }

    async fn part_channel(&self, channel: &str, reason: Option<&str>) {
        {
            let state = self.state.lock().await;
            if !state.joined_channels.contains_key(channel) {
                return;
            }
        }
        self.send_line(format!("PART {} :{}", channel, reason.unwrap_or("")));
        tracing::info!("Parted channel: {} ({})", channel, reason.unwrap_or(""));
        let mut state = self.state.lock().await;
        state.last_active = Utc::now();
        state.joined_channels.remove(channel);
    }

    /// Join channels (plus their `also_join` companions) and wait up to
    /// ten seconds for the server to confirm. Failures are non-fatal.
    async fn join_channels(&self, channels: &[String]) {
        let mut waiting: Vec<String> = Vec::new();
        for channel in channels {
            self.join_channel(channel).await;
            waiting.push(channel.clone());
            if let Some(companions) = self.config.also_join.get(channel) {
                for companion in companions {
                    self.join_channel(companion).await;
                    waiting.push(companion.clone());
                }
            }
        }

        let mut retry = 0;
        while retry < JOIN_WAIT_ROUNDS && !waiting.is_empty() {
            {
                let state = self.state.lock().await;
                waiting.retain(|c| !state.joined_channels.contains_key(c));
            }
            if waiting.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            retry += 1;
        }

        if !waiting.is_empty() {
            tracing::warn!(
                "Failed to join channels {} after 10 seconds",
                waiting.join(", ")
            );
        }
    }

    async fn handle_send_command(&self, user: &str, message: &str, channels: &[String]) {
        if user.is_empty() || message.is_empty() {
            return;
        }

        if !channels.is_empty() {
            self.join_channels(channels).await;
        }

        self.send_line(format!("PRIVMSG {} :{}", user, message));
        tracing::info!("Sent message to {}: {}", user, message);

        if !channels.is_empty() {
            self.update_channel_mapping(user, channels).await;
        }
    }

    async fn update_channel_mapping(&self, user: &str, channels: &[String]) {
        let mut state = self.state.lock().await;
        let entry = state
            .bot_channel_map
            .entry(user.to_string())
            .or_default();
        entry.extend(channels.iter().cloned());
        let mapped: Vec<String> = entry.iter().cloned().collect();
        let now = Utc::now();
        for channel in mapped {
            state.joined_channels.insert(channel, now);
        }
    }

    // ------------------------------------------------------------------
    // Cleanup and introspection
    // ------------------------------------------------------------------

    /// Part idle channels and expire stale resume offers.
    pub async fn cleanup(&self, channel_idle_timeout: u64, resume_timeout: u64) {
        let now = Utc::now();

        if channel_idle_timeout > 0 {
            let idle_channels: Vec<String> = {
                let state = self.state.lock().await;
                state
                    .joined_channels
                    .iter()
                    .filter(|(_, last)| {
                        (now - **last).num_seconds() > channel_idle_timeout as i64
                    })
                    .map(|(c, _)| c.clone())
                    .collect()
            };
            for channel in idle_channels {
                self.part_channel(&channel, Some("Idle timeout")).await;
            }
        }

        let mut state = self.state.lock().await;
        for queue in state.resume_queue.values_mut() {
            queue.retain(|offer| {
                (now - offer.offered_at).num_seconds() <= resume_timeout as i64
            });
        }
    }

    /// Cancel a running transfer by `(nick, filename)`.
    ///
    /// On success the record reads `cancelled` before this returns; the
    /// transfer task observes the token and closes its socket on its next
    /// turn.
    pub async fn cancel_transfer(&self, nick: &str, filename: &str) -> bool {
        let mut transfers = self.current_transfers.lock().await;
        let mut found = None;
        for (id, active) in transfers.iter() {
            let rec = active.record.lock().await;
            if rec.filename == filename
                && rec.nick == nick
                && rec.status == TransferStatus::InProgress
            {
                found = Some(*id);
                break;
            }
        }

        let Some(id) = found else {
            return false;
        };
        let active = transfers.remove(&id).unwrap();
        {
            let mut rec = active.record.lock().await;
            rec.status = TransferStatus::Cancelled;
            rec.error = Some("Cancelled by user".to_string());
            rec.connected = false;
        }
        active.cancel.cancel();
        true
    }

    /// True when the session qualifies for the idle sweep.
    pub async fn is_idle(&self, idle_timeout: u64, now: DateTime<Utc>) -> bool {
        if self.pending_commands.load(Ordering::SeqCst) != 0 {
            return false;
        }
        if !self.current_transfers.lock().await.is_empty() {
            return false;
        }
        let state = self.state.lock().await;
        state.joined_channels.is_empty()
            && (now - state.last_active).num_seconds() > idle_timeout as i64
    }

    /// Channels and their last-active times, for the snapshot view.
    pub async fn channel_snapshot(&self) -> Vec<(String, DateTime<Utc>)> {
        let state = self.state.lock().await;
        let mut channels: Vec<_> = state
            .joined_channels
            .iter()
            .map(|(c, t)| (c.clone(), *t))
            .collect();
        channels.sort();
        channels
    }
}

fn generate_random_nick(base: &str) -> String {
    let mut rng = rand::thread_rng();
    format!("{}{:03}", base, rng.gen_range(0..1000))
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

fn strip_suffix(path: &Path, suffix: &str) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_suffix(suffix) {
        Some(stripped) => PathBuf::from(stripped),
        None => path.to_path_buf(),
    }
}
