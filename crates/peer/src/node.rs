//! A file sharing node: the registry, its connections and the operations
//! a local user can start.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lanshare_protocol::{Command, Message, MessageType};
use lanshare_transfer::{Direction, FileTransfer, TransferId, resolve_in_root};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::commands::{FileCommands, collect_files};
use crate::config::Config;
use crate::connection::{Connection, Role};
use crate::error::PeerError;
use crate::handler::CommandHandler;
use crate::ignore::{IgnoreFilter, IgnoreList, wildcard_match};
use crate::options::PeerOptions;
use crate::output::Output;
use crate::pipeline::notify_abort;
use crate::pipeline::receiver::abort_receive;
use crate::pipeline::sender::{prepare_send, send_files, start_send};
use crate::pumps::keepalive::keepalive_pump;
use crate::pumps::read::read_pump;
use crate::registry::Registry;

/// Builder for [`Node`].
pub struct NodeBuilder {
    config: Config,
    output: Output,
    handler: Option<Arc<dyn CommandHandler>>,
    ignore: Option<Arc<dyn IgnoreFilter>>,
    options: PeerOptions,
}

impl NodeBuilder {
    /// Replaces the built-in [`FileCommands`].
    pub fn handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Replaces the ignore list loaded from the shared folder.
    pub fn ignore(mut self, ignore: Arc<dyn IgnoreFilter>) -> Self {
        self.ignore = Some(ignore);
        self
    }

    pub fn options(mut self, options: PeerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Arc<Node> {
        let ignore = self
            .ignore
            .unwrap_or_else(|| Arc::new(IgnoreList::load(&self.config.folder)));
        let handler = self
            .handler
            .unwrap_or_else(|| Arc::new(FileCommands::new()));
        Arc::new(Node {
            registry: Registry::new(self.config.max_transfers),
            config: self.config,
            output: self.output,
            handler,
            ignore,
            options: self.options,
            shutdown: CancellationToken::new(),
        })
    }
}

pub struct Node {
    config: Config,
    registry: Registry,
    output: Output,
    handler: Arc<dyn CommandHandler>,
    ignore: Arc<dyn IgnoreFilter>,
    options: PeerOptions,
    shutdown: CancellationToken,
}

impl Node {
    pub fn builder(config: Config, output: Output) -> NodeBuilder {
        NodeBuilder {
            config,
            output,
            handler: None,
            ignore: None,
            options: PeerOptions::default(),
        }
    }

    /// A node with the built-in command set and default timings.
    pub fn new(config: Config, output: Output) -> Arc<Self> {
        Self::builder(config, output).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn output(&self) -> &Output {
        &self.output
    }

    pub fn handler(&self) -> Arc<dyn CommandHandler> {
        Arc::clone(&self.handler)
    }

    pub fn ignore(&self) -> &dyn IgnoreFilter {
        self.ignore.as_ref()
    }

    pub fn options(&self) -> &PeerOptions {
        &self.options
    }

    /// Cancelled when the node stops, e.g. after a client-role disconnect.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Closes every connection and stops accepting.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // -- connecting -------------------------------------------------------

    /// Binds `addr` and serves until shutdown.
    pub async fn listen(self: &Arc<Self>, addr: &str) -> Result<(), PeerError> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener` until shutdown.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), PeerError> {
        let local = listener.local_addr()?;
        info!(addr = %local, folder = %self.config.folder.display(), "listening");
        self.output.info(format!(
            "Listening on {local}, sharing {}",
            self.config.folder.display()
        ));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(peer = %addr, "accepted connection");
                            let node = Arc::clone(self);
                            tokio::spawn(async move {
                                let _ = stream.set_nodelay(true);
                                let (read, write) = stream.into_split();
                                if let Err(e) = node
                                    .attach_halves(Box::new(read), Box::new(write), addr.to_string(), Role::Server)
                                    .await
                                {
                                    warn!(peer = %addr, "connection setup failed: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {e}");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Connects to `addr` in the client role.
    pub async fn dial(self: &Arc<Self>, addr: &str) -> Result<Arc<Connection>, PeerError> {
        let stream = tokio::time::timeout(self.options.handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout("connect"))??;
        let _ = stream.set_nodelay(true);
        let id = stream.peer_addr()?.to_string();
        let (read, write) = stream.into_split();
        self.attach_halves(Box::new(read), Box::new(write), id, Role::Client)
            .await
    }

    /// Runs the protocol over any byte stream.
    pub async fn attach<S>(
        self: &Arc<Self>,
        stream: S,
        id: String,
        role: Role,
    ) -> Result<Arc<Connection>, PeerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        self.attach_halves(Box::new(read), Box::new(write), id, role)
            .await
    }

    async fn attach_halves(
        self: &Arc<Self>,
        read: Box<dyn AsyncRead + Send + Unpin>,
        write: Box<dyn AsyncWrite + Send + Unpin>,
        id: String,
        role: Role,
    ) -> Result<Arc<Connection>, PeerError> {
        let mut lines = FramedRead::new(
            read,
            LinesCodec::new_with_max_length(self.options.max_line_length),
        );
        let cancel = self.shutdown.child_token();
        let (conn, retry) = Connection::new(id, role, write, self.options.clone(), cancel.clone());

        if let Err(e) = conn
            .handshake(&mut lines, &self.config.name)
            .await
        {
            conn.finish_close().await;
            return Err(e);
        }

        info!(conn = %conn.id(), peer = %conn.remote_name(), ?role, "connected");
        self.output.success(format!(
            "Connected to {} ({})",
            conn.remote_name(),
            conn.id()
        ));
        self.registry.add_connection(Arc::clone(&conn));

        tokio::spawn(retry.run());
        tokio::spawn(keepalive_pump(Arc::clone(&conn), cancel));
        let node = Arc::clone(self);
        let pump_conn = Arc::clone(&conn);
        tokio::spawn(async move {
            read_pump(lines, Arc::clone(&node), Arc::clone(&pump_conn)).await;
            node.on_connection_closed(&pump_conn).await;
        });
        Ok(conn)
    }

    /// Teardown after the read pump exits: unregister the connection, fail
    /// its transfers and, for the client role, stop the node.
    async fn on_connection_closed(self: &Arc<Self>, conn: &Arc<Connection>) {
        conn.finish_close().await;
        self.registry.remove_connection(conn.id());

        for transfer in self.registry.transfers_for_connection(conn.id()) {
            match transfer.direction() {
                Direction::Receive => {
                    abort_receive(self, None, &transfer, "connection closed").await;
                }
                Direction::Send => {
                    // The send task reports the failure once it unwinds.
                    transfer.fail("connection closed");
                    let _ = transfer.close_file().await;
                }
            }
        }

        info!(conn = %conn.id(), peer = %conn.remote_name(), "disconnected");
        self.output
            .warning(format!("Disconnected from {}", conn.remote_name()));

        if conn.role() == Role::Client && !self.shutdown.is_cancelled() {
            let node = Arc::clone(self);
            let grace = self.options.close_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                node.shutdown();
            });
        }
    }

    /// The connection local commands go to.
    pub fn primary_connection(&self) -> Result<Arc<Connection>, PeerError> {
        self.registry
            .primary_connection()
            .ok_or(PeerError::NotConnected)
    }

    // -- local operations -------------------------------------------------

    /// Sends a command line to the peer and returns its result.
    pub async fn remote(&self, line: &str) -> Result<String, PeerError> {
        let cmd: Command = line.parse()?;
        self.primary_connection()?.request(&cmd).await
    }

    /// Sends a chat message.
    pub async fn chat(&self, text: &str) -> Result<(), PeerError> {
        self.primary_connection()?
            .send(Message::new(MessageType::Message, text))
            .await
    }

    fn local_source(&self, local: &str) -> Result<(String, PathBuf), PeerError> {
        let wire = crate::commands::join_relative("", local)?;
        if wire.is_empty() {
            return Err(PeerError::Protocol("a file or directory name is required".into()));
        }
        let full = resolve_in_root(&self.config.folder, &wire)?;
        if self.ignore.should_ignore(&wire, full.is_dir()) {
            return Err(PeerError::AccessDenied(format!("{local} is restricted")));
        }
        Ok((wire, full))
    }

    /// Uploads one file: asks the peer with PUT, then streams it.
    pub async fn put(self: &Arc<Self>, local: &str) -> Result<Arc<FileTransfer>, PeerError> {
        self.config.allow_reads()?;
        let conn = self.primary_connection()?;
        let (wire, full) = self.local_source(local)?;
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|_| PeerError::NotFound(local.to_string()))?;
        self.config.check_size(meta.len())?;
        if !self.registry.can_start_transfer() {
            return Err(PeerError::TooManyTransfers(self.registry.max_active()));
        }

        let reply = conn.request(&Command::new("PUT", [wire.as_str()])).await?;
        debug!(path = %wire, "peer accepted PUT: {reply}");
        let transfer = prepare_send(self, &conn, &wire, &full).await?;
        start_send(Arc::clone(self), conn, Arc::clone(&transfer));
        Ok(transfer)
    }

    /// Uploads a directory tree, one file at a time.
    pub async fn put_dir(self: &Arc<Self>, local: &str) -> Result<usize, PeerError> {
        self.config.allow_reads()?;
        let conn = self.primary_connection()?;
        let (wire, full) = self.local_source(local)?;
        if !full.is_dir() {
            return Err(PeerError::NotFound(format!("directory {local}")));
        }
        let files = collect_files(&full, &wire, &wire, self.ignore()).await?;
        if files.is_empty() {
            self.output.info(format!("Directory {wire} has no files to send"));
            return Ok(0);
        }
        self.check_batch(&files).await?;

        conn.request(&Command::new("PUTDIR", [wire.as_str()])).await?;
        Ok(self.spawn_batch(conn, files))
    }

    /// Uploads every local file matching any of `patterns`.
    pub async fn put_many(self: &Arc<Self>, patterns: &[String]) -> Result<usize, PeerError> {
        self.config.allow_reads()?;
        let conn = self.primary_connection()?;
        let mut files = Vec::new();
        for pattern in patterns {
            files.extend(self.local_matches(pattern).await?);
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        files.dedup_by(|a, b| a.0 == b.0);
        if files.is_empty() {
            return Err(PeerError::NotFound(format!(
                "no files match {}",
                patterns.join(" ")
            )));
        }
        self.check_batch(&files).await?;

        conn.request(&Command::new("PUTM", Vec::<String>::new()))
            .await?;
        Ok(self.spawn_batch(conn, files))
    }

    async fn local_matches(&self, pattern: &str) -> Result<Vec<(String, PathBuf)>, PeerError> {
        let pattern = pattern.replace('\\', "/");
        let (dir, name) = match pattern.rsplit_once('/') {
            Some((dir, name)) => (crate::commands::join_relative("", dir)?, name.to_string()),
            None => (String::new(), pattern.clone()),
        };
        let full = if dir.is_empty() {
            self.config.folder.clone()
        } else {
            resolve_in_root(&self.config.folder, &dir)?
        };
        if !full.is_dir() {
            return Ok(Vec::new());
        }
        let files = collect_files(&full, &dir, &dir, self.ignore()).await?;
        Ok(files
            .into_iter()
            .filter(|(wire, _)| {
                let base = wire.rsplit('/').next().unwrap_or(wire);
                wildcard_match(&name, base)
            })
            .collect())
    }

    /// Rejects a batch containing any file over the size limit.
    async fn check_batch(&self, files: &[(String, PathBuf)]) -> Result<(), PeerError> {
        for (wire, source) in files {
            let size = tokio::fs::metadata(source).await?.len();
            self.config
                .check_size(size)
                .map_err(|e| PeerError::Protocol(format!("{wire}: {e}")))?;
        }
        Ok(())
    }

    fn spawn_batch(self: &Arc<Self>, conn: Arc<Connection>, files: Vec<(String, PathBuf)>) -> usize {
        let count = files.len();
        let node = Arc::clone(self);
        tokio::spawn(async move {
            send_files(&node, &conn, files).await;
        });
        count
    }

    // -- transfer control -------------------------------------------------

    fn transfer(&self, id: TransferId) -> Result<Arc<FileTransfer>, PeerError> {
        self.registry
            .transfer(id)
            .ok_or_else(|| PeerError::NotFound(format!("transfer {id}")))
    }

    /// Pauses an outgoing transfer.
    pub fn pause(&self, id: TransferId) -> Result<(), PeerError> {
        let transfer = self.transfer(id)?;
        if transfer.direction() == Direction::Receive {
            return Err(PeerError::Protocol(
                "only outgoing transfers can be paused".into(),
            ));
        }
        transfer.pause()?;
        self.output.info(format!("Paused {}", transfer.path()));
        Ok(())
    }

    /// Resumes a paused transfer.
    pub fn resume(&self, id: TransferId) -> Result<(), PeerError> {
        let transfer = self.transfer(id)?;
        transfer.resume()?;
        self.output.info(format!("Resumed {}", transfer.path()));
        Ok(())
    }

    /// Cancels a transfer, closing its file and, for a receive, deleting
    /// the partial data. Returns `false` if no such transfer was active.
    pub async fn cancel(&self, id: TransferId) -> bool {
        let Some(transfer) = self.registry.remove_transfer(id) else {
            return false;
        };
        if !transfer.cancel() {
            return false;
        }
        let _ = transfer.close_file().await;
        info!(id, path = %transfer.path(), "transfer cancelled");

        if transfer.direction() == Direction::Receive {
            crate::pipeline::receiver::remove_partial(&transfer).await;
            if let Some(conn) = self.registry.connection(transfer.connection_id()) {
                notify_abort(&conn, transfer.path(), "cancelled").await;
            }
            self.output
                .transfer_finished(transfer.snapshot(), Some("cancelled".into()));
        }
        true
    }

    /// Every registered transfer, oldest first.
    pub fn transfers(&self) -> Vec<Arc<FileTransfer>> {
        self.registry.transfers()
    }

    /// Whether any transfer is still running.
    pub fn is_any_transfer_active(&self) -> bool {
        self.registry.is_any_transfer_active()
    }

    /// Shared folder as an absolute path, if it exists.
    pub fn folder(&self) -> &Path {
        &self.config.folder
    }
}
