//! Built-in command set serving the shared folder.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lanshare_protocol::Command;
use lanshare_transfer::{has_drive_prefix, resolve_in_root, validate_relative_path};
use tracing::debug;

use crate::error::PeerError;
use crate::handler::{CommandContext, CommandHandler, HandlerFuture};
use crate::ignore::IgnoreFilter;
use crate::node::Node;
use crate::pipeline::sender::{prepare_send, send_files, start_send};

/// Serves LS, CDR, GET, PUT, GETDIR, PUTDIR, GETM, PUTM, STATUS and INFO.
///
/// Each connection has its own remote working directory, changed by CDR
/// and always inside the shared folder.
#[derive(Default)]
pub struct FileCommands {
    cwd: Mutex<HashMap<String, String>>,
}

/// Joins `arg` onto `base`, resolving `.` and `..` lexically.
///
/// Both are relative to the shared folder; climbing above it is refused.
pub fn join_relative(base: &str, arg: &str) -> Result<String, PeerError> {
    let mut parts: Vec<&str> = base.split('/').filter(|p| !p.is_empty()).collect();
    let arg = arg.replace('\\', "/");
    if arg.starts_with('/') || has_drive_prefix(&arg) {
        return Err(PeerError::AccessDenied(format!("absolute path not allowed: {arg}")));
    }
    for part in arg.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(PeerError::AccessDenied(format!(
                        "{arg} is outside the shared folder"
                    )));
                }
            }
            p => parts.push(p),
        }
    }
    Ok(parts.join("/"))
}

/// Absolute path of a root-relative path; `""` is the root itself.
fn resolve(root: &Path, rel: &str) -> Result<PathBuf, PeerError> {
    Ok(resolve_in_root(root, if rel.is_empty() { "." } else { rel })?)
}

fn display(rel: &str) -> String {
    format!("/{rel}")
}

fn required_arg<'a>(cmd: &'a Command, what: &str) -> Result<&'a str, PeerError> {
    cmd.arg()
        .ok_or_else(|| PeerError::Protocol(format!("usage: {} <{what}>", cmd.name)))
}

/// Regular files under `dir`, recursively, skipping ignored entries.
///
/// `rel` is `dir` relative to the shared folder (for the ignore filter) and
/// `wire` the prefix the peer sees. Results are sorted by wire path.
pub async fn collect_files(
    dir: &Path,
    rel: &str,
    wire: &str,
    ignore: &dyn IgnoreFilter,
) -> Result<Vec<(String, PathBuf)>, PeerError> {
    let mut files = Vec::new();
    let mut stack = vec![(dir.to_path_buf(), rel.to_string(), wire.to_string())];

    while let Some((dir, rel, wire)) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_rel = join_name(&rel, &name);
            let child_wire = join_name(&wire, &name);
            let file_type = entry.file_type().await?;
            if ignore.should_ignore(&child_rel, file_type.is_dir()) {
                continue;
            }
            if file_type.is_dir() {
                stack.push((entry.path(), child_rel, child_wire));
            } else if file_type.is_file() {
                files.push((child_wire, entry.path()));
            }
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

fn join_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn file_list(header: String, files: &[(String, PathBuf)]) -> String {
    let mut out = header;
    for (wire, _) in files {
        out.push_str("\n  ");
        out.push_str(wire);
    }
    out
}

impl FileCommands {
    pub fn new() -> Self {
        Self::default()
    }

    fn cwd(&self, conn_id: &str) -> String {
        self.cwd
            .lock()
            .unwrap()
            .get(conn_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Rejects new work when the admission cap is reached.
    fn admit(node: &Node) -> Result<(), PeerError> {
        if node.registry().can_start_transfer() {
            Ok(())
        } else {
            Err(PeerError::TooManyTransfers(node.registry().max_active()))
        }
    }

    /// Resolves an argument for reading; returns (root-relative, absolute).
    fn readable(&self, ctx: &CommandContext, arg: &str) -> Result<(String, PathBuf), PeerError> {
        let node = &ctx.node;
        node.config().allow_reads()?;
        let rel = join_relative(&self.cwd(ctx.conn.id()), arg)?;
        let full = resolve(&node.config().folder, &rel)?;
        if !rel.is_empty() && node.ignore().should_ignore(&rel, full.is_dir()) {
            return Err(PeerError::AccessDenied(format!("{arg} is restricted")));
        }
        Ok((rel, full))
    }

    async fn list(&self, ctx: CommandContext, cmd: Command) -> Result<String, PeerError> {
        let (rel, full) = self.readable(&ctx, cmd.arg().unwrap_or("."))?;
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|_| PeerError::NotFound(display(&rel)))?;
        if !meta.is_dir() {
            return Ok(format!("{} ({} bytes)", display(&rel), meta.len()));
        }

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&full).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await?.is_dir();
            if ctx.node.ignore().should_ignore(&join_name(&rel, &name), is_dir) {
                continue;
            }
            names.push(if is_dir { format!("{name}/") } else { name });
        }
        names.sort_by_key(|n| n.to_lowercase());

        let mut out = format!("Contents of {}:", display(&rel));
        if names.is_empty() {
            out.push_str("\n  (empty)");
        }
        for name in names {
            out.push_str("\n  ");
            out.push_str(&name);
        }
        Ok(out)
    }

    async fn change_dir(&self, ctx: CommandContext, cmd: Command) -> Result<String, PeerError> {
        let arg = required_arg(&cmd, "dir")?;
        let rel = join_relative(&self.cwd(ctx.conn.id()), arg)?;
        let full = resolve(&ctx.node.config().folder, &rel)?;
        if !tokio::fs::metadata(&full).await.is_ok_and(|m| m.is_dir()) {
            return Err(PeerError::NotFound(format!("directory {}", display(&rel))));
        }
        self.cwd
            .lock()
            .unwrap()
            .insert(ctx.conn.id().to_string(), rel.clone());
        Ok(format!("Remote directory: {}", display(&rel)))
    }

    async fn get(&self, ctx: CommandContext, cmd: Command) -> Result<String, PeerError> {
        let arg = required_arg(&cmd, "file")?;
        let (rel, full) = self.readable(&ctx, arg)?;
        let wire = join_relative("", arg).unwrap_or(rel);
        let transfer = prepare_send(&ctx.node, &ctx.conn, &wire, &full).await?;
        let size = transfer.total_bytes();
        start_send(Arc::clone(&ctx.node), Arc::clone(&ctx.conn), transfer);
        Ok(format!("Starting file transfer: {wire} ({size} bytes)"))
    }

    fn put(&self, ctx: CommandContext, cmd: Command) -> Result<String, PeerError> {
        let arg = required_arg(&cmd, "file")?;
        ctx.node.config().allow_writes()?;
        validate_relative_path(arg)?;
        if ctx.node.ignore().should_ignore(arg, false) {
            return Err(PeerError::AccessDenied(format!("{arg} is restricted")));
        }
        Self::admit(&ctx.node)?;
        Ok(format!("Ready to receive file: {arg}"))
    }

    async fn get_dir(&self, ctx: CommandContext, cmd: Command) -> Result<String, PeerError> {
        let arg = required_arg(&cmd, "dir")?;
        let (rel, full) = self.readable(&ctx, arg)?;
        if !tokio::fs::metadata(&full).await.is_ok_and(|m| m.is_dir()) {
            return Err(PeerError::NotFound(format!("directory {}", display(&rel))));
        }
        Self::admit(&ctx.node)?;

        let wire = join_relative("", arg).unwrap_or_else(|_| rel.clone());
        let files = collect_files(&full, &rel, &wire, ctx.node.ignore()).await?;
        if files.is_empty() {
            return Ok(format!("Directory {wire} has no files to send"));
        }
        for (path, source) in &files {
            if let Ok(meta) = tokio::fs::metadata(source).await {
                ctx.node.config().check_size(meta.len()).map_err(|e| {
                    PeerError::Protocol(format!("{path}: {e}"))
                })?;
            }
        }

        let reply = file_list(format!("Sending {} files from {wire}:", files.len()), &files);
        spawn_batch(ctx, files);
        Ok(reply)
    }

    fn put_dir(&self, ctx: CommandContext, cmd: Command) -> Result<String, PeerError> {
        let arg = required_arg(&cmd, "dir")?;
        ctx.node.config().allow_writes()?;
        validate_relative_path(arg)?;
        Self::admit(&ctx.node)?;
        Ok(format!("Ready to receive directory: {arg}"))
    }

    async fn get_many(&self, ctx: CommandContext, cmd: Command) -> Result<String, PeerError> {
        if cmd.args.is_empty() {
            return Err(PeerError::Protocol("usage: GETM <pattern>...".into()));
        }
        ctx.node.config().allow_reads()?;
        let cwd = self.cwd(ctx.conn.id());
        let mut files = Vec::new();
        for pattern in &cmd.args {
            files.extend(find_matching(&ctx.node, &cwd, pattern).await?);
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        files.dedup_by(|a, b| a.0 == b.0);
        if files.is_empty() {
            return Err(PeerError::NotFound(format!(
                "no files match {}",
                cmd.args.join(" ")
            )));
        }
        Self::admit(&ctx.node)?;

        let reply = file_list(format!("Sending {} matching files:", files.len()), &files);
        spawn_batch(ctx, files);
        Ok(reply)
    }

    fn put_many(&self, ctx: CommandContext) -> Result<String, PeerError> {
        ctx.node.config().allow_writes()?;
        Self::admit(&ctx.node)?;
        Ok("Ready to receive multiple files".into())
    }

    fn status(&self, ctx: CommandContext) -> Result<String, PeerError> {
        Ok(status_report(&ctx.node))
    }

    fn info(&self, ctx: CommandContext) -> Result<String, PeerError> {
        let config = ctx.node.config();
        let mode = match (config.read_only, config.write_only) {
            (true, _) => "read-only",
            (_, true) => "write-only",
            _ => "read-write",
        };
        let limit = match config.max_size_mb {
            0 => "unlimited".to_string(),
            mb => format!("{mb} MB"),
        };
        Ok(format!(
            "Name: {}\nMode: {mode}\nMax file size: {limit}\nChecksums: {}\nRemote directory: {}",
            config.name,
            if config.verify { "on" } else { "off" },
            display(&self.cwd(ctx.conn.id()))
        ))
    }
}

/// Files matching one GETM pattern. A pattern may carry a directory part
/// (`docs/*.md`); the file-name part is matched against every file below
/// that directory.
async fn find_matching(
    node: &Node,
    cwd: &str,
    pattern: &str,
) -> Result<Vec<(String, PathBuf)>, PeerError> {
    let pattern = pattern.replace('\\', "/");
    let (dir_part, name_pattern) = match pattern.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", pattern.as_str()),
    };
    let rel = join_relative(cwd, dir_part)?;
    let wire = join_relative("", dir_part).unwrap_or_else(|_| rel.clone());
    let full = resolve(&node.config().folder, &rel)?;
    if !tokio::fs::metadata(&full).await.is_ok_and(|m| m.is_dir()) {
        return Ok(Vec::new());
    }

    let files = collect_files(&full, &rel, &wire, node.ignore()).await?;
    Ok(files
        .into_iter()
        .filter(|(wire, _)| {
            let base = wire.rsplit('/').next().unwrap_or(wire);
            crate::ignore::wildcard_match(name_pattern, base)
        })
        .collect())
}

fn spawn_batch(ctx: CommandContext, files: Vec<(String, PathBuf)>) {
    tokio::spawn(async move {
        let sent = send_files(&ctx.node, &ctx.conn, files).await;
        debug!(conn = %ctx.conn.id(), sent, "batch finished");
    });
}

/// One line per registered transfer.
pub fn status_report(node: &Node) -> String {
    let transfers = node.registry().transfers();
    if transfers.is_empty() {
        return "No active transfers".into();
    }
    let mut out = String::from("Active transfers:");
    for t in transfers {
        let snap = t.snapshot();
        out.push_str(&format!(
            "\n  [{}] {} {}: {:.1}% {} ({:.2} KB/s)",
            snap.id,
            snap.direction.verb(),
            snap.path,
            snap.percent(),
            snap.status,
            snap.speed_kbps()
        ));
    }
    out
}

impl CommandHandler for FileCommands {
    fn on_list(&self, ctx: CommandContext, cmd: Command) -> HandlerFuture<'_> {
        Box::pin(self.list(ctx, cmd))
    }

    fn on_change_dir(&self, ctx: CommandContext, cmd: Command) -> HandlerFuture<'_> {
        Box::pin(self.change_dir(ctx, cmd))
    }

    fn on_get(&self, ctx: CommandContext, cmd: Command) -> HandlerFuture<'_> {
        Box::pin(self.get(ctx, cmd))
    }

    fn on_put(&self, ctx: CommandContext, cmd: Command) -> HandlerFuture<'_> {
        Box::pin(async move { self.put(ctx, cmd) })
    }

    fn on_get_dir(&self, ctx: CommandContext, cmd: Command) -> HandlerFuture<'_> {
        Box::pin(self.get_dir(ctx, cmd))
    }

    fn on_put_dir(&self, ctx: CommandContext, cmd: Command) -> HandlerFuture<'_> {
        Box::pin(async move { self.put_dir(ctx, cmd) })
    }

    fn on_get_many(&self, ctx: CommandContext, cmd: Command) -> HandlerFuture<'_> {
        Box::pin(self.get_many(ctx, cmd))
    }

    fn on_put_many(&self, ctx: CommandContext, _cmd: Command) -> HandlerFuture<'_> {
        Box::pin(async move { self.put_many(ctx) })
    }

    fn on_status(&self, ctx: CommandContext, _cmd: Command) -> HandlerFuture<'_> {
        Box::pin(async move { self.status(ctx) })
    }

    fn on_info(&self, ctx: CommandContext, _cmd: Command) -> HandlerFuture<'_> {
        Box::pin(async move { self.info(ctx) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ignore::IgnoreList;

    #[test]
    fn join_relative_normalizes() {
        assert_eq!(join_relative("", "docs").unwrap(), "docs");
        assert_eq!(join_relative("docs", "a/b.txt").unwrap(), "docs/a/b.txt");
        assert_eq!(join_relative("docs/sub", "..").unwrap(), "docs");
        assert_eq!(join_relative("docs", "./x/../y").unwrap(), "docs/y");
        assert_eq!(join_relative("docs", ".").unwrap(), "docs");
        assert_eq!(join_relative("", "").unwrap(), "");
        assert_eq!(join_relative("logs", "12:30.log").unwrap(), "logs/12:30.log");
    }

    #[test]
    fn join_relative_refuses_escape() {
        assert!(matches!(
            join_relative("", ".."),
            Err(PeerError::AccessDenied(_))
        ));
        assert!(join_relative("docs", "../../etc").is_err());
        assert!(join_relative("", "/etc/passwd").is_err());
        assert!(join_relative("", "C:\\Windows").is_err());
    }

    #[tokio::test]
    async fn collect_files_walks_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("photos/raw")).unwrap();
        std::fs::write(root.join("photos/a.jpg"), b"a").unwrap();
        std::fs::write(root.join("photos/raw/b.cr2"), b"b").unwrap();
        std::fs::write(root.join("photos/thumbs.db"), b"x").unwrap();

        let ignore = IgnoreList::parse("*.db\n");
        let files = collect_files(&root.join("photos"), "photos", "photos", &ignore)
            .await
            .unwrap();
        let names: Vec<&str> = files.iter().map(|(w, _)| w.as_str()).collect();
        assert_eq!(names, vec!["photos/a.jpg", "photos/raw/b.cr2"]);
    }
}
