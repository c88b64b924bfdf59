//! Structure-aware edits of generated site files
//!
//! There is no config grammar here. A small depth counter walks the lines of a
//! file that follows the shape documented in [`crate::synth`], which is enough
//! to find server blocks and their `location /` and to swap a block body.
//!
//! File edits are staged in a `.wizard-tmp` sibling, swapped in, and checked
//! with the edge server's full-tree syntax test. A rejected candidate is
//! reverted before any reload can pick it up.

use crate::fsops;
use crate::nginx::EdgeServer;
use crate::synth::{ConfigSynthesizer, PROXY_PASS_PREFIX, REDIRECT_DIRECTIVE};
use crate::{
    CertPaths, ConfigFile, Error, ListenSpec, LocationKind, ProxyConfig, Result, RunContext,
    ServerBlock,
};
use std::fs;
use std::path::Path;

const CERTBOT_MARKER: &str = "managed by Certbot";

/// Inclusive line range of a `{ ... }` block: opener line to closing-brace line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

/// How `insert_redirect` ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectOutcome {
    /// `location /` body replaced with the redirect
    Replaced,
    /// Fallback: redirect inserted after `server_name`
    Anchored,
    /// HTTP block already redirects; nothing written
    AlreadyPresent,
    /// Neither strategy verified; the operator must add the redirect by hand
    Degraded(String),
}

impl RedirectOutcome {
    pub fn is_installed(&self) -> bool {
        !matches!(self, RedirectOutcome::Degraded(_))
    }
}

/// How `restore_proxy_after_external_mutation` ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyRestoreOutcome {
    /// No `location /` carried the static sentinel
    Untouched,
    /// `locations` got the canonical proxy stanza back and `stripped` lines the
    /// tool had marked as its own were removed
    Restored { locations: usize, stripped: usize },
    /// The restored file failed validation and the pre-mutation backup was put back
    BackupReinstated(String),
}

/// Braces opened and closed on one line, ignoring quoted text and comments
fn brace_counts(line: &str) -> (usize, usize) {
    let mut opens = 0;
    let mut closes = 0;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in line.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (_, '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '#') => break,
            (None, '{') => opens += 1,
            (None, '}') => closes += 1,
            _ => {}
        }
    }
    (opens, closes)
}

/// Whether every brace in `text` is closed, in order
pub fn braces_balanced(text: &str) -> bool {
    let mut depth: usize = 0;
    for line in text.lines() {
        let (opens, closes) = brace_counts(line);
        depth += opens;
        if closes > depth {
            return false;
        }
        depth -= closes;
    }
    depth == 0
}

/// Code portion of a line: everything before an unquoted `#`, trimmed
fn code_of(line: &str) -> &str {
    let mut quote: Option<char> = None;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '#') => return line[..i].trim(),
            _ => {}
        }
    }
    line.trim()
}

/// Whether a line ends in `# managed by Certbot`
fn is_certbot_managed(line: &str) -> bool {
    let code = code_of(line);
    let rest = line.trim_start();
    rest.len() > code.len()
        && rest[code.len()..]
            .trim()
            .strip_prefix('#')
            .map_or(false, |comment| comment.trim() == CERTBOT_MARKER)
}

/// Drop the single-line directives certbot's nginx plugin tagged as its own.
/// Lines that open or close a block are left alone.
fn strip_certbot_lines(text: &str) -> (String, usize) {
    let mut kept = Vec::new();
    let mut stripped = 0;
    for line in text.lines() {
        if is_certbot_managed(line) && brace_counts(line) == (0, 0) {
            stripped += 1;
        } else {
            kept.push(line);
        }
    }
    let mut out = kept.join("\n");
    if text.ends_with('\n') {
        out.push('\n');
    }
    (out, stripped)
}

/// Spans of blocks opened at `target_depth` by a line accepted by `is_opener`.
/// `range` is a half-open line range entered at `base_depth`.
fn find_blocks<F>(
    lines: &[&str],
    range: (usize, usize),
    base_depth: usize,
    target_depth: usize,
    is_opener: F,
) -> Vec<Span>
where
    F: Fn(&str) -> bool,
{
    let mut spans = Vec::new();
    let mut depth = base_depth;
    let mut open: Option<(usize, usize)> = None;

    for (i, line) in lines.iter().enumerate().take(range.1).skip(range.0) {
        let (opens, closes) = brace_counts(line);
        let before = depth;
        depth = (depth + opens).saturating_sub(closes);

        match open {
            None if before == target_depth && opens > 0 && is_opener(code_of(line)) => {
                if depth <= target_depth {
                    spans.push(Span { start: i, end: i });
                } else {
                    open = Some((i, target_depth));
                }
            }
            Some((start, level)) if depth <= level => {
                spans.push(Span { start, end: i });
                open = None;
            }
            _ => {}
        }
    }
    spans
}

fn is_server_opener(code: &str) -> bool {
    let mut tokens = code.split_whitespace();
    matches!(tokens.next(), Some("server") | Some("server{"))
}

fn is_root_location_opener(code: &str) -> bool {
    let tokens: Vec<&str> = code.split_whitespace().collect();
    matches!(
        tokens.as_slice(),
        ["location", "/", "{", ..] | ["location", "/{", ..] | ["location", "=", "/", "{", ..]
    )
}

fn server_spans(lines: &[&str]) -> Vec<Span> {
    find_blocks(lines, (0, lines.len()), 0, 0, is_server_opener)
}

fn root_location_span(lines: &[&str], server: Span) -> Option<Span> {
    if server.start == server.end {
        return None;
    }
    find_blocks(lines, (server.start + 1, server.end), 1, 1, is_root_location_opener)
        .into_iter()
        .next()
}

/// Lines at depth 1 of a server block, outside any nested block
fn top_level_lines<'a>(lines: &[&'a str], server: Span) -> Vec<(usize, &'a str)> {
    let mut out = Vec::new();
    let mut depth = 1;
    for (i, line) in lines.iter().enumerate().take(server.end).skip(server.start + 1) {
        let (opens, closes) = brace_counts(line);
        if depth == 1 && opens == 0 && closes == 0 {
            out.push((i, *line));
        }
        depth = (depth + opens).saturating_sub(closes);
    }
    out
}

fn parse_listen(code: &str) -> Option<ListenSpec> {
    let rest = code.strip_prefix("listen")?.trim().trim_end_matches(';');
    let mut tokens = rest.split_whitespace();
    let addr = tokens.next()?;
    let port_str = addr.rsplit(':').next().unwrap_or(addr);
    let port = port_str.parse::<u16>().ok()?;
    let tls = tokens.any(|t| t == "ssl");
    Some(ListenSpec { port, tls })
}

fn swap_body(lines: &[&str], span: Span, body: &[String]) -> String {
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + body.len());
    out.extend(lines[..=span.start].iter().map(|l| l.to_string()));
    out.extend(body.iter().cloned());
    out.extend(lines[span.end..].iter().map(|l| l.to_string()));
    let mut text = out.join("\n");
    text.push('\n');
    text
}

/// Replace the body of the `location /` in the `block_index`-th server block.
///
/// Returns `None` if that block or its root location cannot be found.
pub fn replace_root_location(text: &str, block_index: usize, body: &[String]) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let server = *server_spans(&lines).get(block_index)?;
    let location = root_location_span(&lines, server)?;
    if location.start == location.end {
        return None;
    }
    Some(swap_body(&lines, location, body))
}

/// Insert `extra` right before the closing brace of the `block_index`-th server block
pub fn insert_before_block_end(
    text: &str,
    block_index: usize,
    extra: &[String],
) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let server = *server_spans(&lines).get(block_index)?;
    if server.start == server.end {
        return None;
    }
    let mut out: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    for (offset, line) in extra.iter().enumerate() {
        out.insert(server.end + offset, line.clone());
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    Some(joined)
}

pub struct ConfigMutator<'a> {
    edge: &'a dyn EdgeServer,
    static_sentinel: String,
}

impl<'a> ConfigMutator<'a> {
    pub fn new(edge: &'a dyn EdgeServer, static_sentinel: impl Into<String>) -> Self {
        Self {
            edge,
            static_sentinel: static_sentinel.into(),
        }
    }

    /// Shape-aware summary of a site file
    pub fn inspect(&self, text: &str) -> ConfigFile {
        let lines: Vec<&str> = text.lines().collect();
        let blocks = server_spans(&lines)
            .into_iter()
            .map(|server| self.summarize(&lines, server))
            .collect();
        ConfigFile { blocks }
    }

    fn summarize(&self, lines: &[&str], server: Span) -> ServerBlock {
        let top = top_level_lines(lines, server);
        let listens = top
            .iter()
            .filter_map(|(_, l)| parse_listen(code_of(l)))
            .collect();
        let server_name = top.iter().find_map(|(_, l)| {
            code_of(l)
                .strip_prefix("server_name")
                .and_then(|rest| rest.trim().trim_end_matches(';').split_whitespace().next())
                .map(|s| s.to_string())
        });

        let location = root_location_span(lines, server);
        let root_location = match location {
            None => LocationKind::Missing,
            Some(span) => self.classify(&lines[span.start..=span.end]),
        };

        let server_redirect = lines[server.start..=server.end]
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                let idx = server.start + i;
                location.map_or(true, |s| idx < s.start || idx > s.end)
            })
            .any(|(_, l)| is_https_redirect(code_of(l)));

        ServerBlock {
            listens,
            server_name,
            root_location,
            server_redirect,
            start_line: server.start,
            end_line: server.end,
        }
    }

    fn classify(&self, location: &[&str]) -> LocationKind {
        let codes: Vec<&str> = location.iter().map(|l| code_of(l)).collect();
        if let Some(target) = codes.iter().find_map(|c| c.strip_prefix(PROXY_PASS_PREFIX)) {
            return LocationKind::Proxy(target.trim_end_matches(';').trim().to_string());
        }
        if codes.iter().any(|c| is_https_redirect(c)) {
            return LocationKind::Redirect;
        }
        if codes.iter().any(|c| c.contains(self.static_sentinel.as_str())) {
            return LocationKind::StaticPlaceholder;
        }
        LocationKind::Other
    }

    /// Redirect plan 1: replace the HTTP block's `location /` body, verified
    pub fn redirect_by_replacement(&self, text: &str) -> Option<String> {
        let before = self.inspect(text);
        let index = before.blocks.iter().position(|b| !b.is_https())?;
        let candidate =
            replace_root_location(text, index, &ConfigSynthesizer::render_redirect_stanza())?;

        let after = self.inspect(&candidate);
        let verified = after.blocks.len() == before.blocks.len()
            && after
                .http_block()
                .map_or(false, |b| b.redirects() && !b.has_proxy())
            && after
                .https_block()
                .map_or(false, |b| b.has_proxy() && !b.redirects());
        verified.then_some(candidate)
    }

    /// Redirect plan 2: a server-level `return 301` right after `server_name`, verified
    pub fn redirect_by_anchor(&self, text: &str) -> Option<String> {
        let before = self.inspect(text);
        let http = before.http_block()?;
        let lines: Vec<&str> = text.lines().collect();
        let server = Span {
            start: http.start_line,
            end: http.end_line,
        };
        let (anchor, _) = top_level_lines(&lines, server)
            .into_iter()
            .find(|(_, l)| code_of(l).starts_with("server_name"))?;

        let mut out: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        out.insert(anchor + 1, format!("    {}", REDIRECT_DIRECTIVE));
        let mut candidate = out.join("\n");
        candidate.push('\n');

        let after = self.inspect(&candidate);
        let verified = after.blocks.len() == before.blocks.len()
            && after.http_block().map_or(false, |b| b.server_redirect)
            && after.https_block().map_or(false, |b| b.has_proxy());
        verified.then_some(candidate)
    }

    /// Swap `candidate` into `path` and keep it only if the syntax check passes
    pub fn apply_candidate(&self, ctx: &mut RunContext, path: &Path, candidate: &str) -> Result<()> {
        let original = fs::read_to_string(path)?;
        let staged = fsops::temp_path(path);
        fs::write(&staged, candidate)?;
        if let Err(e) = fs::rename(&staged, path) {
            fs::remove_file(&staged).ok();
            return Err(e.into());
        }

        if let Err(e) = self.edge.validate_syntax() {
            ctx.warn(format!(
                "Candidate for {} rejected by syntax check; reverting",
                path.display()
            ));
            fsops::write_atomic(path, &original)?;
            return Err(e);
        }
        Ok(())
    }

    /// Turn the HTTP block into an HTTP-to-HTTPS redirect
    pub fn insert_redirect(&self, ctx: &mut RunContext, path: &Path) -> Result<RedirectOutcome> {
        let text = fs::read_to_string(path)?;
        let current = self.inspect(&text);

        if !current.has_https() {
            return Ok(RedirectOutcome::Degraded(
                "no HTTPS server block to redirect to".to_string(),
            ));
        }
        if current.http_block().map_or(false, |b| b.redirects()) {
            ctx.info(format!("{} already redirects to HTTPS", path.display()));
            return Ok(RedirectOutcome::AlreadyPresent);
        }

        if let Some(candidate) = self.redirect_by_replacement(&text) {
            match self.apply_candidate(ctx, path, &candidate) {
                Ok(()) => return Ok(RedirectOutcome::Replaced),
                Err(Error::Syntax(details)) => {
                    ctx.warn(format!("Location replacement rejected: {}", details))
                }
                Err(e) => return Err(e),
            }
        } else {
            ctx.warn("Location replacement could not be verified; trying server_name anchor");
        }

        if let Some(candidate) = self.redirect_by_anchor(&text) {
            match self.apply_candidate(ctx, path, &candidate) {
                Ok(()) => return Ok(RedirectOutcome::Anchored),
                Err(Error::Syntax(details)) => {
                    return Ok(RedirectOutcome::Degraded(format!(
                        "anchored redirect rejected: {}",
                        details
                    )))
                }
                Err(e) => return Err(e),
            }
        }

        Ok(RedirectOutcome::Degraded(
            "could not locate the HTTP server block's location or server_name".to_string(),
        ))
    }

    /// Append the HTTPS block unless the file already has one. `Ok(false)` when skipped.
    pub fn append_https(
        &self,
        ctx: &mut RunContext,
        path: &Path,
        config: &ProxyConfig,
        certs: &CertPaths,
    ) -> Result<bool> {
        let text = fs::read_to_string(path)?;
        if self.inspect(&text).has_https() {
            ctx.info(format!("{} already has an HTTPS block", path.display()));
            return Ok(false);
        }
        let mut candidate = text;
        if !candidate.ends_with('\n') {
            candidate.push('\n');
        }
        candidate.push('\n');
        candidate.push_str(&ConfigSynthesizer::render_https_block(config, certs));
        self.apply_candidate(ctx, path, &candidate)?;
        Ok(true)
    }

    /// Undo a third-party rewrite of the site file.
    ///
    /// Puts the proxy stanza back into every `location /` that was turned into a
    /// static-file stanza and drops the TLS directives certbot added to the HTTP
    /// block, so the file is back to its HTTP-only shape. `backup` is the file as
    /// it was before the third-party tool ran.
    pub fn restore_proxy_after_external_mutation(
        &self,
        ctx: &mut RunContext,
        path: &Path,
        backup: &Path,
        config: &ProxyConfig,
    ) -> Result<ProxyRestoreOutcome> {
        let original = fs::read_to_string(path)?;
        let stanza = ConfigSynthesizer::render_proxy_stanza(config);

        let (mut candidate, stripped) = strip_certbot_lines(&original);
        let mut restored = 0;
        loop {
            let summary = self.inspect(&candidate);
            let Some(index) = summary
                .blocks
                .iter()
                .position(|b| b.root_location == LocationKind::StaticPlaceholder)
            else {
                break;
            };
            match replace_root_location(&candidate, index, &stanza) {
                Some(next) => {
                    candidate = next;
                    restored += 1;
                }
                None => break,
            }
        }

        if restored == 0 && stripped == 0 {
            return Ok(ProxyRestoreOutcome::Untouched);
        }

        match self.apply_candidate(ctx, path, &candidate) {
            Ok(()) => {
                ctx.success(format!(
                    "Restored proxy location in {} ({} block(s), {} plugin line(s) dropped)",
                    path.display(),
                    restored,
                    stripped
                ));
                Ok(ProxyRestoreOutcome::Restored {
                    locations: restored,
                    stripped,
                })
            }
            Err(Error::Syntax(details)) => {
                ctx.error(format!(
                    "Restored proxy config for {} failed validation; reinstating backup",
                    path.display()
                ));
                fsops::restore_file_backup(backup, path)?;
                Ok(ProxyRestoreOutcome::BackupReinstated(details))
            }
            Err(e) => Err(e),
        }
    }
}

fn is_https_redirect(code: &str) -> bool {
    (code.starts_with("return 301 https://") || code.starts_with("return 308 https://"))
        && code.ends_with(';')
}
