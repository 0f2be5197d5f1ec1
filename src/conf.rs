//! Service line loader.
//!
//! The core consumes already-parsed descriptors; this module is the loader
//! that produces them from `*.conf` files. One directive per line:
//!
//! ```text
//! service [2345] <net/eth0/up,!cond> @user:group log:null name:foo :2 /sbin/foo -i eth0 -- Description
//! task    [S]    /sbin/prepare -- One-shot, runs in parallel
//! run     [S]    /sbin/fsck -- One-shot, blocks until done
//! ```
//!
//! Options may appear in any order before the absolute command path:
//! `[runlevels]`, `<conditions>`, `:id`, `@user[:group]`, `log[:sink]`,
//! `pid:/path`, `name:ident`, `nofile:N`, `manual:yes`, `sighup:yes`.
//! Re-registering an existing `(command, id)` pair updates the descriptor
//! in place; a changed source line marks it dirty for the reload machinery.

use std::{
    fs,
    path::{Path, PathBuf},
};

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    cond::CondExpr,
    constants::DEFAULT_RUNLEVELS,
    ctx::InitCtx,
    error::ConfError,
    logs::parse_log_option,
    privilege::{Rlimits, UserPlan},
    svc::{Dirty, Svc, SvcId, SvcKind},
};

/// A descriptor parsed from one line, before table registration.
#[derive(Debug, Clone)]
pub struct ParsedSvc {
    /// The descriptor itself.
    pub svc: Svc,
    /// Start only on explicit request.
    pub manual: bool,
}

/// Parses a `[runlevels]` bracket into a bitmask. Accepts digits, ranges
/// and `S` for bootstrap, e.g. `[S]`, `[2345]`, `[2-5]`.
pub fn parse_runlevels(raw: &str) -> Result<u16, ConfError> {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"^\[[0-9Ss]([0-9Ss-]*)\]$").expect("static regex"));

    if !pattern.is_match(raw) {
        return Err(ConfError::BadRunlevels(raw.to_string()));
    }

    let inner: Vec<char> = raw[1..raw.len() - 1].chars().collect();
    let mut mask = 0u16;
    let mut i = 0;
    while i < inner.len() {
        let bit = |c: char| -> u16 {
            match c {
                'S' | 's' => 0,
                d => d as u16 - '0' as u16,
            }
        };

        if i + 2 < inner.len() && inner[i + 1] == '-' {
            let (lo, hi) = (bit(inner[i]), bit(inner[i + 2]));
            if lo > hi {
                return Err(ConfError::BadRunlevels(raw.to_string()));
            }
            for level in lo..=hi {
                mask |= 1 << level;
            }
            i += 3;
        } else if inner[i] == '-' {
            return Err(ConfError::BadRunlevels(raw.to_string()));
        } else {
            mask |= 1 << bit(inner[i]);
            i += 1;
        }
    }
    Ok(mask)
}

/// Parses one directive line into a descriptor.
pub fn parse_line(kind: SvcKind, line: &str) -> Result<ParsedSvc, ConfError> {
    let (spec, desc) = match line.split_once("-- ") {
        Some((head, tail)) => (head.trim(), tail.trim()),
        None => (line.trim_end_matches("--").trim(), ""),
    };

    let mut runlevels = DEFAULT_RUNLEVELS;
    let mut cond = CondExpr::default();
    let mut id = String::new();
    let mut user: Option<String> = None;
    let mut group: Option<String> = None;
    let mut log = None;
    let mut pidfile = None;
    let mut name = None;
    let mut rlimits = Rlimits::default();
    let mut manual = false;
    let mut sighup = false;
    let mut cmd: Option<String> = None;
    let mut args: Vec<String> = Vec::new();

    for token in spec.split_whitespace() {
        if cmd.is_some() {
            args.push(token.to_string());
            continue;
        }

        if token.starts_with('[') {
            runlevels = parse_runlevels(token)?;
        } else if let Some(body) = token.strip_prefix('<') {
            cond = CondExpr::parse(body.trim_end_matches('>'));
        } else if let Some(body) = token.strip_prefix(':') {
            id = body.to_string();
        } else if let Some(body) = token.strip_prefix('@') {
            match body.split_once(':') {
                Some((u, g)) => {
                    user = Some(u.to_string());
                    group = Some(g.to_string());
                }
                None => user = Some(body.to_string()),
            }
        } else if token == "log" || token.starts_with("log:") {
            log = Some(parse_log_option(token));
        } else if let Some(body) = token.strip_prefix("pid:") {
            pidfile = Some(PathBuf::from(body));
        } else if let Some(body) = token.strip_prefix("name:") {
            name = Some(body.to_string());
        } else if let Some(body) = token.strip_prefix("nofile:") {
            rlimits.nofile = body.parse::<u64>().ok();
        } else if let Some(body) = token.strip_prefix("nproc:") {
            rlimits.nproc = body.parse::<u64>().ok();
        } else if let Some(body) = token.strip_prefix("memlock:") {
            rlimits.memlock = body.parse::<u64>().ok();
        } else if token.eq_ignore_ascii_case("manual:yes") {
            manual = true;
        } else if token.eq_ignore_ascii_case("sighup:yes") {
            sighup = true;
        } else if token.starts_with('/') {
            cmd = Some(token.to_string());
        } else {
            return Err(ConfError::Incomplete(line.to_string()));
        }
    }

    let Some(cmd) = cmd else {
        return Err(ConfError::Incomplete(line.to_string()));
    };
    if !cmd.starts_with('/') {
        return Err(ConfError::RelativeCommand(cmd));
    }

    let mut svc = Svc::new(&cmd, &id, kind);
    svc.args = std::iter::once(cmd.clone()).chain(args).collect();
    svc.runlevels = runlevels;
    svc.cond = cond;
    svc.sighup = sighup;
    svc.pidfile = pidfile;
    svc.desc = desc.to_string();
    if let Some(name) = name {
        svc.name = name;
    }
    if let Some(log) = log {
        svc.log = log;
    }
    svc.rlimits = rlimits;

    if let Some(user_name) = user {
        let account = match &group {
            Some(group_name) => format!("{user_name}:{group_name}"),
            None => user_name.clone(),
        };
        let plan = UserPlan::resolve(&user_name, group.as_deref())
            .map_err(|_| ConfError::UnknownAccount(account))?;
        svc.user = Some(plan);
    }

    Ok(ParsedSvc { svc, manual })
}

fn line_hash(line: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(line.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Registers (or re-registers) one directive line. Returns the handle, or
/// `None` when the line is skipped because bootstrap is over.
pub fn register(
    ctx: &mut InitCtx,
    kind: SvcKind,
    line: &str,
) -> Result<Option<SvcId>, ConfError> {
    let parsed = parse_line(kind, line)?;
    let hash = line_hash(line);

    // Bootstrap-only lines are stale once the system has left runlevel S.
    if ctx.sm.runlevel() > 0 && (parsed.svc.runlevels & !1) == 0 {
        debug!("skipping {}, bootstrap is completed", parsed.svc.cmd.display());
        return Ok(None);
    }

    let id = match ctx.table.find(&parsed.svc.cmd, &parsed.svc.id) {
        Some(id) => {
            let entry = ctx.table.get_mut(id).expect("just found");
            let changed = entry.conf_hash != hash;
            entry.args = parsed.svc.args;
            entry.name = parsed.svc.name;
            entry.desc = parsed.svc.desc;
            entry.kind = kind;
            entry.runlevels = parsed.svc.runlevels;
            entry.cond = parsed.svc.cond;
            entry.sighup = parsed.svc.sighup;
            entry.pidfile = parsed.svc.pidfile;
            entry.log = parsed.svc.log;
            entry.user = parsed.svc.user;
            entry.rlimits = parsed.svc.rlimits;
            entry.conf_hash = hash;
            entry.dirty = if changed { Dirty::Changed } else { Dirty::Clean };
            id
        }
        None => {
            let mut svc = parsed.svc;
            svc.conf_hash = hash;
            svc.manual = parsed.manual && kind == SvcKind::Service;
            debug!("registering {} id {}", svc.cmd.display(), svc.id);
            ctx.table.insert(svc)
        }
    };

    ctx.schedule_step();
    Ok(Some(id))
}

fn load_file(ctx: &mut InitCtx, path: &Path) {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!("cannot read {:?}: {err}", path);
            return;
        }
    };

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (directive, rest) = match line.split_once(char::is_whitespace) {
            Some(pair) => pair,
            None => (line, ""),
        };

        let kind = match directive {
            "service" => SvcKind::Service,
            "task" => SvcKind::Task,
            "run" => SvcKind::Run,
            other => {
                debug!("{:?}: ignoring unknown directive '{other}'", path);
                continue;
            }
        };

        if let Err(err) = register(ctx, kind, rest) {
            // A malformed line costs that descriptor, never the load.
            warn!("{:?}: {err}", path);
        }
    }
}

/// Loads every `*.conf` file in `dir`, in name order.
pub fn load_dir(ctx: &mut InitCtx, dir: &Path) {
    let mut files: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "conf"))
            .collect(),
        Err(err) => {
            warn!("cannot read config dir {:?}: {err}", dir);
            return;
        }
    };
    files.sort();

    for file in files {
        debug!("loading {:?}", file);
        load_file(ctx, &file);
    }
}

/// Re-reads the configuration, diffing against the live table: descriptors
/// found again become clean or dirty, the rest are marked for removal once
/// the reload settles.
pub fn reload_dir(ctx: &mut InitCtx, dir: &Path) {
    for id in ctx.table.ids() {
        if let Some(svc) = ctx.table.get_mut(id)
            && !svc.protected
        {
            svc.dirty = Dirty::Removal;
        }
    }
    load_dir(ctx, dir);
}
