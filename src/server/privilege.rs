//! One-time confinement before any network input is read.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use nix::unistd::{Uid, User, chdir, chroot, geteuid, setgid, setgroups, setuid};
use tracing::{info, warn};

use crate::config::ServerConfig;

/// Moves into the served root and, when running as root, drops to an
/// unprivileged account (inside a chroot unless `--jail false`).
///
/// Returns the configuration with `root` rewritten to what the root looks
/// like from inside the confinement.
pub fn confine(config: ServerConfig) -> anyhow::Result<ServerConfig> {
    chdir(&config.root).with_context(|| format!("cannot change directory to {}", config.root.display()))?;

    if !geteuid().is_root() {
        warn!("not running as root; skipping chroot and identity switch");
        return Ok(config);
    }

    let user = resolve_user(config.user.as_deref(), &config.root)?;
    if user.uid.is_root() {
        bail!("refusing to serve as uid 0 (use --user or chown the root directory)");
    }

    let root = if config.jail {
        chroot(".").context("chroot failed")?;
        chdir("/").context("chdir into jail failed")?;
        info!(root = %config.root.display(), "confined to root directory");
        PathBuf::from("/")
    } else {
        config.root.clone()
    };

    switch_identity(&user)?;
    info!(user = %user.name, uid = user.uid.as_raw(), gid = user.gid.as_raw(), "dropped privileges");

    Ok(config.with_root(root))
}

fn resolve_user(name: Option<&str>, root: &Path) -> anyhow::Result<User> {
    match name {
        Some(name) => User::from_name(name)
            .with_context(|| format!("cannot look up user {name}"))?
            .with_context(|| format!("no such user: {name}")),
        None => {
            let owner = std::fs::metadata(root)
                .with_context(|| format!("cannot stat {}", root.display()))?
                .uid();
            User::from_uid(Uid::from_raw(owner))
                .with_context(|| format!("cannot look up uid {owner}"))?
                .with_context(|| format!("root directory owner uid {owner} has no account"))
        }
    }
}

fn switch_identity(user: &User) -> anyhow::Result<()> {
    setgroups(&[user.gid]).context("setgroups failed")?;
    setgid(user.gid).with_context(|| format!("setgid({}) failed", user.gid))?;
    setuid(user.uid).with_context(|| format!("setuid({}) failed", user.uid))?;

    if setuid(Uid::from_raw(0)).is_ok() {
        bail!("privileges could be regained after dropping them");
    }
    Ok(())
}
