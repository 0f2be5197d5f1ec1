//! Privilege and resource helpers applied between fork and exec.
use std::{io, path::PathBuf};

use nix::unistd::{Gid, Group, Uid, User, chdir, setgid, setuid};

use crate::constants::USER_DEFAULT_PATH;

/// Resolved user/group switch for a service child. Built while loading the
/// descriptor so the child never touches the user database after fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPlan {
    /// Target UID.
    pub uid: u32,
    /// Target GID.
    pub gid: u32,
    /// Home directory of the target account.
    pub home: PathBuf,
    /// Account name, for `USER`/`LOGNAME`.
    pub username: String,
}

impl UserPlan {
    /// Looks up `user` (and optionally `group`) in the account database.
    pub fn resolve(user: &str, group: Option<&str>) -> io::Result<Self> {
        let account = User::from_name(user)
            .map_err(|err| io::Error::other(err.to_string()))?
            .ok_or_else(|| io::Error::other(format!("user '{user}' not found")))?;

        let gid = match group {
            Some(name) => Group::from_name(name)
                .map_err(|err| io::Error::other(err.to_string()))?
                .ok_or_else(|| io::Error::other(format!("group '{name}' not found")))?
                .gid
                .as_raw(),
            None => account.gid.as_raw(),
        };

        Ok(Self {
            uid: account.uid.as_raw(),
            gid,
            home: account.dir,
            username: account.name,
        })
    }

    /// Environment overrides matching the target account.
    pub fn env_overrides(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("HOME".to_string(), self.home.display().to_string()),
            ("USER".to_string(), self.username.clone()),
            ("LOGNAME".to_string(), self.username.clone()),
        ];
        if self.uid != 0 {
            env.push(("PATH".to_string(), USER_DEFAULT_PATH.to_string()));
        }
        env
    }

    /// Switches group then user and moves into the account home directory.
    ///
    /// # Safety
    /// Call this only between `fork` and `exec` in the child. Running it in
    /// the supervisor would drop the supervisor's own privileges.
    pub unsafe fn apply(&self) -> io::Result<()> {
        setgid(Gid::from_raw(self.gid)).map_err(io::Error::from)?;
        setuid(Uid::from_raw(self.uid)).map_err(io::Error::from)?;
        let _ = chdir(&self.home);
        Ok(())
    }
}

/// Resource limit overrides applied in the child before exec. Each value
/// sets both the soft and hard limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rlimits {
    /// `RLIMIT_NOFILE`, maximum open file descriptors.
    pub nofile: Option<u64>,
    /// `RLIMIT_NPROC`, maximum processes.
    pub nproc: Option<u64>,
    /// `RLIMIT_MEMLOCK`, maximum locked memory in bytes.
    pub memlock: Option<u64>,
}

impl Rlimits {
    /// True when no override is configured.
    pub fn is_empty(&self) -> bool {
        self.nofile.is_none() && self.nproc.is_none() && self.memlock.is_none()
    }

    /// Applies the configured overrides.
    pub fn apply(&self) -> io::Result<()> {
        if let Some(value) = self.nofile {
            set_rlimit(libc::RLIMIT_NOFILE as libc::c_int, value)?;
        }
        if let Some(value) = self.nproc {
            set_rlimit(libc::RLIMIT_NPROC as libc::c_int, value)?;
        }
        if let Some(value) = self.memlock {
            set_rlimit(libc::RLIMIT_MEMLOCK as libc::c_int, value)?;
        }
        Ok(())
    }
}

fn set_rlimit(which: libc::c_int, value: u64) -> io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    #[cfg(target_env = "gnu")]
    let res = unsafe { libc::setrlimit(which as libc::c_uint, &rlim) };
    #[cfg(not(target_env = "gnu"))]
    let res = unsafe { libc::setrlimit(which, &rlim) };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
