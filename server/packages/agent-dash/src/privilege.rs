//! Resolution of the unprivileged identity agent processes are demoted to.
//!
//! When the server runs as root, the agent CLI and interactive terminals are
//! started as a designated user instead. If that user does not exist, or the
//! server is not privileged, children run as the current identity.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunAsUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl RunAsUser {
    /// Identity to demote to, if demotion applies to this process.
    pub fn resolve(name: Option<&str>) -> Option<Self> {
        let name = name.map(str::trim).filter(|name| !name.is_empty())?;
        if !running_privileged() {
            return None;
        }
        let user = Self::lookup(name);
        if user.is_none() {
            tracing::warn!(user = %name, "run-as user not found; keeping current identity");
        }
        user
    }

    #[cfg(unix)]
    pub fn lookup(name: &str) -> Option<Self> {
        match nix::unistd::User::from_name(name) {
            Ok(Some(user)) => Some(Self {
                name: user.name,
                uid: user.uid.as_raw(),
                gid: user.gid.as_raw(),
                home: user.dir,
            }),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(user = %name, error = %err, "passwd lookup failed");
                None
            }
        }
    }

    #[cfg(not(unix))]
    pub fn lookup(_name: &str) -> Option<Self> {
        None
    }

    /// Environment overrides matching the demoted identity.
    pub fn env(&self) -> Vec<(String, String)> {
        let home = self.home.to_string_lossy().into_owned();
        vec![
            ("HOME".to_string(), home),
            ("USER".to_string(), self.name.clone()),
            ("LOGNAME".to_string(), self.name.clone()),
        ]
    }
}

#[cfg(unix)]
pub fn running_privileged() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
pub fn running_privileged() -> bool {
    false
}
