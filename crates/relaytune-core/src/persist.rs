//! Recognized OS config files relaytune writes so tuning choices survive
//! the tools that manage them (NetworkManager re-enabling wifi power save,
//! sysctl resets on reboot).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const NM_CONF_DIR: &str = "/etc/NetworkManager/conf.d";
pub const NM_POWERSAVE_FILE: &str = "relaytune-wifi-powersave.conf";
pub const SYSCTL_PERSIST_PATH: &str = "/etc/sysctl.d/99-relaytune.conf";

/// NetworkManager override disabling wifi power save (2 = disable).
/// Written only when the conf.d directory exists; a host without
/// NetworkManager gets `Ok(None)`, not an error.
pub fn write_powersave_override(conf_dir: &Path) -> anyhow::Result<Option<PathBuf>> {
    if !conf_dir.is_dir() {
        return Ok(None);
    }
    let path = conf_dir.join(NM_POWERSAVE_FILE);
    let contents = "[connection]\nwifi.powersave = 2\n";
    write_atomic(&path, contents, 0o644)?;
    Ok(Some(path))
}

/// Persist IP forwarding across reboots.
pub fn persist_ip_forward(path: &Path) -> anyhow::Result<()> {
    let contents =
        "# Managed by relaytune\nnet.ipv4.ip_forward=1\nnet.ipv4.conf.all.forwarding=1\n";
    write_atomic(path, contents, 0o644)
}

fn write_atomic(path: &Path, contents: &str, mode: u32) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("missing parent for {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;

    let tmp_path = temp_path_for(path);
    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("opening {}", tmp_path.display()))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing {}", tmp_path.display()))?;
    }

    #[cfg(unix)]
    {
        let perms = fs::Permissions::from_mode(mode);
        fs::set_permissions(&tmp_path, perms)
            .with_context(|| format!("setting permissions on {}", tmp_path.display()))?;
    }

    fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming {} -> {}", tmp_path.display(), path.display()))?;
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn powersave_override_written_when_dir_exists() {
        let dir = tempfile::tempdir().unwrap();
        let written = write_powersave_override(dir.path()).unwrap();

        let path = written.expect("override should be written");
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("[connection]\n"));
        assert!(contents.contains("wifi.powersave = 2"));
    }

    #[test]
    fn powersave_override_skipped_without_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("conf.d");

        assert!(write_powersave_override(&missing).unwrap().is_none());
        assert!(!missing.exists());
    }

    #[test]
    fn persist_ip_forward_writes_both_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("99-relaytune.conf");
        persist_ip_forward(&path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("net.ipv4.ip_forward=1"));
        assert!(contents.contains("net.ipv4.conf.all.forwarding=1"));
        assert!(!path.with_extension("conf.tmp").exists());
    }

    #[test]
    fn rewrites_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_powersave_override(dir.path()).unwrap().unwrap();
        let second = write_powersave_override(dir.path()).unwrap().unwrap();
        assert_eq!(first, second);
    }
}
