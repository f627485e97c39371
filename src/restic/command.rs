//! Restic command construction
//!
//! Builds the argv for every restic invocation Caravel makes. Commands are
//! data until executed, so tests can assert on the exact argv and the
//! agent and server share one builder.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One restic invocation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Command {
    /// Binary to run; defaults to `/restic`
    pub base_name: Option<String>,
    /// Subcommand, e.g. `backup`
    pub command: String,
    /// Repository URL prefix, e.g. `s3:s3.amazonaws.com/bucket/restic`
    pub repo_prefix: String,
    /// Repository name under the prefix (the namespace)
    pub repo: String,
    /// File holding the repository password
    pub password_file: Option<PathBuf>,
    /// Positional arguments
    pub args: Vec<String>,
    /// Trailing flags
    pub extra_flags: Vec<String>,
}

impl Command {
    /// The full argv, binary first
    pub fn string_slice(&self) -> Vec<String> {
        let mut res = Vec::with_capacity(4 + self.args.len() + self.extra_flags.len());
        res.push(
            self.base_name
                .clone()
                .unwrap_or_else(|| "/restic".to_string()),
        );
        res.push(self.command.clone());
        res.push(repo_flag(&self.repo_prefix, &self.repo));
        if let Some(file) = &self.password_file {
            res.push(password_flag(file));
        }
        res.extend(self.args.iter().cloned());
        res.extend(self.extra_flags.iter().cloned());
        res
    }

    /// A runnable process for this command
    pub fn tokio_command(&self) -> tokio::process::Command {
        let parts = self.string_slice();
        let mut cmd = tokio::process::Command::new(&parts[0]);
        cmd.args(&parts[1..]);
        cmd
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.string_slice().join(" "))
    }
}

fn repo_flag(prefix: &str, repo: &str) -> String {
    format!("--repo={prefix}/{repo}")
}

fn password_flag(file: &Path) -> String {
    format!("--password-file={}", file.display())
}

/// `restic init` for a new repository
pub fn init_command(repo_prefix: &str, repo: &str, password_file: &Path) -> Command {
    Command {
        command: "init".to_string(),
        repo_prefix: repo_prefix.to_string(),
        repo: repo.to_string(),
        password_file: Some(password_file.to_path_buf()),
        ..Default::default()
    }
}

/// `restic check` verifying repository integrity
pub fn check_command(repo_prefix: &str, repo: &str, password_file: &Path) -> Command {
    Command {
        command: "check".to_string(),
        repo_prefix: repo_prefix.to_string(),
        repo: repo.to_string(),
        password_file: Some(password_file.to_path_buf()),
        ..Default::default()
    }
}

/// `restic prune` dropping unreferenced data
pub fn prune_command(repo_prefix: &str, repo: &str, password_file: &Path) -> Command {
    Command {
        command: "prune".to_string(),
        repo_prefix: repo_prefix.to_string(),
        repo: repo.to_string(),
        password_file: Some(password_file.to_path_buf()),
        ..Default::default()
    }
}

/// `restic backup` of one path, tagged for later lookup
pub fn backup_command(
    repo_prefix: &str,
    repo: &str,
    password_file: &Path,
    path: &str,
    tags: &BTreeMap<String, String>,
) -> Command {
    Command {
        command: "backup".to_string(),
        repo_prefix: repo_prefix.to_string(),
        repo: repo.to_string(),
        password_file: Some(password_file.to_path_buf()),
        args: vec![path.to_string()],
        extra_flags: backup_tag_flags(tags),
        ..Default::default()
    }
}

fn backup_tag_flags(tags: &BTreeMap<String, String>) -> Vec<String> {
    tags.iter().map(|(k, v)| format!("--tag={k}={v}")).collect()
}

/// `restic restore` of a snapshot into the pod's restore staging dir
pub fn restore_command(
    repo_prefix: &str,
    repo: &str,
    password_file: &Path,
    pod_uid: &str,
    snapshot_id: &str,
) -> Command {
    Command {
        command: "restore".to_string(),
        repo_prefix: repo_prefix.to_string(),
        repo: repo.to_string(),
        password_file: Some(password_file.to_path_buf()),
        args: vec![snapshot_id.to_string()],
        extra_flags: vec![format!("--target=/restores/{pod_uid}")],
        ..Default::default()
    }
}

/// `restic snapshots --json --last` filtered by tags
pub fn snapshots_command(
    repo_prefix: &str,
    repo: &str,
    password_file: &Path,
    tags: &BTreeMap<String, String>,
) -> Command {
    Command {
        command: "snapshots".to_string(),
        repo_prefix: repo_prefix.to_string(),
        repo: repo.to_string(),
        password_file: Some(password_file.to_path_buf()),
        extra_flags: vec![
            "--json".to_string(),
            "--last".to_string(),
            snapshot_tag_flag(tags),
        ],
        ..Default::default()
    }
}

fn snapshot_tag_flag(tags: &BTreeMap<String, String>) -> String {
    let filters: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("--tag={}", filters.join(","))
}

/// `restic forget` removing a snapshot from the repository
pub fn forget_command(
    repo_prefix: &str,
    repo: &str,
    password_file: &Path,
    snapshot_id: &str,
) -> Command {
    Command {
        command: "forget".to_string(),
        repo_prefix: repo_prefix.to_string(),
        repo: repo.to_string(),
        password_file: Some(password_file.to_path_buf()),
        args: vec![snapshot_id.to_string()],
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn argv_order_is_stable() {
        let cmd = backup_command(
            "s3:s3.amazonaws.com/bkt/restic",
            "nginx-example",
            Path::new("/tmp/creds"),
            "/host_pods/uid/volumes/data",
            &tags(&[("backup", "b1"), ("volume", "data")]),
        );
        assert_eq!(
            cmd.string_slice(),
            vec![
                "/restic",
                "backup",
                "--repo=s3:s3.amazonaws.com/bkt/restic/nginx-example",
                "--password-file=/tmp/creds",
                "/host_pods/uid/volumes/data",
                "--tag=backup=b1",
                "--tag=volume=data",
            ]
        );
    }

    #[test]
    fn base_name_overrides_default_binary() {
        let mut cmd = init_command("gs:bkt:/", "ns", Path::new("/tmp/p"));
        cmd.base_name = Some("/usr/bin/restic".to_string());
        assert_eq!(cmd.string_slice()[0], "/usr/bin/restic");
    }

    #[test]
    fn restore_targets_the_pod_staging_dir() {
        let cmd = restore_command("s3:x/bkt", "ns", Path::new("/tmp/p"), "pod-uid-1", "abc123");
        let argv = cmd.string_slice();
        assert!(argv.contains(&"abc123".to_string()));
        assert!(argv.contains(&"--target=/restores/pod-uid-1".to_string()));
    }

    #[test]
    fn snapshots_filter_joins_tags_into_one_flag() {
        let cmd = snapshots_command(
            "s3:x/bkt",
            "ns",
            Path::new("/tmp/p"),
            &tags(&[("backup-uid", "u1"), ("pod-uid", "p1"), ("volume", "v")]),
        );
        let argv = cmd.string_slice();
        assert!(argv.contains(&"--json".to_string()));
        assert!(argv.contains(&"--last".to_string()));
        assert!(argv.contains(&"--tag=backup-uid=u1,pod-uid=p1,volume=v".to_string()));
    }

    #[test]
    fn display_joins_with_spaces() {
        let cmd = check_command("s3:x/bkt", "ns", Path::new("/tmp/p"));
        assert_eq!(
            cmd.to_string(),
            "/restic check --repo=s3:x/bkt/ns --password-file=/tmp/p"
        );
    }
}
