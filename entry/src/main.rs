use clap::Parser;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

const DEFAULT_USER: &str = "poremaps";
const DEFAULT_GROUP: &str = "poremaps";
const DEFAULT_SHARED_DIR: &str = "/poremaps/shared";
const ENV_HOST_UID: &str = "HOST_UID";
const ENV_HOST_GID: &str = "HOST_GID";

#[derive(Parser, Debug)]
#[command(name = "poremaps-entry", version, about = "Poremaps container entrypoint")]
struct Cli {
    #[arg(long, default_value = DEFAULT_USER)]
    user: String,
    #[arg(long, default_value = DEFAULT_GROUP)]
    group: String,
    #[arg(long, default_value = DEFAULT_SHARED_DIR)]
    shared_dir: PathBuf,
    /// Command to hand the session to after reconciliation, given after `--`.
    #[arg(last = true)]
    command: Vec<String>,
}

#[derive(Debug, Error)]
enum EntryError {
    #[error("identity error: {0}")]
    Identity(String),
    #[error("account error: {0}")]
    Account(String),
    #[error("process error: {0}")]
    Process(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IdentityRequest {
    uid: Option<u32>,
    gid: Option<u32>,
}

impl IdentityRequest {
    fn from_env() -> Result<Self, EntryError> {
        Ok(Self {
            uid: parse_id(ENV_HOST_UID, env::var(ENV_HOST_UID).ok().as_deref())?,
            gid: parse_id(ENV_HOST_GID, env::var(ENV_HOST_GID).ok().as_deref())?,
        })
    }

    fn complete(&self) -> Option<(u32, u32)> {
        match (self.uid, self.gid) {
            (Some(uid), Some(gid)) => Some((uid, gid)),
            _ => None,
        }
    }
}

fn parse_id(name: &str, value: Option<&str>) -> Result<Option<u32>, EntryError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed.parse::<u32>().map(Some).map_err(|_| {
        EntryError::Identity(format!(
            "{name} must be a non-negative integer, got {trimmed:?}"
        ))
    })
}

#[derive(Debug, Clone)]
struct Account {
    user: String,
    group: String,
    shared_dir: PathBuf,
}

#[derive(Debug, Clone)]
struct CommandOutput {
    status_code: i32,
    stderr: Vec<u8>,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.status_code == 0
    }
}

trait AccountAdmin {
    fn set_user_id(&self, user: &str, uid: u32) -> Result<CommandOutput, io::Error>;
    fn set_group_id(&self, group: &str, gid: u32) -> Result<CommandOutput, io::Error>;
}

struct SystemAccountAdmin;

impl AccountAdmin for SystemAccountAdmin {
    fn set_user_id(&self, user: &str, uid: u32) -> Result<CommandOutput, io::Error> {
        run_admin_tool("usermod", &["-u".to_string(), uid.to_string(), user.to_string()])
    }

    fn set_group_id(&self, group: &str, gid: u32) -> Result<CommandOutput, io::Error> {
        run_admin_tool("groupmod", &["-g".to_string(), gid.to_string(), group.to_string()])
    }
}

fn run_admin_tool(program: &str, args: &[String]) -> Result<CommandOutput, io::Error> {
    let output = Command::new(program).args(args).output()?;
    let status_code = output
        .status
        .code()
        .unwrap_or(if output.status.success() { 0 } else { 1 });
    Ok(CommandOutput {
        status_code,
        stderr: output.stderr,
    })
}

#[derive(Debug, Default)]
struct ReconcileOutcome {
    uid_set: Option<u32>,
    gid_set: Option<u32>,
    reowned: Option<usize>,
    warnings: Vec<String>,
}

fn reconcile<A: AccountAdmin>(
    request: &IdentityRequest,
    account: &Account,
    admin: &A,
) -> Result<ReconcileOutcome, EntryError> {
    let mut outcome = ReconcileOutcome::default();

    if let Some(uid) = request.uid {
        println!("changing uid of user {} to {uid}", account.user);
        let output = admin
            .set_user_id(&account.user, uid)
            .map_err(|err| EntryError::Account(format!("failed to run usermod: {err}")))?;
        if !output.success() {
            return Err(EntryError::Account(admin_failure(
                "usermod", &account.user, uid, &output,
            )));
        }
        outcome.uid_set = Some(uid);
    }

    if let Some(gid) = request.gid {
        println!("changing gid of group {} to {gid}", account.group);
        let output = admin
            .set_group_id(&account.group, gid)
            .map_err(|err| EntryError::Account(format!("failed to run groupmod: {err}")))?;
        if !output.success() {
            return Err(EntryError::Account(admin_failure(
                "groupmod", &account.group, gid, &output,
            )));
        }
        outcome.gid_set = Some(gid);
    }

    match request.complete() {
        Some((uid, gid)) => {
            println!(
                "re-owning contents of {} to {uid}:{gid}",
                account.shared_dir.display()
            );
            let (count, warnings) = reown_tree(&account.shared_dir, uid, gid);
            if count == 0 && warnings.is_empty() {
                println!(
                    "shared directory {} is empty; nothing to re-own",
                    account.shared_dir.display()
                );
            }
            outcome.reowned = Some(count);
            outcome.warnings = warnings;
        }
        None => {
            println!(
                "{ENV_HOST_UID} and {ENV_HOST_GID} are not both set; skipping ownership transfer of {}",
                account.shared_dir.display()
            );
        }
    }

    Ok(outcome)
}

fn admin_failure(tool: &str, subject: &str, id: u32, output: &CommandOutput) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let mut message = format!(
        "{tool} failed with status {} while setting id {id} for {subject}",
        output.status_code
    );
    if !stderr.is_empty() {
        message = format!("{message}: {stderr}");
    }
    message
}

// Re-owns every entry below `root`, leaving `root` itself untouched. The
// host-side mount point keeps whatever owner the host gave it.
fn reown_tree(root: &Path, uid: u32, gid: u32) -> (usize, Vec<String>) {
    let mut count = 0;
    let mut warnings = Vec::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) => {
            warnings.push(format!("cannot list {}: {err}", root.display()));
            return (0, warnings);
        }
    };
    for entry in entries {
        match entry {
            Ok(entry) => count += reown_entry(&entry.path(), uid, gid, &mut warnings),
            Err(err) => warnings.push(format!("cannot read entry under {}: {err}", root.display())),
        }
    }
    (count, warnings)
}

fn reown_entry(path: &Path, uid: u32, gid: u32, warnings: &mut Vec<String>) -> usize {
    let mut count = 0;
    match chown_entry(path, uid, gid) {
        Ok(()) => count += 1,
        Err(err) => warnings.push(format!("cannot re-own {}: {err}", path.display())),
    }
    // Symlinks are re-owned in place, never followed: a link pointing outside
    // the shared mount must not drag its target into the transfer.
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return count;
    };
    if !metadata.is_dir() {
        return count;
    }
    match fs::read_dir(path) {
        Ok(entries) => {
            for entry in entries {
                match entry {
                    Ok(entry) => count += reown_entry(&entry.path(), uid, gid, warnings),
                    Err(err) => {
                        warnings.push(format!("cannot read entry under {}: {err}", path.display()))
                    }
                }
            }
        }
        Err(err) => warnings.push(format!("cannot list {}: {err}", path.display())),
    }
    count
}

#[cfg(unix)]
fn chown_entry(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))
}

#[cfg(not(unix))]
fn chown_entry(_path: &Path, _uid: u32, _gid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "ownership changes require a unix host",
    ))
}

fn hand_off(command: &[String]) -> Result<(), EntryError> {
    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..]);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = cmd.exec();
        Err(EntryError::Process(format!(
            "failed to exec {}: {err}",
            command[0]
        )))
    }
    #[cfg(not(unix))]
    {
        let status = cmd.status().map_err(|err| {
            EntryError::Process(format!("failed to run {}: {err}", command[0]))
        })?;
        std::process::exit(status.code().unwrap_or(1));
    }
}

fn run(cli: &Cli) -> Result<(), EntryError> {
    let account = Account {
        user: cli.user.clone(),
        group: cli.group.clone(),
        shared_dir: cli.shared_dir.clone(),
    };
    let request = IdentityRequest::from_env()?;
    let outcome = reconcile(&request, &account, &SystemAccountAdmin)?;
    for warning in &outcome.warnings {
        eprintln!("warning: {warning}");
    }
    match (outcome.uid_set, outcome.gid_set) {
        (Some(uid), Some(gid)) => println!("service account {} now runs as {uid}:{gid}", account.user),
        (Some(uid), None) => println!("service account {} uid is now {uid}", account.user),
        (None, Some(gid)) => println!("service account {} gid is now {gid}", account.user),
        (None, None) => {}
    }
    if let Some(count) = outcome.reowned {
        println!(
            "re-owned {count} entries under {}",
            account.shared_dir.display()
        );
    }
    if cli.command.is_empty() {
        return Ok(());
    }
    hand_off(&cli.command)
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum AccountCall {
        User(String, u32),
        Group(String, u32),
    }

    #[derive(Default)]
    struct MockAccountAdmin {
        calls: RefCell<Vec<AccountCall>>,
        fail_user: bool,
        fail_group: bool,
    }

    impl MockAccountAdmin {
        fn calls(&self) -> Vec<AccountCall> {
            self.calls.borrow().clone()
        }
    }

    impl AccountAdmin for MockAccountAdmin {
        fn set_user_id(&self, user: &str, uid: u32) -> Result<CommandOutput, io::Error> {
            self.calls
                .borrow_mut()
                .push(AccountCall::User(user.to_string(), uid));
            if self.fail_user {
                return Ok(CommandOutput {
                    status_code: 4,
                    stderr: b"usermod: UID '1000' already exists".to_vec(),
                });
            }
            Ok(CommandOutput {
                status_code: 0,
                stderr: Vec::new(),
            })
        }

        fn set_group_id(&self, group: &str, gid: u32) -> Result<CommandOutput, io::Error> {
            self.calls
                .borrow_mut()
                .push(AccountCall::Group(group.to_string(), gid));
            if self.fail_group {
                return Ok(CommandOutput {
                    status_code: 4,
                    stderr: b"groupmod: GID '1000' already exists".to_vec(),
                });
            }
            Ok(CommandOutput {
                status_code: 0,
                stderr: Vec::new(),
            })
        }
    }

    fn test_account(shared_dir: &Path) -> Account {
        Account {
            user: DEFAULT_USER.to_string(),
            group: DEFAULT_GROUP.to_string(),
            shared_dir: shared_dir.to_path_buf(),
        }
    }

    fn current_id(flag: &str) -> u32 {
        let output = Command::new("id").arg(flag).output().expect("id");
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .expect("numeric id")
    }

    #[test]
    fn parse_id_accepts_plain_integers() {
        assert_eq!(parse_id(ENV_HOST_UID, Some("1000")).unwrap(), Some(1000));
        assert_eq!(parse_id(ENV_HOST_UID, Some(" 0 ")).unwrap(), Some(0));
    }

    #[test]
    fn parse_id_treats_missing_and_empty_as_absent() {
        assert_eq!(parse_id(ENV_HOST_UID, None).unwrap(), None);
        assert_eq!(parse_id(ENV_HOST_UID, Some("")).unwrap(), None);
        assert_eq!(parse_id(ENV_HOST_UID, Some("   ")).unwrap(), None);
    }

    #[test]
    fn parse_id_rejects_garbage() {
        let err = parse_id(ENV_HOST_UID, Some("abc")).unwrap_err();
        assert!(err.to_string().contains(ENV_HOST_UID));
        assert!(parse_id(ENV_HOST_GID, Some("-1")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn both_ids_rewrite_account_and_reown_tree() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("velocity.dat"), b"data").unwrap();
        fs::create_dir(dir.path().join("results")).unwrap();
        fs::write(dir.path().join("results").join("pressure.dat"), b"data").unwrap();

        let uid = current_id("-u");
        let gid = current_id("-g");
        let admin = MockAccountAdmin::default();
        let request = IdentityRequest {
            uid: Some(uid),
            gid: Some(gid),
        };
        let outcome = reconcile(&request, &test_account(dir.path()), &admin).unwrap();

        assert_eq!(
            admin.calls(),
            vec![
                AccountCall::User(DEFAULT_USER.to_string(), uid),
                AccountCall::Group(DEFAULT_GROUP.to_string(), gid),
            ]
        );
        assert_eq!(outcome.uid_set, Some(uid));
        assert_eq!(outcome.gid_set, Some(gid));
        assert_eq!(outcome.reowned, Some(3));
        assert!(outcome.warnings.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn reconcile_is_idempotent() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("grid.raw"), b"data").unwrap();

        let request = IdentityRequest {
            uid: Some(current_id("-u")),
            gid: Some(current_id("-g")),
        };
        let admin = MockAccountAdmin::default();
        let first = reconcile(&request, &test_account(dir.path()), &admin).unwrap();
        let second = reconcile(&request, &test_account(dir.path()), &admin).unwrap();
        assert_eq!(first.reowned, second.reowned);
        assert!(second.warnings.is_empty());
    }

    #[test]
    fn uid_only_skips_ownership_transfer() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("grid.raw"), b"data").unwrap();

        let admin = MockAccountAdmin::default();
        let request = IdentityRequest {
            uid: Some(1234),
            gid: None,
        };
        let outcome = reconcile(&request, &test_account(dir.path()), &admin).unwrap();

        assert_eq!(admin.calls(), vec![AccountCall::User(DEFAULT_USER.to_string(), 1234)]);
        assert_eq!(outcome.uid_set, Some(1234));
        assert_eq!(outcome.gid_set, None);
        assert_eq!(outcome.reowned, None);
    }

    #[test]
    fn gid_only_skips_ownership_transfer() {
        let dir = tempdir().unwrap();
        let admin = MockAccountAdmin::default();
        let request = IdentityRequest {
            uid: None,
            gid: Some(1234),
        };
        let outcome = reconcile(&request, &test_account(dir.path()), &admin).unwrap();

        assert_eq!(
            admin.calls(),
            vec![AccountCall::Group(DEFAULT_GROUP.to_string(), 1234)]
        );
        assert_eq!(outcome.reowned, None);
    }

    #[test]
    fn absent_identity_changes_nothing() {
        let dir = tempdir().unwrap();
        let admin = MockAccountAdmin::default();
        let request = IdentityRequest {
            uid: None,
            gid: None,
        };
        let outcome = reconcile(&request, &test_account(dir.path()), &admin).unwrap();

        assert!(admin.calls().is_empty());
        assert_eq!(outcome.uid_set, None);
        assert_eq!(outcome.gid_set, None);
        assert_eq!(outcome.reowned, None);
    }

    #[cfg(unix)]
    #[test]
    fn empty_shared_dir_is_trivially_successful() {
        let dir = tempdir().unwrap();
        let admin = MockAccountAdmin::default();
        let request = IdentityRequest {
            uid: Some(current_id("-u")),
            gid: Some(current_id("-g")),
        };
        let outcome = reconcile(&request, &test_account(dir.path()), &admin).unwrap();

        assert_eq!(outcome.reowned, Some(0));
        assert!(outcome.warnings.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn missing_shared_dir_warns_without_failing() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("gone");
        let admin = MockAccountAdmin::default();
        let request = IdentityRequest {
            uid: Some(current_id("-u")),
            gid: Some(current_id("-g")),
        };
        let outcome = reconcile(&request, &test_account(&missing), &admin).unwrap();

        assert_eq!(outcome.reowned, Some(0));
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("cannot list"));
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_is_reowned_in_place() {
        let dir = tempdir().unwrap();
        std::os::unix::fs::symlink("nowhere", dir.path().join("broken")).unwrap();

        let (count, warnings) =
            reown_tree(dir.path(), current_id("-u"), current_id("-g"));
        assert_eq!(count, 1);
        assert!(warnings.is_empty());
    }

    #[test]
    fn failed_usermod_is_fatal_with_tool_stderr() {
        let dir = tempdir().unwrap();
        let admin = MockAccountAdmin {
            fail_user: true,
            ..MockAccountAdmin::default()
        };
        let request = IdentityRequest {
            uid: Some(1000),
            gid: Some(1000),
        };
        let err = reconcile(&request, &test_account(dir.path()), &admin).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("usermod"));
        assert!(message.contains("already exists"));
    }

    #[test]
    fn failed_groupmod_is_fatal() {
        let dir = tempdir().unwrap();
        let admin = MockAccountAdmin {
            fail_group: true,
            ..MockAccountAdmin::default()
        };
        let request = IdentityRequest {
            uid: Some(1000),
            gid: Some(1000),
        };
        let err = reconcile(&request, &test_account(dir.path()), &admin).unwrap_err();
        assert!(err.to_string().contains("groupmod"));
    }
}
