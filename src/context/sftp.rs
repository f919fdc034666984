//! SFTP command synthesis
//!
//! In SFTP context a typed command may be rewritten before it is sent:
//! local paths are translated, and directory-changing or listing
//! commands are paired with a silent `pwd` probe so the remote working
//! directory stays known.

use std::path::{Path, PathBuf};

use log::debug;

use super::ContextError;
use crate::command::prompt::PromptRules;
use crate::command::{create_command_from_text, Command, FinishAction, Scope, Verb};

/// Translate a Windows drive path to its WSL mount (`C:\x` -> `/mnt/c/x`).
/// Anything else is returned unchanged.
pub fn normalize_local_path(path: &str) -> String {
    let mut chars = path.chars();
    let (Some(drive), Some(':')) = (chars.next(), chars.next()) else {
        return path.to_string();
    };
    if !drive.is_ascii_alphabetic() {
        return path.to_string();
    }

    let mut normalized = format!("/mnt/{}", drive.to_ascii_lowercase());
    for segment in chars.as_str().split(['\\', '/']).filter(|s| !s.is_empty()) {
        normalized.push('/');
        normalized.push_str(segment);
    }
    normalized
}

/// Quote a word for the SFTP command line when needed
fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

/// Non-loggable `pwd` whose reply updates the remote working directory
pub fn pwd_probe(scope: Scope, rules: &PromptRules, eol: &str) -> Result<Command, ContextError> {
    Ok(create_command_from_text(&format!("pwd{}", eol), scope, rules)?
        .non_loggable()
        .with_finish_action(FinishAction::ParsePwd))
}

/// Fresh local directory for a downloaded file
fn download_dir(temp_root: Option<&Path>) -> Result<PathBuf, ContextError> {
    let builder = {
        let mut builder = tempfile::Builder::new();
        builder.prefix("corterm-open-");
        builder
    };
    let dir = match temp_root {
        Some(root) => builder.tempdir_in(root)?,
        None => builder.tempdir()?,
    };
    Ok(dir.keep())
}

/// Expand a command typed in SFTP context into the commands actually sent
pub fn expand(
    base: Command,
    scope: Scope,
    rules: &PromptRules,
    temp_root: Option<&Path>,
) -> Result<Vec<Command>, ContextError> {
    let eol = base.eol().to_string();
    let args = base.args().to_vec();

    let commands = match base.verb() {
        Verb::Cd => vec![base, pwd_probe(scope, rules, &eol)?],
        Verb::Ls => vec![pwd_probe(scope, rules, &eol)?, base],
        Verb::Pwd => vec![base.with_finish_action(FinishAction::ParsePwd)],
        Verb::Get if args.len() >= 2 => {
            let text = format!(
                "get {} {}{}",
                quote_arg(&args[0]),
                quote_arg(&normalize_local_path(&args[1])),
                eol
            );
            vec![base.with_text(&text)?, pwd_probe(scope, rules, &eol)?]
        }
        Verb::Put if args.len() >= 2 => {
            let text = format!(
                "put {} {}{}",
                quote_arg(&normalize_local_path(&args[0])),
                quote_arg(&args[1]),
                eol
            );
            vec![base.with_text(&text)?, pwd_probe(scope, rules, &eol)?]
        }
        Verb::Get | Verb::Put => vec![base, pwd_probe(scope, rules, &eol)?],
        Verb::Open if !args.is_empty() => {
            let remote = &args[0];
            let file_name = Path::new(remote)
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "download".into());
            let local = download_dir(temp_root)?.join(file_name);
            debug!("Opening {} via {}", remote, local.display());
            let text = format!(
                "get {} {}{}",
                quote_arg(remote),
                quote_arg(&local.to_string_lossy()),
                eol
            );
            vec![
                base.with_text(&text)?
                    .with_finish_action(FinishAction::OpenFile(local)),
                pwd_probe(scope, rules, &eol)?,
            ]
        }
        _ => vec![base],
    };
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SFTP: Scope = Scope {
        in_sftp: true,
        parent_in_sftp: false,
    };

    fn expand_text(text: &str) -> Vec<Command> {
        let rules = PromptRules::default();
        let base = create_command_from_text(text, SFTP, &rules).unwrap();
        expand(base, SFTP, &rules, None).unwrap()
    }

    fn texts(commands: &[Command]) -> Vec<&str> {
        commands.iter().map(Command::text).collect()
    }

    #[test]
    fn test_normalize_local_path() {
        assert_eq!(normalize_local_path(r"C:\Users\me\a.txt"), "/mnt/c/Users/me/a.txt");
        assert_eq!(normalize_local_path("d:/data//x"), "/mnt/d/data/x");
        assert_eq!(normalize_local_path("/tmp/a"), "/tmp/a");
        assert_eq!(normalize_local_path("b"), "b");
        assert_eq!(normalize_local_path("1:x"), "1:x");
    }

    #[test]
    fn test_cd_and_ls_get_probes() {
        let commands = expand_text("cd docs\r");
        assert_eq!(texts(&commands), vec!["cd docs\r", "pwd\r"]);
        assert!(commands[0].is_loggable());
        assert!(!commands[1].is_loggable());
        assert_eq!(commands[1].finish_action(), Some(&FinishAction::ParsePwd));

        let commands = expand_text("ls\r");
        assert_eq!(texts(&commands), vec!["pwd\r", "ls\r"]);
    }

    #[test]
    fn test_get_and_put_rewrite_local_path() {
        let commands = expand_text("get a C:\\tmp\\b\r");
        assert_eq!(texts(&commands), vec!["get a /mnt/c/tmp/b\r", "pwd\r"]);

        let commands = expand_text("put \"my file\" remote\r");
        assert_eq!(texts(&commands), vec!["put \"my file\" remote\r", "pwd\r"]);
    }

    #[test]
    fn test_pwd_is_loggable_and_parsed() {
        let commands = expand_text("pwd\r");
        assert_eq!(commands.len(), 1);
        assert!(commands[0].is_loggable());
        assert_eq!(commands[0].finish_action(), Some(&FinishAction::ParsePwd));
    }

    #[test]
    fn test_open_downloads_to_temp_dir() {
        let root = tempfile::tempdir().unwrap();
        let rules = PromptRules::default();
        let base = create_command_from_text("!open dir/notes.txt\r", SFTP, &rules).unwrap();
        let commands = expand(base, SFTP, &rules, Some(root.path())).unwrap();
        assert_eq!(commands.len(), 2);
        let Some(FinishAction::OpenFile(local)) = commands[0].finish_action() else {
            panic!("expected an open action");
        };
        assert!(local.starts_with(root.path()));
        assert!(local.ends_with("notes.txt"));
        assert!(local.parent().unwrap().is_dir());
        assert!(commands[0].text().starts_with("get dir/notes.txt "));
    }

    #[test]
    fn test_other_commands_pass_through() {
        let commands = expand_text("mkdir new\r");
        assert_eq!(texts(&commands), vec!["mkdir new\r"]);
    }
}
