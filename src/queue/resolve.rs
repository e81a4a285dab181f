#![forbid(unsafe_code)]

//! Turns a task into an executable command line.
//!
//! Built-in resolvers cover git and the AI coding assistants; TOML
//! manifests under `<repo>/plugins/` register additional tools and win
//! over built-ins for the same tool key.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::QworkerError;
use crate::queue::model::Task;

const AI_TOOLS: &[&str] = &["aider", "codex", "claude"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Declarative plugin: which executable to run for a tool key and how
/// to build its argv from the task.
///
/// Template elements `{args}`, `{flags}`, `{files}` splice the task
/// sequences; `{prompt_file}` splices the prompt path (dropped when the
/// task has no prompt); `{id}`, `{tool}`, `{repo}` and `{prompt_file}`
/// substitute inline inside other elements.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub tool: String,
    #[serde(default)]
    pub description: Option<String>,
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Resolvers {
    plugins: HashMap<String, PluginManifest>,
}

impl Resolvers {
    /// Scan `dir` for `*.toml` plugin manifests. Unknown or malformed
    /// files are skipped with a warning; they never abort startup.
    #[must_use]
    pub fn load_plugins(dir: &Path) -> Self {
        let mut plugins = HashMap::new();
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Self { plugins };
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("toml") {
                continue;
            }
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("skipping plugin {}: {e}", path.display());
                    continue;
                }
            };
            let manifest: PluginManifest = match toml::from_str(&raw) {
                Ok(m) => m,
                Err(e) => {
                    warn!("skipping plugin {}: {e}", path.display());
                    continue;
                }
            };
            let tool = manifest.tool.trim().to_lowercase();
            if tool.is_empty() || manifest.executable.trim().is_empty() {
                warn!(
                    "skipping plugin {}: tool and executable are required",
                    path.display()
                );
                continue;
            }
            if let Some(old) = plugins.insert(tool, manifest) {
                warn!("plugin '{}' shadowed by a later manifest", old.name);
            }
        }
        Self { plugins }
    }

    #[must_use]
    pub fn plugin_tools(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }

    pub fn resolve(
        &self,
        task: &Task,
        prompt_file: Option<&Path>,
    ) -> Result<ResolvedCommand, QworkerError> {
        if let Some(plugin) = self.plugins.get(&task.tool) {
            return Ok(ResolvedCommand {
                program: plugin.executable.clone(),
                args: expand_template(&plugin.args, task, prompt_file),
            });
        }

        if task.tool == "git" {
            guard_rollback_refs(&task.args)?;
            return Ok(ResolvedCommand {
                program: "git".to_owned(),
                args: task.args.clone(),
            });
        }

        let mut args = Vec::new();
        if let Some(p) = prompt_file {
            args.push("--message-file".to_owned());
            args.push(p.to_string_lossy().into_owned());
        }
        args.extend(task.flags.iter().cloned());
        if !AI_TOOLS.contains(&task.tool.as_str()) {
            args.extend(task.args.iter().cloned());
        }
        args.extend(task.files.iter().cloned());

        Ok(ResolvedCommand {
            program: task.tool.clone(),
            args,
        })
    }
}

fn expand_template(template: &[String], task: &Task, prompt_file: Option<&Path>) -> Vec<String> {
    let repo = task.repo.to_string_lossy().into_owned();
    let prompt = prompt_file.map(|p| p.to_string_lossy().into_owned());

    let mut out = Vec::new();
    for item in template {
        match item.as_str() {
            "{args}" => out.extend(task.args.iter().cloned()),
            "{flags}" => out.extend(task.flags.iter().cloned()),
            "{files}" => out.extend(task.files.iter().cloned()),
            "{prompt_file}" => {
                if let Some(p) = &prompt {
                    out.push(p.clone());
                }
            }
            _ => {
                let mut s = item.replace("{id}", &task.id);
                s = s.replace("{tool}", &task.tool);
                s = s.replace("{repo}", &repo);
                if let Some(p) = &prompt {
                    s = s.replace("{prompt_file}", p);
                }
                out.push(s);
            }
        }
    }
    out
}

/// Reject git invocations that create or push a ref whose leading path
/// component is `rollback`. Checking out an existing `rollback/*`
/// branch stays allowed.
pub fn guard_rollback_refs(args: &[String]) -> Result<(), QworkerError> {
    let Some(sub) = args.iter().position(|a| !a.starts_with('-')) else {
        return Ok(());
    };

    match args[sub].as_str() {
        "checkout" => {
            let rest = &args[sub + 1..];
            for (i, a) in rest.iter().enumerate() {
                if a == "-b" || a == "-B" {
                    if let Some(name) = rest.get(i + 1) {
                        if is_rollback_ref(name) {
                            return Err(security(name));
                        }
                    }
                }
            }
        }
        "branch" => {
            if let Some(name) = args.get(sub + 1) {
                if !name.starts_with('-') && is_rollback_ref(name) {
                    return Err(security(name));
                }
            }
        }
        "push" => {
            for a in &args[sub + 1..] {
                if a.starts_with('-') {
                    continue;
                }
                if refspec_touches_rollback(a) {
                    return Err(security(a));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn security(what: &str) -> QworkerError {
    QworkerError::Security(format!("refusing to create or push rollback ref '{what}'"))
}

fn is_rollback_ref(name: &str) -> bool {
    let name = name.trim();
    if name.starts_with("rollback/") {
        return true;
    }
    if let Some(rest) = name.strip_prefix("refs/heads/") {
        return rest.starts_with("rollback/");
    }
    if let Some(rest) = name.strip_prefix("refs/remotes/") {
        // Skip the remote component.
        return rest
            .split_once('/')
            .is_some_and(|(_, branch)| branch.starts_with("rollback/"));
    }
    false
}

fn refspec_touches_rollback(spec: &str) -> bool {
    spec.trim_start_matches('+')
        .split(':')
        .any(is_rollback_ref)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::RetryPolicy;
    use crate::queue::model::decode_line;

    fn task(json: &str) -> Task {
        decode_line(json, &RetryPolicy::default(), Path::new("/srv/repo")).unwrap()
    }

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn ai_tool_argv_is_prompt_flags_files() {
        let t = task(r#"{"tool":"claude","flags":["--yes"],"files":["a.rs","b.rs"],"args":["ignored"],"prompt":"fix it"}"#);
        let r = Resolvers::default();
        let cmd = r.resolve(&t, Some(Path::new("/tmp/p.txt"))).unwrap();
        assert_eq!(cmd.program, "claude");
        assert_eq!(
            cmd.args,
            args(&["--message-file", "/tmp/p.txt", "--yes", "a.rs", "b.rs"])
        );
    }

    #[test]
    fn git_passes_args_through_verbatim() {
        let t = task(r#"{"tool":"git","args":["fetch","--all","--prune"],"flags":["-x"],"files":["f"]}"#);
        let cmd = Resolvers::default().resolve(&t, None).unwrap();
        assert_eq!(cmd.program, "git");
        assert_eq!(cmd.args, args(&["fetch", "--all", "--prune"]));
    }

    #[test]
    fn fallback_argv_is_prompt_flags_args_files() {
        let t = task(r#"{"tool":"mytool","flags":["-v"],"args":["run"],"files":["x"]}"#);
        let cmd = Resolvers::default().resolve(&t, None).unwrap();
        assert_eq!(cmd.program, "mytool");
        assert_eq!(cmd.args, args(&["-v", "run", "x"]));
    }

    #[test]
    fn plugin_wins_over_builtin_and_expands_template() {
        let td = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            td.path().join("echo.toml"),
            r#"
name = "Echo"
tool = "ECHO"
description = "prints its args"
executable = "/bin/echo"
args = ["task={id}", "{args}", "{prompt_file}"]
"#,
        )
        .unwrap();
        std::fs::write(td.path().join("broken.toml"), "tool = [not toml").unwrap();

        let resolvers = Resolvers::load_plugins(td.path());
        assert_eq!(resolvers.plugin_tools(), vec!["echo"]);

        let t = task(r#"{"id":"abc","tool":"echo","args":["hello","world"]}"#);
        let cmd = resolvers.resolve(&t, None).unwrap();
        assert_eq!(cmd.program, "/bin/echo");
        assert_eq!(cmd.args, args(&["task=abc", "hello", "world"]));

        let cmd = resolvers
            .resolve(&t, Some(Path::new("/tmp/prompt.txt")))
            .unwrap();
        assert_eq!(
            cmd.args,
            args(&["task=abc", "hello", "world", "/tmp/prompt.txt"])
        );
    }

    #[test]
    fn load_plugins_tolerates_missing_dir() {
        let resolvers = Resolvers::load_plugins(&PathBuf::from("/nonexistent/plugins"));
        assert!(resolvers.plugin_tools().is_empty());
    }

    #[test]
    fn rollback_branch_creation_is_rejected() {
        for bad in [
            &["checkout", "-b", "rollback/main/20250130"][..],
            &["checkout", "-B", "rollback/x"],
            &["branch", "rollback/x"],
            &["push", "origin", "rollback/x"],
            &["push", "origin", "main:rollback/x"],
            &["push", "origin", "rollback/x:main"],
            &["push", "origin", "+rollback/x:main"],
            &["push", "origin", "refs/heads/rollback/x"],
            &["push", "origin", "refs/remotes/origin/rollback/x"],
        ] {
            let err = guard_rollback_refs(&args(bad)).unwrap_err();
            assert!(err.to_string().starts_with("SECURITY"), "{bad:?}: {err}");
        }
    }

    #[test]
    fn benign_rollback_mentions_are_allowed() {
        for ok in [
            &["checkout", "rollback/x"][..],
            &["branch", "-d", "rollback/x"],
            &["branch", "feature/rollback-support"],
            &["push", "origin", "feature/rollback-support"],
            &["push", "origin", "main"],
            &["fetch", "--all"],
            &["log", "--oneline"],
        ] {
            assert!(guard_rollback_refs(&args(ok)).is_ok(), "{ok:?}");
        }
    }
}
