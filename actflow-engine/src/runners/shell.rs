// Shell Runner
// Executes `run:` steps and handles the step command protocol

use crate::error::StepError;
use crate::runners::{CommandRunner, ScriptCall, StepIo};

use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Shell types supported by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// Bash with `-e -o pipefail`
    Bash,
    /// POSIX sh with `-e`
    Sh,
    /// PowerShell Core (cross-platform)
    Pwsh,
    /// Windows PowerShell (falls back to pwsh elsewhere)
    PowerShell,
    /// Python 3, script passed with `-c`
    Python,
    /// cmd.exe
    Cmd,
}

impl Shell {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "bash" => Some(Shell::Bash),
            "sh" => Some(Shell::Sh),
            "pwsh" => Some(Shell::Pwsh),
            "powershell" => Some(Shell::PowerShell),
            "python" => Some(Shell::Python),
            "cmd" => Some(Shell::Cmd),
            _ => None,
        }
    }

    /// Get the shell executable and arguments
    fn get_command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Shell::Bash => ("bash", &["--noprofile", "--norc", "-eo", "pipefail", "-c"]),
            Shell::Sh => ("sh", &["-e", "-c"]),
            Shell::Pwsh => ("pwsh", &["-NoLogo", "-NoProfile", "-Command"]),
            Shell::PowerShell => {
                if cfg!(target_os = "windows") {
                    ("powershell.exe", &["-NoLogo", "-NoProfile", "-Command"])
                } else {
                    ("pwsh", &["-NoLogo", "-NoProfile", "-Command"])
                }
            }
            Shell::Python => ("python3", &["-c"]),
            Shell::Cmd => ("cmd", &["/D", "/E:ON", "/V:OFF", "/S", "/C"]),
        }
    }
}

/// Shell runner for executing scripts
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, call: &ScriptCall<'_>, io: &mut StepIo) -> Result<(), StepError> {
        let shell = Shell::from_name(call.shell).ok_or_else(|| {
            StepError::action("run", format!("unsupported shell '{}'", call.shell))
        })?;
        let (shell_cmd, shell_args) = shell.get_command();

        // Steps append `name=value` lines to this file
        let output_file = tempfile::NamedTempFile::new()?;

        let mut cmd = Command::new(shell_cmd);
        cmd.args(shell_args);
        cmd.arg(call.script);
        cmd.current_dir(call.working_dir);
        cmd.envs(call.env);
        cmd.env("GITHUB_OUTPUT", output_file.path());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        debug!(shell = shell_cmd, dir = %call.working_dir.display(), "spawning step process");
        let mut child = cmd.spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StepError::action("run", "stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| StepError::action("run", "stderr was not captured"))?;

        // Raw byte lines: output that is not valid UTF-8 is decoded lossily
        let mut stdout = BufReader::new(stdout);
        let mut stderr = BufReader::new(stderr);
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                read = stdout.read_until(b'\n', &mut stdout_buf), if stdout_open => match read? {
                    0 => stdout_open = false,
                    _ => handle_stdout_line(&take_line(&mut stdout_buf), io),
                },
                read = stderr.read_until(b'\n', &mut stderr_buf), if stderr_open => match read? {
                    0 => stderr_open = false,
                    _ => io.error(take_line(&mut stderr_buf)),
                },
            }
        }

        let status = child.wait().await?;

        let content = tokio::fs::read(output_file.path()).await?;
        let content = String::from_utf8_lossy(&content);
        let outputs = parse_output_file(&content).map_err(|e| StepError::action("run", e))?;
        for (name, value) in outputs {
            io.set_output(name, value);
        }

        if status.success() {
            Ok(())
        } else {
            let message = match status.code() {
                Some(code) => format!("process exited with code {}", code),
                None => "process terminated by signal".to_string(),
            };
            Err(StepError::action("run", message))
        }
    }
}

/// A `::command params::message` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowCommand<'a> {
    SetOutput { name: &'a str, value: &'a str },
    AddMask(&'a str),
    Debug(&'a str),
    Notice(&'a str),
    Warning(&'a str),
    Error(&'a str),
    Group(&'a str),
    EndGroup,
}

impl<'a> WorkflowCommand<'a> {
    pub fn parse(line: &'a str) -> Option<Self> {
        let rest = line.trim_end_matches('\r').strip_prefix("::")?;
        let (head, message) = rest.split_once("::")?;
        let (command, params) = match head.split_once(' ') {
            Some((command, params)) => (command, params),
            None => (head, ""),
        };

        match command {
            "set-output" => {
                let name = params
                    .split(',')
                    .find_map(|p| p.trim().strip_prefix("name="))?;
                Some(WorkflowCommand::SetOutput {
                    name,
                    value: message,
                })
            }
            "add-mask" => Some(WorkflowCommand::AddMask(message)),
            "debug" => Some(WorkflowCommand::Debug(message)),
            "notice" => Some(WorkflowCommand::Notice(message)),
            "warning" => Some(WorkflowCommand::Warning(message)),
            "error" => Some(WorkflowCommand::Error(message)),
            "group" => Some(WorkflowCommand::Group(message)),
            "endgroup" => Some(WorkflowCommand::EndGroup),
            _ => None,
        }
    }
}

fn take_line(buf: &mut Vec<u8>) -> String {
    let line = String::from_utf8_lossy(buf)
        .trim_end_matches(['\n', '\r'])
        .to_string();
    buf.clear();
    line
}

fn handle_stdout_line(line: &str, io: &mut StepIo) {
    match WorkflowCommand::parse(line) {
        Some(WorkflowCommand::SetOutput { name, value }) => io.set_output(name, value),
        // The value itself is never echoed
        Some(WorkflowCommand::AddMask(value)) => io.add_mask(value),
        Some(WorkflowCommand::Debug(message)) => io.debug(message),
        Some(WorkflowCommand::Warning(message)) => io.log(format!("warning: {}", message)),
        Some(WorkflowCommand::Error(message)) => io.error(message),
        Some(WorkflowCommand::Notice(message)) | Some(WorkflowCommand::Group(message)) => {
            io.log(message)
        }
        Some(WorkflowCommand::EndGroup) => {}
        None => io.log(line),
    }
}

/// Parse an output file: `name=value` lines and `name<<DELIM` heredocs
pub fn parse_output_file(content: &str) -> Result<Vec<(String, String)>, String> {
    let mut outputs = Vec::new();
    let mut lines = content.lines().map(|l| l.trim_end_matches('\r'));

    while let Some(line) = lines.next() {
        if line.is_empty() {
            continue;
        }

        let heredoc = match (line.find("<<"), line.find('=')) {
            (Some(h), Some(e)) => h < e,
            (Some(_), None) => true,
            _ => false,
        };

        if heredoc {
            let (name, delimiter) = line.split_once("<<").unwrap_or((line, ""));
            if name.is_empty() || delimiter.is_empty() {
                return Err(format!("invalid output line '{}'", line));
            }

            let mut value: Vec<&str> = Vec::new();
            loop {
                match lines.next() {
                    Some(l) if l == delimiter => break,
                    Some(l) => value.push(l),
                    None => {
                        return Err(format!(
                            "output '{}' is missing its closing delimiter '{}'",
                            name, delimiter
                        ))
                    }
                }
            }
            outputs.push((name.to_string(), value.join("\n")));
        } else {
            match line.split_once('=') {
                Some((name, value)) if !name.is_empty() => {
                    outputs.push((name.to_string(), value.to_string()))
                }
                _ => return Err(format!("invalid output line '{}'", line)),
            }
        }
    }

    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::events::{progress_channel, EventSink, ExecutionEvent};
    use crate::execution::secrets::SecretMasker;

    use indexmap::IndexMap;
    use std::sync::Arc;

    async fn run_sh(
        script: &str,
        env: &IndexMap<String, String>,
    ) -> (Result<(), StepError>, StepIo, Vec<ExecutionEvent>) {
        let (tx, mut rx) = progress_channel();
        let mut io = StepIo::new(
            "job",
            0,
            EventSink::new(Some(tx), Arc::new(SecretMasker::default())),
        );
        let dir = std::env::current_dir().unwrap();
        let call = ScriptCall {
            script,
            shell: "sh",
            env,
            working_dir: &dir,
        };
        let result = ShellRunner::new().run(&call, &mut io).await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (result, io, events)
    }

    fn output_lines(events: &[ExecutionEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::StepOutput { output, .. } => Some(output.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_shell_runner_echo() {
        let (result, _, events) = run_sh("echo hello", &IndexMap::new()).await;
        assert!(result.is_ok());
        assert_eq!(output_lines(&events), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_shell_runner_with_env() {
        let mut env = IndexMap::new();
        env.insert("MY_VAR".to_string(), "test_value".to_string());

        let (result, _, events) = run_sh("echo $MY_VAR", &env).await;
        assert!(result.is_ok());
        assert_eq!(output_lines(&events), vec!["test_value"]);
    }

    #[tokio::test]
    async fn test_shell_runner_exit_code() {
        let (result, _, _) = run_sh("exit 42", &IndexMap::new()).await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("exited with code 42"));
    }

    #[tokio::test]
    async fn test_shell_runner_output_file() {
        let script = r#"
echo "x=5" >> "$GITHUB_OUTPUT"
printf 'notes<<EOF\nline one\nline two\nEOF\n' >> "$GITHUB_OUTPUT"
echo "::set-output name=legacy::yes"
"#;
        let (result, io, _) = run_sh(script, &IndexMap::new()).await;
        assert!(result.is_ok());
        let outputs = io.into_outputs();
        assert_eq!(outputs["x"], "5");
        assert_eq!(outputs["notes"], "line one\nline two");
        assert_eq!(outputs["legacy"], "yes");
    }

    #[tokio::test]
    async fn test_shell_runner_add_mask() {
        let script = "echo '::add-mask::pa55'\necho 'the value is pa55'";
        let (result, _, events) = run_sh(script, &IndexMap::new()).await;
        assert!(result.is_ok());
        assert_eq!(output_lines(&events), vec!["the value is ***"]);
    }

    #[tokio::test]
    async fn test_shell_runner_invalid_utf8_output() {
        let script = "printf 'bin\\377\\n'; printf 'raw\\376' >&2; echo done";
        let (result, _, events) = run_sh(script, &IndexMap::new()).await;
        assert!(result.is_ok());
        let stdout: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::StepOutput {
                    output,
                    is_error: false,
                    ..
                } => Some(output.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stdout, vec!["bin\u{FFFD}", "done"]);
        assert!(events.iter().any(|e| matches!(
            e,
            ExecutionEvent::StepOutput { is_error: true, output, .. } if output == "raw\u{FFFD}"
        )));
    }

    #[tokio::test]
    async fn test_shell_runner_stderr() {
        let (result, _, events) = run_sh("echo error >&2", &IndexMap::new()).await;
        assert!(result.is_ok());
        assert!(events.iter().any(|e| matches!(
            e,
            ExecutionEvent::StepOutput { is_error: true, output, .. } if output == "error"
        )));
    }

    #[tokio::test]
    async fn test_unsupported_shell() {
        let (tx, _rx) = progress_channel();
        let mut io = StepIo::new("job", 0, EventSink::new(Some(tx), Arc::default()));
        let env = IndexMap::new();
        let dir = std::env::current_dir().unwrap();
        let call = ScriptCall {
            script: "echo",
            shell: "fish",
            env: &env,
            working_dir: &dir,
        };
        let err = ShellRunner::new().run(&call, &mut io).await.unwrap_err();
        assert!(err.to_string().contains("unsupported shell 'fish'"));
    }

    #[test]
    fn test_parse_workflow_commands() {
        assert_eq!(
            WorkflowCommand::parse("::set-output name=version::1.2.3"),
            Some(WorkflowCommand::SetOutput {
                name: "version",
                value: "1.2.3"
            })
        );
        assert_eq!(
            WorkflowCommand::parse("::add-mask::hunter2"),
            Some(WorkflowCommand::AddMask("hunter2"))
        );
        assert_eq!(
            WorkflowCommand::parse("::warning file=a.rs,line=1::careful"),
            Some(WorkflowCommand::Warning("careful"))
        );
        assert_eq!(WorkflowCommand::parse("plain output"), None);
        assert_eq!(WorkflowCommand::parse("::unknown::x"), None);
    }

    #[test]
    fn test_parse_output_file() {
        let content = "a=1\nb=x=y\n\ntext<<END\nfirst\n\nlast\nEND\n";
        let outputs = parse_output_file(content).unwrap();
        assert_eq!(
            outputs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "x=y".to_string()),
                ("text".to_string(), "first\n\nlast".to_string()),
            ]
        );

        assert!(parse_output_file("novalue\n").is_err());
        assert!(parse_output_file("text<<END\nunterminated\n").is_err());
    }

    #[test]
    fn test_shell_names() {
        assert_eq!(Shell::from_name("Bash"), Some(Shell::Bash));
        assert_eq!(Shell::from_name("python"), Some(Shell::Python));
        assert_eq!(Shell::from_name("zsh"), None);
    }
}
