use std::process::Stdio;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use agentflow_core::config::CommandProviderConfig;
use agentflow_core::error::{FlowError, Result};
use agentflow_core::traits::{AgentProvider, AgentRequest};
use agentflow_core::types::Outputs;
use agentflow_core::workflow::AgentRole;

/// sysexits.h EX_TEMPFAIL: the program asks to be retried.
const EXIT_TEMPFAIL: i32 = 75;

/// Runs an external program for a capability call.
///
/// The request is written to stdin as JSON. Stdout is parsed as a JSON object
/// of outputs; anything else becomes `{"result": <stdout>}`. Exit code 75
/// reports a transient failure, any other non-zero code a permanent one.
pub struct CommandProvider {
    name: String,
    capability: String,
    /// Fixed program. When absent the node's `command` role supplies it.
    program: Option<(String, Vec<String>)>,
    priority: u32,
}

impl CommandProvider {
    /// Serves `command` nodes using the program named in each node.
    pub fn for_command_nodes() -> Self {
        Self {
            name: "command".to_string(),
            capability: "command".to_string(),
            program: None,
            priority: 100,
        }
    }

    /// Serves an arbitrary capability with a configured program.
    pub fn from_config(config: &CommandProviderConfig) -> Self {
        Self {
            name: config.name.clone(),
            capability: config.capability.clone(),
            program: Some((config.program.clone(), config.args.clone())),
            priority: config.priority,
        }
    }

    fn program_for(&self, role: &AgentRole) -> Result<(String, Vec<String>)> {
        if let Some(fixed) = &self.program {
            return Ok(fixed.clone());
        }
        match role {
            AgentRole::Command { program, args } => Ok((program.clone(), args.clone())),
            other => Err(FlowError::AgentInvocation {
                capability: self.capability.clone(),
                message: format!("no program configured for '{}' nodes", other.capability()),
                retryable: false,
            }),
        }
    }

    fn failure(&self, message: String, retryable: bool) -> FlowError {
        FlowError::AgentInvocation {
            capability: self.capability.clone(),
            message,
            retryable,
        }
    }
}

/// Interpret program stdout as node outputs.
fn parse_outputs(stdout: &str) -> Outputs {
    let trimmed = stdout.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        return map;
    }
    let mut outputs = Outputs::new();
    outputs.insert("result".into(), Value::String(trimmed.to_string()));
    outputs
}

impl AgentProvider for CommandProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> &str {
        &self.capability
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn invoke(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Outputs>> {
        Box::pin(async move {
            let (program, args) = self.program_for(&request.role)?;
            let payload = serde_json::to_vec(&serde_json::json!({
                "run_id": request.run_id,
                "node_id": request.node_id,
                "attempt": request.attempt,
                "role": request.role,
                "inputs": request.inputs,
            }))?;

            debug!(program = %program, node_id = %request.node_id, "Spawning command provider");

            let mut child = tokio::process::Command::new(&program)
                .args(&args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| self.failure(format!("failed to spawn {}: {}", program, e), false))?;

            if let Some(mut stdin) = child.stdin.take() {
                // A program that ignores stdin may close it early.
                let _ = stdin.write_all(&payload).await;
            }

            let output = tokio::select! {
                _ = cancel.cancelled() => {
                    // Dropping the wait future kills the child.
                    return Err(FlowError::Cancelled);
                }
                result = child.wait_with_output() => result?,
            };

            let stdout = String::from_utf8_lossy(&output.stdout);
            if output.status.success() {
                return Ok(parse_outputs(&stdout));
            }

            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output.status.code();
            let mut message = format!("{} exited with {:?}", program, code);
            if !stderr.trim().is_empty() {
                message.push_str(": ");
                message.push_str(stderr.trim());
            }
            Err(self.failure(message, code == Some(EXIT_TEMPFAIL)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::types::RunId;
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn request(program: &str, args: &[&str]) -> AgentRequest {
        let mut inputs = Outputs::new();
        inputs.insert("topic".into(), json!("rust"));
        AgentRequest {
            run_id: RunId::new(),
            node_id: "cmd".into(),
            role: AgentRole::Command {
                program: program.into(),
                args: args.iter().map(|s| s.to_string()).collect(),
            },
            inputs,
            attempt: 1,
            deadline: Instant::now() + Duration::from_secs(10),
        }
    }

    #[test]
    fn test_parse_outputs() {
        assert_eq!(parse_outputs(r#" {"a": 1} "#)["a"], json!(1));
        assert_eq!(parse_outputs("plain text\n")["result"], json!("plain text"));
        assert_eq!(parse_outputs("[1, 2]")["result"], json!("[1, 2]"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_json_stdout_becomes_outputs() {
        let provider = CommandProvider::for_command_nodes();
        let outputs = provider
            .invoke(
                request("sh", &["-c", r#"cat > /dev/null; echo '{"summary": "ok"}'"#]),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outputs["summary"], json!("ok"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_receives_inputs() {
        let provider = CommandProvider::for_command_nodes();
        let outputs = provider
            .invoke(request("cat", &[]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outputs["inputs"]["topic"], json!("rust"));
        assert_eq!(outputs["node_id"], json!("cmd"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_codes_map_to_retryability() {
        let provider = CommandProvider::for_command_nodes();
        let err = provider
            .invoke(request("sh", &["-c", "exit 75"]), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let err = provider
            .invoke(request("sh", &["-c", "echo boom >&2; exit 1"]), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("boom"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_stops_child() {
        let provider = CommandProvider::for_command_nodes();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let err = provider
            .invoke(request("sleep", &["10"]), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_configured_program_serves_other_capabilities() {
        let provider = CommandProvider::from_config(&CommandProviderConfig {
            name: "local".into(),
            capability: "agent".into(),
            program: "python3".into(),
            args: vec!["agent.py".into()],
            priority: 10,
        });
        assert_eq!(provider.capability(), "agent");
        assert_eq!(provider.priority(), 10);
        let (program, args) = provider.program_for(&AgentRole::Output).unwrap();
        assert_eq!(program, "python3");
        assert_eq!(args, vec!["agent.py".to_string()]);
    }
}
