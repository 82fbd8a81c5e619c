use futures::future::BoxFuture;
use serde_json::Value;

use agentflow_core::error::Result;
use agentflow_core::traits::{AgentProvider, AgentRequest};
use agentflow_core::types::Outputs;
use tokio_util::sync::CancellationToken;

/// Collects upstream results into a single report.
///
/// Produces `results` (the inputs as an object) and `message`, a markdown
/// document with one `## <port>` section per input.
pub struct OutputCollector;

impl OutputCollector {
    pub fn render(inputs: &Outputs) -> String {
        let mut message = String::new();
        for (port, value) in inputs {
            if !message.is_empty() {
                message.push_str("\n\n");
            }
            message.push_str("## ");
            message.push_str(port);
            message.push_str("\n\n");
            message.push_str(&render_value(value));
        }
        message
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        // Agent results usually come wrapped as {"result": "..."}.
        Value::Object(map) if map.len() == 1 => match map.values().next() {
            Some(Value::String(s)) => s.clone(),
            _ => serde_json::to_string_pretty(value).unwrap_or_default(),
        },
        other => serde_json::to_string_pretty(other).unwrap_or_default(),
    }
}

impl AgentProvider for OutputCollector {
    fn name(&self) -> &str {
        "output"
    }

    fn capability(&self) -> &str {
        "output"
    }

    fn invoke(
        &self,
        request: AgentRequest,
        _cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Outputs>> {
        Box::pin(async move {
            let message = Self::render(&request.inputs);
            let mut outputs = Outputs::new();
            outputs.insert("results".into(), Value::Object(request.inputs));
            outputs.insert("message".into(), Value::String(message));
            Ok(outputs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::types::RunId;
    use agentflow_core::workflow::AgentRole;
    use serde_json::json;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_collects_and_renders() {
        let mut inputs = Outputs::new();
        inputs.insert("analyst".into(), json!({"result": "Markets are up."}));
        inputs.insert("writer".into(), json!("Final draft."));
        inputs.insert("scores".into(), json!([1, 2]));

        let request = AgentRequest {
            run_id: RunId::new(),
            node_id: "report".into(),
            role: AgentRole::Output,
            inputs: inputs.clone(),
            attempt: 1,
            deadline: Instant::now() + Duration::from_secs(5),
        };
        let outputs = OutputCollector
            .invoke(request, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outputs["results"], Value::Object(inputs));
        let message = outputs["message"].as_str().unwrap();
        assert!(message.contains("## analyst\n\nMarkets are up."));
        assert!(message.contains("## writer\n\nFinal draft."));
        assert!(message.contains("## scores"));
    }

    #[test]
    fn test_empty_inputs_render_empty_message() {
        assert_eq!(OutputCollector::render(&Outputs::new()), "");
    }
}
